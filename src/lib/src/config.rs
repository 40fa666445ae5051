//! Runtime configuration
//!
//! Configuration is resolved once at startup from three layers, later layers
//! overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. a TOML file (`/etc/secure-boot/config.toml`, or the path given with `--config`)
//! 3. `SECURE_BOOT_*` environment variables
//!
//! The result is an immutable [`BootConfiguration`] that every component
//! receives by reference.
//!
//! # File format
//!
//! ```toml
//! esp = "/efi"
//! efi_dir = "/EFI/arch"
//! kernel = "linux"
//! name = "secure-boot-linux"
//! cmdline = "/etc/kernel/cmdline"
//! microcode = "intel"            # any | * | intel | amd
//! root_subvolume = "@"
//! snapshot_subvolume = "@snapshots/%1/snapshot"
//! key_dir = "/etc/secure-boot"
//! state_file = "/var/lib/secure-boot/state.json"
//! recovery_flavors = ["linux", "linux-lts"]
//!
//! [paths]
//! boot = "/boot"
//! stub = "/usr/lib/systemd/boot/efi/linuxx64.efi.stub"
//! ```

use crate::error::SbError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Configuration file read when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/secure-boot/config.toml";

/// EFI subdirectory required by a systemd-boot class boot manager.
pub const BOOT_MANAGER_EFI_DIR: &str = "/EFI/Linux";

/// Placeholder replaced by the snapshot number when the rescue script runs.
pub const SNAPSHOT_ID_PLACEHOLDER: &str = "%1";

const ENV_PREFIX: &str = "SECURE_BOOT_";

// ============================================================================
// Microcode selection
// ============================================================================

/// Which CPU microcode images are prepended to the initramfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MicrocodeSelector {
    /// Every vendor image found in the boot directory (at least one)
    #[default]
    Any,
    Intel,
    Amd,
}

impl MicrocodeSelector {
    /// Vendors whose images are considered, in concatenation order.
    pub fn vendors(&self) -> &'static [&'static str] {
        match self {
            MicrocodeSelector::Any => &["intel", "amd"],
            MicrocodeSelector::Intel => &["intel"],
            MicrocodeSelector::Amd => &["amd"],
        }
    }
}

impl FromStr for MicrocodeSelector {
    type Err = SbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" | "*" => Ok(MicrocodeSelector::Any),
            "intel" => Ok(MicrocodeSelector::Intel),
            "amd" => Ok(MicrocodeSelector::Amd),
            other => Err(SbError::ConfigurationError(format!(
                "invalid microcode selector '{}' (expected any, *, intel or amd)",
                other
            ))),
        }
    }
}

impl TryFrom<String> for MicrocodeSelector {
    type Error = SbError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MicrocodeSelector> for String {
    fn from(value: MicrocodeSelector) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MicrocodeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MicrocodeSelector::Any => write!(f, "any"),
            MicrocodeSelector::Intel => write!(f, "intel"),
            MicrocodeSelector::Amd => write!(f, "amd"),
        }
    }
}

// ============================================================================
// Well-known system paths
// ============================================================================

/// Locations of system files the tool reads or writes outside the ESP and
/// the key directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemPaths {
    /// Kernel images, initramfs images and microcode
    pub boot: PathBuf,
    pub os_release: PathBuf,
    /// Fallback kernel command line when the configured source is absent
    pub proc_cmdline: PathBuf,
    /// Linux EFI stub the unified images are built from
    pub stub: PathBuf,
    /// Full EFI shell shipped as the rescue shell
    pub efi_shell: PathBuf,
    /// Firmware update driver, signed in place
    pub fwupd_driver: PathBuf,
    /// Unsigned boot manager binary, signed in place when present
    pub boot_manager: PathBuf,
    /// Where the boot manager lives on the ESP, relative to the ESP root
    pub boot_manager_esp: PathBuf,
    pub efivarfs: PathBuf,
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            boot: PathBuf::from("/boot"),
            os_release: PathBuf::from("/etc/os-release"),
            proc_cmdline: PathBuf::from("/proc/cmdline"),
            stub: PathBuf::from("/usr/lib/systemd/boot/efi/linuxx64.efi.stub"),
            efi_shell: PathBuf::from("/usr/share/edk2-shell/x64/Shell_Full.efi"),
            fwupd_driver: PathBuf::from("/usr/lib/fwupd/efi/fwupdx64.efi"),
            boot_manager: PathBuf::from("/usr/lib/systemd/boot/efi/systemd-bootx64.efi"),
            boot_manager_esp: PathBuf::from("/EFI/systemd/systemd-bootx64.efi"),
            efivarfs: PathBuf::from("/sys/firmware/efi/efivars"),
        }
    }
}

impl SystemPaths {
    /// Relocate every path under `root`; used to run against a fake system.
    pub fn rooted_at(root: &Path) -> Self {
        let defaults = Self::default();
        let reroot = |p: &Path| root.join(p.strip_prefix("/").unwrap_or(p));
        Self {
            boot: reroot(&defaults.boot),
            os_release: reroot(&defaults.os_release),
            proc_cmdline: reroot(&defaults.proc_cmdline),
            stub: reroot(&defaults.stub),
            efi_shell: reroot(&defaults.efi_shell),
            fwupd_driver: reroot(&defaults.fwupd_driver),
            boot_manager: reroot(&defaults.boot_manager),
            boot_manager_esp: defaults.boot_manager_esp,
            efivarfs: reroot(&defaults.efivarfs),
        }
    }

    pub fn kernel_image(&self, flavor: &str) -> PathBuf {
        self.boot.join(format!("vmlinuz-{}", flavor))
    }

    pub fn initramfs(&self, flavor: &str) -> PathBuf {
        self.boot.join(format!("initramfs-{}.img", flavor))
    }

    pub fn fallback_initramfs(&self, flavor: &str) -> PathBuf {
        self.boot.join(format!("initramfs-{}-fallback.img", flavor))
    }

    pub fn microcode(&self, vendor: &str) -> PathBuf {
        self.boot.join(format!("{}-ucode.img", vendor))
    }
}

// ============================================================================
// File layer
// ============================================================================

/// Contents of the TOML configuration file. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub esp: Option<PathBuf>,
    pub efi_dir: Option<String>,
    pub kernel: Option<String>,
    pub name: Option<String>,
    pub cmdline: Option<PathBuf>,
    pub microcode: Option<MicrocodeSelector>,
    pub root_subvolume: Option<String>,
    pub snapshot_subvolume: Option<String>,
    pub key_dir: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub recovery_flavors: Option<Vec<String>>,
    pub paths: Option<SystemPaths>,
}

impl ConfigFile {
    pub fn from_toml(content: &str) -> Result<Self, SbError> {
        toml::from_str(content)
            .map_err(|e| SbError::ConfigurationError(format!("invalid configuration file: {}", e)))
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, SbError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            SbError::ConfigurationError(format!("cannot read '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Apply `SECURE_BOOT_*` variables on top of the file values.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<(), SbError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let Some(key) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value: String = value.into();
            match key {
                "ESP" => self.esp = Some(PathBuf::from(value)),
                "EFI" => self.efi_dir = Some(value),
                "KERNEL" => self.kernel = Some(value),
                "NAME" => self.name = Some(value),
                "CMDLINE" => self.cmdline = Some(PathBuf::from(value)),
                "UCODE" => self.microcode = Some(value.parse()?),
                "ROOT_SUBVOLUME" => self.root_subvolume = Some(value),
                "SNAPSHOT_SUBVOLUME" => self.snapshot_subvolume = Some(value),
                "KEY_DIR" => self.key_dir = Some(PathBuf::from(value)),
                _ => log::debug!("Ignoring unknown variable {}{}", ENV_PREFIX, key),
            }
        }
        Ok(())
    }
}

// ============================================================================
// Resolved configuration
// ============================================================================

/// Resolved runtime parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootConfiguration {
    /// ESP mount point
    pub esp: PathBuf,
    /// EFI image subdirectory on the ESP, always starting with `/`
    pub efi_dir: String,
    /// Primary kernel flavor
    pub kernel: String,
    /// Artifact base name and boot entry label
    pub name: String,
    /// Kernel command line source file
    pub cmdline: PathBuf,
    pub microcode: MicrocodeSelector,
    pub root_subvolume: String,
    pub snapshot_subvolume: String,
    pub key_dir: PathBuf,
    pub state_file: PathBuf,
    /// Flavors that get a recovery image, primary first
    pub recovery_flavors: Vec<String>,
    pub paths: SystemPaths,
}

impl BootConfiguration {
    /// Load from the configuration file and the process environment.
    ///
    /// A missing default file is not an error; a missing explicit one is.
    pub fn load(config_file: Option<&Path>) -> Result<Self, SbError> {
        let mut file = match config_file {
            Some(path) => ConfigFile::from_toml_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                ConfigFile::from_toml_file(DEFAULT_CONFIG_FILE)?
            }
            None => ConfigFile::default(),
        };
        file.apply_env(std::env::vars())?;
        Self::resolve(file)
    }

    /// Fill defaults and validate.
    pub fn resolve(file: ConfigFile) -> Result<Self, SbError> {
        let kernel = file.kernel.unwrap_or_else(|| "linux".to_string());
        if kernel.trim().is_empty() || kernel.contains('/') {
            return Err(SbError::ConfigurationError(format!(
                "invalid kernel flavor '{}'",
                kernel
            )));
        }
        let name = file.name.unwrap_or_else(|| format!("secure-boot-{}", kernel));
        if name.trim().is_empty() || name.contains('/') {
            return Err(SbError::ConfigurationError(format!(
                "invalid artifact name '{}'",
                name
            )));
        }

        let esp = file.esp.unwrap_or_else(|| PathBuf::from("/efi"));
        let paths = file.paths.unwrap_or_default();

        let boot_manager_present = esp_join(&esp, &paths.boot_manager_esp).is_file();
        let efi_dir = match file.efi_dir {
            Some(dir) => normalize_efi_dir(&dir)?,
            None if boot_manager_present => BOOT_MANAGER_EFI_DIR.to_string(),
            None => "/EFI/arch".to_string(),
        };
        if boot_manager_present && efi_dir != BOOT_MANAGER_EFI_DIR {
            return Err(SbError::ConfigurationError(format!(
                "a boot manager is installed at '{}', the EFI directory must be {} (configured: {})",
                esp_join(&esp, &paths.boot_manager_esp).display(),
                BOOT_MANAGER_EFI_DIR,
                efi_dir
            )));
        }

        let snapshot_subvolume = file
            .snapshot_subvolume
            .unwrap_or_else(|| format!("@snapshots/{}/snapshot", SNAPSHOT_ID_PLACEHOLDER));
        if !snapshot_subvolume.contains(SNAPSHOT_ID_PLACEHOLDER) {
            return Err(SbError::ConfigurationError(format!(
                "snapshot subvolume template '{}' lacks the {} placeholder",
                snapshot_subvolume, SNAPSHOT_ID_PLACEHOLDER
            )));
        }

        // The rescue script boots the configured kernel's recovery image.
        let mut seen = HashSet::new();
        let recovery_flavors: Vec<String> = std::iter::once(kernel.clone())
            .chain(
                file.recovery_flavors
                    .unwrap_or_else(|| vec!["linux-lts".to_string()]),
            )
            .filter(|flavor| seen.insert(flavor.clone()))
            .collect();
        if recovery_flavors.iter().any(|f| f.trim().is_empty() || f.contains('/')) {
            return Err(SbError::ConfigurationError(
                "recovery flavors must be non-empty file name components".to_string(),
            ));
        }

        Ok(Self {
            esp,
            efi_dir,
            kernel,
            name,
            cmdline: file
                .cmdline
                .unwrap_or_else(|| PathBuf::from("/etc/kernel/cmdline")),
            microcode: file.microcode.unwrap_or_default(),
            root_subvolume: file.root_subvolume.unwrap_or_else(|| "@".to_string()),
            snapshot_subvolume,
            key_dir: file
                .key_dir
                .unwrap_or_else(|| PathBuf::from("/etc/secure-boot")),
            state_file: file
                .state_file
                .unwrap_or_else(|| PathBuf::from("/var/lib/secure-boot/state.json")),
            recovery_flavors,
            paths,
        })
    }

    /// `<ESP>/<efi_dir>`
    pub fn efi_dir_path(&self) -> PathBuf {
        esp_join(&self.esp, Path::new(&self.efi_dir))
    }

    pub fn main_artifact_name(&self) -> String {
        format!("{}.efi", self.name)
    }

    /// `<name>-recovery.efi` for the primary flavor, `<name>-recovery-lts.efi`
    /// for `linux-lts` and so on.
    pub fn recovery_artifact_name(&self, flavor: &str) -> String {
        let suffix = if flavor == self.kernel {
            String::new()
        } else if let Some(rest) = flavor.strip_prefix(&self.kernel).filter(|r| r.starts_with('-')) {
            rest.to_string()
        } else if let Some(rest) = flavor.strip_prefix("linux").filter(|r| r.starts_with('-')) {
            rest.to_string()
        } else {
            format!("-{}", flavor)
        };
        format!("{}-recovery{}.efi", self.name, suffix)
    }

    pub fn shell_artifact_name(&self) -> String {
        format!("{}-efi-shell.efi", self.name)
    }

    pub fn main_artifact_path(&self) -> PathBuf {
        self.efi_dir_path().join(self.main_artifact_name())
    }

    pub fn rescue_script_path(&self) -> PathBuf {
        self.esp.join("recovery.nsh")
    }

    pub fn snapshots_manifest_path(&self) -> PathBuf {
        self.esp.join("snapshots.txt")
    }

    /// Boot manager location on the ESP.
    pub fn boot_manager_esp_path(&self) -> PathBuf {
        esp_join(&self.esp, &self.paths.boot_manager_esp)
    }

    pub fn boot_manager_present(&self) -> bool {
        self.boot_manager_esp_path().is_file()
    }

    /// Firmware-style loader path (`\EFI\arch\name.efi`) of a file on the ESP.
    pub fn firmware_path(&self, on_esp: &Path) -> Result<String, SbError> {
        let relative = on_esp.strip_prefix(&self.esp).map_err(|_| {
            SbError::InternalError(format!(
                "'{}' is not on the ESP '{}'",
                on_esp.display(),
                self.esp.display()
            ))
        })?;
        let mut out = String::new();
        for component in relative.components() {
            out.push('\\');
            out.push_str(&component.as_os_str().to_string_lossy());
        }
        Ok(out)
    }
}

fn esp_join(esp: &Path, relative: &Path) -> PathBuf {
    esp.join(relative.strip_prefix("/").unwrap_or(relative))
}

fn normalize_efi_dir(dir: &str) -> Result<String, SbError> {
    let trimmed = dir.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed.contains("..") {
        return Err(SbError::ConfigurationError(format!(
            "invalid EFI directory '{}'",
            dir
        )));
    }
    if trimmed.starts_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("/{}", trimmed))
    }
}
