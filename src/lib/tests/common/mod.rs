//! Shared fixtures: a relocated system tree and in-memory collaborators.
//!
//! Every collaborator records what it was asked to do in one shared
//! [`Recorder`], so tests can assert on the order of external effects.

#![allow(dead_code)]

use sbkit::artifact::Section;
use sbkit::config::{ConfigFile, MicrocodeSelector, SystemPaths};
use sbkit::esl::SignatureList;
use sbkit::tools::{
    CertAuthority, CertificateRequest, EfiSigTool, EfiSigner, FirmwareBootMgr, FirmwareEntry,
    PartitionLocation, PeEditor, SnapshotSource, Toolset, VarFsStatus, VariableStore, WriteMode,
};
use sbkit::{BootConfiguration, Lifecycle, SbError};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;
use uuid::Uuid;

/// Sections handed to the PE editor for one output image.
#[derive(Debug, Clone)]
pub struct Injection {
    pub output: String,
    /// `(name, address, content at injection time)`
    pub sections: Vec<(String, u64, Vec<u8>)>,
}

#[derive(Debug)]
pub struct Recorder {
    pub events: Vec<String>,
    pub injections: Vec<Injection>,
    pub entries: Vec<FirmwareEntry>,
    pub varfs: VarFsStatus,
    pub fail_variable: Option<&'static str>,
    pub fail_certificate: Option<&'static str>,
    pub snapshots: String,
}

impl Default for Recorder {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            injections: Vec::new(),
            entries: Vec::new(),
            varfs: VarFsStatus::ReadOnly,
            fail_variable: None,
            fail_certificate: None,
            snapshots: " # | Type   | Date\n 1 | single | today\n".to_string(),
        }
    }
}

pub type Shared = Rc<RefCell<Recorder>>;

fn tool_failure(command: String) -> SbError {
    SbError::ToolFailure {
        command,
        status: "exit status: 1".to_string(),
        stderr: String::new(),
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Self-signed certificates from rcgen.
pub struct FakeCa(pub Shared);

impl CertAuthority for FakeCa {
    fn create_self_signed(
        &self,
        request: &CertificateRequest,
        key_out: &Path,
        cert_out: &Path,
    ) -> Result<(), SbError> {
        let mut recorder = self.0.borrow_mut();
        recorder
            .events
            .push(format!("certificate {}", request.common_name));
        if recorder.fail_certificate == Some(request.common_name.as_str()) {
            return Err(tool_failure(format!("openssl req {}", request.common_name)));
        }
        drop(recorder);
        let (key, cert) = certificate_pem(&request.common_name);
        fs::write(key_out, key)?;
        fs::write(cert_out, cert)?;
        Ok(())
    }
}

/// Native signature lists; the auth payload is the list behind a marker.
pub struct FakeSigTool(pub Shared);

impl EfiSigTool for FakeSigTool {
    fn cert_to_sig_list(&self, owner: &Uuid, cert: &Path, esl_out: &Path) -> Result<(), SbError> {
        let pem = fs::read(cert)?;
        let (_, pem) = x509_parser::pem::parse_x509_pem(&pem)?;
        fs::write(esl_out, SignatureList::for_x509(*owner, &pem.contents).to_bytes()?)?;
        Ok(())
    }

    fn sign_sig_list(
        &self,
        variable: &str,
        _owner: &Uuid,
        _key: &Path,
        _cert: &Path,
        esl: &Path,
        auth_out: &Path,
    ) -> Result<(), SbError> {
        self.0
            .borrow_mut()
            .events
            .push(format!("auth {}", variable));
        let mut payload = format!("auth:{}:", variable).into_bytes();
        payload.extend(fs::read(esl)?);
        fs::write(auth_out, payload)?;
        Ok(())
    }
}

/// Copies the stub and remembers the sections.
pub struct FakePeEditor(pub Shared);

impl PeEditor for FakePeEditor {
    fn inject_sections(&self, stub: &Path, sections: &[Section], output: &Path) -> Result<(), SbError> {
        let mut recorded = Vec::new();
        for section in sections {
            recorded.push((
                section.name.to_string(),
                section.address,
                fs::read(&section.source)?,
            ));
        }
        fs::copy(stub, output)?;
        let output_name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut recorder = self.0.borrow_mut();
        recorder.events.push(format!("inject {}", output_name));
        recorder.injections.push(Injection {
            output: output_name,
            sections: recorded,
        });
        Ok(())
    }
}

/// Prefixes the input with `signed:`.
pub struct FakeSigner(pub Shared);

impl EfiSigner for FakeSigner {
    fn sign(&self, key: &Path, _cert: &Path, input: &Path, output: &Path) -> Result<(), SbError> {
        assert!(key.ends_with("db.key"), "signed with {}", key.display());
        let mut content = b"signed:".to_vec();
        content.extend(fs::read(input)?);
        fs::write(output, content)?;
        self.0.borrow_mut().events.push(format!(
            "sign {}",
            input.file_name().unwrap_or_default().to_string_lossy()
        ));
        Ok(())
    }
}

pub struct FakeFirmware(pub Shared);

impl FirmwareBootMgr for FakeFirmware {
    fn varfs_status(&self, _mountpoint: &Path) -> Result<VarFsStatus, SbError> {
        Ok(self.0.borrow().varfs)
    }

    fn mount_varfs(&self, _mountpoint: &Path) -> Result<(), SbError> {
        let mut recorder = self.0.borrow_mut();
        recorder.events.push("mount efivarfs".to_string());
        recorder.varfs = VarFsStatus::ReadWrite;
        Ok(())
    }

    fn remount_varfs_rw(&self, _mountpoint: &Path) -> Result<(), SbError> {
        let mut recorder = self.0.borrow_mut();
        recorder.events.push("remount efivarfs".to_string());
        recorder.varfs = VarFsStatus::ReadWrite;
        Ok(())
    }

    fn resolve_partition(&self, _mountpoint: &Path) -> Result<PartitionLocation, SbError> {
        Ok(PartitionLocation {
            disk: PathBuf::from("/dev/vda"),
            partition: 1,
        })
    }

    fn list_entries(&self) -> Result<Vec<FirmwareEntry>, SbError> {
        Ok(self.0.borrow().entries.clone())
    }

    fn create_entry(
        &self,
        _location: &PartitionLocation,
        loader: &str,
        label: &str,
    ) -> Result<(), SbError> {
        let mut recorder = self.0.borrow_mut();
        recorder.events.push(format!("create entry {}", label));
        let number = format!("{:04X}", recorder.entries.len());
        recorder.entries.push(FirmwareEntry {
            number,
            label: label.to_string(),
            loader: Some(loader.to_string()),
        });
        Ok(())
    }
}

pub struct FakeVariables(pub Shared);

impl VariableStore for FakeVariables {
    fn write(&self, variable: &str, payload: &Path, mode: WriteMode) -> Result<(), SbError> {
        let mut recorder = self.0.borrow_mut();
        recorder.events.push(format!(
            "variable {} {} {}",
            variable,
            payload.file_name().unwrap_or_default().to_string_lossy(),
            mode
        ));
        if recorder.fail_variable == Some(variable) {
            return Err(tool_failure(format!("efi-updatevar {}", variable)));
        }
        Ok(())
    }
}

pub struct FakeSnapshots(pub Shared);

impl SnapshotSource for FakeSnapshots {
    fn list_snapshots(&self) -> Result<String, SbError> {
        Ok(self.0.borrow().snapshots.clone())
    }
}

pub fn certificate_pem(common_name: &str) -> (String, String) {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::default();
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, common_name);
    params.distinguished_name = dn;
    let cert = params.self_signed(&key_pair).unwrap();
    (key_pair.serialize_pem(), cert.pem())
}

// ============================================================================
// System tree
// ============================================================================

pub const CMDLINE: &str = "root=UUID=0a1b rw  rootflags=subvol=@,compress=zstd\nquiet\n";

/// A relocated root with every source file the build needs.
pub struct TestSystem {
    pub root: TempDir,
    pub recorder: Shared,
}

impl TestSystem {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let root = tempfile::tempdir().unwrap();
        let system = Self {
            root,
            recorder: Rc::new(RefCell::new(Recorder::default())),
        };
        let paths = system.paths();
        let files = [
            (paths.stub.clone(), "stub".to_string()),
            (paths.os_release.clone(), "NAME=\"Arch Linux\"\n".to_string()),
            (paths.efi_shell.clone(), "shell".to_string()),
            (paths.fwupd_driver.clone(), "fwupd".to_string()),
            (paths.boot_manager.clone(), "systemd-boot".to_string()),
            (paths.kernel_image("linux"), "vmlinuz-linux".to_string()),
            (paths.initramfs("linux"), "initramfs-linux".to_string()),
            (paths.fallback_initramfs("linux"), "fallback-linux".to_string()),
            (paths.kernel_image("linux-lts"), "vmlinuz-linux-lts".to_string()),
            (paths.fallback_initramfs("linux-lts"), "fallback-linux-lts".to_string()),
            (paths.microcode("intel"), "intel-ucode".to_string()),
            (paths.microcode("amd"), "amd-ucode".to_string()),
            (system.path("etc/kernel/cmdline"), CMDLINE.to_string()),
        ];
        for (path, content) in files {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        fs::create_dir_all(system.path("efi")).unwrap();
        system
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.path().join(relative)
    }

    pub fn paths(&self) -> SystemPaths {
        SystemPaths::rooted_at(self.root.path())
    }

    /// Install a third-party boot manager on the ESP.
    pub fn install_boot_manager(&self) {
        let path = self.path("efi/EFI/systemd/systemd-bootx64.efi");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "unsigned systemd-boot").unwrap();
    }

    pub fn config_file(&self) -> ConfigFile {
        ConfigFile {
            esp: Some(self.path("efi")),
            cmdline: Some(self.path("etc/kernel/cmdline")),
            microcode: Some(MicrocodeSelector::Intel),
            key_dir: Some(self.path("etc/secure-boot")),
            state_file: Some(self.path("var/lib/secure-boot/state.json")),
            paths: Some(self.paths()),
            ..Default::default()
        }
    }

    pub fn config(&self) -> BootConfiguration {
        BootConfiguration::resolve(self.config_file()).unwrap()
    }

    pub fn toolset(&self) -> Toolset {
        Toolset {
            cert_authority: Box::new(FakeCa(self.recorder.clone())),
            sig_tool: Box::new(FakeSigTool(self.recorder.clone())),
            pe_editor: Box::new(FakePeEditor(self.recorder.clone())),
            signer: Box::new(FakeSigner(self.recorder.clone())),
            boot_mgr: Box::new(FakeFirmware(self.recorder.clone())),
            variables: Box::new(FakeVariables(self.recorder.clone())),
            snapshots: Box::new(FakeSnapshots(self.recorder.clone())),
        }
    }

    /// Lifecycle with state in the configured state file.
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::new(self.config(), self.toolset())
    }

    pub fn events(&self) -> Vec<String> {
        self.recorder.borrow().events.clone()
    }

    /// Events starting with `prefix`.
    pub fn events_of(&self, prefix: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }

    pub fn injection(&self, output: &str) -> Injection {
        self.recorder
            .borrow()
            .injections
            .iter()
            .find(|i| i.output == output)
            .cloned()
            .unwrap_or_else(|| panic!("no image {} was built", output))
    }

    pub fn clear_events(&self) {
        self.recorder.borrow_mut().events.clear();
    }
}
