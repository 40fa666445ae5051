//! Firmware boot entry registration

use crate::audit;
use crate::config::BootConfiguration;
use crate::error::SbError;
use crate::tools::{FirmwareBootMgr, VarFsStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A registered firmware boot entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootEntry {
    pub firmware_device: PathBuf,
    pub partition_number: u32,
    /// Loader in firmware notation, e.g. `\EFI\arch\secure-boot-linux.efi`
    pub loader_path: String,
    pub label: String,
    /// `BootXXXX` number, when the firmware reported it back
    #[serde(default)]
    pub boot_number: Option<String>,
}

/// Outcome of [`BootEntryManager::register_entry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub entry: BootEntry,
    /// An identical entry already existed and no new one was created
    pub reused: bool,
}

pub struct BootEntryManager<'a> {
    boot_mgr: &'a dyn FirmwareBootMgr,
    config: &'a BootConfiguration,
}

impl<'a> BootEntryManager<'a> {
    pub fn new(boot_mgr: &'a dyn FirmwareBootMgr, config: &'a BootConfiguration) -> Self {
        Self { boot_mgr, config }
    }

    /// File the entry boots: the boot manager when one is installed on the
    /// ESP, the main image otherwise.
    pub fn loader_target(&self) -> Result<PathBuf, SbError> {
        let main = self.config.main_artifact_path();
        if !main.is_file() {
            return Err(SbError::PreconditionError {
                stage: "Signed artifact generation",
                remedy: "generate-efi",
            });
        }
        if self.config.boot_manager_present() {
            Ok(self.config.boot_manager_esp_path())
        } else {
            Ok(main)
        }
    }

    /// Make sure efivarfs accepts writes.
    pub fn ensure_varfs_writable(&self) -> Result<(), SbError> {
        let mountpoint = &self.config.paths.efivarfs;
        match self.boot_mgr.varfs_status(mountpoint)? {
            VarFsStatus::ReadWrite => {}
            VarFsStatus::ReadOnly => {
                log::info!("Remounting '{}' read-write", mountpoint.display());
                self.boot_mgr.remount_varfs_rw(mountpoint)?;
            }
            VarFsStatus::Absent => {
                log::info!("Mounting efivarfs on '{}'", mountpoint.display());
                self.boot_mgr.mount_varfs(mountpoint)?;
            }
        }
        match self.boot_mgr.varfs_status(mountpoint)? {
            VarFsStatus::ReadWrite => Ok(()),
            status => Err(SbError::VarFsUnavailable(format!(
                "'{}' is still {:?} after mounting",
                mountpoint.display(),
                status
            ))),
        }
    }

    /// Register the boot entry, reusing an existing one with the same label
    /// and loader.
    pub fn register_entry(&self) -> Result<Registration, SbError> {
        let target = self.loader_target()?;
        self.ensure_varfs_writable()?;

        let location = self.boot_mgr.resolve_partition(&self.config.esp)?;
        let loader = self.config.firmware_path(&target)?;
        let label = self.config.name.clone();

        let find = |entries: Vec<crate::tools::FirmwareEntry>| {
            entries.into_iter().find(|e| {
                e.label == label
                    && e.loader
                        .as_deref()
                        .is_some_and(|l| l.eq_ignore_ascii_case(&loader))
            })
        };

        let existing = find(self.boot_mgr.list_entries()?);
        let reused = existing.is_some();
        let boot_number = match existing {
            Some(entry) => {
                log::info!("Boot entry Boot{} '{}' already exists", entry.number, label);
                Some(entry.number)
            }
            None => {
                log::info!(
                    "Creating boot entry '{}' -> {} on {} partition {}",
                    label,
                    loader,
                    location.disk.display(),
                    location.partition
                );
                self.boot_mgr.create_entry(&location, &loader, &label)?;
                match self.boot_mgr.list_entries() {
                    Ok(entries) => find(entries).map(|e| e.number),
                    Err(e) => {
                        log::warn!("Cannot read back boot entries: {}", e);
                        None
                    }
                }
            }
        };

        audit::log_boot_entry(&label, &loader, reused);
        Ok(Registration {
            entry: BootEntry {
                firmware_device: location.disk,
                partition_number: location.partition,
                loader_path: loader,
                label,
                boot_number,
            },
            reused,
        })
    }
}
