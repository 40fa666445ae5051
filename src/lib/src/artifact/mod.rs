//! Unified EFI images
//!
//! A unified image is the Linux EFI stub with the OS release, the kernel
//! command line, the kernel and the initramfs appended as PE sections. The
//! stub locates them by name and load address, so the addresses in
//! [`SectionLayout`] are a fixed contract with the stub and never configurable.

use crate::error::SbError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

mod builder;
mod rescue;
mod signer;

pub use builder::{read_cmdline, ArtifactBuilder};
pub use rescue::{render_rescue_script, rewrite_root_subvolume};
pub use signer::{ArtifactSigner, StagedArtifacts};

/// Name and load address of a stub section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionSlot {
    pub name: &'static str,
    pub address: u64,
}

/// Section load addresses expected by the systemd EFI stub.
pub struct SectionLayout;

impl SectionLayout {
    pub const OSREL: SectionSlot = SectionSlot {
        name: ".osrel",
        address: 0x20000,
    };
    pub const CMDLINE: SectionSlot = SectionSlot {
        name: ".cmdline",
        address: 0x30000,
    };
    pub const LINUX: SectionSlot = SectionSlot {
        name: ".linux",
        address: 0x2000000,
    };
    pub const INITRD: SectionSlot = SectionSlot {
        name: ".initrd",
        address: 0x3000000,
    };

    /// Check that sections are in ascending address order and that none of
    /// them runs into the next one.
    pub fn validate(sections: &[Section]) -> Result<(), SbError> {
        for pair in sections.windows(2) {
            let (current, next) = (&pair[0], &pair[1]);
            if next.address <= current.address {
                return Err(SbError::InternalError(format!(
                    "section {} must come after {}",
                    next.name, current.name
                )));
            }
            let size = fs::metadata(&current.source)?.len();
            if current.address + size > next.address {
                return Err(SbError::SectionOverlap {
                    section: current.name,
                    address: current.address,
                    size,
                });
            }
        }
        Ok(())
    }
}

/// A section to inject: its slot and the file holding its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: &'static str,
    pub source: PathBuf,
    pub address: u64,
}

impl Section {
    pub fn new(slot: SectionSlot, source: impl Into<PathBuf>) -> Self {
        Self {
            name: slot.name,
            source: source.into(),
            address: slot.address,
        }
    }
}

/// What an image is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ArtifactKind {
    Main,
    Recovery(String),
    RescueShell,
    FirmwareUpdate,
    BootManager,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Main => write!(f, "main"),
            ArtifactKind::Recovery(flavor) => write!(f, "recovery:{}", flavor),
            ArtifactKind::RescueShell => write!(f, "rescue-shell"),
            ArtifactKind::FirmwareUpdate => write!(f, "firmware-update"),
            ArtifactKind::BootManager => write!(f, "boot-manager"),
        }
    }
}

impl From<ArtifactKind> for String {
    fn from(kind: ArtifactKind) -> Self {
        kind.to_string()
    }
}

impl TryFrom<String> for ArtifactKind {
    type Error = SbError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "main" => Ok(ArtifactKind::Main),
            "rescue-shell" => Ok(ArtifactKind::RescueShell),
            "firmware-update" => Ok(ArtifactKind::FirmwareUpdate),
            "boot-manager" => Ok(ArtifactKind::BootManager),
            other => match other.strip_prefix("recovery:") {
                Some(flavor) if !flavor.is_empty() => {
                    Ok(ArtifactKind::Recovery(flavor.to_string()))
                }
                _ => Err(SbError::InternalError(format!(
                    "unknown artifact kind '{}'",
                    other
                ))),
            },
        }
    }
}

/// An image built in the work directory, not yet signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedArtifact {
    pub kind: ArtifactKind,
    pub file: PathBuf,
    /// Injected sections, empty for images copied unmodified
    pub sections: Vec<Section>,
}

impl UnsignedArtifact {
    /// File name under the EFI directory once staged.
    pub fn file_name(&self) -> Result<&str, SbError> {
        self.file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                SbError::InternalError(format!("bad artifact path '{}'", self.file.display()))
            })
    }
}

/// A signed image at its final location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedArtifact {
    pub kind: ArtifactKind,
    pub file_path: PathBuf,
}

/// Everything produced by one build, inside a work directory that is removed
/// when this value is dropped.
#[derive(Debug)]
pub struct BuildOutput {
    workdir: TempDir,
    pub artifacts: Vec<UnsignedArtifact>,
    pub rescue_script: PathBuf,
}

impl BuildOutput {
    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section_of_size(dir: &Path, slot: SectionSlot, size: usize) -> Section {
        let path = dir.join(slot.name.trim_start_matches('.'));
        fs::write(&path, vec![0u8; size]).unwrap();
        Section::new(slot, path)
    }

    #[test]
    fn test_layout_constants() {
        assert_eq!(SectionLayout::OSREL.address, 0x20000);
        assert_eq!(SectionLayout::CMDLINE.address, 0x30000);
        assert_eq!(SectionLayout::LINUX.address, 0x2000000);
        assert_eq!(SectionLayout::INITRD.address, 0x3000000);
    }

    #[test]
    fn test_validate_accepts_fitting_sections() {
        let dir = tempfile::tempdir().unwrap();
        let sections = vec![
            section_of_size(dir.path(), SectionLayout::OSREL, 400),
            section_of_size(dir.path(), SectionLayout::CMDLINE, 0x10000),
            section_of_size(dir.path(), SectionLayout::LINUX, 4096),
            section_of_size(dir.path(), SectionLayout::INITRD, 1024),
        ];
        SectionLayout::validate(&sections).unwrap();
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let sections = vec![
            section_of_size(dir.path(), SectionLayout::OSREL, 0x10001),
            section_of_size(dir.path(), SectionLayout::CMDLINE, 10),
        ];
        let err = SectionLayout::validate(&sections).unwrap_err();
        assert!(matches!(
            err,
            SbError::SectionOverlap {
                section: ".osrel",
                address: 0x20000,
                size: 0x10001
            }
        ));
    }

    #[test]
    fn test_validate_rejects_unordered() {
        let dir = tempfile::tempdir().unwrap();
        let sections = vec![
            section_of_size(dir.path(), SectionLayout::LINUX, 10),
            section_of_size(dir.path(), SectionLayout::OSREL, 10),
        ];
        assert!(SectionLayout::validate(&sections).is_err());
    }

    #[test]
    fn test_signed_artifact_json() {
        let artifact = SignedArtifact {
            kind: ArtifactKind::Recovery("linux-lts".to_string()),
            file_path: PathBuf::from("/efi/EFI/arch/x-recovery-lts.efi"),
        };
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["kind"], "recovery:linux-lts");

        let back: SignedArtifact = serde_json::from_value(json).unwrap();
        assert_eq!(back, artifact);

        let bad = serde_json::json!({"kind": "recovery:", "file_path": "/x"});
        assert!(serde_json::from_value::<SignedArtifact>(bad).is_err());
    }
}
