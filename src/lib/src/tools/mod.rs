//! External collaborators
//!
//! Certificate creation, signature-list handling, PE section injection,
//! Authenticode signing, firmware boot entries, variable writes and snapshot
//! listing are delegated to system tools. Each concern is a trait so the
//! lifecycle can run against in-memory fakes; the process-backed
//! implementations in the submodules run the tools through a
//! [`CommandRunner`](crate::process::CommandRunner).

use crate::artifact::Section;
use crate::error::SbError;
use crate::process::{CommandRunner, SystemRunner};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

mod efibootmgr;
mod efitools;
mod objcopy;
mod openssl;
mod sbsign;
mod snapper;

pub use efibootmgr::EfiBootMgr;
pub use efitools::EfiTools;
pub use objcopy::Objcopy;
pub use openssl::OpensslCa;
pub use sbsign::Sbsign;
pub use snapper::Snapper;

// ============================================================================
// Certificates and signature lists
// ============================================================================

/// Parameters of a self-signed certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub common_name: String,
    pub rsa_bits: u32,
    pub validity_days: u32,
}

impl CertificateRequest {
    /// RSA 4096, ten years, unencrypted key.
    pub fn secure_boot(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            rsa_bits: 4096,
            validity_days: 3650,
        }
    }
}

/// Issues self-signed X.509 certificates.
pub trait CertAuthority {
    /// Write a fresh private key to `key_out` and its certificate (PEM) to `cert_out`.
    fn create_self_signed(
        &self,
        request: &CertificateRequest,
        key_out: &Path,
        cert_out: &Path,
    ) -> Result<(), SbError>;
}

/// Converts certificates to EFI signature lists and signs them.
pub trait EfiSigTool {
    fn cert_to_sig_list(&self, owner: &Uuid, cert: &Path, esl_out: &Path) -> Result<(), SbError>;

    /// Wrap `esl` into an authenticated update of `variable`.
    fn sign_sig_list(
        &self,
        variable: &str,
        owner: &Uuid,
        key: &Path,
        cert: &Path,
        esl: &Path,
        auth_out: &Path,
    ) -> Result<(), SbError>;
}

// ============================================================================
// PE images
// ============================================================================

/// Adds sections to a PE/EFI stub.
pub trait PeEditor {
    /// Copy `stub` to `output` with every section added at its load address.
    fn inject_sections(&self, stub: &Path, sections: &[Section], output: &Path)
        -> Result<(), SbError>;
}

/// Embeds an Authenticode signature in a PE image.
pub trait EfiSigner {
    fn sign(&self, key: &Path, cert: &Path, input: &Path, output: &Path) -> Result<(), SbError>;
}

// ============================================================================
// Firmware
// ============================================================================

/// Mount state of the EFI variable filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarFsStatus {
    Absent,
    ReadOnly,
    ReadWrite,
}

/// Block device and partition number backing a mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLocation {
    pub disk: PathBuf,
    pub partition: u32,
}

/// A boot entry as reported by the firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareEntry {
    /// Hexadecimal boot number, e.g. `0003`
    pub number: String,
    pub label: String,
    /// Loader path in firmware notation, when it could be read back
    pub loader: Option<String>,
}

/// Firmware boot manager and EFI variable filesystem access.
pub trait FirmwareBootMgr {
    fn varfs_status(&self, mountpoint: &Path) -> Result<VarFsStatus, SbError>;

    fn mount_varfs(&self, mountpoint: &Path) -> Result<(), SbError>;

    fn remount_varfs_rw(&self, mountpoint: &Path) -> Result<(), SbError>;

    fn resolve_partition(&self, mountpoint: &Path) -> Result<PartitionLocation, SbError>;

    fn list_entries(&self) -> Result<Vec<FirmwareEntry>, SbError>;

    fn create_entry(
        &self,
        location: &PartitionLocation,
        loader: &str,
        label: &str,
    ) -> Result<(), SbError>;
}

/// How a payload is written to a Secure Boot variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Signed update appended to the existing value
    AuthenticatedAppend,
    /// Plain signature list, accepted only while the platform is in setup mode
    Unauthenticated,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::AuthenticatedAppend => write!(f, "authenticated append"),
            WriteMode::Unauthenticated => write!(f, "unauthenticated"),
        }
    }
}

/// Writes Secure Boot variables.
pub trait VariableStore {
    fn write(&self, variable: &str, payload: &Path, mode: WriteMode) -> Result<(), SbError>;
}

/// Lists filesystem snapshots.
pub trait SnapshotSource {
    /// Human-readable snapshot table.
    fn list_snapshots(&self) -> Result<String, SbError>;
}

// ============================================================================
// Tool set
// ============================================================================

/// Every collaborator the lifecycle needs.
pub struct Toolset {
    pub cert_authority: Box<dyn CertAuthority>,
    pub sig_tool: Box<dyn EfiSigTool>,
    pub pe_editor: Box<dyn PeEditor>,
    pub signer: Box<dyn EfiSigner>,
    pub boot_mgr: Box<dyn FirmwareBootMgr>,
    pub variables: Box<dyn VariableStore>,
    pub snapshots: Box<dyn SnapshotSource>,
}

impl Toolset {
    /// Process-backed collaborators running on the host.
    pub fn system() -> Self {
        Self::with_runner(SystemRunner)
    }

    /// Process-backed collaborators sharing one runner.
    pub fn with_runner<R>(runner: R) -> Self
    where
        R: CommandRunner + Clone + 'static,
    {
        Self {
            cert_authority: Box::new(OpensslCa::new(runner.clone())),
            sig_tool: Box::new(EfiTools::new(runner.clone())),
            pe_editor: Box::new(Objcopy::new(runner.clone())),
            signer: Box::new(Sbsign::new(runner.clone())),
            boot_mgr: Box::new(EfiBootMgr::new(runner.clone())),
            variables: Box::new(EfiTools::new(runner.clone())),
            snapshots: Box::new(Snapper::new(runner)),
        }
    }
}

impl fmt::Debug for Toolset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Toolset").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_boot_request() {
        let req = CertificateRequest::secure_boot("SecureBoot db");
        assert_eq!(req.rsa_bits, 4096);
        assert_eq!(req.validity_days, 3650);
        assert_eq!(req.common_name, "SecureBoot db");
    }

    #[test]
    fn test_write_mode_display() {
        assert_eq!(WriteMode::AuthenticatedAppend.to_string(), "authenticated append");
        assert_eq!(WriteMode::Unauthenticated.to_string(), "unauthenticated");
    }
}
