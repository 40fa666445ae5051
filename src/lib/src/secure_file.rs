//! Owner-only file handling for key material
//!
//! Private keys and authenticated-variable payloads are produced by external
//! tools that create files with the process umask. This module tightens them
//! to mode 0600 after creation and warns when key material is found with
//! group or world access.
//!
//! # Example
//!
//! ```no_run
//! use sbkit::secure_file;
//! use std::path::Path;
//!
//! secure_file::restrict_permissions(Path::new("/etc/secure-boot/db.key"))?;
//! secure_file::check_permissions(Path::new("/etc/secure-boot/db.auth"))?;
//! # Ok::<(), sbkit::SbError>(())
//! ```

use crate::error::SbError;
use std::fs;
use std::path::Path;

/// Mode for private keys and auth payloads (owner read/write only)
#[cfg(unix)]
pub const SECURE_FILE_MODE: u32 = 0o600;

/// Warn if `path` is accessible by group or others.
#[cfg(unix)]
pub fn check_permissions(path: &Path) -> Result<(), SbError> {
    use std::os::unix::fs::PermissionsExt;

    let perm_bits = fs::metadata(path)?.permissions().mode() & 0o777;
    if perm_bits & 0o077 != 0 {
        log::warn!(
            "Key material '{}' has mode {:o}, expected {:o}; run: chmod 600 '{}'",
            path.display(),
            perm_bits,
            SECURE_FILE_MODE,
            path.display()
        );
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn check_permissions(path: &Path) -> Result<(), SbError> {
    log::debug!("Permission check skipped for '{}'", path.display());
    Ok(())
}

/// Set mode 0600 on an existing file.
#[cfg(unix)]
pub fn restrict_permissions(path: &Path) -> Result<(), SbError> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(SECURE_FILE_MODE);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
pub fn restrict_permissions(path: &Path) -> Result<(), SbError> {
    log::warn!(
        "Cannot restrict permissions of '{}' on this platform",
        path.display()
    );
    Ok(())
}
