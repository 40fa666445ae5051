//! Snapshot table on the ESP
//!
//! The rescue script prints `<ESP>/snapshots.txt` when started without a
//! snapshot number, so the operator can pick one from the firmware shell.

use crate::config::BootConfiguration;
use crate::error::SbError;
use crate::tools::SnapshotSource;
use std::fs;
use std::path::PathBuf;

/// Write the current snapshot table to the ESP. Returns the file written.
pub fn write_snapshot_manifest(
    source: &dyn SnapshotSource,
    config: &BootConfiguration,
) -> Result<PathBuf, SbError> {
    let listing = source.list_snapshots()?;
    // The EFI shell `type` command expects DOS line endings
    let mut manifest = listing.lines().collect::<Vec<_>>().join("\r\n");
    manifest.push_str("\r\n");

    let target = config.snapshots_manifest_path();
    let tmp = config.esp.join(".snapshots.txt.tmp");
    fs::write(&tmp, manifest.as_bytes())?;
    if let Err(e) = fs::rename(&tmp, &target) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    log::info!("Wrote snapshot table to '{}'", target.display());
    Ok(target)
}
