use super::SnapshotSource;
use crate::error::SbError;
use crate::process::{CommandRunner, Invocation};

/// [`SnapshotSource`] backed by `snapper`.
#[derive(Debug, Clone)]
pub struct Snapper<R> {
    runner: R,
}

impl<R: CommandRunner> Snapper<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> SnapshotSource for Snapper<R> {
    fn list_snapshots(&self) -> Result<String, SbError> {
        let output = self
            .runner
            .run(&Invocation::new("snapper").args(["--no-dbus", "list"]))?;
        Ok(output.stdout)
    }
}
