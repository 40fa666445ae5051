use super::EfiSigner;
use crate::error::SbError;
use crate::process::{CommandRunner, Invocation};
use std::path::Path;

/// [`EfiSigner`] backed by `sbsign`.
#[derive(Debug, Clone)]
pub struct Sbsign<R> {
    runner: R,
}

impl<R: CommandRunner> Sbsign<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> EfiSigner for Sbsign<R> {
    fn sign(&self, key: &Path, cert: &Path, input: &Path, output: &Path) -> Result<(), SbError> {
        let invocation = Invocation::new("sbsign")
            .arg("--key")
            .path(key)
            .arg("--cert")
            .path(cert)
            .arg("--output")
            .path(output)
            .path(input);
        self.runner.run(&invocation)?;
        Ok(())
    }
}
