use super::{ArtifactKind, BuildOutput, SignedArtifact};
use crate::audit;
use crate::config::BootConfiguration;
use crate::error::SbError;
use crate::tools::EfiSigner;
use crate::trust::{KeyName, TrustStore};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Result of signing and staging one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifacts {
    /// Every signed image at its final location, main image first
    pub artifacts: Vec<SignedArtifact>,
    pub rescue_script: PathBuf,
}

impl StagedArtifacts {
    pub fn main(&self) -> Option<&SignedArtifact> {
        self.artifacts.iter().find(|a| a.kind == ArtifactKind::Main)
    }
}

/// Signs built images with the db key and installs them on the ESP.
///
/// Nothing is copied to the ESP until every signature has been produced.
pub struct ArtifactSigner<'a> {
    signer: &'a dyn EfiSigner,
    config: &'a BootConfiguration,
}

impl<'a> ArtifactSigner<'a> {
    pub fn new(signer: &'a dyn EfiSigner, config: &'a BootConfiguration) -> Self {
        Self { signer, config }
    }

    pub fn sign_and_stage(
        &self,
        build: &BuildOutput,
        trust: &TrustStore,
    ) -> Result<StagedArtifacts, SbError> {
        let paths = &self.config.paths;
        let boot_manager = self.config.boot_manager_present();

        if !paths.fwupd_driver.is_file() {
            return Err(SbError::Missing {
                what: "firmware update driver",
                path: paths.fwupd_driver.clone(),
            });
        }
        if boot_manager && !paths.boot_manager.is_file() {
            return Err(SbError::Missing {
                what: "boot manager binary",
                path: paths.boot_manager.clone(),
            });
        }

        let mut signed = Vec::with_capacity(build.artifacts.len());
        for artifact in &build.artifacts {
            let output = signed_sibling(&artifact.file);
            self.sign(trust, &artifact.kind, &artifact.file, &output)?;
            signed.push((artifact.kind.clone(), output, artifact.file_name()?.to_string()));
        }

        let fwupd = signed_sibling(&paths.fwupd_driver);
        self.sign(trust, &ArtifactKind::FirmwareUpdate, &paths.fwupd_driver, &fwupd)?;

        let boot_manager = if boot_manager {
            let output = signed_sibling(&paths.boot_manager);
            self.sign(trust, &ArtifactKind::BootManager, &paths.boot_manager, &output)?;
            Some(output)
        } else {
            None
        };

        // Every signature exists, install them
        let efi_dir = self.config.efi_dir_path();
        fs::create_dir_all(&efi_dir)?;

        let mut artifacts = Vec::with_capacity(signed.len() + 2);
        for (kind, source, name) in signed {
            let target = efi_dir.join(name);
            install(&source, &target)?;
            artifacts.push(SignedArtifact {
                kind,
                file_path: target,
            });
        }

        let rescue_script = self.config.rescue_script_path();
        install(&build.rescue_script, &rescue_script)?;

        artifacts.push(SignedArtifact {
            kind: ArtifactKind::FirmwareUpdate,
            file_path: fwupd,
        });
        if let Some(source) = boot_manager {
            let target = self.config.boot_manager_esp_path();
            install(&source, &target)?;
            artifacts.push(SignedArtifact {
                kind: ArtifactKind::BootManager,
                file_path: target,
            });
        }

        log::info!(
            "Staged {} signed images in '{}'",
            artifacts.len(),
            efi_dir.display()
        );
        Ok(StagedArtifacts {
            artifacts,
            rescue_script,
        })
    }

    fn sign(
        &self,
        trust: &TrustStore,
        kind: &ArtifactKind,
        input: &Path,
        output: &Path,
    ) -> Result<(), SbError> {
        let db = trust.files(KeyName::Db);
        log::info!("Signing {} '{}'", kind, input.display());
        self.signer
            .sign(&db.private_key, &db.certificate, input, output)?;
        audit::log_artifact_signed(&kind.to_string(), output);
        Ok(())
    }
}

/// `<file>.signed`
fn signed_sibling(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".signed");
    PathBuf::from(name)
}

/// Copy to a temporary sibling of `target`, then rename over it.
fn install(source: &Path, target: &Path) -> Result<(), SbError> {
    let parent = target.parent().ok_or_else(|| {
        SbError::InternalError(format!("'{}' has no parent directory", target.display()))
    })?;
    fs::create_dir_all(parent)?;

    let mut tmp_name = OsString::from(".");
    tmp_name.push(target.file_name().unwrap_or_default());
    tmp_name.push(".tmp");
    let tmp = parent.join(tmp_name);

    fs::copy(source, &tmp)?;
    if let Err(e) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    log::debug!("Installed '{}'", target.display());
    Ok(())
}
