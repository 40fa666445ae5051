//! Lifecycle operations
//!
//! [`Lifecycle`] ties the components together behind the six operations of
//! the command-line tool, plus `status`:
//!
//! ```text
//! NoKeys --generate-keys--> KeysGenerated --generate-efi--> ArtifactsSigned
//!        --add-efi--> BootEntryRegistered --enroll-keys--> Enrolled
//! ```
//!
//! Each operation checks its precondition against the persisted
//! [`LifecycleState`] and against the files on disk. A key hierarchy or a
//! signed main image found on disk without a matching record is adopted
//! into the state with a warning; a record whose files are gone counts as
//! not done.

use crate::artifact::{ArtifactBuilder, ArtifactKind, ArtifactSigner, SignedArtifact, StagedArtifacts};
use crate::audit;
use crate::boot_entry::{BootEntryManager, Registration};
use crate::config::BootConfiguration;
use crate::enroll::{EnrollmentReport, VariableEnroller};
use crate::error::SbError;
use crate::snapshots;
use crate::state::{FileStorage, LifecycleStage, LifecycleState, StateStorage};
use crate::tools::Toolset;
use crate::trust::{KeyHierarchyGenerator, TrustStore};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// The operations exposed on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    InitialSetup,
    GenerateSnapshots,
    GenerateEfi,
    AddEfi,
    EnrollKeys,
    GenerateKeys,
    Status,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Operation::InitialSetup,
        Operation::GenerateSnapshots,
        Operation::GenerateEfi,
        Operation::AddEfi,
        Operation::EnrollKeys,
        Operation::GenerateKeys,
        Operation::Status,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::InitialSetup => "initial-setup",
            Operation::GenerateSnapshots => "generate-snapshots",
            Operation::GenerateEfi => "generate-efi",
            Operation::AddEfi => "add-efi",
            Operation::EnrollKeys => "enroll-keys",
            Operation::GenerateKeys => "generate-keys",
            Operation::Status => "status",
        }
    }

    pub fn about(&self) -> &'static str {
        match self {
            Operation::InitialSetup => {
                "Generate keys, build and sign images, add the boot entry and enroll the keys"
            }
            Operation::GenerateSnapshots => "Write the snapshot table used by the rescue script",
            Operation::GenerateEfi => "Build, sign and install the EFI images",
            Operation::AddEfi => "Register the signed image as a firmware boot entry",
            Operation::EnrollKeys => "Enroll db, KEK and PK into the firmware",
            Operation::GenerateKeys => "Generate the PK/KEK/db key hierarchy",
            Operation::Status => "Show the recorded lifecycle state",
        }
    }
}

impl FromStr for Operation {
    type Err = SbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or(SbError::UsageError("unknown operation"))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What `initial-setup` achieved.
#[derive(Debug)]
pub struct SetupReport {
    pub guid: Uuid,
    pub staged: StagedArtifacts,
    pub registration: Registration,
    /// May contain a failed write; the earlier steps stay in place
    pub enrollment: EnrollmentReport,
}

/// What `status` found.
#[derive(Debug)]
pub struct StatusReport {
    pub stage: LifecycleStage,
    pub state: LifecycleState,
    /// Why the key hierarchy on disk did not verify, if it exists
    pub trust_problem: Option<String>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Stage: {}", self.stage)?;
        if let Some(keys) = &self.state.keys {
            writeln!(f, "Keys: {} in '{}'", keys.guid, keys.key_dir.display())?;
        }
        match &self.trust_problem {
            Some(problem) => writeln!(f, "Key hierarchy: {}", problem)?,
            None if self.state.keys.is_some() => writeln!(f, "Key hierarchy: verified")?,
            None => {}
        }
        if let Some(artifacts) = &self.state.artifacts {
            for artifact in &artifacts.artifacts {
                writeln!(f, "Signed {}: '{}'", artifact.kind, artifact.file_path.display())?;
            }
        }
        if let Some(record) = &self.state.boot_entry {
            let entry = &record.entry;
            writeln!(
                f,
                "Boot entry: {} '{}' -> {}",
                entry.boot_number.as_deref().unwrap_or("----"),
                entry.label,
                entry.loader_path
            )?;
        }
        for (name, status) in &self.state.enrollment {
            match status {
                crate::state::EnrollmentStatus::Enrolled { guid, .. } => {
                    writeln!(f, "{}: enrolled ({})", name, guid)?
                }
                crate::state::EnrollmentStatus::Failed { message, .. } => {
                    writeln!(f, "{}: failed ({})", name, message)?
                }
            }
        }
        Ok(())
    }
}

pub struct Lifecycle {
    config: BootConfiguration,
    tools: Toolset,
    storage: Box<dyn StateStorage>,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("config", &self.config)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl Lifecycle {
    /// State kept in the configured state file.
    pub fn new(config: BootConfiguration, tools: Toolset) -> Self {
        let storage = Box::new(FileStorage::new(config.state_file.clone()));
        Self::with_storage(config, tools, storage)
    }

    pub fn with_storage(
        config: BootConfiguration,
        tools: Toolset,
        storage: Box<dyn StateStorage>,
    ) -> Self {
        Self {
            config,
            tools,
            storage,
        }
    }

    pub fn config(&self) -> &BootConfiguration {
        &self.config
    }

    pub fn state(&self) -> Result<LifecycleState, SbError> {
        self.storage.load_state()
    }

    // ========================================================================
    // Operations
    // ========================================================================

    pub fn generate_keys(&self) -> Result<TrustStore, SbError> {
        self.audited(Operation::GenerateKeys, |state| self.do_generate_keys(state))
    }

    pub fn generate_efi(&self) -> Result<StagedArtifacts, SbError> {
        self.audited(Operation::GenerateEfi, |state| self.do_generate_efi(state))
    }

    pub fn add_efi(&self) -> Result<Registration, SbError> {
        self.audited(Operation::AddEfi, |state| self.do_add_efi(state))
    }

    /// Enroll the variables. A failed write is returned as
    /// [`SbError::EnrollmentFailed`] after the outcome has been recorded.
    pub fn enroll_keys(&self) -> Result<EnrollmentReport, SbError> {
        self.audited(Operation::EnrollKeys, |state| {
            let report = self.do_enroll_keys(state)?;
            match report.error() {
                Some(err) => Err(err),
                None => Ok(report),
            }
        })
    }

    pub fn generate_snapshots(&self) -> Result<PathBuf, SbError> {
        let result = snapshots::write_snapshot_manifest(self.tools.snapshots.as_ref(), &self.config);
        if let Err(e) = &result {
            audit::log_operation_failed(Operation::GenerateSnapshots.as_str(), e);
        }
        result
    }

    /// generate-keys, generate-efi, add-efi and enroll-keys in a row.
    ///
    /// A failed enrollment does not fail the setup: it is logged and left in
    /// the report so the caller can tell the operator to re-run
    /// `enroll-keys`.
    pub fn initial_setup(&self) -> Result<SetupReport, SbError> {
        self.audited(Operation::InitialSetup, |state| {
            let trust = self.do_generate_keys(state)?;
            let staged = self.do_generate_efi(state)?;
            let registration = self.do_add_efi(state)?;
            let enrollment = self.do_enroll_keys(state)?;
            if let Some(err) = enrollment.error() {
                log::warn!("{}; keys, images and boot entry are in place, run `enroll-keys` to retry", err);
            }
            Ok(SetupReport {
                guid: trust.guid(),
                staged,
                registration,
                enrollment,
            })
        })
    }

    /// Recorded state and the stage it amounts to given the files on disk.
    pub fn status(&self) -> Result<StatusReport, SbError> {
        let state = self.storage.load_state()?;
        let (stage, trust_problem) = match TrustStore::load(&self.config.key_dir) {
            Err(e) => {
                let problem = TrustStore::is_populated(&self.config.key_dir)?.then(|| e.to_string());
                (LifecycleStage::NoKeys, problem)
            }
            Ok(trust) => {
                let problem = trust.verify().err().map(|e| e.to_string());
                (self.effective_stage(&state, &trust), problem)
            }
        };
        Ok(StatusReport {
            stage,
            state,
            trust_problem,
        })
    }

    // ========================================================================
    // Steps
    // ========================================================================

    fn do_generate_keys(&self, state: &mut LifecycleState) -> Result<TrustStore, SbError> {
        let key_dir = &self.config.key_dir;
        if TrustStore::is_complete(key_dir) {
            return Err(SbError::AlreadyExists(key_dir.clone()));
        }
        if TrustStore::is_populated(key_dir)? {
            log::warn!(
                "'{}' holds an incomplete key hierarchy, replacing it",
                key_dir.display()
            );
        }
        let trust = KeyHierarchyGenerator::new(
            self.tools.cert_authority.as_ref(),
            self.tools.sig_tool.as_ref(),
        )
        .generate(key_dir)?;
        trust.verify()?;

        state.record_keys(trust.guid(), trust.dir());
        self.storage.save_state(state)?;
        log::info!("Key hierarchy {} generated in '{}'", trust.guid(), key_dir.display());
        Ok(trust)
    }

    fn do_generate_efi(&self, state: &mut LifecycleState) -> Result<StagedArtifacts, SbError> {
        let trust = self.require_keys(state)?;
        trust.verify()?;

        let build = ArtifactBuilder::new(self.tools.pe_editor.as_ref(), &self.config).build()?;
        let staged = ArtifactSigner::new(self.tools.signer.as_ref(), &self.config)
            .sign_and_stage(&build, &trust)?;

        state.record_artifacts(
            trust.guid(),
            staged.artifacts.clone(),
            staged.rescue_script.clone(),
        );
        self.storage.save_state(state)?;
        Ok(staged)
    }

    fn do_add_efi(&self, state: &mut LifecycleState) -> Result<Registration, SbError> {
        let trust = self.require_keys(state)?;
        self.require_signed_main(state, &trust)?;

        let registration =
            BootEntryManager::new(self.tools.boot_mgr.as_ref(), &self.config).register_entry()?;

        state.record_boot_entry(registration.entry.clone());
        self.storage.save_state(state)?;
        Ok(registration)
    }

    /// Runs the writes and records their outcome; only errors that prevent
    /// enrollment from starting are returned as `Err`.
    fn do_enroll_keys(&self, state: &mut LifecycleState) -> Result<EnrollmentReport, SbError> {
        let trust = self.require_keys(state)?;
        trust.verify()?;
        if !self.signed_main_present(state, &trust) {
            log::warn!(
                "No image signed by this hierarchy is installed; the system may not boot once PK is set"
            );
        }

        BootEntryManager::new(self.tools.boot_mgr.as_ref(), &self.config).ensure_varfs_writable()?;
        let report = VariableEnroller::new(self.tools.variables.as_ref()).enroll(&trust, state);
        self.storage.save_state(state)?;
        Ok(report)
    }

    // ========================================================================
    // Preconditions
    // ========================================================================

    /// Load the hierarchy, adopting it into the state if it was not recorded.
    fn require_keys(&self, state: &mut LifecycleState) -> Result<TrustStore, SbError> {
        let key_dir = &self.config.key_dir;
        if !TrustStore::is_complete(key_dir) {
            return Err(SbError::PreconditionError {
                stage: "Key generation",
                remedy: "generate-keys",
            });
        }
        let trust = TrustStore::load(key_dir)?;

        let recorded = state
            .keys
            .as_ref()
            .is_some_and(|k| k.guid == trust.guid() && k.key_dir == *key_dir);
        if !recorded {
            log::warn!(
                "Key hierarchy {} in '{}' is not recorded in the state, adopting it",
                trust.guid(),
                key_dir.display()
            );
            state.record_keys(trust.guid(), key_dir);
            self.storage.save_state(state)?;
        }
        Ok(trust)
    }

    fn signed_main_present(&self, state: &LifecycleState, trust: &TrustStore) -> bool {
        self.config.main_artifact_path().is_file()
            && state
                .artifacts
                .as_ref()
                .is_some_and(|a| a.guid == trust.guid())
    }

    /// The main image must be installed and signed by `trust`.
    fn require_signed_main(
        &self,
        state: &mut LifecycleState,
        trust: &TrustStore,
    ) -> Result<(), SbError> {
        let main = self.config.main_artifact_path();
        let not_signed = SbError::PreconditionError {
            stage: "Signed artifact generation",
            remedy: "generate-efi",
        };
        if !main.is_file() {
            return Err(not_signed);
        }
        match &state.artifacts {
            Some(record) if record.guid == trust.guid() => Ok(()),
            Some(record) => {
                log::error!(
                    "Installed images were signed by hierarchy {}, current is {}",
                    record.guid,
                    trust.guid()
                );
                Err(not_signed)
            }
            None => {
                log::warn!(
                    "Signed image '{}' is not recorded in the state, adopting it",
                    main.display()
                );
                state.record_artifacts(
                    trust.guid(),
                    vec![SignedArtifact {
                        kind: ArtifactKind::Main,
                        file_path: main,
                    }],
                    self.config.rescue_script_path(),
                );
                self.storage.save_state(state)
            }
        }
    }

    fn effective_stage(&self, state: &LifecycleState, trust: &TrustStore) -> LifecycleStage {
        let recorded = match &state.keys {
            Some(keys) if keys.guid == trust.guid() => state.recorded_stage(),
            _ => LifecycleStage::KeysGenerated,
        };
        match recorded {
            LifecycleStage::ArtifactsSigned | LifecycleStage::BootEntryRegistered
                if !self.config.main_artifact_path().is_file() =>
            {
                LifecycleStage::KeysGenerated
            }
            LifecycleStage::NoKeys => LifecycleStage::KeysGenerated,
            stage => stage,
        }
    }

    fn audited<T>(
        &self,
        operation: Operation,
        f: impl FnOnce(&mut LifecycleState) -> Result<T, SbError>,
    ) -> Result<T, SbError> {
        log::info!("Running {}", operation);
        let result = self.storage.load_state().and_then(|mut state| f(&mut state));
        if let Err(e) = &result {
            audit::log_operation_failed(operation.as_str(), e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names() {
        for op in Operation::ALL {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
        assert!(matches!(
            "rotate-keys".parse::<Operation>(),
            Err(SbError::UsageError(_))
        ));
    }

    #[test]
    fn test_status_display() {
        let report = StatusReport {
            stage: LifecycleStage::NoKeys,
            state: LifecycleState::default(),
            trust_problem: None,
        };
        assert_eq!(report.to_string(), "Stage: no keys\n");
    }
}
