//! Persisted lifecycle state
//!
//! The lifecycle records what each operation achieved in a small JSON
//! document (default `/var/lib/secure-boot/state.json`). Preconditions are
//! checked against this record and against the files it names, so a stage
//! whose files have disappeared counts as not done.

use crate::artifact::SignedArtifact;
use crate::boot_entry::BootEntry;
use crate::error::SbError;
use crate::trust::KeyName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const STATE_VERSION: u32 = 1;

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Position in the lifecycle, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    NoKeys,
    KeysGenerated,
    ArtifactsSigned,
    BootEntryRegistered,
    Enrolled,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleStage::NoKeys => "no keys",
            LifecycleStage::KeysGenerated => "keys generated",
            LifecycleStage::ArtifactsSigned => "artifacts signed",
            LifecycleStage::BootEntryRegistered => "boot entry registered",
            LifecycleStage::Enrolled => "enrolled",
        };
        f.write_str(s)
    }
}

/// Key hierarchy record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysRecord {
    pub guid: Uuid,
    pub key_dir: PathBuf,
    pub generated_at: u64,
}

/// Staged artifacts record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactsRecord {
    /// GUID of the hierarchy whose db key signed the artifacts
    pub guid: Uuid,
    pub artifacts: Vec<SignedArtifact>,
    pub rescue_script: PathBuf,
    pub signed_at: u64,
}

/// Boot entry record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootEntryRecord {
    pub entry: BootEntry,
    pub registered_at: u64,
}

/// Outcome of the last write of one variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Enrolled { guid: Uuid, at: u64 },
    Failed { message: String, at: u64 },
}

/// The persisted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleState {
    pub version: u32,

    #[serde(default)]
    pub keys: Option<KeysRecord>,

    #[serde(default)]
    pub artifacts: Option<ArtifactsRecord>,

    #[serde(default)]
    pub boot_entry: Option<BootEntryRecord>,

    #[serde(default)]
    pub enrollment: BTreeMap<KeyName, EnrollmentStatus>,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            keys: None,
            artifacts: None,
            boot_entry: None,
            enrollment: BTreeMap::new(),
        }
    }
}

impl LifecycleState {
    /// Record the current hierarchy. Enrollment results of a different
    /// hierarchy are dropped; the artifacts record is kept since it names the
    /// GUID that signed it.
    pub fn record_keys(&mut self, guid: Uuid, key_dir: &Path) {
        if self.keys.as_ref().is_some_and(|k| k.guid != guid) {
            self.enrollment.clear();
        }
        self.keys = Some(KeysRecord {
            guid,
            key_dir: key_dir.to_path_buf(),
            generated_at: unix_now(),
        });
    }

    pub fn record_artifacts(
        &mut self,
        guid: Uuid,
        artifacts: Vec<SignedArtifact>,
        rescue_script: PathBuf,
    ) {
        self.artifacts = Some(ArtifactsRecord {
            guid,
            artifacts,
            rescue_script,
            signed_at: unix_now(),
        });
    }

    pub fn record_boot_entry(&mut self, entry: BootEntry) {
        self.boot_entry = Some(BootEntryRecord {
            entry,
            registered_at: unix_now(),
        });
    }

    pub fn record_enrolled(&mut self, name: KeyName, guid: Uuid) {
        self.enrollment.insert(
            name,
            EnrollmentStatus::Enrolled {
                guid,
                at: unix_now(),
            },
        );
    }

    pub fn record_enrollment_failure(&mut self, name: KeyName, message: String) {
        self.enrollment.insert(
            name,
            EnrollmentStatus::Failed {
                message,
                at: unix_now(),
            },
        );
    }

    /// True if `name` was enrolled from the hierarchy `guid`.
    pub fn is_enrolled(&self, name: KeyName, guid: Uuid) -> bool {
        matches!(
            self.enrollment.get(&name),
            Some(EnrollmentStatus::Enrolled { guid: g, .. }) if *g == guid
        )
    }

    /// Furthest stage reached according to the record alone.
    pub fn recorded_stage(&self) -> LifecycleStage {
        let Some(keys) = &self.keys else {
            return LifecycleStage::NoKeys;
        };
        if KeyName::ALL.iter().all(|k| self.is_enrolled(*k, keys.guid)) {
            return LifecycleStage::Enrolled;
        }
        match (&self.artifacts, &self.boot_entry) {
            (Some(a), Some(_)) if a.guid == keys.guid => LifecycleStage::BootEntryRegistered,
            (Some(a), _) if a.guid == keys.guid => LifecycleStage::ArtifactsSigned,
            _ => LifecycleStage::KeysGenerated,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, SbError> {
        serde_json::to_vec_pretty(self).map_err(|e| {
            SbError::InternalError(format!("Failed to serialize state: {}", e))
        })
    }

    pub fn from_json(data: &[u8]) -> Result<Self, SbError> {
        let state: Self = serde_json::from_slice(data).map_err(|e| {
            SbError::ConfigurationError(format!("Failed to parse state: {}", e))
        })?;
        if state.version != STATE_VERSION {
            return Err(SbError::ConfigurationError(format!(
                "unsupported state version {}",
                state.version
            )));
        }
        Ok(state)
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Where the lifecycle state lives.
pub trait StateStorage {
    /// Load the state; an absent document is the default state.
    fn load_state(&self) -> Result<LifecycleState, SbError>;

    fn save_state(&self, state: &LifecycleState) -> Result<(), SbError>;
}

/// JSON file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStorage for FileStorage {
    fn load_state(&self) -> Result<LifecycleState, SbError> {
        match fs::read(&self.path) {
            Ok(data) => LifecycleState::from_json(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LifecycleState::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_state(&self, state: &LifecycleState) -> Result<(), SbError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = OsString::from(self.path.as_os_str());
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, state.to_json()?)?;
        fs::rename(&tmp, &self.path)?;
        log::debug!("Saved state to '{}'", self.path.display());
        Ok(())
    }
}

/// In-memory storage for testing
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<Option<LifecycleState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: LifecycleState) -> Self {
        Self {
            state: RwLock::new(Some(state)),
        }
    }
}

impl StateStorage for MemoryStorage {
    fn load_state(&self) -> Result<LifecycleState, SbError> {
        self.state
            .read()
            .map_err(|_| SbError::InternalError("Lock poisoned".to_string()))
            .map(|s| s.clone().unwrap_or_default())
    }

    fn save_state(&self, state: &LifecycleState) -> Result<(), SbError> {
        let mut guard = self
            .state
            .write()
            .map_err(|_| SbError::InternalError("Lock poisoned".to_string()))?;
        *guard = Some(state.clone());
        Ok(())
    }
}
