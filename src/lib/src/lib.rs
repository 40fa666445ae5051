//! UEFI Secure Boot lifecycle: key hierarchy, signed unified EFI images,
//! firmware boot entry and variable enrollment.

// External tools are reached through the traits in `tools`; `Lifecycle` is what most callers want.

#![forbid(unsafe_code)]

mod error;

/// Owner-only file handling for key material
pub mod secure_file;

/// External command invocation
///
/// Every external tool runs through a `CommandRunner`, which logs the full
/// command line and turns a non-zero exit into `SbError::ToolFailure`.
pub mod process;

/// `EFI_SIGNATURE_LIST` encoding and decoding
pub mod esl;

/// Runtime configuration: defaults, TOML file, environment
pub mod config;

/// Collaborator traits and their process-backed implementations
pub mod tools;

/// PK/KEK/db key hierarchy on disk
pub mod trust;

/// Unified EFI image assembly and signing
pub mod artifact;

pub mod boot_entry;
pub mod enroll;
pub mod snapshots;

/// Persisted lifecycle state
pub mod state;

/// Structured audit logging for security events
///
/// Emits JSON events for key generation, image signing, boot entry
/// registration and variable enrollment when enabled by the CLI.
pub mod audit;

pub mod lifecycle;

pub use error::*;

pub use artifact::{ArtifactKind, SignedArtifact, StagedArtifacts};
pub use boot_entry::{BootEntry, Registration};
pub use config::{BootConfiguration, ConfigFile, MicrocodeSelector, SystemPaths};
pub use enroll::{EnrollmentReport, VariableOutcome};
pub use lifecycle::{Lifecycle, Operation, SetupReport, StatusReport};
pub use state::{FileStorage, LifecycleStage, LifecycleState, MemoryStorage, StateStorage};
pub use tools::Toolset;
pub use trust::{KeyName, TrustStore};

pub mod reexports {
    pub use {log, thiserror, uuid};
}
