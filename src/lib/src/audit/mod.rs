//! Audit logging for Secure Boot lifecycle operations.
//!
//! Security-relevant state changes (key generation, image signing, firmware
//! variable writes, boot entry registration) are emitted as structured
//! `tracing` events under the `sbkit::audit` target. Nothing is recorded
//! until [`init`] installs a subscriber; the CLI does so when `--audit` is
//! given.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sbkit::audit::{self, AuditSink};
//!
//! audit::init(AuditSink::File("/var/log/secure-boot-audit.json".into()))?;
//! ```
//!
//! # Event Types
//!
//! - `key.generated` - a PK/KEK/db key pair and its variable payloads were written
//! - `artifact.signed` - an EFI image was signed with the db key
//! - `boot_entry.created` / `boot_entry.reused` - firmware boot entry registered
//! - `variable.enrolled` / `variable.failed` - a Secure Boot variable write
//! - `operation.failed` - a lifecycle operation aborted
//!
//! # JSON Output Example
//!
//! ```json
//! {
//!   "timestamp": "2026-10-19T08:00:00Z",
//!   "level": "INFO",
//!   "target": "sbkit::audit",
//!   "fields": {
//!     "event_type": "variable.enrolled",
//!     "variable": "db",
//!     "mode": "authenticated append",
//!     "message": "Secure Boot variable written"
//!   }
//! }
//! ```

use crate::error::SbError;
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{fmt, fmt::writer::BoxMakeWriter, prelude::*, EnvFilter};
use uuid::Uuid;

/// Where audit events go; always one JSON object per line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuditSink {
    #[default]
    Stderr,
    /// Appended to, created if absent
    File(PathBuf),
}

/// Install the audit subscriber. Fails if a global subscriber is already set.
pub fn init(sink: AuditSink) -> Result<(), SbError> {
    let writer = match sink {
        AuditSink::Stderr => BoxMakeWriter::new(std::io::stderr),
        AuditSink::File(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
    };
    tracing_subscriber::registry()
        .with(EnvFilter::new("sbkit::audit=info"))
        .with(fmt::layer().json().with_target(true).with_writer(writer))
        .try_init()
        .map_err(subscriber_error)
}

/// `sha256:<hex>` of a file, or `n/a` if it cannot be read.
pub fn file_digest(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(content) => format!("sha256:{}", hex::encode(Sha256::digest(&content))),
        Err(_) => "n/a".to_string(),
    }
}

// ============================================================================
// Audit Event Functions
// ============================================================================

/// Log the creation of one level of the key hierarchy.
pub fn log_key_generated(key: &str, guid: &Uuid, certificate: &Path) {
    tracing::info!(
        target: "sbkit::audit",
        event_type = "key.generated",
        key = key,
        guid = %guid,
        certificate = %certificate.display(),
        certificate_digest = %file_digest(certificate),
        "Secure Boot key generated"
    );
}

/// Log a signed EFI image.
pub fn log_artifact_signed(kind: &str, output: &Path) {
    tracing::info!(
        target: "sbkit::audit",
        event_type = "artifact.signed",
        kind = kind,
        path = %output.display(),
        digest = %file_digest(output),
        "EFI image signed with db key"
    );
}

/// Log a firmware boot entry registration.
pub fn log_boot_entry(label: &str, loader: &str, reused: bool) {
    let event_type = if reused {
        "boot_entry.reused"
    } else {
        "boot_entry.created"
    };
    tracing::info!(
        target: "sbkit::audit",
        event_type = event_type,
        label = label,
        loader = loader,
        "Firmware boot entry registered"
    );
}

/// Log a successful Secure Boot variable write.
pub fn log_variable_enrolled(variable: &str, mode: &str) {
    tracing::info!(
        target: "sbkit::audit",
        event_type = "variable.enrolled",
        variable = variable,
        mode = mode,
        "Secure Boot variable written"
    );
}

/// Log a failed Secure Boot variable write.
pub fn log_variable_failed(variable: &str, error_message: &str) {
    tracing::warn!(
        target: "sbkit::audit",
        event_type = "variable.failed",
        variable = variable,
        error_message = %sanitize_error_message(error_message),
        "Secure Boot variable write failed"
    );
}

/// Log an aborted lifecycle operation.
pub fn log_operation_failed(operation: &str, error: &SbError) {
    tracing::warn!(
        target: "sbkit::audit",
        event_type = "operation.failed",
        operation = operation,
        error_type = error.kind(),
        error_message = %sanitize_error_message(&error.to_string()),
        "Lifecycle operation failed"
    );
}

// ============================================================================
// Helper Functions
// ============================================================================

fn subscriber_error(err: tracing_subscriber::util::TryInitError) -> SbError {
    SbError::InternalError(format!("Cannot install audit subscriber: {}", err))
}

/// Collapse whitespace and truncate tool output embedded in error messages.
fn sanitize_error_message(message: &str) -> String {
    let sanitized = message.split_whitespace().collect::<Vec<_>>().join(" ");

    if sanitized.len() > 500 {
        let mut end = 497;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &sanitized[..end])
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_error_message() {
        assert_eq!(
            sanitize_error_message("Command failed\n  efi-updatevar: Operation not permitted"),
            "Command failed efi-updatevar: Operation not permitted"
        );

        let long = "x ".repeat(400);
        let sanitized = sanitize_error_message(&long);
        assert_eq!(sanitized.len(), 500);
        assert!(sanitized.ends_with("..."));
    }

    #[test]
    fn test_file_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.efi");
        std::fs::write(&path, b"").unwrap();

        assert_eq!(
            file_digest(&path),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(file_digest(&dir.path().join("missing")), "n/a");
    }

    #[test]
    fn test_events_without_subscriber() {
        log_boot_entry("secure-boot-linux", "\\EFI\\arch\\secure-boot-linux.efi", false);
        log_variable_failed("PK", "simulated");
        log_operation_failed("enroll-keys", &SbError::UsageError("test"));
    }

    #[test]
    fn test_file_sink_receives_json_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json");

        init(AuditSink::File(path.clone())).unwrap();
        log_variable_enrolled("db", "authenticated append");
        assert!(init(AuditSink::Stderr).is_err());

        let content = std::fs::read_to_string(&path).unwrap();
        let event = content
            .lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
            .find(|event| event["fields"]["event_type"] == "variable.enrolled")
            .unwrap();
        assert_eq!(event["target"], "sbkit::audit");
        assert_eq!(event["fields"]["variable"], "db");
    }
}
