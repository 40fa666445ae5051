use std::path::PathBuf;

/// The sbkit error type.
#[derive(Debug, thiserror::Error)]
pub enum SbError {
    #[error("Internal error: [{0}]")]
    InternalError(String),

    #[error("I/O error")]
    IOError(#[from] std::io::Error),

    #[error("UTF-8 error")]
    UTF8Error(#[from] std::string::FromUtf8Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Usage error: {0}")]
    UsageError(&'static str),

    // Rejected before any side effect
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("{stage} has not been done yet, run `{remedy}` first")]
    PreconditionError {
        stage: &'static str,
        remedy: &'static str,
    },

    #[error("Key hierarchy already exists in '{0}'")]
    AlreadyExists(PathBuf),

    #[error("Missing {what}: '{path}'")]
    Missing { what: &'static str, path: PathBuf },

    #[error("Command failed ({status}): {command}\n{stderr}")]
    ToolFailure {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("EFI variable filesystem is unavailable: {0}")]
    VarFsUnavailable(String),

    #[error("Enrollment of {variable} failed: {message}")]
    EnrollmentFailed {
        variable: &'static str,
        message: String,
    },

    #[error("Section {section} at {address:#x} overlaps the next section ({size} bytes)")]
    SectionOverlap {
        section: &'static str,
        address: u64,
        size: u64,
    },

    #[error("Invalid EFI signature list: {0}")]
    InvalidSignatureList(String),

    #[error("Trust store is inconsistent: {0}")]
    InconsistentTrustStore(String),

    #[error("X509 error: {0}")]
    X509Error(String),
}

impl From<x509_parser::nom::Err<x509_parser::error::X509Error>> for SbError {
    fn from(err: x509_parser::nom::Err<x509_parser::error::X509Error>) -> Self {
        SbError::X509Error(format!("{:?}", err))
    }
}

impl From<x509_parser::nom::Err<x509_parser::error::PEMError>> for SbError {
    fn from(err: x509_parser::nom::Err<x509_parser::error::PEMError>) -> Self {
        SbError::X509Error(format!("{:?}", err))
    }
}

impl SbError {
    /// Short machine-friendly name used in audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            SbError::InternalError(_) => "internal",
            SbError::IOError(_) | SbError::UTF8Error(_) | SbError::JsonError(_) => "io",
            SbError::UsageError(_) => "usage",
            SbError::ConfigurationError(_) => "configuration",
            SbError::PreconditionError { .. } | SbError::AlreadyExists(_) => "precondition",
            SbError::Missing { .. } => "missing",
            SbError::ToolFailure { .. } => "tool",
            SbError::VarFsUnavailable(_) => "varfs",
            SbError::EnrollmentFailed { .. } => "enrollment",
            SbError::SectionOverlap { .. } => "layout",
            SbError::InvalidSignatureList(_)
            | SbError::InconsistentTrustStore(_)
            | SbError::X509Error(_) => "trust",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SbError::PreconditionError {
            stage: "Key generation",
            remedy: "generate-keys",
        };
        assert_eq!(
            err.to_string(),
            "Key generation has not been done yet, run `generate-keys` first"
        );

        let err = SbError::Missing {
            what: "kernel image",
            path: PathBuf::from("/boot/vmlinuz-linux"),
        };
        assert_eq!(err.to_string(), "Missing kernel image: '/boot/vmlinuz-linux'");

        let err = SbError::AlreadyExists(PathBuf::from("/etc/secure-boot"));
        assert_eq!(
            err.to_string(),
            "Key hierarchy already exists in '/etc/secure-boot'"
        );
    }

    #[test]
    fn test_tool_failure_carries_command_line() {
        let err = SbError::ToolFailure {
            command: "sbsign --key db.key --cert db.crt --output a.signed a".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "Can't load key".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sbsign --key db.key"));
        assert!(msg.contains("Can't load key"));
        assert_eq!(err.kind(), "tool");
    }

    #[test]
    fn test_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SbError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn test_section_overlap_display() {
        let err = SbError::SectionOverlap {
            section: ".linux",
            address: 0x2000000,
            size: 20_000_000,
        };
        assert!(err.to_string().contains("0x2000000"));
    }
}
