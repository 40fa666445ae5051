//! Secure Boot variable enrollment
//!
//! db and KEK are appended with their authenticated payloads, then PK is
//! written from its plain signature list. Writing PK takes the platform out
//! of setup mode, so it is only attempted once db and KEK are in place.

use crate::audit;
use crate::error::SbError;
use crate::state::LifecycleState;
use crate::tools::{VariableStore, WriteMode};
use crate::trust::{KeyName, TrustStore};
use std::fmt;

/// Result for one variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableOutcome {
    Enrolled,
    /// Already enrolled from the same hierarchy by an earlier run
    AlreadyEnrolled,
    Failed(String),
    /// Not attempted because an earlier variable failed
    NotAttempted,
}

impl fmt::Display for VariableOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableOutcome::Enrolled => write!(f, "enrolled"),
            VariableOutcome::AlreadyEnrolled => write!(f, "already enrolled"),
            VariableOutcome::Failed(msg) => write!(f, "failed: {}", msg),
            VariableOutcome::NotAttempted => write!(f, "not attempted"),
        }
    }
}

/// Per-variable outcomes, in enrollment order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnrollmentReport {
    pub outcomes: Vec<(KeyName, VariableOutcome)>,
}

impl EnrollmentReport {
    pub fn outcome(&self, name: KeyName) -> Option<&VariableOutcome> {
        self.outcomes
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, o)| o)
    }

    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|(_, o)| {
            matches!(o, VariableOutcome::Enrolled | VariableOutcome::AlreadyEnrolled)
        })
    }

    /// The first failure as an error.
    pub fn error(&self) -> Option<SbError> {
        self.outcomes.iter().find_map(|(name, outcome)| match outcome {
            VariableOutcome::Failed(message) => Some(SbError::EnrollmentFailed {
                variable: name.as_str(),
                message: message.clone(),
            }),
            _ => None,
        })
    }
}

pub struct VariableEnroller<'a> {
    variables: &'a dyn VariableStore,
}

impl<'a> VariableEnroller<'a> {
    pub fn new(variables: &'a dyn VariableStore) -> Self {
        Self { variables }
    }

    /// Write db, KEK and PK, recording each outcome into `state`.
    ///
    /// Stops at the first failed write; the returned report is complete in
    /// either case. Variables `state` records as enrolled from this
    /// hierarchy are skipped.
    pub fn enroll(&self, trust: &TrustStore, state: &mut LifecycleState) -> EnrollmentReport {
        let guid = trust.guid();
        let mut report = EnrollmentReport::default();
        let mut failed = false;

        for name in KeyName::ENROLLMENT_ORDER {
            if failed {
                report.outcomes.push((name, VariableOutcome::NotAttempted));
                continue;
            }
            if state.is_enrolled(name, guid) {
                log::info!("{} already enrolled, skipping", name);
                report.outcomes.push((name, VariableOutcome::AlreadyEnrolled));
                continue;
            }

            let files = trust.files(name);
            let (payload, mode) = match name {
                KeyName::PK => (files.signature_list, WriteMode::Unauthenticated),
                KeyName::KEK | KeyName::Db => (files.auth_payload, WriteMode::AuthenticatedAppend),
            };

            log::info!("Enrolling {} ({})", name, mode);
            match self.variables.write(name.as_str(), &payload, mode) {
                Ok(()) => {
                    state.record_enrolled(name, guid);
                    audit::log_variable_enrolled(name.as_str(), &mode.to_string());
                    report.outcomes.push((name, VariableOutcome::Enrolled));
                }
                Err(e) => {
                    let message = e.to_string();
                    log::error!("Enrolling {} failed: {}", name, message);
                    state.record_enrollment_failure(name, message.clone());
                    audit::log_variable_failed(name.as_str(), &message);
                    report.outcomes.push((name, VariableOutcome::Failed(message)));
                    failed = true;
                }
            }
        }
        report
    }
}
