use std::time::Duration;

use rustrecon_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("store error: {0}")]
    Db(#[from] DbError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("task join error: {0}")]
    Join(String),
}

/// Outcome of a dispatched action that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("{0}")]
    Failed(String),
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

/// A catalog trigger or requirement string that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("invalid trigger {raw:?}: {reason}")]
    Trigger { raw: String, reason: String },
    #[error("invalid requirement {raw:?}: {reason}")]
    Requirement { raw: String, reason: String },
}

impl ConditionError {
    pub(crate) fn trigger(raw: &str, reason: impl Into<String>) -> Self {
        ConditionError::Trigger {
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn requirement(raw: &str, reason: impl Into<String>) -> Self {
        ConditionError::Requirement {
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }
}
