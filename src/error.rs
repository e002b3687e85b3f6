//! Tagged error kinds for the orchestration core.
//!
//! Callers branch on the kind, never on message text: a contract denial, a
//! malformed oracle reply and a safety block all demand different recovery
//! paths (decline, mark-atomic, drop-action).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelosError {
    #[error("contract violation: {0}")]
    ContractViolation(String),
    #[error("depth limit reached: {0}")]
    DepthLimitReached(String),
    #[error("subgoal limit reached: {0}")]
    SubgoalLimitReached(String),
    #[error("unknown goal type: {0}")]
    UnknownGoalType(String),
    #[error("oracle failure: {0}")]
    OracleFailure(String),
    #[error("safety blocked: {0}")]
    SafetyBlocked(String),
    #[error("goal not found: {0}")]
    NotFound(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TelosError>;

impl TelosError {
    /// True when the failure is a rule saying "no", rather than the system
    /// breaking. Denials are reported to the caller; faults are propagated.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            TelosError::ContractViolation(_)
                | TelosError::DepthLimitReached(_)
                | TelosError::SubgoalLimitReached(_)
                | TelosError::SafetyBlocked(_)
        )
    }
}
