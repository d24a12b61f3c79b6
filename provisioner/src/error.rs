//! Orchestration-level error taxonomy.
//!
//! Shell-level failures surface as `std::io::Error` and are classified here
//! at the orchestration boundary. Every variant maps to exit code 1; the
//! caller is responsible for printing a concrete next action.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Bad or missing input, detected before any resource is created.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A Fleet Provider call failed; a resource may or may not exist.
    #[error("provider call failed: {0}")]
    Provider(#[source] io::Error),

    /// Monitoring exhausted its budget without a definitive answer.
    #[error("verification timed out: {0}")]
    VerificationTimeout(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl OrchestratorError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
