//! Error taxonomy of the session core.
//!
//! Validation failures, lock contention and execution failures are distinct
//! conditions so callers can tell a bad request from a busy session from a
//! failed command. Nothing in this crate retries automatically; every failure
//! is terminal for its attempt.

use thiserror::Error;
use uuid::Uuid;

use crate::compute::ComputeError;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed or cross-inconsistent definition/configuration input, or an
    /// unknown parameter/group/result name.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The session is exclusively held by another operation. Callers may
    /// wait and retry or abort; the session itself is intact.
    #[error("session '{0}' is locked by another operation")]
    Locked(Uuid),

    /// No usable session exists for the id: the snapshot is missing,
    /// unreadable, or its compute resource is gone.
    #[error("invalid session '{id}': {reason}")]
    InvalidSession { id: Uuid, reason: String },

    /// A command was issued in a state that does not allow it, or an
    /// execution finished in a failure state.
    #[error("{0}")]
    UnexpectedState(String),

    /// A declared result was requested before its preconditions hold.
    #[error("{0}")]
    ResultNotAvailable(String),

    /// A file parameter could not be staged; the parameter is named so the
    /// caller knows what to fix or upload.
    #[error("file for parameter '{parameter}' could not be staged: {reason}")]
    FileStaging { parameter: String, reason: String },

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot serialization failed: {0}")]
    Snapshot(#[from] serde_json::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;
