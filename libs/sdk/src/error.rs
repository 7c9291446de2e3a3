//! Error types returned by job server clients and spawn drivers.

use thiserror::Error;

/// Errors returned by a job server client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobServerError {
    /// The resource is already taken (job booked, model booked by another hatchery).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The job server answered with an unexpected status.
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// The request never got an answer.
    #[error("transport error: {0}")]
    Transport(String),

    /// The answer could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl JobServerError {
    /// Returns true if the call lost a race against another hatchery.
    pub fn is_conflict(&self) -> bool {
        matches!(self, JobServerError::Conflict(_))
    }
}

impl From<serde_json::Error> for JobServerError {
    fn from(err: serde_json::Error) -> Self {
        JobServerError::Decode(err.to_string())
    }
}

/// Errors returned by a spawn driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The backend refused or failed to create the instance.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// The backend failed to destroy the instance.
    #[error("kill failed: {0}")]
    Kill(String),

    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
