//! Engine error types.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use convoy_election::ElectionError;
use convoy_state::StateError;

use crate::resources::ResourceError;

/// One rejected field of a submitted spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// JSON-pointer-like location, e.g. `/secrets/secret1`.
    pub path: String,
    pub errors: Vec<String>,
}

/// A spec that cannot be accepted as submitted. Carries every violation
/// found, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub message: String,
    pub details: Vec<FieldError>,
}

impl ValidationError {
    pub fn new(details: Vec<FieldError>) -> Self {
        Self {
            message: "Object is not valid".to_string(),
            details,
        }
    }

    /// A single-field violation.
    pub fn field(path: impl Into<String>, error: impl Into<String>) -> Self {
        Self::new(vec![FieldError {
            path: path.into(),
            errors: vec![error.into()],
        }])
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        for detail in &self.details {
            write!(f, "; {}: {}", detail.path, detail.errors.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Errors that can occur in the deployment engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Client-correctable; nothing was written.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// This replica may no longer write. Never retried locally.
    #[error("leadership lost: {0}")]
    LeadershipLost(String),

    #[error("resource manager error: {0}")]
    Resource(#[from] ResourceError),

    #[error("state store error: {0}")]
    State(StateError),
}

impl From<StateError> for EngineError {
    fn from(e: StateError) -> Self {
        if e.is_fenced() {
            Self::LeadershipLost(e.to_string())
        } else {
            Self::State(e)
        }
    }
}

impl From<ElectionError> for EngineError {
    fn from(e: ElectionError) -> Self {
        match e {
            ElectionError::State(e) => e.into(),
            other => Self::LeadershipLost(other.to_string()),
        }
    }
}

impl EngineError {
    pub fn is_leadership_lost(&self) -> bool {
        matches!(self, Self::LeadershipLost(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
