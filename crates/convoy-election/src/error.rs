//! Election error types.

use thiserror::Error;

/// Errors that can occur during leader election.
#[derive(Debug, Error)]
pub enum ElectionError {
    #[error("invalid election config: {0}")]
    Config(String),

    #[error("replica {0} is not the leader")]
    NotLeader(String),

    /// The lease was lost or could not be renewed before the deadline.
    /// Fatal to the current leader session.
    #[error("leadership lost: {0}")]
    LeadershipLost(String),

    #[error("state store error: {0}")]
    State(#[from] convoy_state::StateError),
}

impl ElectionError {
    pub fn is_leadership_lost(&self) -> bool {
        matches!(self, Self::LeadershipLost(_))
            || matches!(self, Self::State(e) if e.is_fenced())
    }
}

pub type ElectionResult<T> = Result<T, ElectionError>;
