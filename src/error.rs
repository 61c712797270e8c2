//! Error types for the fake-async scheduler.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the scheduler and its tooling.
#[derive(Debug, Error)]
pub enum Error {
    /// `run` was entered while a scheduler was already active on this thread.
    #[error("fake-async calls can not be nested")]
    Reentrancy,

    /// A scheduler operation was called outside of an active run.
    #[error("must be running in the fake-async context")]
    NotInScope,

    /// Timers were still pending when the run body returned.
    #[error("{}", unflushed_message(*.periodic, *.one_shot))]
    UnflushedTimers { periodic: usize, one_shot: usize },

    /// Negative delay, non-positive interval or clock regression.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `flush` fired more timers than its turn limit allows.
    #[error(
        "flush failed after reaching the limit of {limit} tasks. Does your code use a polling timeout?"
    )]
    FlushLimit { limit: usize },

    /// Ambient scheduling was attempted with no hooks installed on this thread.
    #[error("no scheduling hooks installed on this thread")]
    NoHooks,

    /// Malformed or inconsistent scenario script.
    #[error("scenario error: {0}")]
    Scenario(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn scenario(message: impl Into<String>) -> Self {
        Self::Scenario(message.into())
    }
}

fn unflushed_message(periodic: usize, one_shot: usize) -> String {
    match (periodic, one_shot) {
        (0, n) => format!("{n} timer(s) still in the queue."),
        (p, 0) => format!("{p} periodic timer(s) still in the queue."),
        (p, n) => format!(
            "{p} periodic timer(s) still in the queue. {n} timer(s) still in the queue."
        ),
    }
}
