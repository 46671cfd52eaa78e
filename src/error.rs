//! Error types for claimboard operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::{SessionId, TaskId};

/// Every failure a coordination call can report.
///
/// Claim races are expected: [`Error::TaskAlreadyClaimed`] is a normal outcome
/// and the caller should pick another task.
#[derive(Debug, Error)]
pub enum Error {
    #[error("task '{0}' not found")]
    TaskNotFound(TaskId),

    #[error("session '{0}' not found")]
    SessionNotFound(SessionId),

    #[error("invalid transition for {subject}: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("task '{task}' is already claimed by '{holder}'")]
    TaskAlreadyClaimed { task: TaskId, holder: SessionId },

    #[error("id '{0}' already exists")]
    DuplicateId(String),

    #[error("session id '{0}' is already live")]
    DuplicateSessionId(SessionId),

    #[error("session '{0}' holds no claim")]
    NoActiveClaim(SessionId),

    #[error("session '{session}' is {status}, not active")]
    SessionNotActive {
        session: SessionId,
        status: &'static str,
    },

    #[error("session '{session}' already holds task '{task}'")]
    SessionBusy { session: SessionId, task: TaskId },

    #[error("task '{task}' is held by live session '{owner}'")]
    OwnerStillLive { task: TaskId, owner: SessionId },

    #[error("{0}")]
    InvalidName(String),

    #[error("store unavailable: {context}")]
    StoreUnavailable {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to load {}: {message}", path.display())]
    Config { path: PathBuf, message: String },

    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Error {
    pub fn store<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::StoreUnavailable {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// True for the outcome of losing a claim race.
    pub fn is_claim_conflict(&self) -> bool {
        matches!(self, Self::TaskAlreadyClaimed { .. })
    }
}

/// Attach a description of the failed store access to a lower-level error.
pub(crate) trait StoreContext<T> {
    fn store_context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T, E> StoreContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn store_context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| Error::store(context(), e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
