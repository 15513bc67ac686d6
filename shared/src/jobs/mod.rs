//! Job control: lifecycle state machine, wire protocol, transport, and
//! the query engine orchestrating provider fan-out.
//!
//! A job is one in-flight query. It begins `Running` at dispatch time and
//! terminates exactly once into `Completed`, `Failed` or `Canceled`; no
//! batch notifications are valid after termination.

pub mod engine;
pub mod protocol;
pub mod transport;

pub use engine::{EngineError, QueryEngine, QueryOutput, QueryRequest};
pub use transport::{JobEvent, Transport, TransportError};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle status of a query job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// The job is executing.
    Running,
    /// The job finished and delivered its full result.
    Completed,
    /// The job aborted on an error.
    Failed,
    /// The job was canceled by the caller.
    Canceled,
}

impl JobStatus {
    /// Whether the status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// Errors from job table operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    /// No job with the given id exists.
    #[error("job {0} not found")]
    NotFound(Uuid),

    /// The job already reached a terminal status.
    #[error("job {id} already terminal ({status})")]
    AlreadyTerminal {
        /// The job id.
        id: Uuid,
        /// The terminal status it already holds.
        status: JobStatus,
    },
}

/// One in-flight query with its shared cancellation signal.
#[derive(Debug, Clone)]
pub struct QueryJob {
    /// Unique job id, used to correlate notifications.
    pub id: Uuid,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Cancellation signal shared with every provider task of the job.
    pub cancel: CancellationToken,
}

impl QueryJob {
    /// Creates a running job with a fresh id and token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Running,
            cancel: CancellationToken::new(),
        }
    }
}

impl Default for QueryJob {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks jobs for one connection.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: HashMap<Uuid, QueryJob>,
}

impl JobTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new running job and returns it.
    pub fn create(&mut self) -> QueryJob {
        let job = QueryJob::new();
        self.jobs.insert(job.id, job.clone());
        job
    }

    /// Returns the current status of a job.
    #[must_use]
    pub fn status(&self, id: Uuid) -> Option<JobStatus> {
        self.jobs.get(&id).map(|job| job.status)
    }

    /// Fires a job's cancellation token.
    ///
    /// Canceling a terminal job is a no-op; the status transition itself
    /// happens when the job's tasks wind down.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] for unknown ids.
    pub fn cancel(&mut self, id: Uuid) -> Result<(), JobError> {
        let job = self.jobs.get(&id).ok_or(JobError::NotFound(id))?;
        if !job.status.is_terminal() {
            job.cancel.cancel();
        }
        Ok(())
    }

    /// Moves a job into a terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] for unknown ids and
    /// [`JobError::AlreadyTerminal`] when the job already terminated; a
    /// job terminates exactly once.
    pub fn finish(&mut self, id: Uuid, status: JobStatus) -> Result<(), JobError> {
        let job = self.jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        if job.status.is_terminal() {
            return Err(JobError::AlreadyTerminal {
                id,
                status: job.status,
            });
        }
        job.status = status;
        Ok(())
    }
}
