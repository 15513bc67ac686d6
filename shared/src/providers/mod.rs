//! Query provider contract and adapters.
//!
//! Every log source implements [`QueryProvider`]: enumerate its filterable
//! dimensions and run a time-bounded, cancellable query that delivers
//! batches of pre-sorted rows. Adapters exist for an in-memory baseline
//! ([`MemoryProvider`]), container logs via the docker CLI
//! ([`DockerProvider`]), and a paginated remote backend
//! ([`RemoteProvider`]).

pub mod docker;
pub mod memory;
pub mod remote;

pub use docker::DockerProvider;
pub use memory::MemoryProvider;
pub use remote::{HttpLogBackend, LogBackend, PageRequest, RemoteProvider};

use crate::models::Record;
use crate::query::Search;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Known dimension values per dimension name, used to populate filters.
pub type Dimensions = HashMap<String, BTreeSet<String>>;

/// Errors raised by a provider query.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The query's cancellation token fired mid-flight. Distinguished from
    /// the other variants so the job reports canceled rather than failed.
    #[error("query canceled")]
    Canceled,

    /// A source process could not be spawned.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        /// The command that failed to start.
        command: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A source process exited unsuccessfully.
    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// The exit status.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The remote log backend rejected or failed a request.
    #[error("log backend request failed: {0}")]
    Backend(String),

    /// Source output could not be interpreted at all.
    #[error("malformed source output: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Whether this error represents cancellation rather than failure.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// A flat dimension filter: restrict results to sources where `name`
/// equals `value`. Providers ignore filter names they have no semantics
/// for; a recognized filter that matches nothing yields zero rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionFilter {
    /// The dimension name (e.g. `container`).
    pub name: String,
    /// The required value.
    pub value: String,
}

impl DimensionFilter {
    /// Creates a filter.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Options for a single provider query.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Inclusive lower time bound.
    pub from: DateTime<Utc>,
    /// Inclusive upper time bound. Pagination loops shrink their own copy
    /// of this window between poll iterations.
    pub to: DateTime<Utc>,
    /// Maximum number of rows this provider should deliver.
    pub limit: usize,
    /// Shared per-job cancellation signal, observed at every suspension
    /// point and batch-producing loop iteration.
    pub cancel: CancellationToken,
    /// Sink for result batches, each sorted descending by sort key.
    pub batches: mpsc::UnboundedSender<Vec<Record>>,
}

impl QueryOptions {
    /// Delivers one batch of rows.
    ///
    /// A closed receiver means the job has already been torn down; the
    /// batch is dropped silently in that case.
    pub fn emit(&self, batch: Vec<Record>) {
        if batch.is_empty() {
            return;
        }
        if self.batches.send(batch).is_err() {
            tracing::debug!("batch receiver closed, dropping batch");
        }
    }
}

/// The interface each log source implements.
#[async_trait::async_trait]
pub trait QueryProvider: Send + Sync {
    /// A short name identifying the provider in logs and job output.
    fn name(&self) -> &str;

    /// Enumerates filterable dimensions and their known values.
    ///
    /// Must not fail: partial failure degrades to empty sets per
    /// dimension (logged as a warning by the adapter).
    async fn list_dimensions(&self) -> Dimensions;

    /// Runs a time-bounded, cancellable query.
    ///
    /// The provider may emit zero or more batches via
    /// [`QueryOptions::emit`] before returning, each sorted descending by
    /// time. It must stop producing work promptly once
    /// [`QueryOptions::cancel`] fires and surface
    /// [`ProviderError::Canceled`] when aborted mid-flight.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on provider-wide failure or cancellation;
    /// cheaply isolatable malformed units (a log line, a listing entry)
    /// are skipped with a warning instead.
    async fn query(
        &self,
        filters: &[DimensionFilter],
        search: &Search,
        options: QueryOptions,
    ) -> Result<(), ProviderError>;
}
