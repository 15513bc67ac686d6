//! Query orchestration: fan a request out to every provider, merge the
//! sorted batches, then run the aggregation and ordering stages.

use crate::models::{HashableField, Record, RAW_COLUMN, TIME_COLUMN};
use crate::providers::{
    DimensionFilter, Dimensions, ProviderError, QueryOptions, QueryProvider,
};
use crate::query::{
    aggregate, bucket, merge_batches, order_by, AggregateError, AggregateSpec, OrderRule, Search,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use validator::{Validate, ValidationError};

use super::JobStatus;

/// Errors raised while executing a query.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The request failed validation before any provider ran.
    #[error("invalid query request: {0}")]
    InvalidRequest(#[from] validator::ValidationErrors),

    /// The aggregation stage rejected the merged rows.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// A provider failed mid-query.
    #[error("provider '{provider}' failed: {source}")]
    Provider {
        /// The provider that failed.
        provider: String,
        /// The underlying provider error.
        source: ProviderError,
    },

    /// The job's cancellation token fired before the query finished.
    #[error("query canceled")]
    Canceled,

    /// A provider task panicked.
    #[error("provider task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl EngineError {
    /// The terminal job status this error maps to.
    #[must_use]
    pub fn terminal_status(&self) -> JobStatus {
        match self {
            Self::Canceled => JobStatus::Canceled,
            _ => JobStatus::Failed,
        }
    }
}

/// Bucketing stage of a query: partition merged rows by a derived key
/// before aggregating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct BucketRequest {
    /// Output column the bucket key is written to.
    pub name: String,

    /// Bucket by flooring each row's time to this interval. Takes
    /// precedence over `column`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1))]
    pub interval_ms: Option<i64>,

    /// Bucket by this column's value instead of by time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
}

/// One query as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_window"))]
pub struct QueryRequest {
    /// The search predicate applied to each row's message.
    #[serde(default = "Search::any")]
    pub search: Search,

    /// Inclusive lower time bound.
    pub from: DateTime<Utc>,

    /// Inclusive upper time bound.
    pub to: DateTime<Utc>,

    /// Maximum number of merged rows.
    #[validate(range(min = 1))]
    pub limit: usize,

    /// Dimension filters passed to every provider.
    #[serde(default)]
    pub filters: Vec<DimensionFilter>,

    /// Aggregates to compute over the merged rows. Empty means the raw
    /// rows are returned.
    #[serde(default)]
    pub aggregates: Vec<AggregateSpec>,

    /// Grouping columns for the aggregation stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,

    /// Bucketing stage, applied instead of plain aggregation when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub bucket: Option<BucketRequest>,

    /// Ordering rules applied to the final rows.
    #[serde(default)]
    pub order_by: Vec<OrderRule>,
}

fn validate_window(request: &QueryRequest) -> Result<(), ValidationError> {
    if request.from > request.to {
        return Err(ValidationError::new("window").with_message("from is after to".into()));
    }
    Ok(())
}

/// The final result of a query run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    /// The result rows, post merge, aggregation and ordering.
    pub rows: Vec<Record>,

    /// The output columns.
    pub columns: Vec<String>,

    /// Grouping columns, when the query aggregated.
    pub group_by_columns: Vec<String>,

    /// Aggregated output columns, when the query aggregated.
    pub aggregated_columns: Vec<String>,
}

/// Executes queries against a set of providers.
pub struct QueryEngine {
    providers: Vec<Arc<dyn QueryProvider>>,
}

impl QueryEngine {
    /// Creates an engine with no providers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Adds a provider.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn QueryProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Merges the dimensions of every provider.
    pub async fn dimensions(&self) -> Dimensions {
        let mut merged = Dimensions::new();
        for provider in &self.providers {
            for (name, values) in provider.list_dimensions().await {
                merged.entry(name).or_default().extend(values);
            }
        }
        merged
    }

    /// Runs one query to completion.
    ///
    /// Every provider queries concurrently with a clone of `cancel`; their
    /// sorted batches are merged under the request limit, then the
    /// aggregation, bucketing and ordering stages run in that order.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidRequest`] before any provider runs,
    /// [`EngineError::Canceled`] when `cancel` fired mid-query and no
    /// provider failed for another reason, and [`EngineError::Provider`]
    /// for the first real provider failure.
    pub async fn run(
        &self,
        request: &QueryRequest,
        cancel: CancellationToken,
    ) -> Result<QueryOutput, EngineError> {
        request.validate()?;

        let mut receivers = Vec::with_capacity(self.providers.len());
        let mut handles = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            let (batches, receiver) = mpsc::unbounded_channel();
            let options = QueryOptions {
                from: request.from,
                to: request.to,
                limit: request.limit,
                cancel: cancel.clone(),
                batches,
            };
            let provider = Arc::clone(provider);
            let filters = request.filters.clone();
            let search = request.search.clone();
            let handle = tokio::spawn(async move {
                let name = provider.name().to_string();
                let result = provider.query(&filters, &search, options).await;
                (name, result)
            });
            receivers.push(receiver);
            handles.push(handle);
        }

        let mut canceled = false;
        let mut failure: Option<(String, ProviderError)> = None;
        for handle in handles {
            let (name, result) = handle.await?;
            match result {
                Ok(()) => {}
                Err(error) if error.is_cancellation() => {
                    tracing::debug!(provider = %name, "provider canceled");
                    canceled = true;
                }
                Err(error) => {
                    tracing::warn!(provider = %name, %error, "provider failed");
                    if failure.is_none() {
                        failure = Some((name, error));
                    }
                }
            }
        }
        // A real failure outranks cancellation when both happened.
        if let Some((provider, source)) = failure {
            return Err(EngineError::Provider { provider, source });
        }
        if canceled || cancel.is_cancelled() {
            return Err(EngineError::Canceled);
        }

        // Every emitted batch is an independent descending run.
        let mut runs = Vec::new();
        for mut receiver in receivers {
            receiver.close();
            while let Ok(batch) = receiver.try_recv() {
                runs.push(batch);
            }
        }
        let merged = merge_batches(runs, request.limit);

        let mut output = self.reduce(request, merged)?;
        if !request.order_by.is_empty() {
            order_by(&mut output.rows, &request.order_by);
        }
        Ok(output)
    }

    /// Runs the aggregation or bucketing stage over the merged rows.
    fn reduce(
        &self,
        request: &QueryRequest,
        merged: Vec<Record>,
    ) -> Result<QueryOutput, EngineError> {
        let group_by = request.group_by.as_deref();

        if let Some(ref spec) = request.bucket {
            let result = bucket(
                &merged,
                &spec.name,
                bucket_key(spec),
                &request.aggregates,
                group_by,
            )?;
            return Ok(QueryOutput {
                rows: result.data,
                columns: result.columns,
                group_by_columns: result.group_by_columns,
                aggregated_columns: result.aggregated_columns,
            });
        }

        if !request.aggregates.is_empty() {
            let result = aggregate(&merged, &request.aggregates, group_by)?;
            return Ok(QueryOutput {
                rows: result.data,
                columns: result.columns,
                group_by_columns: result.group_by_columns,
                aggregated_columns: result.aggregated_columns,
            });
        }

        let columns = row_columns(&merged);
        Ok(QueryOutput {
            rows: merged,
            columns,
            group_by_columns: Vec::new(),
            aggregated_columns: Vec::new(),
        })
    }
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Derives the bucket key function for a request: floor the row's time to
/// the interval when one is given, otherwise hash the named column.
fn bucket_key(spec: &BucketRequest) -> impl Fn(&Record) -> Option<HashableField> + '_ {
    move |row| {
        if let Some(interval) = spec.interval_ms {
            let timestamp = row.sort_key()?;
            return Some(HashableField::Date(
                timestamp.div_euclid(interval) * interval,
            ));
        }
        let column = spec.column.as_deref()?;
        row.get(column)?.as_hashable()
    }
}

/// Union of the columns present in raw result rows: the well-known columns
/// first, then the rest alphabetically.
fn row_columns(rows: &[Record]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    for row in rows {
        seen.extend(row.columns.keys().cloned());
    }
    let mut columns = Vec::with_capacity(seen.len());
    for well_known in [TIME_COLUMN, RAW_COLUMN] {
        if seen.remove(well_known) {
            columns.push(well_known.to_string());
        }
    }
    columns.extend(seen);
    columns
}
