//! Container log provider.
//!
//! Shells out to the docker CLI: `docker ps` enumerates the `container`
//! dimension, `docker logs --timestamps` fetches each container's lines
//! for the query window. Matching is case-insensitive. Malformed lines and
//! listing entries are skipped with a warning; a spawn failure or non-zero
//! exit propagates as a provider-wide error.

use super::{DimensionFilter, Dimensions, ProviderError, QueryOptions, QueryProvider};
use crate::models::{Field, Record};
use crate::query::{CaseSensitivity, Matcher, Search};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::process::Output;
use tokio::process::Command;

/// The dimension this provider owns. A recognized `container` filter that
/// matches no running container yields zero rows rather than an error.
pub const CONTAINER_DIMENSION: &str = "container";

/// Provider over local container logs.
pub struct DockerProvider {
    binary: String,
}

impl Default for DockerProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerProvider {
    /// Creates a provider using the `docker` binary from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Overrides the docker binary path.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Runs the docker CLI with the given arguments, honoring cancellation.
    async fn run(
        &self,
        args: &[&str],
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Output, ProviderError> {
        let mut command = Command::new(&self.binary);
        command.args(args).kill_on_drop(true);

        let output = tokio::select! {
            () = cancel.cancelled() => return Err(ProviderError::Canceled),
            output = command.output() => output.map_err(|source| ProviderError::Spawn {
                command: format!("{} {}", self.binary, args.join(" ")),
                source,
            })?,
        };

        if !output.status.success() {
            return Err(ProviderError::CommandFailed {
                command: format!("{} {}", self.binary, args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Lists container names via `docker ps`.
    async fn list_containers(
        &self,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Vec<String>, ProviderError> {
        let output = self
            .run(&["ps", "-a", "--format", "{{.Names}}"], cancel)
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_container_listing(&stdout))
    }
}

#[async_trait::async_trait]
impl QueryProvider for DockerProvider {
    fn name(&self) -> &str {
        "docker"
    }

    async fn list_dimensions(&self) -> Dimensions {
        let cancel = tokio_util::sync::CancellationToken::new();
        let values = match self.list_containers(&cancel).await {
            Ok(names) => names.into_iter().collect(),
            Err(err) => {
                tracing::warn!(error = %err, "container listing failed, offering no values");
                BTreeSet::new()
            }
        };
        Dimensions::from([(CONTAINER_DIMENSION.to_string(), values)])
    }

    async fn query(
        &self,
        filters: &[DimensionFilter],
        search: &Search,
        options: QueryOptions,
    ) -> Result<(), ProviderError> {
        let available = self.list_containers(&options.cancel).await?;
        let targets = select_targets(&available, filters);
        let matcher = Matcher::new(search, CaseSensitivity::Insensitive);

        for container in targets {
            if options.cancel.is_cancelled() {
                return Err(ProviderError::Canceled);
            }

            let since = options.from.to_rfc3339();
            let until = options.to.to_rfc3339();
            let output = self
                .run(
                    &[
                        "logs",
                        "--timestamps",
                        "--since",
                        &since,
                        "--until",
                        &until,
                        &container,
                    ],
                    &options.cancel,
                )
                .await?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            let mut rows: Vec<Record> = Vec::new();
            for line in stdout.lines().filter(|line| !line.trim().is_empty()) {
                let Some(record) = parse_log_line(line, &container) else {
                    tracing::warn!(container = %container, %line, "skipping malformed log line");
                    continue;
                };
                if in_window(&record, options.from, options.to) && matcher.matches(&record.message)
                {
                    rows.push(record);
                }
            }

            rows.sort_by_key(|record| std::cmp::Reverse(record.sort_key()));
            rows.truncate(options.limit);
            options.emit(rows);
        }

        Ok(())
    }
}

/// Resolves the containers a query targets.
///
/// `container` filters restrict the listing; values naming no known
/// container simply contribute nothing. Other filter names are ignored.
fn select_targets(available: &[String], filters: &[DimensionFilter]) -> Vec<String> {
    let requested: Vec<&str> = filters
        .iter()
        .filter(|filter| filter.name == CONTAINER_DIMENSION)
        .map(|filter| filter.value.as_str())
        .collect();

    if requested.is_empty() {
        return available.to_vec();
    }
    available
        .iter()
        .filter(|name| requested.contains(&name.as_str()))
        .cloned()
        .collect()
}

fn parse_container_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter_map(|line| {
            if line.is_empty() {
                tracing::warn!("skipping empty container listing entry");
                return None;
            }
            Some(line.to_string())
        })
        .collect()
}

/// Parses one `docker logs --timestamps` line into a record.
///
/// Lines look like `2024-05-01T12:00:00.000000000Z payload`. A JSON-object
/// payload is decoded into columns via field coercion; anything else stays
/// in the message.
fn parse_log_line(line: &str, container: &str) -> Option<Record> {
    let (timestamp, payload) = line.split_once(' ')?;
    let timestamp: DateTime<Utc> = timestamp.parse::<DateTime<chrono::FixedOffset>>().ok()?.into();

    let mut record = Record::new(timestamp, line)
        .with_message(payload)
        .with_column(CONTAINER_DIMENSION, Field::Str(container.to_string()));

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
        if let Field::Object(entries) = Field::from_json(value) {
            for (key, field) in entries {
                record = record.with_column(key, field);
            }
        }
    }

    Some(record)
}

fn in_window(record: &Record, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
    record.sort_key().is_some_and(|key| {
        key >= from.timestamp_millis() && key <= to.timestamp_millis()
    })
}
