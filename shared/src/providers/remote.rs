//! Remote log-query backend provider.
//!
//! A provider generic over a page-fetching [`LogBackend`]. The backend's
//! own page limit is usually smaller than the caller's requested limit, so
//! the provider paginates: after each full page it re-issues the query
//! with the window's upper bound moved to just before the earliest
//! timestamp of that page, stopping when a page comes back short, the
//! limit is met, or the window no longer advances.
//!
//! [`HttpLogBackend`] implements the backend trait against a Loki-style
//! HTTP range API.

use super::{DimensionFilter, Dimensions, ProviderError, QueryOptions, QueryProvider};
use crate::models::{Field, Record};
use crate::query::{CaseSensitivity, Matcher, Search};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;

/// One page request issued against a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Inclusive lower time bound.
    pub from: DateTime<Utc>,
    /// Inclusive upper time bound for this page.
    pub to: DateTime<Utc>,
    /// The backend's page limit.
    pub page_size: usize,
    /// Dimension filters forwarded to the backend.
    pub filters: Vec<DimensionFilter>,
}

/// A paged log backend.
#[async_trait::async_trait]
pub trait LogBackend: Send + Sync {
    /// Enumerates the backend's label names and values.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Backend`] when the backend is unreachable
    /// or responds malformed.
    async fn labels(&self) -> Result<Dimensions, ProviderError>;

    /// Fetches one page of rows, sorted descending by time.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Backend`] when the request fails.
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<Record>, ProviderError>;
}

/// Provider over a remote backend, with result-set pagination.
pub struct RemoteProvider<B> {
    name: String,
    backend: B,
    page_size: usize,
}

impl<B: LogBackend> RemoteProvider<B> {
    /// Creates a provider with the backend's page limit.
    #[must_use]
    pub fn new(name: impl Into<String>, backend: B, page_size: usize) -> Self {
        Self {
            name: name.into(),
            backend,
            page_size: page_size.max(1),
        }
    }
}

#[async_trait::async_trait]
impl<B: LogBackend> QueryProvider for RemoteProvider<B> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_dimensions(&self) -> Dimensions {
        match self.backend.labels().await {
            Ok(dimensions) => dimensions,
            Err(err) => {
                tracing::warn!(error = %err, "label listing failed, offering no values");
                Dimensions::new()
            }
        }
    }

    async fn query(
        &self,
        filters: &[DimensionFilter],
        search: &Search,
        options: QueryOptions,
    ) -> Result<(), ProviderError> {
        let matcher = Matcher::new(search, CaseSensitivity::Insensitive);
        let mut window_to = options.to;
        let mut delivered = 0usize;

        loop {
            if options.cancel.is_cancelled() {
                return Err(ProviderError::Canceled);
            }

            let request = PageRequest {
                from: options.from,
                to: window_to,
                page_size: self.page_size,
                filters: filters.to_vec(),
            };
            let page = tokio::select! {
                () = options.cancel.cancelled() => return Err(ProviderError::Canceled),
                page = self.backend.fetch_page(&request) => page?,
            };

            let page_len = page.len();
            let earliest = page.iter().filter_map(Record::sort_key).min();

            let mut rows: Vec<Record> = page
                .into_iter()
                .filter(|record| matcher.matches(&record.message))
                .collect();
            rows.truncate(options.limit - delivered);
            delivered += rows.len();
            options.emit(rows);

            // A short page means the backend is exhausted for this window.
            if page_len < self.page_size || delivered >= options.limit {
                return Ok(());
            }
            let Some(earliest) = earliest else {
                return Ok(());
            };
            let new_to = earliest - 1;
            if new_to >= window_to.timestamp_millis() || new_to < options.from.timestamp_millis() {
                // The window no longer advances; stop rather than loop.
                return Ok(());
            }
            window_to = match Utc.timestamp_millis_opt(new_to).single() {
                Some(to) => to,
                None => return Ok(()),
            };
        }
    }
}

/// Loki-style HTTP backend.
pub struct HttpLogBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct LabelsResponse {
    #[serde(default)]
    data: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    data: RangeData,
}

#[derive(Debug, Deserialize)]
struct RangeData {
    #[serde(default)]
    result: Vec<StreamResult>,
}

#[derive(Debug, Deserialize)]
struct StreamResult {
    #[serde(default)]
    stream: std::collections::HashMap<String, String>,
    /// Pairs of nanosecond timestamp and line.
    #[serde(default)]
    values: Vec<(String, String)>,
}

impl HttpLogBackend {
    /// Creates a backend against a base URL such as `http://loki:3100`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn backend_error(err: &reqwest::Error) -> ProviderError {
        ProviderError::Backend(err.to_string())
    }

    /// Builds the stream selector from the forwarded dimension filters.
    fn selector(filters: &[DimensionFilter]) -> String {
        if filters.is_empty() {
            return r#"{__name__=~".+"}"#.to_string();
        }
        let parts: Vec<String> = filters
            .iter()
            .map(|filter| format!(r#"{}="{}""#, filter.name, filter.value))
            .collect();
        format!("{{{}}}", parts.join(","))
    }
}

#[async_trait::async_trait]
impl LogBackend for HttpLogBackend {
    async fn labels(&self) -> Result<Dimensions, ProviderError> {
        let url = format!("{}/loki/api/v1/labels", self.base_url);
        let names: LabelsResponse = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::backend_error(&e))?
            .json()
            .await
            .map_err(|e| Self::backend_error(&e))?;

        let mut dimensions = Dimensions::new();
        for name in names.data {
            let url = format!("{}/loki/api/v1/label/{name}/values", self.base_url);
            // One unreachable label degrades to an empty set, not a failure.
            let values: BTreeSet<String> = match self.client.get(&url).send().await {
                Ok(response) => response
                    .json::<LabelsResponse>()
                    .await
                    .map(|r| r.data.into_iter().collect())
                    .unwrap_or_default(),
                Err(err) => {
                    tracing::warn!(label = %name, error = %err, "label value listing failed");
                    BTreeSet::new()
                }
            };
            dimensions.insert(name, values);
        }
        Ok(dimensions)
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<Record>, ProviderError> {
        let url = format!("{}/loki/api/v1/query_range", self.base_url);
        let start = i128::from(request.from.timestamp_millis()) * 1_000_000;
        let end = (i128::from(request.to.timestamp_millis()) + 1) * 1_000_000;

        let response: RangeResponse = self
            .client
            .get(&url)
            .query(&[
                ("query", Self::selector(&request.filters)),
                ("start", start.to_string()),
                ("end", end.to_string()),
                ("limit", request.page_size.to_string()),
                ("direction", "backward".to_string()),
            ])
            .send()
            .await
            .map_err(|e| Self::backend_error(&e))?
            .json()
            .await
            .map_err(|e| Self::backend_error(&e))?;

        let mut rows: Vec<Record> = Vec::new();
        for stream in response.data.result {
            for (timestamp, line) in stream.values {
                let Some(record) = decode_stream_value(&timestamp, &line, &stream.stream) else {
                    tracing::warn!(%timestamp, "skipping malformed backend row");
                    continue;
                };
                rows.push(record);
            }
        }
        rows.sort_by_key(|record| std::cmp::Reverse(record.sort_key()));
        rows.truncate(request.page_size);
        Ok(rows)
    }
}

fn decode_stream_value(
    timestamp: &str,
    line: &str,
    labels: &std::collections::HashMap<String, String>,
) -> Option<Record> {
    let nanos: i64 = timestamp.parse().ok()?;
    let time = Utc.timestamp_millis_opt(nanos / 1_000_000).single()?;
    let mut record = Record::new(time, line);
    for (name, value) in labels {
        record = record.with_column(name.clone(), Field::Str(value.clone()));
    }
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct FakeBackend {
        pages: Mutex<Vec<Vec<Record>>>,
        requests: Mutex<Vec<PageRequest>>,
        cancel_on_call: Option<(usize, CancellationToken)>,
    }

    impl FakeBackend {
        fn new(pages: Vec<Vec<Record>>) -> Self {
            Self {
                pages: Mutex::new(pages),
                requests: Mutex::new(Vec::new()),
                cancel_on_call: None,
            }
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl LogBackend for FakeBackend {
        async fn labels(&self) -> Result<Dimensions, ProviderError> {
            Err(ProviderError::Backend("no labels".to_string()))
        }

        async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<Record>, ProviderError> {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            let call = requests.len();
            drop(requests);

            if let Some((at, ref token)) = self.cancel_on_call {
                if call == at {
                    token.cancel();
                }
            }

            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(pages.remove(0))
            }
        }
    }

    fn record(millis: i64, message: &str) -> Record {
        Record::new(
            Utc.timestamp_millis_opt(millis).single().unwrap(),
            message,
        )
    }

    fn options(
        from: i64,
        to: i64,
        limit: usize,
        cancel: CancellationToken,
    ) -> (QueryOptions, mpsc::UnboundedReceiver<Vec<Record>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            QueryOptions {
                from: Utc.timestamp_millis_opt(from).single().unwrap(),
                to: Utc.timestamp_millis_opt(to).single().unwrap(),
                limit,
                cancel,
                batches: tx,
            },
            rx,
        )
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<Vec<Record>>) -> Vec<Record> {
        let mut rows = Vec::new();
        while let Some(batch) = rx.recv().await {
            rows.extend(batch);
        }
        rows
    }

    #[tokio::test]
    async fn test_pagination_moves_window_before_earliest_row() {
        let backend = FakeBackend::new(vec![
            vec![record(900, "a"), record(800, "b")],
            vec![record(700, "c")],
        ]);
        let provider = RemoteProvider::new("remote", backend, 2);
        let (options, rx) = options(0, 1000, 100, CancellationToken::new());

        provider.query(&[], &Search::any(), options).await.unwrap();

        let rows = collect(rx).await;
        assert_eq!(rows.len(), 3);

        let requests = provider.backend.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].to.timestamp_millis(), 1000);
        // Second window ends just before the earliest row of page one.
        assert_eq!(requests[1].to.timestamp_millis(), 799);
    }

    #[tokio::test]
    async fn test_pagination_stops_on_short_page() {
        let backend = FakeBackend::new(vec![vec![record(900, "a")]]);
        let provider = RemoteProvider::new("remote", backend, 2);
        let (options, rx) = options(0, 1000, 100, CancellationToken::new());

        provider.query(&[], &Search::any(), options).await.unwrap();

        assert_eq!(collect(rx).await.len(), 1);
        assert_eq!(provider.backend.request_count(), 1);
    }

    #[tokio::test]
    async fn test_pagination_stops_when_limit_met() {
        let backend = FakeBackend::new(vec![
            vec![record(900, "a"), record(800, "b")],
            vec![record(700, "c"), record(600, "d")],
        ]);
        let provider = RemoteProvider::new("remote", backend, 2);
        let (options, rx) = options(0, 1000, 2, CancellationToken::new());

        provider.query(&[], &Search::any(), options).await.unwrap();

        assert_eq!(collect(rx).await.len(), 2);
        assert_eq!(provider.backend.request_count(), 1);
    }

    #[tokio::test]
    async fn test_pagination_stops_when_window_does_not_advance() {
        // A misbehaving backend that keeps returning rows newer than the
        // requested window.
        let backend = FakeBackend::new(vec![
            vec![record(2000, "a"), record(1500, "b")],
            vec![record(2000, "a"), record(1500, "b")],
        ]);
        let provider = RemoteProvider::new("remote", backend, 2);
        let (options, _rx) = options(0, 1000, 100, CancellationToken::new());

        provider.query(&[], &Search::any(), options).await.unwrap();

        assert_eq!(provider.backend.request_count(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_mid_pagination() {
        let cancel = CancellationToken::new();
        let mut backend = FakeBackend::new(vec![
            vec![record(900, "a"), record(800, "b")],
            vec![record(700, "c"), record(600, "d")],
        ]);
        backend.cancel_on_call = Some((1, cancel.clone()));
        let provider = RemoteProvider::new("remote", backend, 2);
        let (options, rx) = options(0, 1000, 100, cancel);

        let err = provider.query(&[], &Search::any(), options).await.unwrap_err();

        assert!(err.is_cancellation());
        // The first page was already delivered; nothing more follows.
        assert_eq!(collect(rx).await.len(), 2);
        assert_eq!(provider.backend.request_count(), 1);
    }

    #[tokio::test]
    async fn test_search_filter_is_case_insensitive() {
        let backend = FakeBackend::new(vec![vec![record(900, "ERROR boom")]]);
        let provider = RemoteProvider::new("remote", backend, 2);
        let (options, rx) = options(0, 1000, 100, CancellationToken::new());

        provider
            .query(&[], &Search::literal(["error"]), options)
            .await
            .unwrap();

        assert_eq!(collect(rx).await.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_labels_degrade_to_empty_dimensions() {
        let provider = RemoteProvider::new("remote", FakeBackend::new(vec![]), 2);
        assert!(provider.list_dimensions().await.is_empty());
    }

    #[test]
    fn test_selector_built_from_filters() {
        assert_eq!(
            HttpLogBackend::selector(&[
                DimensionFilter::new("job", "api"),
                DimensionFilter::new("env", "prod"),
            ]),
            r#"{job="api",env="prod"}"#
        );
    }
}
