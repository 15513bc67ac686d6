//! End-to-end tests for the connection handler: a client transport on one
//! end of a duplex pipe, [`engine::serve_connection`] on the other.

use chrono::{DateTime, TimeZone, Utc};
use engine::serve_connection;
use serde::Deserialize;
use shared::jobs::{JobEvent, JobStatus, QueryEngine, QueryRequest, Transport};
use shared::models::Record;
use shared::providers::{
    DimensionFilter, Dimensions, MemoryProvider, ProviderError, QueryOptions, QueryProvider,
};
use shared::query::Search;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct JobStarted {
    job_id: Uuid,
}

/// A provider that produces nothing until its token fires.
struct SlowProvider;

#[async_trait::async_trait]
impl QueryProvider for SlowProvider {
    fn name(&self) -> &str {
        "slow"
    }

    async fn list_dimensions(&self) -> Dimensions {
        Dimensions::new()
    }

    async fn query(
        &self,
        _filters: &[DimensionFilter],
        _search: &Search,
        options: QueryOptions,
    ) -> Result<(), ProviderError> {
        options.cancel.cancelled().await;
        Err(ProviderError::Canceled)
    }
}

fn at(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).unwrap()
}

fn connect(engine: QueryEngine) -> Transport {
    let (client, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let _ = serve_connection(server, Arc::new(engine)).await;
    });
    Transport::new(client)
}

fn query(from: i64, to: i64, limit: usize) -> QueryRequest {
    QueryRequest {
        search: Search::any(),
        from: at(from),
        to: at(to),
        limit,
        filters: Vec::new(),
        aggregates: Vec::new(),
        group_by: None,
        bucket: None,
        order_by: Vec::new(),
    }
}

#[tokio::test]
async fn test_query_run_streams_rows_then_completion() {
    let provider = MemoryProvider::new("mem")
        .with_record(Record::new(at(100), "older line"))
        .with_record(Record::new(at(200), "newer line"));
    let transport = connect(QueryEngine::new().with_provider(Arc::new(provider)));
    let mut events = transport.subscribe();

    let payload = serde_json::to_value(&query(0, 1_000, 10)).unwrap();
    let reply = transport.invoke("query_run", &payload).await.unwrap();
    let started: JobStarted = serde_json::from_slice(&reply).unwrap();

    let JobEvent::Batch { job_id, rows } = events.recv().await.unwrap() else {
        panic!("expected the batch before the terminal status");
    };
    assert_eq!(job_id, started.job_id);
    let messages: Vec<&str> = rows.iter().map(|row| row.message.as_str()).collect();
    assert_eq!(messages, vec!["newer line", "older line"]);

    let JobEvent::Status { job_id, status } = events.recv().await.unwrap() else {
        panic!("expected the terminal status after the batch");
    };
    assert_eq!(job_id, started.job_id);
    assert_eq!(status, JobStatus::Completed);
}

#[tokio::test]
async fn test_canceled_job_emits_no_batches() {
    let transport = connect(QueryEngine::new().with_provider(Arc::new(SlowProvider)));
    let mut events = transport.subscribe();

    let payload = serde_json::to_value(&query(0, 1_000, 10)).unwrap();
    let reply = transport.invoke("query_run", &payload).await.unwrap();
    let started: JobStarted = serde_json::from_slice(&reply).unwrap();

    transport
        .invoke(
            "query_cancel",
            &serde_json::json!({ "job_id": started.job_id }),
        )
        .await
        .unwrap();

    // The first (and only) notification must be the canceled status.
    let JobEvent::Status { job_id, status } = events.recv().await.unwrap() else {
        panic!("a canceled job must not emit batches");
    };
    assert_eq!(job_id, started.job_id);
    assert_eq!(status, JobStatus::Canceled);
}

#[tokio::test]
async fn test_cancel_unknown_job_is_an_error() {
    let transport = connect(QueryEngine::new());

    let err = transport
        .invoke("query_cancel", &serde_json::json!({ "job_id": Uuid::new_v4() }))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn test_list_dimensions_merges_providers() {
    let left = MemoryProvider::new("left").with_dimension("service", ["api"]);
    let right = MemoryProvider::new("right").with_dimension("service", ["worker"]);
    let transport = connect(
        QueryEngine::new()
            .with_provider(Arc::new(left))
            .with_provider(Arc::new(right)),
    );

    let reply = transport
        .invoke("list_dimensions", &serde_json::json!({}))
        .await
        .unwrap();

    let dimensions: Dimensions = serde_json::from_slice(&reply).unwrap();
    let services: Vec<&str> = dimensions["service"].iter().map(String::as_str).collect();
    assert_eq!(services, vec!["api", "worker"]);
}

#[tokio::test]
async fn test_invalid_query_request_never_starts_a_job() {
    let transport = connect(QueryEngine::new());
    let mut events = transport.subscribe();

    let payload = serde_json::to_value(&query(0, 1_000, 0)).unwrap();
    let err = transport.invoke("query_run", &payload).await.unwrap_err();

    assert!(err.to_string().contains("invalid query request"));
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_unknown_request_kind_is_rejected() {
    let transport = connect(QueryEngine::new());

    let err = transport
        .invoke("query_explain", &serde_json::json!({}))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("unknown request kind"));
}
