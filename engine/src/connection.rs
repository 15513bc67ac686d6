//! Per-connection request handling.
//!
//! Each connection gets its own job table and its own framed read/write
//! loops. Requests arrive as `sync_request` envelopes and are answered by
//! correlation id; running jobs push unsolicited batch and status
//! notifications through the shared write channel.

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shared::jobs::protocol::{Envelope, EnvelopeKind, SyncRequest};
use shared::jobs::{JobTable, QueryEngine, QueryRequest};
use shared::validator::Validate;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct CancelRequest {
    job_id: Uuid,
}

/// Serves one client connection until it closes.
///
/// # Errors
///
/// Returns an error when a frame cannot be read from the stream; a clean
/// disconnect is not an error.
pub async fn serve_connection<S>(stream: S, engine: Arc<QueryEngine>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
    let mut writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());

    // Job tasks and the request loop share one ordered write channel.
    let (outgoing, mut outbox) = mpsc::unbounded_channel::<Envelope>();
    tokio::spawn(async move {
        while let Some(envelope) = outbox.recv().await {
            if writer.send(envelope.to_bytes()).await.is_err() {
                tracing::debug!("client write side closed");
                break;
            }
        }
    });

    let jobs = Arc::new(Mutex::new(JobTable::new()));

    while let Some(frame) = reader.next().await {
        let frame = frame?;
        let envelope = match Envelope::from_bytes(&frame) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::warn!(%error, "dropping malformed frame");
                continue;
            }
        };
        match envelope.kind {
            Some(EnvelopeKind::Request(request)) => {
                handle_request(request, &engine, &jobs, &outgoing).await;
            }
            Some(_) => {
                tracing::warn!("dropping non-request envelope from client");
            }
            None => {
                tracing::warn!("dropping empty envelope");
            }
        }
    }

    tracing::debug!("client disconnected");
    Ok(())
}

async fn handle_request(
    request: SyncRequest,
    engine: &Arc<QueryEngine>,
    jobs: &Arc<Mutex<JobTable>>,
    outgoing: &mpsc::UnboundedSender<Envelope>,
) {
    let uuid = request.uuid.clone();
    let reply = match request.kind.as_str() {
        "list_dimensions" => list_dimensions(engine, &uuid).await,
        "query_run" => query_run(&request.payload, engine, jobs, outgoing, &uuid),
        "query_cancel" => query_cancel(&request.payload, jobs, &uuid),
        other => {
            tracing::warn!(kind = %other, "unknown request kind");
            Envelope::error(&uuid, format!("unknown request kind '{other}'"))
        }
    };
    send(outgoing, reply);
}

async fn list_dimensions(engine: &Arc<QueryEngine>, uuid: &str) -> Envelope {
    let dimensions = engine.dimensions().await;
    match serde_json::to_value(&dimensions) {
        Ok(payload) => match Envelope::response(uuid, &payload) {
            Ok(envelope) => envelope,
            Err(error) => Envelope::error(uuid, error.to_string()),
        },
        Err(error) => Envelope::error(uuid, error.to_string()),
    }
}

/// Registers a job, answers with its id, and spawns the query task.
///
/// The task delivers the final rows as one batch notification, then the
/// terminal status. A job canceled before completion emits no batch.
fn query_run(
    payload: &[u8],
    engine: &Arc<QueryEngine>,
    jobs: &Arc<Mutex<JobTable>>,
    outgoing: &mpsc::UnboundedSender<Envelope>,
    uuid: &str,
) -> Envelope {
    let query: QueryRequest = match serde_json::from_slice(payload) {
        Ok(query) => query,
        Err(error) => return Envelope::error(uuid, format!("invalid query request: {error}")),
    };
    // Reject bad requests before a job ever exists.
    if let Err(error) = query.validate() {
        return Envelope::error(uuid, format!("invalid query request: {error}"));
    }

    let job = lock_jobs(jobs).create();
    tracing::info!(job_id = %job.id, from = %query.from, to = %query.to, "query accepted");

    let engine = Arc::clone(engine);
    let jobs = Arc::clone(jobs);
    let outgoing = outgoing.clone();
    let cancel = job.cancel.clone();
    let job_id = job.id;
    tokio::spawn(async move {
        match engine.run(&query, cancel).await {
            Ok(output) => {
                match Envelope::batch_done(job_id, &output.rows) {
                    Ok(batch) => send(&outgoing, batch),
                    Err(error) => {
                        tracing::error!(%job_id, %error, "failed to encode result batch");
                    }
                }
                finish(&jobs, job_id, shared::jobs::JobStatus::Completed, &outgoing);
            }
            Err(error) => {
                let status = error.terminal_status();
                tracing::warn!(%job_id, %error, %status, "query did not complete");
                finish(&jobs, job_id, status, &outgoing);
            }
        }
    });

    match Envelope::response(uuid, &serde_json::json!({ "job_id": job.id })) {
        Ok(envelope) => envelope,
        Err(error) => Envelope::error(uuid, error.to_string()),
    }
}

fn query_cancel(payload: &[u8], jobs: &Arc<Mutex<JobTable>>, uuid: &str) -> Envelope {
    let request: CancelRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(error) => return Envelope::error(uuid, format!("invalid cancel request: {error}")),
    };
    match lock_jobs(jobs).cancel(request.job_id) {
        Ok(()) => {
            tracing::info!(job_id = %request.job_id, "cancel requested");
            match Envelope::response(uuid, &serde_json::json!({ "job_id": request.job_id })) {
                Ok(envelope) => envelope,
                Err(error) => Envelope::error(uuid, error.to_string()),
            }
        }
        Err(error) => Envelope::error(uuid, error.to_string()),
    }
}

/// Marks the job terminal and delivers the status notification exactly once.
fn finish(
    jobs: &Arc<Mutex<JobTable>>,
    job_id: Uuid,
    status: shared::jobs::JobStatus,
    outgoing: &mpsc::UnboundedSender<Envelope>,
) {
    match lock_jobs(jobs).finish(job_id, status) {
        Ok(()) => send(outgoing, Envelope::job_updated(job_id, status)),
        Err(error) => {
            tracing::warn!(%job_id, %error, "job already terminated");
        }
    }
}

fn send(outgoing: &mpsc::UnboundedSender<Envelope>, envelope: Envelope) {
    if outgoing.send(envelope).is_err() {
        tracing::debug!("connection closed, dropping outgoing envelope");
    }
}

fn lock_jobs(jobs: &Arc<Mutex<JobTable>>) -> std::sync::MutexGuard<'_, JobTable> {
    match jobs.lock() {
        Ok(table) => table,
        Err(poisoned) => poisoned.into_inner(),
    }
}
