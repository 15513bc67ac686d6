//! Duplex transport multiplexing correlated calls and job notifications
//! over one framed byte stream.

use super::protocol::{Envelope, EnvelopeKind, ProtocolError};
use super::JobStatus;
use crate::models::Record;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use uuid::Uuid;

/// Default deadline for a correlated call.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors from transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer did not answer within the deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The underlying stream closed before the call resolved.
    #[error("transport closed")]
    Closed,

    /// The peer answered the call with an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] ProtocolError),
}

/// An unsolicited notification decoded off the stream.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A batch of result rows for a job.
    Batch {
        /// The job the rows belong to.
        job_id: Uuid,
        /// The decoded rows.
        rows: Vec<Record>,
    },
    /// A job status transition.
    Status {
        /// The job whose status changed.
        job_id: Uuid,
        /// The new status.
        status: JobStatus,
    },
}

type PendingCalls = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Result<Vec<u8>, String>>>>>;

/// One side of a framed connection.
///
/// Cloning is cheap; clones share the reader and writer tasks. Correlated
/// calls go through [`Transport::invoke`], notifications arrive on
/// [`Transport::subscribe`].
#[derive(Clone)]
pub struct Transport {
    outgoing: mpsc::UnboundedSender<Envelope>,
    pending: PendingCalls,
    events: broadcast::Sender<JobEvent>,
    timeout: Duration,
}

impl Transport {
    /// Wraps a byte stream, spawning its reader and writer tasks.
    ///
    /// The tasks end when the stream closes; pending calls then resolve to
    /// [`TransportError::Closed`].
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let mut writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());

        let (outgoing, mut outbox) = mpsc::unbounded_channel::<Envelope>();
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(envelope) = outbox.recv().await {
                if writer.send(envelope.to_bytes()).await.is_err() {
                    tracing::debug!("write side closed, dropping outgoing frames");
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_events = events.clone();
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(error) => {
                        tracing::debug!(%error, "read side failed");
                        break;
                    }
                };
                match Envelope::from_bytes(&frame) {
                    Ok(envelope) => {
                        Self::dispatch(envelope, &reader_pending, &reader_events);
                    }
                    Err(error) => {
                        tracing::warn!(%error, "dropping malformed frame");
                    }
                }
            }
            // Resolve every in-flight call so callers see Closed, not Timeout.
            let mut calls = match reader_pending.lock() {
                Ok(calls) => calls,
                Err(poisoned) => poisoned.into_inner(),
            };
            calls.clear();
        });

        Self {
            outgoing,
            pending,
            events,
            timeout: DEFAULT_INVOKE_TIMEOUT,
        }
    }

    /// Overrides the call deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Subscribes to job notifications.
    ///
    /// Each subscriber gets every [`JobEvent`] decoded after the call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Sends a correlated request and waits for the matching answer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] past the deadline,
    /// [`TransportError::Closed`] when the stream ends first, and
    /// [`TransportError::Remote`] when the peer answers with an error.
    pub async fn invoke(
        &self,
        kind: &str,
        payload: &serde_json::Value,
    ) -> Result<Vec<u8>, TransportError> {
        let uuid = Uuid::new_v4();
        let envelope = Envelope::request(kind, uuid, payload)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.lock_pending().insert(uuid, reply_tx);

        if self.outgoing.send(envelope).is_err() {
            self.lock_pending().remove(&uuid);
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(Ok(payload))) => Ok(payload),
            Ok(Ok(Err(message))) => Err(TransportError::Remote(message)),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.lock_pending().remove(&uuid);
                Err(TransportError::Timeout(self.timeout))
            }
        }
    }

    /// Sends a frame without waiting for an answer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] when the stream has ended.
    pub fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.outgoing
            .send(envelope)
            .map_err(|_| TransportError::Closed)
    }

    fn dispatch(envelope: Envelope, pending: &PendingCalls, events: &broadcast::Sender<JobEvent>) {
        match envelope.kind {
            Some(EnvelopeKind::Response(response)) => {
                Self::resolve(pending, &response.uuid, Ok(response.payload));
            }
            Some(EnvelopeKind::Error(error)) => {
                Self::resolve(pending, &error.uuid, Err(error.error));
            }
            Some(EnvelopeKind::BatchDone(batch)) => {
                let Ok(job_id) = Uuid::parse_str(&batch.job_id) else {
                    tracing::warn!(job_id = %batch.job_id, "dropping batch with bad job id");
                    return;
                };
                match serde_json::from_slice(&batch.rows) {
                    Ok(rows) => {
                        let _ = events.send(JobEvent::Batch { job_id, rows });
                    }
                    Err(error) => {
                        tracing::warn!(%job_id, %error, "dropping batch with bad rows");
                    }
                }
            }
            Some(EnvelopeKind::JobUpdated(update)) => {
                let Ok(job_id) = Uuid::parse_str(&update.job_id) else {
                    tracing::warn!(job_id = %update.job_id, "dropping update with bad job id");
                    return;
                };
                let status = JobStatus::from(update.status());
                let _ = events.send(JobEvent::Status { job_id, status });
            }
            Some(EnvelopeKind::Request(request)) => {
                tracing::warn!(kind = %request.kind, "unexpected request on caller side");
            }
            None => {
                tracing::warn!("dropping empty envelope");
            }
        }
    }

    fn resolve(pending: &PendingCalls, uuid: &str, outcome: Result<Vec<u8>, String>) {
        let Ok(uuid) = Uuid::parse_str(uuid) else {
            tracing::warn!(%uuid, "dropping answer with bad correlation id");
            return;
        };
        let sender = {
            let mut calls = match pending.lock() {
                Ok(calls) => calls,
                Err(poisoned) => poisoned.into_inner(),
            };
            calls.remove(&uuid)
        };
        match sender {
            Some(sender) => {
                // The caller may have timed out and dropped the receiver.
                let _ = sender.send(outcome);
            }
            None => {
                tracing::debug!(%uuid, "answer for unknown or expired call");
            }
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, oneshot::Sender<Result<Vec<u8>, String>>>> {
        match self.pending.lock() {
            Ok(calls) => calls,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    /// Answers every request on the far end of a duplex pipe.
    fn spawn_echo_peer(stream: tokio::io::DuplexStream) {
        tokio::spawn(async move {
            let (read_half, write_half) = tokio::io::split(stream);
            let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
            let mut writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());
            while let Some(Ok(frame)) = reader.next().await {
                let envelope = Envelope::from_bytes(&frame).unwrap();
                let Some(EnvelopeKind::Request(request)) = envelope.kind else {
                    continue;
                };
                let reply = match request.kind.as_str() {
                    "fail" => Envelope::error(&request.uuid, "boom"),
                    _ => Envelope::response(&request.uuid, &serde_json::json!({"ok": true}))
                        .unwrap(),
                };
                writer.send(reply.to_bytes()).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_invoke_resolves_with_payload() {
        let (near, far) = tokio::io::duplex(4096);
        spawn_echo_peer(far);
        let transport = Transport::new(near);

        let payload = transport
            .invoke("list_dimensions", &serde_json::json!({}))
            .await
            .unwrap();

        let decoded: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded["ok"], true);
    }

    #[tokio::test]
    async fn test_invoke_surfaces_remote_error() {
        let (near, far) = tokio::io::duplex(4096);
        spawn_echo_peer(far);
        let transport = Transport::new(near);

        let err = transport
            .invoke("fail", &serde_json::json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Remote(message) if message == "boom"));
    }

    #[tokio::test]
    async fn test_invoke_times_out_and_releases_call() {
        let (near, _far) = tokio::io::duplex(4096);
        let transport = Transport::new(near).with_timeout(Duration::from_millis(20));

        let err = transport
            .invoke("query_run", &serde_json::json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(transport.lock_pending().is_empty());
    }

    #[tokio::test]
    async fn test_invoke_fails_when_peer_hangs_up() {
        let (near, far) = tokio::io::duplex(4096);
        let transport = Transport::new(near).with_timeout(Duration::from_secs(5));
        drop(far);

        let err = transport
            .invoke("query_run", &serde_json::json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn test_notifications_reach_subscribers() {
        let (near, far) = tokio::io::duplex(4096);
        let transport = Transport::new(near);
        let mut events = transport.subscribe();

        let job_id = Uuid::new_v4();
        let rows = vec![Record::new(Utc::now(), "hello")];
        let peer = Transport::new(far);
        peer.send(Envelope::batch_done(job_id, &rows).unwrap())
            .unwrap();
        peer.send(Envelope::job_updated(job_id, JobStatus::Completed))
            .unwrap();

        let JobEvent::Batch {
            job_id: batch_job,
            rows: batch_rows,
        } = events.recv().await.unwrap()
        else {
            panic!("expected a batch first");
        };
        assert_eq!(batch_job, job_id);
        assert_eq!(batch_rows, rows);

        let JobEvent::Status {
            job_id: status_job,
            status,
        } = events.recv().await.unwrap()
        else {
            panic!("expected a status second");
        };
        assert_eq!(status_job, job_id);
        assert_eq!(status, JobStatus::Completed);
    }
}
