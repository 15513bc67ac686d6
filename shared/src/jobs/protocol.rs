//! Wire protocol for the job stream.
//!
//! Envelopes travel as length-prefixed binary frames
//! (`tokio_util::codec::LengthDelimitedCodec`) carrying a prost-encoded
//! [`Envelope`]. Request/response payloads and result rows are JSON bytes
//! inside the envelope, so the field-level schema can evolve without
//! touching the framing.

use super::JobStatus;
use crate::models::Record;
use prost::Message as _;
use thiserror::Error;
use uuid::Uuid;

/// Errors while encoding or decoding protocol frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not a valid envelope.
    #[error("malformed envelope: {0}")]
    Decode(#[from] prost::DecodeError),

    /// An envelope payload was not valid JSON for its kind.
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// An id field did not hold a UUID.
    #[error("malformed id: {0}")]
    Id(#[from] uuid::Error),

    /// The envelope carried no message.
    #[error("empty envelope")]
    Empty,
}

/// A correlated request sent by the caller.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SyncRequest {
    /// Request kind, e.g. `query_run`.
    #[prost(string, tag = "1")]
    pub kind: String,
    /// Correlation id matched by the response.
    #[prost(string, tag = "2")]
    pub uuid: String,
    /// JSON-encoded request payload.
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

/// The successful response to a [`SyncRequest`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct SyncResponse {
    /// Correlation id of the originating request.
    #[prost(string, tag = "1")]
    pub uuid: String,
    /// JSON-encoded response payload.
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

/// The error response to a [`SyncRequest`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct SyncError {
    /// Correlation id of the originating request.
    #[prost(string, tag = "1")]
    pub uuid: String,
    /// Human-readable error.
    #[prost(string, tag = "2")]
    pub error: String,
}

/// An unsolicited batch notification for a job.
#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryBatchDone {
    /// The job this batch belongs to.
    #[prost(string, tag = "1")]
    pub job_id: String,
    /// JSON-encoded `Vec<Record>`.
    #[prost(bytes = "vec", tag = "2")]
    pub rows: Vec<u8>,
}

/// An unsolicited job status transition.
#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryJobUpdated {
    /// The job whose status changed.
    #[prost(string, tag = "1")]
    pub job_id: String,
    /// The new status.
    #[prost(enumeration = "StatusCode", tag = "2")]
    pub status: i32,
}

/// Wire encoding of [`JobStatus`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    /// Executing.
    Running = 0,
    /// Finished successfully.
    Completed = 1,
    /// Aborted on error.
    Failed = 2,
    /// Canceled by the caller.
    Canceled = 3,
}

impl From<JobStatus> for StatusCode {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Running => Self::Running,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
            JobStatus::Canceled => Self::Canceled,
        }
    }
}

impl From<StatusCode> for JobStatus {
    fn from(code: StatusCode) -> Self {
        match code {
            StatusCode::Running => Self::Running,
            StatusCode::Completed => Self::Completed,
            StatusCode::Failed => Self::Failed,
            StatusCode::Canceled => Self::Canceled,
        }
    }
}

/// One protocol frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    /// The message carried by this frame.
    #[prost(oneof = "EnvelopeKind", tags = "1, 2, 3, 4, 5")]
    pub kind: Option<EnvelopeKind>,
}

/// The message variants an envelope can carry.
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum EnvelopeKind {
    /// A correlated request.
    #[prost(message, tag = "1")]
    Request(SyncRequest),
    /// A correlated success response.
    #[prost(message, tag = "2")]
    Response(SyncResponse),
    /// A correlated error response.
    #[prost(message, tag = "3")]
    Error(SyncError),
    /// A batch notification.
    #[prost(message, tag = "4")]
    BatchDone(QueryBatchDone),
    /// A job status transition.
    #[prost(message, tag = "5")]
    JobUpdated(QueryJobUpdated),
}

impl Envelope {
    /// Wraps a request.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Payload`] when the payload fails to encode.
    pub fn request(
        kind: &str,
        uuid: Uuid,
        payload: &serde_json::Value,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: Some(EnvelopeKind::Request(SyncRequest {
                kind: kind.to_string(),
                uuid: uuid.to_string(),
                payload: serde_json::to_vec(payload)?,
            })),
        })
    }

    /// Wraps a success response.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Payload`] when the payload fails to encode.
    pub fn response(uuid: &str, payload: &serde_json::Value) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: Some(EnvelopeKind::Response(SyncResponse {
                uuid: uuid.to_string(),
                payload: serde_json::to_vec(payload)?,
            })),
        })
    }

    /// Wraps an error response.
    #[must_use]
    pub fn error(uuid: &str, error: impl Into<String>) -> Self {
        Self {
            kind: Some(EnvelopeKind::Error(SyncError {
                uuid: uuid.to_string(),
                error: error.into(),
            })),
        }
    }

    /// Wraps a batch notification.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Payload`] when the rows fail to encode.
    pub fn batch_done(job_id: Uuid, rows: &[Record]) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: Some(EnvelopeKind::BatchDone(QueryBatchDone {
                job_id: job_id.to_string(),
                rows: serde_json::to_vec(rows)?,
            })),
        })
    }

    /// Wraps a status transition.
    #[must_use]
    pub fn job_updated(job_id: Uuid, status: JobStatus) -> Self {
        Self {
            kind: Some(EnvelopeKind::JobUpdated(QueryJobUpdated {
                job_id: job_id.to_string(),
                status: StatusCode::from(status) as i32,
            })),
        }
    }

    /// Encodes the envelope into frame bytes.
    #[must_use]
    pub fn to_bytes(&self) -> bytes::Bytes {
        bytes::Bytes::from(self.encode_to_vec())
    }

    /// Decodes an envelope from frame bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] for malformed frames.
    pub fn from_bytes(frame: &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self::decode(frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_request_round_trip() {
        let uuid = Uuid::new_v4();
        let envelope =
            Envelope::request("query_run", uuid, &serde_json::json!({"limit": 10})).unwrap();

        let decoded = Envelope::from_bytes(&envelope.to_bytes()).unwrap();

        let Some(EnvelopeKind::Request(request)) = decoded.kind else {
            panic!("expected a request envelope");
        };
        assert_eq!(request.kind, "query_run");
        assert_eq!(request.uuid, uuid.to_string());
        let payload: serde_json::Value = serde_json::from_slice(&request.payload).unwrap();
        assert_eq!(payload["limit"], 10);
    }

    #[test]
    fn test_batch_round_trip_preserves_rows() {
        let job_id = Uuid::new_v4();
        let rows = vec![Record::new(Utc::now(), "line one")];
        let envelope = Envelope::batch_done(job_id, &rows).unwrap();

        let decoded = Envelope::from_bytes(&envelope.to_bytes()).unwrap();
        let Some(EnvelopeKind::BatchDone(batch)) = decoded.kind else {
            panic!("expected a batch envelope");
        };
        let decoded_rows: Vec<Record> = serde_json::from_slice(&batch.rows).unwrap();
        assert_eq!(decoded_rows, rows);
    }

    #[test]
    fn test_status_code_mapping() {
        for status in [
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Canceled,
        ] {
            assert_eq!(JobStatus::from(StatusCode::from(status)), status);
        }
    }

    #[test]
    fn test_malformed_frame_is_rejected() {
        assert!(Envelope::from_bytes(&[0xff, 0xff, 0xff]).is_err());
    }
}
