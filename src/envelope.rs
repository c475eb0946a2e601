use crate::config::RetryPolicy;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One unit of payload data plus routing metadata destined for the broker.
///
/// Envelopes are created by the publisher from a [`BatchRequest`] and are
/// immutable once constructed; they are owned by the batch that created them
/// until acknowledgment resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Topic the envelope is published to
    pub topic: String,

    /// Optional partitioning key
    pub key: Option<String>,

    /// Message payload
    pub payload: Bytes,

    /// Position of this envelope within its batch
    pub sequence_index: u32,
}

impl MessageEnvelope {
    pub fn new(topic: impl Into<String>, key: Option<String>, payload: Bytes, sequence_index: u32) -> Self {
        Self {
            topic: topic.into(),
            key,
            payload,
            sequence_index,
        }
    }

    /// Get envelope as JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Create envelope from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Get payload as string (UTF-8)
    pub fn payload_as_string(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.payload.to_vec())
    }
}

/// One entry of a [`BatchRequest`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub key: Option<String>,
    pub payload: Bytes,
}

impl BatchItem {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            key: None,
            payload: payload.into(),
        }
    }

    pub fn with_key(key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            key: Some(key.into()),
            payload: payload.into(),
        }
    }
}

/// A logical unit of work handed to the publisher.
///
/// The request is consumed by `publish` and not retained after it returns.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Destination topic for every envelope in the batch
    pub topic: String,

    /// Ordered payloads; item position becomes the envelope sequence index
    pub items: Vec<BatchItem>,

    /// Per-request retry policy override
    pub retry: Option<RetryPolicy>,
}

impl BatchRequest {
    /// Create a request from bare payloads with no keys
    pub fn new<I, P>(topic: impl Into<String>, payloads: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Bytes>,
    {
        Self {
            topic: topic.into(),
            items: payloads.into_iter().map(BatchItem::new).collect(),
            retry: None,
        }
    }

    /// Create a request from keyed items
    pub fn with_items(topic: impl Into<String>, items: Vec<BatchItem>) -> Self {
        Self {
            topic: topic.into(),
            items,
            retry: None,
        }
    }

    /// Override the publisher's retry policy for this request
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Final status of one envelope
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PublishStatus {
    /// Broker durably accepted the envelope
    Acked,
    /// Permanent broker error, or retries exhausted
    Failed,
    /// Deadline elapsed before the broker resolved the envelope
    TimedOut,
}

/// Outcome record for one envelope, created by the tracker on resolution.
///
/// `error` is present exactly when `status != Acked`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResult {
    pub sequence_index: u32,
    pub status: PublishStatus,
    /// Number of send attempts dispatched for this envelope
    pub attempts: u32,
    pub error: Option<String>,
}

impl PublishResult {
    pub fn acked(sequence_index: u32, attempts: u32) -> Self {
        Self {
            sequence_index,
            status: PublishStatus::Acked,
            attempts,
            error: None,
        }
    }

    pub fn failed(sequence_index: u32, attempts: u32, error: impl Into<String>) -> Self {
        Self {
            sequence_index,
            status: PublishStatus::Failed,
            attempts,
            error: Some(error.into()),
        }
    }

    pub fn timed_out(sequence_index: u32, attempts: u32) -> Self {
        Self {
            sequence_index,
            status: PublishStatus::TimedOut,
            attempts,
            error: Some("deadline elapsed before acknowledgment".to_string()),
        }
    }

    pub fn is_acked(&self) -> bool {
        self.status == PublishStatus::Acked
    }
}

/// Aggregated outcome of one batch publish call.
///
/// `results` is always ordered by sequence index and has exactly one entry per
/// request item, regardless of broker completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Generated identifier for log correlation
    pub batch_id: String,

    /// Envelopes dispatched to the broker at least once
    pub total_sent: u32,

    /// Envelopes resolved as Acked
    pub total_acked: u32,

    /// Envelopes resolved as Failed (TimedOut counted separately)
    pub total_failed: u32,

    /// Per-envelope results in submission order
    pub results: Vec<PublishResult>,
}

impl BatchOutcome {
    pub(crate) fn new(batch_id: String, total_sent: u32, mut results: Vec<PublishResult>) -> Self {
        results.sort_by_key(|r| r.sequence_index);
        let total_acked = results.iter().filter(|r| r.is_acked()).count() as u32;
        let total_failed = results
            .iter()
            .filter(|r| r.status == PublishStatus::Failed)
            .count() as u32;
        Self {
            batch_id,
            total_sent,
            total_acked,
            total_failed,
            results,
        }
    }

    /// Envelopes resolved as TimedOut
    pub fn total_timed_out(&self) -> u32 {
        self.results
            .iter()
            .filter(|r| r.status == PublishStatus::TimedOut)
            .count() as u32
    }

    /// True when every envelope in the batch was acknowledged
    pub fn is_fully_acked(&self) -> bool {
        self.total_acked as usize == self.results.len()
    }
}

/// Generate a batch identifier
pub(crate) fn new_batch_id() -> String {
    format!("batch-{}", Uuid::new_v4())
}
