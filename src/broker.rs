use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Broker acknowledgment for one accepted envelope
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SendAck {
    pub partition: u32,
    pub offset: u64,
}

/// A message received from a subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub payload: Bytes,
}

/// Commit callback attached to a delivery.
///
/// Committing consumes the handle; the broker client decides what an offset
/// commit means for its protocol.
#[async_trait]
pub trait Committer: Send {
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// One message plus its commit handle, as yielded by a subscription stream
pub struct Delivery {
    pub message: InboundMessage,
    committer: Box<dyn Committer>,
}

impl Delivery {
    pub fn new(message: InboundMessage, committer: Box<dyn Committer>) -> Self {
        Self { message, committer }
    }

    /// Request a broker commit for this message's offset
    pub async fn commit(self) -> Result<()> {
        self.committer.commit().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Client-side boundary to the messaging backend.
///
/// The broker itself (topic creation, partitioning, persistence, group
/// rebalancing) and its wire protocol live behind this trait. Implementations
/// must be safe to share across publishers and workers in one process.
///
/// `send` errors are classified through [`PipelineError::is_retryable`]:
/// retryable errors are treated as transient and re-dispatched under the
/// retry policy, everything else fails the envelope immediately.
///
/// [`PipelineError::is_retryable`]: crate::error::PipelineError::is_retryable
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Publish one envelope's data, resolving once the broker acks or rejects it
    async fn send(&self, topic: &str, key: Option<&str>, payload: Bytes) -> Result<SendAck>;

    /// Join a consumer group and stream deliveries for the topic.
    ///
    /// The stream ending is treated as an unrecoverable session failure by
    /// consumer workers.
    async fn subscribe(&self, topic: &str, group_id: &str) -> Result<BoxStream<'static, Delivery>>;
}

/// Collaborator that stores permanently unprocessable messages for manual
/// inspection
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, message: &InboundMessage, error: &str) -> Result<()>;
}

#[derive(Serialize)]
struct DeadLetterRecord<'a> {
    topic: &'a str,
    partition: u32,
    offset: u64,
    key: Option<&'a str>,
    payload_len: usize,
    error: &'a str,
}

/// Default sink that emits dead-lettered messages as WARN-level JSON records.
///
/// Suitable for development; production deployments should supply a durable
/// sink instead.
#[derive(Debug, Default, Clone)]
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn publish(&self, message: &InboundMessage, error: &str) -> Result<()> {
        let record = DeadLetterRecord {
            topic: &message.topic,
            partition: message.partition,
            offset: message.offset,
            key: message.key.as_deref(),
            payload_len: message.payload.len(),
            error,
        };
        let json = serde_json::to_string(&record)?;
        warn!(record = %json, "message routed to dead-letter sink");
        Ok(())
    }
}
