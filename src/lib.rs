//! ackflow
//!
//! Reliable batch publish-and-acknowledge pipeline over pluggable message
//! brokers: bounded fan-out publishing with per-message acknowledgment
//! tracking and retry, plus at-least-once consumer workers with
//! commit-on-success and dead-letter semantics.

pub mod broker;
pub mod client;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod publisher;
pub mod tracker;

pub use broker::{
    BrokerClient, Committer, DeadLetterSink, Delivery, InboundMessage, LoggingDeadLetterSink,
    SendAck,
};
pub use client::PipelineClient;
pub use config::{PublisherConfig, RetryPolicy, WorkerConfig};
pub use consumer::{
    ConsumerWorker, Handler, HandlerError, HandlerResult, WorkerBuilder, WorkerHandle,
    WorkerMetrics, WorkerState,
};
pub use envelope::{
    BatchItem, BatchOutcome, BatchRequest, MessageEnvelope, PublishResult, PublishStatus,
};
pub use error::{PipelineError, Result};
pub use publisher::{BatchPublisher, PublisherBuilder, PublisherMetrics};
pub use tracker::{AckTracker, Resolution};
