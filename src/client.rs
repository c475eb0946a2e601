use crate::{
    broker::{BrokerClient, DeadLetterSink},
    config::{PublisherConfig, WorkerConfig},
    consumer::{Handler, WorkerBuilder, WorkerHandle},
    error::Result,
    publisher::{BatchPublisher, PublisherBuilder},
};
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Entry point tying a broker client to publishers and consumer workers.
///
/// The broker client is the one resource shared across everything created
/// here; its lifecycle belongs to the composing process. Workers spawned via
/// [`subscribe`](PipelineClient::subscribe) register their stop tokens so
/// `close` can stop them together.
#[derive(Clone)]
pub struct PipelineClient {
    broker: Arc<dyn BrokerClient>,
    publisher_config: PublisherConfig,
    worker_config: WorkerConfig,
    workers: Arc<DashMap<String, CancellationToken>>,
}

impl PipelineClient {
    /// Create a client with default publisher and worker configuration
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            broker,
            publisher_config: PublisherConfig::default(),
            worker_config: WorkerConfig::default(),
            workers: Arc::new(DashMap::new()),
        }
    }

    /// Override the configuration used for publishers created by this client
    pub fn with_publisher_config(mut self, config: PublisherConfig) -> Self {
        self.publisher_config = config;
        self
    }

    /// Override the configuration used for workers created by this client
    pub fn with_worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    /// Create a batch publisher backed by this client's broker
    pub fn publisher(&self) -> Result<BatchPublisher> {
        PublisherBuilder::new()
            .broker(self.broker.clone())
            .config(self.publisher_config.clone())
            .build()
    }

    /// Spawn a consumer worker for the topic/group and register its handle
    pub async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<WorkerHandle> {
        self.subscribe_with_dead_letter(topic, group_id, handler, None)
            .await
    }

    /// Spawn a consumer worker with an explicit dead-letter sink
    pub async fn subscribe_with_dead_letter(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn Handler>,
        dead_letter: Option<Arc<dyn DeadLetterSink>>,
    ) -> Result<WorkerHandle> {
        let mut builder = WorkerBuilder::new()
            .topic(topic)
            .group_id(group_id)
            .config(self.worker_config.clone())
            .broker(self.broker.clone())
            .handler(handler);
        if let Some(sink) = dead_letter {
            builder = builder.dead_letter(sink);
        }

        let worker = builder.build()?;
        let handle = worker.spawn();

        // Resubscribing for the same topic/group stops the previous worker.
        let key = format!("{topic}:{group_id}");
        if let Some((_, previous)) = self.workers.remove(&key) {
            previous.cancel();
        }

        self.workers.insert(key, handle.cancellation_token());
        Ok(handle)
    }

    /// Signal every registered worker to stop.
    ///
    /// Stopping is cooperative; callers that need to wait should hold their
    /// own [`WorkerHandle`] and `join` it.
    pub fn close(&self) {
        for entry in self.workers.iter() {
            entry.value().cancel();
        }
        self.workers.clear();
    }

    /// Get the shared broker client
    pub fn broker(&self) -> Arc<dyn BrokerClient> {
        self.broker.clone()
    }

    /// Number of workers currently registered
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}
