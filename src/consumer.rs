use crate::{
    broker::{BrokerClient, DeadLetterSink, Delivery, InboundMessage, LoggingDeadLetterSink},
    config::WorkerConfig,
    error::{PipelineError, Result},
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error type returned by message handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of one handler invocation
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// User-supplied processing callback invoked once per received message per
/// attempt
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(InboundMessage) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, message: &InboundMessage) -> HandlerResult {
        (self)(message.clone()).await
    }
}

/// Observable worker loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Receiving,
    Handling,
    Committing,
    Stopped,
}

/// Consumer worker counters
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    pub messages_received: AtomicU64,
    pub messages_handled: AtomicU64,
    pub handler_failures: AtomicU64,
    pub redeliveries: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub offsets_committed: AtomicU64,
}

/// Pulls messages for one topic/group subscription and applies
/// commit-on-success semantics.
///
/// The loop is `Idle → Receiving → Handling → Committing → Receiving …` with
/// `Stopped` reached only on explicit cancellation or an unrecoverable broker
/// session error. Cancellation is checked at the top of Receiving; a handler
/// invocation already in progress always runs to completion.
///
/// A message whose handler keeps failing is redelivered in process up to
/// `max_redeliveries` times, then routed to the dead-letter sink and its
/// offset committed anyway so the partition cannot stall on one poison
/// message (see [`WorkerConfig::max_redeliveries`]).
pub struct ConsumerWorker {
    id: String,
    topic: String,
    group_id: String,
    config: Arc<WorkerConfig>,
    broker: Arc<dyn BrokerClient>,
    handler: Arc<dyn Handler>,
    dead_letter: Arc<dyn DeadLetterSink>,
    committed_offsets: Arc<DashMap<u32, u64>>,
    metrics: Arc<WorkerMetrics>,
    state: Arc<Mutex<WorkerState>>,
}

/// Builder for consumer workers
pub struct WorkerBuilder {
    topic: Option<String>,
    group_id: Option<String>,
    config: Option<WorkerConfig>,
    broker: Option<Arc<dyn BrokerClient>>,
    handler: Option<Arc<dyn Handler>>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
}

/// Running worker handle returned by [`ConsumerWorker::spawn`]
pub struct WorkerHandle {
    id: String,
    topic: String,
    group_id: String,
    cancel: CancellationToken,
    join: JoinHandle<Result<()>>,
    metrics: Arc<WorkerMetrics>,
    state: Arc<Mutex<WorkerState>>,
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self {
            topic: None,
            group_id: None,
            config: None,
            broker: None,
            handler: None,
            dead_letter: None,
        }
    }

    /// Set the subscribed topic
    pub fn topic<T: Into<String>>(mut self, topic: T) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the consumer group
    pub fn group_id<T: Into<String>>(mut self, group_id: T) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Set worker configuration
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the broker client
    pub fn broker(mut self, broker: Arc<dyn BrokerClient>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set the message handler
    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set the dead-letter sink; defaults to [`LoggingDeadLetterSink`]
    pub fn dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    /// Build the worker
    pub fn build(self) -> Result<ConsumerWorker> {
        let topic = self
            .topic
            .ok_or_else(|| PipelineError::InvalidConfig("Worker topic is required".to_string()))?;
        let group_id = self.group_id.ok_or_else(|| {
            PipelineError::InvalidConfig("Consumer group is required".to_string())
        })?;
        let broker = self
            .broker
            .ok_or_else(|| PipelineError::InvalidConfig("Broker client is required".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| PipelineError::InvalidConfig("Handler is required".to_string()))?;

        let config = Arc::new(self.config.unwrap_or_default());
        let id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
        let dead_letter = self
            .dead_letter
            .unwrap_or_else(|| Arc::new(LoggingDeadLetterSink));

        Ok(ConsumerWorker {
            id,
            topic,
            group_id,
            config,
            broker,
            handler,
            dead_letter,
            committed_offsets: Arc::new(DashMap::new()),
            metrics: Arc::new(WorkerMetrics::default()),
            state: Arc::new(Mutex::new(WorkerState::Idle)),
        })
    }
}

impl ConsumerWorker {
    /// Start the worker loop and return its handle
    pub fn spawn(self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let handle_cancel = cancel.clone();

        let id = self.id.clone();
        let topic = self.topic.clone();
        let group_id = self.group_id.clone();
        let metrics = self.metrics.clone();
        let state = self.state.clone();

        info!(worker = %id, topic = %topic, group = %group_id, "starting consumer worker");
        let join = tokio::spawn(async move { self.run(cancel).await });

        WorkerHandle {
            id,
            topic,
            group_id,
            cancel: handle_cancel,
            join,
            metrics,
            state,
        }
    }

    async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut stream = match self.broker.subscribe(&self.topic, &self.group_id).await {
            Ok(stream) => stream,
            Err(err) => {
                self.set_state(WorkerState::Stopped);
                error!(worker = %self.id, error = %err, "subscription failed");
                return Err(PipelineError::BrokerSession(format!(
                    "subscribe failed: {err}"
                )));
            }
        };

        let outcome = loop {
            self.set_state(WorkerState::Receiving);

            let delivery = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(worker = %self.id, "cancellation observed, stopping");
                    break Ok(());
                }
                next = stream.next() => match next {
                    Some(delivery) => delivery,
                    None => {
                        error!(worker = %self.id, "subscription stream ended unexpectedly");
                        break Err(PipelineError::BrokerSession(
                            "subscription stream ended".to_string(),
                        ));
                    }
                }
            };

            self.metrics
                .messages_received
                .fetch_add(1, Ordering::Relaxed);
            self.process(delivery).await;
        };

        self.set_state(WorkerState::Stopped);
        info!(worker = %self.id, "consumer worker stopped");
        outcome
    }

    /// Handle one delivery to completion: success commits, repeated failure
    /// dead-letters. Never propagates handler errors to the loop.
    async fn process(&self, delivery: Delivery) {
        let mut failures = 0u32;

        loop {
            self.set_state(WorkerState::Handling);
            match self.handler.handle(&delivery.message).await {
                Ok(()) => {
                    self.metrics.messages_handled.fetch_add(1, Ordering::Relaxed);
                    self.commit(delivery).await;
                    return;
                }
                Err(err) => {
                    failures += 1;
                    self.metrics.handler_failures.fetch_add(1, Ordering::Relaxed);

                    if failures > self.config.max_redeliveries {
                        self.route_to_dead_letter(delivery, &err).await;
                        return;
                    }

                    self.metrics.redeliveries.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        worker = %self.id,
                        offset = delivery.message.offset,
                        partition = delivery.message.partition,
                        failures,
                        error = %err,
                        "handler failed, redelivering"
                    );
                    if !self.config.redelivery_delay.is_zero() {
                        tokio::time::sleep(self.config.redelivery_delay).await;
                    }
                }
            }
        }
    }

    /// Route an exhausted message to the dead-letter sink, then commit its
    /// offset so the partition keeps moving. A sink failure leaves the offset
    /// uncommitted so the broker can redeliver after a restart or rebalance.
    async fn route_to_dead_letter(&self, delivery: Delivery, err: &HandlerError) {
        warn!(
            worker = %self.id,
            offset = delivery.message.offset,
            partition = delivery.message.partition,
            error = %err,
            "redeliveries exhausted, routing to dead-letter sink"
        );

        match self
            .dead_letter
            .publish(&delivery.message, &err.to_string())
            .await
        {
            Ok(()) => {
                self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
                self.commit(delivery).await;
            }
            Err(sink_err) => {
                error!(
                    worker = %self.id,
                    offset = delivery.message.offset,
                    error = %sink_err,
                    "dead-letter sink failed, offset left uncommitted"
                );
            }
        }
    }

    /// Commit the delivery's offset, keeping per-partition tracking monotonic
    async fn commit(&self, delivery: Delivery) {
        self.set_state(WorkerState::Committing);

        let partition = delivery.message.partition;
        let offset = delivery.message.offset;

        if !self.advance_offset(partition, offset) {
            warn!(
                worker = %self.id,
                partition,
                offset,
                "skipping commit that would regress the partition offset"
            );
            return;
        }

        match delivery.commit().await {
            Ok(()) => {
                self.metrics
                    .offsets_committed
                    .fetch_add(1, Ordering::Relaxed);
                debug!(worker = %self.id, partition, offset, "offset committed");
            }
            Err(err) => {
                // At-least-once: a missed commit only means redelivery later
                warn!(
                    worker = %self.id,
                    partition,
                    offset,
                    error = %err,
                    "offset commit failed"
                );
            }
        }
    }

    /// Record the offset locally; returns false when it would move backwards
    fn advance_offset(&self, partition: u32, offset: u64) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.committed_offsets.entry(partition) {
            Entry::Occupied(mut entry) => {
                if offset <= *entry.get() {
                    false
                } else {
                    entry.insert(offset);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(offset);
                true
            }
        }
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }

    /// Get the worker ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the subscribed topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Get the consumer group
    pub fn group_id(&self) -> &str {
        &self.group_id
    }
}

impl WorkerHandle {
    /// Request a cooperative stop.
    ///
    /// The signal is observed between messages; an in-flight handler
    /// invocation finishes first.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the loop to exit, surfacing fatal broker-session errors
    pub async fn join(self) -> Result<()> {
        self.join
            .await
            .map_err(|err| PipelineError::Worker(format!("worker task panicked: {err}")))?
    }

    /// Stop and wait for the worker to wind down
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.join().await
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Token that stops this worker when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current loop state
    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Get worker counters
    pub fn metrics(&self) -> Arc<WorkerMetrics> {
        self.metrics.clone()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
