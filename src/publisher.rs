use crate::{
    broker::BrokerClient,
    config::{PublisherConfig, RetryPolicy},
    envelope::{new_batch_id, BatchOutcome, BatchRequest, MessageEnvelope},
    error::{PipelineError, Result},
    tracker::{AckTracker, Resolution},
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Publishes logical batches to the broker and reports per-envelope outcomes.
///
/// One `publish` call fans its envelopes out to the broker with at most
/// `max_in_flight` sends in flight, retries transient failures with capped
/// exponential backoff, and blocks only until every entry resolves or the
/// batch deadline elapses. The call never fails wholesale after validation:
/// partial failure is an expected outcome, surfaced per message in the
/// returned [`BatchOutcome`].
#[derive(Clone)]
pub struct BatchPublisher {
    id: String,
    broker: Arc<dyn BrokerClient>,
    config: Arc<PublisherConfig>,
    metrics: Arc<PublisherMetrics>,
}

/// Builder pattern for configuring and creating publisher instances
///
/// # Example
///
/// ```ignore
/// let publisher = PublisherBuilder::new()
///     .broker(broker)
///     .config(PublisherConfig {
///         max_in_flight: 8,
///         batch_deadline: Duration::from_secs(10),
///         ..Default::default()
///     })
///     .build()?;
/// ```
pub struct PublisherBuilder {
    broker: Option<Arc<dyn BrokerClient>>,
    config: Option<PublisherConfig>,
}

/// Publisher performance counters
#[derive(Debug, Default)]
pub struct PublisherMetrics {
    /// Batches that completed a publish call
    pub batches_published: AtomicU64,
    /// Individual send attempts dispatched to the broker
    pub send_attempts: AtomicU64,
    pub envelopes_acked: AtomicU64,
    pub envelopes_failed: AtomicU64,
    pub envelopes_timed_out: AtomicU64,
    /// Broker resolutions that arrived after the entry was already resolved
    pub late_resolutions: AtomicU64,
}

/// Everything a per-envelope send task needs, shared across the batch
struct SendContext {
    batch_id: String,
    broker: Arc<dyn BrokerClient>,
    tracker: Arc<AckTracker>,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    per_message_timeout: Duration,
    cancel: CancellationToken,
    metrics: Arc<PublisherMetrics>,
    dispatched: AtomicU64,
}

impl PublisherBuilder {
    pub fn new() -> Self {
        Self {
            broker: None,
            config: None,
        }
    }

    /// Set the broker client used for every send
    pub fn broker(mut self, broker: Arc<dyn BrokerClient>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set custom publisher configuration; defaults are used otherwise
    pub fn config(mut self, config: PublisherConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the publisher
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the broker is missing or the configured
    /// limits are zero.
    pub fn build(self) -> Result<BatchPublisher> {
        let broker = self
            .broker
            .ok_or_else(|| PipelineError::InvalidConfig("Broker client is required".to_string()))?;
        let config = self.config.unwrap_or_default();

        if config.max_in_flight == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        if config.retry.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| format!("publisher-{}", Uuid::new_v4()));

        info!(publisher = %id, "created batch publisher");
        Ok(BatchPublisher {
            id,
            broker,
            config: Arc::new(config),
            metrics: Arc::new(PublisherMetrics::default()),
        })
    }
}

impl BatchPublisher {
    /// Publish a batch and wait for every envelope to resolve.
    ///
    /// Returns `InvalidRequest` before any send is dispatched when the request
    /// has no payloads or an empty topic. Otherwise the call always returns a
    /// complete [`BatchOutcome`] with one result per payload, ordered by
    /// sequence index; entries unresolved at the batch deadline come back as
    /// `TimedOut`.
    pub async fn publish(&self, request: BatchRequest) -> Result<BatchOutcome> {
        self.publish_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Publish a batch under a caller-supplied cancellation token.
    ///
    /// On cancellation, in-flight sends are not retracted (the broker may
    /// still deliver them) but no further retries are scheduled; the call
    /// returns immediately with whatever resolved so far plus `TimedOut` for
    /// the rest.
    pub async fn publish_with_cancel(
        &self,
        request: BatchRequest,
        cancel: CancellationToken,
    ) -> Result<BatchOutcome> {
        if request.items.is_empty() {
            return Err(PipelineError::InvalidRequest(
                "batch contains no payloads".to_string(),
            ));
        }
        if request.topic.is_empty() {
            return Err(PipelineError::InvalidRequest(
                "topic must not be empty".to_string(),
            ));
        }

        let BatchRequest {
            topic,
            items,
            retry,
        } = request;

        let batch_id = new_batch_id();
        let retry = retry.unwrap_or_else(|| self.config.retry.clone());
        let tracker = Arc::new(AckTracker::new());
        let now = Instant::now();
        let batch_deadline = now + self.config.batch_deadline;
        let total = items.len();

        // Register the whole window before the first dispatch so the tracker
        // invariant holds for every sequence index of the batch.
        let mut envelopes = Vec::with_capacity(total);
        for (position, item) in items.into_iter().enumerate() {
            let envelope = MessageEnvelope::new(
                topic.clone(),
                item.key,
                item.payload,
                position as u32,
            );
            tracker.register(envelope.clone(), now + self.config.per_message_timeout)?;
            envelopes.push(envelope);
        }

        debug!(
            batch = %batch_id,
            publisher = %self.id,
            topic = %topic,
            messages = total,
            "dispatching batch"
        );

        let send_cancel = cancel.child_token();
        let context = Arc::new(SendContext {
            batch_id: batch_id.clone(),
            broker: self.broker.clone(),
            tracker: tracker.clone(),
            semaphore: Arc::new(Semaphore::new(self.config.max_in_flight)),
            retry,
            per_message_timeout: self.config.per_message_timeout,
            cancel: send_cancel.clone(),
            metrics: self.metrics.clone(),
            dispatched: AtomicU64::new(0),
        });

        for envelope in envelopes {
            let context = context.clone();
            tokio::spawn(async move {
                send_envelope(context, envelope).await;
            });
        }

        self.wait_for_resolution(&batch_id, &tracker, batch_deadline, &cancel)
            .await;

        // Stops pending backoffs and queued dispatches; a send already on the
        // wire runs to completion and surfaces as a late resolution.
        send_cancel.cancel();

        let results = tracker.take_results();
        let dispatched = context.dispatched.load(Ordering::Relaxed) as u32;
        let outcome = BatchOutcome::new(batch_id, dispatched, results);
        self.record_outcome(&outcome);

        info!(
            batch = %outcome.batch_id,
            publisher = %self.id,
            acked = outcome.total_acked,
            failed = outcome.total_failed,
            timed_out = outcome.total_timed_out(),
            "batch resolved"
        );
        Ok(outcome)
    }

    /// Block until the tracker empties, the batch deadline passes, or the
    /// caller cancels
    async fn wait_for_resolution(
        &self,
        batch_id: &str,
        tracker: &Arc<AckTracker>,
        batch_deadline: Instant,
        cancel: &CancellationToken,
    ) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if tracker.pending_count() == 0 {
                return;
            }

            tokio::select! {
                _ = tracker.changed() => {}
                _ = sweep.tick() => {
                    let swept = tracker.sweep_expired(Instant::now());
                    if !swept.is_empty() {
                        warn!(
                            batch = %batch_id,
                            expired = ?swept,
                            "entries expired before acknowledgment"
                        );
                    }
                }
                _ = tokio::time::sleep_until(batch_deadline) => {
                    let remaining = tracker.fail_remaining();
                    if remaining > 0 {
                        warn!(
                            batch = %batch_id,
                            remaining,
                            "batch deadline elapsed with unresolved entries"
                        );
                    }
                    return;
                }
                _ = cancel.cancelled() => {
                    let remaining = tracker.fail_remaining();
                    debug!(
                        batch = %batch_id,
                        remaining,
                        "publish cancelled, unresolved entries marked timed out"
                    );
                    return;
                }
            }
        }
    }

    fn record_outcome(&self, outcome: &BatchOutcome) {
        self.metrics.batches_published.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .envelopes_acked
            .fetch_add(outcome.total_acked as u64, Ordering::Relaxed);
        self.metrics
            .envelopes_failed
            .fetch_add(outcome.total_failed as u64, Ordering::Relaxed);
        self.metrics
            .envelopes_timed_out
            .fetch_add(outcome.total_timed_out() as u64, Ordering::Relaxed);
    }

    /// Get the unique publisher ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the publisher configuration
    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Get publisher performance counters
    pub fn metrics(&self) -> Arc<PublisherMetrics> {
        self.metrics.clone()
    }
}

impl Default for PublisherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive one envelope to resolution: acquire an in-flight slot, dispatch,
/// classify the broker's answer, and retry transient failures under the
/// policy.
async fn send_envelope(context: Arc<SendContext>, envelope: MessageEnvelope) {
    let sequence_index = envelope.sequence_index;

    loop {
        if context.cancel.is_cancelled() {
            return;
        }

        let permit = tokio::select! {
            _ = context.cancel.cancelled() => return,
            permit = context.semaphore.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        // The entry can be swept while this task waits for a slot; an absent
        // entry means a final result already exists.
        let attempt = match context.tracker.record_attempt(sequence_index) {
            Ok(attempt) => attempt,
            Err(_) => return,
        };
        if attempt == 1 {
            context.dispatched.fetch_add(1, Ordering::Relaxed);
        }
        context.metrics.send_attempts.fetch_add(1, Ordering::Relaxed);

        let send = context.broker.send(
            &envelope.topic,
            envelope.key.as_deref(),
            envelope.payload.clone(),
        );
        let outcome = tokio::time::timeout(context.per_message_timeout, send).await;
        drop(permit);

        match outcome {
            Ok(Ok(ack)) => {
                debug!(
                    batch = %context.batch_id,
                    sequence_index,
                    partition = ack.partition,
                    offset = ack.offset,
                    "envelope acknowledged"
                );
                resolve_or_log_late(&context, sequence_index, Resolution::Acked);
                return;
            }
            Ok(Err(err)) if err.is_retryable() && context.retry.allows_retry(attempt) => {
                let backoff = context.retry.backoff_for(attempt);
                debug!(
                    batch = %context.batch_id,
                    sequence_index,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "transient broker error, scheduling retry"
                );
                tokio::select! {
                    _ = context.cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                let deadline = Instant::now() + context.per_message_timeout;
                if context
                    .tracker
                    .reset_deadline(sequence_index, deadline)
                    .is_err()
                {
                    // Swept during the backoff
                    return;
                }
            }
            Ok(Err(err)) => {
                debug!(
                    batch = %context.batch_id,
                    sequence_index,
                    attempt,
                    error = %err,
                    "envelope failed without further retries"
                );
                resolve_or_log_late(
                    &context,
                    sequence_index,
                    Resolution::Failed(err.to_string()),
                );
                return;
            }
            Err(_elapsed) => {
                resolve_or_log_late(&context, sequence_index, Resolution::TimedOut);
                return;
            }
        }
    }
}

/// Resolve the entry, surfacing resolutions that lost the race against a
/// deadline sweep instead of dropping them silently
fn resolve_or_log_late(context: &SendContext, sequence_index: u32, resolution: Resolution) {
    if let Err(err) = context.tracker.resolve(sequence_index, resolution) {
        context
            .metrics
            .late_resolutions
            .fetch_add(1, Ordering::Relaxed);
        warn!(
            batch = %context.batch_id,
            sequence_index,
            error = %err,
            "broker resolution arrived for an already-resolved entry"
        );
    }
}

#[cfg(test)]
mod tests;
