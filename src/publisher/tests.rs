use super::*;
use crate::{
    broker::{Delivery, SendAck},
    envelope::{BatchRequest, PublishStatus},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;

/// Mock broker scripted through payload contents:
/// - `"perm"`      rejects with a permanent error
/// - `"transient"` rejects with a transient error on every attempt
/// - `"flaky:N"`   rejects transiently N times, then acks
/// - `"slow-ack"`  acks after a 100ms pause
/// - `"hang…"`     never resolves
/// - anything else acks immediately
struct MockBroker {
    sends: AtomicUsize,
    attempts: parking_lot::Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    max_in_flight_seen: AtomicUsize,
    send_delay: Duration,
}

impl MockBroker {
    fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(send_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            sends: AtomicUsize::new(0),
            attempts: parking_lot::Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight_seen: AtomicUsize::new(0),
            send_delay,
        })
    }

    fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    fn attempts_for(&self, payload: &str) -> u32 {
        self.attempts.lock().get(payload).copied().unwrap_or(0)
    }

    fn peak_in_flight(&self) -> usize {
        self.max_in_flight_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn send(&self, _topic: &str, _key: Option<&str>, payload: Bytes) -> Result<SendAck> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight_seen.fetch_max(current, Ordering::SeqCst);

        let script = String::from_utf8_lossy(&payload).to_string();
        let attempt = {
            let mut attempts = self.attempts.lock();
            let counter = attempts.entry(script.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }

        if script.starts_with("hang") {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            futures::future::pending::<()>().await;
            unreachable!();
        }

        let result = if script == "perm" {
            Err(PipelineError::PermanentBroker(
                "message rejected by broker".to_string(),
            ))
        } else if script == "transient" {
            Err(PipelineError::TransientBroker(
                "leader unavailable".to_string(),
            ))
        } else if let Some(fail_count) = script.strip_prefix("flaky:") {
            let fail_count: u32 = fail_count.parse().unwrap();
            if attempt <= fail_count {
                Err(PipelineError::TransientBroker(
                    "leader unavailable".to_string(),
                ))
            } else {
                Ok(SendAck {
                    partition: 0,
                    offset: attempt as u64,
                })
            }
        } else if script == "slow-ack" {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(SendAck {
                partition: 0,
                offset: attempt as u64,
            })
        } else {
            Ok(SendAck {
                partition: 0,
                offset: attempt as u64,
            })
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn subscribe(
        &self,
        _topic: &str,
        _group_id: &str,
    ) -> Result<BoxStream<'static, Delivery>> {
        Err(PipelineError::BrokerSession(
            "mock broker has no subscriptions".to_string(),
        ))
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(10),
    }
}

fn test_publisher(broker: Arc<MockBroker>, config: PublisherConfig) -> BatchPublisher {
    PublisherBuilder::new()
        .broker(broker)
        .config(config)
        .build()
        .unwrap()
}

fn default_test_config() -> PublisherConfig {
    PublisherConfig {
        publisher_id: Some("test-publisher".to_string()),
        retry: fast_retry(),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_all_acked_within_deadline() {
    let broker = MockBroker::new();
    let publisher = test_publisher(broker.clone(), default_test_config());

    let payloads: Vec<String> = (0..5).map(|i| format!("message-{i}")).collect();
    let outcome = publisher
        .publish(BatchRequest::new("events", payloads))
        .await
        .unwrap();

    assert_eq!(outcome.results.len(), 5);
    assert_eq!(outcome.total_acked, 5);
    assert_eq!(outcome.total_failed, 0);
    assert_eq!(outcome.total_timed_out(), 0);
    assert_eq!(outcome.total_sent, 5);
    assert!(outcome.is_fully_acked());
    assert_eq!(broker.sends(), 5);

    for (position, result) in outcome.results.iter().enumerate() {
        assert_eq!(result.sequence_index, position as u32);
        assert_eq!(result.attempts, 1);
        assert!(result.error.is_none());
    }
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_preserves_submission_order() {
    let broker = MockBroker::new();
    let publisher = test_publisher(broker.clone(), default_test_config());

    let outcome = publisher
        .publish(BatchRequest::new("events", vec!["first", "perm", "third"]))
        .await
        .unwrap();

    let statuses: Vec<PublishStatus> = outcome.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            PublishStatus::Acked,
            PublishStatus::Failed,
            PublishStatus::Acked
        ]
    );
    assert_eq!(outcome.total_acked, 2);
    assert_eq!(outcome.total_failed, 1);
    assert!(outcome.results[1].error.as_deref().unwrap().contains("rejected"));
    // Permanent errors are not retried
    assert_eq!(broker.attempts_for("perm"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_order_completion_is_resorted() {
    let broker = MockBroker::new();
    let publisher = test_publisher(broker.clone(), default_test_config());

    let outcome = publisher
        .publish(BatchRequest::new(
            "events",
            vec!["slow-ack", "fast-0", "slow-ack", "fast-1"],
        ))
        .await
        .unwrap();

    assert!(outcome.is_fully_acked());
    let indices: Vec<u32> = outcome.results.iter().map(|r| r.sequence_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_unacked_entry_times_out_at_batch_deadline() {
    let broker = MockBroker::new();
    let config = PublisherConfig {
        batch_deadline: Duration::from_millis(100),
        per_message_timeout: Duration::from_secs(5),
        ..default_test_config()
    };
    let publisher = test_publisher(broker.clone(), config);

    let outcome = publisher
        .publish(BatchRequest::new("events", vec!["quick", "hang"]))
        .await
        .unwrap();

    assert_eq!(outcome.results[0].status, PublishStatus::Acked);
    assert_eq!(outcome.results[1].status, PublishStatus::TimedOut);
    assert_eq!(outcome.total_acked, 1);
    assert_eq!(outcome.total_failed, 0);
    assert_eq!(outcome.total_timed_out(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_per_message_timeout_resolves_entry() {
    let broker = MockBroker::new();
    let config = PublisherConfig {
        per_message_timeout: Duration::from_millis(50),
        batch_deadline: Duration::from_secs(30),
        ..default_test_config()
    };
    let publisher = test_publisher(broker.clone(), config);

    let outcome = publisher
        .publish(BatchRequest::new("events", vec!["hang"]))
        .await
        .unwrap();

    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].status, PublishStatus::TimedOut);
    assert_eq!(outcome.results[0].attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_retried_until_ack() {
    let broker = MockBroker::new();
    let publisher = test_publisher(broker.clone(), default_test_config());

    let outcome = publisher
        .publish(BatchRequest::new("events", vec!["flaky:2"]))
        .await
        .unwrap();

    assert!(outcome.is_fully_acked());
    assert_eq!(outcome.results[0].attempts, 3);
    assert_eq!(broker.attempts_for("flaky:2"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_attempts_are_bounded() {
    let broker = MockBroker::new();
    let publisher = test_publisher(broker.clone(), default_test_config());

    let outcome = publisher
        .publish(BatchRequest::new("events", vec!["transient"]))
        .await
        .unwrap();

    assert_eq!(outcome.results[0].status, PublishStatus::Failed);
    assert_eq!(outcome.results[0].attempts, 3);
    // Never dispatched beyond max_attempts
    assert_eq!(broker.sends(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_request_retry_policy_overrides_config() {
    let broker = MockBroker::new();
    let publisher = test_publisher(broker.clone(), default_test_config());

    let request = BatchRequest::new("events", vec!["transient"]).retry_policy(RetryPolicy {
        max_attempts: 1,
        ..fast_retry()
    });
    let outcome = publisher.publish(request).await.unwrap();

    assert_eq!(outcome.results[0].status, PublishStatus::Failed);
    assert_eq!(broker.sends(), 1);
}

#[tokio::test]
async fn test_empty_batch_rejected_before_dispatch() {
    let broker = MockBroker::new();
    let publisher = test_publisher(broker.clone(), default_test_config());

    let err = publisher
        .publish(BatchRequest::new("events", Vec::<Bytes>::new()))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::InvalidRequest(_)));
    assert_eq!(broker.sends(), 0);
}

#[tokio::test]
async fn test_empty_topic_rejected_before_dispatch() {
    let broker = MockBroker::new();
    let publisher = test_publisher(broker.clone(), default_test_config());

    let err = publisher
        .publish(BatchRequest::new("", vec!["payload"]))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::InvalidRequest(_)));
    assert_eq!(broker.sends(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_sends_bounded_by_config() {
    let broker = MockBroker::with_delay(Duration::from_millis(10));
    let config = PublisherConfig {
        max_in_flight: 3,
        ..default_test_config()
    };
    let publisher = test_publisher(broker.clone(), config);

    let payloads: Vec<String> = (0..12).map(|i| format!("message-{i}")).collect();
    let outcome = publisher
        .publish(BatchRequest::new("events", payloads))
        .await
        .unwrap();

    assert!(outcome.is_fully_acked());
    assert!(
        broker.peak_in_flight() <= 3,
        "observed {} concurrent sends",
        broker.peak_in_flight()
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_returns_with_timed_out_remainder() {
    let broker = MockBroker::new();
    let config = PublisherConfig {
        batch_deadline: Duration::from_secs(60),
        ..default_test_config()
    };
    let publisher = test_publisher(broker.clone(), config);

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let outcome = publisher
        .publish_with_cancel(BatchRequest::new("events", vec!["hang", "hang-2"]), token)
        .await
        .unwrap();

    assert_eq!(outcome.results.len(), 2);
    for result in &outcome.results {
        assert_eq!(result.status, PublishStatus::TimedOut);
    }
    assert_eq!(outcome.total_sent, 2);
}

#[tokio::test(start_paused = true)]
async fn test_metrics_accumulate_across_batches() {
    let broker = MockBroker::new();
    let publisher = test_publisher(broker.clone(), default_test_config());

    publisher
        .publish(BatchRequest::new("events", vec!["a", "b"]))
        .await
        .unwrap();
    publisher
        .publish(BatchRequest::new("events", vec!["c", "perm"]))
        .await
        .unwrap();

    let metrics = publisher.metrics();
    assert_eq!(metrics.batches_published.load(Ordering::Relaxed), 2);
    assert_eq!(metrics.envelopes_acked.load(Ordering::Relaxed), 3);
    assert_eq!(metrics.envelopes_failed.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.send_attempts.load(Ordering::Relaxed), 4);
}

#[tokio::test]
async fn test_builder_requires_broker() {
    let result = PublisherBuilder::new().build();
    assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_builder_rejects_zero_limits() {
    let broker = MockBroker::new();

    let result = PublisherBuilder::new()
        .broker(broker.clone() as Arc<dyn BrokerClient>)
        .config(PublisherConfig {
            max_in_flight: 0,
            ..Default::default()
        })
        .build();
    assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));

    let result = PublisherBuilder::new()
        .broker(broker as Arc<dyn BrokerClient>)
        .config(PublisherConfig {
            retry: RetryPolicy {
                max_attempts: 0,
                ..Default::default()
            },
            ..Default::default()
        })
        .build();
    assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_publisher_id_assignment() {
    let broker = MockBroker::new();
    let custom = test_publisher(broker.clone(), default_test_config());
    assert_eq!(custom.id(), "test-publisher");

    let generated = PublisherBuilder::new()
        .broker(broker as Arc<dyn BrokerClient>)
        .build()
        .unwrap();
    assert!(generated.id().starts_with("publisher-"));
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// Every submitted payload resolves to exactly one result, in
        /// submission order, regardless of the per-payload outcome mix.
        #[test]
        fn prop_outcome_complete_and_ordered(script in proptest::collection::vec(any::<bool>(), 1..20)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let broker = MockBroker::new();
                let publisher = test_publisher(broker, default_test_config());

                let payloads: Vec<String> = script
                    .iter()
                    .enumerate()
                    .map(|(i, acks)| if *acks { format!("ok-{i}") } else { "perm".to_string() })
                    .collect();

                let outcome = publisher
                    .publish(BatchRequest::new("events", payloads))
                    .await
                    .unwrap();

                assert_eq!(outcome.results.len(), script.len());
                for (position, result) in outcome.results.iter().enumerate() {
                    assert_eq!(result.sequence_index, position as u32);
                    let expected = if script[position] {
                        PublishStatus::Acked
                    } else {
                        PublishStatus::Failed
                    };
                    assert_eq!(result.status, expected);
                    assert_eq!(result.error.is_none(), script[position]);
                }
            });
        }
    }
}
