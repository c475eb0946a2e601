use crate::envelope::{MessageEnvelope, PublishResult};
use crate::error::{PipelineError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Final disposition reported for a pending entry
#[derive(Debug, Clone)]
pub enum Resolution {
    Acked,
    Failed(String),
    TimedOut,
}

struct Entry {
    envelope: MessageEnvelope,
    attempts: u32,
    deadline: Instant,
}

struct Inner {
    pending: HashMap<u32, Entry>,
    resolved: Vec<PublishResult>,
}

/// In-memory correlation of in-flight envelopes to pending acknowledgments.
///
/// One tracker instance serves exactly one batch; different batches never
/// share a tracker and never contend. Resolve calls may arrive concurrently
/// from broker-callback contexts; all mutations serialize through a single
/// lock, and every mutation that changes the pending set wakes the
/// coordinating task.
///
/// Invariant: every sequence index registered has exactly one pending entry
/// from submission until resolution and zero afterward. Re-registering is
/// rejected with `DuplicateEntry`; resolving an absent index (including a
/// second resolve of the same index) is rejected with `UnknownEntry`.
pub struct AckTracker {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl AckTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                resolved: Vec::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Register an envelope as pending with attempts = 0
    pub fn register(&self, envelope: MessageEnvelope, deadline: Instant) -> Result<()> {
        let mut inner = self.inner.lock();
        let sequence_index = envelope.sequence_index;
        if inner.pending.contains_key(&sequence_index) {
            return Err(PipelineError::DuplicateEntry { sequence_index });
        }
        inner.pending.insert(
            sequence_index,
            Entry {
                envelope,
                attempts: 0,
                deadline,
            },
        );
        Ok(())
    }

    /// Count one send attempt for the entry, returning the new attempt count
    pub fn record_attempt(&self, sequence_index: u32) -> Result<u32> {
        let mut inner = self.inner.lock();
        let entry = inner
            .pending
            .get_mut(&sequence_index)
            .ok_or(PipelineError::UnknownEntry { sequence_index })?;
        entry.attempts += 1;
        Ok(entry.attempts)
    }

    /// Reset the entry's deadline ahead of a retry re-dispatch
    pub fn reset_deadline(&self, sequence_index: u32, deadline: Instant) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .pending
            .get_mut(&sequence_index)
            .ok_or(PipelineError::UnknownEntry { sequence_index })?;
        entry.deadline = deadline;
        Ok(())
    }

    /// Remove the pending entry and materialize its result.
    ///
    /// Fails with `UnknownEntry` when the index is absent, which includes a
    /// second resolve of an already-resolved index.
    pub fn resolve(&self, sequence_index: u32, resolution: Resolution) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .pending
            .remove(&sequence_index)
            .ok_or(PipelineError::UnknownEntry { sequence_index })?;

        let result = match resolution {
            Resolution::Acked => PublishResult::acked(sequence_index, entry.attempts),
            Resolution::Failed(error) => {
                PublishResult::failed(sequence_index, entry.attempts, error)
            }
            Resolution::TimedOut => PublishResult::timed_out(sequence_index, entry.attempts),
        };
        inner.resolved.push(result);
        drop(inner);

        self.notify.notify_waiters();
        Ok(())
    }

    /// Number of entries still awaiting resolution
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Snapshot the envelope still pending under this index, if any
    pub fn pending_envelope(&self, sequence_index: u32) -> Option<MessageEnvelope> {
        self.inner
            .lock()
            .pending
            .get(&sequence_index)
            .map(|entry| entry.envelope.clone())
    }

    /// Remove entries past their deadline, record them as TimedOut, and
    /// return the swept sequence indices
    pub fn sweep_expired(&self, now: Instant) -> Vec<u32> {
        let mut inner = self.inner.lock();
        let expired: Vec<u32> = inner
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();

        for sequence_index in &expired {
            if let Some(entry) = inner.pending.remove(sequence_index) {
                inner
                    .resolved
                    .push(PublishResult::timed_out(*sequence_index, entry.attempts));
            }
        }
        drop(inner);

        if !expired.is_empty() {
            self.notify.notify_waiters();
        }
        expired
    }

    /// Resolve every remaining entry as TimedOut, returning how many were
    /// swept. Used at the batch deadline and on cancellation.
    pub fn fail_remaining(&self) -> usize {
        let mut inner = self.inner.lock();
        let remaining: Vec<u32> = inner.pending.keys().copied().collect();
        for sequence_index in &remaining {
            if let Some(entry) = inner.pending.remove(sequence_index) {
                inner
                    .resolved
                    .push(PublishResult::timed_out(*sequence_index, entry.attempts));
            }
        }
        drop(inner);

        self.notify.notify_waiters();
        remaining.len()
    }

    /// Drain the accumulated results, sorted by sequence index
    pub fn take_results(&self) -> Vec<PublishResult> {
        let mut results = std::mem::take(&mut self.inner.lock().resolved);
        results.sort_by_key(|r| r.sequence_index);
        results
    }

    /// Wait until some entry resolves or is swept.
    ///
    /// Callers re-check `pending_count` after waking; the coordinator pairs
    /// this with a periodic sweep tick, so a wakeup lost to the registration
    /// race only delays one tick.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}
