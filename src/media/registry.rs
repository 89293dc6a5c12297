use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use frame_source::Frame;
use tokio::time::Instant;

use crate::media::consumer::{Consumer, ConsumerId};

/// Outcome of distributing one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Consumers that accepted the frame.
    pub delivered: usize,
    /// Consumers whose queue was full; they miss this frame.
    pub dropped: usize,
    /// Cancelled consumers removed instead of enqueued.
    pub removed: usize,
}

/// Currently connected consumers.
///
/// Iteration works on a snapshot, so consumers may be added or removed
/// concurrently with a fan-out. The lock is never held while calling out.
#[derive(Clone, Default)]
pub struct ConsumerRegistry {
    inner: Arc<Mutex<HashMap<ConsumerId, Consumer>>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConsumerId, Consumer>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, consumer: Consumer) {
        log::info!(
            "registry: add consumer {} ({})",
            consumer.id(),
            consumer.label()
        );
        self.lock().insert(consumer.id(), consumer);
    }

    pub fn remove(&self, id: ConsumerId) -> Option<Consumer> {
        let removed = self.lock().remove(&id);
        if let Some(consumer) = &removed {
            log::info!(
                "registry: remove consumer {} ({})",
                consumer.id(),
                consumer.label()
            );
        }
        removed
    }

    pub fn for_each(&self, mut f: impl FnMut(&Consumer)) {
        let snapshot: Vec<Consumer> = self.lock().values().cloned().collect();
        for consumer in &snapshot {
            f(consumer);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Removes every consumer whose cancellation signal has fired.
    pub fn prune_cancelled(&self) -> usize {
        let mut cancelled = Vec::new();
        self.for_each(|consumer| {
            if consumer.is_cancelled() {
                cancelled.push(consumer.id());
            }
        });
        cancelled
            .into_iter()
            .filter(|id| self.remove(*id).is_some())
            .count()
    }

    /// Offers `frame` to every live consumer without blocking.
    pub fn fan_out(&self, frame: &Frame) -> FanOut {
        let mut report = FanOut::default();
        self.for_each(|consumer| {
            if consumer.is_cancelled() {
                if self.remove(consumer.id()).is_some() {
                    report.removed += 1;
                }
            } else if consumer.try_send(frame.clone()) {
                report.delivered += 1;
            } else {
                log::trace!(
                    "registry: consumer {} still has {} frame(s) queued, dropping",
                    consumer.id(),
                    consumer.queued()
                );
                report.dropped += 1;
            }
        });
        report
    }

    /// Latest activity across all consumers, None when empty.
    pub fn last_activity(&self) -> Option<Instant> {
        let mut latest: Option<Instant> = None;
        self.for_each(|consumer| {
            let activity = consumer.last_activity();
            latest = Some(latest.map_or(activity, |l| l.max(activity)));
        });
        latest
    }

    /// Cancels and removes every consumer.
    pub fn clear(&self) {
        let drained: Vec<Consumer> = self.lock().drain().map(|(_, c)| c).collect();
        for consumer in drained {
            consumer.cancel();
        }
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod registry_test;
