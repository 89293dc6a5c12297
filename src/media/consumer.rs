use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
};
use std::time::Duration;

use frame_source::Frame;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

impl Display for ConsumerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Bounded frame queue with exactly one writer (the fan-out) and one reader
/// (the consumer's send loop).
pub struct FrameQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
}

struct QueueState {
    frames: VecDeque<Frame>,
    /// Reader is parked waiting for the next frame.
    waiting: bool,
    last_request: Instant,
}

impl FrameQueue {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                waiting: false,
                last_request: Instant::now(),
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueues without blocking. Returns false, dropping `frame`, when full.
    fn try_push(&self, frame: Frame) -> bool {
        {
            let mut state = self.lock();
            if state.frames.len() >= self.capacity {
                return false;
            }
            state.frames.push_back(frame);
        }
        self.notify.notify_one();
        true
    }

    fn len(&self) -> usize {
        self.lock().frames.len()
    }

    /// Waits for at least one frame, then returns the newest one together
    /// with the number of older frames discarded.
    async fn next_latest(&self) -> (Frame, usize) {
        loop {
            {
                let mut state = self.lock();
                state.last_request = Instant::now();
                if let Some(latest) = state.frames.pop_back() {
                    let stale = state.frames.len();
                    state.frames.clear();
                    state.waiting = false;
                    return (latest, stale);
                }
                state.waiting = true;
            }
            self.notify.notified().await;
        }
    }

    /// A reader parked on an empty queue is requesting a frame right now.
    fn last_request(&self) -> Instant {
        let state = self.lock();
        if state.waiting {
            Instant::now()
        } else {
            state.last_request
        }
    }
}

/// Registry-side handle of a downstream recipient of frames.
#[derive(Clone)]
pub struct Consumer {
    id: ConsumerId,
    label: Arc<str>,
    queue: Arc<FrameQueue>,
    cancel: CancellationToken,
    created_at: Instant,
}

impl Consumer {
    /// Creates a consumer with a queue of `capacity` frames (at least one).
    /// The returned receiver belongs to the consumer's send loop.
    pub fn new(label: impl Into<String>, capacity: usize) -> (Consumer, FrameReceiver) {
        let id = ConsumerId(NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed));
        let label: Arc<str> = Arc::from(label.into());
        let queue = Arc::new(FrameQueue::new(capacity));
        let cancel = CancellationToken::new();

        let receiver = FrameReceiver {
            id,
            label: Arc::clone(&label),
            queue: Arc::clone(&queue),
            cancel: cancel.clone(),
        };
        let consumer = Consumer {
            id,
            label,
            queue,
            cancel,
            created_at: Instant::now(),
        };
        (consumer, receiver)
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.queue.capacity
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Latest moment this consumer asked for a frame (or was created).
    pub fn last_activity(&self) -> Instant {
        self.queue.last_request().max(self.created_at)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Non-blocking enqueue; false means the queue was full and the frame
    /// was dropped for this consumer.
    pub fn try_send(&self, frame: Frame) -> bool {
        self.queue.try_push(frame)
    }
}

/// Send-loop side of a [`Consumer`].
pub struct FrameReceiver {
    id: ConsumerId,
    label: Arc<str>,
    queue: Arc<FrameQueue>,
    cancel: CancellationToken,
}

impl FrameReceiver {
    /// Newest buffered frame plus the count of stale frames skipped, or None
    /// once the consumer is cancelled.
    pub async fn recv(&self) -> Option<(Frame, usize)> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            next = self.queue.next_latest() => Some(next),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Transport a consumer forwards its frames to.
pub trait FrameSink: Send {
    fn send_frame(&mut self, frame: Frame) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Why a send loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendLoopExit {
    Cancelled,
    TransportError,
    SessionExpired,
}

/// Forwards frames from `receiver` to `sink` until the consumer is
/// cancelled, the transport fails, or `max_session` elapses. Always leaves
/// the consumer cancelled so the supervisor drops it on its next fan-out.
pub async fn run_send_loop<K: FrameSink>(
    receiver: FrameReceiver,
    mut sink: K,
    max_session: Option<Duration>,
) -> SendLoopExit {
    let expired = async {
        match max_session {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expired);

    let exit = loop {
        let (frame, stale) = tokio::select! {
            _ = &mut expired => break SendLoopExit::SessionExpired,
            next = receiver.recv() => match next {
                Some(next) => next,
                None => break SendLoopExit::Cancelled,
            },
        };
        if stale > 0 {
            log::debug!(
                "consumer {} ({}): dropped {} stale frame(s) to catch up",
                receiver.id,
                receiver.label,
                stale
            );
        }

        let sent = tokio::select! {
            _ = receiver.cancel.cancelled() => break SendLoopExit::Cancelled,
            _ = &mut expired => break SendLoopExit::SessionExpired,
            sent = sink.send_frame(frame) => sent,
        };
        if let Err(e) = sent {
            log::info!(
                "consumer {} ({}): write failed: {:#}",
                receiver.id,
                receiver.label,
                e
            );
            break SendLoopExit::TransportError;
        }
    };

    receiver.cancel();
    sink.close().await;
    log::debug!(
        "consumer {} ({}): send loop finished: {:?}",
        receiver.id,
        receiver.label,
        exit
    );
    exit
}

#[cfg(test)]
#[path = "consumer_test.rs"]
mod consumer_test;
