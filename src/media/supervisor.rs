use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use frame_source::{Frame, FrameSource, SourceError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::media::consumer::Consumer;
use crate::media::registry::{ConsumerRegistry, FanOut};

/// Pending admissions buffered between accept loops and the supervisor.
const ADMISSION_BACKLOG: usize = 10;

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Sleep between cycles with nothing to do, and between failed starts.
    pub idle_poll: Duration,
    /// Longest single wait for the next frame.
    pub frame_timeout: Duration,
    /// Stop streaming once no consumer has asked for a frame for this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_millis(250),
            frame_timeout: Duration::from_secs(1),
            idle_timeout: Some(Duration::from_secs(5)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StreamingState {
    is_streaming: bool,
    last_activity: Instant,
}

/// What one control cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// No consumers (or all idle); the source is stopped.
    Idle,
    /// Starting the source failed; retried next cycle.
    StartFailed,
    /// No frame within the frame timeout.
    Timeout,
    /// A read failed and the stream was torn down.
    Restarted,
    Delivered(FanOut),
}

struct Shared {
    state: Mutex<StreamingState>,
    registry: ConsumerRegistry,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, StreamingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cloneable view of a running supervisor used by accept loops and HTTP
/// handlers.
#[derive(Clone)]
pub struct SupervisorHandle {
    name: Arc<str>,
    admissions: mpsc::Sender<Consumer>,
    shared: Arc<Shared>,
}

impl SupervisorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues `consumer` for insertion on the supervisor's next cycle.
    pub async fn admit(&self, consumer: Consumer) -> anyhow::Result<()> {
        self.admissions
            .send(consumer)
            .await
            .map_err(|_| anyhow::anyhow!("supervisor[{}] is not running", self.name))
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.state().is_streaming
    }

    /// Registered consumers; admissions still in flight are not counted.
    pub fn consumer_count(&self) -> usize {
        self.shared.registry.len()
    }
}

/// Drives one [`FrameSource`] on behalf of a set of consumers.
///
/// The source streams only while consumers are registered (and, with an
/// idle timeout, while at least one of them keeps asking for frames). Any
/// transient failure tears the whole stream down; the next cycle starts it
/// again from scratch.
pub struct StreamSupervisor<S> {
    name: Arc<str>,
    source: S,
    options: SupervisorOptions,
    registry: ConsumerRegistry,
    shared: Arc<Shared>,
    admissions: mpsc::Receiver<Consumer>,
    streaming: bool,
}

impl<S: FrameSource> StreamSupervisor<S> {
    pub fn new(name: &str, source: S, options: SupervisorOptions) -> (Self, SupervisorHandle) {
        let name: Arc<str> = Arc::from(name);
        let registry = ConsumerRegistry::new();
        let shared = Arc::new(Shared {
            state: Mutex::new(StreamingState {
                is_streaming: false,
                last_activity: Instant::now(),
            }),
            registry: registry.clone(),
        });
        let (tx, rx) = mpsc::channel(ADMISSION_BACKLOG);

        let handle = SupervisorHandle {
            name: Arc::clone(&name),
            admissions: tx,
            shared: Arc::clone(&shared),
        };
        let supervisor = Self {
            name,
            source,
            options,
            registry,
            shared,
            admissions: rx,
            streaming: false,
        };
        (supervisor, handle)
    }

    #[cfg(test)]
    pub fn registry(&self) -> &ConsumerRegistry {
        &self.registry
    }

    /// Runs cycles until `cancel` fires. Only a fatal source error ends the
    /// loop early.
    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        log::info!(
            "supervisor[{}]: started with source {}",
            self.name,
            self.source.name()
        );
        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                cycle = self.run_cycle() => {
                    if let Err(e) = cycle {
                        break Err(e);
                    }
                }
            }
        };

        self.stop_stream().await;
        self.registry.clear();
        log::info!("supervisor[{}]: stopped", self.name);
        result
    }

    pub async fn run_cycle(&mut self) -> anyhow::Result<Cycle> {
        self.drain_admissions();
        self.registry.prune_cancelled();

        if self.registry.is_empty() {
            if self.streaming {
                log::info!(
                    "supervisor[{}]: no consumers left, stopping {}",
                    self.name,
                    self.source.name()
                );
                self.stop_stream().await;
            }
            self.wait_for_admission().await;
            return Ok(Cycle::Idle);
        }

        let last_activity = self.refresh_activity();
        if let Some(idle_timeout) = self.options.idle_timeout {
            if last_activity.elapsed() > idle_timeout {
                if self.streaming {
                    log::info!(
                        "supervisor[{}]: idle for {:?}, stopping {}",
                        self.name,
                        last_activity.elapsed(),
                        self.source.name()
                    );
                    self.stop_stream().await;
                }
                self.wait_for_admission().await;
                return Ok(Cycle::Idle);
            }
        }

        if !self.streaming {
            match self.source.start_streaming().await {
                Ok(()) => {
                    log::info!(
                        "supervisor[{}]: streaming from {}",
                        self.name,
                        self.source.name()
                    );
                    self.set_streaming(true);
                }
                Err(e) if e.is_fatal() => return Err(fatal(&self.name, e)),
                Err(e) => {
                    log::warn!(
                        "supervisor[{}]: start {} failed: {}",
                        self.name,
                        self.source.name(),
                        e
                    );
                    tokio::time::sleep(self.options.idle_poll).await;
                    return Ok(Cycle::StartFailed);
                }
            }
        }

        let frame = match self.pull_frame().await {
            Ok(frame) => frame,
            Err(SourceError::Timeout) => return Ok(Cycle::Timeout),
            Err(e) if e.is_fatal() => return Err(fatal(&self.name, e)),
            Err(e) => {
                log::warn!(
                    "supervisor[{}]: read from {} failed: {}, restarting stream",
                    self.name,
                    self.source.name(),
                    e
                );
                self.stop_stream().await;
                // same pacing as a failed start, so a link that drops right
                // after connecting is not redialled in a tight loop
                tokio::time::sleep(self.options.idle_poll).await;
                return Ok(Cycle::Restarted);
            }
        };

        let report = self.registry.fan_out(&frame);
        log::trace!(
            "supervisor[{}]: frame of {} bytes: {:?}",
            self.name,
            frame.len(),
            report
        );
        Ok(Cycle::Delivered(report))
    }

    async fn pull_frame(&mut self) -> Result<Frame, SourceError> {
        self.source.wait_for_frame(self.options.frame_timeout).await?;
        self.source.read_frame()
    }

    fn drain_admissions(&mut self) {
        while let Ok(consumer) = self.admissions.try_recv() {
            self.add_consumer(consumer);
        }
    }

    fn add_consumer(&mut self, consumer: Consumer) {
        self.registry.add(consumer);
        self.shared.state().last_activity = Instant::now();
    }

    /// Sleeps one idle poll interval, waking early for a new consumer.
    async fn wait_for_admission(&mut self) {
        match tokio::time::timeout(self.options.idle_poll, self.admissions.recv()).await {
            Ok(Some(consumer)) => self.add_consumer(consumer),
            // every handle is gone; nobody can be admitted any more
            Ok(None) => tokio::time::sleep(self.options.idle_poll).await,
            Err(_) => {}
        }
    }

    fn refresh_activity(&self) -> Instant {
        let consumers = self.registry.last_activity();
        let mut state = self.shared.state();
        if let Some(activity) = consumers {
            state.last_activity = state.last_activity.max(activity);
        }
        state.last_activity
    }

    async fn stop_stream(&mut self) {
        if let Err(e) = self.source.stop_streaming().await {
            log::warn!(
                "supervisor[{}]: stop {} failed: {}",
                self.name,
                self.source.name(),
                e
            );
        }
        self.set_streaming(false);
    }

    fn set_streaming(&mut self, streaming: bool) {
        self.streaming = streaming;
        self.shared.state().is_streaming = streaming;
    }
}

fn fatal(name: &str, err: SourceError) -> anyhow::Error {
    anyhow::anyhow!("supervisor[{}]: fatal source error: {}", name, err)
}

#[cfg(test)]
#[path = "supervisor_test.rs"]
mod supervisor_test;
