//! In-memory sources and sinks shared by the pipeline tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use frame_source::{CameraConfig, Frame, FrameSource, SourceError, TEST_PATTERN_DEVICE};
use tokio::sync::Notify;

use crate::media::{FrameSink, SupervisorOptions};

/// Simulated sensor readout time of every `wait_for_frame`.
const FRAME_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) fn frame(n: u64) -> Frame {
    Frame::from(format!("frame-{}", n).into_bytes())
}

/// Small, fast test pattern for end-to-end runs.
pub(crate) fn pattern_config() -> CameraConfig {
    CameraConfig {
        device_path: TEST_PATTERN_DEVICE.to_string(),
        pixel_format: None,
        width: 4,
        height: 4,
        framerate: Some(50),
    }
}

/// Supervisor timings short enough for real-time socket tests.
pub(crate) fn fast_options() -> SupervisorOptions {
    SupervisorOptions {
        idle_poll: Duration::from_millis(20),
        frame_timeout: Duration::from_millis(200),
        idle_timeout: None,
    }
}

/// Polls `condition` until it holds, failing after five seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// Scripted reply to one `wait_for_frame` call.
pub(crate) enum Step {
    Frame(Frame),
    Timeout,
    Transient,
    Fatal,
}

#[derive(Debug, Default)]
pub(crate) struct SourceLog {
    pub starts: usize,
    pub stops: usize,
    pub streaming: bool,
    pub reads: u64,
}

/// FrameSource replaying scripted steps, then producing `frame(n)` forever.
pub(crate) struct ScriptedSource {
    steps: VecDeque<Step>,
    failing_starts: usize,
    pending: Option<Frame>,
    log: Arc<Mutex<SourceLog>>,
}

impl ScriptedSource {
    pub fn new() -> (Self, Arc<Mutex<SourceLog>>) {
        let log = Arc::new(Mutex::new(SourceLog::default()));
        let source = Self {
            steps: VecDeque::new(),
            failing_starts: 0,
            pending: None,
            log: Arc::clone(&log),
        };
        (source, log)
    }

    pub fn with_steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.steps.extend(steps);
        self
    }

    pub fn with_failing_starts(mut self, count: usize) -> Self {
        self.failing_starts = count;
        self
    }
}

impl FrameSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start_streaming(&mut self) -> Result<(), SourceError> {
        if self.failing_starts > 0 {
            self.failing_starts -= 1;
            return Err(SourceError::transient("device busy"));
        }
        let mut log = self.log.lock().unwrap();
        log.starts += 1;
        log.streaming = true;
        Ok(())
    }

    async fn stop_streaming(&mut self) -> Result<(), SourceError> {
        let mut log = self.log.lock().unwrap();
        if log.streaming {
            log.stops += 1;
        }
        log.streaming = false;
        self.pending = None;
        Ok(())
    }

    async fn wait_for_frame(&mut self, _timeout: Duration) -> Result<(), SourceError> {
        if !self.log.lock().unwrap().streaming {
            return Err(SourceError::transient("not streaming"));
        }
        tokio::time::sleep(FRAME_INTERVAL).await;
        match self.steps.pop_front() {
            Some(Step::Frame(frame)) => self.pending = Some(frame),
            Some(Step::Timeout) => return Err(SourceError::Timeout),
            Some(Step::Transient) => return Err(SourceError::transient("select timeout")),
            Some(Step::Fatal) => return Err(SourceError::fatal("device unplugged")),
            None => {
                let n = self.log.lock().unwrap().reads;
                self.pending = Some(frame(n));
            }
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        let frame = self
            .pending
            .take()
            .ok_or_else(|| SourceError::transient("no frame ready"))?;
        self.log.lock().unwrap().reads += 1;
        Ok(frame)
    }
}

/// FrameSink recording everything it is asked to send.
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    pub sent: Arc<Mutex<Vec<Frame>>>,
    pub closed: Arc<Mutex<bool>>,
    pub fail_after: Option<usize>,
    pub delivered: Arc<Notify>,
}

impl RecordingSink {
    pub fn failing_after(count: usize) -> Self {
        Self {
            fail_after: Some(count),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

impl FrameSink for RecordingSink {
    async fn send_frame(&mut self, frame: Frame) -> anyhow::Result<()> {
        {
            let mut sent = self.sent.lock().unwrap();
            if self.fail_after.is_some_and(|limit| sent.len() >= limit) {
                anyhow::bail!("broken pipe");
            }
            sent.push(frame);
        }
        self.delivered.notify_one();
        Ok(())
    }

    async fn close(&mut self) {
        *self.closed.lock().unwrap() = true;
    }
}
