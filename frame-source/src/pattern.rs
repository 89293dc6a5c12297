use std::time::Duration;

use tokio::time::Instant;

use crate::{CameraConfig, Frame, FrameSource, SourceError};

const DEFAULT_FRAMERATE: u32 = 15;

/// Synthetic camera producing a moving grayscale gradient at a fixed rate.
///
/// Stands in for a v4l2 device on machines without one (`device_path:
/// testsrc`) and drives the pipeline in tests.
pub struct PatternSource {
    width: usize,
    height: usize,
    interval: Duration,
    next_due: Option<Instant>,
    ready: bool,
    produced: u64,
}

impl PatternSource {
    pub fn new(config: &CameraConfig) -> Self {
        let fps = config.framerate.unwrap_or(DEFAULT_FRAMERATE).max(1);
        Self {
            width: config.width as usize,
            height: config.height as usize,
            interval: Duration::from_secs(1) / fps,
            next_due: None,
            ready: false,
            produced: 0,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.next_due.is_some()
    }

    /// Number of frames read since creation.
    pub fn produced(&self) -> u64 {
        self.produced
    }

    fn render(&self) -> Vec<u8> {
        let shift = self.produced as usize;
        let mut data = Vec::with_capacity(self.width * self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push((x + y + shift) as u8);
            }
        }
        data
    }
}

impl FrameSource for PatternSource {
    fn name(&self) -> &str {
        "testsrc"
    }

    async fn start_streaming(&mut self) -> Result<(), SourceError> {
        if self.next_due.is_none() {
            self.next_due = Some(Instant::now());
        }
        Ok(())
    }

    async fn stop_streaming(&mut self) -> Result<(), SourceError> {
        self.next_due = None;
        self.ready = false;
        Ok(())
    }

    async fn wait_for_frame(&mut self, timeout: Duration) -> Result<(), SourceError> {
        let Some(next_due) = self.next_due else {
            return Err(SourceError::transient("test pattern is not streaming"));
        };
        if self.ready {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        if next_due > deadline {
            tokio::time::sleep_until(deadline).await;
            return Err(SourceError::Timeout);
        }
        tokio::time::sleep_until(next_due).await;
        self.ready = true;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        if !self.ready {
            return Err(SourceError::transient("no frame ready"));
        }
        self.ready = false;

        let frame = Frame::from(self.render());
        self.produced += 1;

        // Skip ahead rather than bursting if the reader fell behind.
        let now = Instant::now();
        self.next_due = self
            .next_due
            .map(|due| (due + self.interval).max(now));
        Ok(frame)
    }
}
