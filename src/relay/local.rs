use std::time::Duration;

use frame_source::{Frame, FrameSource, SourceError};
use tokio::sync::mpsc;

use crate::media::{run_send_loop, Consumer, FrameSink, SupervisorHandle};

/// In-process relay link used when one process runs both roles.
///
/// Starting admits a consumer into the capture supervisor whose send loop
/// feeds a channel; stopping cancels that consumer. Failures look exactly
/// like a dropped TCP link: transient, retried on the next start.
pub struct LocalLink {
    upstream: SupervisorHandle,
    capacity: usize,
    link: Option<Attached>,
    pending: Option<Frame>,
}

struct Attached {
    consumer: Consumer,
    frames: mpsc::Receiver<Frame>,
}

impl LocalLink {
    pub fn new(upstream: SupervisorHandle, capacity: usize) -> Self {
        Self {
            upstream,
            capacity,
            link: None,
            pending: None,
        }
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }
}

impl FrameSource for LocalLink {
    fn name(&self) -> &str {
        "local"
    }

    async fn start_streaming(&mut self) -> Result<(), SourceError> {
        if self.link.is_some() {
            return Ok(());
        }
        let (consumer, receiver) = Consumer::new("local link", self.capacity);
        let (tx, frames) = mpsc::channel(1);
        tokio::spawn(run_send_loop(receiver, ChannelSink { tx }, None));

        if let Err(e) = self.upstream.admit(consumer.clone()).await {
            consumer.cancel();
            return Err(SourceError::transient(e.to_string()));
        }
        log::info!("relay: local link attached to {}", self.upstream.name());
        self.link = Some(Attached { consumer, frames });
        Ok(())
    }

    async fn stop_streaming(&mut self) -> Result<(), SourceError> {
        self.pending = None;
        if let Some(link) = self.link.take() {
            log::info!("relay: local link detached from {}", self.upstream.name());
            link.consumer.cancel();
        }
        Ok(())
    }

    async fn wait_for_frame(&mut self, timeout: Duration) -> Result<(), SourceError> {
        let Some(link) = self.link.as_mut() else {
            return Err(SourceError::transient("local link not attached"));
        };
        match tokio::time::timeout(timeout, link.frames.recv()).await {
            Err(_) => Err(SourceError::Timeout),
            Ok(Some(frame)) => {
                self.pending = Some(frame);
                Ok(())
            }
            Ok(None) => {
                self.link = None;
                Err(SourceError::transient("capture side dropped the local link"))
            }
        }
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        self.pending
            .take()
            .ok_or_else(|| SourceError::transient("no local frame ready"))
    }
}

struct ChannelSink {
    tx: mpsc::Sender<Frame>,
}

impl FrameSink for ChannelSink {
    async fn send_frame(&mut self, frame: Frame) -> anyhow::Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| anyhow::anyhow!("local link receiver is gone"))
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
#[path = "local_test.rs"]
mod local_test;
