use std::time::Duration;

use frame_source::{Frame, FrameSource, SourceError};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::relay::codec::record_codec;

/// Broadcast-side end of the relay link, driven as a frame source.
///
/// `start_streaming` dials the capture node, each `wait_for_frame` reads one
/// record. A dial failure, a malformed record or the capture node hanging up
/// is reported as transient and leaves the client disconnected, so the
/// supervisor redials on its next start.
pub struct RelayClient {
    name: String,
    addr: String,
    connect_timeout: Duration,
    link: Option<Framed<TcpStream, LengthDelimitedCodec>>,
    pending: Option<Frame>,
}

impl RelayClient {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        let addr = addr.into();
        Self {
            name: format!("relay://{}", addr),
            addr,
            connect_timeout,
            link: None,
            pending: None,
        }
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn drop_link(&mut self, reason: String) -> SourceError {
        self.link = None;
        self.pending = None;
        log::warn!("relay: link to {} lost: {}", self.addr, reason);
        SourceError::Transient(reason)
    }
}

impl FrameSource for RelayClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start_streaming(&mut self) -> Result<(), SourceError> {
        if self.link.is_some() {
            return Ok(());
        }
        let stream =
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(SourceError::transient(format!("dial {}: {}", self.addr, e)));
                }
                Err(_) => {
                    return Err(SourceError::transient(format!(
                        "dial {}: no answer within {:?}",
                        self.addr, self.connect_timeout
                    )));
                }
            };
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("relay: set_nodelay on {}: {}", self.addr, e);
        }
        log::info!("relay: connected to capture node {}", self.addr);
        self.link = Some(Framed::new(stream, record_codec()));
        Ok(())
    }

    async fn stop_streaming(&mut self) -> Result<(), SourceError> {
        self.pending = None;
        if let Some(mut link) = self.link.take() {
            log::info!("relay: closing link to {}", self.addr);
            if let Err(e) = link.get_mut().shutdown().await {
                log::debug!("relay: shutdown {}: {}", self.addr, e);
            }
        }
        Ok(())
    }

    async fn wait_for_frame(&mut self, timeout: Duration) -> Result<(), SourceError> {
        let Some(link) = self.link.as_mut() else {
            return Err(SourceError::transient("relay link not connected"));
        };
        match tokio::time::timeout(timeout, link.next()).await {
            Err(_) => Err(SourceError::Timeout),
            Ok(Some(Ok(record))) => {
                self.pending = Some(Frame::from(record.freeze()));
                Ok(())
            }
            Ok(Some(Err(e))) => Err(self.drop_link(format!("bad record: {}", e))),
            Ok(None) => Err(self.drop_link("capture node closed the link".to_string())),
        }
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        self.pending
            .take()
            .ok_or_else(|| SourceError::transient("no relay record ready"))
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod client_test;
