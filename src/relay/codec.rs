use frame_source::Frame;
use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};

use crate::media::FrameSink;

/// Largest record accepted on a relay link (16 MiB).
pub const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Length-prefixed record codec shared by both ends of a relay link.
pub fn record_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_RECORD_LEN)
        .new_codec()
}

/// Writes frames as relay records.
pub struct RelaySink<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin + Send> RelaySink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: FramedWrite::new(writer, record_codec()),
        }
    }

    #[cfg(test)]
    pub fn get_ref(&self) -> &W {
        self.inner.get_ref()
    }
}

impl<W: AsyncWrite + Unpin + Send> FrameSink for RelaySink<W> {
    async fn send_frame(&mut self, frame: Frame) -> anyhow::Result<()> {
        self.inner.send(frame.into_bytes()).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = SinkExt::<bytes::Bytes>::close(&mut self.inner).await {
            log::debug!("relay: close failed: {}", e);
        }
    }
}

#[cfg(test)]
#[path = "codec_test.rs"]
mod codec_test;
