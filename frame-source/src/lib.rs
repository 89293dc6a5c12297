//! Upstream frame producers.
//!
//! Everything that hands raw frames to the distribution pipeline implements
//! [`FrameSource`]: the physical camera, the synthetic test pattern, and (in
//! the main crate) the relay links that feed a broadcast node.

use std::future::Future;
use std::time::Duration;

pub mod device;
pub mod error;
pub mod frame;
pub mod pattern;

#[cfg(feature = "ffmpeg")]
pub mod camera;

pub use error::SourceError;
pub use frame::Frame;
pub use pattern::PatternSource;

#[cfg(feature = "ffmpeg")]
pub use camera::CameraSource;

/// Device path that selects the built-in [`PatternSource`] instead of a camera.
pub const TEST_PATTERN_DEVICE: &str = "testsrc";

/// Registers FFmpeg components (format, device). Call once at startup before
/// opening a v4l2 camera. A no-op when built without the `ffmpeg` feature.
pub fn init() -> anyhow::Result<()> {
    #[cfg(feature = "ffmpeg")]
    {
        ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))?;
    }
    Ok(())
}

/// A producer of frames with an explicit streaming lifecycle.
///
/// Errors are classified by [`SourceError`] so callers can tell a timeout
/// (retry), a transient failure (tear down and restart) and a fatal one apart.
pub trait FrameSource: Send {
    /// Short name used in log lines.
    fn name(&self) -> &str;

    fn start_streaming(&mut self) -> impl Future<Output = Result<(), SourceError>> + Send;

    /// Stopping a source that is not streaming is a no-op.
    fn stop_streaming(&mut self) -> impl Future<Output = Result<(), SourceError>> + Send;

    /// Waits until a frame can be read, at most `timeout`.
    fn wait_for_frame(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), SourceError>> + Send;

    /// Takes the frame made ready by the last successful `wait_for_frame`.
    fn read_frame(&mut self) -> Result<Frame, SourceError>;
}

/// Camera parameters, handed over once at startup.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// v4l2 device node (e.g. "/dev/video0") or [`TEST_PATTERN_DEVICE`].
    pub device_path: String,
    /// FFmpeg `input_format` name ("mjpeg", "yuyv422"). None = driver default.
    pub pixel_format: Option<String>,
    pub width: u32,
    pub height: u32,
    pub framerate: Option<u32>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_path: "/dev/video0".to_string(),
            pixel_format: None,
            width: 640,
            height: 480,
            framerate: None,
        }
    }
}

/// The source selected by [`open`].
pub enum DeviceSource {
    Pattern(PatternSource),
    #[cfg(feature = "ffmpeg")]
    Camera(CameraSource),
}

/// Opens the device named by `config`. Failing here is fatal: the capture
/// node cannot run without its camera.
pub fn open(config: &CameraConfig) -> Result<DeviceSource, SourceError> {
    if config.device_path == TEST_PATTERN_DEVICE {
        log::info!(
            "frame source: using test pattern {}x{}",
            config.width,
            config.height
        );
        return Ok(DeviceSource::Pattern(PatternSource::new(config)));
    }

    #[cfg(feature = "ffmpeg")]
    {
        CameraSource::open(config).map(DeviceSource::Camera)
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        Err(SourceError::Fatal(format!(
            "cannot open {}: built without camera support (enable the `camera` feature)",
            config.device_path
        )))
    }
}

impl FrameSource for DeviceSource {
    fn name(&self) -> &str {
        match self {
            DeviceSource::Pattern(source) => source.name(),
            #[cfg(feature = "ffmpeg")]
            DeviceSource::Camera(source) => source.name(),
        }
    }

    async fn start_streaming(&mut self) -> Result<(), SourceError> {
        match self {
            DeviceSource::Pattern(source) => source.start_streaming().await,
            #[cfg(feature = "ffmpeg")]
            DeviceSource::Camera(source) => source.start_streaming().await,
        }
    }

    async fn stop_streaming(&mut self) -> Result<(), SourceError> {
        match self {
            DeviceSource::Pattern(source) => source.stop_streaming().await,
            #[cfg(feature = "ffmpeg")]
            DeviceSource::Camera(source) => source.stop_streaming().await,
        }
    }

    async fn wait_for_frame(&mut self, timeout: Duration) -> Result<(), SourceError> {
        match self {
            DeviceSource::Pattern(source) => source.wait_for_frame(timeout).await,
            #[cfg(feature = "ffmpeg")]
            DeviceSource::Camera(source) => source.wait_for_frame(timeout).await,
        }
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        match self {
            DeviceSource::Pattern(source) => source.read_frame(),
            #[cfg(feature = "ffmpeg")]
            DeviceSource::Camera(source) => source.read_frame(),
        }
    }
}
