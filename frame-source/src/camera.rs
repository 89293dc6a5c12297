use std::ffi::CString;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use ffmpeg_next::Dictionary;
use ffmpeg_next::format::context::Input;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{CameraConfig, Frame, FrameSource, SourceError};

/// A v4l2 camera read through libavdevice.
///
/// Opening the device at startup validates the configuration; afterwards the
/// device is held open only while streaming. Packets are pulled on a blocking
/// thread and handed over through a single-slot channel, so a slow reader
/// never sees more than one stale frame.
pub struct CameraSource {
    config: CameraConfig,
    input: Option<Input>,
    reader: Option<Reader>,
    pending: Option<Frame>,
}

struct Reader {
    cancel: CancellationToken,
    frames: mpsc::Receiver<Result<Frame, SourceError>>,
}

impl CameraSource {
    pub fn open(config: &CameraConfig) -> Result<Self, SourceError> {
        let input = open_input(config).map_err(|e| {
            SourceError::fatal(format!("open camera {}: {:#}", config.device_path, e))
        })?;
        dump_streams(&config.device_path, &input);

        Ok(Self {
            config: config.clone(),
            input: Some(input),
            reader: None,
            pending: None,
        })
    }
}

impl FrameSource for CameraSource {
    fn name(&self) -> &str {
        &self.config.device_path
    }

    async fn start_streaming(&mut self) -> Result<(), SourceError> {
        if self.reader.is_some() {
            return Ok(());
        }

        let input = match self.input.take() {
            Some(input) => input,
            None => {
                let config = self.config.clone();
                tokio::task::spawn_blocking(move || open_input(&config))
                    .await
                    .map_err(SourceError::transient)?
                    .map_err(|e| {
                        SourceError::transient(format!(
                            "reopen camera {}: {:#}",
                            self.config.device_path, e
                        ))
                    })?
            }
        };

        let cancel = CancellationToken::new();
        let frames = spawn_reader(input, cancel.clone());
        self.reader = Some(Reader { cancel, frames });
        log::info!("camera: streaming from {}", self.config.device_path);
        Ok(())
    }

    async fn stop_streaming(&mut self) -> Result<(), SourceError> {
        self.pending = None;
        if let Some(reader) = self.reader.take() {
            // The reader thread drops the input, which closes the device.
            reader.cancel.cancel();
            drop(reader.frames);
            log::info!("camera: stopped streaming {}", self.config.device_path);
        }
        Ok(())
    }

    async fn wait_for_frame(&mut self, timeout: Duration) -> Result<(), SourceError> {
        if self.pending.is_some() {
            return Ok(());
        }
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| SourceError::transient("camera is not streaming"))?;

        match tokio::time::timeout(timeout, reader.frames.recv()).await {
            Err(_) => Err(SourceError::Timeout),
            Ok(Some(Ok(frame))) => {
                self.pending = Some(frame);
                Ok(())
            }
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Err(SourceError::transient("camera reader exited")),
        }
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        self.pending
            .take()
            .ok_or_else(|| SourceError::transient("no frame ready"))
    }
}

/// Resolve input format by name (e.g. "v4l2") via FFmpeg's av_find_input_format.
fn find_input_format(name: &str) -> anyhow::Result<ffmpeg_next::format::format::Input> {
    let cname =
        CString::new(name).map_err(|e| anyhow::anyhow!("invalid format name {:?}: {}", name, e))?;
    let ptr = unsafe { ffmpeg_next::ffi::av_find_input_format(cname.as_ptr()) };
    if ptr.is_null() {
        return Err(anyhow::anyhow!("input format not found: {}", name));
    }
    Ok(unsafe { ffmpeg_next::format::format::Input::wrap(ptr as *mut _) })
}

fn open_input(config: &CameraConfig) -> anyhow::Result<Input> {
    use ffmpeg_next::format::format::Format;

    let format = find_input_format("v4l2")?;
    let mut options = Dictionary::new();
    options.set("video_size", &format!("{}x{}", config.width, config.height));
    if let Some(pixel_format) = &config.pixel_format {
        options.set("input_format", pixel_format);
    }
    if let Some(framerate) = config.framerate {
        options.set("framerate", &framerate.to_string());
    }

    let ctx = ffmpeg_next::format::open_with(
        Path::new(&config.device_path),
        &Format::Input(format),
        options,
    )?;
    Ok(ctx.input())
}

fn dump_streams(device: &str, input: &Input) {
    for stream in input.streams() {
        let parameters = stream.parameters();
        log::debug!(
            "camera {}: stream {} codec {:?} time_base {:?} rate {:?}",
            device,
            stream.index(),
            parameters.id(),
            stream.time_base(),
            stream.avg_frame_rate()
        );
    }
}

fn spawn_reader(
    mut input: Input,
    cancel: CancellationToken,
) -> mpsc::Receiver<Result<Frame, SourceError>> {
    let (tx, rx) = mpsc::channel(1);
    tokio::task::spawn_blocking(move || {
        while !cancel.is_cancelled() {
            let mut packet = ffmpeg_next::Packet::empty();
            let item = match packet.read(&mut input) {
                Ok(()) => match packet.data() {
                    Some(data) => Ok(Frame::from(Bytes::copy_from_slice(data))),
                    None => continue,
                },
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                }
                Err(ffmpeg_next::Error::Eof) => Err(SourceError::transient("camera: end of stream")),
                Err(e) => Err(SourceError::transient(format!("camera: read packet: {}", e))),
            };

            let failed = item.is_err();
            if tx.blocking_send(item).is_err() || failed {
                break;
            }
        }
        log::debug!("camera: reader thread finished");
    });
    rx
}
