use std::fmt::{Display, Formatter};
use std::path::PathBuf;

/// An input device format FFmpeg can capture from, with the device nodes it
/// can open.
#[derive(Clone, Debug)]
pub struct VideoInput {
    /// Format name for `-f` (e.g. "v4l2").
    pub format: String,
    pub description: String,
    /// Possible values for `-i`. Empty if not enumerable.
    pub inputs: Vec<String>,
}

impl Display for VideoInput {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "format: {}, description: {}, inputs: {:?}",
            self.format, self.description, self.inputs
        )
    }
}

/// Lists `/dev/video*` nodes in name order.
#[cfg(target_os = "linux")]
pub fn video_device_paths() -> anyhow::Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir("/dev")?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|s| s.starts_with("video"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}

#[cfg(not(target_os = "linux"))]
pub fn video_device_paths() -> anyhow::Result<Vec<PathBuf>> {
    Ok(Vec::new())
}

/// Capture-capable video input formats known to libavdevice.
#[cfg(feature = "ffmpeg")]
pub fn video_inputs() -> anyhow::Result<Vec<VideoInput>> {
    let mut inputs = Vec::new();
    for device in ffmpeg_next::device::input::video() {
        let format = device.name().to_string();
        let nodes = if format == "v4l2" {
            device_path_strings()?
        } else {
            Vec::new()
        };
        inputs.push(VideoInput {
            description: device.description().to_string(),
            format,
            inputs: nodes,
        });
    }
    Ok(inputs)
}

/// Without libavdevice only v4l2 nodes can be discovered.
#[cfg(not(feature = "ffmpeg"))]
pub fn video_inputs() -> anyhow::Result<Vec<VideoInput>> {
    let nodes = device_path_strings()?;
    if nodes.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![VideoInput {
        format: "v4l2".to_string(),
        description: "Video4Linux2 device nodes".to_string(),
        inputs: nodes,
    }])
}

fn device_path_strings() -> anyhow::Result<Vec<String>> {
    Ok(video_device_paths()?
        .into_iter()
        .filter_map(|p| p.into_os_string().into_string().ok())
        .collect())
}
