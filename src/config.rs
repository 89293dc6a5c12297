use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use frame_source::CameraConfig;
use serde::{Deserialize, Serialize};

use crate::media::SupervisorOptions;
use crate::redirect::RedirectAdvisor;

/// Which roles this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Camera plus relay server.
    Capture,
    /// Relay client plus WebSocket server.
    Broadcast,
    /// Both roles, linked in-process.
    Both,
}

impl Mode {
    pub fn captures(self) -> bool {
        matches!(self, Mode::Capture | Mode::Both)
    }

    pub fn broadcasts(self) -> bool {
        matches!(self, Mode::Broadcast | Mode::Both)
    }
}

/// Contents of the YAML config file. Unknown keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub mode: Option<Mode>,
    pub debug: bool,

    pub device_path: String,
    /// FFmpeg pixel format name, e.g. `mjpeg` or `yuyv422`.
    pub pixel_format: Option<String>,
    pub width: u32,
    pub height: u32,
    pub framerate: Option<u32>,

    /// Relay address of the capture node, dialled by a broadcast node.
    pub camera_addr: String,
    pub relay_listen: String,
    pub broadcast_listen: String,

    pub home_network: Option<String>,
    pub redirect_to_local: bool,
    pub local_addr: Option<String>,

    /// Cut viewer sessions after this long; 0 or absent means never.
    pub max_stream_duration_minutes: Option<u64>,
    /// Stop streaming when no viewer asked for a frame this long; 0 disables.
    pub idle_timeout_secs: u64,
    pub queue_capacity: usize,
    pub connect_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: None,
            debug: false,
            device_path: "/dev/video0".to_string(),
            pixel_format: None,
            width: 640,
            height: 480,
            framerate: None,
            camera_addr: "127.0.0.1:8081".to_string(),
            relay_listen: "0.0.0.0:8081".to_string(),
            broadcast_listen: "0.0.0.0:8080".to_string(),
            home_network: None,
            redirect_to_local: false,
            local_addr: None,
            max_stream_duration_minutes: None,
            idle_timeout_secs: 5,
            queue_capacity: 2,
            connect_timeout_secs: 5,
        }
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("config {}", path.display()))
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let settings: Settings = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.mode()?;
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }
        if self.width == 0 || self.height == 0 {
            anyhow::bail!("width and height must be non-zero");
        }
        if self.device_path.trim().is_empty() {
            anyhow::bail!("device_path is empty");
        }
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("connect_timeout_secs must be at least 1");
        }
        self.redirect_advisor()?;
        Ok(())
    }

    pub fn mode(&self) -> anyhow::Result<Mode> {
        self.mode
            .context("mode is not set; expected capture, broadcast or both")
    }

    pub fn camera(&self) -> CameraConfig {
        CameraConfig {
            device_path: self.device_path.clone(),
            pixel_format: self.pixel_format.clone(),
            width: self.width,
            height: self.height,
            framerate: self.framerate,
        }
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            idle_timeout: match self.idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            ..SupervisorOptions::default()
        }
    }

    pub fn max_session(&self) -> Option<Duration> {
        match self.max_stream_duration_minutes {
            None | Some(0) => None,
            Some(minutes) => Some(Duration::from_secs(minutes * 60)),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// The advisor when redirecting is switched on, None otherwise.
    pub fn redirect_advisor(&self) -> anyhow::Result<Option<RedirectAdvisor>> {
        if !self.redirect_to_local {
            return Ok(None);
        }
        let home = self
            .home_network
            .as_deref()
            .context("redirect_to_local needs home_network")?;
        let local = self
            .local_addr
            .as_deref()
            .context("redirect_to_local needs local_addr")?;
        RedirectAdvisor::new(home, local).map(Some)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
