//! Recorder configuration
//!
//! Everything here is resolved once when a session starts. The session keeps
//! its own snapshot, so edits made while recording apply to the next session.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::utils::{RecorderError, Result};

/// Container formats for the output file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Mp4,
    Mkv,
    Webm,
}

impl ContainerFormat {
    /// Get the file extension for this container
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Mkv => "mkv",
            ContainerFormat::Webm => "webm",
        }
    }

    /// Get the GStreamer muxer element name
    pub fn gst_muxer(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4mux",
            ContainerFormat::Mkv => "matroskamux",
            ContainerFormat::Webm => "webmmux",
        }
    }

    /// Get the FFmpeg muxer name
    pub fn ffmpeg_format(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Mkv => "matroska",
            ContainerFormat::Webm => "webm",
        }
    }
}

/// Video codecs the recorder can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    Vp9,
    Av1,
}

impl VideoCodec {
    /// Get the FFmpeg encoder name
    pub fn ffmpeg_encoder(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "libx264",
            VideoCodec::Vp9 => "libvpx-vp9",
            VideoCodec::Av1 => "libaom-av1",
        }
    }

    /// Get the GStreamer encoder element name
    pub fn gst_encoder(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "x264enc",
            VideoCodec::Vp9 => "vp9enc",
            VideoCodec::Av1 => "av1enc",
        }
    }
}

/// Audio codecs the recorder can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Opus,
}

impl AudioCodec {
    /// Get the FFmpeg encoder name
    pub fn ffmpeg_encoder(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Opus => "libopus",
        }
    }

    /// Get the GStreamer encoder element name
    pub fn gst_encoder(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "avenc_aac",
            AudioCodec::Opus => "opusenc",
        }
    }

    /// Samples per channel in one codec frame
    pub fn frame_size(&self) -> usize {
        match self {
            AudioCodec::Aac => 1024,
            AudioCodec::Opus => 960,
        }
    }
}

/// Which encoder implementation a session uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process codec library (GStreamer)
    Embedded,
    /// Raw frames piped to an ffmpeg subprocess
    ExternalProcess,
    /// Encodes into memory and writes no media file
    Null,
}

/// What the pipe backend does when its outgoing queue is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum QueuePolicy {
    /// Let the queue grow without bound
    Unbounded,
    /// Hold the producer until the writer catches up
    Block { max_pending: usize },
    /// Drop the frame being submitted
    DropNewest { max_pending: usize },
}

impl Default for QueuePolicy {
    fn default() -> Self {
        QueuePolicy::Block { max_pending: 64 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    /// Capture width; every submitted frame must match
    pub width: u32,
    /// Capture height; every submitted frame must match
    pub height: u32,
    /// Encoded width, if different from the capture width
    pub scale_width: Option<u32>,
    /// Encoded height, if different from the capture height
    pub scale_height: Option<u32>,
    pub fps: u32,
    /// Frame duration multiplier; each encoded frame lasts `speed / fps` seconds
    pub speed: f64,
    pub codec: VideoCodec,
    /// Bits per second
    pub bitrate: u32,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            scale_width: None,
            scale_height: None,
            fps: 60,
            speed: 1.0,
            codec: VideoCodec::H264,
            bitrate: 8_000_000,
        }
    }
}

impl VideoSettings {
    /// Resolution written to the container
    pub fn output_size(&self) -> (u32, u32) {
        (
            self.scale_width.unwrap_or(self.width),
            self.scale_height.unwrap_or(self.height),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub sample_rate: u32,
    /// Channel count of the batches the host mixer delivers
    pub host_channels: u16,
    /// Channel count of the encoded stream
    pub channels: u16,
    pub codec: AudioCodec,
    /// Bits per second
    pub bitrate: u32,
    /// Mixer batches zero-filled at session start
    pub warmup_batches: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            host_channels: 2,
            channels: 2,
            codec: AudioCodec::Aac,
            bitrate: 192_000,
            warmup_batches: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub directory: PathBuf,
    pub container: ContainerFormat,
    pub backend: BackendKind,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            container: ContainerFormat::Mp4,
            backend: BackendKind::ExternalProcess,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeSettings {
    pub ffmpeg_path: PathBuf,
    pub queue: QueuePolicy,
    pub shutdown_timeout_secs: u64,
}

impl Default for PipeSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            queue: QueuePolicy::default(),
            shutdown_timeout_secs: 30,
        }
    }
}

/// Recorder configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub video: VideoSettings,
    pub audio: AudioSettings,
    pub output: OutputSettings,
    pub pipe: PipeSettings,
}

impl RecorderConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load config from disk or return default
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => return config,
                Err(e) => tracing::warn!("Failed to load config {:?}: {}", path, e),
            }
        }
        Self::default()
    }

    /// Save config to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Audio samples per channel that make up one video frame
    pub fn samples_per_frame(&self) -> u32 {
        self.audio.sample_rate / self.video.fps.max(1)
    }

    /// Reject settings that cannot produce a valid file
    pub fn validate(&self) -> Result<()> {
        let v = &self.video;
        let a = &self.audio;

        if v.width == 0 || v.height == 0 {
            return Err(RecorderError::Config(format!(
                "resolution {}x{} is empty",
                v.width, v.height
            )));
        }
        let (out_w, out_h) = v.output_size();
        if out_w == 0 || out_h == 0 || out_w % 2 != 0 || out_h % 2 != 0 {
            return Err(RecorderError::Config(format!(
                "output resolution {}x{} must be non-zero and even",
                out_w, out_h
            )));
        }
        if v.fps == 0 {
            return Err(RecorderError::Config("fps must be positive".into()));
        }
        if !(v.speed.is_finite() && v.speed > 0.0) {
            return Err(RecorderError::Config(format!("speed {} must be positive", v.speed)));
        }
        if a.sample_rate < v.fps {
            return Err(RecorderError::Config(format!(
                "sample rate {} gives less than one sample per frame at {} fps",
                a.sample_rate, v.fps
            )));
        }
        if !(1..=2).contains(&a.channels) {
            return Err(RecorderError::Config(format!(
                "{} output channels requested, only mono or stereo is supported",
                a.channels
            )));
        }
        if a.host_channels == 0 {
            return Err(RecorderError::Config("host mixer has no channels".into()));
        }

        match (self.output.container, v.codec, a.codec) {
            (ContainerFormat::Webm, VideoCodec::H264, _) => {
                return Err(RecorderError::Config("WebM cannot carry H.264".into()));
            }
            (ContainerFormat::Webm, _, AudioCodec::Aac) => {
                return Err(RecorderError::Config("WebM cannot carry AAC".into()));
            }
            (ContainerFormat::Mp4, _, AudioCodec::Opus) => {
                return Err(RecorderError::Config("MP4 output requires AAC audio".into()));
            }
            _ => {}
        }

        if let QueuePolicy::Block { max_pending } | QueuePolicy::DropNewest { max_pending } =
            self.pipe.queue
        {
            if max_pending == 0 {
                return Err(RecorderError::Config("pipe queue capacity must be positive".into()));
            }
        }

        if self.output.backend == BackendKind::Embedded && !cfg!(feature = "embedded") {
            return Err(RecorderError::Config(
                "embedded backend requested but this build lacks the `embedded` feature".into(),
            ));
        }

        Ok(())
    }

    /// Resolve the output file for a session, never overwriting an existing file
    pub fn output_path(&self, name: Option<&str>) -> PathBuf {
        let stem = match name {
            Some(n) if !n.trim().is_empty() => sanitize_file_stem(n),
            _ => format!("recording_{}", chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")),
        };
        let ext = self.output.container.extension();
        let dir = &self.output.directory;

        let mut candidate = dir.join(format!("{}.{}", stem, ext));
        let mut n = 1;
        while candidate.exists() {
            candidate = dir.join(format!("{}_{}.{}", stem, n, ext));
            n += 1;
        }
        candidate
    }
}

/// Strip path separators and a trailing extension from a caller-supplied name
fn sanitize_file_stem(name: &str) -> String {
    let base = Path::new(name.trim())
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    base.chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
        .collect()
}

/// Get the default directory for recordings
fn default_output_dir() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Videos")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Lockstep")
}
