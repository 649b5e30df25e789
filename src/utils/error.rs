//! Error types and handling
//!
//! Common error types used across the recorder.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which of the two output streams an operation concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorder-wide error type
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    Toml(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("A recording session is already active")]
    AlreadyRecording,

    #[error("No recording session is active")]
    NotRecording,

    #[error("Frame is {got_width}x{got_height}, session expects {want_width}x{want_height}")]
    ResolutionMismatch {
        got_width: u32,
        got_height: u32,
        want_width: u32,
        want_height: u32,
    },

    #[error("Invalid source frame: {0}")]
    InvalidFrame(String),

    #[error("{stream} encoder failed during {op}: {message}")]
    Encoder {
        stream: StreamKind,
        op: &'static str,
        message: String,
    },

    /// The codec's pipeline reported an error of its own
    #[error("{stream} encoding pipeline failed: {message}")]
    Pipeline { stream: StreamKind, message: String },

    #[error("{stream} packet pts {pts} does not advance past {previous}")]
    NonMonotonicTimestamp {
        stream: StreamKind,
        pts: i64,
        previous: i64,
    },

    #[error("{0} frame queue is full, frame dropped")]
    QueueFull(StreamKind),

    #[error("Encoder subprocess failed: {0}")]
    Subprocess(String),

    #[error("Encoder has already been finalized")]
    EncoderClosed,
}

impl RecorderError {
    /// Shorthand for a codec/muxer failure with its context
    pub fn encoder(stream: StreamKind, op: &'static str, message: impl Into<String>) -> Self {
        RecorderError::Encoder {
            stream,
            op,
            message: message.into(),
        }
    }

    /// Whether the error ends the session (as opposed to costing one frame)
    pub fn is_fatal(&self) -> bool {
        match self {
            RecorderError::ResolutionMismatch { .. }
            | RecorderError::InvalidFrame(_)
            | RecorderError::NonMonotonicTimestamp { .. }
            | RecorderError::QueueFull(_) => false,
            // A codec rejecting one frame is survivable, a container write is not
            RecorderError::Encoder { op, .. } => {
                matches!(*op, "write_header" | "write_packet" | "write_trailer" | "open")
            }
            _ => true,
        }
    }
}

impl From<toml::de::Error> for RecorderError {
    fn from(e: toml::de::Error) -> Self {
        RecorderError::Toml(e.to_string())
    }
}

impl From<toml::ser::Error> for RecorderError {
    fn from(e: toml::ser::Error) -> Self {
        RecorderError::Toml(e.to_string())
    }
}

impl From<RecorderError> for String {
    fn from(e: RecorderError) -> String {
        e.to_string()
    }
}

/// Result type alias using RecorderError
pub type Result<T> = std::result::Result<T, RecorderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(!RecorderError::QueueFull(StreamKind::Video).is_fatal());
        assert!(!RecorderError::encoder(StreamKind::Audio, "send_frame", "EAGAIN").is_fatal());
        assert!(RecorderError::encoder(StreamKind::Video, "write_packet", "disk full").is_fatal());
        assert!(RecorderError::Subprocess("exit 1".into()).is_fatal());
        assert!(RecorderError::EncoderClosed.is_fatal());
        let pipeline = RecorderError::Pipeline {
            stream: StreamKind::Video,
            message: "x264enc: internal data stream error".into(),
        };
        assert!(pipeline.is_fatal());
    }

    #[test]
    fn test_encoder_error_message_carries_context() {
        let err = RecorderError::encoder(StreamKind::Audio, "receive_packet", "code -22");
        let msg = err.to_string();
        assert!(msg.contains("audio"));
        assert!(msg.contains("receive_packet"));
        assert!(msg.contains("-22"));
    }
}
