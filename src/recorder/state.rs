//! Recording state management
//!
//! Defines the recording state machine and the record a finished session
//! leaves behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::encoder::EncoderStats;
use crate::utils::Result;

/// Current state of the recording system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// No recording in progress
    Idle,
    /// Encoder and capture thread are being set up
    Starting,
    /// Currently recording
    Active,
    /// Waiting for the capture thread and the encoder to finish
    Stopping,
}

impl Default for RecordingState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Parameters of a start request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// Stop accepting frames after this many; unbounded if None
    pub frame_limit: Option<u64>,

    /// Output file name; a timestamped default is used if None
    pub file_name: Option<String>,
}

/// What a finished session produced
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSummary {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,

    /// Media file the encoder wrote
    pub output_path: PathBuf,

    /// Ticks that captured a frame
    pub frames_written: u64,

    /// Ticks skipped to pay back surplus audio
    pub frames_skipped: u64,

    /// Audio samples per channel gathered across all ticks
    pub audio_samples: u64,

    /// Banked audio surplus when the session ended, in samples
    pub final_drift: i64,

    pub encoder: EncoderStats,

    /// Why the session ended early, if it did
    pub error: Option<String>,
}

impl RecordingSummary {
    /// Sidecar path next to the media file, `<stem>.session.json`
    pub fn sidecar_path(output_path: &Path) -> PathBuf {
        let stem = output_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "recording".to_string());
        output_path.with_file_name(format!("{}.session.json", stem))
    }

    /// Write the summary as pretty JSON next to the media file
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::sidecar_path(&self.output_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_path() {
        let path = RecordingSummary::sidecar_path(Path::new("/tmp/clips/run_1.mp4"));
        assert_eq!(path, PathBuf::from("/tmp/clips/run_1.session.json"));
    }

    #[test]
    fn test_summary_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let summary = RecordingSummary {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            output_path: dir.path().join("take.mkv"),
            frames_written: 78,
            frames_skipped: 22,
            audio_samples: 79_872,
            final_drift: 224,
            encoder: EncoderStats::default(),
            error: None,
        };

        let written = summary.save().unwrap();
        assert_eq!(written, dir.path().join("take.session.json"));

        let json = std::fs::read_to_string(&written).unwrap();
        assert!(json.contains("\"framesSkipped\": 22"));

        let loaded = RecordingSummary::load(&written).unwrap();
        assert_eq!(loaded.session_id, summary.session_id);
        assert_eq!(loaded.frames_written, 78);
    }
}
