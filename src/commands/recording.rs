//! Recording commands
//!
//! Synchronous wrappers a host UI or scripting layer calls to control the
//! recorder. Errors cross this boundary as strings.

use crate::config::RecorderConfig;
use crate::recorder::{CaptureSession, RecordingManager, RecordingState, RecordingSummary, StartRequest};
use std::sync::Arc;

/// Application state for recording
pub struct RecorderState {
    pub manager: Arc<RecordingManager>,
}

impl RecorderState {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            manager: Arc::new(RecordingManager::new(config)),
        }
    }
}

impl Default for RecorderState {
    fn default() -> Self {
        Self::new(RecorderConfig::default())
    }
}

/// Start recording, optionally stopping after `frame_limit` frames.
///
/// Returns the session so the host can drive its ticks and mixer tap.
pub fn start_recording(
    state: &RecorderState,
    frame_limit: Option<u64>,
    file_name: Option<String>,
) -> Result<Arc<CaptureSession>, String> {
    let request = StartRequest {
        frame_limit,
        file_name,
    };
    state.manager.start(request).map_err(|e| e.to_string())
}

/// Stop recording and wait for the output file to be finalized
pub fn stop_recording(state: &RecorderState) -> Result<Option<RecordingSummary>, String> {
    state.manager.stop().map_err(|e| e.to_string())
}

pub fn is_recording(state: &RecorderState) -> Result<bool, String> {
    Ok(state.manager.is_recording())
}

/// Get current recording state
pub fn get_recording_state(state: &RecorderState) -> Result<RecordingState, String> {
    Ok(state.manager.state())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    #[test]
    fn test_commands_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RecorderConfig::default();
        config.output.directory = dir.path().to_path_buf();
        config.output.backend = BackendKind::Null;
        let state = RecorderState::new(config);

        assert_eq!(is_recording(&state), Ok(false));
        let session = start_recording(&state, Some(10), Some("demo".into())).unwrap();
        assert!(session.output_path().ends_with("demo.mp4"));
        assert_eq!(is_recording(&state), Ok(true));

        let err = start_recording(&state, None, None).unwrap_err();
        assert!(err.contains("already active"));

        let summary = stop_recording(&state).unwrap().unwrap();
        assert_eq!(summary.frames_written, 0);
        assert_eq!(get_recording_state(&state), Ok(RecordingState::Idle));
        assert_eq!(stop_recording(&state).unwrap().map(|s| s.session_id), None);
    }

    #[test]
    fn test_start_error_is_reported_as_text() {
        let mut config = RecorderConfig::default();
        config.output.backend = BackendKind::Null;
        config.video.width = 0;
        let state = RecorderState::new(config);
        let err = start_recording(&state, None, None).unwrap_err();
        assert!(err.contains("resolution"));
        assert_eq!(is_recording(&state), Ok(false));
    }
}
