//! Recording manager
//!
//! Owns the one live session. Starting and stopping are transitions of a
//! checked state machine:
//!
//! ```text
//! Idle -> Starting -> Active -> Stopping -> Idle
//!            \-> Idle (start failed)
//! ```
//!
//! While a transition is in progress other callers wait on a condition
//! variable, so a start issued during a slow stop proceeds only once the old
//! encoder has finalized its file.

use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;

use super::session::CaptureSession;
use super::state::{RecordingState, RecordingSummary, StartRequest};
use crate::config::RecorderConfig;
use crate::utils::{RecorderError, Result};

#[derive(Default)]
struct Inner {
    state: RecordingState,
    session: Option<Arc<CaptureSession>>,
    last_summary: Option<RecordingSummary>,
}

/// Manages the recording lifecycle
pub struct RecordingManager {
    /// Config for the next session; a running session keeps its own copy
    config: RwLock<RecorderConfig>,
    inner: Mutex<Inner>,
    transition_done: Condvar,
}

impl RecordingManager {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config: RwLock::new(config),
            inner: Mutex::new(Inner::default()),
            transition_done: Condvar::new(),
        }
    }

    pub fn state(&self) -> RecordingState {
        self.inner.lock().state
    }

    /// True while the active session still captures frames. A session that
    /// hit its frame limit or failed stays `Active` until stopped, but is no
    /// longer recording.
    pub fn is_recording(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == RecordingState::Active
            && inner.session.as_ref().is_some_and(|s| s.is_capturing())
    }

    /// The active session, if any
    pub fn session(&self) -> Option<Arc<CaptureSession>> {
        self.inner.lock().session.clone()
    }

    pub fn config(&self) -> RecorderConfig {
        self.config.read().clone()
    }

    /// Replace the config used by future sessions
    pub fn update_config(&self, config: RecorderConfig) -> Result<()> {
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }

    /// Summary of the most recently stopped session
    pub fn last_summary(&self) -> Option<RecordingSummary> {
        self.inner.lock().last_summary.clone()
    }

    fn set_state(&self, inner: &mut Inner, state: RecordingState) {
        tracing::debug!("Recording state {:?} -> {:?}", inner.state, state);
        inner.state = state;
        self.transition_done.notify_all();
    }

    /// Start a session with the current config.
    ///
    /// Blocks while another start or stop is in flight. Fails with
    /// `AlreadyRecording` if a session is active, or with the validation or
    /// encoder error that kept the session from starting.
    pub fn start(&self, request: StartRequest) -> Result<Arc<CaptureSession>> {
        let mut inner = self.inner.lock();
        while matches!(inner.state, RecordingState::Starting | RecordingState::Stopping) {
            self.transition_done.wait(&mut inner);
        }
        if inner.state == RecordingState::Active {
            return Err(RecorderError::AlreadyRecording);
        }
        self.set_state(&mut inner, RecordingState::Starting);
        drop(inner);

        let config = self.config();
        tracing::info!(
            "Starting recording: {}x{} @ {} fps, {:?} backend",
            config.video.width,
            config.video.height,
            config.video.fps,
            config.output.backend
        );
        let result = CaptureSession::start(config, &request);

        let mut inner = self.inner.lock();
        match result {
            Ok(session) => {
                let session = Arc::new(session);
                inner.session = Some(session.clone());
                self.set_state(&mut inner, RecordingState::Active);
                Ok(session)
            }
            Err(e) => {
                tracing::error!("Failed to start recording: {}", e);
                self.set_state(&mut inner, RecordingState::Idle);
                Err(e)
            }
        }
    }

    /// Stop the active session and wait for its file to be finalized.
    ///
    /// Returns `Ok(None)` without doing anything if nothing is recording.
    pub fn stop(&self) -> Result<Option<RecordingSummary>> {
        let mut inner = self.inner.lock();
        while matches!(inner.state, RecordingState::Starting | RecordingState::Stopping) {
            self.transition_done.wait(&mut inner);
        }
        let Some(session) = inner.session.take() else {
            return Ok(None);
        };
        self.set_state(&mut inner, RecordingState::Stopping);
        drop(inner);

        tracing::info!("Stopping recording {}", session.id());
        let result = session.finish();

        let mut inner = self.inner.lock();
        if let Ok(summary) = &result {
            inner.last_summary = Some(summary.clone());
        }
        self.set_state(&mut inner, RecordingState::Idle);
        result.map(Some)
    }
}

impl Default for RecordingManager {
    fn default() -> Self {
        Self::new(RecorderConfig::default())
    }
}
