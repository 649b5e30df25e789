//! Capture session handle
//!
//! Everything one recording needs lives here: the config snapshot, the frame
//! clock, the rendezvous state, the encoder and the capture thread. The host
//! gets an `Arc<CaptureSession>` from the manager and drives it once per tick:
//!
//! ```text
//! match session.begin_tick() {
//!     TickDecision::Capture => {
//!         session.capture_frame(&image)?;   // render thread
//!         if session.end_tick() != TickOutcome::Continue {
//!             break;                        // waits for this tick's audio
//!         }
//!     }
//!     TickDecision::Skip => {}
//!     TickDecision::Halted => break,
//! }
//! ```
//!
//! The mixer side uses the [`MixerTap`] taken from the session once at start.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use uuid::Uuid;

use crate::capture::rendezvous::{audio_ring, spawn_capture_thread};
use crate::capture::{FrameClock, MixerTap, RendezvousShared, SourceImage, TickDecision, VideoSampler};
use crate::config::RecorderConfig;
use crate::encoder::{Encoder, EncoderSettings, EncoderStats};
use crate::recorder::state::{RecordingSummary, StartRequest};
use crate::utils::{RecorderError, Result};

/// How a completed tick left the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// The requested number of frames has been written
    LimitReached,
    /// The session stopped or failed during the tick
    Halted,
}

pub struct CaptureSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    config: RecorderConfig,
    output_path: PathBuf,
    frame_limit: Option<u64>,
    clock: Mutex<FrameClock>,
    shared: Arc<RendezvousShared>,
    encoder: Arc<Mutex<Encoder>>,
    sampler: Mutex<VideoSampler>,
    mixer_tap: Mutex<Option<MixerTap>>,
    capture_thread: Mutex<Option<JoinHandle<()>>>,
    /// First fatal error seen on any thread
    fault: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("id", &self.id)
            .field("started_at", &self.started_at)
            .field("output_path", &self.output_path)
            .field("frame_limit", &self.frame_limit)
            .field("clock", &*self.clock.lock())
            .field("fault", &*self.fault.lock())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

impl CaptureSession {
    /// Validate `config`, open the configured encoder and start capturing
    pub fn start(config: RecorderConfig, request: &StartRequest) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.output.directory)?;

        let output_path = config.output_path(request.file_name.as_deref());
        let settings = EncoderSettings::from_config(&config);
        let encoder = Encoder::open(config.output.backend, &settings, &output_path)?;

        Self::with_encoder(config, request, output_path, encoder)
    }

    /// Start a session around an already opened encoder
    pub(crate) fn with_encoder(
        config: RecorderConfig,
        request: &StartRequest,
        output_path: PathBuf,
        encoder: Encoder,
    ) -> Result<Self> {
        let audio = &config.audio;
        let clock = FrameClock::new(audio.sample_rate, config.video.fps);
        let shared = Arc::new(RendezvousShared::new(
            clock.target_samples_per_frame(),
            audio.warmup_batches,
        ));
        let (tap, consumer) = audio_ring(shared.clone(), audio.sample_rate, audio.host_channels);
        let encoder = Arc::new(Mutex::new(encoder));
        let fault = Arc::new(Mutex::new(None));

        let on_fatal = {
            let fault = fault.clone();
            move |e: RecorderError| {
                fault.lock().get_or_insert_with(|| e.to_string());
            }
        };
        let thread = match spawn_capture_thread(
            shared.clone(),
            consumer,
            audio.host_channels,
            encoder.clone(),
            on_fatal,
        ) {
            Ok(thread) => thread,
            Err(e) => {
                // The encoder may own a subprocess; do not leave it running
                if let Err(end_err) = encoder.lock().end() {
                    tracing::warn!("Failed to close encoder after aborted start: {}", end_err);
                }
                return Err(e.into());
            }
        };

        let id = Uuid::new_v4();
        tracing::info!(
            "Session {} started: {} samples per frame, output {:?}",
            id,
            clock.target_samples_per_frame(),
            output_path
        );

        Ok(Self {
            id,
            started_at: Utc::now(),
            frame_limit: request.frame_limit,
            output_path,
            config,
            clock: Mutex::new(clock),
            shared,
            encoder,
            sampler: Mutex::new(VideoSampler::new()),
            mixer_tap: Mutex::new(Some(tap)),
            capture_thread: Mutex::new(Some(thread)),
            fault,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// The config this session was started with
    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Hand the mixer hook to the host audio callback. Only the first call
    /// gets it.
    pub fn take_mixer_tap(&self) -> Option<MixerTap> {
        self.mixer_tap.lock().take()
    }

    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    fn set_fault(&self, e: &RecorderError) {
        tracing::error!("Session {} failed: {}", self.id, e);
        self.fault.lock().get_or_insert_with(|| e.to_string());
        self.shared.stop();
    }

    fn limit_reached(&self, clock: &FrameClock) -> bool {
        self.frame_limit
            .is_some_and(|limit| clock.frames_captured() >= limit)
    }

    /// Decide what the recorder does this tick, and get ready for it.
    ///
    /// On `Capture` the audio window is open when this returns; the host must
    /// follow with [`capture_frame`](Self::capture_frame) and
    /// [`end_tick`](Self::end_tick).
    pub fn begin_tick(&self) -> TickDecision {
        if self.fault.lock().is_some() || !self.shared.is_recording() {
            return TickDecision::Halted;
        }
        if let Err(e) = self.encoder.lock().health() {
            self.set_fault(&e);
            return TickDecision::Halted;
        }

        let mut clock = self.clock.lock();
        if self.limit_reached(&clock) {
            return TickDecision::Halted;
        }
        if clock.is_tick_open() {
            tracing::warn!("Previous tick was never completed, abandoning it");
            // Its audio still drains; the count is discarded
            self.shared.wait_window_closed();
            clock.abandon_tick();
        }

        let decision = clock.begin_tick();
        match decision {
            TickDecision::Capture => self.shared.open_window(),
            TickDecision::Skip => {
                tracing::trace!("Skipping tick, drift {}", clock.accumulated_error());
                if let Err(e) = self.encoder.lock().hold_video() {
                    if e.is_fatal() {
                        self.set_fault(&e);
                        return TickDecision::Halted;
                    }
                    tracing::warn!("Failed to hold video over skipped tick: {}", e);
                }
            }
            TickDecision::Halted => {}
        }
        decision
    }

    /// Copy this tick's rendered image into the encoder.
    ///
    /// A failure costs this tick's video frame only; the tick's audio is still
    /// gathered by [`end_tick`](Self::end_tick). Fatal errors also halt the
    /// session.
    pub fn capture_frame(&self, image: &SourceImage<'_>) -> Result<()> {
        if !self.clock.lock().is_tick_open() {
            return Err(RecorderError::InvalidFrame(
                "no capture tick is open".to_string(),
            ));
        }

        let result = {
            let mut encoder = self.encoder.lock();
            self.sampler.lock().sample(image, &mut encoder)
        };
        if let Err(e) = &result {
            if e.is_fatal() {
                self.set_fault(e);
            } else {
                tracing::warn!("Frame not captured: {}", e);
            }
        }
        result
    }

    /// Wait for this tick's audio and settle the frame clock
    ///
    /// Without an open capture tick this only reports the session's status.
    pub fn end_tick(&self) -> TickOutcome {
        if !self.clock.lock().is_tick_open() {
            return self.outcome(&self.clock.lock());
        }

        let captured = self.shared.wait_window_closed();
        let mut clock = self.clock.lock();
        let Some(captured) = captured else {
            clock.abandon_tick();
            return TickOutcome::Halted;
        };
        clock.complete_tick(captured);

        let outcome = self.outcome(&clock);
        if outcome == TickOutcome::LimitReached {
            tracing::info!(
                "Session {} reached its limit of {} frames",
                self.id,
                clock.frames_captured()
            );
        }
        outcome
    }

    fn outcome(&self, clock: &FrameClock) -> TickOutcome {
        if self.fault.lock().is_some() || !self.shared.is_recording() {
            TickOutcome::Halted
        } else if self.limit_reached(clock) {
            TickOutcome::LimitReached
        } else {
            TickOutcome::Continue
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.clock.lock().frames_captured()
    }

    pub fn frames_skipped(&self) -> u64 {
        self.clock.lock().frames_skipped()
    }

    pub fn accumulated_error(&self) -> i64 {
        self.clock.lock().accumulated_error()
    }

    pub fn encoder_stats(&self) -> EncoderStats {
        self.encoder.lock().stats()
    }

    pub fn is_finished(&self) -> bool {
        self.capture_thread.lock().is_none()
    }

    /// True while ticks can still capture: not finished, not failed, and
    /// short of the frame limit
    pub fn is_capturing(&self) -> bool {
        self.shared.is_recording()
            && self.fault.lock().is_none()
            && !self.limit_reached(&self.clock.lock())
    }

    /// Stop capturing, finalize the output and write the session sidecar.
    ///
    /// Blocks until the capture thread has exited and the encoder has written
    /// its trailer. An encoder error is returned after the sidecar is written.
    pub fn finish(&self) -> Result<RecordingSummary> {
        let Some(thread) = self.capture_thread.lock().take() else {
            return Err(RecorderError::NotRecording);
        };

        self.shared.stop();
        if thread.join().is_err() {
            tracing::error!("Audio capture thread panicked");
        }

        let overflowed = self.shared.overflowed();
        if overflowed > 0 {
            tracing::warn!("{} audio samples were lost to ring overflow", overflowed);
        }

        let end_result = self.encoder.lock().end();
        let clock = self.clock.lock().clone();
        let (stats, error) = match &end_result {
            Ok(stats) => (stats.clone(), self.fault()),
            Err(e) => {
                tracing::error!("Failed to finalize {:?}: {}", self.output_path, e);
                (self.encoder.lock().stats(), Some(e.to_string()))
            }
        };

        let summary = RecordingSummary {
            session_id: self.id,
            started_at: self.started_at,
            ended_at: Utc::now(),
            output_path: self.output_path.clone(),
            frames_written: clock.frames_captured(),
            frames_skipped: clock.frames_skipped(),
            audio_samples: clock.samples_captured(),
            final_drift: clock.accumulated_error(),
            encoder: stats,
            error,
        };

        match summary.save() {
            Ok(path) => tracing::debug!("Session summary written to {:?}", path),
            Err(e) => tracing::warn!("Failed to write session summary: {}", e),
        }

        tracing::info!(
            "Session {} finished: {} frames, {} skipped, drift {}",
            self.id,
            summary.frames_written,
            summary.frames_skipped,
            summary.final_drift
        );

        end_result.map(|_| summary)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if !self.is_finished() {
            tracing::warn!("Session {} dropped without finishing", self.id);
            if let Err(e) = self.finish() {
                tracing::error!("Failed to finish dropped session: {}", e);
            }
        }
    }
}
