//! Lockstep Recorder - frame-locked audio/video capture for interactive applications.
//!
//! The host drives a [`CaptureSession`](recorder::CaptureSession) once per
//! simulated tick. A frame clock decides whether the tick is captured, the
//! mixer hook and the capture thread gather exactly one frame's worth of audio,
//! and the encoder muxes both streams into one file through GStreamer, an
//! ffmpeg subprocess, or an in-memory backend.

pub mod capture;
pub mod commands;
pub mod config;
pub mod encoder;
pub mod recorder;
pub mod utils;

pub use config::RecorderConfig;
pub use recorder::{CaptureSession, RecordingManager, StartRequest, TickOutcome};
pub use utils::{RecorderError, Result};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the tracing subscriber. Call once from the host binary.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lockstep_recorder=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
