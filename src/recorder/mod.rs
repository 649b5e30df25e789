//! Recording lifecycle
//!
//! - `RecordingManager` gates start and stop so at most one session exists
//! - `CaptureSession` is the handle the host drives once per tick
//! - `state` holds the state machine and the summary a session leaves behind

pub mod manager;
pub mod session;
pub mod state;

pub use manager::RecordingManager;
pub use session::{CaptureSession, TickOutcome};
pub use state::{RecordingState, RecordingSummary, StartRequest};
