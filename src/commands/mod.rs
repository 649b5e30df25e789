//! Command handlers
//!
//! The thin control surface a host calls to start and stop recording.

pub mod recording;
