//! Producer side of the pipeline
//!
//! This module paces capture against the frame clock, gathers audio from the
//! host mixer and samples rendered video frames.

pub mod clock;
pub mod rendezvous;
pub mod sampler;

pub use clock::{FrameClock, TickDecision};
pub use rendezvous::{MixerTap, RendezvousShared};
pub use sampler::{PixelLayout, SourceImage, VideoSampler};
