//! Frame clock and drift correction
//!
//! The mixer hands out audio in its own batch size, so a tick usually gathers
//! a little more audio than one frame's worth. The surplus is banked in
//! `accumulated_error`; once a whole frame's worth has piled up, the next tick
//! is skipped (no new video, no audio) and the bank is drawn down by one
//! frame. A skipped tick still holds its slot on the video timeline, so after
//! `n` ticks the captured audio runs `accumulated_error` samples ahead of
//! `n` frames, which stays under one frame plus one mixer batch.

/// What the recorder does on the upcoming tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    /// Capture video and one frame's worth of audio
    Capture,
    /// Sit this tick out to pay back banked audio
    Skip,
    /// The session is no longer recording
    Halted,
}

#[derive(Debug, Clone)]
pub struct FrameClock {
    target_samples_per_frame: i64,
    accumulated_error: i64,
    /// A capture tick was started and has not been completed yet
    tick_open: bool,
    frames_captured: u64,
    frames_skipped: u64,
    samples_captured: u64,
}

impl FrameClock {
    pub fn new(sample_rate: u32, fps: u32) -> Self {
        Self {
            target_samples_per_frame: target_for(sample_rate, fps),
            accumulated_error: 0,
            tick_open: false,
            frames_captured: 0,
            frames_skipped: 0,
            samples_captured: 0,
        }
    }

    /// Decide the fate of the next tick
    pub fn begin_tick(&mut self) -> TickDecision {
        if self.accumulated_error >= self.target_samples_per_frame {
            self.accumulated_error -= self.target_samples_per_frame;
            self.frames_skipped += 1;
            TickDecision::Skip
        } else {
            self.tick_open = true;
            TickDecision::Capture
        }
    }

    /// Account for the audio gathered by a capture tick.
    ///
    /// Returns false (and changes nothing) if no capture tick is open, so the
    /// error is updated exactly once per completed frame.
    pub fn complete_tick(&mut self, captured_samples: u64) -> bool {
        if !self.tick_open {
            return false;
        }
        self.tick_open = false;
        self.accumulated_error += captured_samples as i64 - self.target_samples_per_frame;
        self.frames_captured += 1;
        self.samples_captured += captured_samples;
        true
    }

    /// Forget a capture tick whose frame never completed
    pub fn abandon_tick(&mut self) {
        self.tick_open = false;
    }

    pub fn target_samples_per_frame(&self) -> u32 {
        self.target_samples_per_frame as u32
    }

    pub fn accumulated_error(&self) -> i64 {
        self.accumulated_error
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped
    }

    pub fn samples_captured(&self) -> u64 {
        self.samples_captured
    }

    pub fn is_tick_open(&self) -> bool {
        self.tick_open
    }
}

fn target_for(sample_rate: u32, fps: u32) -> i64 {
    (sample_rate / fps.max(1)).max(1) as i64
}
