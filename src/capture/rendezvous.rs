//! Audio rendezvous between the mixer, the capture thread and the tick driver
//!
//! Three parties meet once per captured tick:
//!
//! - the tick driver (host main thread) opens the capture window,
//! - the host mixer callback copies every batch it produces while the window
//!   is open into a lock-free ring, counting samples as it goes,
//! - the capture thread waits until a frame's worth of samples has arrived,
//!   seals the window, drains the ring into the encoder and closes the window.
//!
//! The driver then reads the final count for drift correction. Every wait is
//! a spin on an atomic so the real-time mixer thread is never parked, and
//! every spin also watches the `recording` flag so stopping cannot deadlock.

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::encoder::Encoder;
use crate::utils::{RecorderError, Result};

/// Window is shut; the mixer ignores batches
const WINDOW_CLOSED: u8 = 0;
/// Window is open; the mixer copies batches
const WINDOW_OPEN: u8 = 1;
/// Quota met; the capture thread is draining, the mixer ignores batches
const WINDOW_SEALED: u8 = 2;

/// Spins before each busy-wait starts yielding its time slice
const SPINS_BEFORE_YIELD: u32 = 256;

/// State shared by the three parties
pub struct RendezvousShared {
    recording: AtomicBool,
    window: AtomicU8,
    /// Set by the mixer for the duration of one callback
    mixer_busy: AtomicBool,
    /// Samples per channel captured in the current window
    captured: AtomicU64,
    target: AtomicU64,
    warmup_remaining: AtomicU32,
    /// Samples the ring had no room for
    overflowed: AtomicU64,
}

impl RendezvousShared {
    pub fn new(target_samples_per_frame: u32, warmup_batches: u32) -> Self {
        Self {
            recording: AtomicBool::new(true),
            window: AtomicU8::new(WINDOW_CLOSED),
            mixer_busy: AtomicBool::new(false),
            captured: AtomicU64::new(0),
            target: AtomicU64::new(target_samples_per_frame as u64),
            warmup_remaining: AtomicU32::new(warmup_batches),
            overflowed: AtomicU64::new(0),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Release every spinning party; used when the session stops
    pub fn stop(&self) {
        self.recording.store(false, Ordering::Release);
    }

    /// Tick driver: start gathering audio for a new frame
    pub fn open_window(&self) {
        self.captured.store(0, Ordering::SeqCst);
        self.window.store(WINDOW_OPEN, Ordering::SeqCst);
    }

    /// Tick driver: wait for the capture thread to finish the window.
    ///
    /// Returns the number of samples per channel captured, or None if the
    /// session stopped before the window closed.
    pub fn wait_window_closed(&self) -> Option<u64> {
        let mut spins = 0u32;
        while self.window.load(Ordering::Acquire) != WINDOW_CLOSED {
            if !self.is_recording() {
                return None;
            }
            backoff(&mut spins);
        }
        Some(self.captured.swap(0, Ordering::AcqRel))
    }

    /// Capture thread: wait until the open window holds a frame's worth of audio
    fn wait_for_quota(&self) -> bool {
        let mut spins = 0u32;
        loop {
            if !self.is_recording() {
                return false;
            }
            if self.window.load(Ordering::Acquire) == WINDOW_OPEN
                && self.captured.load(Ordering::Acquire) >= self.target.load(Ordering::Acquire)
            {
                return true;
            }
            backoff(&mut spins);
        }
    }

    /// Capture thread: stop the mixer from adding more, then wait out any
    /// callback that saw the window open before the seal.
    fn seal_window(&self) {
        self.window.store(WINDOW_SEALED, Ordering::SeqCst);
        let mut spins = 0u32;
        while self.mixer_busy.load(Ordering::SeqCst) {
            backoff(&mut spins);
        }
    }

    fn close_window(&self) {
        self.window.store(WINDOW_CLOSED, Ordering::Release);
    }

    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Acquire)
    }

    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }

    pub fn warmup_remaining(&self) -> u32 {
        self.warmup_remaining.load(Ordering::Relaxed)
    }

    /// Claim one warm-up batch, if any are left
    fn take_warmup_batch(&self) -> bool {
        self.warmup_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn backoff(spins: &mut u32) {
    if *spins < SPINS_BEFORE_YIELD {
        *spins += 1;
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}

/// The recorder's hook into the host mixer callback.
///
/// Call [`MixerTap::process`] from the audio callback with every batch the
/// mixer produces. The batch is only read, never modified, so recording is
/// inaudible to the player.
pub struct MixerTap {
    shared: Arc<RendezvousShared>,
    producer: HeapProd<f32>,
    channels: usize,
}

impl MixerTap {
    /// Copy one interleaved batch if the capture window is open
    pub fn process(&mut self, interleaved: &[f32]) {
        let shared = &*self.shared;
        shared.mixer_busy.store(true, Ordering::SeqCst);

        if shared.window.load(Ordering::SeqCst) == WINDOW_OPEN {
            let len = interleaved.len() - interleaved.len() % self.channels;
            let pushed = if shared.take_warmup_batch() {
                self.producer
                    .push_iter(std::iter::repeat(0.0f32).take(len))
            } else {
                self.producer.push_slice(&interleaved[..len])
            };
            if pushed < len {
                shared
                    .overflowed
                    .fetch_add((len - pushed) as u64, Ordering::Relaxed);
            }
            let frames = (pushed / self.channels) as u64;
            shared.captured.fetch_add(frames, Ordering::AcqRel);
        }

        shared.mixer_busy.store(false, Ordering::SeqCst);
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}

/// Build the ring shared by the mixer tap and the capture thread.
///
/// The ring holds one second of audio, far more than one window ever needs.
pub fn audio_ring(
    shared: Arc<RendezvousShared>,
    sample_rate: u32,
    channels: u16,
) -> (MixerTap, HeapCons<f32>) {
    let capacity = (sample_rate as usize).max(1) * channels.max(1) as usize;
    let (producer, consumer) = HeapRb::<f32>::new(capacity).split();
    let tap = MixerTap {
        shared,
        producer,
        channels: channels.max(1) as usize,
    };
    (tap, consumer)
}

/// Start the capture-management thread for a session
pub fn spawn_capture_thread(
    shared: Arc<RendezvousShared>,
    consumer: HeapCons<f32>,
    channels: u16,
    encoder: Arc<Mutex<Encoder>>,
    on_fatal: impl Fn(RecorderError) + Send + 'static,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("lockstep-audio-capture".into())
        .spawn(move || {
            capture_loop(&shared, consumer, channels as usize, &encoder, &on_fatal);
        })
}

fn capture_loop(
    shared: &RendezvousShared,
    mut consumer: HeapCons<f32>,
    channels: usize,
    encoder: &Mutex<Encoder>,
    on_fatal: &dyn Fn(RecorderError),
) {
    tracing::debug!("Audio capture thread started");
    let mut reported_overflow = 0u64;

    while shared.wait_for_quota() {
        shared.seal_window();

        if let Err(e) = drain_window(&mut consumer, channels, encoder) {
            tracing::error!("Failed to submit captured audio: {}", e);
            if e.is_fatal() {
                on_fatal(e);
                shared.stop();
            }
        }

        let overflowed = shared.overflowed();
        if overflowed > reported_overflow {
            tracing::warn!(
                "Audio ring overflowed, {} samples lost so far",
                overflowed
            );
            reported_overflow = overflowed;
        }

        shared.close_window();
    }

    // Nobody will drain a window left open at shutdown
    shared.close_window();
    tracing::debug!("Audio capture thread exiting");
}

/// Move everything in the ring into the encoder as one audio submission
fn drain_window(
    consumer: &mut HeapCons<f32>,
    channels: usize,
    encoder: &Mutex<Encoder>,
) -> Result<()> {
    let available = consumer.occupied_len();
    let samples = available / channels;
    if samples == 0 {
        return Ok(());
    }

    let mut encoder = encoder.lock();
    let mut frame = encoder.prepare_audio(channels, samples)?;
    let copied = consumer.pop_slice(frame.buffer_mut());
    debug_assert_eq!(copied, samples * channels);
    frame.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::clock::{FrameClock, TickDecision};
    use crate::encoder::null::MemoryContainer;
    use crate::encoder::{EncoderSettings, StreamKind};
    use std::time::Duration;

    fn settings() -> EncoderSettings {
        EncoderSettings::for_tests(64, 32, 60, 48_000, 2)
    }

    #[test]
    fn test_closed_window_ignores_batches() {
        let shared = Arc::new(RendezvousShared::new(800, 0));
        let (mut tap, consumer) = audio_ring(shared.clone(), 48_000, 2);

        tap.process(&[0.5; 2048]);
        assert_eq!(shared.captured(), 0);
        assert_eq!(consumer.occupied_len(), 0);

        shared.open_window();
        tap.process(&[0.5; 2048]);
        assert_eq!(shared.captured(), 1024);
        assert_eq!(consumer.occupied_len(), 2048);
    }

    #[test]
    fn test_warmup_batches_are_zero_filled() {
        let shared = Arc::new(RendezvousShared::new(800, 2));
        let (mut tap, mut consumer) = audio_ring(shared.clone(), 48_000, 2);
        shared.open_window();

        tap.process(&[0.25; 8]);
        tap.process(&[0.25; 8]);
        tap.process(&[0.25; 8]);
        assert_eq!(shared.warmup_remaining(), 0);

        let mut out = [1.0f32; 24];
        assert_eq!(consumer.pop_slice(&mut out), 24);
        assert!(out[..16].iter().all(|s| *s == 0.0));
        assert!(out[16..].iter().all(|s| *s == 0.25));
    }

    #[test]
    fn test_warmup_only_counts_captured_batches() {
        let shared = Arc::new(RendezvousShared::new(800, 1));
        let (mut tap, mut consumer) = audio_ring(shared.clone(), 48_000, 1);

        // Window closed: the warm-up budget is not spent
        tap.process(&[0.75; 4]);
        assert_eq!(shared.warmup_remaining(), 1);

        shared.open_window();
        tap.process(&[0.75; 4]);
        tap.process(&[0.75; 4]);
        let mut out = [1.0f32; 8];
        consumer.pop_slice(&mut out);
        assert_eq!(&out[..4], &[0.0; 4]);
        assert_eq!(&out[4..], &[0.75; 4]);
    }

    #[test]
    fn test_partial_frames_are_trimmed() {
        let shared = Arc::new(RendezvousShared::new(800, 0));
        let (mut tap, consumer) = audio_ring(shared.clone(), 48_000, 2);
        shared.open_window();
        tap.process(&[0.1; 7]);
        assert_eq!(shared.captured(), 3);
        assert_eq!(consumer.occupied_len(), 6);
    }

    #[test]
    fn test_stop_releases_waiters() {
        let shared = Arc::new(RendezvousShared::new(800, 0));
        shared.open_window();

        let waiter = {
            let shared = shared.clone();
            std::thread::spawn(move || shared.wait_window_closed())
        };
        std::thread::sleep(Duration::from_millis(20));
        shared.stop();
        assert_eq!(waiter.join().unwrap(), None);
        assert!(!shared.wait_for_quota());
    }

    #[test]
    fn test_handshake_delivers_audio_to_encoder() {
        let (container, log) = MemoryContainer::new();
        let encoder = Arc::new(Mutex::new(Encoder::null(&settings(), container).unwrap()));
        let shared = Arc::new(RendezvousShared::new(800, 0));
        let (mut tap, consumer) = audio_ring(shared.clone(), 48_000, 2);
        let handle =
            spawn_capture_thread(shared.clone(), consumer, 2, encoder.clone(), |_| {}).unwrap();

        let batch = vec![0.5f32; 1024 * 2];
        let mut counts = Vec::new();
        for _ in 0..4 {
            shared.open_window();
            tap.process(&batch);
            counts.push(shared.wait_window_closed().unwrap());
        }
        assert_eq!(counts, vec![1024; 4]);

        shared.stop();
        handle.join().unwrap();

        let stats = encoder.lock().end().unwrap();
        assert_eq!(stats.audio_samples, 4096);
        // 4096 samples fill four 1024-sample codec frames exactly
        assert_eq!(log.packets(StreamKind::Audio).len(), 4);
    }

    #[test]
    fn test_free_running_mixer_loses_no_samples() {
        let (container, log) = MemoryContainer::new();
        let encoder = Arc::new(Mutex::new(Encoder::null(&settings(), container).unwrap()));
        let shared = Arc::new(RendezvousShared::new(800, 0));
        let (mut tap, consumer) = audio_ring(shared.clone(), 48_000, 2);
        let capture =
            spawn_capture_thread(shared.clone(), consumer, 2, encoder.clone(), |_| {}).unwrap();

        // The mixer runs on its own thread with irregular batches, like a
        // real audio callback, whether or not a window is open
        let running = Arc::new(AtomicBool::new(true));
        let mixer = {
            let running = running.clone();
            std::thread::spawn(move || {
                let batches = [512usize, 1024, 960, 1100, 800, 2048, 441];
                let mut i = 0;
                while running.load(Ordering::Acquire) {
                    tap.process(&vec![0.5f32; batches[i % batches.len()] * 2]);
                    i += 1;
                    std::thread::sleep(Duration::from_micros(200));
                }
            })
        };

        let mut clock = FrameClock::new(48_000, 60);
        let mut total = 0u64;
        for _ in 0..300 {
            if clock.begin_tick() == TickDecision::Capture {
                shared.open_window();
                let captured = shared.wait_window_closed().unwrap();
                assert!(captured >= 800, "window closed early with {captured}");
                clock.complete_tick(captured);
                total += captured;
            }
        }
        running.store(false, Ordering::Release);
        mixer.join().unwrap();
        shared.stop();
        capture.join().unwrap();

        let stats = encoder.lock().end().unwrap();
        assert_eq!(shared.overflowed(), 0);
        assert_eq!(clock.samples_captured(), total);
        assert_eq!(stats.audio_samples, total);
        let bytes: usize = log
            .packets(StreamKind::Audio)
            .iter()
            .map(|p| p.data.len())
            .sum();
        assert_eq!(bytes as u64, total * 2 * 4);
        assert!(clock.frames_skipped() > 0);
    }
}
