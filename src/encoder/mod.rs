//! Encoder: turns raw captured frames into a media file
//!
//! Producers talk to the encoder through a prepare/finish pair. `prepare_*`
//! hands out a guard that borrows the encoder's working buffer; the guard is
//! consumed by `finish`, or discards the frame if it is dropped unfinished.
//! The borrow keeps the buffer from outliving the call pair.

pub mod convert;
#[cfg(feature = "embedded")]
pub mod embedded;
pub mod muxed;
pub mod null;
pub mod packet;
pub mod pipe;
pub mod stream;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::config::{
    AudioCodec, BackendKind, ContainerFormat, PipeSettings, RecorderConfig, VideoCodec,
};
pub use crate::utils::StreamKind;
use crate::utils::Result;

use self::convert::SampleFormat;
use self::muxed::MuxedEncoder;
use self::null::{MemoryContainer, PassthroughCodec};
use self::pipe::PipeEncoder;

/// Encoding parameters, fixed for the lifetime of a session
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    /// Capture resolution every submitted frame must match
    pub width: u32,
    pub height: u32,
    pub output_width: u32,
    pub output_height: u32,
    pub fps: u32,
    pub speed: f64,
    pub video_codec: VideoCodec,
    pub video_bitrate: u32,
    pub sample_rate: u32,
    /// Channel layout of the encoded audio stream
    pub channels: u16,
    pub audio_codec: AudioCodec,
    pub audio_bitrate: u32,
    pub container: ContainerFormat,
    pub pipe: PipeSettings,
}

impl EncoderSettings {
    pub fn from_config(config: &RecorderConfig) -> Self {
        let (output_width, output_height) = config.video.output_size();
        Self {
            width: config.video.width,
            height: config.video.height,
            output_width,
            output_height,
            fps: config.video.fps,
            speed: config.video.speed,
            video_codec: config.video.codec,
            video_bitrate: config.video.bitrate,
            sample_rate: config.audio.sample_rate,
            channels: config.audio.channels,
            audio_codec: config.audio.codec,
            audio_bitrate: config.audio.bitrate,
            container: config.output.container,
            pipe: config.pipe.clone(),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.pipe.shutdown_timeout_secs)
    }

    #[cfg(test)]
    pub fn for_tests(width: u32, height: u32, fps: u32, sample_rate: u32, channels: u16) -> Self {
        let mut config = RecorderConfig::default();
        config.video.width = width;
        config.video.height = height;
        config.video.fps = fps;
        config.audio.sample_rate = sample_rate;
        config.audio.channels = channels;
        Self::from_config(&config)
    }
}

/// Counters reported when an encoder finishes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderStats {
    pub video_frames: u64,
    /// Frame slots covered by the previous frame instead of a new one
    pub held_frames: u64,
    /// Audio samples per channel accepted
    pub audio_samples: u64,
    pub video_packets: u64,
    pub audio_packets: u64,
    pub bytes_written: u64,
    /// Frames lost to a full queue or a rejected submission
    pub dropped_frames: u64,
    /// Packets discarded for non-increasing timestamps
    pub dropped_packets: u64,
}

/// The contract every backend implements
pub trait MediaEncoder: Send {
    /// Make the video working buffer ready; returns its row stride in bytes
    fn begin_video(&mut self, width: u32, height: u32) -> Result<usize>;
    fn video_buffer(&mut self) -> &mut [u8];
    fn finish_video(&mut self) -> Result<()>;
    fn discard_video(&mut self);
    /// Extend the previous frame over one more frame slot
    fn hold_video(&mut self) -> Result<()>;

    /// Make the audio working buffer ready for `samples` frames of `channels`
    fn begin_audio(&mut self, channels: usize, samples: usize) -> Result<()>;
    fn audio_buffer(&mut self) -> &mut [f32];
    fn finish_audio(&mut self) -> Result<()>;
    fn discard_audio(&mut self);

    /// Err once the backend can no longer produce a valid file
    fn health(&self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> EncoderStats;

    /// Flush every stream and finalize the container. Must be the last call.
    fn end(&mut self) -> Result<EncoderStats>;
}

/// A session's encoder, one of a closed set of backends
pub enum Encoder {
    #[cfg(feature = "embedded")]
    Embedded(
        MuxedEncoder<embedded::GstCodec, embedded::GstCodec, embedded::GstContainer>,
    ),
    Pipe(PipeEncoder),
    Null(MuxedEncoder<PassthroughCodec, PassthroughCodec, MemoryContainer>),
}

impl Encoder {
    /// Open the configured backend, writing to `path`
    pub fn open(backend: BackendKind, settings: &EncoderSettings, path: &Path) -> Result<Self> {
        tracing::info!(
            "Opening {:?} encoder: {}x{} -> {}x{} @ {} fps, {} Hz x{} -> {:?}",
            backend,
            settings.width,
            settings.height,
            settings.output_width,
            settings.output_height,
            settings.fps,
            settings.sample_rate,
            settings.channels,
            path
        );
        match backend {
            BackendKind::Null => Self::null(settings, MemoryContainer::counting().0),
            BackendKind::ExternalProcess => Ok(Encoder::Pipe(PipeEncoder::spawn(settings, path)?)),
            #[cfg(feature = "embedded")]
            BackendKind::Embedded => Ok(Encoder::Embedded(embedded::open(settings, path)?)),
            #[cfg(not(feature = "embedded"))]
            BackendKind::Embedded => Err(crate::utils::RecorderError::Config(
                "embedded backend is not compiled in".into(),
            )),
        }
    }

    /// No-op backend recording into `container`
    pub fn null(settings: &EncoderSettings, container: MemoryContainer) -> Result<Self> {
        Ok(Encoder::Null(MuxedEncoder::new(
            settings,
            PassthroughCodec::new(1),
            PassthroughCodec::new(1),
            settings.audio_codec.frame_size(),
            SampleFormat::F32Le,
            container,
        )?))
    }

    fn backend(&mut self) -> &mut dyn MediaEncoder {
        match self {
            #[cfg(feature = "embedded")]
            Encoder::Embedded(e) => e,
            Encoder::Pipe(e) => e,
            Encoder::Null(e) => e,
        }
    }

    fn backend_ref(&self) -> &dyn MediaEncoder {
        match self {
            #[cfg(feature = "embedded")]
            Encoder::Embedded(e) => e,
            Encoder::Pipe(e) => e,
            Encoder::Null(e) => e,
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            #[cfg(feature = "embedded")]
            Encoder::Embedded(_) => BackendKind::Embedded,
            Encoder::Pipe(_) => BackendKind::ExternalProcess,
            Encoder::Null(_) => BackendKind::Null,
        }
    }

    /// Borrow the video working buffer for one frame
    pub fn prepare_video(&mut self, width: u32, height: u32) -> Result<VideoFrame<'_>> {
        let stride = self.backend().begin_video(width, height)?;
        Ok(VideoFrame {
            encoder: self,
            stride,
            finished: false,
        })
    }

    /// Borrow the audio working buffer for `samples` frames of `channels`
    pub fn prepare_audio(&mut self, channels: usize, samples: usize) -> Result<AudioFrame<'_>> {
        self.backend().begin_audio(channels, samples)?;
        Ok(AudioFrame {
            encoder: self,
            finished: false,
        })
    }

    /// Account for a tick whose frame was deliberately not captured
    pub fn hold_video(&mut self) -> Result<()> {
        self.backend().hold_video()
    }

    pub fn health(&self) -> Result<()> {
        self.backend_ref().health()
    }

    pub fn stats(&self) -> EncoderStats {
        self.backend_ref().stats()
    }

    pub fn end(&mut self) -> Result<EncoderStats> {
        self.backend().end()
    }

    /// Raw RGBA of the most recent video frame (no-op backend only)
    #[cfg(test)]
    pub fn last_video_frame(&self) -> Option<Vec<u8>> {
        match self {
            Encoder::Null(e) => Some(e.last_video_frame()),
            _ => None,
        }
    }
}

/// A video frame being written by a producer
pub struct VideoFrame<'a> {
    encoder: &'a mut Encoder,
    stride: usize,
    finished: bool,
}

impl VideoFrame<'_> {
    /// Bytes per row of the buffer, padding included
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.encoder.backend().video_buffer()
    }

    /// Hand the frame to the encoder
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.encoder.backend().finish_video()
    }
}

impl Drop for VideoFrame<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.encoder.backend().discard_video();
        }
    }
}

/// An audio batch being written by a producer
pub struct AudioFrame<'a> {
    encoder: &'a mut Encoder,
    finished: bool,
}

impl AudioFrame<'_> {
    /// Interleaved samples, exactly `channels * samples` long
    pub fn buffer_mut(&mut self) -> &mut [f32] {
        self.encoder.backend().audio_buffer()
    }

    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.encoder.backend().finish_audio()
    }
}

impl Drop for AudioFrame<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.encoder.backend().discard_audio();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::RecorderError;

    fn null_encoder() -> (Encoder, null::ContainerLog) {
        let settings = EncoderSettings::for_tests(4, 4, 30, 48_000, 2);
        let (container, log) = MemoryContainer::new();
        (Encoder::null(&settings, container).unwrap(), log)
    }

    #[test]
    fn test_dropped_guard_discards_frame() {
        let (mut encoder, _log) = null_encoder();
        {
            let mut frame = encoder.prepare_video(4, 4).unwrap();
            frame.buffer_mut()[0] = 255;
        }
        let stats = encoder.end().unwrap();
        assert_eq!(stats.video_frames, 0);
        assert_eq!(stats.dropped_frames, 1);
    }

    #[test]
    fn test_prepare_audio_returns_requested_length() {
        let (mut encoder, _log) = null_encoder();
        let mut frame = encoder.prepare_audio(6, 100).unwrap();
        assert_eq!(frame.buffer_mut().len(), 600);
        frame.finish().unwrap();
        assert_eq!(encoder.stats().audio_samples, 100);
    }

    #[test]
    fn test_end_writes_trailer_and_closes() {
        let (mut encoder, log) = null_encoder();
        let frame = encoder.prepare_video(4, 4).unwrap();
        frame.finish().unwrap();
        let stats = encoder.end().unwrap();
        assert_eq!(stats.video_frames, 1);
        assert_eq!(stats.video_packets, 1);
        assert!(log.trailer_written());

        assert!(matches!(encoder.end(), Err(RecorderError::EncoderClosed)));
        assert!(matches!(
            encoder.prepare_video(4, 4),
            Err(RecorderError::EncoderClosed)
        ));
    }

    #[test]
    fn test_open_null_backend() {
        let settings = EncoderSettings::for_tests(4, 4, 30, 48_000, 2);
        let dir = tempfile::tempdir().unwrap();
        let mut encoder =
            Encoder::open(BackendKind::Null, &settings, &dir.path().join("x.mp4")).unwrap();
        assert_eq!(encoder.kind(), BackendKind::Null);

        // Packets are counted, not kept
        for _ in 0..50 {
            encoder.prepare_video(4, 4).unwrap().finish().unwrap();
        }
        let stats = encoder.end().unwrap();
        assert_eq!(stats.video_frames, 50);
        assert_eq!(stats.video_packets, 50);
        assert_eq!(stats.bytes_written, 50 * 4 * 4 * 4);
    }
}
