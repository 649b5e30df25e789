//! Encoder over an in-process codec pair and container writer

use crate::encoder::convert::SampleFormat;
use crate::encoder::packet::{Codec, ContainerWriter, Muxer};
use crate::encoder::stream::{AudioStream, VideoStream, WorkingBuffers};
use crate::encoder::{EncoderSettings, EncoderStats, MediaEncoder};
use crate::utils::{RecorderError, Result, StreamKind};

/// Drives one video and one audio stream into a shared container.
///
/// Streams and muxer are `Option`s so `end` can release them in reverse order
/// of creation.
pub struct MuxedEncoder<V: Codec, A: Codec, W: ContainerWriter> {
    width: u32,
    height: u32,
    muxer: Option<Muxer<W>>,
    video: Option<VideoStream<V>>,
    audio: Option<AudioStream<A>>,
    buffers: WorkingBuffers,
    stats: EncoderStats,
}

impl<V: Codec, A: Codec, W: ContainerWriter> MuxedEncoder<V, A, W> {
    pub fn new(
        settings: &EncoderSettings,
        video_codec: V,
        audio_codec: A,
        audio_frame_size: usize,
        sample_format: SampleFormat,
        writer: W,
    ) -> Result<Self> {
        let mut muxer = Muxer::new(writer);
        let mut video = VideoStream::new(video_codec, settings.fps, settings.speed);
        let mut audio = AudioStream::new(
            audio_codec,
            settings.sample_rate,
            settings.channels,
            audio_frame_size,
            sample_format,
        );
        video.register(&mut muxer)?;
        audio.register(&mut muxer)?;
        muxer.write_header()?;

        Ok(Self {
            width: settings.width,
            height: settings.height,
            muxer: Some(muxer),
            video: Some(video),
            audio: Some(audio),
            buffers: WorkingBuffers::default(),
            stats: EncoderStats::default(),
        })
    }

    fn open_parts(&mut self) -> Result<(&mut Muxer<W>, &mut VideoStream<V>, &mut AudioStream<A>)> {
        match (&mut self.muxer, &mut self.video, &mut self.audio) {
            (Some(m), Some(v), Some(a)) => Ok((m, v, a)),
            _ => Err(RecorderError::EncoderClosed),
        }
    }

    fn refresh_stats(&mut self) {
        if let Some(v) = &self.video {
            let t = v.timeline();
            self.stats.video_frames = v.frames();
            self.stats.held_frames = v.held();
            self.stats.video_packets = t.packets_written;
        }
        if let Some(a) = &self.audio {
            let t = a.timeline();
            self.stats.audio_samples = a.samples_in();
            self.stats.audio_packets = t.packets_written;
        }
        let (vt, at) = (
            self.video.as_ref().map(|v| v.timeline()),
            self.audio.as_ref().map(|a| a.timeline()),
        );
        if let (Some(vt), Some(at)) = (vt, at) {
            self.stats.bytes_written = vt.bytes_written + at.bytes_written;
            self.stats.dropped_packets = vt.packets_dropped + at.packets_dropped;
        }
    }

    #[cfg(test)]
    pub fn last_video_frame(&self) -> Vec<u8> {
        self.buffers.packed_video()
    }
}

impl<V: Codec, A: Codec, W: ContainerWriter> MediaEncoder for MuxedEncoder<V, A, W> {
    fn begin_video(&mut self, width: u32, height: u32) -> Result<usize> {
        self.open_parts()?;
        if width != self.width || height != self.height {
            return Err(RecorderError::ResolutionMismatch {
                got_width: width,
                got_height: height,
                want_width: self.width,
                want_height: self.height,
            });
        }
        Ok(self.buffers.prepare_video(width, height))
    }

    fn video_buffer(&mut self) -> &mut [u8] {
        self.buffers.video_mut()
    }

    fn finish_video(&mut self) -> Result<()> {
        let (muxer, video, _) = match (&mut self.muxer, &mut self.video, &mut self.audio) {
            (Some(m), Some(v), Some(a)) => (m, v, a),
            _ => return Err(RecorderError::EncoderClosed),
        };
        let (data, width, height, stride) = self.buffers.video();
        let result = video.submit(data, width, height, stride, muxer);
        if result.is_err() {
            self.stats.dropped_frames += 1;
        }
        self.refresh_stats();
        result
    }

    fn discard_video(&mut self) {
        self.stats.dropped_frames += 1;
    }

    fn hold_video(&mut self) -> Result<()> {
        let (_, video, _) = self.open_parts()?;
        video.hold();
        self.refresh_stats();
        Ok(())
    }

    fn begin_audio(&mut self, channels: usize, samples: usize) -> Result<()> {
        self.open_parts()?;
        self.buffers.prepare_audio(channels, samples);
        Ok(())
    }

    fn audio_buffer(&mut self) -> &mut [f32] {
        self.buffers.audio_mut()
    }

    fn finish_audio(&mut self) -> Result<()> {
        let (muxer, audio) = match (&mut self.muxer, &mut self.audio) {
            (Some(m), Some(a)) if self.video.is_some() => (m, a),
            _ => return Err(RecorderError::EncoderClosed),
        };
        let (samples, channels) = self.buffers.audio();
        let result = audio.submit(samples, channels, muxer);
        self.refresh_stats();
        result
    }

    fn discard_audio(&mut self) {
        tracing::debug!("Audio batch discarded before submission");
    }

    fn stats(&self) -> EncoderStats {
        self.stats.clone()
    }

    fn end(&mut self) -> Result<EncoderStats> {
        let (muxer, video, audio) = self.open_parts()?;

        // Keep going after a failure so the trailer still gets a chance
        let mut first_error = None;
        if let Err(e) = video.flush(muxer) {
            tracing::error!("Failed to flush {} stream: {}", StreamKind::Video, e);
            first_error.get_or_insert(e);
        }
        if let Err(e) = audio.flush(muxer) {
            tracing::error!("Failed to flush {} stream: {}", StreamKind::Audio, e);
            first_error.get_or_insert(e);
        }
        if let Err(e) = muxer.finish() {
            tracing::error!("Failed to finalize container: {}", e);
            first_error.get_or_insert(e);
        }
        self.refresh_stats();

        self.audio = None;
        self.video = None;
        self.muxer = None;

        match first_error {
            Some(e) => Err(e),
            None => Ok(self.stats.clone()),
        }
    }
}
