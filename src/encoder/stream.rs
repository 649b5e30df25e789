//! Per-stream assembly: raw input to native frames to packets

use crate::encoder::convert::{pack_rgba, SampleFormat};
use crate::encoder::packet::{
    drain_codec, rescale, Codec, ContainerWriter, Muxer, NativeFrame, Rational, StreamTimeline,
};
use crate::utils::{RecorderError, Result, StreamKind};

/// Container time base for video streams
pub const VIDEO_TIME_BASE: Rational = Rational::new(1, 90_000);

/// Row alignment of the raw video working buffer
const STRIDE_ALIGN: usize = 64;

/// Frame period as a rational number of seconds, `speed / fps`
pub fn frame_period(fps: u32, speed: f64) -> Rational {
    let speed_milli = (speed * 1000.0).round().max(1.0) as i64;
    Rational::new(speed_milli, fps.max(1) as i64 * 1000).reduced()
}

/// Video assembler: packs each raw frame for the codec and stamps it on the
/// frame-period grid.
pub struct VideoStream<C: Codec> {
    codec: C,
    timeline: StreamTimeline,
    /// Size last announced to the codec
    input_size: Option<(u32, u32)>,
    period: Rational,
    /// Grid slot of the next frame; holds advance it without a frame
    next_slot: u64,
    frames: u64,
    held: u64,
    native: NativeFrame,
    finished: bool,
}

impl<C: Codec> VideoStream<C> {
    pub fn new(codec: C, fps: u32, speed: f64) -> Self {
        Self {
            codec,
            timeline: StreamTimeline::new(StreamKind::Video, 0, VIDEO_TIME_BASE),
            input_size: None,
            period: frame_period(fps, speed),
            next_slot: 0,
            frames: 0,
            held: 0,
            native: NativeFrame::default(),
            finished: false,
        }
    }

    pub fn register<W: ContainerWriter>(&mut self, muxer: &mut Muxer<W>) -> Result<()> {
        self.timeline.index = muxer.add_stream(StreamKind::Video, VIDEO_TIME_BASE)?;
        Ok(())
    }

    /// Encode one RGBA frame; the codec scales it to the stream size
    pub fn submit<W: ContainerWriter>(
        &mut self,
        rgba: &[u8],
        width: u32,
        height: u32,
        stride: usize,
        muxer: &mut Muxer<W>,
    ) -> Result<()> {
        if self.input_size != Some((width, height)) {
            tracing::debug!("Video input is now {}x{}", width, height);
            self.codec.set_input_size(width, height)?;
            self.input_size = Some((width, height));
        }
        pack_rgba(rgba, width, height, stride, &mut self.native.data);

        let tb = self.codec.time_base();
        let slot = self.next_slot;
        self.native.pts = rescale(slot as i64, self.period, tb);
        self.native.duration = rescale(slot as i64 + 1, self.period, tb) - self.native.pts;
        self.next_slot += 1;

        self.codec.send_frame(Some(&self.native))?;
        self.frames += 1;
        drain_codec(&mut self.codec, &mut self.timeline, muxer)?;
        Ok(())
    }

    /// Let the previous frame cover the next slot too
    pub fn hold(&mut self) {
        self.next_slot += 1;
        self.held += 1;
    }

    /// Drain the codec to end of stream
    pub fn flush<W: ContainerWriter>(&mut self, muxer: &mut Muxer<W>) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        flush_codec(&mut self.codec, &mut self.timeline, muxer)
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn held(&self) -> u64 {
        self.held
    }

    pub fn timeline(&self) -> &StreamTimeline {
        &self.timeline
    }
}

/// Audio assembler: packs incoming samples into fixed-size codec frames
pub struct AudioStream<C: Codec> {
    codec: C,
    timeline: StreamTimeline,
    sample_rate: u32,
    channels: usize,
    frame_size: usize,
    format: SampleFormat,
    /// Interleaved samples of the frame being filled
    pcm: Vec<f32>,
    /// Samples per channel already in `pcm`
    cursor: usize,
    samples_emitted: u64,
    samples_in: u64,
    native: NativeFrame,
    finished: bool,
}

impl<C: Codec> AudioStream<C> {
    pub fn new(
        codec: C,
        sample_rate: u32,
        channels: u16,
        frame_size: usize,
        format: SampleFormat,
    ) -> Self {
        let channels = channels.max(1) as usize;
        let frame_size = frame_size.max(1);
        Self {
            codec,
            timeline: StreamTimeline::new(
                StreamKind::Audio,
                1,
                Rational::new(1, sample_rate.max(1) as i64),
            ),
            sample_rate: sample_rate.max(1),
            channels,
            frame_size,
            format,
            pcm: vec![0.0; frame_size * channels],
            cursor: 0,
            samples_emitted: 0,
            samples_in: 0,
            native: NativeFrame::default(),
            finished: false,
        }
    }

    pub fn register<W: ContainerWriter>(&mut self, muxer: &mut Muxer<W>) -> Result<()> {
        self.timeline.index = muxer.add_stream(StreamKind::Audio, self.timeline.time_base)?;
        Ok(())
    }

    /// Append interleaved samples with `in_channels` channels.
    ///
    /// Channels past the stream layout are dropped; channels the input lacks
    /// stay silent.
    pub fn submit<W: ContainerWriter>(
        &mut self,
        interleaved: &[f32],
        in_channels: usize,
        muxer: &mut Muxer<W>,
    ) -> Result<()> {
        if in_channels == 0 {
            return Ok(());
        }
        for frame in interleaved.chunks_exact(in_channels) {
            let base = self.cursor * self.channels;
            for c in 0..self.channels {
                self.pcm[base + c] = frame.get(c).copied().unwrap_or(0.0);
            }
            self.cursor += 1;
            self.samples_in += 1;
            if self.cursor == self.frame_size {
                self.emit(muxer)?;
            }
        }
        Ok(())
    }

    /// Encode the first `cursor` samples of `pcm` as one frame
    fn emit<W: ContainerWriter>(&mut self, muxer: &mut Muxer<W>) -> Result<()> {
        let samples = self.cursor;
        self.cursor = 0;

        let tb = self.codec.time_base();
        let rate = Rational::new(1, self.sample_rate as i64);
        let start = self.samples_emitted as i64;
        self.samples_emitted += samples as u64;

        self.format
            .encode(&self.pcm[..samples * self.channels], &mut self.native.data);
        self.native.samples = samples;
        self.native.pts = rescale(start, rate, tb);
        self.native.duration = rescale(start + samples as i64, rate, tb) - self.native.pts;

        self.codec.send_frame(Some(&self.native))?;
        drain_codec(&mut self.codec, &mut self.timeline, muxer)?;
        Ok(())
    }

    /// Emit any partial frame, then drain the codec to end of stream
    pub fn flush<W: ContainerWriter>(&mut self, muxer: &mut Muxer<W>) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if self.cursor > 0 {
            self.emit(muxer)?;
        }
        flush_codec(&mut self.codec, &mut self.timeline, muxer)
    }

    pub fn samples_in(&self) -> u64 {
        self.samples_in
    }

    pub fn samples_emitted(&self) -> u64 {
        self.samples_emitted
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn timeline(&self) -> &StreamTimeline {
        &self.timeline
    }
}

fn flush_codec<C: Codec, W: ContainerWriter>(
    codec: &mut C,
    timeline: &mut StreamTimeline,
    muxer: &mut Muxer<W>,
) -> Result<()> {
    codec.send_frame(None)?;
    if drain_codec(codec, timeline, muxer)? {
        Ok(())
    } else {
        Err(RecorderError::encoder(
            timeline.kind,
            "flush",
            "codec asked for input after end of stream",
        ))
    }
}

/// Raw buffers handed to producers between prepare and finish
#[derive(Debug, Default)]
pub struct WorkingBuffers {
    video: Vec<u8>,
    video_stride: usize,
    video_width: u32,
    video_height: u32,
    audio: Vec<f32>,
    audio_len: usize,
    audio_channels: usize,
}

impl WorkingBuffers {
    /// Size the video buffer for a frame; returns the row stride
    pub fn prepare_video(&mut self, width: u32, height: u32) -> usize {
        let row = width as usize * 4;
        let stride = row.div_ceil(STRIDE_ALIGN) * STRIDE_ALIGN;
        self.video.resize(stride * height as usize, 0);
        self.video_stride = stride;
        self.video_width = width;
        self.video_height = height;
        stride
    }

    pub fn video_mut(&mut self) -> &mut [u8] {
        &mut self.video
    }

    pub fn video(&self) -> (&[u8], u32, u32, usize) {
        (
            &self.video,
            self.video_width,
            self.video_height,
            self.video_stride,
        )
    }

    /// Size the audio buffer, doubling past the requirement when it must grow
    pub fn prepare_audio(&mut self, channels: usize, samples: usize) {
        let needed = channels * samples;
        if self.audio.len() < needed {
            self.audio.resize(needed * 2, 0.0);
        }
        self.audio_len = needed;
        self.audio_channels = channels;
    }

    pub fn audio_mut(&mut self) -> &mut [f32] {
        &mut self.audio[..self.audio_len]
    }

    pub fn audio(&self) -> (&[f32], usize) {
        (&self.audio[..self.audio_len], self.audio_channels)
    }

    pub fn audio_capacity(&self) -> usize {
        self.audio.len()
    }

    /// Tightly packed copy of the current video frame
    #[cfg(test)]
    pub fn packed_video(&self) -> Vec<u8> {
        let row = self.video_width as usize * 4;
        self.video
            .chunks(self.video_stride.max(1))
            .take(self.video_height as usize)
            .flat_map(|r| r[..row].iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::null::{MemoryContainer, PassthroughCodec};

    fn muxer() -> (Muxer<MemoryContainer>, crate::encoder::null::ContainerLog) {
        let (container, log) = MemoryContainer::new();
        (Muxer::new(container), log)
    }

    #[test]
    fn test_frame_period_reflects_speed() {
        assert_eq!(frame_period(60, 1.0), Rational::new(1, 60));
        assert_eq!(frame_period(30, 0.5), Rational::new(1, 60));
        assert_eq!(frame_period(60, 2.0), Rational::new(1, 30));
    }

    #[test]
    fn test_video_pts_strictly_increase_and_holds_leave_gaps() {
        let (mut mux, log) = muxer();
        let mut video = VideoStream::new(PassthroughCodec::new(0), 60, 1.0);
        video.register(&mut mux).unwrap();
        mux.write_header().unwrap();

        let raw = vec![0u8; 2 * 2 * 4];
        video.submit(&raw, 2, 2, 8, &mut mux).unwrap();
        video.submit(&raw, 2, 2, 8, &mut mux).unwrap();
        video.hold();
        video.submit(&raw, 2, 2, 8, &mut mux).unwrap();
        video.flush(&mut mux).unwrap();
        mux.finish().unwrap();

        let pts: Vec<i64> = log.packets(StreamKind::Video).iter().map(|p| p.pts).collect();
        assert_eq!(pts, vec![0, 1_500, 4_500]);
        assert_eq!(video.frames(), 3);
        assert_eq!(video.held(), 1);
    }

    #[test]
    fn test_speed_stretches_durations() {
        let (mut mux, log) = muxer();
        let mut video = VideoStream::new(PassthroughCodec::new(0), 60, 2.0);
        video.register(&mut mux).unwrap();
        mux.write_header().unwrap();
        let raw = vec![0u8; 16];
        for _ in 0..3 {
            video.submit(&raw, 2, 2, 8, &mut mux).unwrap();
        }
        video.flush(&mut mux).unwrap();
        mux.finish().unwrap();

        let packets = log.packets(StreamKind::Video);
        // speed 2.0 at 60 fps gives each frame 1/30 s
        assert_eq!(packets.iter().map(|p| p.pts).collect::<Vec<_>>(), vec![0, 3_000, 6_000]);
        assert!(packets.iter().all(|p| p.duration == 3_000));
    }

    /// Passthrough codec that records every size it is told about
    struct SizeRecorder {
        inner: PassthroughCodec,
        sizes: Vec<(u32, u32)>,
    }

    impl Codec for SizeRecorder {
        fn time_base(&self) -> Rational {
            self.inner.time_base()
        }

        fn set_input_size(&mut self, width: u32, height: u32) -> Result<()> {
            self.sizes.push((width, height));
            Ok(())
        }

        fn send_frame(&mut self, frame: Option<&NativeFrame>) -> Result<()> {
            self.inner.send_frame(frame)
        }

        fn receive_packet(&mut self) -> Result<crate::encoder::packet::CodecPoll> {
            self.inner.receive_packet()
        }
    }

    #[test]
    fn test_size_change_reconfigures_codec() {
        let (mut mux, log) = muxer();
        let codec = SizeRecorder {
            inner: PassthroughCodec::new(0),
            sizes: Vec::new(),
        };
        let mut video = VideoStream::new(codec, 30, 1.0);
        video.register(&mut mux).unwrap();
        mux.write_header().unwrap();
        video.submit(&vec![1u8; 4 * 4 * 4], 4, 4, 16, &mut mux).unwrap();
        video.submit(&vec![2u8; 4 * 4 * 4], 4, 4, 16, &mut mux).unwrap();
        video.submit(&vec![3u8; 8 * 8 * 4], 8, 8, 32, &mut mux).unwrap();
        video.flush(&mut mux).unwrap();
        mux.finish().unwrap();

        assert_eq!(video.codec.sizes, vec![(4, 4), (8, 8)]);
        let lens: Vec<usize> = log
            .packets(StreamKind::Video)
            .iter()
            .map(|p| p.data.len())
            .collect();
        assert_eq!(lens, vec![64, 64, 256]);
    }

    #[test]
    fn test_padded_rows_reach_codec_packed() {
        let (mut mux, log) = muxer();
        let mut video = VideoStream::new(PassthroughCodec::new(0), 60, 1.0);
        video.register(&mut mux).unwrap();
        mux.write_header().unwrap();

        let mut buffers = WorkingBuffers::default();
        let stride = buffers.prepare_video(3, 2);
        assert!(stride > 12);
        for (y, row) in buffers.video_mut().chunks_mut(stride).enumerate() {
            row[..12].fill(y as u8 + 1);
            row[12..].fill(0xFF);
        }
        let (raw, width, height, stride) = buffers.video();
        video.submit(raw, width, height, stride, &mut mux).unwrap();
        video.flush(&mut mux).unwrap();
        mux.finish().unwrap();

        let data = &log.packets(StreamKind::Video)[0].data;
        assert_eq!(data.len(), 24);
        assert!(data[..12].iter().all(|b| *b == 1));
        assert!(data[12..].iter().all(|b| *b == 2));
    }

    #[test]
    fn test_audio_surround_input_keeps_front_pair() {
        let (mut mux, log) = muxer();
        let mut audio = AudioStream::new(PassthroughCodec::new(0), 48_000, 2, 4, SampleFormat::F32Le);
        audio.register(&mut mux).unwrap();
        mux.write_header().unwrap();

        // 4 samples of 6 channels; channel c carries value c
        let input: Vec<f32> = (0..4).flat_map(|_| (0..6).map(|c| c as f32)).collect();
        audio.submit(&input, 6, &mut mux).unwrap();
        audio.flush(&mut mux).unwrap();
        mux.finish().unwrap();

        let packets = log.packets(StreamKind::Audio);
        assert_eq!(packets.len(), 1);
        let samples: Vec<f32> = packets[0]
            .data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(samples, vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_audio_mono_input_leaves_right_silent() {
        let (mut mux, log) = muxer();
        let mut audio = AudioStream::new(PassthroughCodec::new(0), 48_000, 2, 2, SampleFormat::F32Le);
        audio.register(&mut mux).unwrap();
        mux.write_header().unwrap();
        audio.submit(&[0.5, 0.25], 1, &mut mux).unwrap();
        audio.flush(&mut mux).unwrap();
        mux.finish().unwrap();

        let data = &log.packets(StreamKind::Audio)[0].data;
        let right = f32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        assert_eq!(right, 0.0);
    }

    #[test]
    fn test_audio_pts_follow_emitted_samples() {
        let (mut mux, log) = muxer();
        let mut audio =
            AudioStream::new(PassthroughCodec::new(2), 48_000, 2, 1024, SampleFormat::F32Le);
        audio.register(&mut mux).unwrap();
        mux.write_header().unwrap();

        // Irregular batches: 700 + 900 + 1500 = 3100 samples
        for n in [700usize, 900, 1500] {
            audio.submit(&vec![0.1; n * 2], 2, &mut mux).unwrap();
        }
        assert_eq!(audio.cursor(), 3100 - 3 * 1024);
        audio.flush(&mut mux).unwrap();
        mux.finish().unwrap();

        let packets = log.packets(StreamKind::Audio);
        let pts: Vec<i64> = packets.iter().map(|p| p.pts).collect();
        assert_eq!(pts, vec![0, 1024, 2048, 3072]);
        assert_eq!(packets.last().unwrap().duration, 28);
        assert_eq!(audio.samples_emitted(), 3100);
    }

    #[test]
    fn test_working_audio_buffer_grows_to_double() {
        let mut buffers = WorkingBuffers::default();
        buffers.prepare_audio(2, 100);
        assert_eq!(buffers.audio_mut().len(), 200);
        assert_eq!(buffers.audio_capacity(), 400);

        // Smaller request reuses the buffer
        buffers.prepare_audio(2, 50);
        assert_eq!(buffers.audio_mut().len(), 100);
        assert_eq!(buffers.audio_capacity(), 400);
    }

    #[test]
    fn test_video_stride_is_aligned() {
        let mut buffers = WorkingBuffers::default();
        assert_eq!(buffers.prepare_video(3, 2), 64);
        assert_eq!(buffers.video_mut().len(), 128);
        assert_eq!(buffers.prepare_video(20, 1), 128);
    }
}
