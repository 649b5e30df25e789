//! In-process encoding through GStreamer
//!
//! Each codec is its own small pipeline. Video runs `appsrc ! videoconvert !
//! videoscale ! capsfilter ! encoder ! parser ! appsink`, taking packed RGBA
//! at capture size; audio runs `appsrc ! audioconvert ! encoder ! parser !
//! appsink`. Encoded packets come back to the stream assembler and go through
//! the same timestamp checks and interleaving as every other backend.
//! The container is a second pipeline, `appsrc ! queue ! mux ! filesink`,
//! with one source per stream.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::{AudioCodec, ContainerFormat, VideoCodec};
use crate::encoder::convert::SampleFormat;
use crate::encoder::muxed::MuxedEncoder;
use crate::encoder::packet::{
    rescale, Codec, CodecPoll, ContainerWriter, NativeFrame, Packet, Rational,
};
use crate::encoder::stream::frame_period;
use crate::encoder::EncoderSettings;
use crate::utils::{RecorderError, Result, StreamKind};

/// GStreamer clock time is in nanoseconds
const NANOSECONDS: Rational = Rational::new(1, 1_000_000_000);

/// How long a codec gets to emit its tail after end of stream
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the muxer gets to finalize the file
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(10);

static GSTREAMER_INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Initialize GStreamer once per process
fn init_gstreamer() -> Result<()> {
    GSTREAMER_INIT
        .get_or_init(|| match gst::init() {
            Ok(()) => {
                tracing::info!("GStreamer initialized: {}", gst::version_string());
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to initialize GStreamer: {}", e);
                Err(e.to_string())
            }
        })
        .clone()
        .map_err(|e| RecorderError::encoder(StreamKind::Video, "open", e))
}

/// Build the embedded encoder for a session
pub fn open(
    settings: &EncoderSettings,
    path: &Path,
) -> Result<MuxedEncoder<GstCodec, GstCodec, GstContainer>> {
    init_gstreamer()?;

    let video = GstCodec::video(settings)?;
    let audio = GstCodec::audio(settings)?;
    let container = GstContainer::new(
        settings.container,
        path,
        vec![
            (StreamKind::Video, video.output_caps()),
            (StreamKind::Audio, audio.output_caps()),
        ],
    )?;

    MuxedEncoder::new(
        settings,
        video,
        audio,
        settings.audio_codec.frame_size(),
        SampleFormat::F32Le,
        container,
    )
}

fn make_element(kind: StreamKind, factory: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory).build().map_err(|e| {
        RecorderError::encoder(kind, "open", format!("failed to create {}: {}", factory, e))
    })
}

/// Set a property from its string form, logging rather than failing if the
/// element does not have it
fn set_property(element: &gst::Element, name: &str, value: &str) {
    if let Err(e) = element.try_set_property_from_str(name, value) {
        tracing::warn!(
            "Could not set {}={} on {}: {}",
            name,
            value,
            element.name(),
            e
        );
    }
}

fn video_parser(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::H264 => "h264parse",
        VideoCodec::Vp9 => "vp9parse",
        VideoCodec::Av1 => "av1parse",
    }
}

fn audio_parser(codec: AudioCodec) -> &'static str {
    match codec {
        AudioCodec::Aac => "aacparse",
        AudioCodec::Opus => "opusparse",
    }
}

fn configure_video_encoder(encoder: &gst::Element, settings: &EncoderSettings) {
    let kbps = (settings.video_bitrate / 1000).max(1).to_string();
    let key_int = (settings.fps * 2).to_string();
    match settings.video_codec {
        VideoCodec::H264 => {
            // No reordering, so packet pts leave the encoder in order
            set_property(encoder, "bframes", "0");
            set_property(encoder, "bitrate", &kbps);
            set_property(encoder, "speed-preset", "veryfast");
            set_property(encoder, "key-int-max", &key_int);
        }
        VideoCodec::Vp9 => {
            set_property(encoder, "target-bitrate", &settings.video_bitrate.to_string());
            set_property(encoder, "deadline", "1");
            set_property(encoder, "keyframe-max-dist", &key_int);
        }
        VideoCodec::Av1 => {
            set_property(encoder, "target-bitrate", &kbps);
            set_property(encoder, "keyframe-max-dist", &key_int);
        }
    }
}

/// One stream's encoder, driven frame by frame
pub struct GstCodec {
    kind: StreamKind,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    /// Caps of the encoded stream, known once the first sample comes out
    output_caps: Arc<Mutex<Option<gst::Caps>>>,
    /// Raw input rate and size (video only)
    framerate: Option<gst::Fraction>,
    input_size: Option<(u32, u32)>,
    eos_sent: bool,
}

/// Raw RGBA caps for frames of the given size
fn rgba_caps(width: u32, height: u32, framerate: gst::Fraction) -> gst::Caps {
    gst::Caps::builder("video/x-raw")
        .field("format", "RGBA")
        .field("width", width as i32)
        .field("height", height as i32)
        .field("framerate", framerate)
        .build()
}

/// Turn the first error posted on `bus` into a fatal pipeline error
fn bus_failure(bus: &gst::Bus, kind: StreamKind) -> Option<RecorderError> {
    while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
        if let gst::MessageView::Error(err) = msg.view() {
            let message = match err.debug() {
                Some(debug) => format!("{} ({})", err.error(), debug),
                None => err.error().to_string(),
            };
            return Some(RecorderError::Pipeline {
                stream: kind,
                message,
            });
        }
    }
    None
}

impl GstCodec {
    /// RGBA at capture size in, compressed video at the output size out
    pub fn video(settings: &EncoderSettings) -> Result<Self> {
        let kind = StreamKind::Video;
        let period = frame_period(settings.fps, settings.speed);
        let framerate = gst::Fraction::new(period.den as i32, period.num as i32);
        let caps = rgba_caps(settings.width, settings.height, framerate);

        let convert = make_element(kind, "videoconvert")?;
        let scale = make_element(kind, "videoscale")?;
        let scaled_caps = gst::Caps::builder("video/x-raw")
            .field("format", "I420")
            .field("width", settings.output_width as i32)
            .field("height", settings.output_height as i32)
            .build();
        let capsfilter = gst::ElementFactory::make("capsfilter")
            .property("caps", &scaled_caps)
            .build()
            .map_err(|e| {
                RecorderError::encoder(kind, "open", format!("failed to create capsfilter: {}", e))
            })?;

        let encoder = make_element(kind, settings.video_codec.gst_encoder())?;
        configure_video_encoder(&encoder, settings);

        let sink_caps = match settings.video_codec {
            VideoCodec::H264 => Some(
                gst::Caps::builder("video/x-h264")
                    .field("stream-format", "avc")
                    .field("alignment", "au")
                    .build(),
            ),
            _ => None,
        };

        let mut codec = Self::build(
            kind,
            caps,
            vec![convert, scale, capsfilter, encoder],
            video_parser(settings.video_codec),
            sink_caps,
        )?;
        codec.framerate = Some(framerate);
        codec.input_size = Some((settings.width, settings.height));
        Ok(codec)
    }

    /// Interleaved F32LE in, compressed audio out
    pub fn audio(settings: &EncoderSettings) -> Result<Self> {
        let kind = StreamKind::Audio;
        let caps = gst::Caps::builder("audio/x-raw")
            .field("format", "F32LE")
            .field("layout", "interleaved")
            .field("rate", settings.sample_rate as i32)
            .field("channels", settings.channels as i32)
            .build();

        let convert = make_element(kind, "audioconvert")?;
        let encoder = make_element(kind, settings.audio_codec.gst_encoder())?;
        set_property(&encoder, "bitrate", &settings.audio_bitrate.to_string());

        let sink_caps = match settings.audio_codec {
            AudioCodec::Aac => Some(
                gst::Caps::builder("audio/mpeg")
                    .field("mpegversion", 4i32)
                    .field("stream-format", "raw")
                    .build(),
            ),
            AudioCodec::Opus => None,
        };

        Self::build(
            kind,
            caps,
            vec![convert, encoder],
            audio_parser(settings.audio_codec),
            sink_caps,
        )
    }

    /// Link `appsrc ! chain... ! parser ! appsink` and start it
    fn build(
        kind: StreamKind,
        input_caps: gst::Caps,
        chain: Vec<gst::Element>,
        parser: &str,
        sink_caps: Option<gst::Caps>,
    ) -> Result<Self> {
        let pipeline = gst::Pipeline::new();

        let appsrc = gst_app::AppSrc::builder()
            .caps(&input_caps)
            .format(gst::Format::Time)
            .build();

        let mut sink = gst_app::AppSink::builder().sync(false);
        if let Some(caps) = &sink_caps {
            sink = sink.caps(caps);
        }
        let appsink = sink.build();
        let parse = make_element(kind, parser)?;

        let mut elements: Vec<&gst::Element> = vec![appsrc.upcast_ref()];
        elements.extend(chain.iter());
        elements.push(&parse);
        elements.push(appsink.upcast_ref());

        pipeline.add_many(elements.iter().copied()).map_err(|e| {
            RecorderError::encoder(kind, "open", format!("failed to add elements: {}", e))
        })?;
        gst::Element::link_many(elements.iter().copied()).map_err(|e| {
            RecorderError::encoder(kind, "open", format!("failed to link elements: {}", e))
        })?;

        pipeline.set_state(gst::State::Playing).map_err(|e| {
            RecorderError::encoder(kind, "open", format!("failed to start pipeline: {}", e))
        })?;

        tracing::debug!("{} codec pipeline started", kind);

        Ok(Self {
            kind,
            pipeline,
            appsrc,
            appsink,
            output_caps: Arc::new(Mutex::new(None)),
            framerate: None,
            input_size: None,
            eos_sent: false,
        })
    }

    fn output_caps(&self) -> Arc<Mutex<Option<gst::Caps>>> {
        self.output_caps.clone()
    }

    /// Surface an error the pipeline posted on its bus, if any
    fn bus_error(&self) -> Option<RecorderError> {
        bus_failure(&self.pipeline.bus()?, self.kind)
    }

    fn to_packet(&self, sample: gst::Sample) -> Result<Packet> {
        if let Some(caps) = sample.caps() {
            let mut stored = self.output_caps.lock();
            if stored.is_none() {
                tracing::debug!("{} codec output caps: {}", self.kind, caps);
                *stored = Some(caps.to_owned());
            }
        }

        let buffer = sample.buffer().ok_or_else(|| {
            RecorderError::encoder(self.kind, "receive_packet", "sample without a buffer")
        })?;
        let map = buffer.map_readable().map_err(|e| {
            RecorderError::encoder(self.kind, "receive_packet", format!("unmappable buffer: {}", e))
        })?;

        let pts = buffer
            .pts()
            .map(|t| t.nseconds() as i64)
            .ok_or_else(|| RecorderError::encoder(self.kind, "receive_packet", "packet has no pts"))?;
        let dts = buffer.dts().map(|t| t.nseconds() as i64).unwrap_or(pts);
        let duration = buffer.duration().map(|t| t.nseconds() as i64).unwrap_or(0);

        Ok(Packet {
            data: map.as_slice().to_vec(),
            pts,
            dts,
            duration,
            keyframe: !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
            stream_index: 0,
        })
    }
}

impl Codec for GstCodec {
    fn time_base(&self) -> Rational {
        NANOSECONDS
    }

    fn set_input_size(&mut self, width: u32, height: u32) -> Result<()> {
        let Some(framerate) = self.framerate else {
            return Ok(());
        };
        if self.input_size == Some((width, height)) {
            return Ok(());
        }
        tracing::info!("{} codec input renegotiated to {}x{}", self.kind, width, height);
        self.appsrc.set_caps(Some(&rgba_caps(width, height, framerate)));
        self.input_size = Some((width, height));
        Ok(())
    }

    fn send_frame(&mut self, frame: Option<&NativeFrame>) -> Result<()> {
        let Some(frame) = frame else {
            if !self.eos_sent {
                self.eos_sent = true;
                self.appsrc.end_of_stream().map_err(|e| {
                    RecorderError::encoder(self.kind, "send_frame", format!("EOS refused: {:?}", e))
                })?;
            }
            return Ok(());
        };

        let mut buffer = gst::Buffer::from_slice(frame.data.clone());
        if let Some(b) = buffer.get_mut() {
            b.set_pts(gst::ClockTime::from_nseconds(frame.pts.max(0) as u64));
            b.set_duration(gst::ClockTime::from_nseconds(frame.duration.max(0) as u64));
        }

        self.appsrc.push_buffer(buffer).map_err(|e| {
            self.bus_error().unwrap_or_else(|| {
                RecorderError::encoder(self.kind, "send_frame", format!("{:?}", e))
            })
        })?;
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<CodecPoll> {
        let timeout = if self.eos_sent {
            gst::ClockTime::from_mseconds(DRAIN_TIMEOUT.as_millis() as u64)
        } else {
            gst::ClockTime::ZERO
        };

        match self.appsink.try_pull_sample(timeout) {
            Some(sample) => Ok(CodecPoll::Packet(self.to_packet(sample)?)),
            None if self.appsink.is_eos() => Ok(CodecPoll::EndOfStream),
            None if self.eos_sent => Err(self.bus_error().unwrap_or_else(|| {
                RecorderError::encoder(self.kind, "flush", "timed out waiting for end of stream")
            })),
            None => match self.bus_error() {
                Some(e) => Err(e),
                None => Ok(CodecPoll::NeedInput),
            },
        }
    }
}

impl Drop for GstCodec {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

struct MuxInput {
    kind: StreamKind,
    time_base: Rational,
    appsrc: gst_app::AppSrc,
    caps: Arc<Mutex<Option<gst::Caps>>>,
    caps_set: bool,
}

/// Container file written by a GStreamer muxer
pub struct GstContainer {
    pipeline: gst::Pipeline,
    muxer: gst::Element,
    /// Caps sources for streams not yet added, in the order they will be
    pending_caps: Vec<(StreamKind, Arc<Mutex<Option<gst::Caps>>>)>,
    inputs: Vec<MuxInput>,
    path: PathBuf,
    started: bool,
}

impl GstContainer {
    /// `caps` pairs each stream kind with the caps its codec will report
    pub fn new(
        format: ContainerFormat,
        path: &Path,
        caps: Vec<(StreamKind, Arc<Mutex<Option<gst::Caps>>>)>,
    ) -> Result<Self> {
        let pipeline = gst::Pipeline::new();
        let muxer = make_element(StreamKind::Video, format.gst_muxer())?;
        if format != ContainerFormat::Mp4 {
            set_property(&muxer, "writing-app", env!("CARGO_PKG_NAME"));
        }
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", path.to_string_lossy().to_string())
            .property("async", false)
            .build()
            .map_err(|e| {
                RecorderError::encoder(StreamKind::Video, "open", format!("failed to create filesink: {}", e))
            })?;

        pipeline.add_many([&muxer, &filesink]).map_err(|e| {
            RecorderError::encoder(StreamKind::Video, "open", format!("failed to add muxer: {}", e))
        })?;
        muxer.link(&filesink).map_err(|e| {
            RecorderError::encoder(StreamKind::Video, "open", format!("failed to link muxer: {}", e))
        })?;

        Ok(Self {
            pipeline,
            muxer,
            pending_caps: caps,
            inputs: Vec::new(),
            path: path.to_path_buf(),
            started: false,
        })
    }

    fn input(&mut self, index: usize) -> Result<&mut MuxInput> {
        self.inputs.get_mut(index).ok_or_else(|| {
            RecorderError::encoder(
                StreamKind::Video,
                "write_packet",
                format!("no stream with index {}", index),
            )
        })
    }
}

impl ContainerWriter for GstContainer {
    fn add_stream(&mut self, kind: StreamKind, time_base: Rational) -> Result<usize> {
        if self.started {
            return Err(RecorderError::encoder(
                kind,
                "add_stream",
                "streams must be added before the header",
            ));
        }
        let position = self
            .pending_caps
            .iter()
            .position(|(k, _)| *k == kind)
            .ok_or_else(|| {
                RecorderError::encoder(kind, "add_stream", "no codec feeds this stream")
            })?;
        let (_, caps) = self.pending_caps.remove(position);

        let appsrc = gst_app::AppSrc::builder()
            .format(gst::Format::Time)
            .build();
        let queue = make_element(kind, "queue")?;

        self.pipeline
            .add_many([appsrc.upcast_ref(), &queue])
            .map_err(|e| RecorderError::encoder(kind, "add_stream", e.to_string()))?;
        appsrc
            .link(&queue)
            .map_err(|e| RecorderError::encoder(kind, "add_stream", e.to_string()))?;

        let template = match kind {
            StreamKind::Video => "video_%u",
            StreamKind::Audio => "audio_%u",
        };
        let mux_pad = self.muxer.request_pad_simple(template).ok_or_else(|| {
            RecorderError::encoder(kind, "add_stream", format!("muxer has no {} pad", template))
        })?;
        let queue_pad = queue.static_pad("src").ok_or_else(|| {
            RecorderError::encoder(kind, "add_stream", "queue has no src pad")
        })?;
        queue_pad
            .link(&mux_pad)
            .map_err(|e| RecorderError::encoder(kind, "add_stream", format!("{:?}", e)))?;

        self.inputs.push(MuxInput {
            kind,
            time_base,
            appsrc,
            caps,
            caps_set: false,
        });
        Ok(self.inputs.len() - 1)
    }

    fn write_header(&mut self) -> Result<()> {
        self.pipeline.set_state(gst::State::Playing).map_err(|e| {
            RecorderError::encoder(StreamKind::Video, "write_header", format!("failed to start muxer: {}", e))
        })?;
        self.started = true;
        tracing::info!("Writing container {:?}", self.path);
        Ok(())
    }

    fn write_packet(&mut self, packet: Packet) -> Result<()> {
        let input = self.input(packet.stream_index)?;
        let kind = input.kind;

        if !input.caps_set {
            let caps = input.caps.lock().clone().ok_or_else(|| {
                RecorderError::encoder(kind, "write_packet", "codec output caps are unknown")
            })?;
            input.appsrc.set_caps(Some(&caps));
            input.caps_set = true;
        }

        let to_ns = |v: i64| gst::ClockTime::from_nseconds(rescale(v, input.time_base, NANOSECONDS).max(0) as u64);
        let mut buffer = gst::Buffer::from_slice(packet.data);
        if let Some(b) = buffer.get_mut() {
            b.set_pts(to_ns(packet.pts));
            b.set_dts(to_ns(packet.dts));
            b.set_duration(to_ns(packet.duration));
            if !packet.keyframe {
                b.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }

        input
            .appsrc
            .push_buffer(buffer)
            .map_err(|e| RecorderError::encoder(kind, "write_packet", format!("{:?}", e)))?;
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<()> {
        for input in &self.inputs {
            if let Err(e) = input.appsrc.end_of_stream() {
                tracing::warn!("Failed to send EOS to {} mux input: {:?}", input.kind, e);
            }
        }

        let mut failure = None;
        match self.pipeline.bus() {
            Some(bus) => {
                let timeout = gst::ClockTime::from_mseconds(FINALIZE_TIMEOUT.as_millis() as u64);
                let mut finished = false;
                for msg in bus.iter_timed(timeout) {
                    match msg.view() {
                        gst::MessageView::Eos(..) => {
                            finished = true;
                            break;
                        }
                        gst::MessageView::Error(err) => {
                            failure = Some(format!("{} ({:?})", err.error(), err.debug()));
                            break;
                        }
                        _ => {}
                    }
                }
                if !finished && failure.is_none() {
                    failure = Some("timed out finalizing container".to_string());
                }
            }
            None => failure = Some("muxer pipeline has no bus".to_string()),
        }

        let _ = self.pipeline.set_state(gst::State::Null);
        self.started = false;

        match failure {
            Some(message) => Err(RecorderError::encoder(StreamKind::Video, "write_trailer", message)),
            None => {
                tracing::info!("Container finalized: {:?}", self.path);
                Ok(())
            }
        }
    }
}

impl Drop for GstContainer {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
