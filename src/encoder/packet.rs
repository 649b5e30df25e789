//! Encoded packets, time bases and the packet-write loop
//!
//! Codecs and container writers are both traits so the same stream assembly
//! drives GStreamer elements and the in-memory test backend.

use std::collections::VecDeque;

use crate::utils::{RecorderError, Result, StreamKind};

/// A time base, in seconds per tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// Reduce to lowest terms
    pub fn reduced(self) -> Self {
        let g = gcd(self.num.unsigned_abs(), self.den.unsigned_abs()).max(1) as i64;
        Self {
            num: self.num / g,
            den: self.den / g,
        }
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Convert `value` ticks of `from` into ticks of `to`, rounding half away from zero
pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    let n = value as i128 * from.num as i128 * to.den as i128;
    let d = from.den as i128 * to.num as i128;
    if d == 0 {
        return 0;
    }
    let (n, d) = if d < 0 { (-n, -d) } else { (n, d) };
    let half = d / 2;
    let q = if n >= 0 { (n + half) / d } else { (n - half) / d };
    q as i64
}

/// Compare two timestamps in different time bases
fn time_cmp(a: i64, a_tb: Rational, b: i64, b_tb: Rational) -> std::cmp::Ordering {
    let lhs = a as i128 * a_tb.num as i128 * b_tb.den as i128;
    let rhs = b as i128 * b_tb.num as i128 * a_tb.den as i128;
    lhs.cmp(&rhs)
}

/// One unit of encoded bitstream
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub keyframe: bool,
    pub stream_index: usize,
}

/// A frame in the layout the codec consumes
#[derive(Debug, Clone, Default)]
pub struct NativeFrame {
    pub data: Vec<u8>,
    /// Presentation time in the codec's time base
    pub pts: i64,
    pub duration: i64,
    /// Samples per channel (audio only)
    pub samples: usize,
}

/// Result of asking a codec for output
#[derive(Debug)]
pub enum CodecPoll {
    Packet(Packet),
    /// Nothing more until another frame is sent
    NeedInput,
    /// Fully drained after the end-of-stream sentinel
    EndOfStream,
}

/// An encoder context for one stream
pub trait Codec: Send {
    fn time_base(&self) -> Rational;

    /// Announce the size of the raw video frames that follow. Called before
    /// the first frame and again whenever the size changes.
    fn set_input_size(&mut self, _width: u32, _height: u32) -> Result<()> {
        Ok(())
    }

    /// Submit a frame, or `None` to signal that no more frames follow.
    ///
    /// After `None`, `receive_packet` must never report `NeedInput`.
    fn send_frame(&mut self, frame: Option<&NativeFrame>) -> Result<()>;

    fn receive_packet(&mut self) -> Result<CodecPoll>;
}

/// A media container being written
pub trait ContainerWriter: Send {
    /// Declare a stream; returns its index
    fn add_stream(&mut self, kind: StreamKind, time_base: Rational) -> Result<usize>;
    fn write_header(&mut self) -> Result<()>;
    /// Packets arrive interleaved, with timestamps in the stream's time base
    fn write_packet(&mut self, packet: Packet) -> Result<()>;
    fn write_trailer(&mut self) -> Result<()>;
}

/// Per-stream bookkeeping for packets leaving a codec
#[derive(Debug)]
pub struct StreamTimeline {
    pub kind: StreamKind,
    pub index: usize,
    pub time_base: Rational,
    last_pts: Option<i64>,
    pub packets_written: u64,
    pub bytes_written: u64,
    pub packets_dropped: u64,
}

impl StreamTimeline {
    pub fn new(kind: StreamKind, index: usize, time_base: Rational) -> Self {
        Self {
            kind,
            index,
            time_base,
            last_pts: None,
            packets_written: 0,
            bytes_written: 0,
            packets_dropped: 0,
        }
    }

    /// Move a packet from codec time into stream time and tag it
    fn stamp(&mut self, packet: &mut Packet, codec_tb: Rational) -> Result<()> {
        let pts = rescale(packet.pts, codec_tb, self.time_base);
        if let Some(previous) = self.last_pts {
            if pts <= previous {
                return Err(RecorderError::NonMonotonicTimestamp {
                    stream: self.kind,
                    pts,
                    previous,
                });
            }
        }
        packet.pts = pts;
        packet.dts = rescale(packet.dts, codec_tb, self.time_base);
        packet.duration = rescale(packet.duration, codec_tb, self.time_base);
        packet.stream_index = self.index;
        self.last_pts = Some(pts);
        Ok(())
    }

    pub fn last_pts(&self) -> Option<i64> {
        self.last_pts
    }
}

/// Orders packets across streams by presentation time before they reach the
/// container.
#[derive(Debug)]
pub struct Interleaver {
    queues: Vec<(Rational, VecDeque<Packet>)>,
    max_depth: usize,
    queued: usize,
}

impl Interleaver {
    pub fn new(max_depth: usize) -> Self {
        Self {
            queues: Vec::new(),
            max_depth: max_depth.max(1),
            queued: 0,
        }
    }

    pub fn add_stream(&mut self, time_base: Rational) {
        self.queues.push((time_base, VecDeque::new()));
    }

    pub fn push(&mut self, packet: Packet) {
        if let Some((_, queue)) = self.queues.get_mut(packet.stream_index) {
            queue.push_back(packet);
            self.queued += 1;
        }
    }

    /// Next packet that can be written without breaking time order.
    ///
    /// A packet is released once every stream has something queued (so
    /// nothing earlier can still arrive), or when the queue is too deep.
    pub fn pop_ready(&mut self) -> Option<Packet> {
        let all_ready = self.queues.iter().all(|(_, q)| !q.is_empty());
        if all_ready || self.queued > self.max_depth {
            self.pop_earliest()
        } else {
            None
        }
    }

    /// Release everything, earliest first
    pub fn drain(&mut self) -> Vec<Packet> {
        let mut out = Vec::with_capacity(self.queued);
        while let Some(p) = self.pop_earliest() {
            out.push(p);
        }
        out
    }

    fn pop_earliest(&mut self) -> Option<Packet> {
        let mut best: Option<usize> = None;
        for (i, (tb, queue)) in self.queues.iter().enumerate() {
            let Some(head) = queue.front() else { continue };
            best = match best {
                Some(b) => {
                    let (btb, bq) = &self.queues[b];
                    let bhead = &bq[0];
                    if time_cmp(head.pts, *tb, bhead.pts, *btb).is_lt() {
                        Some(i)
                    } else {
                        Some(b)
                    }
                }
                None => Some(i),
            };
        }
        let packet = self.queues[best?].1.pop_front();
        if packet.is_some() {
            self.queued -= 1;
        }
        packet
    }

    pub fn queued(&self) -> usize {
        self.queued
    }
}

/// Container writer plus the interleaving in front of it
pub struct Muxer<W: ContainerWriter> {
    writer: W,
    interleaver: Interleaver,
    header_written: bool,
    trailer_written: bool,
}

impl<W: ContainerWriter> Muxer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            interleaver: Interleaver::new(256),
            header_written: false,
            trailer_written: false,
        }
    }

    pub fn add_stream(&mut self, kind: StreamKind, time_base: Rational) -> Result<usize> {
        let index = self.writer.add_stream(kind, time_base)?;
        self.interleaver.add_stream(time_base);
        Ok(index)
    }

    pub fn write_header(&mut self) -> Result<()> {
        self.writer.write_header()?;
        self.header_written = true;
        Ok(())
    }

    /// Queue a stamped packet and write whatever is now in order
    pub fn write(&mut self, packet: Packet) -> Result<()> {
        self.interleaver.push(packet);
        while let Some(p) = self.interleaver.pop_ready() {
            self.writer.write_packet(p)?;
        }
        Ok(())
    }

    /// Flush queued packets and write the trailer
    pub fn finish(&mut self) -> Result<()> {
        if self.trailer_written || !self.header_written {
            return Ok(());
        }
        for p in self.interleaver.drain() {
            self.writer.write_packet(p)?;
        }
        self.trailer_written = true;
        self.writer.write_trailer()
    }
}

/// Pull every packet the codec has ready and hand them to the muxer.
///
/// Returns true once the codec reports end of stream. A packet whose
/// timestamp does not advance is dropped and logged; it never reaches the
/// container.
pub fn drain_codec<C: Codec, W: ContainerWriter>(
    codec: &mut C,
    timeline: &mut StreamTimeline,
    muxer: &mut Muxer<W>,
) -> Result<bool> {
    let codec_tb = codec.time_base();
    loop {
        match codec.receive_packet()? {
            CodecPoll::NeedInput => return Ok(false),
            CodecPoll::EndOfStream => return Ok(true),
            CodecPoll::Packet(mut packet) => {
                if let Err(e) = timeline.stamp(&mut packet, codec_tb) {
                    tracing::warn!("Dropping {} packet: {}", timeline.kind, e);
                    timeline.packets_dropped += 1;
                    continue;
                }
                let len = packet.data.len() as u64;
                muxer.write(packet)?;
                timeline.packets_written += 1;
                timeline.bytes_written += len;
            }
        }
    }
}
