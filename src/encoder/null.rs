//! No-op backend
//!
//! Runs the full stream assembly and packet-write loop, but the "codec" copies
//! native frames through unchanged and the "container" either keeps packets in
//! memory (tests) or only counts them (sessions). Nothing is written to disk.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::encoder::packet::{Codec, CodecPoll, ContainerWriter, NativeFrame, Packet, Rational};
use crate::utils::{RecorderError, Result, StreamKind};

/// Codec time base: microseconds, so every packet gets rescaled on its way out
const PASSTHROUGH_TIME_BASE: Rational = Rational::new(1, 1_000_000);

/// Emits each frame as a packet, `latency` frames late
#[derive(Debug)]
pub struct PassthroughCodec {
    latency: usize,
    queue: VecDeque<Packet>,
    draining: bool,
}

impl PassthroughCodec {
    pub fn new(latency: usize) -> Self {
        Self {
            latency,
            queue: VecDeque::new(),
            draining: false,
        }
    }
}

impl Codec for PassthroughCodec {
    fn time_base(&self) -> Rational {
        PASSTHROUGH_TIME_BASE
    }

    fn send_frame(&mut self, frame: Option<&NativeFrame>) -> Result<()> {
        match frame {
            Some(frame) => {
                self.queue.push_back(Packet {
                    data: frame.data.clone(),
                    pts: frame.pts,
                    dts: frame.pts,
                    duration: frame.duration,
                    keyframe: true,
                    stream_index: 0,
                });
            }
            None => self.draining = true,
        }
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<CodecPoll> {
        if self.draining {
            return Ok(match self.queue.pop_front() {
                Some(p) => CodecPoll::Packet(p),
                None => CodecPoll::EndOfStream,
            });
        }
        if self.queue.len() > self.latency {
            if let Some(p) = self.queue.pop_front() {
                return Ok(CodecPoll::Packet(p));
            }
        }
        Ok(CodecPoll::NeedInput)
    }
}

#[derive(Debug, Default)]
struct LogInner {
    streams: Vec<(StreamKind, Rational)>,
    packets: Vec<Packet>,
    /// Packets and payload bytes per stream index, kept or not
    counts: Vec<(u64, u64)>,
    header_written: bool,
    trailer_written: bool,
}

/// Shared view of what a [`MemoryContainer`] received
#[derive(Debug, Clone, Default)]
pub struct ContainerLog {
    inner: Arc<Mutex<LogInner>>,
}

impl ContainerLog {
    /// Packets of one stream, in write order
    pub fn packets(&self, kind: StreamKind) -> Vec<Packet> {
        let inner = self.inner.lock();
        inner
            .packets
            .iter()
            .filter(|p| inner.streams.get(p.stream_index).map(|s| s.0) == Some(kind))
            .cloned()
            .collect()
    }

    /// Every packet across streams, in write order
    pub fn all_packets(&self) -> Vec<Packet> {
        self.inner.lock().packets.clone()
    }

    /// Packets written to one stream, including those not retained
    pub fn packet_count(&self, kind: StreamKind) -> u64 {
        let inner = self.inner.lock();
        inner
            .streams
            .iter()
            .zip(&inner.counts)
            .filter(|(s, _)| s.0 == kind)
            .map(|(_, c)| c.0)
            .sum()
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.lock().counts.iter().map(|c| c.1).sum()
    }

    pub fn time_base(&self, kind: StreamKind) -> Option<Rational> {
        self.inner
            .lock()
            .streams
            .iter()
            .find(|s| s.0 == kind)
            .map(|s| s.1)
    }

    pub fn header_written(&self) -> bool {
        self.inner.lock().header_written
    }

    pub fn trailer_written(&self) -> bool {
        self.inner.lock().trailer_written
    }
}

/// Container writer that reports into a [`ContainerLog`]
#[derive(Debug)]
pub struct MemoryContainer {
    log: ContainerLog,
    retain: bool,
}

impl MemoryContainer {
    /// Keep every packet for inspection
    pub fn new() -> (Self, ContainerLog) {
        let log = ContainerLog::default();
        (
            Self {
                log: log.clone(),
                retain: true,
            },
            log,
        )
    }

    /// Count packets and drop their payloads, so memory stays flat however
    /// long the session runs
    pub fn counting() -> (Self, ContainerLog) {
        let log = ContainerLog::default();
        (
            Self {
                log: log.clone(),
                retain: false,
            },
            log,
        )
    }
}

impl ContainerWriter for MemoryContainer {
    fn add_stream(&mut self, kind: StreamKind, time_base: Rational) -> Result<usize> {
        let mut inner = self.log.inner.lock();
        if inner.header_written {
            return Err(RecorderError::encoder(
                kind,
                "add_stream",
                "streams must be added before the header",
            ));
        }
        inner.streams.push((kind, time_base));
        inner.counts.push((0, 0));
        Ok(inner.streams.len() - 1)
    }

    fn write_header(&mut self) -> Result<()> {
        self.log.inner.lock().header_written = true;
        Ok(())
    }

    fn write_packet(&mut self, packet: Packet) -> Result<()> {
        let mut inner = self.log.inner.lock();
        let kind = inner
            .streams
            .get(packet.stream_index)
            .map(|s| s.0)
            .unwrap_or(StreamKind::Video);
        if !inner.header_written || inner.trailer_written {
            return Err(RecorderError::encoder(
                kind,
                "write_packet",
                "container is not accepting packets",
            ));
        }
        if let Some(count) = inner.counts.get_mut(packet.stream_index) {
            count.0 += 1;
            count.1 += packet.data.len() as u64;
        }
        if self.retain {
            inner.packets.push(packet);
        }
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<()> {
        self.log.inner.lock().trailer_written = true;
        Ok(())
    }
}
