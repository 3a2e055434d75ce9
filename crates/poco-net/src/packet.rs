//! Wire packet format and segmentation.
//!
//! A packet is one header byte followed by raw body bytes. Two header
//! bits describe segmentation: `NO_SEGMENT` marks a payload that fits a
//! single packet, `MORE_SEGMENT` marks a non-final segment. A packet
//! carrying neither bit is the final segment of a multi-packet payload.

use bytes::{Bytes, BytesMut};

use crate::error::PocoNetError;

/// Size of the packet header in bytes.
pub const PACKET_HEADER_LEN: usize = 1;

/// Packet size limit on the relay link.
pub const RELAY_MTU: usize = 32 * 1024 * 1024;

/// Packet size limit on a direct connection's data channel.
pub const DIRECT_CHANNEL_MTU: usize = 64 * 1024;

const NO_SEGMENT: u8 = 1 << 0;
const MORE_SEGMENT: u8 = 1 << 1;

// ── Builder ──────────────────────────────────────────────────────────

/// Mutable packet under construction; [`build`](Self::build) freezes it.
#[derive(Debug, Default)]
pub struct PacketBuilder {
    header: u8,
    body: BytesMut,
}

impl PacketBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_no_segment(mut self) -> Self {
        self.header |= NO_SEGMENT;
        self
    }

    pub fn clear_no_segment(mut self) -> Self {
        self.header &= !NO_SEGMENT;
        self
    }

    pub fn with_more_segment(mut self) -> Self {
        self.header |= MORE_SEGMENT;
        self
    }

    pub fn clear_more_segment(mut self) -> Self {
        self.header &= !MORE_SEGMENT;
        self
    }

    pub fn append_body(mut self, chunk: &[u8]) -> Self {
        self.body.extend_from_slice(chunk);
        self
    }

    /// Freeze into an immutable [`Packet`].
    pub fn build(self) -> Packet {
        let mut bytes = BytesMut::with_capacity(PACKET_HEADER_LEN + self.body.len());
        bytes.extend_from_slice(&[self.header]);
        bytes.extend_from_slice(&self.body);
        Packet { bytes: bytes.freeze() }
    }
}

// ── Packet ───────────────────────────────────────────────────────────

/// Immutable wire packet: `[header][body...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    bytes: Bytes,
}

impl Packet {
    /// Decode a packet from its wire form. The header byte is mandatory.
    pub fn from_bytes(bytes: Bytes) -> Result<Self, PocoNetError> {
        if bytes.len() < PACKET_HEADER_LEN {
            return Err(PocoNetError::protocol("packet shorter than its header"));
        }
        Ok(Self { bytes })
    }

    pub fn no_segment(&self) -> bool {
        self.bytes[0] & NO_SEGMENT != 0
    }

    pub fn more_segment(&self) -> bool {
        self.bytes[0] & MORE_SEGMENT != 0
    }

    /// Whether this packet completes a payload.
    pub fn is_terminal(&self) -> bool {
        self.no_segment() || !self.more_segment()
    }

    pub fn body(&self) -> &[u8] {
        &self.bytes[PACKET_HEADER_LEN..]
    }

    /// Total size on the wire, header included.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body().is_empty()
    }

    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }
}

// ── Segmentation ─────────────────────────────────────────────────────

/// Split `payload` into packets no larger than `max_packet_size`.
///
/// A payload that fits one packet (the limit minus the header) becomes a
/// single `NO_SEGMENT` packet, zero-length payloads included. Larger
/// payloads become a run of full segments flagged `MORE_SEGMENT` with an
/// unflagged final segment.
pub fn to_packets(payload: &[u8], max_packet_size: usize) -> Result<Vec<Packet>, PocoNetError> {
    if max_packet_size < PACKET_HEADER_LEN + 1 {
        return Err(PocoNetError::protocol(format!(
            "max packet size {max_packet_size} leaves no room for a body"
        )));
    }
    let chunk = max_packet_size - PACKET_HEADER_LEN;
    if payload.len() <= chunk {
        return Ok(vec![PacketBuilder::new()
            .with_no_segment()
            .append_body(payload)
            .build()]);
    }
    let mut packets = Vec::with_capacity(payload.len().div_ceil(chunk));
    let mut parts = payload.chunks(chunk).peekable();
    while let Some(part) = parts.next() {
        let mut builder = PacketBuilder::new().append_body(part);
        if parts.peek().is_some() {
            builder = builder.with_more_segment();
        }
        packets.push(builder.build());
    }
    Ok(packets)
}

/// Reassembles one ordered packet stream back into payloads.
///
/// Bodies accumulate until a terminal packet flushes them; the flush
/// hands the payload out exactly once and resets the buffer for the
/// next message. Ordering and exactly-once delivery of the packets are
/// the transport's contract, not checked here.
#[derive(Debug, Default)]
pub struct SegmentBuffer {
    buf: BytesMut,
}

impl SegmentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb `packet`; returns the completed payload on a terminal packet.
    pub fn push(&mut self, packet: &Packet) -> Option<Bytes> {
        self.buf.extend_from_slice(packet.body());
        if packet.is_terminal() {
            Some(self.buf.split().freeze())
        } else {
            None
        }
    }

    /// Bytes accumulated for the in-progress payload.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
