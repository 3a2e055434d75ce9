//! Logical wire frames.
//!
//! Every packet body is a MessagePack-encoded [`EventFrame`]: an event
//! name plus arbitrary JSON-compatible args. Events with protocol
//! meaning carry typed payload shapes, validated here at the reception
//! edge; a shape violation is a protocol error, never a panic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PocoNetError;
use crate::packet::{Packet, PacketBuilder};
use crate::Address;

/// Event names with protocol meaning.
pub mod events {
    // Reserved connection events, every connection type.
    pub const STATUS: &str = "status";
    pub const CONNECTED: &str = "connected";
    pub const DISCONNECTED: &str = "disconnected";
    pub const MESSAGE: &str = "message";
    pub const ERROR: &str = "error";

    /// Auth request, first frame on a relay link.
    pub const CONNECT: &str = "connect";

    // Peer channel signaling over the relay.
    pub const PEER_SETUP: &str = "peer setup";
    pub const PEER_CONNECTED: &str = "peer connected";
    pub const PEER_DESTROY: &str = "peer destroy";
    pub const PEER_EVENT: &str = "peer event";

    // Direct connection signaling over a peer channel.
    pub const WEBRTC_OFFER: &str = "webrtc offer";
    pub const WEBRTC_ANSWER: &str = "webrtc answer";
    pub const WEBRTC_CANDIDATE: &str = "webrtc candidate";
    pub const WEBRTC_DESTROY: &str = "webrtc destroy";

    // Channel lifecycle on a direct connection, emitted locally.
    pub const CHANNEL_OPEN: &str = "channel open";
    pub const CHANNEL_CLOSE: &str = "channel close";
    pub const CHANNEL_ERROR: &str = "channel error";

    /// Media transform progress, emitted locally.
    pub const MEDIA_PROGRESS: &str = "media progress";
}

/// One logical message on the wire: an event name and its args.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub args: Value,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, args: Value) -> Self {
        Self { event: event.into(), args }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PocoNetError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PocoNetError> {
        rmp_serde::from_slice(bytes).map_err(Into::into)
    }

    /// Encode as one unsegmented packet.
    pub fn to_packet(&self) -> Result<Packet, PocoNetError> {
        Ok(PacketBuilder::new()
            .with_no_segment()
            .append_body(&self.to_bytes()?)
            .build())
    }

    pub fn from_packet(packet: &Packet) -> Result<Self, PocoNetError> {
        Self::from_bytes(packet.body())
    }
}

fn shape_error(event: &str, err: impl std::fmt::Display) -> PocoNetError {
    PocoNetError::protocol(format!("bad {event:?} payload: {err}"))
}

// ── Typed payload views ──────────────────────────────────────────────

/// `{address, version}` announced by the auth frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub address: Address,
    pub version: String,
}

impl AuthPayload {
    pub fn from_value(args: &Value) -> Result<Self, PocoNetError> {
        serde_json::from_value(args.clone()).map_err(|e| shape_error(events::CONNECT, e))
    }
}

/// `{from, to}` carried by peer signaling events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAddressPayload {
    pub from: Address,
    pub to: Address,
}

impl PeerAddressPayload {
    pub fn new(from: Address, to: Address) -> Self {
        Self { from, to }
    }

    pub fn from_value(event: &str, args: &Value) -> Result<Self, PocoNetError> {
        serde_json::from_value(args.clone()).map_err(|e| shape_error(event, e))
    }
}

/// `{from, to, event, payload}` of a forwarded peer message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEventPayload {
    pub from: Address,
    pub to: Address,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl PeerEventPayload {
    pub fn from_value(args: &Value) -> Result<Self, PocoNetError> {
        serde_json::from_value(args.clone()).map_err(|e| shape_error(events::PEER_EVENT, e))
    }
}

/// `{error}` body of an error frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

impl ErrorPayload {
    pub fn from_value(args: &Value) -> Result<Self, PocoNetError> {
        serde_json::from_value(args.clone()).map_err(|e| shape_error(events::ERROR, e))
    }
}
