//! Connection configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::error::PocoNetError;
use crate::ice::SessionDescription;
use crate::packet::{DIRECT_CHANNEL_MTU, RELAY_MTU};
use crate::PROTOCOL_VERSION;

/// Which transport a connection factory should build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Messages forwarded through the relay hub.
    Relay,
    /// Direct transport negotiated over relay signaling.
    Direct,
}

impl ConnectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Relay => "relay",
            Self::Direct => "direct",
        }
    }
}

impl FromStr for ConnectionKind {
    type Err = PocoNetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relay" => Ok(Self::Relay),
            "direct" => Ok(Self::Direct),
            other => Err(PocoNetError::UnknownTransportType(other.to_string())),
        }
    }
}

/// Settings for a [`RelayConnection`](crate::RelayConnection).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Hub endpoint, `host:port`.
    pub uri: String,
    /// Protocol version advertised in the auth frame.
    pub version: String,
    /// Bound on dialing the hub and receiving its auth verdict.
    pub connect_timeout: Duration,
    /// Bound on a peer channel's setup handshake.
    pub handshake_timeout: Duration,
    /// Packet size limit on the relay link.
    pub max_packet_size: usize,
    /// Depth of the outbound frame queue.
    pub send_queue: usize,
}

impl RelayConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            version: PROTOCOL_VERSION.to_string(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            max_packet_size: RELAY_MTU,
            send_queue: 64,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_packet_size(mut self, limit: usize) -> Self {
        self.max_packet_size = limit;
        self
    }

    pub fn with_send_queue(mut self, depth: usize) -> Self {
        self.send_queue = depth;
        self
    }
}

/// Settings for a [`PeerDirectConnection`](crate::PeerDirectConnection).
#[derive(Debug, Clone)]
pub struct DirectConfig {
    /// Packet size limit on the data channel; segmentation splits above it.
    pub max_packet_size: usize,
    /// Bound on negotiation reaching the connected state.
    pub connect_timeout: Duration,
    /// Present on the answering side: the offer received over signaling.
    pub remote_offer: Option<SessionDescription>,
}

impl DirectConfig {
    pub fn new() -> Self {
        Self {
            max_packet_size: DIRECT_CHANNEL_MTU,
            connect_timeout: Duration::from_secs(30),
            remote_offer: None,
        }
    }

    /// Config for the side that received `offer` and will answer it.
    pub fn answering(offer: SessionDescription) -> Self {
        Self { remote_offer: Some(offer), ..Self::new() }
    }

    pub fn with_max_packet_size(mut self, limit: usize) -> Self {
        self.max_packet_size = limit;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self::new()
    }
}
