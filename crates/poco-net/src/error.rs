//! Error taxonomy for poco connections.

use std::fmt;
use std::str::FromStr;

use poco_util::WaitError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by connections, codecs, and the transports beneath them.
#[derive(Debug, Error)]
pub enum PocoNetError {
    /// Operation on a connection that is not (or no longer) connected.
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// A bounded wait (connect, handshake, one-shot event) hit its deadline.
    #[error("timed out waiting for {what}")]
    ConnectionTimeout { what: String },

    /// An abort signal cancelled the operation.
    #[error("connection aborted")]
    ConnectionAborted,

    /// The connection factory was given an unrecognized kind string.
    #[error("unknown transport type: {0:?}")]
    UnknownTransportType(String),

    /// Malformed packet, payload shape violation, or config out of range.
    #[error("protocol violation: {reason}")]
    Protocol { reason: String },

    /// The relay hub refused the connection.
    #[error("rejected by relay: {0}")]
    Rejected(RejectReason),

    /// A frame too large for the link's packet size limit.
    #[error("packet of {size} bytes exceeds the {max} byte limit")]
    PacketTooLarge { size: usize, max: usize },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl PocoNetError {
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed { reason: reason.into() }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol { reason: reason.into() }
    }

    /// Map a one-shot wait failure onto the connection taxonomy.
    pub fn from_wait(err: WaitError, what: &str) -> Self {
        match err {
            WaitError::Timeout => Self::ConnectionTimeout { what: what.to_string() },
            WaitError::Aborted => Self::ConnectionAborted,
        }
    }
}

/// Reason codes the hub and the connections put in `"error"` and
/// `"disconnected"` payloads. Serialized as the exact wire strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    #[serde(rename = "missing address")]
    MissingAddress,
    #[serde(rename = "invalid protocol")]
    InvalidProtocol,
    #[serde(rename = "duplicate address")]
    DuplicateAddress,
    #[serde(rename = "user closed")]
    UserClosed,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingAddress => "missing address",
            Self::InvalidProtocol => "invalid protocol",
            Self::DuplicateAddress => "duplicate address",
            Self::UserClosed => "user closed",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RejectReason {
    type Err = PocoNetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing address" => Ok(Self::MissingAddress),
            "invalid protocol" => Ok(Self::InvalidProtocol),
            "duplicate address" => Ok(Self::DuplicateAddress),
            "user closed" => Ok(Self::UserClosed),
            other => Err(PocoNetError::protocol(format!("unknown reason code: {other:?}"))),
        }
    }
}
