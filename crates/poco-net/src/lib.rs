//! # poco-net
//!
//! Connection core of the poco network: peers identified by an opaque
//! [`Address`] reach each other either through a relay hub
//! ([`RelayConnection`] + [`PeerRelayConnection`]) or directly over an
//! ICE-negotiated transport ([`PeerDirectConnection`]), with the relay
//! path doubling as the signaling channel for the direct one.
//!
//! Every connection type speaks the same event-driven API from
//! `poco-util`: register listeners, await one-shot events with a
//! deadline, send `(event, payload)` messages, observe `"status"`
//! transitions.
//!
//! ## Quick start
//!
//! ```no_run
//! use poco_net::{Address, RelayConfig, RelayConnection};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), poco_net::PocoNetError> {
//!     let alice: Address = "alice".parse()?;
//!     let relay = RelayConnection::new(alice, RelayConfig::new("127.0.0.1:8765"));
//!     relay.connect().await?;
//!
//!     let bob = relay.peer("bob".parse()?);
//!     bob.connect().await?;
//!     bob.send("ping", json!({ "n": 1 })).await?;
//!     Ok(())
//! }
//! ```

mod config;
mod direct;
mod error;
mod handshake;
mod ice;
mod ledger;
mod media;
mod packet;
mod peer;
mod relay;
mod status;
pub mod testing;
pub mod wire;

pub use config::{ConnectionKind, DirectConfig, RelayConfig};
pub use direct::{PeerDirectConnection, SignalingChannel};
pub use error::{PocoNetError, RejectReason};
pub use ice::{
    ChannelEvent, DataChannel, IceCandidate, IceConnectionState, IceEvent, IceTransport,
    SessionDescription,
};
pub use ledger::{JobRecord, LedgerEvent, ServiceDirectory, ServiceRecord};
pub use media::{MediaProgress, MediaTransform};
pub use packet::{
    to_packets, Packet, PacketBuilder, SegmentBuffer, DIRECT_CHANNEL_MTU, PACKET_HEADER_LEN,
    RELAY_MTU,
};
pub use peer::PeerRelayConnection;
pub use relay::RelayConnection;
pub use status::ConnectionStatus;
pub use wire::EventFrame;

pub use poco_util::{Callback, DispatchMode, OnceOptions, WaitError};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub(crate) fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Protocol version advertised at connect time; the hub rejects anything else.
pub const PROTOCOL_VERSION: &str = "poco/1";

/// Label of the data channel carrying messages on a direct connection.
pub const DATA_CHANNEL_LABEL: &str = "poco";

/// Opaque peer identity.
///
/// The content carries no structure the connection layer cares about; it
/// is compared, hashed, and serialized as a plain string. Cheap to clone.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(Arc<str>);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl FromStr for Address {
    type Err = PocoNetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PocoNetError::protocol("address must not be empty"));
        }
        Ok(Self(Arc::from(s)))
    }
}

impl serde::Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_as_a_string() {
        let addr: Address = "alice".parse().unwrap();
        assert_eq!(addr.to_string(), "alice");
        assert_eq!(addr.as_str(), "alice");

        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"alice\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn empty_address_is_rejected() {
        assert!("".parse::<Address>().is_err());
        assert!(serde_json::from_str::<Address>("\"\"").is_err());
    }

    #[test]
    fn addresses_are_map_keys() {
        let mut map = std::collections::HashMap::new();
        map.insert("alice".parse::<Address>().unwrap(), 1);
        assert_eq!(map.get(&"alice".parse::<Address>().unwrap()), Some(&1));
    }
}
