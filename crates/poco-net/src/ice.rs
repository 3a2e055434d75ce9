//! Abstract ICE transport seam.
//!
//! poco implements no ICE, STUN, or SDP. A direct connection drives an
//! external ICE-capable transport through these traits, treating its
//! offer/answer/candidate blobs as opaque values passed over signaling
//! unmodified. `testing::ice_pair` provides the in-memory reference
//! implementation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PocoNetError;
use crate::status::ConnectionStatus;

/// Opaque session description produced and consumed by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(pub Value);

/// Opaque ICE candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(pub Value);

/// Transport connectivity state; maps 1:1 onto [`ConnectionStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn as_status(self) -> ConnectionStatus {
        match self {
            Self::New => ConnectionStatus::New,
            Self::Connecting => ConnectionStatus::Connecting,
            Self::Connected => ConnectionStatus::Connected,
            Self::Disconnected => ConnectionStatus::Disconnected,
            Self::Failed => ConnectionStatus::Failed,
            Self::Closed => ConnectionStatus::Closed,
        }
    }
}

/// Events pumped out of an [`IceTransport`].
pub enum IceEvent {
    StateChange(IceConnectionState),
    /// A locally gathered candidate ready to signal to the remote side.
    LocalCandidate(IceCandidate),
    /// A channel the remote side opened.
    IncomingChannel(Arc<dyn DataChannel>),
}

impl fmt::Debug for IceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateChange(state) => f.debug_tuple("StateChange").field(state).finish(),
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::IncomingChannel(ch) => {
                f.debug_tuple("IncomingChannel").field(&ch.label()).finish()
            }
        }
    }
}

/// Events pumped out of a [`DataChannel`].
#[derive(Debug)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Closed,
    Error(String),
}

/// Driver interface over the external ICE transport.
///
/// One direct connection owns one transport; `next_event` has a single
/// consumer (the connection's driver task).
#[async_trait]
pub trait IceTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PocoNetError>;

    async fn create_answer(&self) -> Result<SessionDescription, PocoNetError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PocoNetError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PocoNetError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PocoNetError>;

    /// Open the ordered, reliable channel `label` on this side. Opening
    /// the first channel is what makes the transport start negotiating.
    fn open_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PocoNetError>;

    /// Next transport event; `None` once the transport is closed.
    async fn next_event(&self) -> Option<IceEvent>;

    async fn close(&self);
}

/// An ordered, reliable byte channel of an [`IceTransport`].
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send(&self, frame: Bytes) -> Result<(), PocoNetError>;

    /// Next channel event; `None` once the channel is gone.
    async fn next_event(&self) -> Option<ChannelEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_states_map_one_to_one() {
        use IceConnectionState::*;
        let pairs = [
            (New, ConnectionStatus::New),
            (Connecting, ConnectionStatus::Connecting),
            (Connected, ConnectionStatus::Connected),
            (Disconnected, ConnectionStatus::Disconnected),
            (Failed, ConnectionStatus::Failed),
            (Closed, ConnectionStatus::Closed),
        ];
        for (state, status) in pairs {
            assert_eq!(state.as_status(), status);
        }
    }

    #[test]
    fn descriptions_serialize_transparently() {
        let offer = SessionDescription(serde_json::json!({ "type": "offer", "sdp": "v=0" }));
        let value = serde_json::to_value(&offer).unwrap();
        assert_eq!(value["type"], "offer");
        let back: SessionDescription = serde_json::from_value(value).unwrap();
        assert_eq!(back, offer);
    }
}
