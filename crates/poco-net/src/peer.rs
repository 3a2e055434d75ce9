//! Peer channel multiplexed over the relay link.
//!
//! A `PeerRelayConnection` is a lightweight handle onto shared channel
//! state owned by the relay's registry. The handshake runs over
//! `"peer setup"` / `"peer connected"` frames; simultaneous setups from
//! both sides are collapsed by the relay's handshake book so each side
//! still connects exactly once.

use std::fmt;
use std::sync::Arc;

use poco_util::{Callback, DispatchMode, EventDispatcher, OnceOptions, WaitError};
use serde_json::{json, Value};

use crate::error::{PocoNetError, RejectReason};
use crate::relay::RelayConnection;
use crate::status::{ConnectClaim, ConnectionStatus, StatusCell};
use crate::wire::events;
use crate::Address;

/// Channel state shared between handles and the relay's inbound router.
pub(crate) struct PeerShared {
    local: Address,
    remote: Address,
    events: EventDispatcher<Value>,
    status: StatusCell,
}

impl PeerShared {
    pub(crate) fn new(local: Address, remote: Address) -> Self {
        Self {
            local,
            remote,
            events: EventDispatcher::new(),
            status: StatusCell::new(),
        }
    }

    pub(crate) fn local(&self) -> &Address {
        &self.local
    }

    pub(crate) fn remote(&self) -> &Address {
        &self.remote
    }

    pub(crate) fn events(&self) -> &EventDispatcher<Value> {
        &self.events
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    fn set_status(&self, status: ConnectionStatus) -> bool {
        if !self.status.advance(status) {
            return false;
        }
        self.events.emit(events::STATUS, json!(status.as_str()));
        true
    }

    fn claim_connect(&self) -> ConnectClaim {
        if self.set_status(ConnectionStatus::Connecting) {
            return ConnectClaim::Proceed;
        }
        match self.status.get() {
            ConnectionStatus::Connected => ConnectClaim::AlreadyConnected,
            ConnectionStatus::Connecting => ConnectClaim::Join,
            _ => ConnectClaim::Terminal,
        }
    }

    /// Claim the answering role for an unsolicited setup. Only a fresh
    /// channel answers; anything else already has a handshake story.
    pub(crate) fn begin_answering(&self) -> bool {
        let claimed = self.set_status(ConnectionStatus::Connecting);
        if claimed {
            self.events.run_deferred();
        }
        claimed
    }

    /// Move to `Connected` and announce it. Returns false when the
    /// channel was already connected or terminal, so duplicate
    /// confirmations stay silent.
    pub(crate) fn complete_handshake(&self) -> bool {
        if !self.set_status(ConnectionStatus::Connected) {
            return false;
        }
        tracing::debug!(local = %self.local, remote = %self.remote, "peer channel connected");
        self.events.emit(events::CONNECTED, json!({}));
        self.events.run_deferred();
        true
    }

    /// Route an application event delivered by the relay.
    pub(crate) fn dispatch(&self, event: &str, payload: Value) {
        self.events.emit(event, payload);
        self.events.run_deferred();
    }

    /// Drive the channel to a terminal status, announcing the ending
    /// once. `Failed` surfaces as an `"error"` event, the rest as
    /// `"disconnected"`.
    pub(crate) fn force_terminal(&self, status: ConnectionStatus, reason: &str) {
        debug_assert!(status.is_terminal());
        if !self.set_status(status) {
            return;
        }
        if status == ConnectionStatus::Failed {
            self.events.emit(events::ERROR, json!({ "error": reason }));
        } else {
            self.events.emit(events::DISCONNECTED, json!({ "reason": reason }));
        }
        self.events.run_deferred();
    }

    /// The relay link ended; the channel cannot outlive it.
    pub(crate) fn on_relay_terminal(&self, relay_status: ConnectionStatus) {
        let (status, reason) = match relay_status {
            ConnectionStatus::Failed => (ConnectionStatus::Failed, "relay connection failed"),
            _ => (ConnectionStatus::Closed, "relay connection closed"),
        };
        self.force_terminal(status, reason);
    }

    /// The remote announced `"peer destroy"` for this channel.
    pub(crate) fn on_remote_destroy(&self) {
        self.force_terminal(ConnectionStatus::Closed, "peer destroy");
    }
}

/// Handle to a peer channel. Cheap to clone; all handles for one remote
/// address share the same channel.
#[derive(Clone)]
pub struct PeerRelayConnection {
    relay: RelayConnection,
    shared: Arc<PeerShared>,
}

impl PeerRelayConnection {
    pub(crate) fn from_shared(relay: RelayConnection, shared: Arc<PeerShared>) -> Self {
        Self { relay, shared }
    }

    pub fn local_address(&self) -> &Address {
        self.shared.local()
    }

    pub fn remote_address(&self) -> &Address {
        self.shared.remote()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    /// Register a listener; see [`EventDispatcher::on`].
    pub fn on(&self, event: &str, callback: Callback<Value>, mode: DispatchMode) -> bool {
        self.shared.events().on(event, callback, mode)
    }

    pub fn off(&self, event: &str, callback: &Callback<Value>) -> bool {
        self.shared.events().off(event, callback)
    }

    /// Wait for the next emission of `event`; see [`EventDispatcher::once`].
    pub fn once(
        &self,
        event: &str,
        options: OnceOptions,
    ) -> impl std::future::Future<Output = Result<Value, WaitError>> + Send + 'static {
        self.shared.events().once(event, options)
    }

    /// Run the channel handshake. Connects the underlying relay first if
    /// needed; joins an in-flight handshake instead of starting a second
    /// one.
    pub async fn connect(&self) -> Result<(), PocoNetError> {
        match self.shared.claim_connect() {
            ConnectClaim::AlreadyConnected => return Ok(()),
            ConnectClaim::Terminal => {
                return Err(PocoNetError::closed("peer channel is terminal"))
            }
            ConnectClaim::Join => return self.join_pending_handshake().await,
            ConnectClaim::Proceed => {}
        }

        if let Err(err) = self.ensure_relay().await {
            self.relay.abandon_channel(self.shared.remote());
            self.shared
                .force_terminal(ConnectionStatus::Failed, "relay unavailable");
            return Err(err);
        }

        // Register before announcing so a confirmation racing back on
        // the reader task cannot be missed.
        let wait = self.shared.events().once(
            events::CONNECTED,
            OnceOptions::timeout(self.relay.handshake_timeout()),
        );
        self.relay.begin_handshake(self.shared.remote());
        let setup = json!({ "from": self.shared.local(), "to": self.shared.remote() });
        if let Err(err) = self.relay.send_peer_frame(events::PEER_SETUP, setup).await {
            self.relay.abandon_channel(self.shared.remote());
            self.shared
                .force_terminal(ConnectionStatus::Failed, "setup announcement failed");
            return Err(err);
        }
        match wait.await {
            Ok(_) => Ok(()),
            Err(err) => {
                let reason = match err {
                    WaitError::Timeout => "handshake timed out",
                    WaitError::Aborted => "handshake aborted",
                };
                self.relay.abandon_channel(self.shared.remote());
                self.shared.force_terminal(ConnectionStatus::Failed, reason);
                Err(PocoNetError::from_wait(err, "peer handshake"))
            }
        }
    }

    async fn join_pending_handshake(&self) -> Result<(), PocoNetError> {
        let wait = self.shared.events().once(
            events::CONNECTED,
            OnceOptions::timeout(self.relay.handshake_timeout()),
        );
        // Re-check after registering so an outcome that already landed is
        // not waited for again.
        match self.shared.status() {
            ConnectionStatus::Connected => Ok(()),
            s if s.is_terminal() => Err(PocoNetError::closed("peer channel is terminal")),
            _ => wait
                .await
                .map(|_| ())
                .map_err(|e| PocoNetError::from_wait(e, "peer handshake")),
        }
    }

    async fn ensure_relay(&self) -> Result<(), PocoNetError> {
        match self.relay.status() {
            ConnectionStatus::Connected => Ok(()),
            ConnectionStatus::New | ConnectionStatus::Connecting => self.relay.connect().await,
            _ => Err(PocoNetError::closed("relay connection is terminal")),
        }
    }

    /// Send an application event to the remote side of the channel.
    pub async fn send(&self, event: &str, payload: Value) -> Result<(), PocoNetError> {
        if self.shared.status() != ConnectionStatus::Connected {
            return Err(PocoNetError::closed("peer channel is not connected"));
        }
        self.relay
            .send_peer_frame(
                events::PEER_EVENT,
                json!({
                    "from": self.shared.local(),
                    "to": self.shared.remote(),
                    "event": event,
                    "payload": payload,
                }),
            )
            .await
    }

    /// Close the channel, announcing `"peer destroy"` to the remote on a
    /// best-effort basis.
    pub async fn disconnect(&self) -> Result<(), PocoNetError> {
        if self.shared.status().is_terminal() {
            return Ok(());
        }
        if self.relay.status() == ConnectionStatus::Connected {
            let destroy = json!({ "from": self.shared.local(), "to": self.shared.remote() });
            if let Err(err) = self.relay.send_peer_frame(events::PEER_DESTROY, destroy).await {
                tracing::debug!(remote = %self.shared.remote(), %err, "destroy announcement failed");
            }
        }
        self.relay.abandon_channel(self.shared.remote());
        self.shared
            .force_terminal(ConnectionStatus::Closed, RejectReason::UserClosed.as_str());
        Ok(())
    }
}

impl fmt::Debug for PeerRelayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRelayConnection")
            .field("local", self.shared.local())
            .field("remote", self.shared.remote())
            .field("status", &self.shared.status())
            .finish()
    }
}
