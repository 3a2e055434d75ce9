//! In-memory transports for exercising connections without a network.
//!
//! [`signaling_pair`] gives two cross-wired [`SignalingChannel`] halves,
//! [`ice_pair`] two linked [`IceTransport`]s whose link comes up once
//! both sides have applied the remote description. Together they let a
//! pair of [`PeerDirectConnection`](crate::PeerDirectConnection)s run a
//! full offer/answer/candidate negotiation inside one process.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use poco_util::{Callback, DispatchMode, EventDispatcher};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::direct::SignalingChannel;
use crate::error::PocoNetError;
use crate::ice::{
    ChannelEvent, DataChannel, IceCandidate, IceConnectionState, IceEvent, IceTransport,
    SessionDescription,
};
use crate::status::ConnectionStatus;
use crate::{lock, Address};

// ── Signaling ────────────────────────────────────────────────────────

/// One half of an always-connected in-memory signaling pair.
#[derive(Debug)]
pub struct LoopbackSignaling {
    local: Address,
    remote: Address,
    events: Arc<EventDispatcher<Value>>,
    peer: Arc<EventDispatcher<Value>>,
}

/// Two signaling halves wired to each other; a send on one emits on the
/// other, synchronously.
pub fn signaling_pair(
    a: Address,
    b: Address,
) -> (Arc<LoopbackSignaling>, Arc<LoopbackSignaling>) {
    let a_events = Arc::new(EventDispatcher::new());
    let b_events = Arc::new(EventDispatcher::new());
    let left = Arc::new(LoopbackSignaling {
        local: a.clone(),
        remote: b.clone(),
        events: a_events.clone(),
        peer: b_events.clone(),
    });
    let right = Arc::new(LoopbackSignaling {
        local: b,
        remote: a,
        events: b_events,
        peer: a_events,
    });
    (left, right)
}

impl LoopbackSignaling {
    pub fn local_address(&self) -> &Address {
        &self.local
    }
}

#[async_trait]
impl SignalingChannel for LoopbackSignaling {
    fn remote_address(&self) -> &Address {
        &self.remote
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus::Connected
    }

    async fn connect(&self) -> Result<(), PocoNetError> {
        Ok(())
    }

    async fn send(&self, event: &str, payload: Value) -> Result<(), PocoNetError> {
        self.peer.emit(event, payload);
        self.peer.run_deferred();
        Ok(())
    }

    fn on(&self, event: &str, callback: Callback<Value>, mode: DispatchMode) -> bool {
        self.events.on(event, callback, mode)
    }

    fn off(&self, event: &str, callback: &Callback<Value>) -> bool {
        self.events.off(event, callback)
    }
}

// ── Transport ────────────────────────────────────────────────────────

#[derive(Default)]
struct LinkShared {
    remote_set: [bool; 2],
    up: bool,
    /// Channels opened before the link came up: (opening side, local
    /// half, half destined for the other side).
    parked: Vec<(usize, Arc<LoopbackChannel>, Arc<LoopbackChannel>)>,
}

/// One side of a linked in-memory transport pair.
pub struct LoopbackIce {
    side: usize,
    link: Arc<Mutex<LinkShared>>,
    tx: mpsc::UnboundedSender<IceEvent>,
    peer_tx: mpsc::UnboundedSender<IceEvent>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<IceEvent>>,
    candidates_added: AtomicUsize,
    closed: AtomicBool,
}

/// Two transports sharing one link. The link reports `Connected` on both
/// sides once each has applied the other's description; channels opened
/// earlier are delivered at that point.
pub fn ice_pair() -> (Arc<LoopbackIce>, Arc<LoopbackIce>) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    let link = Arc::new(Mutex::new(LinkShared::default()));
    let a = Arc::new(LoopbackIce {
        side: 0,
        link: link.clone(),
        tx: tx_a.clone(),
        peer_tx: tx_b.clone(),
        rx: tokio::sync::Mutex::new(rx_a),
        candidates_added: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
    });
    let b = Arc::new(LoopbackIce {
        side: 1,
        link,
        tx: tx_b,
        peer_tx: tx_a,
        rx: tokio::sync::Mutex::new(rx_b),
        candidates_added: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
    });
    (a, b)
}

impl LoopbackIce {
    /// Candidates this side has accepted, for asserting on trickle and
    /// queue-flush behavior.
    pub fn candidates_added(&self) -> usize {
        self.candidates_added.load(Ordering::SeqCst)
    }

    fn deliver(&self, opener: usize, local: Arc<LoopbackChannel>, remote: Arc<LoopbackChannel>) {
        let other_tx = if opener == self.side { &self.peer_tx } else { &self.tx };
        local.mark_open();
        remote.mark_open();
        let _ = other_tx.send(IceEvent::IncomingChannel(remote));
    }
}

#[async_trait]
impl IceTransport for LoopbackIce {
    async fn create_offer(&self) -> Result<SessionDescription, PocoNetError> {
        Ok(SessionDescription(json!({ "kind": "offer", "side": self.side })))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PocoNetError> {
        Ok(SessionDescription(json!({ "kind": "answer", "side": self.side })))
    }

    async fn set_local_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), PocoNetError> {
        // One trickled candidate per side keeps the signaling path honest.
        let _ = self.tx.send(IceEvent::LocalCandidate(IceCandidate(json!({
            "candidate": format!("loopback-{}", self.side),
        }))));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), PocoNetError> {
        let parked = {
            let mut link = lock(&self.link);
            link.remote_set[self.side] = true;
            let _ = self
                .tx
                .send(IceEvent::StateChange(IceConnectionState::Connecting));
            if link.remote_set[0] && link.remote_set[1] && !link.up {
                link.up = true;
                let _ = self
                    .tx
                    .send(IceEvent::StateChange(IceConnectionState::Connected));
                let _ = self
                    .peer_tx
                    .send(IceEvent::StateChange(IceConnectionState::Connected));
                Some(std::mem::take(&mut link.parked))
            } else {
                None
            }
        };
        if let Some(parked) = parked {
            for (opener, local, remote) in parked {
                self.deliver(opener, local, remote);
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), PocoNetError> {
        self.candidates_added.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn open_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PocoNetError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PocoNetError::closed("transport is closed"));
        }
        let (local, remote) = LoopbackChannel::pair(label);
        let ready = {
            let mut link = lock(&self.link);
            if link.up {
                true
            } else {
                link.parked.push((self.side, local.clone(), remote.clone()));
                false
            }
        };
        if ready {
            self.deliver(self.side, local.clone(), remote);
        }
        Ok(local)
    }

    async fn next_event(&self) -> Option<IceEvent> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .tx
            .send(IceEvent::StateChange(IceConnectionState::Closed));
        let _ = self
            .peer_tx
            .send(IceEvent::StateChange(IceConnectionState::Disconnected));
    }
}

impl std::fmt::Debug for LoopbackIce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackIce")
            .field("side", &self.side)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// One half of an in-memory data channel.
pub struct LoopbackChannel {
    label: String,
    open: AtomicBool,
    own_tx: mpsc::UnboundedSender<ChannelEvent>,
    to_peer: mpsc::UnboundedSender<ChannelEvent>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelEvent>>,
}

impl LoopbackChannel {
    fn pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            own_tx: tx_a.clone(),
            to_peer: tx_b.clone(),
            events: tokio::sync::Mutex::new(rx_a),
        });
        let b = Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            own_tx: tx_b,
            to_peer: tx_a,
            events: tokio::sync::Mutex::new(rx_b),
        });
        (a, b)
    }

    fn mark_open(&self) {
        self.open.store(true, Ordering::SeqCst);
        let _ = self.own_tx.send(ChannelEvent::Open);
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: Bytes) -> Result<(), PocoNetError> {
        if !self.is_open() {
            return Err(PocoNetError::closed("channel is not open"));
        }
        self.to_peer
            .send(ChannelEvent::Message(frame))
            .map_err(|_| PocoNetError::closed("peer half is gone"))
    }

    async fn next_event(&self) -> Option<ChannelEvent> {
        self.events.lock().await.recv().await
    }
}

impl std::fmt::Debug for LoopbackChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackChannel")
            .field("label", &self.label)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signaling_halves_cross_deliver() {
        let (a, b) = signaling_pair("alice".parse().unwrap(), "bob".parse().unwrap());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        b.on(
            "hello",
            Callback::new(move |args: &Value| sink.lock().unwrap().push(args.clone())),
            DispatchMode::Sync,
        );

        a.send("hello", json!({ "n": 1 })).await.unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[json!({ "n": 1 })]);
        assert_eq!(a.local_address().as_str(), "alice");
        assert_eq!(a.remote_address().as_str(), "bob");
    }

    #[tokio::test]
    async fn link_comes_up_after_both_descriptions() {
        let (a, b) = ice_pair();

        let channel = a.open_channel("poco").unwrap();
        assert!(!channel.is_open());

        let offer = a.create_offer().await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert!(channel.is_open());
        // The other side is handed its half of the channel.
        let incoming = loop {
            match b.next_event().await.unwrap() {
                IceEvent::IncomingChannel(ch) => break ch,
                _ => continue,
            }
        };
        assert_eq!(incoming.label(), "poco");
        assert!(incoming.is_open());

        channel.send(Bytes::from_static(b"hi")).await.unwrap();
        let got = loop {
            match incoming.next_event().await.unwrap() {
                ChannelEvent::Message(bytes) => break bytes,
                _ => continue,
            }
        };
        assert_eq!(&got[..], b"hi");
    }
}
