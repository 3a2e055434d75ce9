//! poco rendezvous hub.
//!
//! The hub is the server side of a [`RelayConnection`]: it accepts TCP
//! clients speaking length-delimited poco frames, authenticates the
//! first frame against the protocol version, registers each client
//! under its address, and from then on forwards addressed peer frames
//! between registered clients without looking past the `to` field.
//!
//! [`RelayConnection`]: poco_net::RelayConnection

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, Stream, StreamExt};
use poco_net::wire::{events, AuthPayload, EventFrame};
use poco_net::{Address, Packet, RejectReason, PROTOCOL_VERSION, RELAY_MTU};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::LengthDelimitedCodec;
use tokio_util::sync::CancellationToken;

/// Hub settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Listen address, `host:port`. Port 0 picks a free one.
    pub bind: String,
    /// Protocol version clients must announce.
    pub version: String,
    /// Frame size limit per client link.
    pub max_packet_size: usize,
    /// Bound on a fresh client sending its auth frame.
    pub auth_timeout: Duration,
    /// Depth of each client's outbound frame queue.
    pub send_queue: usize,
}

impl HubConfig {
    pub fn new(bind: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            version: PROTOCOL_VERSION.to_string(),
            max_packet_size: RELAY_MTU,
            auth_timeout: Duration::from_secs(10),
            send_queue: 64,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_max_packet_size(mut self, limit: usize) -> Self {
        self.max_packet_size = limit;
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn with_send_queue(mut self, depth: usize) -> Self {
        self.send_queue = depth;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),
    #[error("no client registered as {0}")]
    UnknownClient(Address),
}

/// A running hub. Dropping it does not stop the accept loop; call
/// [`shutdown`](Self::shutdown).
pub struct RelayHub {
    state: Arc<HubState>,
    local_addr: SocketAddr,
    accept: JoinHandle<()>,
}

struct HubState {
    config: HubConfig,
    clients: Mutex<HashMap<Address, ClientHandle>>,
    shutdown: CancellationToken,
}

struct ClientHandle {
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RelayHub {
    /// Bind the listener and start accepting clients.
    pub async fn bind(config: HubConfig) -> Result<Self, HubError> {
        let listener = TcpListener::bind(&config.bind).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, version = %config.version, "hub listening");

        let state = Arc::new(HubState {
            config,
            clients: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });
        let accept = tokio::spawn(accept_loop(state.clone(), listener));
        Ok(Self { state, local_addr, accept })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Addresses currently registered.
    pub fn connected(&self) -> Vec<Address> {
        lock(&self.state.clients).keys().cloned().collect()
    }

    /// Push an error frame to one client and drop it.
    pub async fn kick(&self, address: &Address, reason: &str) -> Result<(), HubError> {
        let handle = lock(&self.state.clients)
            .remove(address)
            .ok_or_else(|| HubError::UnknownClient(address.clone()))?;
        tracing::info!(%address, reason, "kicking client");
        if let Ok(bytes) = error_frame(reason) {
            let _ = handle.outbound.send(bytes).await;
        }
        handle.cancel.cancel();
        Ok(())
    }

    /// Stop accepting and drop every client. Client tasks unwind on
    /// their own once the shared token fires.
    pub async fn shutdown(self) {
        self.state.shutdown.cancel();
        lock(&self.state.clients).clear();
        let _ = self.accept.await;
    }
}

impl std::fmt::Debug for RelayHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHub")
            .field("addr", &self.local_addr)
            .field("clients", &lock(&self.state.clients).len())
            .finish()
    }
}

fn error_frame(reason: &str) -> Result<Bytes, poco_net::PocoNetError> {
    Ok(EventFrame::new(events::ERROR, json!({ "error": reason }))
        .to_packet()?
        .to_bytes())
}

fn connected_frame() -> Result<Bytes, poco_net::PocoNetError> {
    Ok(EventFrame::new(events::CONNECTED, json!({})).to_packet()?.to_bytes())
}

async fn accept_loop(state: Arc<HubState>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = state.shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tokio::spawn(serve_client(state.clone(), stream, peer));
            }
            Err(err) => {
                tracing::warn!(%err, "accept failed");
            }
        }
    }
}

/// One client connection: auth phase, then the forwarding loop.
async fn serve_client(state: Arc<HubState>, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let framed = LengthDelimitedCodec::builder()
        .max_frame_length(state.config.max_packet_size)
        .new_framed(stream);
    let (mut sink, mut frames) = framed.split();

    let (outbound, mut queue) = mpsc::channel::<Bytes>(state.config.send_queue);
    let writer = tokio::spawn(async move {
        // Runs until every sender is gone, so queued frames still flush
        // after a reject or kick.
        while let Some(bytes) = queue.recv().await {
            if sink.send(bytes).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    });

    let cancel = state.shutdown.child_token();
    let address = match authenticate(&state, &mut frames, &outbound, &cancel, peer).await {
        Some(address) => address,
        None => {
            drop(outbound);
            let _ = writer.await;
            return;
        }
    };

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(bytes)) => route_frame(&state, &address, bytes.freeze()),
            Some(Err(err)) => {
                tracing::warn!(%address, %err, "client link error");
                break;
            }
            None => break,
        }
    }

    // Remove only our own registration; a kick may already have
    // replaced it with a newer client under the same address.
    if let Entry::Occupied(entry) = lock(&state.clients).entry(address.clone()) {
        if entry.get().outbound.same_channel(&outbound) {
            entry.remove();
        }
    }
    drop(outbound);
    let _ = writer.await;
    tracing::info!(%address, "client disconnected");
}

/// Read the auth frame, judge it, and register the client. `None`
/// means the client was rejected (the reason frame is already queued)
/// or the link died before authenticating.
async fn authenticate(
    state: &HubState,
    frames: &mut (impl Stream<Item = std::io::Result<BytesMut>> + Unpin),
    outbound: &mpsc::Sender<Bytes>,
    cancel: &CancellationToken,
    peer: SocketAddr,
) -> Option<Address> {
    let first = tokio::time::timeout(state.config.auth_timeout, frames.next()).await;
    let bytes = match first {
        Ok(Some(Ok(bytes))) => bytes.freeze(),
        Ok(Some(Err(err))) => {
            tracing::debug!(%peer, %err, "link error before auth");
            return None;
        }
        Ok(None) => return None,
        Err(_) => {
            tracing::debug!(%peer, "auth timed out");
            return None;
        }
    };

    // Judge, then claim the address slot under one lock so two clients
    // racing for the same address cannot both win.
    let verdict = judge_auth(state, bytes).and_then(|address| {
        match lock(&state.clients).entry(address.clone()) {
            Entry::Occupied(_) => Err(RejectReason::DuplicateAddress),
            Entry::Vacant(slot) => {
                slot.insert(ClientHandle {
                    outbound: outbound.clone(),
                    cancel: cancel.clone(),
                });
                Ok(address)
            }
        }
    });

    match verdict {
        Ok(address) => {
            tracing::info!(%address, %peer, "client registered");
            if let Ok(frame) = connected_frame() {
                let _ = outbound.send(frame).await;
            }
            Some(address)
        }
        Err(reason) => {
            tracing::info!(%peer, %reason, "rejecting client");
            if let Ok(frame) = error_frame(reason.as_str()) {
                let _ = outbound.send(frame).await;
            }
            None
        }
    }
}

fn judge_auth(state: &HubState, bytes: Bytes) -> Result<Address, RejectReason> {
    let frame = decode_atomic(&bytes).ok_or(RejectReason::InvalidProtocol)?;
    if frame.event != events::CONNECT {
        return Err(RejectReason::InvalidProtocol);
    }
    match frame.args.get("address").and_then(Value::as_str) {
        Some(s) if !s.is_empty() => {}
        _ => return Err(RejectReason::MissingAddress),
    }
    let auth = AuthPayload::from_value(&frame.args).map_err(|_| RejectReason::InvalidProtocol)?;
    if auth.version != state.config.version {
        return Err(RejectReason::InvalidProtocol);
    }
    Ok(auth.address)
}

/// The only client frames the hub forwards. Anything else addressed at
/// the hub is a client-side mistake and gets dropped.
fn is_peer_frame(event: &str) -> bool {
    matches!(
        event,
        events::PEER_SETUP | events::PEER_CONNECTED | events::PEER_DESTROY | events::PEER_EVENT
    )
}

/// Forward an addressed peer frame to its target, untouched. The hub
/// decodes just enough to find `to`; everything else is the clients'
/// business.
fn route_frame(state: &HubState, from: &Address, bytes: Bytes) {
    let Some(frame) = decode_atomic(&bytes) else {
        tracing::warn!(%from, "unroutable frame dropped");
        return;
    };
    if !is_peer_frame(&frame.event) {
        tracing::debug!(%from, event = %frame.event, "ignoring non-peer event");
        return;
    }
    let Some(target) = frame.args.get("to").and_then(Value::as_str) else {
        tracing::debug!(%from, event = %frame.event, "frame without a target, dropped");
        return;
    };
    let Ok(target) = target.parse::<Address>() else {
        tracing::debug!(%from, "frame with an empty target, dropped");
        return;
    };

    match lock(&state.clients).get(&target) {
        Some(handle) => {
            tracing::debug!(%from, %target, event = %frame.event, "forwarding");
            if handle.outbound.try_send(bytes).is_err() {
                tracing::warn!(%from, %target, "target queue full or gone, frame dropped");
            }
        }
        None => {
            tracing::debug!(%from, %target, event = %frame.event, "target not registered, dropped");
        }
    }
}

/// Decode a frame that must be a single whole packet. Segmented
/// traffic is a client-side bug; the hub never reassembles.
fn decode_atomic(bytes: &Bytes) -> Option<EventFrame> {
    let packet = Packet::from_bytes(bytes.clone()).ok()?;
    if packet.more_segment() || !packet.no_segment() {
        return None;
    }
    EventFrame::from_packet(&packet).ok()
}
