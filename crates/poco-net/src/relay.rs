//! Relay hub client.
//!
//! A `RelayConnection` dials the rendezvous hub over TCP, authenticates
//! with its address and protocol version, and from then on exchanges
//! single-packet frames with it. It also owns everything the peer
//! channels multiplexed over it share: the address → channel registry,
//! the pending handshake book, and the reader task that routes inbound
//! peer frames to the right channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use poco_util::{Callback, DispatchMode, EventDispatcher, OnceOptions};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::config::RelayConfig;
use crate::error::{PocoNetError, RejectReason};
use crate::handshake::{HandshakeBook, SetupDisposition};
use crate::packet::Packet;
use crate::peer::{PeerRelayConnection, PeerShared};
use crate::status::{ConnectionStatus, StatusCell};
use crate::wire::{events, ErrorPayload, EventFrame, PeerAddressPayload, PeerEventPayload};
use crate::{lock, Address};

type FrameSink = SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>;
type FrameStream = SplitStream<Framed<TcpStream, LengthDelimitedCodec>>;

/// Client side of the relay link. Cheap to clone; all clones share one
/// connection.
#[derive(Clone)]
pub struct RelayConnection {
    inner: Arc<RelayInner>,
}

pub(crate) struct RelayInner {
    local: Address,
    config: RelayConfig,
    events: EventDispatcher<Value>,
    status: StatusCell,
    peers: Mutex<HashMap<Address, Arc<PeerShared>>>,
    book: Mutex<HandshakeBook>,
    link: Mutex<Option<Link>>,
    connect_waiter: Mutex<Option<oneshot::Sender<Result<(), PocoNetError>>>>,
    torn_down: AtomicBool,
}

struct Link {
    outbound: mpsc::Sender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RelayConnection {
    /// Build a connection toward the hub in `config`. No I/O happens
    /// until [`connect`](Self::connect).
    pub fn new(local: Address, config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                local,
                config,
                events: EventDispatcher::new(),
                status: StatusCell::new(),
                peers: Mutex::new(HashMap::new()),
                book: Mutex::new(HandshakeBook::new()),
                link: Mutex::new(None),
                connect_waiter: Mutex::new(None),
                torn_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn local_address(&self) -> &Address {
        &self.inner.local
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.get()
    }

    /// Register a listener; see [`EventDispatcher::on`].
    pub fn on(&self, event: &str, callback: Callback<Value>, mode: DispatchMode) -> bool {
        self.inner.events.on(event, callback, mode)
    }

    pub fn off(&self, event: &str, callback: &Callback<Value>) -> bool {
        self.inner.events.off(event, callback)
    }

    /// Wait for the next emission of `event`; see [`EventDispatcher::once`].
    pub fn once(
        &self,
        event: &str,
        options: OnceOptions,
    ) -> impl std::future::Future<Output = Result<Value, poco_util::WaitError>> + Send + 'static {
        self.inner.events.once(event, options)
    }

    /// Dial the hub and authenticate. Idempotent while connecting or
    /// connected; a second caller joins the in-flight attempt.
    pub async fn connect(&self) -> Result<(), PocoNetError> {
        let inner = &self.inner;
        let status = inner.status.get();
        if status == ConnectionStatus::Connected {
            return Ok(());
        }
        if status.is_terminal() {
            return Err(PocoNetError::closed("relay connection is terminal"));
        }
        if !inner.set_status(ConnectionStatus::Connecting) {
            return self.join_pending_connect().await;
        }

        let result = inner.dial().await;
        if let Err(err) = &result {
            inner.fail(&err.to_string());
        }
        inner.events.run_deferred();
        result
    }

    /// Join a connect attempt some other caller started.
    async fn join_pending_connect(&self) -> Result<(), PocoNetError> {
        let inner = &self.inner;
        let wait = inner.events.once(
            events::CONNECTED,
            OnceOptions::timeout(inner.config.connect_timeout),
        );
        // Re-check after registering so a verdict that already landed is
        // not waited for again.
        match inner.status.get() {
            ConnectionStatus::Connected => Ok(()),
            s if s.is_terminal() => Err(PocoNetError::closed("relay connection is terminal")),
            _ => wait
                .await
                .map(|_| ())
                .map_err(|e| PocoNetError::from_wait(e, "relay connect")),
        }
    }

    /// Close the link. Always ends in `Closed` unless already terminal.
    pub async fn disconnect(&self) -> Result<(), PocoNetError> {
        let inner = &self.inner;
        if inner.status.get().is_terminal() {
            return Ok(());
        }
        if inner.set_status(ConnectionStatus::Closed) {
            inner.events.emit(
                events::DISCONNECTED,
                json!({ "reason": RejectReason::UserClosed.as_str() }),
            );
        }
        inner.teardown(ConnectionStatus::Closed);
        inner.events.run_deferred();
        Ok(())
    }

    /// Send an event frame to the hub. Requires the connection to be
    /// connected.
    pub async fn send(&self, event: &str, args: Value) -> Result<(), PocoNetError> {
        self.inner.send_event(event, args).await
    }

    /// The peer channel toward `remote`, creating and registering it if
    /// none exists. One channel per remote address per relay.
    pub fn peer(&self, remote: Address) -> PeerRelayConnection {
        let shared = {
            let mut peers = lock(&self.inner.peers);
            match peers.get(&remote) {
                Some(shared) => shared.clone(),
                None => {
                    let shared = Arc::new(PeerShared::new(self.inner.local.clone(), remote.clone()));
                    peers.insert(remote, shared.clone());
                    shared
                }
            }
        };
        PeerRelayConnection::from_shared(self.clone(), shared)
    }

    // ── Hooks for the peer channels ──────────────────────────────────

    pub(crate) fn handshake_timeout(&self) -> std::time::Duration {
        self.inner.config.handshake_timeout
    }

    /// Record the reciprocal id before announcing a setup toward `remote`.
    pub(crate) fn begin_handshake(&self, remote: &Address) {
        lock(&self.inner.book).begin(&self.inner.local, remote);
    }

    /// Forget the pair's handshake id and drop the channel from the
    /// registry.
    pub(crate) fn abandon_channel(&self, remote: &Address) {
        lock(&self.inner.book).settle(&self.inner.local, remote);
        lock(&self.inner.peers).remove(remote);
    }

    /// Frame send used by peer channels; requires the relay connected.
    pub(crate) async fn send_peer_frame(&self, event: &str, args: Value) -> Result<(), PocoNetError> {
        self.inner.send_event(event, args).await
    }
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("local", &self.inner.local)
            .field("status", &self.inner.status.get())
            .finish()
    }
}

impl RelayInner {
    /// Advance the status, emitting one `"status"` event per effective
    /// change.
    fn set_status(&self, status: ConnectionStatus) -> bool {
        if !self.status.advance(status) {
            return false;
        }
        self.events.emit(events::STATUS, json!(status.as_str()));
        true
    }

    /// Force `Failed` and tear the link down. Safe to call repeatedly;
    /// only the first effective call emits and closes.
    fn fail(self: &Arc<Self>, reason: &str) {
        if self.set_status(ConnectionStatus::Failed) {
            tracing::warn!(local = %self.local, reason, "relay connection failed");
            self.events.emit(events::ERROR, json!({ "error": reason }));
        }
        self.teardown(ConnectionStatus::Failed);
    }

    /// The hub ended the link cleanly.
    fn close_from_remote(self: &Arc<Self>) {
        if self.set_status(ConnectionStatus::Closed) {
            tracing::info!(local = %self.local, "relay closed the link");
            self.events
                .emit(events::DISCONNECTED, json!({ "reason": "server disconnect" }));
        }
        self.teardown(ConnectionStatus::Closed);
    }

    /// Close the socket exactly once and propagate the ending to every
    /// registered peer channel.
    fn teardown(self: &Arc<Self>, final_status: ConnectionStatus) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(link) = lock(&self.link).take() {
            link.reader.abort();
            link.writer.abort();
        }
        if let Some(waiter) = lock(&self.connect_waiter).take() {
            let _ = waiter.send(Err(PocoNetError::closed("relay link closed during handshake")));
        }
        let channels: Vec<Arc<PeerShared>> = lock(&self.peers).drain().map(|(_, p)| p).collect();
        for channel in channels {
            channel.on_relay_terminal(final_status);
        }
        lock(&self.book).clear();
    }

    // ── Link setup ───────────────────────────────────────────────────

    async fn dial(self: &Arc<Self>) -> Result<(), PocoNetError> {
        let config = &self.config;
        tracing::debug!(local = %self.local, uri = %config.uri, "dialing relay");
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&config.uri))
            .await
            .map_err(|_| PocoNetError::ConnectionTimeout { what: "relay dial".into() })??;
        let _ = stream.set_nodelay(true);

        let framed = LengthDelimitedCodec::builder()
            .max_frame_length(config.max_packet_size)
            .new_framed(stream);
        let (sink, frames) = framed.split();

        let (outbound, outbound_rx) = mpsc::channel::<Bytes>(config.send_queue);
        let (verdict_tx, verdict_rx) = oneshot::channel();
        *lock(&self.connect_waiter) = Some(verdict_tx);

        let writer = tokio::spawn(write_loop(self.clone(), sink, outbound_rx));
        let reader = tokio::spawn(read_loop(self.clone(), frames));
        *lock(&self.link) = Some(Link { outbound: outbound.clone(), reader, writer });

        let auth = EventFrame::new(
            events::CONNECT,
            json!({ "address": self.local, "version": config.version }),
        );
        outbound
            .send(auth.to_packet()?.to_bytes())
            .await
            .map_err(|_| PocoNetError::closed("relay link is down"))?;

        match tokio::time::timeout(config.connect_timeout, verdict_rx).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(_)) => Err(PocoNetError::closed("relay link closed during handshake")),
            Err(_) => {
                lock(&self.connect_waiter).take();
                Err(PocoNetError::ConnectionTimeout { what: "relay auth verdict".into() })
            }
        }
    }

    // ── Sending ──────────────────────────────────────────────────────

    async fn send_event(&self, event: &str, args: Value) -> Result<(), PocoNetError> {
        if self.status.get() != ConnectionStatus::Connected {
            return Err(PocoNetError::closed("relay is not connected"));
        }
        self.queue_frame(EventFrame::new(event, args)).await
    }

    /// Encode and queue one atomic frame; no status requirement (the
    /// auth frame goes out while still connecting).
    async fn queue_frame(&self, frame: EventFrame) -> Result<(), PocoNetError> {
        let packet = frame.to_packet()?;
        if packet.len() > self.config.max_packet_size {
            return Err(PocoNetError::PacketTooLarge {
                size: packet.len(),
                max: self.config.max_packet_size,
            });
        }
        let outbound = lock(&self.link)
            .as_ref()
            .map(|link| link.outbound.clone())
            .ok_or_else(|| PocoNetError::closed("relay link is down"))?;
        outbound
            .send(packet.to_bytes())
            .await
            .map_err(|_| PocoNetError::closed("relay link is down"))
    }

    // ── Inbound routing ──────────────────────────────────────────────

    async fn handle_frame(self: &Arc<Self>, bytes: Bytes) -> Result<(), PocoNetError> {
        let packet = Packet::from_bytes(bytes)?;
        if packet.more_segment() || !packet.no_segment() {
            return Err(PocoNetError::protocol("relay frames must be atomic"));
        }
        let frame = EventFrame::from_packet(&packet)?;
        tracing::trace!(local = %self.local, event = %frame.event, "relay frame");

        match frame.event.as_str() {
            events::CONNECTED => {
                self.set_status(ConnectionStatus::Connected);
                if let Some(waiter) = lock(&self.connect_waiter).take() {
                    let _ = waiter.send(Ok(()));
                }
                tracing::info!(local = %self.local, "relay connected");
                self.events.emit(events::CONNECTED, frame.args);
            }
            events::ERROR => {
                let reason = ErrorPayload::from_value(&frame.args)
                    .map(|p| p.error)
                    .unwrap_or_else(|_| "unspecified error".to_string());
                let rejection = reason
                    .parse::<RejectReason>()
                    .map(PocoNetError::Rejected)
                    .unwrap_or_else(|_| PocoNetError::protocol(reason.clone()));
                if let Some(waiter) = lock(&self.connect_waiter).take() {
                    let _ = waiter.send(Err(rejection));
                }
                self.fail(&reason);
            }
            events::PEER_SETUP => self.handle_peer_setup(&frame.args).await?,
            events::PEER_CONNECTED => self.handle_peer_connected(&frame.args)?,
            events::PEER_DESTROY => self.handle_peer_destroy(&frame.args)?,
            events::PEER_EVENT => self.handle_peer_event(&frame.args)?,
            _ => {
                self.events.emit(&frame.event, frame.args);
            }
        }
        Ok(())
    }

    async fn handle_peer_setup(self: &Arc<Self>, args: &Value) -> Result<(), PocoNetError> {
        let payload = PeerAddressPayload::from_value(events::PEER_SETUP, args)?;
        if payload.to != self.local {
            tracing::debug!(from = %payload.from, to = %payload.to, "peer setup not addressed to us");
            return Ok(());
        }
        let disposition = lock(&self.book).on_setup(&payload.from, &self.local);
        match disposition {
            SetupDisposition::Matched => {
                // Their setup answers ours: confirm, then complete locally.
                self.queue_frame(EventFrame::new(
                    events::PEER_CONNECTED,
                    json!({ "from": self.local, "to": payload.from }),
                ))
                .await?;
                if let Some(channel) = self.peer_shared(&payload.from) {
                    channel.complete_handshake();
                }
            }
            SetupDisposition::Recorded => {
                // The reciprocal id is now in the book, so our answering
                // setup completes via the Matched path on their side.
                if let Some(channel) = self.peer_shared(&payload.from) {
                    if channel.begin_answering() {
                        self.queue_frame(EventFrame::new(
                            events::PEER_SETUP,
                            json!({ "from": self.local, "to": payload.from }),
                        ))
                        .await?;
                        self.spawn_handshake_watchdog(channel);
                    }
                }
            }
        }
        self.events.emit(events::PEER_SETUP, args.clone());
        Ok(())
    }

    fn handle_peer_connected(self: &Arc<Self>, args: &Value) -> Result<(), PocoNetError> {
        let payload = PeerAddressPayload::from_value(events::PEER_CONNECTED, args)?;
        if payload.to != self.local {
            return Ok(());
        }
        lock(&self.book).settle(&self.local, &payload.from);
        if let Some(channel) = self.peer_shared(&payload.from) {
            channel.complete_handshake();
        }
        self.events.emit(events::PEER_CONNECTED, args.clone());
        Ok(())
    }

    fn handle_peer_destroy(self: &Arc<Self>, args: &Value) -> Result<(), PocoNetError> {
        let payload = PeerAddressPayload::from_value(events::PEER_DESTROY, args)?;
        if payload.to != self.local {
            return Ok(());
        }
        lock(&self.book).settle(&self.local, &payload.from);
        if let Some(channel) = lock(&self.peers).remove(&payload.from) {
            channel.on_remote_destroy();
        }
        self.events.emit(events::PEER_DESTROY, args.clone());
        Ok(())
    }

    fn handle_peer_event(self: &Arc<Self>, args: &Value) -> Result<(), PocoNetError> {
        let payload = PeerEventPayload::from_value(args)?;
        if payload.to != self.local {
            return Ok(());
        }
        match self.peer_shared(&payload.from) {
            Some(channel) => channel.dispatch(&payload.event, payload.payload),
            None => {
                tracing::debug!(from = %payload.from, event = %payload.event, "peer event with no registered channel")
            }
        }
        Ok(())
    }

    fn peer_shared(&self, remote: &Address) -> Option<Arc<PeerShared>> {
        lock(&self.peers).get(remote).cloned()
    }

    /// Bound the answering side of a handshake; the initiator's own
    /// timeout covers the other side.
    fn spawn_handshake_watchdog(self: &Arc<Self>, channel: Arc<PeerShared>) {
        let wait = channel.events().once(
            events::CONNECTED,
            OnceOptions::timeout(self.config.handshake_timeout),
        );
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(err) = wait.await {
                tracing::debug!(remote = %channel.remote(), %err, "answering handshake expired");
                lock(&inner.book).settle(&inner.local, channel.remote());
                lock(&inner.peers).remove(channel.remote());
                channel.force_terminal(ConnectionStatus::Failed, "handshake timed out");
            }
        });
    }
}

// ── Link tasks ───────────────────────────────────────────────────────

async fn write_loop(inner: Arc<RelayInner>, mut sink: FrameSink, mut outbound: mpsc::Receiver<Bytes>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(err) = sink.send(frame).await {
            inner.fail(&format!("transport error: {err}"));
            return;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(inner: Arc<RelayInner>, mut frames: FrameStream) {
    while let Some(result) = frames.next().await {
        match result {
            Ok(frame) => {
                if let Err(err) = inner.handle_frame(frame.freeze()).await {
                    tracing::warn!(local = %inner.local, %err, "dropping bad relay frame");
                }
                inner.events.run_deferred();
            }
            Err(err) => {
                inner.fail(&format!("transport error: {err}"));
                inner.events.run_deferred();
                return;
            }
        }
        if inner.torn_down.load(Ordering::SeqCst) {
            return;
        }
    }
    inner.close_from_remote();
    inner.events.run_deferred();
}
