//! Direct peer transport negotiated over signaling.
//!
//! A `PeerDirectConnection` drives an external ICE-style transport:
//! descriptions and candidates travel over a signaling channel
//! (normally the peer relay channel), application traffic over the
//! transport's `"poco"` data channel. Messages larger than the channel
//! packet limit are segmented on send and reassembled on receive, so
//! callers never see the limit.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use poco_util::{Callback, DispatchMode, EventDispatcher, OnceOptions, WaitError};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DirectConfig;
use crate::error::PocoNetError;
use crate::ice::{
    ChannelEvent, DataChannel, IceCandidate, IceEvent, IceTransport, SessionDescription,
};
use crate::media::{MediaProgress, MediaTransform};
use crate::packet::{to_packets, Packet, SegmentBuffer};
use crate::peer::PeerRelayConnection;
use crate::status::{ConnectClaim, ConnectionStatus, StatusCell};
use crate::wire::{events, EventFrame};
use crate::{lock, Address, DATA_CHANNEL_LABEL};

/// Channel a direct connection signals its negotiation over.
///
/// [`PeerRelayConnection`] is the normal implementation;
/// `testing::signaling_pair` provides an in-memory one.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    fn remote_address(&self) -> &Address;

    fn status(&self) -> ConnectionStatus;

    async fn connect(&self) -> Result<(), PocoNetError>;

    async fn send(&self, event: &str, payload: Value) -> Result<(), PocoNetError>;

    fn on(&self, event: &str, callback: Callback<Value>, mode: DispatchMode) -> bool;

    fn off(&self, event: &str, callback: &Callback<Value>) -> bool;
}

#[async_trait]
impl SignalingChannel for PeerRelayConnection {
    fn remote_address(&self) -> &Address {
        PeerRelayConnection::remote_address(self)
    }

    fn status(&self) -> ConnectionStatus {
        PeerRelayConnection::status(self)
    }

    async fn connect(&self) -> Result<(), PocoNetError> {
        PeerRelayConnection::connect(self).await
    }

    async fn send(&self, event: &str, payload: Value) -> Result<(), PocoNetError> {
        PeerRelayConnection::send(self, event, payload).await
    }

    fn on(&self, event: &str, callback: Callback<Value>, mode: DispatchMode) -> bool {
        PeerRelayConnection::on(self, event, callback, mode)
    }

    fn off(&self, event: &str, callback: &Callback<Value>) -> bool {
        PeerRelayConnection::off(self, event, callback)
    }
}

/// Parsed signaling traffic, handed from sync listeners to the
/// signaling task.
enum Signal {
    Answer(SessionDescription),
    Candidate(IceCandidate),
    Destroy,
}

/// Direct transport to one peer. Cheap to clone; all clones share one
/// negotiation and channel.
#[derive(Clone)]
pub struct PeerDirectConnection {
    inner: Arc<DirectInner>,
}

struct DirectInner {
    signaling: Arc<dyn SignalingChannel>,
    transport: Arc<dyn IceTransport>,
    config: DirectConfig,
    events: EventDispatcher<Value>,
    status: StatusCell,
    channel: Mutex<Option<Arc<dyn DataChannel>>>,
    assembly: Mutex<SegmentBuffer>,
    /// Serializes multi-packet sends so segment runs stay contiguous.
    send_lock: tokio::sync::Mutex<()>,
    media: Mutex<Option<Arc<dyn MediaTransform>>>,
    pending_candidates: Mutex<Vec<IceCandidate>>,
    remote_description_set: AtomicBool,
    signal_listeners: Mutex<Vec<(String, Callback<Value>)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    cleaned: AtomicBool,
}

impl PeerDirectConnection {
    pub fn new(
        signaling: Arc<dyn SignalingChannel>,
        transport: Arc<dyn IceTransport>,
        config: DirectConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DirectInner {
                signaling,
                transport,
                config,
                events: EventDispatcher::new(),
                status: StatusCell::new(),
                channel: Mutex::new(None),
                assembly: Mutex::new(SegmentBuffer::new()),
                send_lock: tokio::sync::Mutex::new(()),
                media: Mutex::new(None),
                pending_candidates: Mutex::new(Vec::new()),
                remote_description_set: AtomicBool::new(false),
                signal_listeners: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
                cleaned: AtomicBool::new(false),
            }),
        }
    }

    pub fn remote_address(&self) -> &Address {
        self.inner.signaling.remote_address()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.get()
    }

    /// Install the transform applied to every reassembled inbound body.
    pub fn set_media_transform(&self, transform: Arc<dyn MediaTransform>) {
        *lock(&self.inner.media) = Some(transform);
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
    ) -> impl std::future::Future<Output = Result<Value, WaitError>> + Send + 'static {
        self.inner.events.once(event, options)
    }

    /// Negotiate the transport and wait for the data channel to open.
    ///
    /// The side built without a remote offer creates the channel and the
    /// offer; the side built with [`DirectConfig::answering`] answers it.
    /// Joins an in-flight attempt instead of starting a second one.
    pub async fn connect(&self) -> Result<(), PocoNetError> {
        let inner = &self.inner;
        match inner.claim_connect() {
            ConnectClaim::AlreadyConnected => return Ok(()),
            ConnectClaim::Terminal => {
                return Err(PocoNetError::closed("direct connection is terminal"))
            }
            ConnectClaim::Join => return self.join_pending_connect().await,
            ConnectClaim::Proceed => {}
        }

        // Register before starting; the channel can open mid-setup.
        let wait = inner.events.once(
            events::CONNECTED,
            OnceOptions::timeout(inner.config.connect_timeout),
        );
        if let Err(err) = inner.start().await {
            inner.ended(ConnectionStatus::Failed, &err.to_string()).await;
            return Err(err);
        }
        match wait.await {
            Ok(_) => Ok(()),
            Err(err) => {
                let reason = match err {
                    WaitError::Timeout => "negotiation timed out",
                    WaitError::Aborted => "negotiation aborted",
                };
                inner.ended(ConnectionStatus::Failed, reason).await;
                Err(PocoNetError::from_wait(err, "direct connect"))
            }
        }
    }

    async fn join_pending_connect(&self) -> Result<(), PocoNetError> {
        let inner = &self.inner;
        let wait = inner.events.once(
            events::CONNECTED,
            OnceOptions::timeout(inner.config.connect_timeout),
        );
        match inner.status.get() {
            ConnectionStatus::Connected => Ok(()),
            s if s.is_terminal() => Err(PocoNetError::closed("direct connection is terminal")),
            _ => wait
                .await
                .map(|_| ())
                .map_err(|e| PocoNetError::from_wait(e, "direct connect")),
        }
    }

    /// Send an application event over the data channel, segmenting the
    /// encoded message to the configured packet limit.
    pub async fn send(&self, event: &str, payload: Value) -> Result<(), PocoNetError> {
        let inner = &self.inner;
        if inner.status.get() != ConnectionStatus::Connected {
            return Err(PocoNetError::closed("direct connection is not connected"));
        }
        let channel = lock(&inner.channel)
            .clone()
            .ok_or_else(|| PocoNetError::closed("data channel is gone"))?;

        let bytes = EventFrame::new(event, payload).to_bytes()?;
        let packets = to_packets(&bytes, inner.config.max_packet_size)?;

        let _guard = inner.send_lock.lock().await;
        for packet in packets {
            channel.send(packet.to_bytes()).await?;
        }
        Ok(())
    }

    /// Close the connection, telling the remote side first on a
    /// best-effort basis.
    pub async fn disconnect(&self) -> Result<(), PocoNetError> {
        let inner = &self.inner;
        if inner.status.get().is_terminal() {
            return Ok(());
        }
        if inner.signaling.status() == ConnectionStatus::Connected {
            if let Err(err) = inner.signaling.send(events::WEBRTC_DESTROY, json!({})).await {
                tracing::debug!(remote = %inner.signaling.remote_address(), %err, "destroy announcement failed");
            }
        }
        inner.ended(ConnectionStatus::Closed, "user closed").await;
        Ok(())
    }
}

impl fmt::Debug for PeerDirectConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerDirectConnection")
            .field("remote", self.inner.signaling.remote_address())
            .field("status", &self.inner.status.get())
            .finish()
    }
}

impl DirectInner {
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

    /// Wire up signaling and negotiation for whichever role the config
    /// puts us in.
    async fn start(self: &Arc<Self>) -> Result<(), PocoNetError> {
        self.signaling.connect().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.register_signal_listeners(&tx);
        {
            let mut tasks = lock(&self.tasks);
            tasks.push(tokio::spawn(run_signaling(self.clone(), rx)));
            tasks.push(tokio::spawn(drive_transport(self.clone())));
        }

        match self.config.remote_offer.clone() {
            None => {
                // Offering side: the channel exists before negotiation
                // and rides the session the offer establishes.
                let channel = self.transport.open_channel(DATA_CHANNEL_LABEL)?;
                self.adopt_channel(channel);
                let offer = self.transport.create_offer().await?;
                self.transport.set_local_description(offer.clone()).await?;
                self.signaling.send(events::WEBRTC_OFFER, offer.0).await?;
            }
            Some(offer) => {
                self.apply_remote_description(offer).await?;
                let answer = self.transport.create_answer().await?;
                self.transport.set_local_description(answer.clone()).await?;
                self.signaling.send(events::WEBRTC_ANSWER, answer.0).await?;
            }
        }
        Ok(())
    }

    fn register_signal_listeners(self: &Arc<Self>, tx: &mpsc::UnboundedSender<Signal>) {
        let answer_tx = tx.clone();
        self.add_signal_listener(events::WEBRTC_ANSWER, move |args: &Value| {
            let _ = answer_tx.send(Signal::Answer(SessionDescription(args.clone())));
        });
        let candidate_tx = tx.clone();
        self.add_signal_listener(events::WEBRTC_CANDIDATE, move |args: &Value| {
            let _ = candidate_tx.send(Signal::Candidate(IceCandidate(args.clone())));
        });
        let destroy_tx = tx.clone();
        self.add_signal_listener(events::WEBRTC_DESTROY, move |_: &Value| {
            let _ = destroy_tx.send(Signal::Destroy);
        });
    }

    fn add_signal_listener(&self, event: &str, f: impl Fn(&Value) + Send + Sync + 'static) {
        let callback = Callback::new(f);
        self.signaling.on(event, callback.clone(), DispatchMode::Sync);
        lock(&self.signal_listeners).push((event.to_string(), callback));
    }

    /// Apply the remote description and flush candidates that arrived
    /// before it.
    async fn apply_remote_description(
        self: &Arc<Self>,
        description: SessionDescription,
    ) -> Result<(), PocoNetError> {
        self.transport.set_remote_description(description).await?;
        self.remote_description_set.store(true, Ordering::SeqCst);
        let queued: Vec<IceCandidate> = {
            let mut pending = lock(&self.pending_candidates);
            pending.drain(..).collect()
        };
        for candidate in queued {
            if let Err(err) = self.transport.add_ice_candidate(candidate).await {
                tracing::debug!(%err, "queued candidate rejected");
            }
        }
        Ok(())
    }

    /// Take ownership of the `"poco"` channel and start pumping it.
    fn adopt_channel(self: &Arc<Self>, channel: Arc<dyn DataChannel>) {
        {
            let mut slot = lock(&self.channel);
            if slot.is_some() {
                tracing::warn!(label = %channel.label(), "duplicate data channel ignored");
                return;
            }
            *slot = Some(channel.clone());
        }
        lock(&self.tasks).push(tokio::spawn(pump_channel(self.clone(), channel)));
    }

    fn on_ice_state(self: &Arc<Self>, state: crate::ice::IceConnectionState) -> Option<ConnectionStatus> {
        let status = state.as_status();
        tracing::debug!(remote = %self.signaling.remote_address(), ?state, "transport state change");
        match status {
            // The channel opening decides when we are connected.
            ConnectionStatus::New | ConnectionStatus::Connected => None,
            ConnectionStatus::Connecting => {
                self.set_status(ConnectionStatus::Connecting);
                None
            }
            terminal => Some(terminal),
        }
    }

    /// Reassemble, run the media hook, decode, dispatch. Malformed
    /// traffic is logged and dropped; it does not kill the channel.
    fn handle_message(&self, bytes: Bytes) {
        let packet = match Packet::from_bytes(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::warn!(%err, "dropping undecodable packet");
                return;
            }
        };
        let body = {
            let mut assembly = lock(&self.assembly);
            assembly.push(&packet)
        };
        let Some(body) = body else { return };

        let transform = lock(&self.media).clone();
        let body = match transform {
            Some(media) => {
                let mut report = |progress: MediaProgress| {
                    self.events.emit(events::MEDIA_PROGRESS, json!(progress));
                };
                match media.transform(&body, &mut report) {
                    Ok(out) => Bytes::from(out),
                    Err(err) => {
                        tracing::warn!(%err, "media transform rejected a body");
                        return;
                    }
                }
            }
            None => body,
        };

        match EventFrame::from_bytes(&body) {
            Ok(frame) => {
                self.events.emit(&frame.event, frame.args);
            }
            Err(err) => tracing::warn!(%err, "dropping undecodable message"),
        }
    }

    /// Drive the connection to a terminal status and release everything,
    /// both exactly once.
    async fn ended(self: &Arc<Self>, status: ConnectionStatus, reason: &str) {
        debug_assert!(status.is_terminal());
        if self.set_status(status) {
            if status == ConnectionStatus::Failed {
                tracing::warn!(remote = %self.signaling.remote_address(), reason, "direct connection failed");
                self.events.emit(events::ERROR, json!({ "error": reason }));
            } else {
                self.events
                    .emit(events::DISCONNECTED, json!({ "reason": reason }));
            }
        }
        self.cleanup().await;
        self.events.run_deferred();
    }

    async fn cleanup(self: &Arc<Self>) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let listeners: Vec<(String, Callback<Value>)> = {
            let mut registered = lock(&self.signal_listeners);
            registered.drain(..).collect()
        };
        for (event, callback) in listeners {
            self.signaling.off(&event, &callback);
        }
        // Tasks exit through the cancelled token on their own.
        lock(&self.tasks).clear();
        self.transport.close().await;
    }
}

// ── Connection tasks ─────────────────────────────────────────────────

async fn run_signaling(inner: Arc<DirectInner>, mut rx: mpsc::UnboundedReceiver<Signal>) {
    loop {
        let signal = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            signal = rx.recv() => signal,
        };
        let Some(signal) = signal else { return };
        match signal {
            Signal::Answer(description) => {
                if let Err(err) = inner.apply_remote_description(description).await {
                    inner
                        .ended(ConnectionStatus::Failed, &format!("remote description rejected: {err}"))
                        .await;
                    return;
                }
            }
            Signal::Candidate(candidate) => {
                if inner.remote_description_set.load(Ordering::SeqCst) {
                    if let Err(err) = inner.transport.add_ice_candidate(candidate).await {
                        tracing::debug!(%err, "candidate rejected");
                    }
                } else {
                    lock(&inner.pending_candidates).push(candidate);
                }
            }
            Signal::Destroy => {
                inner.ended(ConnectionStatus::Closed, "peer destroy").await;
                return;
            }
        }
        inner.events.run_deferred();
    }
}

async fn drive_transport(inner: Arc<DirectInner>) {
    loop {
        let event = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            event = inner.transport.next_event() => event,
        };
        let Some(event) = event else {
            if !inner.cleaned.load(Ordering::SeqCst) {
                inner.ended(ConnectionStatus::Closed, "transport ended").await;
            }
            return;
        };
        match event {
            IceEvent::StateChange(state) => {
                if let Some(terminal) = inner.on_ice_state(state) {
                    let reason = format!("ice {}", terminal.as_str());
                    inner.ended(terminal, &reason).await;
                    return;
                }
            }
            IceEvent::LocalCandidate(candidate) => {
                // Candidates gathered before the remote description is
                // set ride inside the exchanged descriptions; only the
                // later ones are trickled over signaling.
                if inner.remote_description_set.load(Ordering::SeqCst) {
                    if let Err(err) =
                        inner.signaling.send(events::WEBRTC_CANDIDATE, candidate.0).await
                    {
                        tracing::debug!(%err, "candidate signaling failed");
                    }
                } else {
                    tracing::trace!("local candidate before remote description, not trickled");
                }
            }
            IceEvent::IncomingChannel(channel) => {
                if channel.label() == DATA_CHANNEL_LABEL {
                    inner.adopt_channel(channel);
                } else {
                    tracing::debug!(label = %channel.label(), "ignoring unexpected channel");
                }
            }
        }
        inner.events.run_deferred();
    }
}

async fn pump_channel(inner: Arc<DirectInner>, channel: Arc<dyn DataChannel>) {
    loop {
        let event = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            event = channel.next_event() => event,
        };
        let Some(event) = event else {
            if !inner.cleaned.load(Ordering::SeqCst) {
                inner.ended(ConnectionStatus::Closed, "channel ended").await;
            }
            return;
        };
        match event {
            ChannelEvent::Open => {
                inner
                    .events
                    .emit(events::CHANNEL_OPEN, json!({ "label": channel.label() }));
                if inner.set_status(ConnectionStatus::Connected) {
                    tracing::info!(remote = %inner.signaling.remote_address(), "direct channel open");
                    inner.events.emit(events::CONNECTED, json!({}));
                }
            }
            ChannelEvent::Message(bytes) => inner.handle_message(bytes),
            ChannelEvent::Closed => {
                inner
                    .events
                    .emit(events::CHANNEL_CLOSE, json!({ "label": channel.label() }));
                inner.ended(ConnectionStatus::Closed, "channel closed").await;
                return;
            }
            ChannelEvent::Error(error) => {
                inner
                    .events
                    .emit(events::CHANNEL_ERROR, json!({ "error": error }));
                inner.ended(ConnectionStatus::Failed, &error).await;
                return;
            }
        }
        inner.events.run_deferred();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ice_pair, signaling_pair};

    fn addr(name: &str) -> Address {
        name.parse().unwrap()
    }

    #[tokio::test]
    async fn send_requires_an_open_channel() {
        let (sig, _other) = signaling_pair(addr("alice"), addr("bob"));
        let (ice, _remote) = ice_pair();
        let conn = PeerDirectConnection::new(sig, ice, DirectConfig::new());

        let err = conn.send("ping", json!({ "n": 1 })).await.unwrap_err();
        assert!(matches!(err, PocoNetError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn disconnect_before_connect_is_clean() {
        let (sig, _other) = signaling_pair(addr("alice"), addr("bob"));
        let (ice, _remote) = ice_pair();
        let conn = PeerDirectConnection::new(sig, ice, DirectConfig::new());

        conn.disconnect().await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Closed);
        conn.disconnect().await.unwrap();

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, PocoNetError::ConnectionClosed { .. }));
    }

    #[test]
    fn undecodable_traffic_does_not_change_status() {
        let (sig, _other) = signaling_pair(addr("alice"), addr("bob"));
        let (ice, _remote) = ice_pair();
        let conn = PeerDirectConnection::new(sig, ice, DirectConfig::new());

        conn.inner.handle_message(Bytes::new());
        conn.inner.handle_message(Bytes::from_static(&[0x01, 0xFF, 0xFF]));
        assert_eq!(conn.status(), ConnectionStatus::New);
    }
}
