//! Integration tests: two direct connections negotiated over in-memory
//! signaling and transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use poco_net::testing::{ice_pair, signaling_pair, LoopbackIce};
use poco_net::wire::events;
use poco_net::{
    Address, Callback, ConnectionStatus, DirectConfig, DispatchMode, MediaProgress,
    MediaTransform, OnceOptions, PeerDirectConnection, PocoNetError, SessionDescription,
    SignalingChannel, DIRECT_CHANNEL_MTU,
};
use serde_json::{json, Value};
use tokio::sync::oneshot;

fn addr(name: &str) -> Address {
    name.parse().unwrap()
}

fn wait_options() -> OnceOptions {
    OnceOptions::timeout(Duration::from_secs(5))
}

/// Offer on one side, answer with the captured offer on the other, and
/// wait until both report connected.
async fn connected_pair(
    mtu: usize,
) -> (
    PeerDirectConnection,
    PeerDirectConnection,
    Arc<LoopbackIce>,
    Arc<LoopbackIce>,
) {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();

    let (sig_a, sig_b) = signaling_pair(addr("alice"), addr("bob"));
    let (ice_a, ice_b) = ice_pair();

    // Capture the offer the way an application would before answering.
    let (offer_tx, offer_rx) = oneshot::channel();
    let slot = Arc::new(Mutex::new(Some(offer_tx)));
    sig_b.on(
        events::WEBRTC_OFFER,
        Callback::new(move |args: &Value| {
            if let Some(tx) = slot.lock().unwrap().take() {
                let _ = tx.send(args.clone());
            }
        }),
        DispatchMode::Sync,
    );

    let a = PeerDirectConnection::new(
        sig_a,
        ice_a.clone(),
        DirectConfig::new().with_max_packet_size(mtu),
    );
    let a_connect = {
        let a = a.clone();
        tokio::spawn(async move { a.connect().await })
    };

    let offer = tokio::time::timeout(Duration::from_secs(5), offer_rx)
        .await
        .expect("offer timed out")
        .expect("offer sender dropped");
    let b = PeerDirectConnection::new(
        sig_b,
        ice_b.clone(),
        DirectConfig::answering(SessionDescription(offer)).with_max_packet_size(mtu),
    );
    b.connect().await.expect("answering connect");
    a_connect.await.unwrap().expect("offering connect");

    assert_eq!(a.status(), ConnectionStatus::Connected);
    assert_eq!(b.status(), ConnectionStatus::Connected);
    (a, b, ice_a, ice_b)
}

/// Full negotiation, then one message in each direction.
#[tokio::test]
async fn negotiates_and_exchanges_messages() {
    let (a, b, _ice_a, _ice_b) = connected_pair(DIRECT_CHANNEL_MTU).await;

    let at_b = b.once("greeting", wait_options());
    a.send("greeting", json!({ "text": "hello" })).await.unwrap();
    let got = at_b.await.unwrap();
    assert_eq!(got["text"], "hello");

    let at_a = a.once("reply", wait_options());
    b.send("reply", json!({ "text": "hi back" })).await.unwrap();
    let got = at_a.await.unwrap();
    assert_eq!(got["text"], "hi back");
}

/// A message much larger than the packet limit is segmented on send and
/// arrives reassembled, dispatching exactly one event.
#[tokio::test]
async fn large_messages_cross_a_tiny_mtu_intact() {
    let (a, b, _ice_a, _ice_b) = connected_pair(16).await;

    let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let seen = hits.clone();
    b.on(
        "bulk",
        Callback::new(move |_: &Value| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }),
        DispatchMode::Sync,
    );

    let text = "x".repeat(64);
    let at_b = b.once("bulk", wait_options());
    a.send("bulk", json!({ "text": text })).await.unwrap();

    let got = at_b.await.unwrap();
    assert_eq!(got["text"].as_str().unwrap(), text);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
}

/// Only candidates gathered after the remote description is set get
/// trickled. The offerer gathers its candidate before any answer
/// exists, so it stays inside the SDP; the answerer's candidate crosses
/// over signaling and reaches the offerer's transport.
#[tokio::test]
async fn late_candidates_trickle_to_the_offerer() {
    let (_a, _b, ice_a, ice_b) = connected_pair(DIRECT_CHANNEL_MTU).await;

    for _ in 0..100 {
        if ice_a.candidates_added() >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ice_a.candidates_added() >= 1, "b's candidate never reached a");
    assert_eq!(ice_b.candidates_added(), 0, "a's early candidate must not be trickled");
}

/// An installed transform sees every reassembled inbound body and the
/// connection reports progress for it.
#[tokio::test]
async fn media_transform_observes_inbound_bodies() {
    struct Recorder(Mutex<Vec<usize>>);
    impl MediaTransform for Recorder {
        fn transform(
            &self,
            input: &[u8],
            progress: &mut dyn FnMut(MediaProgress),
        ) -> Result<Vec<u8>, PocoNetError> {
            self.0.lock().unwrap().push(input.len());
            progress(MediaProgress { processed: input.len(), total: input.len() });
            Ok(input.to_vec())
        }
    }

    let (a, b, _ice_a, _ice_b) = connected_pair(DIRECT_CHANNEL_MTU).await;
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    b.set_media_transform(recorder.clone());

    let progress_at_b = b.once(events::MEDIA_PROGRESS, wait_options());
    let at_b = b.once("frame", wait_options());
    a.send("frame", json!({ "n": 1 })).await.unwrap();
    at_b.await.unwrap();

    let progress = MediaProgress::from_value(&progress_at_b.await.unwrap()).unwrap();
    let seen = recorder.0.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(progress.processed, seen[0]);
    assert_eq!(progress.total, seen[0]);
}

/// Disconnect tells the other side, which ends terminal with a
/// `"disconnected"` event.
#[tokio::test]
async fn disconnect_propagates_to_the_remote_side() {
    let (a, b, _ice_a, _ice_b) = connected_pair(DIRECT_CHANNEL_MTU).await;

    let b_ended = b.once(events::DISCONNECTED, wait_options());
    a.disconnect().await.unwrap();

    b_ended.await.unwrap();
    assert_eq!(a.status(), ConnectionStatus::Closed);
    assert!(b.status().is_terminal());

    let err = a.send("late", json!({})).await.unwrap_err();
    assert!(matches!(err, PocoNetError::ConnectionClosed { .. }));
}
