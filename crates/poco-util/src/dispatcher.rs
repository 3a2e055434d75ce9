//! String-keyed event dispatch.
//!
//! The dispatcher is the listener table behind every poco connection type.
//! Listeners are `(callback, mode)` pairs per event name; one-shot waiters
//! are futures resolved by the next emission, bounded by an optional
//! deadline and an optional abort signal.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::defer::DeferQueue;
use crate::lock;

// ── Callback identity ────────────────────────────────────────────────

/// Shared listener handle.
///
/// Identity is the allocation, not the code: clones of one `Callback`
/// compare equal, while two closures built from identical source text are
/// distinct. Duplicate detection in [`EventDispatcher::on`] relies on this.
pub struct Callback<P>(Arc<dyn Fn(&P) + Send + Sync>);

impl<P> Callback<P> {
    pub fn new(f: impl Fn(&P) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Pointer identity.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn call(&self, payload: &P) {
        (self.0)(payload)
    }
}

impl<P> Clone for Callback<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<P> fmt::Debug for Callback<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:p})", Arc::as_ptr(&self.0))
    }
}

/// How a listener runs when its event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Inline inside `emit`, in registration order.
    Sync,
    /// Queued; runs at the owner's next [`EventDispatcher::run_deferred`].
    Deferred,
}

// ── One-shot waits ───────────────────────────────────────────────────

/// Why a one-shot wait ended without a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("wait timed out")]
    Timeout,
    #[error("wait aborted")]
    Aborted,
}

/// Options for [`EventDispatcher::once`].
#[derive(Debug, Clone, Default)]
pub struct OnceOptions {
    pub timeout: Option<Duration>,
    pub signal: Option<CancellationToken>,
}

impl OnceOptions {
    /// Wait bounded by `deadline`.
    pub fn timeout(deadline: Duration) -> Self {
        Self { timeout: Some(deadline), signal: None }
    }

    /// Attach an abort signal; cancelling it resolves the wait with
    /// [`WaitError::Aborted`].
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

struct OnceWaiter<P> {
    tx: oneshot::Sender<P>,
    signal: Option<CancellationToken>,
}

// ── Dispatcher ───────────────────────────────────────────────────────

struct Entry<P> {
    callback: Callback<P>,
    mode: DispatchMode,
}

impl<P> Clone for Entry<P> {
    fn clone(&self) -> Self {
        Self { callback: self.callback.clone(), mode: self.mode }
    }
}

struct Inner<P> {
    listeners: HashMap<String, Vec<Entry<P>>>,
    waiters: HashMap<String, Vec<OnceWaiter<P>>>,
}

/// String-keyed pub/sub with sync and deferred dispatch.
///
/// All methods take `&self`; the dispatcher is safe to share behind an
/// `Arc` and to call from any task. The internal lock is never held while
/// a listener runs.
pub struct EventDispatcher<P> {
    inner: Mutex<Inner<P>>,
    defer: DeferQueue,
}

impl<P> Default for EventDispatcher<P> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner { listeners: HashMap::new(), waiters: HashMap::new() }),
            defer: DeferQueue::new(),
        }
    }
}

impl<P: Clone + Send + 'static> fmt::Debug for EventDispatcher<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listener_count(None))
            .field("deferred", &self.defer.len())
            .finish()
    }
}

impl<P: Clone + Send + 'static> EventDispatcher<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `event`. Returns false (and changes
    /// nothing) if the same `(callback, mode)` pair is already registered.
    pub fn on(&self, event: &str, callback: Callback<P>, mode: DispatchMode) -> bool {
        let mut inner = lock(&self.inner);
        let entries = inner.listeners.entry(event.to_string()).or_default();
        if entries.iter().any(|e| e.callback.same(&callback) && e.mode == mode) {
            return false;
        }
        entries.push(Entry { callback, mode });
        true
    }

    /// Remove every registration of `callback` for `event`, in any mode.
    /// Returns whether anything was removed.
    pub fn off(&self, event: &str, callback: &Callback<P>) -> bool {
        let mut inner = lock(&self.inner);
        let Some(entries) = inner.listeners.get_mut(event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| !e.callback.same(callback));
        let removed = entries.len() != before;
        if entries.is_empty() {
            inner.listeners.remove(event);
        }
        removed
    }

    /// Wait for the next emission of `event`.
    ///
    /// Registration is eager: it happens during this call, so an emission
    /// between calling `once` and awaiting the returned future is not
    /// lost. Whichever of emission, timeout, or abort fires first wins;
    /// the losers leave no observable side effect. A signal that is
    /// already cancelled resolves `Err(Aborted)` immediately.
    pub fn once(
        &self,
        event: &str,
        options: OnceOptions,
    ) -> impl Future<Output = Result<P, WaitError>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = lock(&self.inner);
            inner
                .waiters
                .entry(event.to_string())
                .or_default()
                .push(OnceWaiter { tx, signal: options.signal.clone() });
        }
        let OnceOptions { timeout, signal } = options;
        async move {
            let deadline = async {
                match timeout {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending().await,
                }
            };
            let aborted = async {
                match signal {
                    Some(token) => token.cancelled_owned().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                res = rx => res.map_err(|_| WaitError::Aborted),
                _ = deadline => Err(WaitError::Timeout),
                _ = aborted => Err(WaitError::Aborted),
            }
        }
    }

    /// Emit `event` with `payload`.
    ///
    /// Runs sync listeners inline in registration order, queues deferred
    /// listeners, and resolves every pending one-shot waiter for the
    /// event. The listener list is snapshotted first; registrations made
    /// by running listeners affect later emissions only. Returns how many
    /// listeners and waiters were notified.
    pub fn emit(&self, event: &str, payload: P) -> usize {
        let (entries, waiters) = {
            let mut inner = lock(&self.inner);
            let entries = inner.listeners.get(event).cloned().unwrap_or_default();
            let waiters = inner.waiters.remove(event).unwrap_or_default();
            (entries, waiters)
        };

        let mut notified = 0;
        for entry in &entries {
            match entry.mode {
                DispatchMode::Sync => entry.callback.call(&payload),
                DispatchMode::Deferred => {
                    let callback = entry.callback.clone();
                    let payload = payload.clone();
                    self.defer.push(move || callback.call(&payload));
                }
            }
            notified += 1;
        }
        for waiter in waiters {
            // An aborted waiter resolves on its own; dropping the sender
            // here must not hand it a payload instead.
            if waiter.signal.as_ref().is_some_and(|s| s.is_cancelled()) {
                continue;
            }
            if waiter.tx.send(payload.clone()).is_ok() {
                notified += 1;
            }
        }
        notified
    }

    /// Drain the deferred queue; see [`DeferQueue::run`].
    pub fn run_deferred(&self) -> usize {
        self.defer.run()
    }

    pub fn deferred_len(&self) -> usize {
        self.defer.len()
    }

    /// Number of persistent listeners, for one event or across all.
    pub fn listener_count(&self, event: Option<&str>) -> usize {
        let inner = lock(&self.inner);
        match event {
            Some(name) => inner.listeners.get(name).map_or(0, Vec::len),
            None => inner.listeners.values().map(Vec::len).sum(),
        }
    }

    /// Event names with at least one persistent listener.
    pub fn event_names(&self) -> Vec<String> {
        lock(&self.inner).listeners.keys().cloned().collect()
    }

    /// Drop listeners and pending waiters, for one event or across all.
    /// Dropped waiters resolve with [`WaitError::Aborted`].
    pub fn clear(&self, event: Option<&str>) {
        let mut inner = lock(&self.inner);
        match event {
            Some(name) => {
                inner.listeners.remove(name);
                inner.waiters.remove(name);
            }
            None => {
                inner.listeners.clear();
                inner.waiters.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_callback(hits: &Arc<AtomicUsize>) -> Callback<u32> {
        let hits = hits.clone();
        Callback::new(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    // ── Registration ─────────────────────────────────────────────────

    #[test]
    fn duplicate_registration_is_rejected() {
        let dispatcher = EventDispatcher::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let cb = counter_callback(&hits);

        assert!(dispatcher.on("tick", cb.clone(), DispatchMode::Sync));
        assert!(!dispatcher.on("tick", cb.clone(), DispatchMode::Sync));
        assert_eq!(dispatcher.listener_count(Some("tick")), 1);

        // Same callback in the other mode is a distinct pair.
        assert!(dispatcher.on("tick", cb, DispatchMode::Deferred));
        assert_eq!(dispatcher.listener_count(Some("tick")), 2);
    }

    #[test]
    fn distinct_closures_are_distinct_identities() {
        let dispatcher = EventDispatcher::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        assert!(dispatcher.on("tick", counter_callback(&hits), DispatchMode::Sync));
        assert!(dispatcher.on("tick", counter_callback(&hits), DispatchMode::Sync));

        dispatcher.emit("tick", 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn off_removes_all_modes_of_a_callback() {
        let dispatcher = EventDispatcher::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let cb = counter_callback(&hits);

        dispatcher.on("tick", cb.clone(), DispatchMode::Sync);
        dispatcher.on("tick", cb.clone(), DispatchMode::Deferred);
        assert!(dispatcher.off("tick", &cb));
        assert!(!dispatcher.off("tick", &cb));
        assert_eq!(dispatcher.listener_count(Some("tick")), 0);
        assert!(dispatcher.event_names().is_empty());
    }

    // ── Emission ─────────────────────────────────────────────────────

    #[test]
    fn sync_listeners_run_in_registration_order() {
        let dispatcher = EventDispatcher::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3u8 {
            let seen = seen.clone();
            dispatcher.on(
                "tick",
                Callback::new(move |p: &u32| seen.lock().unwrap().push((i, *p))),
                DispatchMode::Sync,
            );
        }
        dispatcher.emit("tick", 7);
        assert_eq!(*seen.lock().unwrap(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn emission_snapshots_the_listener_list() {
        let dispatcher = Arc::new(EventDispatcher::<u32>::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let d = dispatcher.clone();
        let h = hits.clone();
        dispatcher.on(
            "tick",
            Callback::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                let h2 = h.clone();
                d.on(
                    "tick",
                    Callback::new(move |_| {
                        h2.fetch_add(1, Ordering::SeqCst);
                    }),
                    DispatchMode::Sync,
                );
            }),
            DispatchMode::Sync,
        );

        dispatcher.emit("tick", 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // The listener added mid-emission fires from the next emission on.
        dispatcher.emit("tick", 0);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn deferred_listeners_wait_for_the_drain() {
        let dispatcher = EventDispatcher::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.on("tick", counter_callback(&hits), DispatchMode::Deferred);

        dispatcher.emit("tick", 1);
        dispatcher.emit("tick", 2);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.deferred_len(), 2);

        assert_eq!(dispatcher.run_deferred(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn emit_counts_listeners_and_waiters() {
        let dispatcher = EventDispatcher::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.on("tick", counter_callback(&hits), DispatchMode::Sync);
        assert_eq!(dispatcher.emit("tick", 1), 1);
        assert_eq!(dispatcher.emit("other", 1), 0);
    }

    // ── One-shot waits ───────────────────────────────────────────────

    #[tokio::test]
    async fn once_resolves_with_the_emitted_payload() {
        let dispatcher = Arc::new(EventDispatcher::<u32>::new());
        let wait = dispatcher.once("tick", OnceOptions::default());
        dispatcher.emit("tick", 42);
        assert_eq!(wait.await, Ok(42));
    }

    #[tokio::test]
    async fn once_registration_is_eager() {
        let dispatcher = Arc::new(EventDispatcher::<u32>::new());
        // Emit after `once` returns but before the future is awaited.
        let wait = dispatcher.once("tick", OnceOptions::default());
        dispatcher.emit("tick", 9);
        let got = tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .unwrap();
        assert_eq!(got, Ok(9));
    }

    #[tokio::test(start_paused = true)]
    async fn once_times_out_without_an_emission() {
        let dispatcher = EventDispatcher::<u32>::new();
        let wait = dispatcher.once("tick", OnceOptions::timeout(Duration::from_secs(5)));
        assert_eq!(wait.await, Err(WaitError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn emission_before_the_deadline_wins() {
        let dispatcher = Arc::new(EventDispatcher::<u32>::new());
        let wait = dispatcher.once("tick", OnceOptions::timeout(Duration::from_secs(5)));

        let d = dispatcher.clone();
        let emitter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            d.emit("tick", 5);
        });

        assert_eq!(wait.await, Ok(5));
        emitter.await.unwrap();
    }

    #[tokio::test]
    async fn abort_signal_rejects_the_wait() {
        let dispatcher = EventDispatcher::<u32>::new();
        let signal = CancellationToken::new();
        let wait = dispatcher.once(
            "tick",
            OnceOptions::default().with_signal(signal.clone()),
        );
        signal.cancel();
        assert_eq!(wait.await, Err(WaitError::Aborted));
    }

    #[tokio::test]
    async fn already_cancelled_signal_rejects_immediately() {
        let dispatcher = EventDispatcher::<u32>::new();
        let signal = CancellationToken::new();
        signal.cancel();
        let wait = dispatcher.once(
            "tick",
            OnceOptions::default().with_signal(signal),
        );
        assert_eq!(wait.await, Err(WaitError::Aborted));
    }

    #[tokio::test]
    async fn every_waiter_sees_the_emission() {
        let dispatcher = Arc::new(EventDispatcher::<u32>::new());
        let a = dispatcher.once("tick", OnceOptions::default());
        let b = dispatcher.once("tick", OnceOptions::default());
        dispatcher.emit("tick", 3);
        assert_eq!(a.await, Ok(3));
        assert_eq!(b.await, Ok(3));

        // Waiters are consumed; a second emission finds none.
        assert_eq!(dispatcher.emit("tick", 4), 0);
    }

    #[tokio::test]
    async fn clear_aborts_pending_waiters() {
        let dispatcher = EventDispatcher::<u32>::new();
        let wait = dispatcher.once("tick", OnceOptions::default());
        dispatcher.clear(Some("tick"));
        assert_eq!(wait.await, Err(WaitError::Aborted));
    }
}
