//! Watch service: change notifications for committed writes.
//!
//! A [`WatchHub`] belongs to one filesystem. Providers call
//! [`WatchHub::publish`] right after a head advances, while still holding the
//! lock that serializes head advances, so every subscriber's queue sees
//! events in commit order. Each subscription drains its own queue on a
//! spawned task, so a slow handler never blocks a writer.
//!
//! Subscription lifecycle:
//!
//! ```text
//! Registered ──task starts──▶ Active ──dispose()──▶ Disposed
//!      └─────────────dispose()───────────────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use treefs_types::{FsError, FsResult, WatchContext};

/// Receives change events.
#[async_trait]
pub trait WatchHandler: Send + Sync {
    async fn handle(&self, event: WatchContext);
}

#[async_trait]
impl<F> WatchHandler for F
where
    F: Fn(WatchContext) + Send + Sync,
{
    async fn handle(&self, event: WatchContext) {
        self(event)
    }
}

/// Lifecycle state of a [`Subscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Registered,
    Active,
    Disposed,
}

const REGISTERED: u8 = 0;
const ACTIVE: u8 = 1;
const DISPOSED: u8 = 2;

struct Subscriber {
    id: u64,
    state: AtomicU8,
    cancel: CancellationToken,
    sender: Mutex<Option<mpsc::UnboundedSender<WatchContext>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    fn state(&self) -> SubscriptionState {
        match self.state.load(Ordering::Acquire) {
            REGISTERED => SubscriptionState::Registered,
            ACTIVE => SubscriptionState::Active,
            _ => SubscriptionState::Disposed,
        }
    }

    /// Stop accepting and delivering events. Returns false if already disposed.
    fn detach(&self) -> bool {
        if self.state.swap(DISPOSED, Ordering::AcqRel) == DISPOSED {
            return false;
        }
        self.cancel.cancel();
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        true
    }

    fn send(&self, event: &WatchContext) {
        let Ok(sender) = self.sender.lock() else {
            return;
        };
        if let Some(tx) = sender.as_ref() {
            // Receiver only goes away after detach.
            let _ = tx.send(event.clone());
        }
    }
}

struct HubInner {
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
    dispose_timeout: Duration,
    disposed: AtomicBool,
}

impl HubInner {
    fn remove(&self, id: u64) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|s| s.id != id);
        }
    }
}

/// Fan-out point for one filesystem's change events.
#[derive(Clone)]
pub struct WatchHub {
    inner: Arc<HubInner>,
}

impl fmt::Debug for WatchHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHub")
            .field("subscribers", &self.subscriber_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl WatchHub {
    pub fn new(dispose_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                dispose_timeout,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a handler. Must be called within a tokio runtime.
    pub fn subscribe(&self, handler: Arc<dyn WatchHandler>) -> FsResult<Subscription> {
        if self.is_disposed() {
            return Err(FsError::unsupported("watch service is disposed"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Arc::new(Subscriber {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(REGISTERED),
            cancel: CancellationToken::new(),
            sender: Mutex::new(Some(tx)),
            task: Mutex::new(None),
        });

        self.inner
            .subscribers
            .lock()
            .map_err(|_| FsError::io("watch hub lock poisoned"))?
            .push(subscriber.clone());

        let task = tokio::spawn(deliver(subscriber.clone(), handler, rx));
        if let Ok(mut slot) = subscriber.task.lock() {
            *slot = Some(task);
        }
        debug!(subscription = subscriber.id, "watch subscription registered");

        Ok(Subscription {
            subscriber,
            hub: Arc::downgrade(&self.inner),
            dispose_timeout: self.inner.dispose_timeout,
        })
    }

    /// Queue events for every live subscriber. Never blocks on handlers.
    pub fn publish(&self, events: &[WatchContext]) {
        if events.is_empty() {
            return;
        }
        let Ok(subscribers) = self.inner.subscribers.lock() else {
            warn!("watch hub lock poisoned, dropping events");
            return;
        };
        for subscriber in subscribers.iter() {
            for event in events {
                subscriber.send(event);
            }
        }
        trace!(events = events.len(), subscribers = subscribers.len(), "published watch events");
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Dispose every subscription and refuse new ones.
    pub async fn dispose_all(&self) {
        self.inner.disposed.store(true, Ordering::Release);
        let subscribers: Vec<_> = match self.inner.subscribers.lock() {
            Ok(mut subscribers) => subscribers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for subscriber in subscribers {
            dispose_subscriber(&subscriber, self.inner.dispose_timeout).await;
        }
    }
}

async fn deliver(
    subscriber: Arc<Subscriber>,
    handler: Arc<dyn WatchHandler>,
    mut rx: mpsc::UnboundedReceiver<WatchContext>,
) {
    let _ = subscriber
        .state
        .compare_exchange(REGISTERED, ACTIVE, Ordering::AcqRel, Ordering::Acquire);
    loop {
        tokio::select! {
            biased;
            _ = subscriber.cancel.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                if subscriber.cancel.is_cancelled() {
                    break;
                }
                handler.handle(event).await;
            }
        }
    }
    trace!(subscription = subscriber.id, "watch delivery task stopped");
}

async fn dispose_subscriber(subscriber: &Subscriber, timeout: Duration) {
    if !subscriber.detach() {
        return;
    }
    let task = subscriber.task.lock().ok().and_then(|mut t| t.take());
    let Some(mut task) = task else {
        return;
    };
    if tokio::time::timeout(timeout, &mut task).await.is_err() {
        warn!(
            subscription = subscriber.id,
            timeout_ms = timeout.as_millis() as u64,
            "watch handler did not finish in time, aborting"
        );
        task.abort();
    }
    debug!(subscription = subscriber.id, "watch subscription disposed");
}

/// Handle to one registered handler.
///
/// Dropping the handle stops delivery without waiting; [`dispose`](Self::dispose)
/// also waits (bounded) for an in-flight handler call to finish.
pub struct Subscription {
    subscriber: Arc<Subscriber>,
    hub: Weak<HubInner>,
    dispose_timeout: Duration,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.subscriber.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.subscriber.id
    }

    pub fn state(&self) -> SubscriptionState {
        self.subscriber.state()
    }

    /// Stop delivery. After this returns no further events reach the handler.
    ///
    /// Idempotent. A handler still running after the configured timeout is
    /// aborted at its next await point.
    pub async fn dispose(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.subscriber.id);
        }
        dispose_subscriber(&self.subscriber, self.dispose_timeout).await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.subscriber.id);
        }
        self.subscriber.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;
    use treefs_types::{FsPath, WatchEventKind};

    fn event(key: &str, session: &str) -> WatchContext {
        WatchContext {
            kind: WatchEventKind::Modified,
            path: FsPath::object("docs", "master", key).unwrap(),
            old_path: None,
            session_id: session.to_string(),
            user: "amy".to_string(),
            message: "edit".to_string(),
        }
    }

    async fn wait_for(seen: &Arc<Mutex<Vec<String>>>, n: usize) {
        for _ in 0..200 {
            if seen.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {n} events");
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let hub = WatchHub::new(Duration::from_millis(100));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = hub
            .subscribe(Arc::new(move |ev: WatchContext| {
                sink.lock().unwrap().push(ev.session_id);
            }))
            .unwrap();

        hub.publish(&[event("/a", "1")]);
        hub.publish(&[event("/b", "2"), event("/c", "2")]);
        hub.publish(&[event("/d", "3")]);
        wait_for(&seen, 4).await;

        assert_eq!(*seen.lock().unwrap(), vec!["1", "2", "2", "3"]);
        assert_eq!(sub.state(), SubscriptionState::Active);
    }

    #[tokio::test]
    async fn test_no_events_after_dispose() {
        let hub = WatchHub::new(Duration::from_millis(100));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = hub
            .subscribe(Arc::new(move |ev: WatchContext| {
                sink.lock().unwrap().push(ev.session_id);
            }))
            .unwrap();

        hub.publish(&[event("/a", "1")]);
        wait_for(&seen, 1).await;

        sub.dispose().await;
        assert_eq!(sub.state(), SubscriptionState::Disposed);
        assert_eq!(hub.subscriber_count(), 0);

        hub.publish(&[event("/b", "2")]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["1"]);

        // Idempotent
        sub.dispose().await;
    }

    struct Stuck {
        entered: Arc<Notify>,
    }

    #[async_trait]
    impl WatchHandler for Stuck {
        async fn handle(&self, _event: WatchContext) {
            self.entered.notify_one();
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn test_dispose_aborts_stuck_handler() {
        let hub = WatchHub::new(Duration::from_millis(20));
        let entered = Arc::new(Notify::new());
        let sub = hub
            .subscribe(Arc::new(Stuck {
                entered: entered.clone(),
            }))
            .unwrap();
        hub.publish(&[event("/a", "1")]);
        entered.notified().await;

        tokio::time::timeout(Duration::from_secs(2), sub.dispose())
            .await
            .expect("dispose must be bounded");
        assert_eq!(sub.state(), SubscriptionState::Disposed);
    }

    #[tokio::test]
    async fn test_dispose_all_refuses_new_subscriptions() {
        let hub = WatchHub::new(Duration::from_millis(50));
        let sub = hub.subscribe(Arc::new(|_ev: WatchContext| {})).unwrap();
        hub.dispose_all().await;
        assert_eq!(sub.state(), SubscriptionState::Disposed);
        let err = hub.subscribe(Arc::new(|_ev: WatchContext| {})).unwrap_err();
        assert_eq!(err.kind(), treefs_types::ErrorKind::UnsupportedOperation);
    }

    #[tokio::test]
    async fn test_drop_detaches() {
        let hub = WatchHub::new(Duration::from_millis(50));
        let sub = hub.subscribe(Arc::new(|_ev: WatchContext| {})).unwrap();
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
