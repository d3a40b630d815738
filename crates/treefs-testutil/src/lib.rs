//! Test utilities for treefs.
//!
//! - [`init_tracing`]: one-time `tracing` subscriber honoring `RUST_LOG`
//! - [`memory_service`] / [`seeded_service`]: services with an in-memory `repo` filesystem
//! - [`ContendedStore`]: an object store that loses head races or fails writes on demand
//! - [`EventCollector`]: a watch handler that records events

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;
use treefs_kernel::store::{Commit, MemoryStore, Object, ObjectId, ObjectStore, ObjectStoreExt, Signature};
use treefs_kernel::{FileSystemConfig, IoService, ServiceConfig, WatchHandler};
use treefs_types::{FsError, FsPath, FsResult, WatchContext};

/// Id of the filesystem created by [`memory_service`].
pub const REPO: &str = "repo";

static TRACING: Once = Once::new();

/// Install a test-writer fmt subscriber once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Service without the host mount, with an empty in-memory `repo`.
pub fn memory_service() -> IoService {
    memory_service_with(ServiceConfig::transient())
}

pub fn memory_service_with(config: ServiceConfig) -> IoService {
    init_tracing();
    let service = IoService::new(config).unwrap();
    service
        .new_file_system(&format!("git://{REPO}"), FileSystemConfig::memory())
        .unwrap();
    service
}

/// `repo` path on the default segment.
pub fn repo_path(key: &str) -> FsPath {
    FsPath::object(REPO, "master", key).unwrap()
}

/// [`memory_service`] with `(key, content)` files written one commit each.
pub async fn seeded_service(files: &[(&str, &str)]) -> IoService {
    let service = memory_service();
    for (key, content) in files {
        service.write_string(&repo_path(key), content, &[]).await.unwrap();
    }
    service
}

/// Memory store with injected faults.
///
/// `lose_next_races(n)` makes the next `n` head updates lose to an
/// interloping commit that lands first. `fail_next_puts(n)` makes the
/// next `n` object writes fail with `IoFailure`.
#[derive(Debug, Default)]
pub struct ContendedStore {
    inner: MemoryStore,
    races_to_lose: AtomicU32,
    puts_to_fail: AtomicU32,
    interlopers: AtomicU32,
}

impl ContendedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lose_next_races(&self, n: u32) {
        self.races_to_lose.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_puts(&self, n: u32) {
        self.puts_to_fail.store(n, Ordering::SeqCst);
    }

    /// Commits slipped in ahead of a caller so far.
    pub fn interloper_count(&self) -> u32 {
        self.interlopers.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Advance `segment` with an empty-change commit, as a competing writer would.
    fn interlope(&self, segment: &str) -> FsResult<()> {
        let Some(head) = self.inner.head(segment)? else {
            return Ok(());
        };
        let tree = self.inner.commit(&head)?.tree.clone();
        let commit = self.inner.put(&Object::commit(Commit {
            tree,
            parent: Some(head.clone()),
            author: Signature {
                name: "interloper".to_string(),
                email: "interloper@test".to_string(),
                when: Utc::now().fixed_offset(),
            },
            message: "interloper".to_string(),
        }))?;
        self.inner.compare_and_swap_head(segment, Some(&head), &commit)?;
        self.interlopers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl ObjectStore for ContendedStore {
    fn put(&self, object: &Object) -> FsResult<ObjectId> {
        if Self::take(&self.puts_to_fail) {
            return Err(FsError::io("injected write failure"));
        }
        self.inner.put(object)
    }

    fn get(&self, id: &ObjectId) -> FsResult<Option<Object>> {
        self.inner.get(id)
    }

    fn head(&self, segment: &str) -> FsResult<Option<ObjectId>> {
        self.inner.head(segment)
    }

    fn compare_and_swap_head(&self, segment: &str, expected: Option<&ObjectId>, new: &ObjectId) -> FsResult<bool> {
        if expected.is_some() && Self::take(&self.races_to_lose) {
            self.interlope(segment)?;
        }
        self.inner.compare_and_swap_head(segment, expected, new)
    }

    fn segments(&self) -> FsResult<Vec<String>> {
        self.inner.segments()
    }
}

/// Watch handler that records every event it receives.
#[derive(Debug, Default)]
pub struct EventCollector {
    events: Mutex<Vec<WatchContext>>,
    notify: Notify,
}

impl EventCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of events so far, in delivery order.
    pub fn events(&self) -> Vec<WatchContext> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` events arrived, or `timeout` passes.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<WatchContext> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.len() >= count {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }
        self.events()
    }
}

#[async_trait]
impl WatchHandler for EventCollector {
    async fn handle(&self, event: WatchContext) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
        self.notify.notify_waiters();
    }
}
