//! Purpose: Model a storage origin (shared directory) and the tabs attached to it.
//! Exports: `Origin`, `Tab`, `TabId`, `CartChanged`, `StorageEvents`, `StorageSubscription`,
//!          `InProcessStorageEvents`, `FsWatchStorageEvents`, `DisabledStorageEvents`.
//! Role: Platform layer under the signal bus; writes here fire storage-change notifications.
//! Invariants: Storage-change delivery is best-effort; consumers must also poll.
//! Invariants: The in-process backend never notifies the writing tab; the fs backend may.
//! Invariants: Dropping a subscription unsubscribes it.
use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::core::cart::LocalCart;
use crate::core::error::{Error, ErrorKind, map_io_error_kind};
use crate::core::store::{LocalCartStore, ReadOutcome};

const SAME_TAB_CAPACITY: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TabId(u64);

impl TabId {
    pub fn random() -> Self {
        static FALLBACK: AtomicU64 = AtomicU64::new(1);
        let mut bytes = [0u8; 8];
        match getrandom::fill(&mut bytes) {
            Ok(()) => Self(u64::from_le_bytes(bytes)),
            Err(_) => {
                let seq = FALLBACK.fetch_add(1, Ordering::Relaxed);
                Self((u64::from(std::process::id()) << 32) ^ seq)
            }
        }
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab-{:016x}", self.0)
    }
}

/// Same-tab "guest cart changed" event with an optional `{ "totalItems": n }` payload.
#[derive(Clone, Debug, PartialEq)]
pub struct CartChanged {
    pub payload: Option<Value>,
}

pub struct StorageSubscription {
    rx: mpsc::Receiver<()>,
    _guard: Option<Box<dyn Any + Send>>,
}

impl StorageSubscription {
    fn new(rx: mpsc::Receiver<()>, guard: Option<Box<dyn Any + Send>>) -> Self {
        Self { rx, _guard: guard }
    }

    /// Next "the guest cart key changed" notification; `None` once the source is gone.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

/// Cross-tab storage-change notifications for one origin.
pub trait StorageEvents: Send + Sync + 'static {
    /// Called after `writer` replaced the guest cart blob.
    fn publish(&self, writer: TabId);

    fn subscribe(&self, store: &LocalCartStore, tab: TabId)
    -> Result<StorageSubscription, Error>;
}

/// Hub for tabs living in one process. Pending notifications coalesce.
#[derive(Default)]
pub struct InProcessStorageEvents {
    subscribers: Mutex<Vec<(TabId, mpsc::Sender<()>)>>,
}

impl InProcessStorageEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tabs currently listening, ignoring subscriptions already dropped.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }
}

impl StorageEvents for InProcessStorageEvents {
    fn publish(&self, writer: TabId) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        subscribers.retain(|(_, tx)| !tx.is_closed());
        for (tab, tx) in subscribers.iter() {
            if *tab == writer {
                continue;
            }
            let _ = tx.try_send(());
        }
    }

    fn subscribe(
        &self,
        _store: &LocalCartStore,
        tab: TabId,
    ) -> Result<StorageSubscription, Error> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push((tab, tx));
        Ok(StorageSubscription::new(rx, None))
    }
}

/// Watches the origin directory so writers in other processes are observed.
#[derive(Default)]
pub struct FsWatchStorageEvents;

impl FsWatchStorageEvents {
    pub fn new() -> Self {
        Self
    }
}

impl StorageEvents for FsWatchStorageEvents {
    fn publish(&self, _writer: TabId) {}

    fn subscribe(
        &self,
        store: &LocalCartStore,
        tab: TabId,
    ) -> Result<StorageSubscription, Error> {
        std::fs::create_dir_all(store.dir()).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message("failed to create origin directory")
                .with_path(store.dir())
                .with_source(err)
        })?;

        let (tx, rx) = mpsc::channel(1);
        let key_path = store.path().to_path_buf();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) if touches_key(&event, &key_path) => {
                    let _ = tx.try_send(());
                }
                Ok(_) => {}
                Err(err) => debug!(%tab, error = %err, "storage watcher error"),
            })
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to create storage watcher")
                    .with_source(err)
            })?;
        watcher
            .watch(store.dir(), RecursiveMode::NonRecursive)
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to watch origin directory")
                    .with_path(store.dir())
                    .with_source(err)
            })?;
        Ok(StorageSubscription::new(rx, Some(Box::new(watcher))))
    }
}

fn touches_key(event: &Event, key_path: &Path) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    let key_name = key_path.file_name();
    event
        .paths
        .iter()
        .any(|path| path.file_name() == key_name)
}

/// A platform without storage-change notifications.
#[derive(Default)]
pub struct DisabledStorageEvents;

impl StorageEvents for DisabledStorageEvents {
    fn publish(&self, _writer: TabId) {}

    fn subscribe(
        &self,
        _store: &LocalCartStore,
        _tab: TabId,
    ) -> Result<StorageSubscription, Error> {
        Err(Error::new(ErrorKind::Io).with_message("storage change notifications unavailable"))
    }
}

#[derive(Clone)]
pub struct Origin {
    inner: Arc<OriginInner>,
}

struct OriginInner {
    store: LocalCartStore,
    events: Arc<dyn StorageEvents>,
}

impl Origin {
    pub fn with_events(dir: impl Into<PathBuf>, events: Arc<dyn StorageEvents>) -> Self {
        Self {
            inner: Arc::new(OriginInner {
                store: LocalCartStore::new(dir),
                events,
            }),
        }
    }

    /// Tabs of this origin live in one process.
    pub fn in_process(dir: impl Into<PathBuf>) -> Self {
        Self::with_events(dir, Arc::new(InProcessStorageEvents::new()))
    }

    /// Tabs may live in other processes sharing the directory.
    pub fn watch_fs(dir: impl Into<PathBuf>) -> Self {
        Self::with_events(dir, Arc::new(FsWatchStorageEvents::new()))
    }

    pub fn store(&self) -> &LocalCartStore {
        &self.inner.store
    }

    pub fn dir(&self) -> &Path {
        self.inner.store.dir()
    }

    pub fn open_tab(&self) -> Tab {
        let (same_tab, _) = broadcast::channel(SAME_TAB_CAPACITY);
        Tab {
            id: TabId::random(),
            origin: self.clone(),
            same_tab,
        }
    }

    pub(crate) fn subscribe_storage(&self, tab: TabId) -> Result<StorageSubscription, Error> {
        self.inner.events.subscribe(&self.inner.store, tab)
    }
}

/// One browsing context attached to an origin. Clones are handles to the same tab.
#[derive(Clone)]
pub struct Tab {
    id: TabId,
    origin: Origin,
    same_tab: broadcast::Sender<CartChanged>,
}

impl Tab {
    pub fn id(&self) -> TabId {
        self.id
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn read_cart(&self) -> ReadOutcome {
        self.origin.store().read()
    }

    /// Replaces the blob; other tabs are notified through the storage channel.
    pub fn write_cart(&self, cart: &LocalCart) -> Result<(), Error> {
        self.origin.store().write(cart)?;
        self.origin.inner.events.publish(self.id);
        Ok(())
    }

    /// Mutates the guest cart and broadcasts on both event channels.
    pub fn update_cart<F>(&self, mutate: F) -> Result<LocalCart, Error>
    where
        F: FnOnce(&mut LocalCart),
    {
        let cart = self.origin.store().update(mutate)?;
        self.origin.inner.events.publish(self.id);
        self.dispatch_cart_changed(Some(json!({ "totalItems": cart.total_items() })));
        Ok(cart)
    }

    /// Writes and notifies only when `mutate` reports a change.
    pub fn update_cart_if<F>(&self, mutate: F) -> Result<Option<LocalCart>, Error>
    where
        F: FnOnce(&mut LocalCart) -> bool,
    {
        let Some(cart) = self.origin.store().update_if(mutate)? else {
            return Ok(None);
        };
        self.origin.inner.events.publish(self.id);
        self.dispatch_cart_changed(Some(json!({ "totalItems": cart.total_items() })));
        Ok(Some(cart))
    }

    pub fn clear_cart(&self) -> Result<(), Error> {
        self.origin.store().clear()?;
        self.origin.inner.events.publish(self.id);
        self.dispatch_cart_changed(Some(json!({ "totalItems": 0 })));
        Ok(())
    }

    /// Same-tab custom event. Does nothing when no reconciler listens.
    pub fn dispatch_cart_changed(&self, payload: Option<Value>) {
        if self.same_tab.send(CartChanged { payload }).is_err() {
            debug!(tab = %self.id, "cart change dispatched with no listeners");
        }
    }

    pub fn subscribe_same_tab(&self) -> broadcast::Receiver<CartChanged> {
        self.same_tab.subscribe()
    }

    pub(crate) fn subscribe_storage(&self) -> Option<StorageSubscription> {
        match self.origin.subscribe_storage(self.id) {
            Ok(subscription) => Some(subscription),
            Err(err) => {
                warn!(tab = %self.id, error = %err, "storage change channel unavailable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CartChanged, DisabledStorageEvents, InProcessStorageEvents, Origin, TabId};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn tab_ids_are_distinct() {
        assert_ne!(TabId::random(), TabId::random());
    }

    #[tokio::test]
    async fn in_process_events_skip_the_writer() {
        let temp = tempfile::tempdir().expect("tempdir");
        let origin = Origin::in_process(temp.path());
        let writer = origin.open_tab();
        let reader = origin.open_tab();
        let mut writer_sub = writer.subscribe_storage().expect("writer sub");
        let mut reader_sub = reader.subscribe_storage().expect("reader sub");

        writer.update_cart(|cart| cart.add("p1", 1)).expect("update");

        let received = tokio::time::timeout(Duration::from_secs(1), reader_sub.recv())
            .await
            .expect("reader notified");
        assert_eq!(received, Some(()));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), writer_sub.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn in_process_notifications_coalesce() {
        let temp = tempfile::tempdir().expect("tempdir");
        let origin = Origin::in_process(temp.path());
        let writer = origin.open_tab();
        let reader = origin.open_tab();
        let mut sub = reader.subscribe_storage().expect("sub");

        for _ in 0..5 {
            writer.update_cart(|cart| cart.add("p1", 1)).expect("update");
        }
        assert_eq!(sub.recv().await, Some(()));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), sub.recv())
                .await
                .is_err()
        );
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let temp = tempfile::tempdir().expect("tempdir");
        let events = Arc::new(InProcessStorageEvents::new());
        let origin = Origin::with_events(temp.path(), events.clone());
        let writer = origin.open_tab();
        let reader = origin.open_tab();
        drop(reader.subscribe_storage().expect("sub"));
        writer.update_cart(|cart| cart.add("p1", 1)).expect("update");
        let subscribers = events.subscribers.lock().expect("lock");
        assert!(subscribers.is_empty());
    }

    #[test]
    fn disabled_backend_reports_unavailable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let origin = Origin::with_events(temp.path(), Arc::new(DisabledStorageEvents));
        assert!(origin.open_tab().subscribe_storage().is_none());
    }

    #[test]
    fn update_dispatches_same_tab_total() {
        let temp = tempfile::tempdir().expect("tempdir");
        let origin = Origin::in_process(temp.path());
        let tab = origin.open_tab();
        let mut rx = tab.subscribe_same_tab();
        tab.update_cart(|cart| cart.add("p1", 3)).expect("update");
        assert_eq!(
            rx.try_recv().expect("event"),
            CartChanged {
                payload: Some(json!({"totalItems": 3}))
            }
        );
        tab.clear_cart().expect("clear");
        assert_eq!(
            rx.try_recv().expect("event").payload,
            Some(json!({"totalItems": 0}))
        );
    }

    #[tokio::test]
    async fn unchanged_update_notifies_nobody() {
        let temp = tempfile::tempdir().expect("tempdir");
        let origin = Origin::in_process(temp.path());
        let writer = origin.open_tab();
        let reader = origin.open_tab();
        let mut storage = reader.subscribe_storage().expect("sub");
        let mut same_tab = writer.subscribe_same_tab();

        let updated = writer
            .update_cart_if(|cart| cart.remove("p1"))
            .expect("update");
        assert!(updated.is_none());
        assert!(same_tab.try_recv().is_err());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), storage.recv())
                .await
                .is_err()
        );
        assert!(!origin.store().path().exists());
    }
}
