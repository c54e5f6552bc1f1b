//! Purpose: Cached, deduplicated access to each shopper's server cart.
//! Exports: `RemoteCartQuery`, `RemoteCartSource`, `RemoteCart`, `QueryState`, `QueryOptions`, `FetchFuture`.
//! Role: Shared by every reconciler in the process; one entry per identity.
//! Invariants: At most one fetch per identity is in flight; other observers share its result.
//! Invariants: Fresh entries (younger than `stale_time`) are served without fetching.
//! Invariants: Stale entries keep serving old data while a background refetch runs.
//! Invariants: Results from fetches superseded by `invalidate` are discarded.
//! Invariants: A failed fetch keeps the last good data; the error lives in `QueryState::error`.
//! Notes: Nothing here refetches on focus or on a timer; mutations call `invalidate`.
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::identity::{Identity, IdentityKey, token_fingerprint};

pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(5 * 60);

pub type FetchFuture = Pin<Box<dyn Future<Output = Result<RemoteCart, Error>> + Send + 'static>>;

/// Where server carts come from.
pub trait RemoteCartSource: Send + Sync + 'static {
    fn fetch(&self, access_token: &str) -> FetchFuture;
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCart {
    pub total_items: u64,
    #[serde(default)]
    pub items: Vec<Value>,
}

#[derive(Clone, Debug, Default)]
pub struct QueryState {
    pub data: Option<RemoteCart>,
    pub error: Option<Arc<Error>>,
    pub fetching: bool,
    pub updated_at: Option<Instant>,
}

impl QueryState {
    /// Last known server total, or 0 if the query never resolved.
    pub fn total_items(&self) -> u64 {
        self.data.as_ref().map_or(0, |cart| cart.total_items)
    }

    /// True once a first fetch finished, successfully or not.
    pub fn is_settled(&self) -> bool {
        !self.fetching && (self.data.is_some() || self.error.is_some())
    }
}

#[derive(Clone, Debug)]
pub struct QueryOptions {
    pub stale_time: Duration,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self {
            stale_time: DEFAULT_STALE_TIME,
        }
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct RemoteCartQuery {
    inner: Arc<QueryInner>,
}

struct QueryInner {
    source: Arc<dyn RemoteCartSource>,
    options: QueryOptions,
    runtime: Handle,
    entries: Mutex<HashMap<IdentityKey, Entry>>,
}

struct Entry {
    state: watch::Sender<QueryState>,
    access_token: String,
    fetched_at: Option<Instant>,
    invalidated: bool,
    generation: u64,
    in_flight: Option<InFlight>,
}

struct InFlight {
    generation: u64,
    task: JoinHandle<()>,
}

impl Entry {
    fn new(access_token: String) -> Self {
        let (state, _) = watch::channel(QueryState::default());
        Self {
            state,
            access_token,
            fetched_at: None,
            invalidated: false,
            generation: 0,
            in_flight: None,
        }
    }

    /// Nobody observes it, nothing is fetching, and its data would be refetched anyway.
    fn is_idle(&self, now: Instant, stale_time: Duration) -> bool {
        if self.state.receiver_count() > 0 || self.in_flight.is_some() {
            return false;
        }
        match self.fetched_at {
            None => true,
            Some(fetched_at) => now.duration_since(fetched_at) >= stale_time,
        }
    }

    fn needs_fetch(&self, now: Instant, stale_time: Duration) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        match self.fetched_at {
            None => true,
            Some(fetched_at) => self.invalidated || now.duration_since(fetched_at) >= stale_time,
        }
    }
}

impl RemoteCartQuery {
    /// Must be called inside a tokio runtime; fetches are spawned on it.
    pub fn new(source: Arc<dyn RemoteCartSource>, options: QueryOptions) -> Result<Self, Error> {
        let runtime = Handle::try_current().map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("remote cart query requires a tokio runtime")
                .with_source(err)
        })?;
        Ok(Self {
            inner: Arc::new(QueryInner {
                source,
                options,
                runtime,
                entries: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn options(&self) -> &QueryOptions {
        &self.inner.options
    }

    /// Subscribes to `identity`'s entry, fetching if it is missing or stale.
    pub fn observe(&self, identity: &Identity) -> watch::Receiver<QueryState> {
        let mut entries = self.inner.lock_entries();
        prune_idle(&mut entries, Instant::now(), self.inner.options.stale_time);
        let entry = entries
            .entry(identity.key().clone())
            .or_insert_with(|| Entry::new(identity.access_token().to_string()));
        entry.access_token = identity.access_token().to_string();
        let rx = entry.state.subscribe();
        if entry.needs_fetch(Instant::now(), self.inner.options.stale_time) {
            self.inner.start_fetch(identity.key(), entry);
        }
        rx
    }

    /// Records a refreshed token for later fetches; never fetches or resubscribes.
    pub fn set_access_token(&self, identity: &Identity) {
        let mut entries = self.inner.lock_entries();
        if let Some(entry) = entries.get_mut(identity.key()) {
            entry.access_token = identity.access_token().to_string();
        }
    }

    /// Current value for `identity`, starting a background refetch when stale.
    pub fn read(&self, identity: &Identity) -> QueryState {
        let rx = self.observe(identity);
        rx.borrow().clone()
    }

    /// Current value without triggering any fetch.
    pub fn state(&self, key: &IdentityKey) -> Option<QueryState> {
        let entries = self.inner.lock_entries();
        entries.get(key).map(|entry| entry.state.borrow().clone())
    }

    pub fn error(&self, key: &IdentityKey) -> Option<Arc<Error>> {
        self.state(key).and_then(|state| state.error)
    }

    /// Forces the next read of `key` to refetch; refetches now if anyone is observing.
    pub fn invalidate(&self, key: &IdentityKey) {
        let mut entries = self.inner.lock_entries();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        entry.invalidated = true;
        if let Some(in_flight) = entry.in_flight.take() {
            debug!(identity = %key, "dropping in-flight cart fetch superseded by invalidation");
            in_flight.task.abort();
            entry.state.send_modify(|state| state.fetching = false);
        }
        if entry.state.receiver_count() > 0 {
            self.inner.start_fetch(key, entry);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_fetching(&self, key: &IdentityKey) -> bool {
        self.inner
            .lock_entries()
            .get(key)
            .is_some_and(|entry| entry.in_flight.is_some())
    }
}

fn prune_idle(entries: &mut HashMap<IdentityKey, Entry>, now: Instant, stale_time: Duration) {
    entries.retain(|key, entry| {
        let idle = entry.is_idle(now, stale_time);
        if idle {
            debug!(identity = %key, "evicting idle remote cart entry");
        }
        !idle
    });
}

impl QueryInner {
    fn lock_entries(&self) -> MutexGuard<'_, HashMap<IdentityKey, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn start_fetch(self: &Arc<Self>, key: &IdentityKey, entry: &mut Entry) {
        entry.generation += 1;
        let generation = entry.generation;
        debug!(
            identity = %key,
            token = %token_fingerprint(&entry.access_token),
            generation,
            "fetching remote cart"
        );
        entry.state.send_modify(|state| state.fetching = true);

        let fetch = self.source.fetch(&entry.access_token);
        let inner = Arc::clone(self);
        let task_key = key.clone();
        let task = self.runtime.spawn(async move {
            let result = fetch.await;
            inner.complete(&task_key, generation, result);
        });
        entry.in_flight = Some(InFlight { generation, task });
    }

    fn complete(&self, key: &IdentityKey, generation: u64, result: Result<RemoteCart, Error>) {
        let mut entries = self.lock_entries();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if entry.in_flight.as_ref().map(|flight| flight.generation) != Some(generation) {
            debug!(identity = %key, generation, "discarding superseded cart fetch result");
            return;
        }
        entry.in_flight = None;
        let now = Instant::now();
        match result {
            Ok(cart) => {
                entry.fetched_at = Some(now);
                entry.invalidated = false;
                entry.state.send_modify(|state| {
                    state.data = Some(cart);
                    state.error = None;
                    state.fetching = false;
                    state.updated_at = Some(now);
                });
            }
            Err(err) => {
                warn!(identity = %key, error = %err, "remote cart fetch failed; keeping last known value");
                entry.state.send_modify(|state| {
                    state.error = Some(Arc::new(err));
                    state.fetching = false;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{QueryOptions, RemoteCartQuery};
    use crate::api::testing::{GatedSource, StaticSource};
    use crate::core::error::ErrorKind;
    use crate::core::identity::Session;
    use std::sync::Arc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(30);

    fn identity(token: &str, user: &str) -> crate::core::identity::Identity {
        Session::authenticated(token, user)
            .identity()
            .expect("identity")
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_observers_share_one_fetch() {
        let source = Arc::new(GatedSource::new());
        let query = RemoteCartQuery::new(source.clone(), QueryOptions::new()).expect("query");
        let user = identity("t", "u1");

        let mut first = query.observe(&user);
        let mut second = query.observe(&user);
        assert_eq!(source.calls(), 1);

        source.resolve_next(Ok(5)).await;
        let state = tokio::time::timeout(WAIT, first.wait_for(|s| s.data.is_some()))
            .await
            .expect("first resolved")
            .expect("open")
            .clone();
        assert_eq!(state.total_items(), 5);
        let state = second.wait_for(|s| s.data.is_some()).await.expect("open");
        assert_eq!(state.total_items(), 5);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_entries_are_served_from_cache() {
        let source = Arc::new(StaticSource::new(3));
        let query = RemoteCartQuery::new(source.clone(), QueryOptions::new()).expect("query");
        let user = identity("t", "u1");

        let mut rx = query.observe(&user);
        rx.wait_for(|s| s.data.is_some()).await.expect("open");
        tokio::time::sleep(Duration::from_secs(4 * 60)).await;

        let state = query.read(&user);
        assert_eq!(state.total_items(), 3);
        assert!(!state.fetching);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_revalidate_in_background() {
        let source = Arc::new(GatedSource::new());
        let query = RemoteCartQuery::new(source.clone(), QueryOptions::new()).expect("query");
        let user = identity("t", "u1");

        let mut rx = query.observe(&user);
        source.resolve_next(Ok(2)).await;
        rx.wait_for(|s| s.data.is_some()).await.expect("open");

        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        let state = query.read(&user);
        assert_eq!(state.total_items(), 2);
        assert!(state.fetching);
        assert_eq!(source.calls(), 2);

        source.resolve_next(Ok(9)).await;
        let state = rx
            .wait_for(|s| s.total_items() == 9)
            .await
            .expect("open")
            .clone();
        assert!(!state.fetching);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_refetches_observed_entry() {
        let source = Arc::new(StaticSource::new(1));
        let query = RemoteCartQuery::new(source.clone(), QueryOptions::new()).expect("query");
        let user = identity("t", "u1");

        let mut rx = query.observe(&user);
        rx.wait_for(|s| s.total_items() == 1).await.expect("open");

        source.set_total(4);
        query.invalidate(user.key());
        let state = tokio::time::timeout(WAIT, rx.wait_for(|s| s.total_items() == 4))
            .await
            .expect("refetched")
            .expect("open")
            .clone();
        assert!(state.error.is_none());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_without_observers_defers_refetch() {
        let source = Arc::new(StaticSource::new(1));
        let query = RemoteCartQuery::new(source.clone(), QueryOptions::new()).expect("query");
        let user = identity("t", "u1");

        {
            let mut rx = query.observe(&user);
            rx.wait_for(|s| s.data.is_some()).await.expect("open");
        }
        query.invalidate(user.key());
        assert_eq!(source.calls(), 1);

        let state = query.read(&user);
        assert!(state.fetching);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_discards_in_flight_result() {
        let source = Arc::new(GatedSource::new());
        let query = RemoteCartQuery::new(source.clone(), QueryOptions::new()).expect("query");
        let user = identity("t", "u1");

        let mut rx = query.observe(&user);
        query.invalidate(user.key());
        assert_eq!(source.calls(), 2);

        // The first gate belongs to the aborted fetch; its result must never land.
        source.resolve_next(Ok(100)).await;
        source.resolve_next(Ok(7)).await;
        let state = tokio::time::timeout(WAIT, rx.wait_for(|s| s.data.is_some()))
            .await
            .expect("resolved")
            .expect("open")
            .clone();
        assert_eq!(state.total_items(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_keeps_last_good_value() {
        let source = Arc::new(GatedSource::new());
        let query = RemoteCartQuery::new(source.clone(), QueryOptions::new()).expect("query");
        let user = identity("t", "u1");

        let mut rx = query.observe(&user);
        source.resolve_next(Ok(6)).await;
        rx.wait_for(|s| s.data.is_some()).await.expect("open");

        query.invalidate(user.key());
        source
            .resolve_next(Err(ErrorKind::Io))
            .await;
        let state = tokio::time::timeout(WAIT, rx.wait_for(|s| s.error.is_some()))
            .await
            .expect("failed")
            .expect("open")
            .clone();
        assert_eq!(state.total_items(), 6);
        assert!(!state.fetching);
        assert_eq!(
            query.error(user.key()).expect("error").kind(),
            ErrorKind::Io
        );
        assert!(!query.is_fetching(user.key()));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_first_fetch_reports_zero() {
        let source = Arc::new(GatedSource::new());
        let query = RemoteCartQuery::new(source.clone(), QueryOptions::new()).expect("query");
        let user = identity("t", "u1");

        let mut rx = query.observe(&user);
        source.resolve_next(Err(ErrorKind::Permission)).await;
        let state = rx.wait_for(|s| s.is_settled()).await.expect("open").clone();
        assert_eq!(state.total_items(), 0);
        assert!(state.data.is_none());

        // No success yet, so the next observer retries.
        let _again = query.observe(&user);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stale_entries_are_evicted() {
        let source = Arc::new(StaticSource::new(2));
        let query = RemoteCartQuery::new(source.clone(), QueryOptions::new()).expect("query");
        let first = identity("t", "u1");
        let second = identity("t", "u2");

        {
            let mut rx = query.observe(&first);
            rx.wait_for(|s| s.data.is_some()).await.expect("open");
        }
        let mut held = query.observe(&second);
        held.wait_for(|s| s.data.is_some()).await.expect("open");

        tokio::time::sleep(Duration::from_secs(4 * 60)).await;
        let _ = query.observe(&identity("t", "u3"));
        assert!(query.state(first.key()).is_some());

        tokio::time::sleep(Duration::from_secs(60)).await;
        let _ = query.observe(&identity("t", "u3"));
        assert!(query.state(first.key()).is_none());
        assert_eq!(query.state(second.key()).expect("observed").total_items(), 2);
    }

    #[test]
    fn new_outside_runtime_is_usage_error() {
        let source = Arc::new(StaticSource::new(0));
        let err = match RemoteCartQuery::new(source, QueryOptions::new()) {
            Ok(_) => panic!("expected error"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
