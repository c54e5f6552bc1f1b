//! Purpose: Run the cart-count reconciler for one tab and publish the count.
//! Exports: `CartCountReconciler`, `ReconcilerDeps`, `ReconcilerOptions`, `ReconcilerSnapshot`,
//!          `DEFAULT_POLL_INTERVAL`.
//! Role: Async driver around `core::reconcile`; owns the guest channels and the query observer.
//! Invariants: Guest channels exist only in guest mode; the query observer only in authenticated mode.
//! Invariants: Leaving a mode tears its subscriptions down before the next mode subscribes.
//! Invariants: The published count is never an error; failures degrade to the last value or 0.
//! Invariants: Shutdown or drop releases every subscription.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use crate::api::bus::GuestChannels;
use crate::api::origin::Tab;
use crate::api::query::{QueryState, RemoteCartQuery};
use crate::core::error::Error;
use crate::core::identity::{Identity, Session};
use crate::core::reconcile::{CartCount, ReconcileState, Signal, SignalAction, Transition};
use crate::core::store::ReadOutcome;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct ReconcilerOptions {
    pub poll_interval: Duration,
}

impl ReconcilerOptions {
    pub fn new() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ReconcilerDeps {
    pub tab: Tab,
    pub session: watch::Receiver<Session>,
    pub query: RemoteCartQuery,
    pub options: ReconcilerOptions,
}

/// Mode-tagged view of the reconciler. `settled` turns true once the active mode has a value.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReconcilerSnapshot {
    pub count: Option<CartCount>,
    pub settled: bool,
}

pub struct CartCountReconciler {
    count: watch::Receiver<u64>,
    snapshot: watch::Receiver<ReconcilerSnapshot>,
    query: RemoteCartQuery,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CartCountReconciler {
    /// Starts the reconciler task on the current tokio runtime.
    pub fn spawn(deps: ReconcilerDeps) -> Self {
        let (count_tx, count) = watch::channel(0);
        let (snapshot_tx, snapshot) = watch::channel(ReconcilerSnapshot::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let query = deps.query.clone();
        let driver = Driver {
            tab: deps.tab,
            session: deps.session,
            query: deps.query,
            options: deps.options,
            state: ReconcileState::new(),
            guest: None,
            remote: None,
            settled: false,
            count_tx,
            snapshot_tx,
        };
        let task = tokio::spawn(driver.run(shutdown_rx));
        Self {
            count,
            snapshot,
            query,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub fn cart_count(&self) -> u64 {
        *self.count.borrow()
    }

    pub fn snapshot(&self) -> ReconcilerSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.count.clone()
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<ReconcilerSnapshot> {
        self.snapshot.clone()
    }

    pub fn stream(&self) -> WatchStream<u64> {
        WatchStream::new(self.count.clone())
    }

    /// Error of the active identity's last fetch, for components that show query health.
    pub fn query_error(&self) -> Option<Arc<Error>> {
        match self.snapshot.borrow().count.as_ref() {
            Some(CartCount::Authenticated { identity, .. }) => self.query.error(identity),
            _ => None,
        }
    }

    /// Waits until the active mode has produced its first value.
    pub async fn settled(&self) -> ReconcilerSnapshot {
        let mut rx = self.snapshot.clone();
        match rx.wait_for(|snapshot| snapshot.settled).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        }
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CartCountReconciler {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct RemoteObserver {
    identity: Identity,
    rx: watch::Receiver<QueryState>,
}

struct Driver {
    tab: Tab,
    session: watch::Receiver<Session>,
    query: RemoteCartQuery,
    options: ReconcilerOptions,
    state: ReconcileState,
    guest: Option<GuestChannels>,
    remote: Option<RemoteObserver>,
    settled: bool,
    count_tx: watch::Sender<u64>,
    snapshot_tx: watch::Sender<ReconcilerSnapshot>,
}

impl Driver {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let session = self.session.borrow_and_update().clone();
        self.on_session(&session);

        let mut session_open = true;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                changed = self.session.changed(), if session_open => {
                    if changed.is_err() {
                        debug!(tab = %self.tab.id(), "session source closed; keeping last mode");
                        session_open = false;
                        continue;
                    }
                    let session = self.session.borrow_and_update().clone();
                    self.on_session(&session);
                }
                signal = next_guest_signal(&mut self.guest) => self.on_signal(signal),
                changed = next_remote_change(&mut self.remote) => {
                    if changed {
                        self.on_remote_changed();
                    }
                }
            }
        }

        self.guest = None;
        self.remote = None;
        debug!(tab = %self.tab.id(), "cart count reconciler stopped");
    }

    fn on_session(&mut self, session: &Session) {
        match self.state.observe_session(session) {
            Transition::Unchanged => self.refresh_token(session),
            Transition::EnteredGuest => {
                self.remote = None;
                let channels = GuestChannels::subscribe(&self.tab, self.options.poll_interval);
                info!(
                    tab = %self.tab.id(),
                    storage_events = channels.has_storage_channel(),
                    "cart count source: guest cart"
                );
                self.guest = Some(channels);
                self.read_local();
                self.settled = true;
            }
            Transition::EnteredAuthenticated(key) => {
                self.guest = None;
                self.remote = None;
                let Some(identity) = session.identity() else {
                    return;
                };
                info!(tab = %self.tab.id(), identity = %key, "cart count source: remote cart");
                let rx = self.query.observe(&identity);
                let current = rx.borrow().clone();
                self.settled = current.is_settled();
                if current.data.is_some() {
                    self.state.apply_remote(&key, current.total_items());
                }
                self.remote = Some(RemoteObserver { identity, rx });
            }
        }
        self.publish();
    }

    /// Same identity with a new token: later refetches must use it.
    /// The existing receiver is kept so a result that already landed is still seen.
    fn refresh_token(&mut self, session: &Session) {
        let Some(identity) = session.identity() else {
            return;
        };
        let Some(remote) = self.remote.as_mut() else {
            return;
        };
        if remote.identity.access_token() == identity.access_token() {
            return;
        }
        debug!(identity = %identity.key(), token = %identity.fingerprint(), "access token refreshed");
        self.query.set_access_token(&identity);
        remote.identity = identity;
    }

    fn on_signal(&mut self, signal: Signal) {
        debug!(tab = %self.tab.id(), ?signal, "guest cart signal");
        match self.state.plan_signal(&signal) {
            SignalAction::Ignore => return,
            SignalAction::Apply(total) => {
                self.state.apply_local(total);
            }
            SignalAction::ReadLocal => self.read_local(),
        }
        self.publish();
    }

    fn on_remote_changed(&mut self) {
        let Some(remote) = self.remote.as_mut() else {
            return;
        };
        let current = remote.rx.borrow_and_update().clone();
        if let Some(err) = &current.error {
            debug!(identity = %remote.identity.key(), error = %err, "remote cart query reported an error");
        }
        if current.data.is_some() {
            let key = remote.identity.key().clone();
            self.state.apply_remote(&key, current.total_items());
        }
        if current.is_settled() {
            self.settled = true;
        }
        self.publish();
    }

    fn read_local(&mut self) {
        let outcome = self.tab.read_cart();
        match &outcome {
            ReadOutcome::Corrupt { reason } => {
                warn!(
                    path = %self.tab.origin().store().path().display(),
                    reason = %reason,
                    "guest cart unreadable; treating as empty"
                );
            }
            ReadOutcome::Loaded(cart) if !cart.is_consistent() => {
                warn!(
                    total_items = cart.total_items,
                    items_sum = cart.items_sum(),
                    "guest cart total disagrees with its items"
                );
            }
            ReadOutcome::Loaded(_) | ReadOutcome::Missing => {}
        }
        self.state.apply_local(outcome.total_items());
    }

    fn publish(&self) {
        let count = self.state.count();
        self.count_tx.send_if_modified(|current| {
            if *current == count {
                return false;
            }
            *current = count;
            true
        });
        let snapshot = ReconcilerSnapshot {
            count: self.state.current().cloned(),
            settled: self.settled,
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}

async fn next_guest_signal(guest: &mut Option<GuestChannels>) -> Signal {
    match guest {
        Some(channels) => channels.next().await,
        None => std::future::pending().await,
    }
}

/// Resolves when the observed query entry changes; `false` if it can no longer change.
async fn next_remote_change(remote: &mut Option<RemoteObserver>) -> bool {
    match remote {
        Some(observer) => match observer.rx.changed().await {
            Ok(()) => true,
            Err(_) => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}
