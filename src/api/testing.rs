// Scripted remote cart sources shared by unit tests.
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::oneshot;

use crate::api::query::{FetchFuture, RemoteCart, RemoteCartSource};
use crate::core::error::{Error, ErrorKind};

/// Resolves every fetch immediately with the current total.
pub(crate) struct StaticSource {
    total: AtomicU64,
    calls: AtomicUsize,
}

impl StaticSource {
    pub(crate) fn new(total: u64) -> Self {
        Self {
            total: AtomicU64::new(total),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RemoteCartSource for StaticSource {
    fn fetch(&self, _access_token: &str) -> FetchFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        Box::pin(async move {
            Ok(RemoteCart {
                total_items: total,
                items: Vec::new(),
            })
        })
    }
}

/// Each fetch parks until the test resolves it, in call order.
pub(crate) struct GatedSource {
    pending: Mutex<VecDeque<oneshot::Sender<Result<RemoteCart, Error>>>>,
    tokens: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl GatedSource {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            tokens: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn tokens(&self) -> Vec<String> {
        self.tokens.lock().expect("lock").clone()
    }

    /// Resolves the oldest parked fetch with a total or an error kind.
    /// Yields first so a just-spawned driver can park its fetch.
    pub(crate) async fn resolve_next(&self, outcome: Result<u64, ErrorKind>) {
        for _ in 0..16 {
            if !self.pending.lock().expect("lock").is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        self.release_next(outcome);
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    /// Like `resolve_next`, without yielding to the fetch task.
    pub(crate) fn release_next(&self, outcome: Result<u64, ErrorKind>) {
        let sender = self
            .pending
            .lock()
            .expect("lock")
            .pop_front()
            .expect("a parked fetch");
        let result = outcome
            .map(|total| RemoteCart {
                total_items: total,
                items: Vec::new(),
            })
            .map_err(|kind| Error::new(kind).with_message("scripted failure"));
        let _ = sender.send(result);
    }
}

impl RemoteCartSource for GatedSource {
    fn fetch(&self, access_token: &str) -> FetchFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens
            .lock()
            .expect("lock")
            .push(access_token.to_string());
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("lock").push_back(tx);
        Box::pin(async move {
            rx.await.unwrap_or_else(|_| {
                Err(Error::new(ErrorKind::Internal).with_message("fetch abandoned"))
            })
        })
    }
}
