//! Purpose: Combine the three guest-cart change channels into one signal source.
//! Exports: `GuestChannels`.
//! Role: Owned by the reconciler while in guest mode; dropped on login or shutdown.
//! Invariants: Storage, same-tab, and poll subscriptions are independent; losing one keeps the rest.
//! Invariants: Poll runs at a fixed period with no backoff and first fires one period after subscribe.
//! Invariants: Dropping `GuestChannels` releases all three subscriptions.
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::api::origin::{CartChanged, StorageSubscription, Tab};
use crate::core::reconcile::Signal;

pub struct GuestChannels {
    storage: Option<StorageSubscription>,
    same_tab: Option<broadcast::Receiver<CartChanged>>,
    poll: Interval,
}

enum Closed {
    Storage,
    SameTab,
}

impl GuestChannels {
    pub fn subscribe(tab: &Tab, poll_interval: Duration) -> Self {
        let mut poll = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            storage: tab.subscribe_storage(),
            same_tab: Some(tab.subscribe_same_tab()),
            poll,
        }
    }

    pub fn has_storage_channel(&self) -> bool {
        self.storage.is_some()
    }

    /// Waits for the next signal from any channel.
    pub async fn next(&mut self) -> Signal {
        loop {
            let closed = tokio::select! {
                received = recv_storage(&mut self.storage) => match received {
                    Some(()) => return Signal::StorageChanged,
                    None => Closed::Storage,
                },
                received = recv_same_tab(&mut self.same_tab) => match received {
                    Ok(event) => return Signal::SameTab(event.payload),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "same-tab receiver lagged");
                        return Signal::SameTabLagged;
                    }
                    Err(RecvError::Closed) => Closed::SameTab,
                },
                _ = self.poll.tick() => return Signal::Poll,
            };
            match closed {
                Closed::Storage => {
                    warn!("storage change channel closed; relying on remaining channels");
                    self.storage = None;
                }
                Closed::SameTab => {
                    warn!("same-tab channel closed; relying on remaining channels");
                    self.same_tab = None;
                }
            }
        }
    }
}

async fn recv_storage(storage: &mut Option<StorageSubscription>) -> Option<()> {
    match storage {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_same_tab(
    same_tab: &mut Option<broadcast::Receiver<CartChanged>>,
) -> Result<CartChanged, RecvError> {
    match same_tab {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
