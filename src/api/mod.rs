//! Purpose: Define the public Rust API boundary for cartsync.
//! Exports: Origins and tabs, the remote cart query, the HTTP source, and the reconciler.
//! Role: Public, additive-only surface; the pure state machine lives in `core`.
//! Invariants: Consumers read the cart count only through `CartCountReconciler`.
//! Invariants: Internal channel plumbing (`bus`) is not exposed.

mod bus;
mod origin;
mod query;
mod reconciler;
mod remote;
#[cfg(test)]
mod testing;

pub use crate::core::cart::{CartItem, LocalCart};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::identity::{Identity, IdentityKey, Session, token_fingerprint};
pub use crate::core::reconcile::CartCount;
pub use crate::core::store::{GUEST_CART_KEY, LocalCartStore, ReadOutcome};
pub use origin::{
    CartChanged, DisabledStorageEvents, FsWatchStorageEvents, InProcessStorageEvents, Origin,
    StorageEvents, StorageSubscription, Tab, TabId,
};
pub use query::{
    DEFAULT_STALE_TIME, FetchFuture, QueryOptions, QueryState, RemoteCart, RemoteCartQuery,
    RemoteCartSource,
};
pub use reconciler::{
    CartCountReconciler, DEFAULT_POLL_INTERVAL, ReconcilerDeps, ReconcilerOptions,
    ReconcilerSnapshot,
};
pub use remote::{DEFAULT_REQUEST_TIMEOUT, HttpCartSource};
