//! Purpose: Library crate behind the `cartsync` CLI and tests.
//! Exports: `api` (origins, tabs, query cache, reconciler) and `core` (cart, store, state machine).
//! Role: `core` is synchronous and runtime-free; `api` layers tokio tasks and channels on top.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
//! Invariants: Nothing in the crate logs or formats a raw access token.
pub mod api;
pub mod core;
