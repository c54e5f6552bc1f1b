// Core modules: cart model, storage, identity, reconcile planning, and errors.
pub mod cart;
pub mod error;
pub mod identity;
pub mod reconcile;
pub mod store;
