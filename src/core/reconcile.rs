//! Purpose: Decide which cart source is authoritative and what count it yields, without I/O.
//! Exports: `CartCount`, `ReconcileState`, `Transition`, `Signal`, `SignalAction`, `inline_total`.
//! Role: Pure state machine driven by `api::reconciler`; owns no channels or timers.
//! Invariants: Exactly one mode is active; a mode switch replaces the whole variant.
//! Invariants: Guest and remote counts are never combined.
//! Invariants: Remote results apply only while the same identity is active.
//! Invariants: Every signal re-derives the count; none is applied as a delta.
use serde_json::Value;

use crate::core::identity::{IdentityKey, Session};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CartCount {
    Guest { count: u64 },
    Authenticated { identity: IdentityKey, count: u64 },
}

impl CartCount {
    pub fn value(&self) -> u64 {
        match self {
            CartCount::Guest { count } | CartCount::Authenticated { count, .. } => *count,
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, CartCount::Guest { .. })
    }

    pub fn mode_label(&self) -> &'static str {
        match self {
            CartCount::Guest { .. } => "guest",
            CartCount::Authenticated { .. } => "authenticated",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Transition {
    Unchanged,
    EnteredGuest,
    EnteredAuthenticated(IdentityKey),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Signal {
    StorageChanged,
    SameTab(Option<Value>),
    /// The same-tab receiver fell behind and dropped events.
    SameTabLagged,
    Poll,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalAction {
    Ignore,
    Apply(u64),
    ReadLocal,
}

#[derive(Clone, Debug, Default)]
pub struct ReconcileState {
    current: Option<CartCount>,
}

impl ReconcileState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&CartCount> {
        self.current.as_ref()
    }

    /// The UI-facing integer; 0 until the first session has been observed.
    pub fn count(&self) -> u64 {
        self.current.as_ref().map_or(0, CartCount::value)
    }

    pub fn active_identity(&self) -> Option<&IdentityKey> {
        match &self.current {
            Some(CartCount::Authenticated { identity, .. }) => Some(identity),
            _ => None,
        }
    }

    pub fn observe_session(&mut self, session: &Session) -> Transition {
        match session.identity() {
            None => {
                if matches!(self.current, Some(CartCount::Guest { .. })) {
                    return Transition::Unchanged;
                }
                self.current = Some(CartCount::Guest { count: 0 });
                Transition::EnteredGuest
            }
            Some(identity) => {
                if self.active_identity() == Some(identity.key()) {
                    return Transition::Unchanged;
                }
                let key = identity.key().clone();
                self.current = Some(CartCount::Authenticated {
                    identity: key.clone(),
                    count: 0,
                });
                Transition::EnteredAuthenticated(key)
            }
        }
    }

    pub fn plan_signal(&self, signal: &Signal) -> SignalAction {
        if !matches!(self.current, Some(CartCount::Guest { .. })) {
            return SignalAction::Ignore;
        }
        match signal {
            Signal::SameTab(Some(payload)) => match inline_total(payload) {
                Some(total) => SignalAction::Apply(total),
                None => SignalAction::ReadLocal,
            },
            Signal::SameTab(None)
            | Signal::SameTabLagged
            | Signal::StorageChanged
            | Signal::Poll => SignalAction::ReadLocal,
        }
    }

    /// Applies a freshly derived guest count. Returns true when the output changed.
    pub fn apply_local(&mut self, total: u64) -> bool {
        match &mut self.current {
            Some(CartCount::Guest { count }) => {
                let changed = *count != total;
                *count = total;
                changed
            }
            _ => false,
        }
    }

    /// Applies a remote count only if `identity` is still the active one.
    pub fn apply_remote(&mut self, identity: &IdentityKey, total: u64) -> bool {
        match &mut self.current {
            Some(CartCount::Authenticated {
                identity: active,
                count,
            }) if active == identity => {
                let changed = *count != total;
                *count = total;
                changed
            }
            _ => false,
        }
    }
}

/// Extracts `totalItems` from a same-tab payload when it is a non-negative integer.
pub fn inline_total(payload: &Value) -> Option<u64> {
    payload.as_object()?.get("totalItems")?.as_u64()
}
