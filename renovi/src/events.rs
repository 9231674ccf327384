//! Observer registration for lifecycle notifications
//!
//! Each event name has exactly one observer slot; registering a new observer
//! replaces the previous one. Observers are invoked at most once per
//! occurrence, synchronously, and with no replay of events that fired before
//! registration.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::{error::AuthError, tokens::TokenPair};

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;
type UnitObserver = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Slots {
    token_refreshed: Mutex<Option<Observer<TokenPair>>>,
    token_expired: Mutex<Option<UnitObserver>>,
    auth_error: Mutex<Option<Observer<AuthError>>>,
    logout: Mutex<Option<UnitObserver>>,
    refresh_start: Mutex<Option<UnitObserver>>,
    refresh_end: Mutex<Option<UnitObserver>>,
}

/// The registry of lifecycle observers
///
/// Cloning is cheap and clones share the same slots, so the same registry
/// can be handed to the manager, the coordinator, and the synchronizer.
#[derive(Clone, Default)]
pub struct AuthEvents {
    slots: Arc<Slots>,
}

fn fetch<T: ?Sized>(slot: &Mutex<Option<Arc<T>>>) -> Option<Arc<T>> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

fn install<T: ?Sized>(slot: &Mutex<Option<Arc<T>>>, observer: Arc<T>) {
    *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(observer);
}

impl AuthEvents {
    /// Constructs a registry with no observers
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the observer for successful refreshes, replacing any prior one
    pub fn on_token_refreshed(&self, observer: impl Fn(&TokenPair) + Send + Sync + 'static) {
        install(&self.slots.token_refreshed, Arc::new(observer));
    }

    /// Registers the observer for token expiry, replacing any prior one
    pub fn on_token_expired(&self, observer: impl Fn() + Send + Sync + 'static) {
        install(&self.slots.token_expired, Arc::new(observer));
    }

    /// Registers the observer for authentication errors, replacing any prior one
    pub fn on_auth_error(&self, observer: impl Fn(&AuthError) + Send + Sync + 'static) {
        install(&self.slots.auth_error, Arc::new(observer));
    }

    /// Registers the observer for logout, replacing any prior one
    pub fn on_logout(&self, observer: impl Fn() + Send + Sync + 'static) {
        install(&self.slots.logout, Arc::new(observer));
    }

    /// Registers the observer for the start of a refresh, replacing any prior one
    pub fn on_refresh_start(&self, observer: impl Fn() + Send + Sync + 'static) {
        install(&self.slots.refresh_start, Arc::new(observer));
    }

    /// Registers the observer for the end of a refresh, replacing any prior one
    pub fn on_refresh_end(&self, observer: impl Fn() + Send + Sync + 'static) {
        install(&self.slots.refresh_end, Arc::new(observer));
    }

    // Emission clones the observer out of the slot first so the lock is
    // never held while user code runs.

    pub(crate) fn emit_token_refreshed(&self, pair: &TokenPair) {
        if let Some(observer) = fetch(&self.slots.token_refreshed) {
            observer(pair);
        }
    }

    pub(crate) fn emit_token_expired(&self) {
        if let Some(observer) = fetch(&self.slots.token_expired) {
            observer();
        }
    }

    pub(crate) fn emit_auth_error(&self, error: &AuthError) {
        if let Some(observer) = fetch(&self.slots.auth_error) {
            observer(error);
        }
    }

    pub(crate) fn emit_logout(&self) {
        if let Some(observer) = fetch(&self.slots.logout) {
            observer();
        }
    }

    pub(crate) fn emit_refresh_start(&self) {
        if let Some(observer) = fetch(&self.slots.refresh_start) {
            observer();
        }
    }

    pub(crate) fn emit_refresh_end(&self) {
        if let Some(observer) = fetch(&self.slots.refresh_end) {
            observer();
        }
    }
}

impl fmt::Debug for AuthEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthEvents")
            .field("token_refreshed", &fetch(&self.slots.token_refreshed).is_some())
            .field("token_expired", &fetch(&self.slots.token_expired).is_some())
            .field("auth_error", &fetch(&self.slots.auth_error).is_some())
            .field("logout", &fetch(&self.slots.logout).is_some())
            .field("refresh_start", &fetch(&self.slots.refresh_start).is_some())
            .field("refresh_end", &fetch(&self.slots.refresh_end).is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{AccessToken, RefreshToken};

    fn pair() -> TokenPair {
        TokenPair::new(
            AccessToken::from_static("access"),
            RefreshToken::from_static("refresh"),
        )
    }

    #[test]
    fn registration_replaces_the_prior_observer() {
        let events = AuthEvents::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let count = first.clone();
        events.on_token_refreshed(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        events.emit_token_refreshed(&pair());

        let count = second.clone();
        events.on_token_refreshed(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        events.emit_token_refreshed(&pair());
        events.emit_token_refreshed(&pair());

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn emission_without_an_observer_is_a_no_op() {
        let events = AuthEvents::new();
        events.emit_token_expired();
        events.emit_logout();
        events.emit_auth_error(&AuthError::Unauthorized);
    }

    #[test]
    fn clones_share_slots() {
        let events = AuthEvents::new();
        let clone = events.clone();
        let fired = Arc::new(AtomicUsize::new(0));

        let count = fired.clone();
        clone.on_logout(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        events.emit_logout();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
