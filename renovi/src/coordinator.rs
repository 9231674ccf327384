//! Deduplication and sequencing of refresh attempts
//!
//! All refresh triggers, proactive and reactive alike, converge on
//! [`RefreshCoordinator::refresh`]. Exactly one transport call is in flight
//! at any moment: the first caller claims the in-flight slot and leads the
//! operation, every concurrent caller follows by awaiting a clone of the
//! same outcome. The slot is claimed synchronously, before the transport
//! call's first await, so there is no window in which two leaders can race.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use renovi_clock::{Clock, DurationSecs, System, UnixTime};
use tokio::sync::watch;

use crate::{
    error::AuthError,
    events::AuthEvents,
    manager::{ProactiveRefresh, TokenManager},
    queue::DrainQueue,
    sources::RefreshTransport,
    tokens::TokenPair,
};

type Outcome = Result<TokenPair, AuthError>;

/// Ceiling on how often refreshes may be attempted
///
/// Counted per attempt over a sliding window, and enforced before any
/// transport call is made.
#[derive(Clone, Copy, Debug)]
pub struct RefreshRateConfig {
    /// Attempts allowed within the window (default: 5)
    pub max_attempts: usize,
    /// Width of the sliding window (default: 60 seconds)
    pub window: DurationSecs,
}

impl Default for RefreshRateConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: DurationSecs(60),
        }
    }
}

/// Serializes refresh attempts and fans their outcome out
pub struct RefreshCoordinator<C = System> {
    manager: Arc<TokenManager<C>>,
    transport: Arc<dyn RefreshTransport>,
    queue: Arc<dyn DrainQueue>,
    events: AuthEvents,
    clock: C,
    rate: RefreshRateConfig,
    in_flight: Mutex<Option<watch::Receiver<Option<Outcome>>>>,
    attempts: Mutex<VecDeque<UnixTime>>,
}

impl<C> fmt::Debug for RefreshCoordinator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let refreshing = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some();
        f.debug_struct("RefreshCoordinator")
            .field("refreshing", &refreshing)
            .field("rate", &self.rate)
            .finish_non_exhaustive()
    }
}

enum Role {
    Leader(watch::Sender<Option<Outcome>>),
    Follower(watch::Receiver<Option<Outcome>>),
}

/// Releases the in-flight slot and publishes the outcome on every exit
///
/// The leader future may be dropped mid-operation (a caller timing out or a
/// timer task being aborted); the drop path still clears the slot and settles
/// the followers, so a cancelled leader can never wedge the coordinator.
struct InFlightGuard<'a> {
    slot: &'a Mutex<Option<watch::Receiver<Option<Outcome>>>>,
    tx: Option<watch::Sender<Option<Outcome>>>,
    events: &'a AuthEvents,
}

impl InFlightGuard<'_> {
    fn finish(mut self, outcome: Outcome) -> Outcome {
        if let Some(tx) = self.tx.take() {
            *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
            let _ = tx.send(Some(outcome.clone()));
            self.events.emit_refresh_end();
        }
        outcome
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let Some(tx) = self.tx.take() else { return };
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        let _ = tx.send(Some(Err(AuthError::refresh_failed(
            "refresh was cancelled before completing",
        ))));
        self.events.emit_refresh_end();
    }
}

impl RefreshCoordinator<System> {
    /// Constructs a coordinator on the system clock with the default rate ceiling
    pub fn new(
        manager: Arc<TokenManager<System>>,
        transport: Arc<dyn RefreshTransport>,
        queue: Arc<dyn DrainQueue>,
        events: AuthEvents,
    ) -> Arc<Self> {
        Self::with_clock(
            manager,
            transport,
            queue,
            events,
            RefreshRateConfig::default(),
            System,
        )
    }
}

impl<C> RefreshCoordinator<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Constructs a coordinator with an explicit rate ceiling and clock
    pub fn with_clock(
        manager: Arc<TokenManager<C>>,
        transport: Arc<dyn RefreshTransport>,
        queue: Arc<dyn DrainQueue>,
        events: AuthEvents,
        rate: RefreshRateConfig,
        clock: C,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            transport,
            queue,
            events,
            clock,
            rate,
            in_flight: Mutex::new(None),
            attempts: Mutex::new(VecDeque::new()),
        })
    }

    /// Registers this coordinator as the manager's proactive refresh hook
    ///
    /// This creates a reference cycle with the manager that is broken by
    /// [`TokenManager::destroy`].
    pub fn register_proactive(self: &Arc<Self>) {
        self.manager.set_proactive_refresh(self.clone());
    }

    /// Whether a refresh is in flight right now
    pub fn is_currently_refreshing(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Obtains a fresh token pair, joining any refresh already in flight
    ///
    /// The first caller leads: it checks the rate ceiling, calls the
    /// transport, persists a successful pair, and drains the request queue.
    /// Every concurrent caller receives a clone of the leader's outcome.
    /// `refresh_end` is observable on every path once the slot is released.
    pub async fn refresh(&self) -> Result<TokenPair, AuthError> {
        let role = {
            let mut slot = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match &*slot {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => {
                tracing::trace!("joining refresh already in flight");
                loop {
                    if let Some(outcome) = rx.borrow_and_update().clone() {
                        return outcome;
                    }
                    if rx.changed().await.is_err() {
                        return Err(AuthError::refresh_failed(
                            "in-flight refresh ended without an outcome",
                        ));
                    }
                }
            }
            Role::Leader(tx) => {
                let guard = InFlightGuard {
                    slot: &self.in_flight,
                    tx: Some(tx),
                    events: &self.events,
                };
                let outcome = self.lead_refresh().await;
                guard.finish(outcome)
            }
        }
    }

    /// Best-effort logout: revoke, drop parked requests, forget the pair
    ///
    /// Revocation failures are logged and ignored; the local teardown always
    /// completes.
    pub async fn logout(&self) {
        if let Some(refresh_token) = self.manager.refresh_token() {
            if let Err(error) = self.transport.revoke(&refresh_token).await {
                tracing::warn!(error = %error, "token revocation failed during logout");
            }
        }

        self.queue.clear();
        self.manager.clear_tokens().await;
        self.events.emit_logout();
    }

    async fn lead_refresh(&self) -> Outcome {
        let outcome = self.attempt_refresh().await;
        match &outcome {
            Ok(pair) => {
                tracing::debug!("refresh succeeded; replaying parked requests");
                self.events.emit_token_refreshed(pair);
                self.queue.retry_all().await;
            }
            Err(error) => {
                tracing::warn!(
                    error = error as &dyn std::error::Error,
                    "refresh failed; rejecting parked requests"
                );
                self.events.emit_auth_error(error);
                self.queue.reject_all(error.clone()).await;
            }
        }
        outcome
    }

    async fn attempt_refresh(&self) -> Outcome {
        self.record_attempt()?;
        self.events.emit_refresh_start();

        let refresh_token = self.manager.refresh_token().ok_or(AuthError::TokenExpired)?;
        if self.manager.is_refresh_token_expired() {
            return Err(AuthError::TokenExpired);
        }

        tracing::debug!("requesting fresh tokens");
        let pair = self
            .transport
            .refresh(&refresh_token)
            .await
            .map_err(AuthError::classify)?;
        if pair.access_token.as_str().is_empty() || pair.refresh_token.as_str().is_empty() {
            return Err(AuthError::token_invalid(
                "authority returned an empty token",
            ));
        }

        self.manager.set_tokens(&pair).await;
        Ok(pair)
    }

    // Enforced before any transport traffic: expired entries fall out of the
    // window first, then the ceiling is checked, then this attempt is
    // recorded.
    fn record_attempt(&self) -> Result<(), AuthError> {
        let now = self.clock.now();
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());

        let horizon = now - self.rate.window;
        while attempts.front().map_or(false, |at| *at <= horizon) {
            attempts.pop_front();
        }

        if attempts.len() >= self.rate.max_attempts {
            return Err(AuthError::MaxRefreshAttemptsExceeded {
                attempts: attempts.len(),
                window: self.rate.window.0,
            });
        }

        attempts.push_back(now);
        Ok(())
    }
}

#[async_trait]
impl<C> ProactiveRefresh for RefreshCoordinator<C>
where
    C: Clock + Send + Sync + 'static,
{
    async fn refresh_ahead(&self) -> Result<(), AuthError> {
        self.refresh().await.map(|_| ())
    }
}
