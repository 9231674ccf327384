//! Token custody and proactive expiry scheduling
//!
//! The manager is the only writer of expiry state. Relative lifetimes are
//! converted to absolute instants exactly once, when a pair is set, and a
//! single timer is kept armed to trigger a refresh ahead of expiry. Setting
//! a new pair always cancels the prior timer before arming the next one, so
//! a refresh is never double-scheduled.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use renovi_clock::{Clock, DurationSecs, System, UnixTime};
use tokio::task::JoinHandle;

use crate::{
    error::AuthError,
    events::AuthEvents,
    jwt,
    store::TokenStore,
    tokens::{RefreshScheduleConfig, TokenPair},
    AccessToken, RefreshToken,
};

/// Where the managed token currently sits in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// No token pair has been set
    Unset,
    /// A pair is held and a proactive refresh is scheduled
    Scheduled,
    /// The proactive timer fired and a refresh is being attempted
    Refreshing,
    /// The held pair is expired, or its expiry could not be determined
    Expired,
}

/// A hook invoked when the proactive refresh timer fires
#[async_trait]
pub trait ProactiveRefresh: Send + Sync {
    /// Attempts to obtain a fresh token pair before the current one expires
    async fn refresh_ahead(&self) -> Result<(), AuthError>;
}

struct ManagerState {
    access_expires_at: Option<UnixTime>,
    refresh_expires_at: Option<UnixTime>,
    status: TokenStatus,
    timer: Option<JoinHandle<()>>,
    hook: Option<Arc<dyn ProactiveRefresh>>,
}

/// Holds the current token pair and schedules its renewal
pub struct TokenManager<C = System> {
    store: Arc<dyn TokenStore>,
    events: AuthEvents,
    schedule: RefreshScheduleConfig,
    clock: C,
    state: Mutex<ManagerState>,
}

impl<C> fmt::Debug for TokenManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("TokenManager")
            .field("status", &state.status)
            .field("access_expires_at", &state.access_expires_at)
            .field("refresh_expires_at", &state.refresh_expires_at)
            .finish_non_exhaustive()
    }
}

impl TokenManager<System> {
    /// Constructs a manager on the system clock with the default schedule
    pub fn new(store: Arc<dyn TokenStore>, events: AuthEvents) -> Arc<Self> {
        Self::with_clock(store, events, RefreshScheduleConfig::default(), System)
    }
}

impl<C> TokenManager<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Constructs a manager with an explicit schedule and clock
    pub fn with_clock(
        store: Arc<dyn TokenStore>,
        events: AuthEvents,
        schedule: RefreshScheduleConfig,
        clock: C,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            schedule,
            clock,
            state: Mutex::new(ManagerState {
                access_expires_at: None,
                refresh_expires_at: None,
                status: TokenStatus::Unset,
                timer: None,
                hook: None,
            }),
        })
    }

    /// Registers the hook run when the proactive timer fires
    pub fn set_proactive_refresh(&self, hook: Arc<dyn ProactiveRefresh>) {
        self.lock_state().hook = Some(hook);
    }

    /// The currently held access token, if any
    pub fn access_token(&self) -> Option<AccessToken> {
        self.store.access_token()
    }

    /// The currently held refresh token, if any
    pub fn refresh_token(&self) -> Option<RefreshToken> {
        self.store.refresh_token()
    }

    /// The current lifecycle status
    pub fn status(&self) -> TokenStatus {
        self.lock_state().status
    }

    /// Installs a new token pair and schedules its proactive renewal
    ///
    /// Persistence failures are logged and otherwise ignored; the lifecycle
    /// must keep running even when the backing store is unavailable.
    pub async fn set_tokens(self: &Arc<Self>, pair: &TokenPair) {
        if let Err(error) = self
            .store
            .set_tokens(&pair.access_token, &pair.refresh_token)
            .await
        {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "failed to persist token pair"
            );
        }

        let now = self.clock.now();
        let access_expires_at = pair.access_expiry(now);
        let refresh_expires_at = pair.refresh_expiry(now);

        let mut state = self.lock_state();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.access_expires_at = access_expires_at;
        state.refresh_expires_at = refresh_expires_at;

        match access_expires_at {
            Some(expires_at) if expires_at > now => {
                let ttl = expires_at - now;
                let delay = self.schedule.proactive_delay(ttl);
                tracing::debug!(
                    token.expires_at = expires_at.0,
                    refresh.delay = delay.0,
                    "token pair set; proactive refresh scheduled"
                );
                state.timer = Some(self.spawn_timer(delay));
                state.status = TokenStatus::Scheduled;
            }
            _ => {
                // No determinable future expiry; the pair is treated as
                // already expired and reactive paths take over.
                tracing::debug!("token pair set without a usable access expiry");
                state.status = TokenStatus::Expired;
            }
        }
    }

    /// Whether the access token is expired right now
    ///
    /// A missing token or an undeterminable expiry both count as expired.
    pub fn is_access_token_expired(&self) -> bool {
        self.is_access_token_expiring_soon(DurationSecs::ZERO)
    }

    /// Whether the access token will be expired within `offset` seconds
    pub fn is_access_token_expiring_soon(&self, offset: DurationSecs) -> bool {
        let now = self.clock.now();
        let known = self.lock_state().access_expires_at;
        match known {
            Some(expires_at) => now + offset >= expires_at,
            None => match self.store.access_token() {
                Some(token) => jwt::is_expired_at(token.as_str(), now, offset),
                None => true,
            },
        }
    }

    /// Whether the refresh token is expired right now
    ///
    /// Unlike the access token, a refresh token with no determinable expiry
    /// is assumed usable; only its absence or a passed expiry counts.
    pub fn is_refresh_token_expired(&self) -> bool {
        let now = self.clock.now();
        let known = self.lock_state().refresh_expires_at;
        match known {
            Some(expires_at) => now >= expires_at,
            None => match self.store.refresh_token() {
                Some(token) => {
                    jwt::expiry_of(token.as_str()).map_or(false, |expires_at| now >= expires_at)
                }
                None => true,
            },
        }
    }

    /// Cancels any scheduled refresh and forgets the held pair
    pub async fn clear_tokens(&self) {
        {
            let mut state = self.lock_state();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.access_expires_at = None;
            state.refresh_expires_at = None;
            state.status = TokenStatus::Unset;
        }

        if let Err(error) = self.store.clear_tokens().await {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "failed to clear persisted tokens"
            );
        }
    }

    /// Cancels the timer and drops the proactive hook
    ///
    /// Safe to call repeatedly. The held pair and store are untouched.
    pub fn destroy(&self) {
        let mut state = self.lock_state();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.hook = None;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn_timer(self: &Arc<Self>, delay: DurationSecs) -> JoinHandle<()> {
        // The deadline is anchored when the timer is armed, not when the
        // spawned task first polls, so the schedule is relative to the moment
        // the pair was stored.
        let deadline = tokio::time::Instant::now() + delay.into();
        // The timer holds only a weak reference so an abandoned manager is
        // not kept alive by its own pending sleep.
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(manager) = weak.upgrade() {
                manager.on_timer_fired().await;
            }
        })
    }

    async fn on_timer_fired(self: Arc<Self>) {
        let hook = {
            let mut state = self.lock_state();
            state.timer = None;
            state.status = TokenStatus::Refreshing;
            state.hook.clone()
        };

        let refreshed = match hook {
            Some(hook) => {
                tracing::debug!("proactive refresh timer fired");
                hook.refresh_ahead().await
            }
            None => {
                tracing::debug!("proactive refresh timer fired with no hook registered");
                Err(AuthError::TokenExpired)
            }
        };

        if let Err(error) = refreshed {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "proactive refresh did not produce a fresh token"
            );
            self.lock_state().status = TokenStatus::Expired;
            self.events.emit_token_expired();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use renovi_clock::TestClock;

    use super::*;
    use crate::store::InMemoryTokenStore;
    use crate::{AccessToken, RefreshToken};

    struct CountingHook {
        fired: AtomicUsize,
        outcome: Result<(), AuthError>,
    }

    impl CountingHook {
        fn succeeding() -> Arc<Self> {
            Arc::new(Self {
                fired: AtomicUsize::new(0),
                outcome: Ok(()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                fired: AtomicUsize::new(0),
                outcome: Err(AuthError::Unauthorized),
            })
        }

        fn count(&self) -> usize {
            self.fired.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProactiveRefresh for CountingHook {
        async fn refresh_ahead(&self) -> Result<(), AuthError> {
            self.fired.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn manager_at(now: u64) -> (Arc<TokenManager<TestClock>>, TestClock) {
        let clock = TestClock::new(UnixTime(now));
        let manager = TokenManager::with_clock(
            Arc::new(InMemoryTokenStore::new()),
            AuthEvents::new(),
            RefreshScheduleConfig::default(),
            clock.clone(),
        );
        (manager, clock)
    }

    fn pair_with_ttl(ttl: u64) -> TokenPair {
        TokenPair::new(
            AccessToken::from_static("access"),
            RefreshToken::from_static("refresh"),
        )
        .with_expires_in(DurationSecs(ttl))
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn proactive_refresh_fires_at_ttl_minus_offset() {
        let (manager, _clock) = manager_at(1_000);
        let hook = CountingHook::succeeding();
        manager.set_proactive_refresh(hook.clone());

        manager.set_tokens(&pair_with_ttl(3_600)).await;
        assert_eq!(manager.status(), TokenStatus::Scheduled);

        tokio::time::advance(Duration::from_secs(3_299)).await;
        settle().await;
        assert_eq!(hook.count(), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(hook.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_cancels_the_prior_timer() {
        let (manager, _clock) = manager_at(1_000);
        let hook = CountingHook::succeeding();
        manager.set_proactive_refresh(hook.clone());

        manager.set_tokens(&pair_with_ttl(3_600)).await;
        manager.set_tokens(&pair_with_ttl(7_200)).await;

        // Past the first pair's fire point, before the second's
        tokio::time::advance(Duration::from_secs(4_000)).await;
        settle().await;
        assert_eq!(hook.count(), 0);

        tokio::time::advance(Duration::from_secs(3_000)).await;
        settle().await;
        assert_eq!(hook.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_proactive_refresh_reports_expiry() {
        let events = AuthEvents::new();
        let expired = Arc::new(AtomicUsize::new(0));
        let count = expired.clone();
        events.on_token_expired(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        let clock = TestClock::new(UnixTime(0));
        let manager = TokenManager::with_clock(
            Arc::new(InMemoryTokenStore::new()),
            events,
            RefreshScheduleConfig::default(),
            clock,
        );
        let hook = CountingHook::failing();
        manager.set_proactive_refresh(hook.clone());

        manager.set_tokens(&pair_with_ttl(3_600)).await;
        tokio::time::advance(Duration::from_secs(3_300)).await;
        settle().await;

        assert_eq!(hook.count(), 1);
        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status(), TokenStatus::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn reported_lifetime_beats_token_expiry_claim() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let (manager, clock) = manager_at(1_000);

        // The token itself claims a far-future expiry
        let jwt = format!("h.{}.s", URL_SAFE_NO_PAD.encode(r#"{"exp":999999}"#));
        let pair = TokenPair::new(
            AccessToken::new(jwt),
            RefreshToken::from_static("refresh"),
        )
        .with_expires_in(DurationSecs(100));
        manager.set_tokens(&pair).await;

        assert!(!manager.is_access_token_expired());
        clock.inc(100);
        assert!(manager.is_access_token_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_access_expiry_is_expired_and_unknown_refresh_expiry_is_not() {
        let (manager, _clock) = manager_at(1_000);

        let pair = TokenPair::new(
            AccessToken::from_static("opaque"),
            RefreshToken::from_static("opaque"),
        );
        manager.set_tokens(&pair).await;

        assert_eq!(manager.status(), TokenStatus::Expired);
        assert!(manager.is_access_token_expired());
        assert!(!manager.is_refresh_token_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_tokens_count_as_expired() {
        let (manager, _clock) = manager_at(1_000);
        assert!(manager.is_access_token_expired());
        assert!(manager.is_refresh_token_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_is_idempotent_and_disarms_the_timer() {
        let (manager, _clock) = manager_at(1_000);
        let hook = CountingHook::succeeding();
        manager.set_proactive_refresh(hook.clone());

        manager.set_tokens(&pair_with_ttl(3_600)).await;
        manager.clear_tokens().await;
        manager.clear_tokens().await;

        assert_eq!(manager.status(), TokenStatus::Unset);
        assert!(manager.access_token().is_none());
        assert!(manager.refresh_token().is_none());

        tokio::time::advance(Duration::from_secs(10_000)).await;
        settle().await;
        assert_eq!(hook.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_is_idempotent() {
        let (manager, _clock) = manager_at(1_000);
        let hook = CountingHook::succeeding();
        manager.set_proactive_refresh(hook.clone());
        manager.set_tokens(&pair_with_ttl(3_600)).await;

        manager.destroy();
        manager.destroy();

        tokio::time::advance(Duration::from_secs(10_000)).await;
        settle().await;
        assert_eq!(hook.count(), 0);
    }
}
