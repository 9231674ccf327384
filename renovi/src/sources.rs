//! Sources of fresh token pairs

use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;

use crate::{
    error::{AuthError, BoxError},
    tokens::TokenPair,
    RefreshTokenRef,
};

#[cfg(feature = "http")]
pub mod http;

/// Exchanges a refresh token for a fresh token pair
///
/// Implementations may fail with any error; the refresh coordinator
/// classifies failures structurally, so an [`AuthError`] raised here keeps
/// its kind while anything else is wrapped as a refresh failure. Returned
/// pairs must carry non-empty tokens.
#[async_trait]
pub trait RefreshTransport: Send + Sync {
    /// Obtains a fresh pair using the given refresh token
    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<TokenPair, BoxError>;

    /// Revokes the refresh token with the authority, if supported
    ///
    /// The default implementation does nothing; revocation is best-effort.
    async fn revoke(&self, _refresh_token: &RefreshTokenRef) -> Result<(), BoxError> {
        Ok(())
    }
}

/// A transport that serves preloaded pairs in order
///
/// Intended for wiring tests and examples. Once the preloaded outcomes are
/// exhausted, every further refresh fails.
#[derive(Debug, Default)]
pub struct StaticRefreshTransport {
    outcomes: Mutex<VecDeque<Result<TokenPair, AuthError>>>,
}

impl StaticRefreshTransport {
    /// Constructs a transport with no preloaded outcomes
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a pair to be served by a future refresh
    #[must_use]
    pub fn with_pair(self, pair: TokenPair) -> Self {
        self.push(Ok(pair));
        self
    }

    /// Queues a failure to be served by a future refresh
    #[must_use]
    pub fn with_failure(self, error: AuthError) -> Self {
        self.push(Err(error));
        self
    }

    fn push(&self, outcome: Result<TokenPair, AuthError>) {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
    }
}

#[async_trait]
impl RefreshTransport for StaticRefreshTransport {
    async fn refresh(&self, _refresh_token: &RefreshTokenRef) -> Result<TokenPair, BoxError> {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Err(AuthError::refresh_failed("no more preloaded token pairs")))
            .map_err(Into::into)
    }
}
