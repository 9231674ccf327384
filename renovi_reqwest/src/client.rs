//! An authenticated client applying the inbound response contract

use std::sync::Arc;

use renovi::{
    backoff::RetryPolicy, AuthError, OnlineMonitor, RefreshCoordinator, RequestQueue,
};
use renovi_clock::{Clock, DurationSecs, System};
use reqwest::{header::HeaderName, Request, Response, StatusCode};
use reqwest_middleware::ClientWithMiddleware;

/// Default response header marking the presented token as revoked
pub const BLACKLIST_HEADER: &str = "x-token-blacklisted";

/// A client wrapper that reacts to authentication failures
///
/// The wrapped client should carry a
/// [`TokenAttachMiddleware`](crate::TokenAttachMiddleware) so replays pick up
/// whatever token is current at send time. The queue handed in here must be
/// the same queue registered with the coordinator, since the coordinator is
/// what drains it once a refresh settles.
pub struct AuthHttpClient<C = System> {
    inner: ClientWithMiddleware,
    coordinator: Arc<RefreshCoordinator<C>>,
    queue: RequestQueue<Response>,
    retry: RetryPolicy,
    online: OnlineMonitor,
    online_timeout: DurationSecs,
    blacklist_header: HeaderName,
}

impl<C> std::fmt::Debug for AuthHttpClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthHttpClient")
            .field("coordinator", &self.coordinator)
            .field("queue", &self.queue)
            .field("retry", &self.retry)
            .field("blacklist_header", &self.blacklist_header)
            .finish_non_exhaustive()
    }
}

impl<C> AuthHttpClient<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Constructs a client around an existing middleware stack
    pub fn new(
        inner: ClientWithMiddleware,
        coordinator: Arc<RefreshCoordinator<C>>,
        queue: RequestQueue<Response>,
    ) -> Self {
        Self {
            inner,
            coordinator,
            queue,
            retry: RetryPolicy::default(),
            online: OnlineMonitor::default(),
            online_timeout: DurationSecs(30),
            blacklist_header: HeaderName::from_static(BLACKLIST_HEADER),
        }
    }

    /// Overrides the retry budget applied to server errors
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Uses the given connectivity monitor for network-error recovery
    #[must_use]
    pub fn with_online_monitor(mut self, online: OnlineMonitor, timeout: DurationSecs) -> Self {
        self.online = online;
        self.online_timeout = timeout;
        self
    }

    /// Overrides the header that marks a token as blacklisted
    #[must_use]
    pub fn with_blacklist_header(mut self, blacklist_header: HeaderName) -> Self {
        self.blacklist_header = blacklist_header;
        self
    }

    /// Executes a request under the full inbound contract
    ///
    /// The request body must be replayable (not a stream) for the retry and
    /// refresh-replay paths to work.
    pub async fn execute(&self, request: Request) -> Result<Response, AuthError> {
        let response = self.send_with_recovery(&request).await?;
        self.settle_response(response, &request).await
    }

    // Dispatches the request, absorbing transient failures: server errors
    // are retried on the backoff budget, and a connection-level failure gets
    // one more chance once connectivity returns.
    async fn send_with_recovery(&self, template: &Request) -> Result<Response, AuthError> {
        let mut failed_attempts = 0u32;
        let mut recovered_offline = false;

        loop {
            let request = clone_request(template)?;
            match self.inner.execute(request).await {
                Ok(response) if response.status().is_server_error() => {
                    if !self.retry.allows_retry(failed_attempts) {
                        return Ok(response);
                    }
                    let delay = self.retry.delay_after(failed_attempts);
                    tracing::debug!(
                        status = response.status().as_u16(),
                        attempt = failed_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "server error; backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                    failed_attempts += 1;
                }
                Ok(response) => return Ok(response),
                Err(reqwest_middleware::Error::Reqwest(error)) if error.status().is_none() => {
                    if recovered_offline {
                        return Err(AuthError::network(error));
                    }
                    tracing::debug!("request failed without a status; waiting for connectivity");
                    if self
                        .online
                        .wait_until_online(self.online_timeout)
                        .await
                        .is_err()
                    {
                        return Err(AuthError::network(error));
                    }
                    recovered_offline = true;
                }
                Err(error) => return Err(classify_transport_error(error)),
            }
        }
    }

    async fn settle_response(
        &self,
        response: Response,
        template: &Request,
    ) -> Result<Response, AuthError> {
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            if self.is_blacklisted(&response) {
                tracing::warn!("server flagged the presented token as blacklisted");
                return Err(AuthError::TokenBlacklisted);
            }
            return self.replay_after_refresh(template).await;
        }

        if status == StatusCode::FORBIDDEN {
            // A permissions failure; a fresher token would not change it
            if self.is_blacklisted(&response) {
                return Err(AuthError::TokenBlacklisted);
            }
            return Err(AuthError::Forbidden);
        }

        if status.is_server_error() {
            return Err(AuthError::ServerError {
                status: status.as_u16(),
            });
        }

        Ok(response)
    }

    async fn replay_after_refresh(&self, template: &Request) -> Result<Response, AuthError> {
        if self.coordinator.is_currently_refreshing() {
            tracing::debug!("unauthorized while a refresh is in flight; parking for replay");
            let client = self.inner.clone();
            let retry = clone_request(template)?;
            let blacklist_header = self.blacklist_header.clone();

            let parked = self.queue.enqueue(Box::new(move || {
                Box::pin(async move {
                    let response = client
                        .execute(retry)
                        .await
                        .map_err(classify_transport_error)?;
                    terminal_status(response, &blacklist_header)
                })
            }));

            // The refresh may have settled between the check and the
            // enqueue; drain now rather than waiting for a refresh that will
            // never come.
            if !self.coordinator.is_currently_refreshing() {
                self.queue.retry_all().await;
            }

            return parked.await;
        }

        tracing::debug!("unauthorized; refreshing before replay");
        self.coordinator.refresh().await?;

        let retry = clone_request(template)?;
        let response = self
            .inner
            .execute(retry)
            .await
            .map_err(classify_transport_error)?;
        // One replay only; a second rejection is terminal
        terminal_status(response, &self.blacklist_header)
    }

    fn is_blacklisted(&self, response: &Response) -> bool {
        response.headers().contains_key(&self.blacklist_header)
    }
}

fn clone_request(request: &Request) -> Result<Request, AuthError> {
    request
        .try_clone()
        .ok_or_else(|| AuthError::unknown("streaming request bodies cannot be replayed"))
}

fn classify_transport_error(error: reqwest_middleware::Error) -> AuthError {
    match error {
        reqwest_middleware::Error::Reqwest(error) => AuthError::network(error),
        reqwest_middleware::Error::Middleware(error) => AuthError::unknown(error),
    }
}

fn terminal_status(response: Response, blacklist_header: &HeaderName) -> Result<Response, AuthError> {
    let status = response.status();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        if response.headers().contains_key(blacklist_header) {
            return Err(AuthError::TokenBlacklisted);
        }
        return Err(if status == StatusCode::UNAUTHORIZED {
            AuthError::Unauthorized
        } else {
            AuthError::Forbidden
        });
    }

    if status.is_server_error() {
        return Err(AuthError::ServerError {
            status: status.as_u16(),
        });
    }

    Ok(response)
}
