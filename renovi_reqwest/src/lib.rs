//! Token lifecycle integration for `reqwest`
//!
//! Two pieces cooperate here:
//!
//! * [`TokenAttachMiddleware`] sits in a
//!   [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware) stack
//!   and attaches the current access token to qualifying outbound requests.
//!   Because attachment happens at send time, a request replayed after a
//!   refresh automatically picks up the fresh token.
//! * [`AuthHttpClient`] wraps the middleware client and applies the inbound
//!   contract: an unauthorized response triggers (or joins) a refresh and a
//!   single replay, a forbidden response fails immediately, server errors
//!   are retried on a backoff budget, and a blacklisted token short-circuits
//!   everything.
//!
//! ```
//! use renovi_reqwest::TokenAttachMiddleware;
//! use renovi::{store::InMemoryTokenStore, AuthEvents, TokenManager};
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! # use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let manager = TokenManager::new(Arc::new(InMemoryTokenStore::new()), AuthEvents::new());
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(TokenAttachMiddleware::new(manager))
//!     .build();
//!
//! let req = client
//!     .get("https://example.com");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # }
//! ```
//!
//! Attachment can be made conditional by composing predicates:
//!
//! ```
//! use renovi_reqwest::{ExactHostMatch, HttpsOnly, TokenAttachMiddleware};
//! use predicates::prelude::PredicateBooleanExt;
//! # use renovi::{store::InMemoryTokenStore, AuthEvents, TokenManager};
//! # use std::sync::Arc;
//!
//! # let manager = TokenManager::new(Arc::new(InMemoryTokenStore::new()), AuthEvents::new());
//! TokenAttachMiddleware::new(manager)
//!     .with_predicate(HttpsOnly.and(ExactHostMatch::new("example.com")));
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use predicates::{prelude::*, reflection};
use renovi::TokenManager;
use renovi_clock::{Clock, System};
use reqwest::{header, Request, Response};
use reqwest_middleware::{Middleware, Next, Result};

mod client;

pub use client::{AuthHttpClient, BLACKLIST_HEADER};

/// Marker header requesting that no token be attached to a request
///
/// The header is stripped before the request leaves the middleware stack.
pub const SKIP_AUTH_HEADER: &str = "x-renovi-skip-auth";

/// A middleware that injects the current access token into outgoing requests
///
/// A request that already carries an `Authorization` header is left alone,
/// and a request marked with [`SKIP_AUTH_HEADER`] is sent untouched (minus
/// the marker). When the manager holds no token, the request goes out
/// unauthenticated rather than failing.
#[derive(Clone, Debug)]
pub struct TokenAttachMiddleware<P = HttpsOnly, C = System> {
    manager: Arc<TokenManager<C>>,
    predicate: P,
}

impl<C> TokenAttachMiddleware<HttpsOnly, C> {
    /// Constructs a new middleware drawing tokens from the given manager
    ///
    /// By default, a token is only attached when the request is being sent
    /// via HTTPS. To change this behavior, provide a custom predicate with
    /// [`with_predicate()`][Self::with_predicate()].
    pub fn new(manager: Arc<TokenManager<C>>) -> Self {
        Self {
            manager,
            predicate: HttpsOnly,
        }
    }
}

impl<P, C> TokenAttachMiddleware<P, C> {
    /// Replaces the attachment predicate
    pub fn with_predicate<Q>(self, predicate: Q) -> TokenAttachMiddleware<Q, C> {
        TokenAttachMiddleware {
            manager: self.manager,
            predicate,
        }
    }
}

impl<P, C> TokenAttachMiddleware<P, C>
where
    C: Clock + Send + Sync + 'static,
{
    fn bearer_value(&self) -> Option<header::HeaderValue> {
        let token = self.manager.access_token()?;

        let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
        header_value.put_slice(b"Bearer ");
        header_value.put_slice(token.as_str().as_bytes());

        match header::HeaderValue::from_maybe_shared(header_value) {
            Ok(mut value) => {
                value.set_sensitive(true);
                Some(value)
            }
            Err(_) => {
                tracing::warn!("access token contains bytes not valid in a header");
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl<P, C> Middleware for TokenAttachMiddleware<P, C>
where
    P: Predicate<Request> + Send + Sync + 'static,
    C: Clock + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if req.headers_mut().remove(SKIP_AUTH_HEADER).is_some() {
            return next.run(req, extensions).await;
        }

        if self.predicate.eval(&req) && !req.headers().contains_key(header::AUTHORIZATION) {
            if let Some(value) = self.bearer_value() {
                req.headers_mut().insert(header::AUTHORIZATION, value);
            }
        }

        next.run(req, extensions).await
    }
}

/// Only attach an access token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach an access token if the request is being sent to the exact host specified
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host string
    pub fn new<S>(host: S) -> Self
    where
        S: ToString,
    {
        Self {
            host: host.to_string(),
        }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "host",
                    req.url()
                        .host_str()
                        .unwrap_or("<value not valid utf-8>")
                        .to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host == ")?;
        f.write_str(&self.host)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use renovi::{store::InMemoryTokenStore, AccessToken, AuthEvents, RefreshToken, TokenPair};
    use renovi_clock::DurationSecs;
    use reqwest::Client;
    use reqwest_middleware::ClientBuilder;

    use super::*;

    const TEST_TOKEN: &str = "this-is-a-test-token";
    const BEARER_TEST_TOKEN: &str = "Bearer this-is-a-test-token";

    struct AuthChecker {
        expected_authorization: String,
        checked: AtomicBool,
    }

    impl AuthChecker {
        pub fn new(expected: impl Into<String>) -> Self {
            Self {
                expected_authorization: expected.into(),
                checked: AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl Middleware for AuthChecker {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            let authorization_header = req
                .headers()
                .get(header::AUTHORIZATION)
                .expect("no authorization header")
                .to_str()
                .expect("authorization header was not valid UTF-8");

            assert_eq!(authorization_header, self.expected_authorization);
            self.checked.store(true, Ordering::Release);

            Ok(http::Response::<&[u8]>::default().into())
        }
    }

    #[derive(Default)]
    struct NoAuthChecker {
        checked: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Middleware for NoAuthChecker {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            assert_eq!(req.headers().get(header::AUTHORIZATION), None);
            assert_eq!(req.headers().get(SKIP_AUTH_HEADER), None);
            self.checked.store(true, Ordering::Release);

            Ok(http::Response::<&[u8]>::default().into())
        }
    }

    async fn prepare_middleware() -> TokenAttachMiddleware {
        let manager = TokenManager::new(Arc::new(InMemoryTokenStore::new()), AuthEvents::new());
        manager
            .set_tokens(
                &TokenPair::new(
                    AccessToken::from_static(TEST_TOKEN),
                    RefreshToken::from_static("refresh"),
                )
                .with_expires_in(DurationSecs(3600)),
            )
            .await;

        TokenAttachMiddleware::new(manager)
    }

    #[tokio::test]
    async fn attaches_token_on_https_request() {
        let middleware = prepare_middleware().await;
        let auth_checker = Arc::new(AuthChecker::new(BEARER_TEST_TOKEN));

        let client = ClientBuilder::new(Client::default())
            .with(middleware)
            .with_arc(auth_checker.clone())
            .build();

        let resp = client.get("https://example.com").send().await.unwrap();

        assert_eq!(resp.status(), http::StatusCode::OK);
        assert!(auth_checker.checked.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn does_not_attach_on_http_request_by_default() {
        let middleware = prepare_middleware().await;
        let checker = Arc::new(NoAuthChecker::default());

        let client = ClientBuilder::new(Client::default())
            .with(middleware)
            .with_arc(checker.clone())
            .build();

        let resp = client.get("http://example.com").send().await.unwrap();

        assert_eq!(resp.status(), http::StatusCode::OK);
        assert!(checker.checked.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn skip_marker_suppresses_attachment_and_is_stripped() {
        let middleware = prepare_middleware().await;
        let checker = Arc::new(NoAuthChecker::default());

        let client = ClientBuilder::new(Client::default())
            .with(middleware)
            .with_arc(checker.clone())
            .build();

        let resp = client
            .get("https://example.com")
            .header(SKIP_AUTH_HEADER, "1")
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), http::StatusCode::OK);
        assert!(checker.checked.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn existing_authorization_header_is_left_alone() {
        const BEARER_OVERRIDE_TOKEN: &str = "Bearer overridden!";

        let middleware = prepare_middleware().await;
        let auth_checker = Arc::new(AuthChecker::new(BEARER_OVERRIDE_TOKEN));

        let client = ClientBuilder::new(Client::default())
            .with(middleware)
            .with_arc(auth_checker.clone())
            .build();

        let resp = client
            .get("https://example.com")
            .bearer_auth("overridden!")
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), http::StatusCode::OK);
        assert!(auth_checker.checked.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn missing_token_sends_the_request_unauthenticated() {
        let manager = TokenManager::new(Arc::new(InMemoryTokenStore::new()), AuthEvents::new());
        let middleware = TokenAttachMiddleware::new(manager);
        let checker = Arc::new(NoAuthChecker::default());

        let client = ClientBuilder::new(Client::default())
            .with(middleware)
            .with_arc(checker.clone())
            .build();

        let resp = client.get("https://example.com").send().await.unwrap();

        assert_eq!(resp.status(), http::StatusCode::OK);
        assert!(checker.checked.load(Ordering::Acquire));
    }

    mod https_only_predicate {
        use super::*;

        #[test]
        fn matches_when_request_has_https_scheme() {
            let request =
                Request::new(reqwest::Method::GET, "https://example.com".parse().unwrap());
            let result = HttpsOnly.find_case(true, &request);
            assert!(result.is_none())
        }

        #[test]
        fn does_not_match_when_request_has_http_scheme() {
            let request = Request::new(reqwest::Method::GET, "http://example.com".parse().unwrap());
            let result = HttpsOnly.find_case(false, &request);
            assert!(result.is_none())
        }
    }

    mod exact_host_match_predicate {
        use super::*;

        #[test]
        fn matches_when_request_has_same_host() {
            let request =
                Request::new(reqwest::Method::GET, "https://example.com".parse().unwrap());
            let predicate = ExactHostMatch::new("example.com");
            let result = predicate.find_case(true, &request);
            assert!(result.is_none())
        }

        #[test]
        fn does_not_match_when_request_has_different_host() {
            let request = Request::new(
                reqwest::Method::GET,
                "http://does-not-match.com".parse().unwrap(),
            );
            let predicate = ExactHostMatch::new("example.com");
            let result = predicate.find_case(false, &request);
            assert!(result.is_none())
        }
    }
}
