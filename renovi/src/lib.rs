//! Client-side token lifecycle management with coordinated refresh
//!
//! This library keeps a client authenticated by managing the lifecycle of an
//! access/refresh token pair: deciding when the pair is expired, refreshing
//! it ahead of time, deduplicating concurrent refresh attempts into a single
//! transport call, parking requests that arrive mid-refresh, and keeping
//! sibling instances (browser tabs, worker processes) agreeing on one pair.
//!
//! The pieces compose around three hubs:
//!
//! * [`TokenManager`] owns the pair and its expiry state. It converts the
//!   lifetimes reported by the authority into absolute instants and keeps a
//!   single timer armed to renew the pair before it lapses.
//! * [`RefreshCoordinator`] is the only path through which a refresh happens.
//!   Every trigger, proactive or reactive, converges here; concurrent
//!   callers share one transport call and one outcome.
//! * [`AuthEvents`] fans lifecycle notifications out to the application.
//!
//! # Wiring
//!
//! ```
//! use std::sync::Arc;
//! use renovi::{
//!     sources::StaticRefreshTransport, store::InMemoryTokenStore, AccessToken, AuthEvents,
//!     RefreshCoordinator, RefreshToken, RequestQueue, TokenManager, TokenPair,
//! };
//! use renovi_clock::DurationSecs;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let events = AuthEvents::new();
//! let manager = TokenManager::new(Arc::new(InMemoryTokenStore::new()), events.clone());
//!
//! let transport = StaticRefreshTransport::new().with_pair(
//!     TokenPair::new(
//!         AccessToken::from_static("fresh-access"),
//!         RefreshToken::from_static("fresh-refresh"),
//!     )
//!     .with_expires_in(DurationSecs(3600)),
//! );
//!
//! let queue = RequestQueue::<()>::new();
//! let coordinator = RefreshCoordinator::new(
//!     manager.clone(),
//!     Arc::new(transport),
//!     Arc::new(queue.clone()),
//!     events.clone(),
//! );
//! coordinator.register_proactive();
//!
//! manager
//!     .set_tokens(
//!         &TokenPair::new(
//!             AccessToken::from_static("initial-access"),
//!             RefreshToken::from_static("initial-refresh"),
//!         )
//!         .with_expires_in(DurationSecs(60)),
//!     )
//!     .await;
//!
//! let pair = coordinator.refresh().await.unwrap();
//! assert_eq!(pair.access_token.as_str(), "fresh-access");
//! # manager.destroy();
//! # }
//! ```
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are
//! enabled by default:
//!
//! * `http`: Provides [`sources::http::HttpRefreshTransport`], a refresh
//!   transport speaking to an OAuth2-style token endpoint.
//! * `file`: Provides [`store::FileTokenStore`], persisting the pair on the
//!   local filesystem.
//! * `rand`: Jitters retry backoff delays to spread out competing retriers.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod backoff;
mod braids;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod jwt;
pub mod manager;
pub mod online;
pub mod queue;
pub mod sources;
pub mod store;
pub mod sync;
mod tokens;

pub use braids::*;
pub use coordinator::{RefreshCoordinator, RefreshRateConfig};
pub use error::{AuthError, ErrorKind};
pub use events::AuthEvents;
pub use manager::{ProactiveRefresh, TokenManager, TokenStatus};
pub use online::OnlineMonitor;
pub use queue::{DrainQueue, RequestQueue};
pub use sync::{SyncMessage, TabChannel, TabSynchronizer};
pub use tokens::{RefreshScheduleConfig, TokenPair};
