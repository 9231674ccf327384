//! The error taxonomy shared by every failure surface
//!
//! A single [`AuthError`] is produced per failure and may be delivered up to
//! three times: to the caller that triggered the operation, to every request
//! waiting in the queue, and to the registered error observer. To make that
//! fan-out possible the error is `Clone`, with any underlying cause held
//! behind an `Arc`.

use std::{error::Error as StdError, sync::Arc};

use renovi_clock::DurationSecs;
use thiserror::Error;

/// A type-erased error
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

type SharedCause = Arc<dyn StdError + Send + Sync + 'static>;

/// Broad classification of an authentication failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The access token is expired and no usable refresh token remains
    TokenExpired,
    /// A token or token response was structurally unusable
    TokenInvalid,
    /// The refresh operation itself failed
    RefreshFailed,
    /// Too many refresh attempts within the sliding window
    MaxRefreshAttemptsExceeded,
    /// A transport-level failure with no HTTP status
    NetworkError,
    /// A bounded wait elapsed without the awaited condition
    TimeoutError,
    /// The server answered 401
    Unauthorized,
    /// The server answered 403
    Forbidden,
    /// The server answered with a 5xx status
    ServerError,
    /// The server marked the presented token as revoked
    TokenBlacklisted,
    /// Anything that fits no other classification
    UnknownError,
}

/// An authentication lifecycle error
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// No usable token remains
    #[error("token is expired")]
    TokenExpired,

    /// A token or token response could not be interpreted
    #[error("token is invalid: {reason}")]
    TokenInvalid {
        /// What made the token unusable
        reason: String,
    },

    /// The refresh operation failed for a reason that is not its own kind
    #[error("token refresh failed")]
    RefreshFailed(#[source] SharedCause),

    /// The refresh rate ceiling was hit before any transport call was made
    #[error("refresh attempt limit reached ({attempts} attempts within {window}s)")]
    MaxRefreshAttemptsExceeded {
        /// Attempts observed within the window
        attempts: usize,
        /// Width of the sliding window in seconds
        window: u64,
    },

    /// The transport failed without producing an HTTP status
    #[error("network error")]
    Network(#[source] Option<SharedCause>),

    /// A bounded wait expired
    #[error("timed out after {waited}s")]
    Timeout {
        /// How long the wait lasted before giving up
        waited: u64,
    },

    /// The server rejected the request with 401
    #[error("request was unauthorized")]
    Unauthorized,

    /// The server rejected the request with 403
    #[error("request was forbidden")]
    Forbidden,

    /// The server answered with a 5xx status
    #[error("server error (status {status})")]
    ServerError {
        /// The HTTP status code
        status: u16,
    },

    /// The server flagged the presented token as revoked
    #[error("token has been blacklisted")]
    TokenBlacklisted,

    /// The request queue was torn down before this request could be settled
    #[error("request queue was torn down")]
    QueueTornDown,

    /// An unclassifiable failure
    #[error("unexpected authentication failure")]
    Unknown(#[source] SharedCause),
}

impl AuthError {
    /// The broad classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TokenExpired => ErrorKind::TokenExpired,
            Self::TokenInvalid { .. } => ErrorKind::TokenInvalid,
            Self::RefreshFailed(_) => ErrorKind::RefreshFailed,
            Self::MaxRefreshAttemptsExceeded { .. } => ErrorKind::MaxRefreshAttemptsExceeded,
            Self::Network(_) => ErrorKind::NetworkError,
            Self::Timeout { .. } => ErrorKind::TimeoutError,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Forbidden => ErrorKind::Forbidden,
            Self::ServerError { .. } => ErrorKind::ServerError,
            Self::TokenBlacklisted => ErrorKind::TokenBlacklisted,
            Self::QueueTornDown | Self::Unknown(_) => ErrorKind::UnknownError,
        }
    }

    /// Constructs a [`AuthError::TokenInvalid`] with the given reason
    pub fn token_invalid(reason: impl Into<String>) -> Self {
        Self::TokenInvalid {
            reason: reason.into(),
        }
    }

    /// Constructs a [`AuthError::RefreshFailed`] wrapping the given cause
    pub fn refresh_failed(cause: impl Into<BoxError>) -> Self {
        Self::RefreshFailed(Arc::from(cause.into()))
    }

    /// Constructs a [`AuthError::Network`] wrapping the given cause
    pub fn network(cause: impl Into<BoxError>) -> Self {
        Self::Network(Some(Arc::from(cause.into())))
    }

    /// Constructs a [`AuthError::Timeout`] for a wait of the given length
    pub fn timeout(waited: DurationSecs) -> Self {
        Self::Timeout { waited: waited.0 }
    }

    /// Constructs a [`AuthError::Unknown`] wrapping the given cause
    pub fn unknown(cause: impl Into<BoxError>) -> Self {
        Self::Unknown(Arc::from(cause.into()))
    }

    /// Classifies an arbitrary error structurally
    ///
    /// An error that already is an [`AuthError`] passes through unchanged, no
    /// matter how deeply the caller boxed it. Anything else is wrapped as a
    /// refresh failure with the original preserved as the source.
    pub fn classify(error: BoxError) -> Self {
        match error.downcast::<AuthError>() {
            Ok(err) => *err,
            Err(other) => Self::RefreshFailed(Arc::from(other)),
        }
    }
}
