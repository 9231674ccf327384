//! Token storage contract and backends
//!
//! The store holds exactly one access/refresh pair at a time. Reads are
//! synchronous and infallible so hot paths never block on persistence;
//! writes are asynchronous and may fail, and callers are expected to treat a
//! failed write as non-fatal.

use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    error::BoxError, AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef,
};

/// An error from a token store backend
#[derive(Debug, Error)]
#[error("token store backend error")]
pub struct StoreError(#[source] BoxError);

impl StoreError {
    /// Wraps an arbitrary backend error
    pub fn new(cause: impl Into<BoxError>) -> Self {
        Self(cause.into())
    }
}

/// The persistence boundary for the current token pair
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// The currently stored access token, if any
    fn access_token(&self) -> Option<AccessToken>;

    /// The currently stored refresh token, if any
    fn refresh_token(&self) -> Option<RefreshToken>;

    /// Replaces the stored pair
    async fn set_tokens(
        &self,
        access: &AccessTokenRef,
        refresh: &RefreshTokenRef,
    ) -> Result<(), StoreError>;

    /// Removes any stored pair
    async fn clear_tokens(&self) -> Result<(), StoreError>;
}

/// The default store, holding the pair in process memory only
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: Mutex<Option<(AccessToken, RefreshToken)>>,
}

impl InMemoryTokenStore {
    /// Constructs an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    fn access_token(&self) -> Option<AccessToken> {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(access, _)| access.clone())
    }

    fn refresh_token(&self) -> Option<RefreshToken> {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(_, refresh)| refresh.clone())
    }

    async fn set_tokens(
        &self,
        access: &AccessTokenRef,
        refresh: &RefreshTokenRef,
    ) -> Result<(), StoreError> {
        *self.tokens.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((access.to_owned(), refresh.to_owned()));
        Ok(())
    }

    async fn clear_tokens(&self) -> Result<(), StoreError> {
        *self.tokens.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

/// A store for environments with no persistence at all
///
/// Getters always report no tokens and mutators silently succeed, so the
/// surrounding machinery behaves identically whether or not storage exists.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTokenStore;

#[async_trait]
impl TokenStore for NoopTokenStore {
    fn access_token(&self) -> Option<AccessToken> {
        None
    }

    fn refresh_token(&self) -> Option<RefreshToken> {
        None
    }

    async fn set_tokens(
        &self,
        _access: &AccessTokenRef,
        _refresh: &RefreshTokenRef,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn clear_tokens(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(feature = "file")]
pub use self::file::FileTokenStore;

#[cfg(feature = "file")]
mod file {
    use std::{io, path::PathBuf, sync::Mutex};

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use tokio::fs::OpenOptions;

    use super::{StoreError, TokenStore};
    use crate::{AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef};

    #[derive(Serialize, Deserialize)]
    struct StoredTokens {
        access_token: AccessToken,
        refresh_token: RefreshToken,
    }

    /// A store that persists the pair to a local file
    ///
    /// Reads are served from an in-memory copy loaded at construction, so a
    /// slow filesystem never sits on the request path. The file is written
    /// with owner-only permissions on unix.
    #[derive(Debug)]
    pub struct FileTokenStore {
        path: PathBuf,
        cached: Mutex<Option<(AccessToken, RefreshToken)>>,
    }

    impl FileTokenStore {
        /// Opens a file store, loading any previously persisted pair
        ///
        /// A missing file is an empty store, not an error.
        pub async fn load(path: PathBuf) -> Result<Self, StoreError> {
            let cached = match read_tokens(&path).await {
                Ok(stored) => Some((stored.access_token, stored.refresh_token)),
                Err(error) if error.kind() == io::ErrorKind::NotFound => None,
                Err(error) => return Err(StoreError::new(error)),
            };

            Ok(Self {
                path,
                cached: Mutex::new(cached),
            })
        }
    }

    async fn read_tokens(path: &PathBuf) -> Result<StoredTokens, io::Error> {
        use tokio::io::AsyncReadExt;

        let mut file = OpenOptions::new().read(true).open(path).await?;
        let mut data = String::new();
        file.read_to_string(&mut data).await?;
        let stored = serde_json::from_str(&data)?;
        Ok(stored)
    }

    async fn write_tokens(path: &PathBuf, stored: &StoredTokens) -> Result<(), io::Error> {
        use tokio::io::AsyncWriteExt;

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(path).await?;
        let data = serde_json::to_string_pretty(stored)?;
        file.write_all(data.as_bytes()).await?;
        Ok(())
    }

    #[async_trait]
    impl TokenStore for FileTokenStore {
        fn access_token(&self) -> Option<AccessToken> {
            self.cached
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
                .map(|(access, _)| access.clone())
        }

        fn refresh_token(&self) -> Option<RefreshToken> {
            self.cached
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
                .map(|(_, refresh)| refresh.clone())
        }

        async fn set_tokens(
            &self,
            access: &AccessTokenRef,
            refresh: &RefreshTokenRef,
        ) -> Result<(), StoreError> {
            // The in-memory copy is updated first so a failed write degrades
            // to in-memory behavior rather than losing the pair.
            *self.cached.lock().unwrap_or_else(|e| e.into_inner()) =
                Some((access.to_owned(), refresh.to_owned()));

            let stored = StoredTokens {
                access_token: access.to_owned(),
                refresh_token: refresh.to_owned(),
            };
            write_tokens(&self.path, &stored)
                .await
                .map_err(StoreError::new)
        }

        async fn clear_tokens(&self) -> Result<(), StoreError> {
            *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = None;

            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(error) => Err(StoreError::new(error)),
            }
        }
    }

}
