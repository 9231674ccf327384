//! Holding pen for requests that arrive while a refresh is in flight
//!
//! Each queued entry pairs a retry continuation with a oneshot used to settle
//! the enqueuer's future exactly once. Draining snapshots and clears the
//! pending list atomically, so a continuation enqueued while a drain is
//! running lands in the next generation rather than the one being drained.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::AuthError;

/// The future produced by a retry continuation
pub type RetryFuture<T> = Pin<Box<dyn Future<Output = Result<T, AuthError>> + Send>>;

/// A deferred retry of the original request
pub type RetryFn<T> = Box<dyn FnOnce() -> RetryFuture<T> + Send>;

struct QueuedRequest<T> {
    id: u64,
    retry: RetryFn<T>,
    settle: oneshot::Sender<Result<T, AuthError>>,
}

struct Inner<T> {
    pending: Mutex<Vec<QueuedRequest<T>>>,
    next_id: AtomicU64,
}

/// A queue of requests parked behind an in-flight refresh
///
/// Cloning is cheap and clones share the same pending list.
pub struct RequestQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RequestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for RequestQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("pending", &self.len())
            .finish()
    }
}

impl<T> Default for RequestQueue<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

impl<T> RequestQueue<T> {
    /// Constructs an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of requests currently parked
    pub fn len(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Whether no requests are currently parked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_pending(&self) -> Vec<QueuedRequest<T>> {
        std::mem::take(&mut *self.inner.pending.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Drops all pending continuations without running them
    ///
    /// For teardown and logout only. Enqueuers observe a torn-down error
    /// rather than a settled result.
    pub fn clear(&self) {
        let dropped = self.take_pending();
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "dropping parked requests");
        }
    }
}

impl<T: Send + 'static> RequestQueue<T> {
    /// Parks a retry continuation, returning a future settled on drain
    ///
    /// The returned future resolves exactly once: with the continuation's
    /// result after [`retry_all`][Self::retry_all], with the shared error
    /// after [`reject_all`][Self::reject_all], or with a torn-down error if
    /// the queue is cleared first.
    pub fn enqueue(&self, retry: RetryFn<T>) -> impl Future<Output = Result<T, AuthError>> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (settle, settled) = oneshot::channel();

        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(QueuedRequest { id, retry, settle });
        tracing::trace!(request.id = id, "parked request awaiting refresh");

        async move {
            match settled.await {
                Ok(result) => result,
                Err(_) => Err(AuthError::QueueTornDown),
            }
        }
    }

    /// Replays every pending continuation and settles its promise
    ///
    /// The pending list is snapshotted and cleared atomically before any
    /// continuation runs. Continuations run as independent tasks; one
    /// failing settles only its own promise.
    pub async fn retry_all(&self) {
        let pending = self.take_pending();
        if pending.is_empty() {
            return;
        }
        tracing::debug!(count = pending.len(), "replaying parked requests");

        let mut replays = Vec::with_capacity(pending.len());
        for request in pending {
            replays.push(tokio::spawn(async move {
                let result = (request.retry)().await;
                // The enqueuer may have gone away; that is not an error here
                let _ = request.settle.send(result);
            }));
        }

        for replay in replays {
            let _ = replay.await;
        }
    }

    /// Rejects every pending promise with a clone of the same error
    pub async fn reject_all(&self, error: AuthError) {
        let pending = self.take_pending();
        if pending.is_empty() {
            return;
        }
        tracing::debug!(
            count = pending.len(),
            error = &error as &dyn std::error::Error,
            "rejecting parked requests"
        );

        for request in pending {
            let _ = request.settle.send(Err(error.clone()));
        }
    }
}

/// The queue surface the refresh coordinator drives
///
/// Object-safe so the coordinator does not need to know the queued result
/// type.
#[async_trait]
pub trait DrainQueue: Send + Sync {
    /// Replays everything currently parked
    async fn retry_all(&self);

    /// Rejects everything currently parked with the given error
    async fn reject_all(&self, error: AuthError);

    /// Drops everything currently parked without settling
    fn clear(&self);
}

#[async_trait]
impl<T: Send + 'static> DrainQueue for RequestQueue<T> {
    async fn retry_all(&self) {
        RequestQueue::retry_all(self).await;
    }

    async fn reject_all(&self, error: AuthError) {
        RequestQueue::reject_all(self, error).await;
    }

    fn clear(&self) {
        RequestQueue::clear(self);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn retry_all_settles_every_promise_and_empties_the_queue() {
        let queue = RequestQueue::<u32>::new();

        let first = queue.enqueue(Box::new(|| Box::pin(async { Ok(1) })));
        let second = queue.enqueue(Box::new(|| Box::pin(async { Ok(2) })));
        assert_eq!(queue.len(), 2);

        queue.retry_all().await;
        assert!(queue.is_empty());

        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(second.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn one_failed_replay_rejects_only_its_own_promise() {
        let queue = RequestQueue::<u32>::new();

        let ok = queue.enqueue(Box::new(|| Box::pin(async { Ok(7) })));
        let failed = queue.enqueue(Box::new(|| {
            Box::pin(async { Err(AuthError::Unauthorized) })
        }));

        queue.retry_all().await;

        assert_eq!(ok.await.unwrap(), 7);
        assert_eq!(failed.await.unwrap_err().kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn reject_all_shares_one_error_across_promises() {
        let queue = RequestQueue::<u32>::new();

        let first = queue.enqueue(Box::new(|| Box::pin(async { Ok(1) })));
        let second = queue.enqueue(Box::new(|| Box::pin(async { Ok(2) })));

        queue
            .reject_all(AuthError::MaxRefreshAttemptsExceeded {
                attempts: 5,
                window: 60,
            })
            .await;
        assert!(queue.is_empty());

        assert_eq!(
            first.await.unwrap_err().kind(),
            ErrorKind::MaxRefreshAttemptsExceeded
        );
        assert_eq!(
            second.await.unwrap_err().kind(),
            ErrorKind::MaxRefreshAttemptsExceeded
        );
    }

    #[tokio::test]
    async fn clear_tears_down_without_running_continuations() {
        let ran = Arc::new(AtomicUsize::new(0));
        let queue = RequestQueue::<u32>::new();

        let count = ran.clone();
        let parked = queue.enqueue(Box::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(0) })
        }));

        queue.clear();

        assert_eq!(
            parked.await.unwrap_err().kind(),
            ErrorKind::UnknownError
        );
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn continuations_enqueued_during_a_drain_land_in_the_next_generation() {
        let queue = RequestQueue::<u32>::new();
        let queue_for_replay = queue.clone();

        let outer = queue.enqueue(Box::new(move || {
            let queue = queue_for_replay.clone();
            Box::pin(async move {
                // Enqueued mid-drain; must not be drained by this pass
                let _late = queue.enqueue(Box::new(|| Box::pin(async { Ok(99) })));
                Ok(1)
            })
        }));

        queue.retry_all().await;
        assert_eq!(outer.await.unwrap(), 1);
        assert_eq!(queue.len(), 1);
    }
}
