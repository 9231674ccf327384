//! Connectivity awareness for transport-level recovery

use std::sync::Arc;

use renovi_clock::DurationSecs;
use tokio::sync::watch;

use crate::error::AuthError;

/// A shared flag tracking whether the network is believed reachable
///
/// Something outside this crate feeds the flag; this type only distributes
/// it. Clones share the same state.
#[derive(Clone, Debug)]
pub struct OnlineMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl Default for OnlineMonitor {
    /// A monitor that starts out online
    fn default() -> Self {
        Self::new(true)
    }
}

impl OnlineMonitor {
    /// Constructs a monitor with the given initial state
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self {
            state: Arc::new(tx),
        }
    }

    /// The current belief about connectivity
    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Updates the connectivity flag, waking any pending waits
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_replace(online) != online;
        if changed {
            tracing::debug!(online, "connectivity changed");
        }
    }

    /// Waits until the monitor reports online, up to `timeout` seconds
    ///
    /// Resolves immediately when already online. A wait that outlives the
    /// timeout fails with a timeout error rather than blocking forever.
    pub async fn wait_until_online(&self, timeout: DurationSecs) -> Result<(), AuthError> {
        let mut rx = self.state.subscribe();
        if *rx.borrow_and_update() {
            return Ok(());
        }

        let became_online = async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };

        tokio::time::timeout(timeout.into(), became_online)
            .await
            .map_err(|_| AuthError::timeout(timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test(start_paused = true)]
    async fn resolves_immediately_when_online() {
        let monitor = OnlineMonitor::default();
        monitor.wait_until_online(DurationSecs(5)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wakes_when_connectivity_returns() {
        let monitor = OnlineMonitor::new(false);
        let waiter = monitor.clone();

        let wait = tokio::spawn(async move { waiter.wait_until_online(DurationSecs(30)).await });
        tokio::task::yield_now().await;

        monitor.set_online(true);
        wait.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reports_timeout_when_still_offline() {
        let monitor = OnlineMonitor::new(false);
        let err = monitor
            .wait_until_online(DurationSecs(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimeoutError);
    }
}
