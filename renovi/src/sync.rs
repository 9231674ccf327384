//! Propagation of token state between cooperating instances
//!
//! A browser app runs the same lifecycle in every tab; the synchronizer
//! keeps those instances agreeing on one pair. Messages carry full state, so
//! applying them is idempotent and duplicate or reordered delivery is
//! harmless. Inbound application never re-broadcasts, which rules out echo
//! loops by construction.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use renovi_clock::{Clock, System, UnixTime};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    error::AuthError, events::AuthEvents, manager::TokenManager, tokens::TokenPair,
};

/// A state change broadcast to sibling instances
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// A fresh pair was obtained; siblings should adopt it
    TokenUpdated {
        /// The pair to adopt
        pair: TokenPair,
        /// When the pair was obtained
        at: UnixTime,
    },
    /// The user logged out; siblings should forget their pair
    Logout {
        /// When the logout happened
        at: UnixTime,
    },
    /// The server revoked the pair; siblings should forget it and report it
    TokenBlacklisted {
        /// When the revocation was observed
        at: UnixTime,
    },
}

/// A broadcast channel between sibling instances
///
/// Publishing is fire-and-forget, and a publisher never receives its own
/// messages.
pub trait TabChannel: Send + Sync {
    /// Broadcasts a message to every sibling
    fn publish(&self, message: &SyncMessage);

    /// Opens a stream of messages published by siblings
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncMessage>;

    /// Detaches this instance from the channel
    fn close(&self);
}

#[derive(Debug)]
struct BusSubscriber {
    tab_id: u64,
    sender: mpsc::UnboundedSender<SyncMessage>,
}

#[derive(Debug, Default)]
struct BusShared {
    subscribers: Mutex<Vec<BusSubscriber>>,
    next_tab: AtomicU64,
}

/// An in-process broadcast bus
///
/// Each handle obtained through [`attach`][MessageBus::attach] represents
/// one instance; a handle's own publications are not delivered back to it.
#[derive(Debug)]
pub struct MessageBus {
    shared: Arc<BusShared>,
    tab_id: u64,
}

impl MessageBus {
    /// Creates a bus and its first handle
    pub fn new() -> Self {
        let shared = Arc::new(BusShared::default());
        Self {
            tab_id: shared.next_tab.fetch_add(1, Ordering::Relaxed),
            shared,
        }
    }

    /// Creates another handle on the same bus
    pub fn attach(&self) -> MessageBus {
        MessageBus {
            shared: Arc::clone(&self.shared),
            tab_id: self.shared.next_tab.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl TabChannel for MessageBus {
    fn publish(&self, message: &SyncMessage) {
        let mut subscribers = self
            .shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        // Closed receivers are pruned as a side effect of delivery
        subscribers.retain(|subscriber| {
            subscriber.tab_id == self.tab_id
                || subscriber.sender.send(message.clone()).is_ok()
        });
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(BusSubscriber {
                tab_id: self.tab_id,
                sender,
            });
        receiver
    }

    fn close(&self) {
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|subscriber| subscriber.tab_id != self.tab_id);
    }
}

/// A change observed on the shared storage area
#[derive(Clone, Debug)]
pub struct StorageEvent {
    /// The key that changed
    pub key: String,
    /// The value after the change; `None` for a deletion
    pub new_value: Option<String>,
}

#[derive(Debug)]
struct StorageWatcher {
    watcher_id: u64,
    sender: mpsc::UnboundedSender<StorageEvent>,
}

#[derive(Debug, Default)]
struct StorageShared {
    entries: Mutex<HashMap<String, String>>,
    watchers: Mutex<Vec<StorageWatcher>>,
    next_id: AtomicU64,
}

/// A shared key-value area with change notification
///
/// Change events are delivered to every watcher except the one belonging to
/// the originating handle, mirroring how browser storage events fire only in
/// other tabs.
#[derive(Clone, Debug, Default)]
pub struct SharedStorage {
    shared: Arc<StorageShared>,
}

impl SharedStorage {
    /// Creates an empty storage area
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the current value of a key
    pub fn get(&self, key: &str) -> Option<String> {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn set_from(&self, origin: u64, key: &str, value: &str) {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_owned(), value.to_owned());
        self.notify(
            origin,
            StorageEvent {
                key: key.to_owned(),
                new_value: Some(value.to_owned()),
            },
        );
    }

    fn remove_from(&self, origin: u64, key: &str) {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        self.notify(
            origin,
            StorageEvent {
                key: key.to_owned(),
                new_value: None,
            },
        );
    }

    fn notify(&self, origin: u64, event: StorageEvent) {
        let mut watchers = self
            .shared
            .watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        watchers.retain(|watcher| {
            watcher.watcher_id == origin || watcher.sender.send(event.clone()).is_ok()
        });
    }

    fn watch(&self, watcher_id: u64) -> mpsc::UnboundedReceiver<StorageEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.shared
            .watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(StorageWatcher { watcher_id, sender });
        receiver
    }

    fn unwatch(&self, watcher_id: u64) {
        self.shared
            .watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|watcher| watcher.watcher_id != watcher_id);
    }
}

/// The key transiently written to signal siblings through storage
pub const SYNC_SENTINEL_KEY: &str = "renovi.sync";

/// A [`TabChannel`] emulating a broadcast over shared storage
///
/// A message is published by writing it under a sentinel key and deleting it
/// immediately; siblings observe the write through their storage watchers.
/// Nothing durable is left behind, so a late joiner sees no stale messages.
#[derive(Debug)]
pub struct StorageSignalChannel {
    storage: SharedStorage,
    id: u64,
}

impl StorageSignalChannel {
    /// Attaches a new instance to the storage area
    pub fn attach(storage: SharedStorage) -> Self {
        let id = storage.next_id();
        Self { storage, id }
    }
}

impl TabChannel for StorageSignalChannel {
    fn publish(&self, message: &SyncMessage) {
        match serde_json::to_string(message) {
            Ok(json) => {
                self.storage.set_from(self.id, SYNC_SENTINEL_KEY, &json);
                self.storage.remove_from(self.id, SYNC_SENTINEL_KEY);
            }
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to encode sync message"
                );
            }
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut raw = self.storage.watch(self.id);

        tokio::spawn(async move {
            while let Some(event) = raw.recv().await {
                if event.key != SYNC_SENTINEL_KEY {
                    continue;
                }
                // Deletion events are the cleanup half of the signal
                let Some(value) = event.new_value else {
                    continue;
                };
                match serde_json::from_str(&value) {
                    Ok(message) => {
                        if sender.send(message).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(
                            error = &error as &dyn std::error::Error,
                            "ignoring undecodable sync message"
                        );
                    }
                }
            }
        });

        receiver
    }

    fn close(&self) {
        self.storage.unwatch(self.id);
    }
}

/// Keeps this instance's token state aligned with its siblings
///
/// Outbound broadcasts mirror local state changes; the inbound listener
/// applies sibling messages directly to the manager and event registry.
pub struct TabSynchronizer<C = System> {
    channel: Arc<dyn TabChannel>,
    clock: C,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<C> fmt::Debug for TabSynchronizer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabSynchronizer")
            .field(
                "listening",
                &self
                    .listener
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .is_some(),
            )
            .finish_non_exhaustive()
    }
}

impl TabSynchronizer<System> {
    /// Spawns a synchronizer on the system clock
    pub fn spawn(
        channel: Arc<dyn TabChannel>,
        manager: Arc<TokenManager<System>>,
        events: AuthEvents,
    ) -> Self {
        Self::spawn_with_clock(channel, manager, events, System)
    }
}

impl<C> TabSynchronizer<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Spawns a synchronizer with an explicit clock
    pub fn spawn_with_clock(
        channel: Arc<dyn TabChannel>,
        manager: Arc<TokenManager<C>>,
        events: AuthEvents,
        clock: C,
    ) -> Self {
        let mut inbound = channel.subscribe();
        let listener = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                apply(message, &manager, &events).await;
            }
        });

        Self {
            channel,
            clock,
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Announces a freshly obtained pair to siblings
    pub fn broadcast_token_update(&self, pair: &TokenPair) {
        self.channel.publish(&SyncMessage::TokenUpdated {
            pair: pair.clone(),
            at: self.clock.now(),
        });
    }

    /// Announces a logout to siblings
    pub fn broadcast_logout(&self) {
        self.channel.publish(&SyncMessage::Logout {
            at: self.clock.now(),
        });
    }

    /// Announces an observed revocation to siblings
    pub fn broadcast_token_blacklisted(&self) {
        self.channel.publish(&SyncMessage::TokenBlacklisted {
            at: self.clock.now(),
        });
    }

    /// Stops listening and detaches from the channel; safe to call repeatedly
    pub fn destroy(&self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            listener.abort();
        }
        self.channel.close();
    }
}

impl<C> Drop for TabSynchronizer<C> {
    fn drop(&mut self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            listener.abort();
        }
    }
}

async fn apply<C>(message: SyncMessage, manager: &Arc<TokenManager<C>>, events: &AuthEvents)
where
    C: Clock + Send + Sync + 'static,
{
    match message {
        SyncMessage::TokenUpdated { pair, .. } => {
            tracing::debug!("adopting token pair from sibling");
            manager.set_tokens(&pair).await;
        }
        SyncMessage::Logout { .. } => {
            tracing::debug!("sibling logged out");
            manager.clear_tokens().await;
            events.emit_logout();
        }
        SyncMessage::TokenBlacklisted { .. } => {
            tracing::warn!("sibling observed a blacklisted token");
            manager.clear_tokens().await;
            events.emit_auth_error(&AuthError::TokenBlacklisted);
        }
    }
}
