//! Shared state of the sync engine.
//!
//! [`SyncContext`] is built once at startup and handed to every session as
//! an `Arc`. It owns the room registry and the space broadcaster and holds
//! the injected services behind trait objects, so tests can swap in
//! [`StaticDirectory`] and the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use crate::broadcast::{BroadcastRelay, Broadcaster, LocalRelay, DEFAULT_BROADCAST_CAPACITY};
use crate::envelope::DEFAULT_REPLAY_CAPACITY;
use crate::room::RoomRegistry;
use crate::services::{
    EventPublisher, NoopPublisher, PermissionEngine, SessionVerifier, SpaceDirectory,
    StaticDirectory,
};
use crate::storage::PageStore;

/// Tunables of the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Diffs kept in memory per room for catching up lagging clients.
    pub history_length: usize,
    /// Snapshot the document every N applied diffs.
    pub save_interval: u64,
    /// Server messages kept per connection for resends.
    pub replay_capacity: usize,
    /// A duplicate diff with more steps than this asks the user to refresh.
    pub large_diff_threshold: usize,
    /// Grace period before an empty room is dropped.
    pub cleanup_delay: Duration,
    /// Queue size of each space broadcast channel. Slow listeners that fall
    /// further behind miss messages.
    pub broadcast_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_length: 1000,
            save_interval: 1,
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            large_diff_threshold: 30,
            cleanup_delay: Duration::from_millis(500),
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

impl SyncConfig {
    /// Defaults with a short cleanup delay so tests can watch rooms close.
    pub fn for_testing() -> Self {
        Self {
            cleanup_delay: Duration::from_millis(20),
            ..Self::default()
        }
    }
}

/// External services injected into the engine.
#[derive(Clone)]
pub struct Collaborators {
    pub permissions: Arc<dyn PermissionEngine>,
    pub sessions: Arc<dyn SessionVerifier>,
    pub directory: Arc<dyn SpaceDirectory>,
    pub events: Arc<dyn EventPublisher>,
    pub relay: Arc<dyn BroadcastRelay>,
}

impl Collaborators {
    /// Uses `directory` for permissions, sessions and membership.
    pub fn from_directory(directory: Arc<StaticDirectory>) -> Self {
        Self {
            permissions: directory.clone(),
            sessions: directory.clone(),
            directory,
            events: Arc::new(NoopPublisher),
            relay: Arc::new(LocalRelay),
        }
    }

    /// Replaces the no-op event publisher.
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Replaces the local relay, e.g. with one that fans out to other
    /// servers.
    pub fn with_relay(mut self, relay: Arc<dyn BroadcastRelay>) -> Self {
        self.relay = relay;
        self
    }
}

/// Everything a session handler needs, shared across connections.
pub struct SyncContext {
    pub config: SyncConfig,
    pub rooms: Arc<RoomRegistry>,
    pub store: Arc<dyn PageStore>,
    pub permissions: Arc<dyn PermissionEngine>,
    pub sessions: Arc<dyn SessionVerifier>,
    pub events: Arc<dyn EventPublisher>,
    pub broadcaster: Arc<Broadcaster>,
}

impl SyncContext {
    /// Wires the registry and broadcaster to the given store and services.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn PageStore>,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let rooms = Arc::new(RoomRegistry::new(
            store.clone(),
            config.history_length,
            config.cleanup_delay,
        ));
        let broadcaster = Arc::new(Broadcaster::new(
            collaborators.directory,
            collaborators.relay,
            config.broadcast_capacity,
        ));
        Arc::new(Self {
            config,
            rooms,
            store,
            permissions: collaborators.permissions,
            sessions: collaborators.sessions,
            events: collaborators.events,
            broadcaster,
        })
    }
}
