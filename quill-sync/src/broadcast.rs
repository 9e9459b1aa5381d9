//! Space-wide fan-out for sidebar and page-list listeners.
//!
//! Each space gets one [`BroadcastGroup`] backed by a tokio broadcast
//! channel; a space connection belongs to at most one group at a time and a
//! forwarder task pumps that group's frames into its socket. One extra
//! channel reaches every connection regardless of space.
//!
//! ```text
//!  broadcast(msg, space) ──► encode once ──► group[space] ──► forwarders ──► sockets
//!                                      └───► relay.publish ──► other processes
//! ```
//!
//! Frames coming back from the relay carry their origin id so a broadcaster
//! never re-delivers its own messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::connection::{ConnectionId, SpaceConnection};
use crate::error::SyncError;
use crate::protocol::SpaceServerMessage;
use crate::services::{SessionUser, SpaceDirectory};

pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Subscribers of a single space.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<String>>,
    /// connection id → user id
    members: RwLock<HashMap<ConnectionId, Uuid>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Records the member and returns a receiver for frames sent from now on.
    pub async fn join(&self, conn: ConnectionId, user_id: Uuid) -> broadcast::Receiver<Arc<String>> {
        self.members.write().await.insert(conn, user_id);
        self.sender.subscribe()
    }

    /// Returns whether the connection was a member.
    pub async fn leave(&self, conn: &ConnectionId) -> bool {
        self.members.write().await.remove(conn).is_some()
    }

    /// Sends a pre-encoded frame. Returns the number of live receivers.
    pub fn send(&self, frame: Arc<String>) -> usize {
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.sender.send(frame).unwrap_or(0)
    }

    /// Number of connections currently joined.
    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Snapshot of the counters. Dropped frames are counted by forwarders
    /// that lagged behind the channel.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.member_count().await,
        }
    }
}

// ---------------------------------------------------------------
// Cross-process relay
// ---------------------------------------------------------------

/// A broadcast leaving this process. `room_id` of `None` targets everyone.
#[derive(Debug, Clone)]
pub struct RelayFrame {
    pub origin: Uuid,
    pub room_id: Option<Uuid>,
    pub payload: Arc<String>,
}

/// Hook for fanning broadcasts out to other server processes.
///
/// `publish` is called for every local broadcast and must not block; frames
/// arriving from elsewhere are handed to [`Broadcaster::deliver`].
pub trait BroadcastRelay: Send + Sync {
    fn publish(&self, frame: RelayFrame);
}

/// Single-process deployments: nothing leaves the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRelay;

impl BroadcastRelay for LocalRelay {
    fn publish(&self, _frame: RelayFrame) {}
}

/// A shared bus several broadcasters publish to and listen on.
#[derive(Debug, Clone)]
pub struct BusRelay {
    sender: broadcast::Sender<RelayFrame>,
}

impl BusRelay {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayFrame> {
        self.sender.subscribe()
    }
}

impl BroadcastRelay for BusRelay {
    fn publish(&self, frame: RelayFrame) {
        // No listeners is fine.
        let _ = self.sender.send(frame);
    }
}

// ---------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------

struct Membership {
    room: Uuid,
    forwarder: JoinHandle<()>,
}

pub struct Broadcaster {
    origin: Uuid,
    groups: RwLock<HashMap<Uuid, Arc<BroadcastGroup>>>,
    everyone: broadcast::Sender<Arc<String>>,
    memberships: Mutex<HashMap<ConnectionId, Membership>>,
    directory: Arc<dyn SpaceDirectory>,
    relay: Arc<dyn BroadcastRelay>,
    capacity: usize,
}

impl Broadcaster {
    pub fn new(
        directory: Arc<dyn SpaceDirectory>,
        relay: Arc<dyn BroadcastRelay>,
        capacity: usize,
    ) -> Self {
        let (everyone, _) = broadcast::channel(capacity.max(1));
        Self {
            origin: Uuid::new_v4(),
            groups: RwLock::new(HashMap::new()),
            everyone,
            memberships: Mutex::new(HashMap::new()),
            directory,
            relay,
            capacity,
        }
    }

    /// Id stamped on relayed frames so this broadcaster skips its own.
    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Adds the connection to the group of `room`, creating it if needed.
    /// Holds the map lock across the join so `leave_all` cannot drop the
    /// group between lookup and join.
    async fn join_group(
        &self,
        room: Uuid,
        conn: ConnectionId,
        user_id: Uuid,
    ) -> (Arc<BroadcastGroup>, broadcast::Receiver<Arc<String>>) {
        let mut groups = self.groups.write().await;
        let group = groups
            .entry(room)
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.capacity)))
            .clone();
        let rx = group.join(conn, user_id).await;
        (group, rx)
    }

    /// Joins `conn` to the space `room` after checking membership. Any
    /// previous membership of the connection is dropped first.
    pub async fn register_subscriber(
        &self,
        user: &SessionUser,
        conn: &SpaceConnection,
        room: Uuid,
    ) -> Result<(), SyncError> {
        if !self.directory.is_member(user.id, room).await? {
            let message = "You are not a member of this space";
            conn.send(&SpaceServerMessage::error(message));
            return Err(SyncError::PermissionDenied(message.to_string()));
        }

        self.leave_all(conn.id()).await;

        let (group, room_rx) = self.join_group(room, conn.id(), user.id).await;
        let everyone_rx = self.everyone.subscribe();
        let forwarder = tokio::spawn(forward(
            conn.clone(),
            room_rx,
            everyone_rx,
            group.stats.clone(),
        ));

        self.memberships
            .lock()
            .await
            .insert(conn.id(), Membership { room, forwarder });
        log::debug!("Connection {} joined space {room}", conn.id());
        Ok(())
    }

    /// Removes the connection from whatever space it is in.
    pub async fn leave_all(&self, conn: ConnectionId) {
        let Some(membership) = self.memberships.lock().await.remove(&conn) else {
            return;
        };
        membership.forwarder.abort();

        let mut groups = self.groups.write().await;
        if let Some(group) = groups.get(&membership.room) {
            group.leave(&conn).await;
            if group.member_count().await == 0 {
                groups.remove(&membership.room);
            }
        }
    }

    /// Sends `msg` to every subscriber of `room`, here and through the relay.
    pub async fn broadcast(&self, msg: &SpaceServerMessage, room: Uuid) -> usize {
        let Some(payload) = encode(msg) else {
            return 0;
        };
        self.relay.publish(RelayFrame {
            origin: self.origin,
            room_id: Some(room),
            payload: payload.clone(),
        });
        self.send_local(Some(room), payload).await
    }

    /// Sends `msg` to every space connection, here and through the relay.
    pub async fn broadcast_to_all(&self, msg: &SpaceServerMessage) -> usize {
        let Some(payload) = encode(msg) else {
            return 0;
        };
        self.relay.publish(RelayFrame {
            origin: self.origin,
            room_id: None,
            payload: payload.clone(),
        });
        self.send_local(None, payload).await
    }

    /// Delivers a frame received from the relay to local subscribers.
    pub async fn deliver(&self, frame: RelayFrame) -> usize {
        if frame.origin == self.origin {
            return 0;
        }
        self.send_local(frame.room_id, frame.payload).await
    }

    async fn send_local(&self, room: Option<Uuid>, payload: Arc<String>) -> usize {
        match room {
            Some(room) => {
                let group = self.groups.read().await.get(&room).cloned();
                group.map_or(0, |group| group.send(payload))
            }
            None => self.everyone.send(payload).unwrap_or(0),
        }
    }

    /// Starts delivering frames published on `bus` by other broadcasters.
    /// The task ends once this broadcaster is dropped or the bus closes.
    pub fn attach_bus(self: &Arc<Self>, bus: &BusRelay) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        let Some(broadcaster) = weak.upgrade() else {
                            break;
                        };
                        broadcaster.deliver(frame).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Relay listener lagged, skipped {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Local subscribers of `room`. Members held by other processes are not
    /// counted.
    pub async fn member_count(&self, room: Uuid) -> usize {
        let group = self.groups.read().await.get(&room).cloned();
        match group {
            Some(group) => group.member_count().await,
            None => 0,
        }
    }

    /// Spaces with at least one local subscriber.
    pub async fn room_count(&self) -> usize {
        self.groups.read().await.len()
    }

    /// Counters of the group for `room`, if it has local subscribers.
    pub async fn stats(&self, room: Uuid) -> Option<BroadcastStats> {
        let group = self.groups.read().await.get(&room).cloned()?;
        Some(group.stats().await)
    }
}

fn encode(msg: &SpaceServerMessage) -> Option<Arc<String>> {
    match serde_json::to_string(msg) {
        Ok(text) => Some(Arc::new(text)),
        Err(e) => {
            log::error!("Failed to encode space broadcast: {e}");
            None
        }
    }
}

async fn forward(
    conn: SpaceConnection,
    mut room_rx: broadcast::Receiver<Arc<String>>,
    mut everyone_rx: broadcast::Receiver<Arc<String>>,
    stats: Arc<AtomicBroadcastStats>,
) {
    loop {
        let received = tokio::select! {
            r = room_rx.recv() => r,
            r = everyone_rx.recv() => r,
        };
        match received {
            Ok(frame) => {
                if !conn.send_raw(frame.as_ref().clone()) {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
                log::warn!("Space connection {} lagged, dropped {n} frames", conn.id());
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
