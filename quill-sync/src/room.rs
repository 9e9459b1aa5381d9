//! Live document rooms.
//!
//! A room holds the authoritative copy of one document while anyone has it
//! open: the content tree, its version, a window of recent diffs and the
//! connected participants. Rooms are created on first join and dropped a
//! short grace period after the last participant leaves.
//!
//! ```text
//!  RoomRegistry
//!   └─ rooms: doc_id → Arc<Mutex<DocumentRoom>>
//!                        ├─ doc + version
//!                        ├─ diff_history (ring buffer)
//!                        └─ participants: conn_id → Participant
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use quill_doc::{apply_steps, Node};

use crate::connection::{Connection, ConnectionId};
use crate::error::SyncError;
use crate::protocol::{DiffMessage, DocContent, DocData, DocInfo, ParticipantInfo, ServerMessage};
use crate::services::SessionUser;
use crate::storage::{now_millis, PageRecord, PageStore};

/// One connection's seat in a room.
#[derive(Debug)]
pub struct Participant {
    pub user: SessionUser,
    pub connection: Arc<Connection>,
    pub joined_at: Instant,
}

impl Participant {
    pub fn new(user: SessionUser, connection: Arc<Connection>) -> Self {
        Self {
            user,
            connection,
            joined_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Entry for the `connections` list sent to everyone in the room.
    pub fn info(&self) -> ParticipantInfo {
        let session_id = self.connection.session_id();
        ParticipantInfo {
            id: self.user.id,
            name: self.user.name.clone(),
            session_ids: vec![session_id.clone()],
            session_id,
        }
    }
}

#[derive(Debug)]
pub struct DocumentRoom {
    pub document_id: Uuid,
    pub space_id: Uuid,
    pub page_type: String,
    pub doc: Node,
    /// Number of diffs applied since the document was created.
    pub version: u64,
    /// Recent diffs, oldest first. The last one produced `version`.
    pub diff_history: VecDeque<DiffMessage>,
    /// Version of the last content snapshot written to the store.
    pub last_persisted_version: u64,
    participants: HashMap<ConnectionId, Arc<Participant>>,
    history_limit: usize,
}

pub type SharedRoom = Arc<Mutex<DocumentRoom>>;

impl DocumentRoom {
    pub fn new(document_id: Uuid, space_id: Uuid, doc: Node, version: u64, history_limit: usize) -> Self {
        Self {
            document_id,
            space_id,
            page_type: "page".to_string(),
            doc,
            version,
            diff_history: VecDeque::new(),
            last_persisted_version: version,
            participants: HashMap::new(),
            history_limit,
        }
    }

    /// Builds a room from a stored page and its most recent diffs. Diffs
    /// newer than the stored snapshot are replayed onto it.
    pub fn from_page(page: PageRecord, diffs: Vec<DiffMessage>, history_limit: usize) -> Self {
        let mut room = Self::new(page.id, page.space_id, page.content, page.version, history_limit);
        room.page_type = page.page_type;

        for diff in diffs {
            if diff.v < room.version {
                room.push_history(diff);
                continue;
            }
            if diff.v > room.version {
                log::warn!(
                    "Stored diff v{} of {} skips past v{}, ignoring the rest",
                    diff.v,
                    room.document_id,
                    room.version
                );
                break;
            }
            match apply_steps(&room.doc, &diff.ds) {
                Ok(doc) => {
                    room.doc = doc;
                    room.version += 1;
                    room.push_history(diff);
                }
                Err(e) => {
                    log::warn!("Stored diff v{} of {} no longer applies: {e}", diff.v, room.document_id);
                    break;
                }
            }
        }

        // Only a run ending at the current version is usable for catch-up.
        let mut expected = room.version;
        let mut keep = 0;
        for diff in room.diff_history.iter().rev() {
            if expected == 0 || diff.v != expected - 1 {
                break;
            }
            expected -= 1;
            keep += 1;
        }
        let drop = room.diff_history.len() - keep;
        room.diff_history.drain(..drop);
        room
    }

    /// Appends to the history, evicting the oldest entry once full.
    pub fn push_history(&mut self, diff: DiffMessage) {
        if self.history_limit == 0 {
            return;
        }
        if self.diff_history.len() == self.history_limit {
            self.diff_history.pop_front();
        }
        self.diff_history.push_back(diff);
    }

    /// Diffs a client at version `v` is missing, marked as server fixes.
    /// `None` when they have already left the history window.
    pub fn missing_diffs(&self, v: u64) -> Option<Vec<DiffMessage>> {
        let count = self.version.saturating_sub(v) as usize;
        if count > self.diff_history.len() {
            return None;
        }
        let skip = self.diff_history.len() - count;
        Some(
            self.diff_history
                .iter()
                .skip(skip)
                .cloned()
                .map(|mut diff| {
                    diff.server_fix = true;
                    diff
                })
                .collect(),
        )
    }

    pub fn add_participant(&mut self, participant: Arc<Participant>) {
        self.participants.insert(participant.id(), participant);
    }

    pub fn remove_participant(&mut self, conn: &ConnectionId) -> Option<Arc<Participant>> {
        self.participants.remove(conn)
    }

    pub fn has_participants(&self) -> bool {
        !self.participants.is_empty()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Participants in join order.
    pub fn all(&self) -> Vec<Arc<Participant>> {
        let mut all: Vec<_> = self.participants.values().cloned().collect();
        all.sort_by_key(|p| p.joined_at);
        all
    }

    /// Everyone except `conn`, in join order.
    pub fn others(&self, conn: &ConnectionId) -> Vec<Arc<Participant>> {
        self.all().into_iter().filter(|p| p.id() != *conn).collect()
    }

    pub fn participant_list(&self) -> Vec<ParticipantInfo> {
        self.all().iter().map(|p| p.info()).collect()
    }

    /// The participant a server edit is attributed to: one of `user_id`'s
    /// own sessions if present, otherwise whoever joined first.
    pub fn pick_participant(&self, user_id: Uuid) -> Option<Arc<Participant>> {
        let all = self.all();
        all.iter()
            .find(|p| p.user.id == user_id)
            .or_else(|| all.first())
            .cloned()
    }

    /// A `doc_data` frame with the current content, addressed to
    /// `session_id`.
    pub fn snapshot(&self, session_id: String) -> ServerMessage {
        ServerMessage::DocData(DocData {
            doc: DocContent {
                content: self.doc.clone(),
                v: self.version,
            },
            doc_info: DocInfo {
                id: self.document_id,
                session_id,
                version: self.version,
            },
            time: now_millis(),
            m: None,
        })
    }
}

// ---------------------------------------------------------------
// Registry
// ---------------------------------------------------------------

/// All open rooms on this server, keyed by document id.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, SharedRoom>>,
    store: Arc<dyn PageStore>,
    history_length: usize,
    cleanup_delay: Duration,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn PageStore>, history_length: usize, cleanup_delay: Duration) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            history_length,
            cleanup_delay,
        }
    }

    /// The open room for `document_id`. Never loads from the store.
    pub async fn get(&self, document_id: Uuid) -> Option<SharedRoom> {
        self.rooms.read().await.get(&document_id).cloned()
    }

    /// The open room for `document_id`, loading it from the store first if
    /// nobody has it open.
    ///
    /// Loading happens outside the registry lock, so two concurrent calls
    /// may both read the page. Only the first one to finish is kept.
    pub async fn get_or_create(&self, document_id: Uuid) -> Result<SharedRoom, SyncError> {
        if let Some(room) = self.get(document_id).await {
            return Ok(room);
        }

        let loaded = self.load(document_id).await?;

        let mut rooms = self.rooms.write().await;
        // Another join may have loaded it meanwhile.
        let room = rooms
            .entry(document_id)
            .or_insert_with(|| Arc::new(Mutex::new(loaded)))
            .clone();
        Ok(room)
    }

    async fn load(&self, document_id: Uuid) -> Result<DocumentRoom, SyncError> {
        let page = self.store.find_page(document_id).await?;
        let diffs = self.store.load_diffs(document_id, self.history_length).await?;
        let room = DocumentRoom::from_page(page, diffs, self.history_length);
        log::info!(
            "Loaded room {document_id} at v{} with {} diffs of history",
            room.version,
            room.diff_history.len()
        );
        Ok(room)
    }

    /// Adds `participant` to the document's room, loading it if needed.
    /// Retries if the room is cleaned up between lookup and join.
    pub async fn join(
        &self,
        document_id: Uuid,
        participant: Arc<Participant>,
    ) -> Result<SharedRoom, SyncError> {
        loop {
            let room = self.get_or_create(document_id).await?;
            let mut guard = room.lock().await;
            let current = self.get(document_id).await;
            if current.is_some_and(|r| Arc::ptr_eq(&r, &room)) {
                guard.add_participant(participant);
                drop(guard);
                return Ok(room);
            }
        }
    }

    /// Removes a connection from the room and returns who is left. An
    /// emptied room is dropped after the cleanup delay unless someone
    /// rejoins first.
    pub async fn leave(self: &Arc<Self>, document_id: Uuid, conn: ConnectionId) -> Vec<Arc<Participant>> {
        let Some(room) = self.get(document_id).await else {
            return Vec::new();
        };
        let remaining = {
            let mut guard = room.lock().await;
            guard.remove_participant(&conn);
            guard.all()
        };

        if remaining.is_empty() {
            let registry = Arc::clone(self);
            let delay = self.cleanup_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if registry.remove_if_empty(document_id).await {
                    log::debug!("Closed idle room {document_id}");
                }
            });
        }
        remaining
    }

    /// Drops the room if nobody is in it. A room that is locked is in use
    /// and stays.
    pub async fn remove_if_empty(&self, document_id: Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let empty = match rooms.get(&document_id) {
            Some(room) => match room.try_lock() {
                Ok(guard) => !guard.has_participants(),
                Err(_) => false,
            },
            None => false,
        };
        if empty {
            rooms.remove(&document_id);
        }
        empty
    }

    /// Number of open rooms, including emptied ones still in their grace
    /// period.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Ids of every open document, in no particular order.
    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }
}
