//! Per-connection handler for the document namespace.
//!
//! ```text
//!  Unauthenticated ──subscribe──▶ Subscribed ──unsubscribe/close──▶ Authenticated
//!                                     ▲                                  │
//!                                     └───────────subscribe──────────────┘
//! ```
//!
//! Every inbound frame first passes the envelope counters; only admitted
//! messages reach the handlers.

use std::mem;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::connection::Connection;
use crate::context::SyncContext;
use crate::diff::apply_diff;
use crate::envelope::{Admission, Resend};
use crate::protocol::{
    ClientMessage, Inbound, SelectionMessage, ServerMessage, SubscribePayload, AUTH_FAILED,
    INVALID_MESSAGE, LOAD_FAILED, NO_PAGE_ACCESS, OUT_OF_SYNC,
};
use crate::room::{Participant, SharedRoom};
use crate::services::{PagePermissions, SessionUser};

enum SessionState {
    Unauthenticated,
    Authenticated(SessionUser),
    Subscribed {
        participant: Arc<Participant>,
        document_id: Uuid,
        permissions: PagePermissions,
    },
}

/// Handler for one connection on the document namespace.
///
/// A session starts unauthenticated, becomes authenticated on a valid
/// `subscribe` and is then tied to a single room until it closes.
pub struct DocumentSession {
    ctx: Arc<SyncContext>,
    connection: Arc<Connection>,
    state: SessionState,
}

impl DocumentSession {
    pub fn new(ctx: Arc<SyncContext>, outbound: mpsc::UnboundedSender<String>) -> Self {
        let connection = Arc::new(Connection::new(outbound, ctx.config.replay_capacity));
        Self {
            ctx,
            connection,
            state: SessionState::Unauthenticated,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// The document this session is subscribed to, if any.
    pub fn document_id(&self) -> Option<Uuid> {
        match &self.state {
            SessionState::Subscribed { document_id, .. } => Some(*document_id),
            _ => None,
        }
    }

    pub fn user(&self) -> Option<&SessionUser> {
        match &self.state {
            SessionState::Unauthenticated => None,
            SessionState::Authenticated(user) => Some(user),
            SessionState::Subscribed { participant, .. } => Some(&participant.user),
        }
    }

    pub async fn open(&self) {
        self.connection.send(ServerMessage::Welcome).await;
    }

    /// Handles one inbound text frame. Errors are reported to the client,
    /// never returned.
    pub async fn on_message(&mut self, text: &str) {
        let inbound = match Inbound::parse(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                log::debug!("Unreadable frame on {}: {e}", self.connection.id());
                self.send_error(INVALID_MESSAGE).await;
                return;
            }
        };

        if let Some(from) = inbound.is_resend_request() {
            self.resend(from).await;
            return;
        }

        let (Some(c), Some(s)) = (inbound.c, inbound.s) else {
            self.send_error(INVALID_MESSAGE).await;
            return;
        };

        match self.connection.admit(c, s).await {
            Admission::Duplicate => {
                if inbound.is_diff && inbound.step_count > self.ctx.config.large_diff_threshold {
                    log::warn!(
                        "Large duplicate diff ({} steps) from {}",
                        inbound.step_count,
                        self.connection.id()
                    );
                    self.send_error(OUT_OF_SYNC).await;
                }
            }
            Admission::Gap { from } => {
                log::debug!("Requesting resend from client counter {from}");
                self.connection
                    .send(ServerMessage::RequestResend { from })
                    .await;
            }
            Admission::Stale { from } => {
                self.resend(from).await;
                if let Ok(ClientMessage::Diff(diff)) = &inbound.message {
                    self.connection
                        .send(ServerMessage::RejectDiff { rid: diff.rid })
                        .await;
                }
            }
            Admission::Accept => match inbound.message {
                Ok(message) => self.dispatch(message).await,
                Err(e) => {
                    log::debug!("Invalid message payload: {e}");
                    self.send_error(INVALID_MESSAGE).await;
                }
            },
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Subscribe(payload) => self.subscribe(payload).await,
            ClientMessage::Unsubscribe { .. } => self.leave_room().await,
            ClientMessage::RequestResend { from } => self.resend(from).await,
            ClientMessage::Unknown => log::debug!("Ignoring unknown message type"),
            ClientMessage::GetDocument => {
                if let Some(room) = self.room().await {
                    self.send_snapshot(&room).await;
                }
            }
            ClientMessage::CheckVersion { v } => {
                if let Some(room) = self.room().await {
                    self.check_version(&room, v).await;
                }
            }
            ClientMessage::SelectionChange(selection) => {
                if let Some(room) = self.room().await {
                    self.selection_change(&room, selection).await;
                }
            }
            ClientMessage::Diff(diff) => {
                let SessionState::Subscribed {
                    participant,
                    permissions,
                    ..
                } = &self.state
                else {
                    return;
                };
                if !permissions.can_collaborate() {
                    log::debug!("Dropping diff from read-only session {}", self.connection.id());
                    return;
                }
                let participant = participant.clone();
                if let Some(room) = self.room().await {
                    apply_diff(&self.ctx, &room, &participant, diff).await;
                }
            }
        }
    }

    /// The room of the subscribed document, if it is still open.
    async fn room(&self) -> Option<SharedRoom> {
        let SessionState::Subscribed { document_id, .. } = &self.state else {
            log::debug!("Ignoring message on unsubscribed connection {}", self.connection.id());
            return None;
        };
        let room = self.ctx.rooms.get(*document_id).await;
        if room.is_none() {
            log::debug!("Ignoring message for closed document {document_id}");
        }
        room
    }

    async fn subscribe(&mut self, payload: SubscribePayload) {
        let user = match self.ctx.sessions.verify(&payload.auth_token).await {
            Ok(user) => user,
            Err(e) => {
                log::warn!("Rejected subscription on {}: {e}", self.connection.id());
                self.send_error(AUTH_FAILED).await;
                return;
            }
        };
        let Ok(document_id) = Uuid::parse_str(&payload.room_id) else {
            self.send_error(format!("Invalid page id: {}", payload.room_id)).await;
            return;
        };

        self.leave_room().await;
        self.state = SessionState::Authenticated(user.clone());
        log::debug!("User {} subscribing to {document_id}", user.id);

        let permissions = match self
            .ctx
            .permissions
            .compute_page_permissions(document_id, user.id)
            .await
        {
            Ok(permissions) => permissions,
            Err(e) => {
                log::error!("Failed to compute permissions for {document_id}: {e}");
                self.send_error(LOAD_FAILED).await;
                return;
            }
        };
        if !permissions.can_collaborate() {
            self.send_error(NO_PAGE_ACCESS).await;
            return;
        }

        let participant = Arc::new(Participant::new(user, self.connection.clone()));
        let room = match self.ctx.rooms.join(document_id, participant.clone()).await {
            Ok(room) => room,
            Err(e) => {
                log::error!("Failed to open document {document_id}: {e}");
                self.send_error(LOAD_FAILED).await;
                return;
            }
        };
        self.state = SessionState::Subscribed {
            participant,
            document_id,
            permissions,
        };

        self.connection.send(ServerMessage::Subscribed).await;
        let guard = room.lock().await;
        if payload.connection.unwrap_or(0) < 1 {
            self.connection
                .send(guard.snapshot(self.connection.session_id()))
                .await;
        }
        let participant_list = guard.participant_list();
        for participant in guard.all() {
            participant
                .connection
                .send(ServerMessage::Connections {
                    participant_list: participant_list.clone(),
                })
                .await;
        }
    }

    async fn check_version(&self, room: &SharedRoom, v: u64) {
        let guard = room.lock().await;
        if v == guard.version {
            self.connection.send(ServerMessage::ConfirmVersion { v }).await;
            return;
        }
        let missing = if v < guard.version {
            guard.missing_diffs(v)
        } else {
            None
        };
        match missing {
            Some(diffs) => {
                log::debug!("Resending {} diffs after version check", diffs.len());
                for diff in diffs {
                    self.connection.send(ServerMessage::Diff(diff)).await;
                }
            }
            None => {
                self.connection
                    .send(guard.snapshot(self.connection.session_id()))
                    .await;
            }
        }
    }

    async fn selection_change(&self, room: &SharedRoom, mut selection: SelectionMessage) {
        let guard = room.lock().await;
        if selection.v != guard.version {
            return;
        }
        selection.session_id = self.connection.session_id();
        for participant in guard.others(&self.connection.id()) {
            participant
                .connection
                .send(ServerMessage::SelectionChange(selection.clone()))
                .await;
        }
    }

    /// Sends the full document, used when a client is too far behind for
    /// the diff history.
    async fn send_snapshot(&self, room: &SharedRoom) {
        let guard = room.lock().await;
        self.connection
            .send(guard.snapshot(self.connection.session_id()))
            .await;
    }

    /// Re-sends server messages after `from`, or the whole document when
    /// they are no longer buffered.
    async fn resend(&self, from: u64) {
        match self.connection.rewind(from).await {
            Resend::Replay(messages) => {
                for message in messages {
                    self.connection.send(message).await;
                }
            }
            Resend::Snapshot => {
                log::debug!("Too many messages to resend, sending document");
                if let Some(room) = self.room().await {
                    self.send_snapshot(&room).await;
                }
            }
        }
    }

    async fn send_error(&self, message: impl Into<String>) {
        self.connection.send(ServerMessage::error(message)).await;
    }

    async fn leave_room(&mut self) {
        let (participant, document_id) =
            match mem::replace(&mut self.state, SessionState::Unauthenticated) {
                SessionState::Subscribed {
                    participant,
                    document_id,
                    ..
                } => (participant, document_id),
                other => {
                    self.state = other;
                    return;
                }
            };
        self.state = SessionState::Authenticated(participant.user.clone());

        let remaining = self.ctx.rooms.leave(document_id, participant.id()).await;
        if remaining.is_empty() {
            return;
        }
        let participant_list: Vec<_> = remaining.iter().map(|p| p.info()).collect();
        for other in remaining {
            other
                .connection
                .send(ServerMessage::Connections {
                    participant_list: participant_list.clone(),
                })
                .await;
        }
    }

    /// Leaves the current room. Call when the socket goes away.
    pub async fn close(&mut self) {
        self.leave_room().await;
        self.state = SessionState::Unauthenticated;
    }
}
