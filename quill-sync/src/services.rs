//! Collaborators the sync engine consumes but does not own: permission
//! computation, session verification, space membership and the event bus.
//!
//! [`StaticDirectory`] answers the first three from in-memory tables and
//! backs tests and the development server.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::SyncError;

/// What a user may do with one page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagePermissions {
    pub read: bool,
    pub edit_content: bool,
    pub comment: bool,
    pub delete: bool,
}

impl PagePermissions {
    pub fn full() -> Self {
        Self {
            read: true,
            edit_content: true,
            comment: true,
            delete: true,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn comment_only() -> Self {
        Self {
            read: true,
            comment: true,
            ..Self::default()
        }
    }

    /// Whether the holder may join the live document and send diffs.
    pub fn can_collaborate(&self) -> bool {
        self.edit_content || self.comment
    }
}

/// The user behind a verified auth token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub id: Uuid,
    pub name: String,
}

impl SessionUser {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Computes a user's permissions on a page.
#[async_trait]
pub trait PermissionEngine: Send + Sync {
    async fn compute_page_permissions(
        &self,
        page_id: Uuid,
        user_id: Uuid,
    ) -> Result<PagePermissions, SyncError>;
}

/// Resolves the auth token a client sends with `subscribe`.
#[async_trait]
pub trait SessionVerifier: Send + Sync {
    /// Fails with [`SyncError::Unauthorized`] for unknown or expired
    /// tokens.
    async fn verify(&self, auth_token: &str) -> Result<SessionUser, SyncError>;
}

#[async_trait]
pub trait SpaceDirectory: Send + Sync {
    /// Whether the user holds a role in the space.
    async fn is_member(&self, user_id: Uuid, space_id: Uuid) -> Result<bool, SyncError>;
}

/// Events the engine emits for other services to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    UserMentioned {
        document_id: Uuid,
        space_id: Uuid,
        mention_id: String,
        mentioned_user_id: Uuid,
        author_id: Uuid,
    },
}

/// Delivers [`DocumentEvent`]s, e.g. to a notification queue.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishing happens after the diff is confirmed, so a failure here
    /// never undoes an edit.
    async fn publish(&self, event: DocumentEvent) -> Result<(), SyncError>;
}

// ---------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------

/// Token, grant and membership tables kept in memory.
///
/// In permissive mode any token of the form `<uuid>[:<name>]` is accepted,
/// every user is a member of every space and holds full permissions.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    tokens: RwLock<HashMap<String, SessionUser>>,
    grants: RwLock<HashMap<(Uuid, Uuid), PagePermissions>>,
    members: RwLock<HashSet<(Uuid, Uuid)>>,
    permissive: bool,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A directory that trusts any well-formed token. Development only.
    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Self::default()
        }
    }

    pub async fn add_token(&self, token: impl Into<String>, user: SessionUser) {
        self.tokens.write().await.insert(token.into(), user);
    }

    /// Overrides the permissions of `user_id` on `page_id`.
    pub async fn grant(&self, page_id: Uuid, user_id: Uuid, permissions: PagePermissions) {
        self.grants
            .write()
            .await
            .insert((page_id, user_id), permissions);
    }

    pub async fn add_member(&self, user_id: Uuid, space_id: Uuid) {
        self.members.write().await.insert((user_id, space_id));
    }

    fn parse_permissive_token(token: &str) -> Option<SessionUser> {
        let (id, name) = match token.split_once(':') {
            Some((id, name)) => (id, name),
            None => (token, "Anonymous"),
        };
        let id = Uuid::parse_str(id).ok()?;
        Some(SessionUser::new(id, name))
    }
}

#[async_trait]
impl PermissionEngine for StaticDirectory {
    async fn compute_page_permissions(
        &self,
        page_id: Uuid,
        user_id: Uuid,
    ) -> Result<PagePermissions, SyncError> {
        if self.permissive {
            return Ok(PagePermissions::full());
        }
        Ok(self
            .grants
            .read()
            .await
            .get(&(page_id, user_id))
            .copied()
            .unwrap_or_default())
    }
}

#[async_trait]
impl SessionVerifier for StaticDirectory {
    async fn verify(&self, auth_token: &str) -> Result<SessionUser, SyncError> {
        if let Some(user) = self.tokens.read().await.get(auth_token) {
            return Ok(user.clone());
        }
        if self.permissive {
            if let Some(user) = Self::parse_permissive_token(auth_token) {
                return Ok(user);
            }
        }
        Err(SyncError::Unauthorized("invalid auth token".to_string()))
    }
}

#[async_trait]
impl SpaceDirectory for StaticDirectory {
    async fn is_member(&self, user_id: Uuid, space_id: Uuid) -> Result<bool, SyncError> {
        if self.permissive {
            return Ok(true);
        }
        Ok(self.members.read().await.contains(&(user_id, space_id)))
    }
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, event: DocumentEvent) -> Result<(), SyncError> {
        log::trace!("Discarding document event {event:?}");
        Ok(())
    }
}

/// Forwards every published event to a channel.
#[derive(Debug, Clone)]
pub struct RecordingPublisher {
    sender: mpsc::UnboundedSender<DocumentEvent>,
}

impl RecordingPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DocumentEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: DocumentEvent) -> Result<(), SyncError> {
        self.sender
            .send(event)
            .map_err(|_| SyncError::Service("event receiver dropped".to_string()))
    }
}
