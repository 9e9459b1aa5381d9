//! Durable page storage used by the sync engine.
//!
//! ```text
//! ┌──────────────┐  find / create / update   ┌────────────────────┐
//! │ RoomRegistry │ ────────────────────────► │ PageStore          │
//! │ apply_diff   │  create_diff / load_diffs │  ├ MemoryPageStore │
//! │ SpaceSession │  trash_pages              │  └ RocksPageStore  │
//! └──────────────┘                           └────────────────────┘
//! ```
//!
//! The engine only ever needs the handful of calls on [`PageStore`]; the
//! relational schema behind a production store is out of its hands.

pub mod memory;
pub mod rocks;

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use quill_doc::Node;

use crate::protocol::DiffMessage;

pub use memory::MemoryPageStore;
pub use rocks::{RocksPageStore, StoreConfig};

/// Errors from a [`PageStore`] backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Page not found: {0}")]
    NotFound(Uuid),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn default_page_type() -> String {
    "page".to_string()
}

pub(crate) fn page_path(id: &Uuid) -> String {
    let simple = id.simple().to_string();
    format!("page-{}", &simple[..12])
}

// ---------------------------------------------------------------
// Records
// ---------------------------------------------------------------

/// A page row: tree position, metadata and the last content snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRecord {
    pub id: Uuid,
    pub space_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub title: String,
    #[serde(rename = "type")]
    pub page_type: String,
    pub path: String,
    pub content: Node,
    pub content_text: String,
    pub has_content: bool,
    pub gallery_image: Option<String>,
    /// Version of `content`. Stored diffs may run ahead of it.
    pub version: u64,
    /// Trash timestamp in milliseconds.
    pub deleted_at: Option<u64>,
    pub created_by: Uuid,
    pub updated_by: Uuid,
    pub created_at: u64,
    pub updated_at: u64,
}

impl PageRecord {
    pub fn new(id: Uuid, space_id: Uuid, created_by: Uuid) -> Self {
        let now = now_millis();
        Self {
            id,
            space_id,
            parent_id: None,
            title: String::new(),
            page_type: default_page_type(),
            path: page_path(&id),
            content: Node::empty_doc(),
            content_text: String::new(),
            has_content: false,
            gallery_image: None,
            version: 0,
            deleted_at: None,
            created_by,
            updated_by: created_by,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_content(mut self, content: Node) -> Self {
        self.content = content;
        self
    }

    pub fn with_type(mut self, page_type: impl Into<String>) -> Self {
        self.page_type = page_type.into();
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// The sidebar view of this page.
    pub fn meta(&self) -> PageMeta {
        PageMeta {
            id: self.id,
            space_id: self.space_id,
            parent_id: self.parent_id,
            title: self.title.clone(),
            page_type: self.page_type.clone(),
            path: self.path.clone(),
            version: self.version,
            has_content: self.has_content,
            gallery_image: self.gallery_image.clone(),
            deleted_at: self.deleted_at,
            created_by: self.created_by,
            updated_at: self.updated_at,
        }
    }

    pub(crate) fn apply_snapshot(&mut self, snapshot: PageSnapshot) {
        self.content = snapshot.content;
        self.content_text = snapshot.content_text;
        self.has_content = snapshot.has_content;
        self.gallery_image = snapshot.gallery_image;
        self.version = snapshot.version;
        self.updated_by = snapshot.updated_by;
        self.updated_at = now_millis();
    }
}

/// Page fields broadcast to space subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub id: Uuid,
    pub space_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub title: String,
    #[serde(rename = "type")]
    pub page_type: String,
    pub path: String,
    pub version: u64,
    pub has_content: bool,
    pub gallery_image: Option<String>,
    pub deleted_at: Option<u64>,
    pub created_by: Uuid,
    pub updated_at: u64,
}

/// Payload of `page_created`. Missing fields get page defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPage {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub space_id: Uuid,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default = "default_page_type")]
    pub page_type: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub content: Option<Node>,
}

impl NewPage {
    pub fn into_record(self, created_by: Uuid) -> PageRecord {
        let id = self.id.unwrap_or_else(Uuid::new_v4);
        let mut record = PageRecord::new(id, self.space_id, created_by).with_type(self.page_type);
        record.parent_id = self.parent_id;
        record.title = self.title;
        if let Some(path) = self.path {
            record.path = path;
        }
        if let Some(content) = self.content {
            let snapshot = PageSnapshot::from_doc(id, &content, 0, created_by);
            record.apply_snapshot(snapshot);
        }
        record
    }
}

/// Content written back after edits.
#[derive(Debug, Clone, PartialEq)]
pub struct PageSnapshot {
    pub page_id: Uuid,
    pub content: Node,
    pub content_text: String,
    pub has_content: bool,
    pub gallery_image: Option<String>,
    pub version: u64,
    pub updated_by: Uuid,
}

impl PageSnapshot {
    /// Derives the plain text, emptiness and preview image from `doc`.
    pub fn from_doc(page_id: Uuid, doc: &Node, version: u64, updated_by: Uuid) -> Self {
        let content_text = doc.text_content();
        let has_content = !content_text.trim().is_empty()
            || doc
                .content()
                .iter()
                .any(|node| !matches!(node, Node::Paragraph(_)) || node.child_count() > 0);
        Self {
            page_id,
            content: doc.clone(),
            content_text,
            has_content,
            gallery_image: quill_doc::extract_preview_image(doc),
            version,
            updated_by,
        }
    }
}

/// A diff as persisted, keyed by page and the version it was applied to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDiff {
    pub page_id: Uuid,
    pub version: u64,
    pub created_by: Uuid,
    pub created_at: u64,
    pub data: DiffMessage,
}

impl StoredDiff {
    pub fn new(page_id: Uuid, version: u64, created_by: Uuid, data: DiffMessage) -> Self {
        Self {
            page_id,
            version,
            created_by,
            created_at: now_millis(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrashRequest {
    pub page_ids: Vec<Uuid>,
    pub user_id: Uuid,
    pub space_id: Uuid,
    /// `true` trashes, `false` restores.
    pub trash: bool,
}

// ---------------------------------------------------------------
// Store interface
// ---------------------------------------------------------------

/// Persistence for pages and their diff log.
#[async_trait]
pub trait PageStore: Send + Sync {
    /// Fails with [`StoreError::NotFound`] for unknown ids. Trashed pages
    /// are still returned.
    async fn find_page(&self, page_id: Uuid) -> Result<PageRecord, StoreError>;

    async fn create_page(&self, page: NewPage, created_by: Uuid) -> Result<PageRecord, StoreError>;

    /// Replaces the content snapshot and its derived fields.
    async fn update_page_content(&self, snapshot: PageSnapshot) -> Result<(), StoreError>;

    async fn set_page_parent(
        &self,
        page_id: Uuid,
        parent_id: Option<Uuid>,
        updated_by: Uuid,
    ) -> Result<(), StoreError>;

    async fn create_diff(&self, diff: StoredDiff) -> Result<(), StoreError>;

    /// The most recent `limit` diffs for a page, oldest first.
    async fn load_diffs(&self, page_id: Uuid, limit: usize) -> Result<Vec<DiffMessage>, StoreError>;

    /// Trashes or restores the pages and all their descendants. Returns the
    /// ids whose state actually changed.
    async fn trash_pages(&self, request: &TrashRequest) -> Result<Vec<Uuid>, StoreError>;

    /// Every page below `page_id`, excluding the page itself.
    async fn descendant_ids(&self, page_id: Uuid) -> Result<Vec<Uuid>, StoreError>;
}
