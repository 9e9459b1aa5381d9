//! JSON wire protocol for the document and space namespaces.
//!
//! Document messages are wrapped in an envelope carrying the sender's
//! message counters next to the message fields:
//!
//! ```text
//!  { "type": "diff", "rid": 3, "v": 12, "ds": [ … ], "c": 7, "s": 4 }
//!   └──────────────── message ───────────────────┘  └ envelope ┘
//! ```
//!
//! Space messages are plain `{ "type": …, "payload": … }` objects.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use quill_doc::{Node, Step};

use crate::storage::{NewPage, PageMeta};

pub const INVALID_MESSAGE: &str = "Received invalid message";
pub const SAVE_FAILED: &str = "There was an error saving your changes! Please refresh and try again.";
pub const LOAD_FAILED: &str = "There was an error loading the page! Please try again later.";
pub const NO_PAGE_ACCESS: &str = "You do not have permission to view this page";
pub const OUT_OF_SYNC: &str = "Your document is out of sync. Please refresh the page and try again.";
pub const AUTH_FAILED: &str = "Unable to authenticate the connection";

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message is not a JSON object")]
    NotAnObject,
}

fn is_false(value: &bool) -> bool {
    !*value
}

// ---------------------------------------------------------------
// Document namespace
// ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    pub room_id: String,
    pub auth_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<u64>,
}

/// A batch of steps against base version `v`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffMessage {
    pub rid: u64,
    pub v: u64,
    #[serde(default)]
    pub ds: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ti: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub undo: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub server_fix: bool,
}

impl DiffMessage {
    pub fn new(rid: u64, v: u64, ds: Vec<Step>) -> Self {
        Self {
            rid,
            v,
            ds,
            cid: None,
            ti: None,
            undo: false,
            server_fix: false,
        }
    }

    /// A diff authored by the server itself.
    pub fn server(v: u64, ds: Vec<Step>) -> Self {
        Self::new(0, v, ds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionMessage {
    pub id: String,
    pub session_id: String,
    pub anchor: u64,
    pub head: u64,
    pub v: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe(SubscribePayload),
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        #[serde(default)]
        room_id: Option<String>,
    },
    GetDocument,
    CheckVersion {
        v: u64,
    },
    SelectionChange(SelectionMessage),
    Diff(DiffMessage),
    RequestResend {
        from: u64,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "sessionIds", default)]
    pub session_ids: Vec<String>,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocContent {
    pub content: Node,
    pub v: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocInfo {
    pub id: Uuid,
    pub session_id: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocData {
    pub doc: DocContent,
    #[serde(rename = "docInfo")]
    pub doc_info: DocInfo,
    pub time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<Vec<DiffMessage>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome,
    Subscribed,
    DocData(DocData),
    ConfirmDiff { rid: u64 },
    RejectDiff { rid: u64 },
    Connections { participant_list: Vec<ParticipantInfo> },
    ConfirmVersion { v: u64 },
    PatchError,
    Error { message: String },
    RequestResend { from: u64 },
    Diff(DiffMessage),
    SelectionChange(SelectionMessage),
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

/// Serializes `message` with envelope counters appended.
#[derive(Debug, Serialize)]
pub struct Envelope<'a, T: Serialize> {
    #[serde(flatten)]
    pub message: &'a T,
    pub c: u64,
    pub s: u64,
}

/// An inbound document frame split into envelope and message.
#[derive(Debug)]
pub struct Inbound {
    pub c: Option<u64>,
    pub s: Option<u64>,
    pub is_diff: bool,
    pub step_count: usize,
    pub message: Result<ClientMessage, serde_json::Error>,
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        let c = value.get("c").and_then(Value::as_u64);
        let s = value.get("s").and_then(Value::as_u64);
        let is_diff = value.get("type").and_then(Value::as_str) == Some("diff");
        let step_count = value.get("ds").and_then(Value::as_array).map_or(0, Vec::len);
        let message = serde_json::from_value(value);
        Ok(Self {
            c,
            s,
            is_diff,
            step_count,
            message,
        })
    }

    pub fn is_resend_request(&self) -> Option<u64> {
        match &self.message {
            Ok(ClientMessage::RequestResend { from }) => Some(*from),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------
// Space namespace
// ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceSubscribe {
    pub auth_token: String,
    pub space_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageIdPayload {
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderPayload {
    pub page_id: Uuid,
    #[serde(default)]
    pub new_parent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropPayload {
    pub page_id: Uuid,
    pub new_parent_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_pos: Option<usize>,
}

/// A page reference dragged from one document onto another page in the
/// editor. `page_id` is a path rather than a uuid for static pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorDragPayload {
    pub page_id: String,
    pub new_parent_id: Uuid,
    #[serde(default)]
    pub current_parent_id: Option<Uuid>,
    /// Position of the dragged node in the current parent's document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drag_node_pos: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dragged_node: Option<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicatePayload {
    pub page_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpaceClientMessage {
    Subscribe { payload: SpaceSubscribe },
    PageCreated { payload: NewPage },
    PageDeleted { payload: PageIdPayload },
    PageRestored { payload: PageIdPayload },
    PageReorderedSidebarToSidebar { payload: ReorderPayload },
    PageReorderedSidebarToEditor { payload: DropPayload },
    PageReorderedEditorToEditor { payload: EditorDragPayload },
    PageDuplicated { payload: DuplicatePayload },
    #[serde(other)]
    Unknown,
}

impl SpaceClientMessage {
    pub fn name(&self) -> &'static str {
        match self {
            SpaceClientMessage::Subscribe { .. } => "subscribe",
            SpaceClientMessage::PageCreated { .. } => "page_created",
            SpaceClientMessage::PageDeleted { .. } => "page_deleted",
            SpaceClientMessage::PageRestored { .. } => "page_restored",
            SpaceClientMessage::PageReorderedSidebarToSidebar { .. } => {
                "page_reordered_sidebar_to_sidebar"
            }
            SpaceClientMessage::PageReorderedSidebarToEditor { .. } => {
                "page_reordered_sidebar_to_editor"
            }
            SpaceClientMessage::PageReorderedEditorToEditor { .. } => {
                "page_reordered_editor_to_editor"
            }
            SpaceClientMessage::PageDuplicated { .. } => "page_duplicated",
            SpaceClientMessage::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMetaUpdate {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub space_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpaceServerMessage {
    Welcome,
    #[serde(rename_all = "camelCase")]
    Subscribed { space_id: Uuid },
    Error { message: String },
    PagesCreated { payload: Vec<PageMeta> },
    PagesDeleted { payload: Vec<PageIdPayload> },
    PagesRestored { payload: Vec<PageIdPayload> },
    PagesMetaUpdated { payload: Vec<PageMetaUpdate> },
}

impl SpaceServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        SpaceServerMessage::Error {
            message: message.into(),
        }
    }
}
