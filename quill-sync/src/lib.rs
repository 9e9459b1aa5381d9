//! # quill-sync: real-time page collaboration server
//!
//! Keeps one authoritative copy of every open page and reconciles the
//! step batches editors send against it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   document ns    ┌─────────────────┐
//! │ Editor       │ ◄──────────────► │ DocumentSession │──┐
//! └──────────────┘   JSON + c/s     └─────────────────┘  │
//!                                                        ▼
//!                                   ┌─────────────────────────────┐
//!                                   │ RoomRegistry                │
//!                                   │  DocumentRoom (per page)    │
//!                                   │   doc · version · history   │
//!                                   └──────────┬──────────────────┘
//!                                              │ diffs, snapshots
//! ┌──────────────┐   space ns       ┌──────────▼──────┐
//! │ Sidebar      │ ◄──────────────► │ SpaceSession    │──► PageStore
//! └──────────────┘                  └────────┬────────┘    (RocksDB)
//!                                            ▼
//!                                   ┌─────────────────┐
//!                                   │ Broadcaster     │──► BroadcastRelay
//!                                   └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON messages of both namespaces
//! - [`envelope`]: message counters and the replay buffer
//! - [`room`]: in-memory document rooms
//! - [`diff`]: the diff pipeline and its trash/restore side effects
//! - [`lifecycle`]: page edits and trashing shared by diffs and space events
//! - [`document`] / [`space`]: per-connection handlers
//! - [`broadcast`]: space fan-out with an optional cross-process relay
//! - [`storage`]: page store trait with RocksDB and in-memory backends
//! - [`server`] / [`client`]: WebSocket transport

pub mod broadcast;
pub mod client;
pub mod connection;
pub mod context;
pub mod diff;
pub mod document;
pub mod envelope;
pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod room;
pub mod server;
pub mod services;
pub mod space;
pub mod storage;

pub use broadcast::{
    BroadcastGroup, BroadcastRelay, BroadcastStats, Broadcaster, BusRelay, LocalRelay, RelayFrame,
};
pub use client::{SpaceClient, SyncClient};
pub use connection::{Connection, ConnectionId, SpaceConnection};
pub use context::{Collaborators, SyncConfig, SyncContext};
pub use diff::{apply_diff, apply_server_edit, save_snapshot, DiffOrigin, DiffOutcome};
pub use document::DocumentSession;
pub use envelope::{Admission, MessageCounters, Resend};
pub use error::{SyncError, SyncResult};
pub use lifecycle::PageEdit;
pub use protocol::{
    ClientMessage, DiffMessage, ProtocolError, ServerMessage, SpaceClientMessage,
    SpaceServerMessage,
};
pub use room::{DocumentRoom, Participant, RoomRegistry, SharedRoom};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use services::{
    DocumentEvent, EventPublisher, NoopPublisher, PagePermissions, PermissionEngine,
    RecordingPublisher, SessionUser, SessionVerifier, SpaceDirectory, StaticDirectory,
};
pub use space::SpaceSession;
pub use storage::{
    MemoryPageStore, NewPage, PageMeta, PageRecord, PageStore, RocksPageStore, StoreConfig,
    StoreError,
};
