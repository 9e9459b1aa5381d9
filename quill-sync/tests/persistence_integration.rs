//! Persistence tests against RocksDB.
//!
//! Verifies:
//! - Live edits survive a restart of the engine
//! - Diffs saved after the last snapshot are replayed on reopen
//! - Space events edit stored content of closed pages
//! - Trash state of whole subtrees is durable

use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio::sync::mpsc;
use uuid::Uuid;

use quill_doc::{find_page_ref, page_ref_node, Node, Slice, Step};
use quill_sync::context::{Collaborators, SyncConfig, SyncContext};
use quill_sync::diff::DiffOrigin;
use quill_sync::document::DocumentSession;
use quill_sync::protocol::{ClientMessage, DiffMessage, Envelope, SubscribePayload};
use quill_sync::services::StaticDirectory;
use quill_sync::storage::{
    NewPage, PageRecord, PageStore, RocksPageStore, StoreConfig, TrashRequest,
};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_store(path: &std::path::Path) -> Arc<RocksPageStore> {
    Arc::new(RocksPageStore::open(StoreConfig::for_testing(path)).unwrap())
}

fn context(store: Arc<RocksPageStore>, config: SyncConfig) -> Arc<SyncContext> {
    SyncContext::new(
        config,
        store,
        Collaborators::from_directory(Arc::new(StaticDirectory::permissive())),
    )
}

fn new_page(space_id: Uuid, parent_id: Option<Uuid>) -> NewPage {
    NewPage {
        id: Some(Uuid::new_v4()),
        space_id,
        parent_id,
        title: String::new(),
        page_type: "page".to_string(),
        path: None,
        content: Some(Node::doc(vec![Node::paragraph(vec![Node::text("draft")])])),
    }
}

async fn create(store: &RocksPageStore, page: NewPage) -> PageRecord {
    store.create_page(page, Uuid::nil()).await.unwrap()
}

fn frame(message: &ClientMessage, c: u64, s: u64) -> String {
    serde_json::to_string(&Envelope { message, c, s }).unwrap()
}

/// Subscribes, appends each of `edits` to the first paragraph as its own
/// diff, then leaves and waits for the room to close.
async fn edit_live(ctx: &Arc<SyncContext>, page_id: Uuid, edits: &[&str]) {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut session = DocumentSession::new(ctx.clone(), tx);
    let subscribe = ClientMessage::Subscribe(SubscribePayload {
        room_id: page_id.to_string(),
        auth_token: Uuid::new_v4().to_string(),
        connection: Some(1),
    });
    session.on_message(&frame(&subscribe, 1, 0)).await;

    let mut pos = 6;
    for (v, text) in edits.iter().enumerate() {
        let step = Step::replace(pos, pos, Slice::closed(vec![Node::text(*text)]));
        let diff = ClientMessage::Diff(DiffMessage::new(v as u64 + 1, v as u64, vec![step]));
        let (c, s) = session.connection().counters().await;
        session.on_message(&frame(&diff, c + 1, s)).await;
        pos += text.encode_utf16().count();
    }

    session.close().await;
    tokio::time::sleep(Duration::from_millis(80)).await;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_live_edits_survive_restart() {
    let dir = tempdir().unwrap();
    let page = new_page(Uuid::new_v4(), None);
    let page_id = page.id.unwrap();
    {
        let store = open_store(dir.path());
        create(&store, page).await;
        let ctx = context(store, SyncConfig::for_testing());
        edit_live(&ctx, page_id, &[" one", " two"]).await;
    }

    let store = open_store(dir.path());
    let saved = store.find_page(page_id).await.unwrap();
    assert_eq!(saved.version, 2);
    assert_eq!(saved.content_text, "draft one two");
    assert_eq!(store.load_diffs(page_id, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_unsaved_diffs_replayed_after_restart() {
    let dir = tempdir().unwrap();
    let page = new_page(Uuid::new_v4(), None);
    let page_id = page.id.unwrap();
    {
        let store = open_store(dir.path());
        create(&store, page).await;
        let config = SyncConfig {
            save_interval: 100,
            ..SyncConfig::for_testing()
        };
        let ctx = context(store, config);
        edit_live(&ctx, page_id, &["!"]).await;
    }

    let store = open_store(dir.path());
    assert_eq!(store.find_page(page_id).await.unwrap().version, 0);

    let ctx = context(store.clone(), SyncConfig::for_testing());
    let room = ctx.rooms.get_or_create(page_id).await.unwrap();
    let guard = room.lock().await;
    assert_eq!(guard.version, 1);
    assert_eq!(guard.doc.text_content(), "draft!");
}

#[tokio::test]
async fn test_closed_page_edit_is_durable() {
    let dir = tempdir().unwrap();
    let page = new_page(Uuid::new_v4(), None);
    let page_id = page.id.unwrap();
    let child = Uuid::new_v4();
    {
        let store = open_store(dir.path());
        create(&store, page).await;
        let ctx = context(store, SyncConfig::for_testing());
        let edit = ctx
            .edit_page(page_id, Uuid::nil(), DiffOrigin::PageCreated, |doc| {
                let end = doc.content_size();
                Some(vec![Step::replace(
                    end,
                    end,
                    Slice::closed(vec![page_ref_node(child, Some("page"), None)]),
                )])
            })
            .await
            .unwrap();
        assert!(edit.applied());
    }

    let store = open_store(dir.path());
    let saved = store.find_page(page_id).await.unwrap();
    assert_eq!(saved.version, 1);
    assert_eq!(find_page_ref(&saved.content, child), Some(7));
}

#[tokio::test]
async fn test_trashed_subtree_is_durable() {
    let dir = tempdir().unwrap();
    let space_id = Uuid::new_v4();
    let (root, mid, leaf);
    {
        let store = open_store(dir.path());
        root = create(&store, new_page(space_id, None)).await;
        mid = create(&store, new_page(space_id, Some(root.id))).await;
        leaf = create(&store, new_page(space_id, Some(mid.id))).await;
        let ctx = context(store, SyncConfig::for_testing());
        let changed = ctx
            .trash_pages(TrashRequest {
                page_ids: vec![mid.id],
                user_id: Uuid::nil(),
                space_id,
                trash: true,
            })
            .await
            .unwrap();
        assert_eq!(changed.len(), 2);
    }

    let store = open_store(dir.path());
    assert!(!store.find_page(root.id).await.unwrap().is_deleted());
    assert!(store.find_page(mid.id).await.unwrap().is_deleted());
    assert!(store.find_page(leaf.id).await.unwrap().is_deleted());
    assert_eq!(store.descendant_ids(root.id).await.unwrap().len(), 2);
}
