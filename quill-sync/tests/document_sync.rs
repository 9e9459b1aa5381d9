//! Document namespace tests driven through `DocumentSession` directly.
//!
//! Each peer is a session wired to an in-memory channel, so every frame
//! the server sends is visible as soon as `on_message` returns.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

use quill_doc::{find_page_ref, page_ref_node, Mark, Node, Slice, Step};
use quill_sync::context::{Collaborators, SyncConfig, SyncContext};
use quill_sync::document::DocumentSession;
use quill_sync::protocol::{
    ClientMessage, DiffMessage, Envelope, SelectionMessage, ServerMessage, SpaceClientMessage,
    SpaceServerMessage, SpaceSubscribe, SubscribePayload, NO_PAGE_ACCESS, OUT_OF_SYNC, SAVE_FAILED,
};
use quill_sync::services::{
    DocumentEvent, PagePermissions, RecordingPublisher, SessionUser, StaticDirectory,
};
use quill_sync::space::SpaceSession;
use quill_sync::storage::{MemoryPageStore, PageRecord, PageStore};

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Peer {
    user: Uuid,
    session: DocumentSession,
    rx: mpsc::UnboundedReceiver<String>,
    inbox: Vec<ServerMessage>,
    c: u64,
    s: u64,
}

impl Peer {
    async fn connect(ctx: &Arc<SyncContext>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = DocumentSession::new(ctx.clone(), tx);
        session.open().await;
        Self {
            user: Uuid::new_v4(),
            session,
            rx,
            inbox: Vec::new(),
            c: 0,
            s: 0,
        }
    }

    fn pull(&mut self) {
        while let Ok(text) = self.rx.try_recv() {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if let Some(s) = value["s"].as_u64() {
                self.s = self.s.max(s);
            }
            self.inbox.push(serde_json::from_value(value).unwrap());
        }
    }

    /// Everything received since the last drain.
    fn drain(&mut self) -> Vec<ServerMessage> {
        self.pull();
        std::mem::take(&mut self.inbox)
    }

    async fn send(&mut self, message: ClientMessage) {
        self.pull();
        self.c += 1;
        let (c, s) = (self.c, self.s);
        self.send_with(message, c, s).await;
    }

    async fn send_with(&mut self, message: ClientMessage, c: u64, s: u64) {
        let text = serde_json::to_string(&Envelope { message: &message, c, s }).unwrap();
        self.session.on_message(&text).await;
    }

    async fn subscribe(&mut self, page_id: Uuid) -> Vec<ServerMessage> {
        self.subscribe_as(page_id, format!("{}:Tester", self.user)).await
    }

    async fn subscribe_as(&mut self, page_id: Uuid, token: String) -> Vec<ServerMessage> {
        self.send(ClientMessage::Subscribe(SubscribePayload {
            room_id: page_id.to_string(),
            auth_token: token,
            connection: None,
        }))
        .await;
        self.drain()
    }

    async fn diff(&mut self, rid: u64, v: u64, steps: Vec<Step>) -> Vec<ServerMessage> {
        self.send(ClientMessage::Diff(DiffMessage::new(rid, v, steps))).await;
        self.drain()
    }
}

struct Fixture {
    ctx: Arc<SyncContext>,
    store: Arc<MemoryPageStore>,
    parent: PageRecord,
    child: PageRecord,
}

/// A parent page holding "hello" and a reference to its child at pos 7.
async fn fixture_with(config: SyncConfig, collaborators: Collaborators) -> Fixture {
    let store = Arc::new(MemoryPageStore::new());
    let space_id = Uuid::new_v4();
    let child_id = Uuid::new_v4();
    let parent = PageRecord::new(Uuid::new_v4(), space_id, Uuid::nil()).with_content(Node::doc(vec![
        Node::paragraph(vec![Node::text("hello")]),
        page_ref_node(child_id, Some("page"), None),
    ]));
    let child = PageRecord::new(child_id, space_id, Uuid::nil()).with_parent(parent.id);
    store.insert_page(parent.clone()).await;
    store.insert_page(child.clone()).await;
    let ctx = SyncContext::new(config, store.clone(), collaborators);
    Fixture {
        ctx,
        store,
        parent,
        child,
    }
}

async fn fixture() -> Fixture {
    let collaborators = Collaborators::from_directory(Arc::new(StaticDirectory::permissive()));
    fixture_with(SyncConfig::for_testing(), collaborators).await
}

fn insert_text(pos: usize, text: &str) -> Step {
    Step::replace(pos, pos, Slice::closed(vec![Node::text(text)]))
}

async fn room_version(ctx: &SyncContext, page_id: Uuid) -> u64 {
    let room = ctx.rooms.get(page_id).await.unwrap();
    let version = room.lock().await.version;
    version
}

// ─── Subscribe ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_subscribe_sends_document_and_participants() {
    let f = fixture().await;
    let mut alice = Peer::connect(&f.ctx).await;
    let messages = alice.subscribe(f.parent.id).await;

    assert!(matches!(messages[0], ServerMessage::Welcome));
    assert!(matches!(messages[1], ServerMessage::Subscribed));
    match &messages[2] {
        ServerMessage::DocData(data) => {
            assert_eq!(data.doc.v, 0);
            assert_eq!(data.doc.content, f.parent.content);
            assert_eq!(data.doc_info.id, f.parent.id);
            assert_eq!(data.doc_info.session_id, alice.session.connection().session_id());
        }
        other => panic!("expected doc_data, got {other:?}"),
    }
    match &messages[3] {
        ServerMessage::Connections { participant_list } => {
            assert_eq!(participant_list.len(), 1);
            assert_eq!(participant_list[0].id, alice.user);
            assert_eq!(participant_list[0].name, "Tester");
        }
        other => panic!("expected connections, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reconnect_skips_snapshot() {
    let f = fixture().await;
    let mut alice = Peer::connect(&f.ctx).await;
    alice
        .send(ClientMessage::Subscribe(SubscribePayload {
            room_id: f.parent.id.to_string(),
            auth_token: format!("{}:Alice", alice.user),
            connection: Some(2),
        }))
        .await;
    let messages = alice.drain();
    assert!(!messages.iter().any(|m| matches!(m, ServerMessage::DocData(_))));
    assert!(messages.iter().any(|m| matches!(m, ServerMessage::Subscribed)));
}

#[tokio::test]
async fn test_second_participant_updates_connections() {
    let f = fixture().await;
    let mut alice = Peer::connect(&f.ctx).await;
    let mut bob = Peer::connect(&f.ctx).await;
    alice.subscribe(f.parent.id).await;
    bob.subscribe(f.parent.id).await;

    let seen = alice.drain();
    let Some(ServerMessage::Connections { participant_list }) = seen.last() else {
        panic!("expected connections, got {seen:?}");
    };
    assert_eq!(participant_list.len(), 2);

    bob.session.close().await;
    let seen = alice.drain();
    let Some(ServerMessage::Connections { participant_list }) = seen.last() else {
        panic!("expected connections, got {seen:?}");
    };
    assert_eq!(participant_list.len(), 1);
}

#[tokio::test]
async fn test_invalid_token_rejected() {
    let f = fixture().await;
    let mut alice = Peer::connect(&f.ctx).await;
    let messages = alice.subscribe_as(f.parent.id, "not-a-token".to_string()).await;
    assert!(messages.iter().any(|m| matches!(m, ServerMessage::Error { .. })));
    assert!(f.ctx.rooms.get(f.parent.id).await.is_none());
}

#[tokio::test]
async fn test_page_without_access_rejected() {
    let directory = Arc::new(StaticDirectory::new());
    let user = SessionUser::new(Uuid::new_v4(), "Reader");
    directory.add_token("reader-token", user.clone()).await;
    let f = fixture_with(
        SyncConfig::for_testing(),
        Collaborators::from_directory(directory.clone()),
    )
    .await;

    let mut reader = Peer::connect(&f.ctx).await;
    let messages = reader.subscribe_as(f.parent.id, "reader-token".to_string()).await;
    assert!(messages.contains(&ServerMessage::error(NO_PAGE_ACCESS)));

    directory
        .grant(f.parent.id, user.id, PagePermissions::comment_only())
        .await;
    let messages = reader.subscribe_as(f.parent.id, "reader-token".to_string()).await;
    assert!(messages.contains(&ServerMessage::Subscribed));
}

// ─── Diffs ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_diff_confirmed_broadcast_and_saved() {
    let f = fixture().await;
    let mut alice = Peer::connect(&f.ctx).await;
    let mut bob = Peer::connect(&f.ctx).await;
    alice.subscribe(f.parent.id).await;
    bob.subscribe(f.parent.id).await;
    alice.drain();
    bob.drain();

    let messages = alice.diff(1, 0, vec![insert_text(6, "!")]).await;
    assert_eq!(messages, vec![ServerMessage::ConfirmDiff { rid: 1 }]);

    let seen = bob.drain();
    assert_eq!(seen.len(), 1);
    match &seen[0] {
        ServerMessage::Diff(diff) => {
            assert_eq!(diff.rid, 1);
            assert_eq!(diff.v, 0);
        }
        other => panic!("expected diff, got {other:?}"),
    }

    assert_eq!(room_version(&f.ctx, f.parent.id).await, 1);
    let saved = f.store.find_page(f.parent.id).await.unwrap();
    assert_eq!(saved.version, 1);
    assert_eq!(saved.content_text, "hello!");
    assert_eq!(f.store.stored_diffs(f.parent.id).await.len(), 1);
}

#[tokio::test]
async fn test_behind_client_receives_missing_diffs() {
    let f = fixture().await;
    let mut alice = Peer::connect(&f.ctx).await;
    let mut bob = Peer::connect(&f.ctx).await;
    alice.subscribe(f.parent.id).await;
    bob.subscribe(f.parent.id).await;

    alice.diff(1, 0, vec![insert_text(6, "!")]).await;
    bob.drain();

    // Bob edits against v0 after Alice's diff moved the room to v1.
    let messages = bob.diff(1, 0, vec![insert_text(1, ">")]).await;
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        ServerMessage::Diff(diff) => {
            assert_eq!(diff.v, 0);
            assert!(diff.server_fix);
        }
        other => panic!("expected replayed diff, got {other:?}"),
    }
    assert_eq!(room_version(&f.ctx, f.parent.id).await, 1);
}

#[tokio::test]
async fn test_ahead_client_ignored() {
    let f = fixture().await;
    let mut alice = Peer::connect(&f.ctx).await;
    alice.subscribe(f.parent.id).await;
    let messages = alice.diff(1, 5, vec![insert_text(6, "!")]).await;
    assert!(messages.is_empty());
    assert_eq!(room_version(&f.ctx, f.parent.id).await, 0);
}

#[tokio::test]
async fn test_unapplicable_diff_resyncs_everyone() {
    let f = fixture().await;
    let mut alice = Peer::connect(&f.ctx).await;
    let mut bob = Peer::connect(&f.ctx).await;
    alice.subscribe(f.parent.id).await;
    bob.subscribe(f.parent.id).await;
    alice.drain();
    bob.drain();

    let messages = alice.diff(1, 0, vec![Step::delete(100, 105)]).await;
    assert_eq!(messages, vec![ServerMessage::PatchError]);

    let seen = bob.drain();
    match &seen[..] {
        [ServerMessage::DocData(data)] => assert_eq!(data.doc.content, f.parent.content),
        other => panic!("expected a fresh document, got {other:?}"),
    }
    assert_eq!(room_version(&f.ctx, f.parent.id).await, 0);
}

#[tokio::test]
async fn test_slice_deeper_than_content_is_rejected() {
    let f = fixture().await;
    let list = PageRecord::new(Uuid::new_v4(), f.parent.space_id, Uuid::nil()).with_content(
        Node::from_json(json!({
            "type": "doc",
            "content": [{ "type": "bulletList", "content": [{ "type": "listItem", "content": [
                { "type": "paragraph", "content": [{ "type": "text", "text": "ab" }] }
            ]}]}]
        }))
        .unwrap(),
    );
    f.store.insert_page(list.clone()).await;
    let mut alice = Peer::connect(&f.ctx).await;
    alice.subscribe(list.id).await;

    let shallow = Slice::new(vec![Node::paragraph(Vec::new())], 2, 2);
    let messages = alice.diff(1, 0, vec![Step::replace(4, 4, shallow)]).await;
    assert_eq!(messages, vec![ServerMessage::PatchError]);
    assert_eq!(room_version(&f.ctx, list.id).await, 0);

    // The session keeps working afterwards.
    let messages = alice.diff(2, 0, vec![insert_text(4, "x")]).await;
    assert_eq!(messages, vec![ServerMessage::ConfirmDiff { rid: 2 }]);
    assert_eq!(room_version(&f.ctx, list.id).await, 1);
}

#[tokio::test]
async fn test_save_failure_reported_but_edit_kept() {
    let f = fixture().await;
    let mut alice = Peer::connect(&f.ctx).await;
    let mut bob = Peer::connect(&f.ctx).await;
    alice.subscribe(f.parent.id).await;
    bob.subscribe(f.parent.id).await;
    alice.drain();
    bob.drain();

    f.store.set_fail_writes(true);
    let messages = alice.diff(1, 0, vec![insert_text(6, "!")]).await;
    assert_eq!(
        messages,
        vec![
            ServerMessage::error(SAVE_FAILED),
            ServerMessage::ConfirmDiff { rid: 1 },
        ]
    );
    assert!(matches!(&bob.drain()[..], [ServerMessage::Diff(d)] if d.rid == 1));

    assert_eq!(room_version(&f.ctx, f.parent.id).await, 1);
    let saved = f.store.find_page(f.parent.id).await.unwrap();
    assert_eq!(saved.version, 0);
    assert!(f.store.stored_diffs(f.parent.id).await.is_empty());
}

#[tokio::test]
async fn test_trigger_marks_not_broadcast_or_saved() {
    let f = fixture().await;
    let mut alice = Peer::connect(&f.ctx).await;
    let mut bob = Peer::connect(&f.ctx).await;
    alice.subscribe(f.parent.id).await;
    bob.subscribe(f.parent.id).await;
    bob.drain();

    let trigger = Mark::new("mentionSuggest").with_attr("trigger", json!("@"));
    let typed = Slice::closed(vec![
        Node::text("@").with_marks(vec![trigger.clone()]),
        Node::text("x"),
    ]);
    let steps = vec![
        Step::replace(6, 6, typed),
        Step::AddMark { from: 6, to: 7, mark: trigger },
    ];
    alice.diff(1, 0, steps).await;

    let clean = Step::replace(6, 6, Slice::closed(vec![Node::text("@x")]));
    match &bob.drain()[..] {
        [ServerMessage::Diff(diff)] => assert_eq!(diff.ds, vec![clean.clone()]),
        other => panic!("expected one diff, got {other:?}"),
    }

    let saved = f.store.find_page(f.parent.id).await.unwrap();
    assert_eq!(saved.content_text, "hello@x");
    let paragraph = &saved.content.content()[0];
    assert!(paragraph.content().iter().all(|node| node.marks().is_empty()));
    assert_eq!(f.store.stored_diffs(f.parent.id).await[0].data.ds, vec![clean]);
}

// ─── Envelope counters ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_duplicate_message_dropped() {
    let f = fixture().await;
    let mut alice = Peer::connect(&f.ctx).await;
    alice.subscribe(f.parent.id).await;

    let diff = ClientMessage::Diff(DiffMessage::new(1, 0, vec![insert_text(6, "!")]));
    alice.send(diff.clone()).await;
    alice.drain();
    let (c, s) = (alice.c, alice.s);
    alice.send_with(diff, c, s).await;

    assert!(alice.drain().is_empty());
    assert_eq!(room_version(&f.ctx, f.parent.id).await, 1);
}

#[tokio::test]
async fn test_large_duplicate_diff_reports_out_of_sync() {
    let f = fixture().await;
    let mut alice = Peer::connect(&f.ctx).await;
    alice.subscribe(f.parent.id).await;

    let steps: Vec<Step> = (0..31).map(|i| insert_text(6 + i, "!")).collect();
    let diff = ClientMessage::Diff(DiffMessage::new(1, 0, steps));
    alice.send(diff.clone()).await;
    alice.drain();
    let (c, s) = (alice.c, alice.s);
    alice.send_with(diff, c, s).await;

    assert_eq!(alice.drain(), vec![ServerMessage::error(OUT_OF_SYNC)]);
    assert_eq!(room_version(&f.ctx, f.parent.id).await, 1);
}

#[tokio::test]
async fn test_gap_requests_resend() {
    let f = fixture().await;
    let mut alice = Peer::connect(&f.ctx).await;
    alice.subscribe(f.parent.id).await;

    let from = alice.c;
    let s = alice.s;
    alice
        .send_with(ClientMessage::CheckVersion { v: 0 }, from + 3, s)
        .await;
    assert_eq!(alice.drain(), vec![ServerMessage::RequestResend { from }]);
}

#[tokio::test]
async fn test_crossed_diff_replays_and_rejects() {
    let f = fixture().await;
    let mut alice = Peer::connect(&f.ctx).await;
    alice.subscribe(f.parent.id).await;

    // Claims to have seen only the welcome frame.
    let c = alice.c + 1;
    alice.c = c;
    let diff = ClientMessage::Diff(DiffMessage::new(7, 0, vec![insert_text(6, "!")]));
    alice.send_with(diff, c, 1).await;

    let messages = alice.drain();
    assert!(matches!(messages[0], ServerMessage::Subscribed));
    assert!(matches!(messages[1], ServerMessage::DocData(_)));
    assert_eq!(messages.last(), Some(&ServerMessage::RejectDiff { rid: 7 }));
    assert_eq!(room_version(&f.ctx, f.parent.id).await, 0);
}

#[tokio::test]
async fn test_resend_request_replays_buffer() {
    let f = fixture().await;
    let mut alice = Peer::connect(&f.ctx).await;
    alice.subscribe(f.parent.id).await;

    alice
        .session
        .on_message(&json!({ "type": "request_resend", "from": 2 }).to_string())
        .await;
    let messages = alice.drain();
    assert!(matches!(messages[0], ServerMessage::DocData(_)));
    assert!(matches!(messages[1], ServerMessage::Connections { .. }));
    assert_eq!(alice.session.connection().counters().await.1, 4);
}

// ─── Version checks and selections ──────────────────────────────────────────

#[tokio::test]
async fn test_check_version() {
    let f = fixture().await;
    let mut alice = Peer::connect(&f.ctx).await;
    let mut bob = Peer::connect(&f.ctx).await;
    alice.subscribe(f.parent.id).await;
    bob.subscribe(f.parent.id).await;
    alice.diff(1, 0, vec![insert_text(6, "!")]).await;
    bob.drain();

    bob.send(ClientMessage::CheckVersion { v: 1 }).await;
    assert_eq!(bob.drain(), vec![ServerMessage::ConfirmVersion { v: 1 }]);

    bob.send(ClientMessage::CheckVersion { v: 0 }).await;
    let messages = bob.drain();
    assert!(matches!(&messages[..], [ServerMessage::Diff(d)] if d.server_fix));
}

#[tokio::test]
async fn test_selection_forwarded_at_current_version() {
    let f = fixture().await;
    let mut alice = Peer::connect(&f.ctx).await;
    let mut bob = Peer::connect(&f.ctx).await;
    alice.subscribe(f.parent.id).await;
    bob.subscribe(f.parent.id).await;
    alice.drain();
    bob.drain();

    let alice_id = alice.user.to_string();
    let selection = |v| SelectionMessage {
        id: alice_id.clone(),
        session_id: String::new(),
        anchor: 2,
        head: 4,
        v,
    };
    alice.send(ClientMessage::SelectionChange(selection(3))).await;
    assert!(bob.drain().is_empty());

    alice.send(ClientMessage::SelectionChange(selection(0))).await;
    let seen = bob.drain();
    match &seen[..] {
        [ServerMessage::SelectionChange(sel)] => {
            assert_eq!(sel.session_id, alice.session.connection().session_id());
            assert_eq!((sel.anchor, sel.head), (2, 4));
        }
        other => panic!("expected one selection, got {other:?}"),
    }
    assert!(alice.drain().is_empty());
}

// ─── Side effects ───────────────────────────────────────────────────────────

async fn space_listener(f: &Fixture) -> (SpaceSession, mpsc::UnboundedReceiver<String>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = SpaceSession::new(f.ctx.clone(), tx);
    let message = SpaceClientMessage::Subscribe {
        payload: SpaceSubscribe {
            auth_token: Uuid::new_v4().to_string(),
            space_id: f.parent.space_id,
        },
    };
    session.on_message(&serde_json::to_string(&message).unwrap()).await;
    while rx.try_recv().is_ok() {}
    (session, rx)
}

/// Space frames arrive through the broadcaster's forwarding task.
async fn next_space_message(rx: &mut mpsc::UnboundedReceiver<String>) -> SpaceServerMessage {
    let text = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    serde_json::from_str(&text).unwrap()
}

#[tokio::test]
async fn test_deleting_reference_trashes_child_and_undo_restores() {
    let f = fixture().await;
    let (_listener, mut space_rx) = space_listener(&f).await;
    let mut alice = Peer::connect(&f.ctx).await;
    alice.subscribe(f.parent.id).await;

    alice.diff(1, 0, vec![Step::delete(7, 8)]).await;
    assert!(f.store.find_page(f.child.id).await.unwrap().is_deleted());
    match next_space_message(&mut space_rx).await {
        SpaceServerMessage::PagesDeleted { payload } => assert_eq!(payload[0].id, f.child.id),
        other => panic!("expected pages_deleted, got {other:?}"),
    }

    let reinsert = Slice::closed(vec![page_ref_node(f.child.id, Some("page"), None)]);
    let mut undo = DiffMessage::new(2, 1, vec![Step::replace(7, 7, reinsert)]);
    undo.undo = true;
    alice.send(ClientMessage::Diff(undo)).await;
    alice.drain();

    assert!(!f.store.find_page(f.child.id).await.unwrap().is_deleted());
    assert!(matches!(
        next_space_message(&mut space_rx).await,
        SpaceServerMessage::PagesRestored { .. }
    ));

    let room = f.ctx.rooms.get(f.parent.id).await.unwrap();
    assert_eq!(find_page_ref(&room.lock().await.doc, f.child.id), Some(7));
}

#[tokio::test]
async fn test_mentions_published_except_self() {
    let (publisher, mut events) = RecordingPublisher::new();
    let collaborators = Collaborators::from_directory(Arc::new(StaticDirectory::permissive()))
        .with_events(Arc::new(publisher));
    let f = fixture_with(SyncConfig::for_testing(), collaborators).await;
    let mut alice = Peer::connect(&f.ctx).await;
    alice.subscribe(f.parent.id).await;

    let mentioned = Uuid::new_v4();
    let mention = |value: Uuid| {
        Node::from_json(json!({
            "type": "mention",
            "attrs": { "id": format!("m-{value}"), "type": "user", "value": value.to_string() }
        }))
        .unwrap()
    };
    let steps = vec![Step::replace(
        6,
        6,
        Slice::closed(vec![mention(alice.user), mention(mentioned)]),
    )];
    alice.diff(1, 0, steps).await;

    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        DocumentEvent::UserMentioned {
            document_id: f.parent.id,
            space_id: f.parent.space_id,
            mention_id: format!("m-{mentioned}"),
            mentioned_user_id: mentioned,
            author_id: alice.user,
        }
    );
    assert!(timeout(Duration::from_millis(50), events.recv()).await.is_err());
}

// ─── Room lifetime ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_room_dropped_after_last_leave() {
    let f = fixture().await;
    let mut alice = Peer::connect(&f.ctx).await;
    alice.subscribe(f.parent.id).await;
    assert_eq!(f.ctx.rooms.room_count().await, 1);

    alice.session.close().await;
    sleep(Duration::from_millis(80)).await;
    assert_eq!(f.ctx.rooms.room_count().await, 0);
}

#[tokio::test]
async fn test_unsaved_diffs_replayed_on_reopen() {
    let config = SyncConfig {
        save_interval: 10,
        ..SyncConfig::for_testing()
    };
    let collaborators = Collaborators::from_directory(Arc::new(StaticDirectory::permissive()));
    let f = fixture_with(config, collaborators).await;

    let mut alice = Peer::connect(&f.ctx).await;
    alice.subscribe(f.parent.id).await;
    alice.diff(1, 0, vec![insert_text(6, "!")]).await;
    alice.session.close().await;
    sleep(Duration::from_millis(80)).await;

    // The snapshot is behind; the stored diff is not.
    assert_eq!(f.store.find_page(f.parent.id).await.unwrap().version, 0);

    let mut bob = Peer::connect(&f.ctx).await;
    let messages = bob.subscribe(f.parent.id).await;
    let data = messages
        .iter()
        .find_map(|m| match m {
            ServerMessage::DocData(data) => Some(data),
            _ => None,
        })
        .unwrap();
    assert_eq!(data.doc.v, 1);
    assert_eq!(data.doc.content.text_content(), "hello!");
}
