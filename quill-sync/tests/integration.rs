//! End-to-end tests over real WebSockets.
//!
//! These start a server on an ephemeral port and talk to it with the
//! bundled clients.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use uuid::Uuid;

use quill_doc::{page_ref_node, Node, Slice, Step};
use quill_sync::client::{SpaceClient, SyncClient};
use quill_sync::context::{Collaborators, SyncConfig, SyncContext};
use quill_sync::protocol::{
    ClientMessage, DiffMessage, ServerMessage, SpaceClientMessage, SpaceServerMessage,
    INVALID_MESSAGE,
};
use quill_sync::server::{ServerConfig, SyncServer};
use quill_sync::services::StaticDirectory;
use quill_sync::storage::{MemoryPageStore, NewPage, PageRecord, PageStore};

struct TestServer {
    addr: SocketAddr,
    store: Arc<MemoryPageStore>,
    page: PageRecord,
}

impl TestServer {
    fn document_url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    fn space_url(&self) -> String {
        format!("ws://{}/space", self.addr)
    }
}

async fn start_test_server() -> TestServer {
    let store = Arc::new(MemoryPageStore::new());
    let page = PageRecord::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::nil()).with_content(Node::doc(vec![
        Node::paragraph(vec![Node::text("shared")]),
        page_ref_node(Uuid::new_v4(), Some("page"), None),
    ]));
    store.insert_page(page.clone()).await;

    let ctx = SyncContext::new(
        SyncConfig::for_testing(),
        store.clone(),
        Collaborators::from_directory(Arc::new(StaticDirectory::permissive())),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = SyncServer::new(ServerConfig::default(), ctx);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestServer { addr, store, page }
}

fn token(name: &str) -> String {
    format!("{}:{name}", Uuid::new_v4())
}

async fn subscribed_client(server: &TestServer, name: &str) -> SyncClient {
    let mut client = SyncClient::connect(&server.document_url()).await.unwrap();
    assert_eq!(client.recv().await, Some(ServerMessage::Welcome));
    client.subscribe(server.page.id, &token(name), None).unwrap();
    let data = client
        .recv_until(|m| matches!(m, ServerMessage::DocData(_)))
        .await;
    assert!(data.is_some(), "{name} should receive the document");
    client
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let server = start_test_server().await;
    let result = tokio_tungstenite::connect_async(server.document_url()).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_two_clients_edit_same_page() {
    let server = start_test_server().await;
    let mut alice = subscribed_client(&server, "Alice").await;
    let mut bob = subscribed_client(&server, "Bob").await;
    // Alice has to see Bob join before her counters are current.
    alice
        .recv_until(|m| matches!(m, ServerMessage::Connections { participant_list } if participant_list.len() == 2))
        .await;

    let insert = Step::replace(7, 7, Slice::closed(vec![Node::text("!")]));
    alice.send_diff(DiffMessage::new(1, 0, vec![insert])).unwrap();

    let confirm = alice
        .recv_until(|m| matches!(m, ServerMessage::ConfirmDiff { .. }))
        .await;
    assert_eq!(confirm, Some(ServerMessage::ConfirmDiff { rid: 1 }));

    match bob.recv_until(|m| matches!(m, ServerMessage::Diff(_))).await {
        Some(ServerMessage::Diff(diff)) => {
            assert_eq!(diff.v, 0);
            assert_eq!(diff.ds.len(), 1);
        }
        other => panic!("Bob should see Alice's diff, got {other:?}"),
    }

    let saved = server.store.find_page(server.page.id).await.unwrap();
    assert_eq!(saved.content_text, "shared!");
    assert_eq!(saved.version, 1);
}

#[tokio::test]
async fn test_client_tracks_server_counter() {
    let server = start_test_server().await;
    let mut alice = subscribed_client(&server, "Alice").await;
    alice
        .recv_until(|m| matches!(m, ServerMessage::Connections { .. }))
        .await;
    // welcome, subscribed, doc_data, connections
    assert_eq!(alice.counters(), (1, 4));

    alice.send(&ClientMessage::CheckVersion { v: 0 }).unwrap();
    assert_eq!(
        alice.recv().await,
        Some(ServerMessage::ConfirmVersion { v: 0 })
    );
    assert_eq!(alice.counters(), (2, 5));
}

#[tokio::test]
async fn test_invalid_frame_reports_error() {
    let server = start_test_server().await;
    let mut client = SyncClient::connect(&server.document_url()).await.unwrap();
    client.recv().await;
    client.send_raw("not json").unwrap();
    assert_eq!(
        client.recv().await,
        Some(ServerMessage::error(INVALID_MESSAGE))
    );
}

#[tokio::test]
async fn test_space_clients_see_created_pages() {
    let server = start_test_server().await;
    let space_id = server.page.space_id;

    let mut sidebar = SpaceClient::connect(&server.space_url()).await.unwrap();
    let mut watcher = SpaceClient::connect(&server.space_url()).await.unwrap();
    for client in [&mut sidebar, &mut watcher] {
        assert_eq!(client.recv().await, Some(SpaceServerMessage::Welcome));
        client.subscribe(space_id, &token("Sidebar")).unwrap();
        assert_eq!(
            client.recv().await,
            Some(SpaceServerMessage::Subscribed { space_id })
        );
    }

    let id = Uuid::new_v4();
    sidebar
        .send(&SpaceClientMessage::PageCreated {
            payload: NewPage {
                id: Some(id),
                space_id,
                parent_id: Some(server.page.id),
                title: "Child".to_string(),
                page_type: "page".to_string(),
                path: None,
                content: None,
            },
        })
        .unwrap();

    for client in [&mut sidebar, &mut watcher] {
        match client.recv().await {
            Some(SpaceServerMessage::PagesCreated { payload }) => assert_eq!(payload[0].id, id),
            other => panic!("expected pages_created, got {other:?}"),
        }
    }
    let parent = server.store.find_page(server.page.id).await.unwrap();
    assert!(quill_doc::find_page_ref(&parent.content, id).is_some());
}

#[tokio::test]
async fn test_disconnect_leaves_room() {
    let server = start_test_server().await;
    let mut alice = subscribed_client(&server, "Alice").await;
    let bob = subscribed_client(&server, "Bob").await;
    alice
        .recv_until(|m| matches!(m, ServerMessage::Connections { participant_list } if participant_list.len() == 2))
        .await;

    bob.close();
    let update = alice
        .recv_until(|m| matches!(m, ServerMessage::Connections { .. }))
        .await;
    match update {
        Some(ServerMessage::Connections { participant_list }) => {
            assert_eq!(participant_list.len(), 1);
        }
        other => panic!("expected connections, got {other:?}"),
    }
}
