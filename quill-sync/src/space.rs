//! Per-connection handler for the space namespace.
//!
//! Space events change the page tree from outside the editor. Each one
//! keeps the parent page's document in step: if the parent is open the
//! change goes through its room as a server diff, otherwise the stored
//! content is edited directly. Sidebar listeners learn about the result
//! through space broadcasts.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use quill_doc::{
    block_insert_position, child_insert_position, find_page_node, find_page_ref,
    insert_page_ref_steps, is_inside_table_cell, page_node_at, ref_node, remove_node_steps, Node,
    Slice, Step,
};

use crate::connection::SpaceConnection;
use crate::context::SyncContext;
use crate::diff::DiffOrigin;
use crate::error::SyncError;
use crate::lifecycle::PageEdit;
use crate::protocol::{
    DropPayload, EditorDragPayload, PageMetaUpdate, ReorderPayload, SpaceClientMessage, SpaceServerMessage,
    SpaceSubscribe, INVALID_MESSAGE,
};
use crate::services::SessionUser;
use crate::storage::{NewPage, PageRecord, TrashRequest};

pub const REPOSITION_UNDER_CHILD: &str =
    "You cannot reposition a page to be a child of one of its child pages";
pub const CANNOT_DELETE: &str = "You cannot delete this page";

/// Page types whose duplicates get a reference in their parent.
const DUPLICATE_REF_TYPES: &[&str] = &["page", "board", "linked_board"];

/// Built-in pages referenced by path instead of a page id.
const STATIC_PAGE_PATHS: &[&str] = &["forum", "members", "proposals", "rewards"];

/// Where a page reference goes in the parent document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertAt {
    End,
    ChildIndex(Option<usize>),
    DropPos(Option<usize>),
}

impl InsertAt {
    fn position(self, doc: &Node) -> usize {
        match self {
            InsertAt::End | InsertAt::DropPos(None) => doc.content_size(),
            InsertAt::ChildIndex(index) => child_insert_position(doc, index),
            InsertAt::DropPos(Some(pos)) => block_insert_position(doc, pos),
        }
    }
}

fn failure_message(event: &str) -> &'static str {
    match event {
        "page_created" => "Error creating a page and adding it to parent page content",
        "page_deleted" => "Error deleting a page after link was deleted from its parent page",
        "page_restored" => "Error restoring a page from archive state",
        "page_reordered_sidebar_to_sidebar" => {
            "Error repositioning a page from the sidebar to another page in the sidebar"
        }
        "page_reordered_sidebar_to_editor" => {
            "Error repositioning a page from the sidebar to another page in the editor"
        }
        "page_reordered_editor_to_editor" => "Error repositioning a page in parent page content",
        _ => "Error handling space event",
    }
}

pub struct SpaceSession {
    ctx: Arc<SyncContext>,
    connection: SpaceConnection,
    user: Option<SessionUser>,
    space_id: Option<Uuid>,
}

impl SpaceSession {
    pub fn new(ctx: Arc<SyncContext>, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            ctx,
            connection: SpaceConnection::new(outbound),
            user: None,
            space_id: None,
        }
    }

    pub fn connection(&self) -> &SpaceConnection {
        &self.connection
    }

    pub fn space_id(&self) -> Option<Uuid> {
        self.space_id
    }

    pub async fn open(&self) {
        self.connection.send(&SpaceServerMessage::Welcome);
    }

    pub async fn on_message(&mut self, text: &str) {
        let message: SpaceClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Invalid space message on {}: {e}", self.connection.id());
                self.connection.send(&SpaceServerMessage::error(INVALID_MESSAGE));
                return;
            }
        };
        let name = message.name();

        if let SpaceClientMessage::Subscribe { payload } = message {
            self.subscribe(payload).await;
            return;
        }
        let (Some(user), Some(space_id)) = (self.user.clone(), self.space_id) else {
            log::debug!("Ignoring {name} before subscribe");
            return;
        };

        let result = match message {
            SpaceClientMessage::PageCreated { payload } => self.page_created(&user, payload).await,
            SpaceClientMessage::PageDeleted { payload } => {
                self.page_deleted(&user, space_id, payload.id).await
            }
            SpaceClientMessage::PageRestored { payload } => {
                self.page_restored(&user, space_id, payload.id).await
            }
            SpaceClientMessage::PageReorderedSidebarToSidebar { payload } => {
                self.reorder_sidebar_to_sidebar(&user, space_id, payload).await
            }
            SpaceClientMessage::PageReorderedSidebarToEditor { payload } => {
                self.reorder_sidebar_to_editor(&user, space_id, payload).await
            }
            SpaceClientMessage::PageReorderedEditorToEditor { payload } => {
                self.reorder_editor_to_editor(&user, space_id, payload).await
            }
            SpaceClientMessage::PageDuplicated { payload } => {
                self.page_duplicated(&user, payload.page_id).await;
                Ok(())
            }
            SpaceClientMessage::Subscribe { .. } | SpaceClientMessage::Unknown => {
                log::debug!("Ignoring space message {name}");
                Ok(())
            }
        };

        if let Err(e) = result {
            log::error!("Space event {name} failed for user {}: {e}", user.id);
            let message = match &e {
                SyncError::PermissionDenied(_) | SyncError::Undesirable(_) => e.to_string(),
                _ => failure_message(name).to_string(),
            };
            self.connection.send(&SpaceServerMessage::error(message));
        }
    }

    pub async fn close(&mut self) {
        self.ctx.broadcaster.leave_all(self.connection.id()).await;
        self.user = None;
        self.space_id = None;
    }

    async fn subscribe(&mut self, payload: SpaceSubscribe) {
        let user = match self.ctx.sessions.verify(&payload.auth_token).await {
            Ok(user) => user,
            Err(e) => {
                log::warn!("Space subscription rejected: {e}");
                self.connection
                    .send(&SpaceServerMessage::error("Error subscribing to space"));
                return;
            }
        };

        match self
            .ctx
            .broadcaster
            .register_subscriber(&user, &self.connection, payload.space_id)
            .await
        {
            Ok(()) => {
                log::debug!("User {} subscribed to space {}", user.id, payload.space_id);
                self.user = Some(user);
                self.space_id = Some(payload.space_id);
                self.connection.send(&SpaceServerMessage::Subscribed {
                    space_id: payload.space_id,
                });
            }
            // The broadcaster has already told the client.
            Err(SyncError::PermissionDenied(_)) => {}
            Err(e) => {
                log::error!("Failed to subscribe to space {}: {e}", payload.space_id);
                self.connection
                    .send(&SpaceServerMessage::error("Error subscribing to space"));
            }
        }
    }

    // ─── Events ───────────────────────────────────────────────────────

    async fn page_created(&self, user: &SessionUser, payload: NewPage) -> Result<(), SyncError> {
        let created = self.ctx.store.create_page(payload, user.id).await?;
        log::info!("User {} created page {}", user.id, created.id);

        if let Some(parent_id) = created.parent_id {
            self.insert_page_ref(parent_id, &created, InsertAt::End, user, DiffOrigin::PageCreated)
                .await?;
        }

        let message = SpaceServerMessage::PagesCreated {
            payload: vec![created.meta()],
        };
        self.ctx.broadcaster.broadcast(&message, created.space_id).await;
        Ok(())
    }

    async fn page_deleted(&self, user: &SessionUser, space_id: Uuid, page_id: Uuid) -> Result<(), SyncError> {
        let page = self.ctx.store.find_page(page_id).await?;
        self.check_can_delete(user, page_id, page.parent_id).await?;

        let trashed_by_diff = match page.parent_id {
            Some(parent_id) => self
                .remove_page_ref(parent_id, page_id, user, DiffOrigin::PageDeleted)
                .await?
                .applied_live(),
            None => false,
        };
        if !trashed_by_diff {
            self.ctx
                .trash_pages(TrashRequest {
                    page_ids: vec![page_id],
                    user_id: user.id,
                    space_id,
                    trash: true,
                })
                .await?;
        }
        Ok(())
    }

    async fn page_restored(&self, user: &SessionUser, space_id: Uuid, page_id: Uuid) -> Result<(), SyncError> {
        self.check_can_delete(user, page_id, None).await?;
        let page = self.ctx.store.find_page(page_id).await?;

        let restored_by_diff = match page.parent_id {
            Some(parent_id) => self
                .insert_page_ref(parent_id, &page, InsertAt::End, user, DiffOrigin::PageRestored)
                .await?
                .applied_live(),
            None => false,
        };
        if !restored_by_diff {
            self.ctx
                .trash_pages(TrashRequest {
                    page_ids: vec![page_id],
                    user_id: user.id,
                    space_id,
                    trash: false,
                })
                .await?;
        }
        Ok(())
    }

    async fn reorder_sidebar_to_sidebar(
        &self,
        user: &SessionUser,
        space_id: Uuid,
        payload: ReorderPayload,
    ) -> Result<(), SyncError> {
        let ReorderPayload {
            page_id,
            new_parent_id,
            new_index,
        } = payload;
        self.move_page(user, space_id, page_id, new_parent_id, InsertAt::ChildIndex(new_index))
            .await
    }

    async fn reorder_sidebar_to_editor(
        &self,
        user: &SessionUser,
        space_id: Uuid,
        payload: DropPayload,
    ) -> Result<(), SyncError> {
        let DropPayload {
            page_id,
            new_parent_id,
            drop_pos,
        } = payload;
        self.move_page(user, space_id, page_id, Some(new_parent_id), InsertAt::DropPos(drop_pos))
            .await
    }

    /// Moves a reference dragged inside the editor onto another page.
    ///
    /// Linked pages, static pages and forum categories only move their
    /// node; the page itself keeps its parent.
    async fn reorder_editor_to_editor(
        &self,
        user: &SessionUser,
        space_id: Uuid,
        payload: EditorDragPayload,
    ) -> Result<(), SyncError> {
        let EditorDragPayload {
            page_id,
            new_parent_id,
            current_parent_id,
            drag_node_pos,
            dragged_node,
        } = payload;
        if page_id == new_parent_id.to_string() || current_parent_id == Some(new_parent_id) {
            return Ok(());
        }

        let linked = matches!(dragged_node, Some(Node::LinkedPage(_)));
        let dragged_attr = |key: &str| {
            dragged_node
                .as_ref()
                .and_then(|node| node.attr(key))
                .and_then(|value| value.as_str().map(str::to_string))
        };
        let is_static = STATIC_PAGE_PATHS.contains(&page_id.as_str());
        let is_forum_category = dragged_attr("type").as_deref() == Some("forum_category");

        let page = match Uuid::parse_str(&page_id) {
            Ok(id) if !is_static && !is_forum_category => Some(self.ctx.store.find_page(id).await?),
            _ => None,
        };
        let (page_type, path) = match &page {
            _ if is_static => (Some(page_id.clone()), Some(page_id.clone())),
            _ if is_forum_category => (dragged_attr("type"), dragged_attr("path")),
            Some(page) => (Some(page.page_type.clone()), Some(page.path.clone())),
            None => (None, None),
        };

        if let (false, Some(page)) = (linked, &page) {
            let descendants = self.ctx.store.descendant_ids(page.id).await?;
            if descendants.contains(&new_parent_id) {
                return Err(SyncError::Undesirable(REPOSITION_UNDER_CHILD.to_string()));
            }
        }

        if let Some(current_parent_id) = current_parent_id {
            let id = page_id.clone();
            let removed = self
                .ctx
                .edit_page(current_parent_id, user.id, DiffOrigin::PageReordered, move |doc| {
                    let pos = drag_node_pos
                        .and_then(|pos| page_node_at(doc, pos, &id))
                        .or_else(|| find_page_node(doc, &id))?;
                    Some(remove_node_steps(pos, is_inside_table_cell(doc, pos)))
                })
                .await;
            if let Err(e) = removed {
                log::error!("Failed to remove page {page_id} from old parent {current_parent_id}: {e}");
            }
        }

        let id = page_id.clone();
        self.ctx
            .edit_page(new_parent_id, user.id, DiffOrigin::PageReordered, move |doc| {
                if find_page_node(doc, &id).is_some() {
                    return None;
                }
                let pos = doc.content_size();
                let node = ref_node(&id, linked, page_type.as_deref(), path.as_deref());
                Some(vec![Step::replace(pos, pos, Slice::closed(vec![node]))])
            })
            .await?;

        let Some(page) = page.filter(|_| !linked) else {
            log::debug!("Moved reference to {page_id} into {new_parent_id}");
            return Ok(());
        };
        self.ctx
            .store
            .set_page_parent(page.id, Some(new_parent_id), user.id)
            .await?;
        log::info!("Moved page {} under {new_parent_id} from the editor", page.id);

        let message = SpaceServerMessage::PagesMetaUpdated {
            payload: vec![PageMetaUpdate {
                id: page.id,
                parent_id: Some(new_parent_id),
                space_id,
            }],
        };
        self.ctx.broadcaster.broadcast(&message, space_id).await;
        Ok(())
    }

    async fn move_page(
        &self,
        user: &SessionUser,
        space_id: Uuid,
        page_id: Uuid,
        new_parent_id: Option<Uuid>,
        at: InsertAt,
    ) -> Result<(), SyncError> {
        if new_parent_id == Some(page_id) {
            return Ok(());
        }
        let page = self.ctx.store.find_page(page_id).await?;
        if page.parent_id == new_parent_id {
            return Ok(());
        }
        if let Some(new_parent_id) = new_parent_id {
            let descendants = self.ctx.store.descendant_ids(page_id).await?;
            if descendants.contains(&new_parent_id) {
                return Err(SyncError::Undesirable(REPOSITION_UNDER_CHILD.to_string()));
            }
        }

        if let Some(old_parent_id) = page.parent_id {
            if let Err(e) = self
                .remove_page_ref(old_parent_id, page_id, user, DiffOrigin::PageReordered)
                .await
            {
                log::error!("Failed to remove page {page_id} from old parent {old_parent_id}: {e}");
            }
        }
        if let Some(new_parent_id) = new_parent_id {
            self.insert_page_ref(new_parent_id, &page, at, user, DiffOrigin::PageReordered)
                .await?;
        }

        self.ctx
            .store
            .set_page_parent(page_id, new_parent_id, user.id)
            .await?;
        log::info!("Moved page {page_id} under {new_parent_id:?}");

        let message = SpaceServerMessage::PagesMetaUpdated {
            payload: vec![PageMetaUpdate {
                id: page_id,
                parent_id: new_parent_id,
                space_id,
            }],
        };
        self.ctx.broadcaster.broadcast(&message, space_id).await;
        Ok(())
    }

    async fn page_duplicated(&self, user: &SessionUser, page_id: Uuid) {
        let page = match self.ctx.store.find_page(page_id).await {
            Ok(page) => page,
            Err(e) => {
                log::error!("Duplicated page {page_id} not found: {e}");
                return;
            }
        };
        let Some(parent_id) = page.parent_id else {
            return;
        };
        if !DUPLICATE_REF_TYPES.contains(&page.page_type.as_str()) {
            return;
        }
        if let Err(e) = self
            .insert_page_ref(parent_id, &page, InsertAt::End, user, DiffOrigin::PageDuplicated)
            .await
        {
            log::error!("Error duplicating page {page_id} into parent {parent_id}: {e}");
        }
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    async fn check_can_delete(
        &self,
        user: &SessionUser,
        page_id: Uuid,
        parent_id: Option<Uuid>,
    ) -> Result<(), SyncError> {
        let permissions = &self.ctx.permissions;
        let own = permissions.compute_page_permissions(page_id, user.id).await?;
        if own.edit_content || own.delete {
            return Ok(());
        }
        if let Some(parent_id) = parent_id {
            let parent = permissions.compute_page_permissions(parent_id, user.id).await?;
            if parent.edit_content || parent.delete {
                return Ok(());
            }
        }
        Err(SyncError::PermissionDenied(CANNOT_DELETE.to_string()))
    }

    /// Adds a reference to `child` in the parent's document unless one is
    /// already there.
    async fn insert_page_ref(
        &self,
        parent_id: Uuid,
        child: &PageRecord,
        at: InsertAt,
        user: &SessionUser,
        origin: DiffOrigin,
    ) -> Result<PageEdit, SyncError> {
        let child_id = child.id;
        let page_type = child.page_type.clone();
        let path = child.path.clone();
        self.ctx
            .edit_page(parent_id, user.id, origin, move |doc| {
                if find_page_ref(doc, child_id).is_some() {
                    return None;
                }
                let pos = at.position(doc);
                Some(insert_page_ref_steps(
                    child_id,
                    pos,
                    Some(page_type.as_str()),
                    Some(path.as_str()),
                ))
            })
            .await
    }

    async fn remove_page_ref(
        &self,
        parent_id: Uuid,
        child_id: Uuid,
        user: &SessionUser,
        origin: DiffOrigin,
    ) -> Result<PageEdit, SyncError> {
        self.ctx
            .edit_page(parent_id, user.id, origin, move |doc| {
                let pos = find_page_ref(doc, child_id)?;
                Some(remove_node_steps(pos, is_inside_table_cell(doc, pos)))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_doc::page_ref_node;

    #[test]
    fn test_insert_positions() {
        let doc = Node::doc(vec![
            Node::paragraph(vec![Node::text("ab")]),
            page_ref_node(Uuid::nil(), Some("page"), None),
        ]);
        assert_eq!(InsertAt::End.position(&doc), 5);
        assert_eq!(InsertAt::ChildIndex(Some(1)).position(&doc), 4);
        assert_eq!(InsertAt::ChildIndex(None).position(&doc), 5);
        assert_eq!(InsertAt::DropPos(Some(4)).position(&doc), 4);
        // Inside the paragraph's text falls back to the end.
        assert_eq!(InsertAt::DropPos(Some(2)).position(&doc), 5);
    }

    #[test]
    fn test_failure_messages() {
        assert_eq!(
            failure_message("page_restored"),
            "Error restoring a page from archive state"
        );
        assert_eq!(failure_message("page_duplicated"), "Error handling space event");
    }
}
