//! Applying diffs to a live room.
//!
//! A diff is applied only when its base version equals the room version.
//! Behind clients are caught up from the diff history (or get a snapshot),
//! and diffs from clients claiming to be ahead are ignored.
//!
//! ```text
//!  strip trigger marks → detect side effects → apply steps → history/version
//!      → persist → trash/restore → confirm → broadcast → mentions
//! ```
//!
//! The room lock is held for the whole sequence, so edits to one room are
//! serialized.

use std::sync::Arc;

use uuid::Uuid;

use quill_doc::{apply_steps, extract_mentions, page_ref_ids, strip_trigger_marks, Node, Step};

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::protocol::{DiffMessage, ServerMessage, SAVE_FAILED};
use crate::room::{DocumentRoom, Participant, SharedRoom};
use crate::services::DocumentEvent;
use crate::storage::{PageSnapshot, StoredDiff, TrashRequest};

/// Where a diff came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOrigin {
    Client,
    PageCreated,
    PageDeleted,
    PageRestored,
    PageReordered,
    PageDuplicated,
}

/// How a diff is applied and who hears about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffOptions {
    pub origin: DiffOrigin,
    /// Also send the diff back to the acting participant.
    pub broadcast_to_all: bool,
    /// User the edit is attributed to when it differs from the participant.
    pub acting_user: Option<Uuid>,
}

impl DiffOptions {
    /// A diff sent by a client: confirmed to the sender, broadcast to the
    /// rest.
    pub fn client() -> Self {
        Self {
            origin: DiffOrigin::Client,
            broadcast_to_all: false,
            acting_user: None,
        }
    }

    /// A diff the server builds for a space event. Everyone gets it,
    /// including the participant it is applied through.
    pub fn server(origin: DiffOrigin, acting_user: Uuid) -> Self {
        Self {
            origin,
            broadcast_to_all: true,
            acting_user: Some(acting_user),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    Applied { version: u64 },
    /// The sender was behind and got the missing diffs.
    Replayed,
    /// The sender was too far behind and got a snapshot.
    Resynced,
    /// The sender claimed a version ahead of the room.
    Ignored,
    /// A server edit had nothing to change.
    NoChange,
    /// The steps did not apply. The sender got a patch error and the
    /// others a fresh snapshot.
    Failed,
}

/// Pages a diff trashes or restores as a side effect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideEffects {
    pub deleted: Vec<Uuid>,
    pub restored: Vec<Uuid>,
}

impl SideEffects {
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.restored.is_empty()
    }
}

/// Scans `diff` against the tree it is about to be applied to.
pub fn detect_side_effects(doc: &Node, diff: &DiffMessage, origin: DiffOrigin) -> SideEffects {
    let mut effects = SideEffects::default();
    if origin == DiffOrigin::PageReordered {
        return effects;
    }

    let restoring = (diff.undo || origin == DiffOrigin::PageRestored)
        && origin != DiffOrigin::PageCreated;
    if restoring {
        for step in &diff.ds {
            effects.restored.extend(page_ref_ids(step.inserted_content()));
        }
        effects.restored.dedup();
        return effects;
    }

    let [Step::Replace { from, to, slice, .. }] = diff.ds.as_slice() else {
        return effects;
    };
    let (from, to) = (*from, *to);
    if to <= from {
        return effects;
    }

    if to == from + 1 {
        if let Some(id) = doc.node_at(from).and_then(Node::page_reference) {
            effects.deleted.push(id);
        }
    } else {
        doc.nodes_between(from, to, &mut |node, pos| {
            if pos >= from && pos + node.node_size() <= to {
                if let Some(id) = node.page_reference() {
                    effects.deleted.push(id);
                }
            }
            true
        });
    }

    // A replace that puts the same reference back is a move, not a delete.
    let reinserted = slice
        .as_ref()
        .map(|s| page_ref_ids(&s.content))
        .unwrap_or_default();
    effects.deleted.retain(|id| !reinserted.contains(id));
    effects.deleted.dedup();
    effects
}

/// Applies a client diff from `actor` to `room`.
pub async fn apply_diff(
    ctx: &SyncContext,
    room: &SharedRoom,
    actor: &Arc<Participant>,
    diff: DiffMessage,
) -> DiffOutcome {
    let mut guard = room.lock().await;
    apply_locked(ctx, &mut guard, Some(actor), diff, DiffOptions::client()).await
}

/// Builds steps against the room's current tree and applies them as a
/// server-originated diff. `build` returning `None` leaves the room alone.
pub async fn apply_server_edit<F>(
    ctx: &SyncContext,
    room: &SharedRoom,
    origin: DiffOrigin,
    acting_user: Uuid,
    build: F,
) -> DiffOutcome
where
    F: FnOnce(&Node) -> Option<Vec<Step>>,
{
    let mut guard = room.lock().await;
    let Some(steps) = build(&guard.doc) else {
        return DiffOutcome::NoChange;
    };
    let actor = guard.pick_participant(acting_user);
    let diff = DiffMessage::server(guard.version, steps);
    let options = DiffOptions::server(origin, acting_user);
    apply_locked(ctx, &mut guard, actor.as_ref(), diff, options).await
}

pub(crate) async fn apply_locked(
    ctx: &SyncContext,
    room: &mut DocumentRoom,
    actor: Option<&Arc<Participant>>,
    mut diff: DiffMessage,
    options: DiffOptions,
) -> DiffOutcome {
    if diff.v > room.version {
        log::debug!(
            "Ignoring diff v{} ahead of room {} at v{}",
            diff.v,
            room.document_id,
            room.version
        );
        return DiffOutcome::Ignored;
    }
    if diff.v < room.version {
        return catch_up(room, actor, diff.v).await;
    }

    let stripped = strip_trigger_marks(&mut diff.ds);
    if stripped > 0 {
        log::trace!("Stripped {stripped} trigger marks from diff {}", diff.rid);
    }
    let effects = detect_side_effects(&room.doc, &diff, options.origin);

    let doc = match apply_steps(&room.doc, &diff.ds) {
        Ok(doc) => doc,
        Err(e) => {
            log::warn!(
                "Diff {} does not apply to room {} at v{}: {e}",
                diff.rid,
                room.document_id,
                room.version
            );
            reset_collaboration(room, actor).await;
            return DiffOutcome::Failed;
        }
    };

    let base = room.version;
    room.doc = doc;
    room.push_history(diff.clone());
    room.version += 1;
    log::debug!("Room {} advanced to v{}", room.document_id, room.version);

    let author = options
        .acting_user
        .or_else(|| actor.map(|p| p.user.id))
        .unwrap_or_default();

    if let Err(e) = persist(ctx, room, base, author, &diff).await {
        log::error!("Failed to persist v{} of {}: {e}", room.version, room.document_id);
        if options.origin == DiffOrigin::Client {
            if let Some(actor) = actor {
                actor.connection.send(ServerMessage::error(SAVE_FAILED)).await;
            }
        }
    }

    if !effects.is_empty() {
        apply_lifecycle(ctx, room.space_id, author, effects).await;
    }

    if options.origin == DiffOrigin::Client {
        if let Some(actor) = actor {
            actor
                .connection
                .send(ServerMessage::ConfirmDiff { rid: diff.rid })
                .await;
        }
    }

    let recipients = match actor {
        Some(actor) if !options.broadcast_to_all => room.others(&actor.id()),
        _ => room.all(),
    };
    for participant in &recipients {
        participant
            .connection
            .send(ServerMessage::Diff(diff.clone()))
            .await;
    }

    publish_mentions(ctx, room, author, &diff);

    DiffOutcome::Applied {
        version: room.version,
    }
}

async fn catch_up(room: &DocumentRoom, actor: Option<&Arc<Participant>>, v: u64) -> DiffOutcome {
    let Some(actor) = actor else {
        return DiffOutcome::Ignored;
    };
    match room.missing_diffs(v) {
        Some(missing) => {
            log::debug!(
                "Client at v{v} is behind room {} at v{}, resending {} diffs",
                room.document_id,
                room.version,
                missing.len()
            );
            for diff in missing {
                actor.connection.send(ServerMessage::Diff(diff)).await;
            }
            DiffOutcome::Replayed
        }
        None => {
            log::debug!("Client at v{v} is too far behind, sending document");
            actor
                .connection
                .send(room.snapshot(actor.connection.session_id()))
                .await;
            DiffOutcome::Resynced
        }
    }
}

/// Tells the sender its diff failed and makes everyone else refetch the
/// document.
async fn reset_collaboration(room: &DocumentRoom, actor: Option<&Arc<Participant>>) {
    if let Some(actor) = actor {
        actor.connection.send(ServerMessage::PatchError).await;
    }
    let others = match actor {
        Some(actor) => room.others(&actor.id()),
        None => room.all(),
    };
    for participant in others {
        let connection = &participant.connection;
        connection.send(room.snapshot(connection.session_id())).await;
    }
}

async fn persist(
    ctx: &SyncContext,
    room: &mut DocumentRoom,
    base: u64,
    author: Uuid,
    diff: &DiffMessage,
) -> Result<(), SyncError> {
    ctx.store
        .create_diff(StoredDiff::new(room.document_id, base, author, diff.clone()))
        .await?;
    if room.version % ctx.config.save_interval.max(1) == 0 {
        save_snapshot(ctx, room, author).await?;
    }
    Ok(())
}

/// Writes the room's document to the store unless that version is already
/// saved. Returns whether anything was written.
pub async fn save_snapshot(
    ctx: &SyncContext,
    room: &mut DocumentRoom,
    author: Uuid,
) -> Result<bool, SyncError> {
    if room.version == room.last_persisted_version {
        return Ok(false);
    }
    let snapshot = PageSnapshot::from_doc(room.document_id, &room.doc, room.version, author);
    ctx.store.update_page_content(snapshot).await?;
    room.last_persisted_version = room.version;
    Ok(true)
}

async fn apply_lifecycle(ctx: &SyncContext, space_id: Uuid, author: Uuid, effects: SideEffects) {
    for (page_ids, trash) in [(effects.deleted, true), (effects.restored, false)] {
        if page_ids.is_empty() {
            continue;
        }
        let request = TrashRequest {
            page_ids,
            user_id: author,
            space_id,
            trash,
        };
        if let Err(e) = ctx.trash_pages(request).await {
            log::error!("Failed to update trash state after diff: {e}");
        }
    }
}

fn publish_mentions(ctx: &SyncContext, room: &DocumentRoom, author: Uuid, diff: &DiffMessage) {
    let events: Vec<DocumentEvent> = diff
        .ds
        .iter()
        .flat_map(|step| extract_mentions(step.inserted_content()))
        .filter_map(|mention| {
            let user = mention.user_id()?;
            (user != author).then(|| DocumentEvent::UserMentioned {
                document_id: room.document_id,
                space_id: room.space_id,
                mention_id: mention.id,
                mentioned_user_id: user,
                author_id: author,
            })
        })
        .collect();
    if events.is_empty() {
        return;
    }

    let publisher = ctx.events.clone();
    tokio::spawn(async move {
        for event in events {
            if let Err(e) = publisher.publish(event).await {
                log::warn!("Failed to publish mention event: {e}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_doc::{page_ref_node, Slice};
    use serde_json::json;

    fn doc_with_refs(a: Uuid, b: Uuid) -> Node {
        Node::doc(vec![
            Node::paragraph(vec![Node::text("intro")]),
            page_ref_node(a, Some("page"), None),
            page_ref_node(b, Some("page"), None),
        ])
    }

    #[test]
    fn test_single_node_delete_detected() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let doc = doc_with_refs(a, b);
        // paragraph "intro" is 7 wide, so `a` sits at 7 and `b` at 8.
        let diff = DiffMessage::new(1, 0, vec![Step::delete(7, 8)]);
        let effects = detect_side_effects(&doc, &diff, DiffOrigin::Client);
        assert_eq!(effects.deleted, vec![a]);
        assert!(effects.restored.is_empty());
    }

    #[test]
    fn test_range_delete_detects_contained_refs() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let doc = doc_with_refs(a, b);
        let diff = DiffMessage::new(1, 0, vec![Step::delete(0, 9)]);
        let effects = detect_side_effects(&doc, &diff, DiffOrigin::Client);
        assert_eq!(effects.deleted, vec![a, b]);
    }

    #[test]
    fn test_moved_ref_is_not_deleted() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let doc = doc_with_refs(a, b);
        let slice = Slice::closed(vec![page_ref_node(b, Some("page"), None)]);
        let diff = DiffMessage::new(1, 0, vec![Step::replace(7, 9, slice)]);
        let effects = detect_side_effects(&doc, &diff, DiffOrigin::Client);
        assert_eq!(effects.deleted, vec![a]);
    }

    #[test]
    fn test_multi_step_diff_has_no_delete_effect() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let doc = doc_with_refs(a, b);
        let diff = DiffMessage::new(1, 0, vec![Step::delete(7, 8), Step::delete(7, 8)]);
        assert!(detect_side_effects(&doc, &diff, DiffOrigin::Client).is_empty());
    }

    #[test]
    fn test_excluded_and_linked_refs_ignored() {
        let id = Uuid::new_v4();
        let linked = Node::from_json(json!({
            "type": "linkedPage", "attrs": { "id": id.to_string(), "type": "page" }
        }))
        .unwrap();
        let doc = Node::doc(vec![page_ref_node(id, Some("forum_category"), None), linked]);
        for pos in [0, 1] {
            let diff = DiffMessage::new(1, 0, vec![Step::delete(pos, pos + 1)]);
            assert!(detect_side_effects(&doc, &diff, DiffOrigin::Client).is_empty());
        }
    }

    #[test]
    fn test_undo_restores_inserted_refs() {
        let a = Uuid::new_v4();
        let doc = Node::doc(vec![Node::paragraph(Vec::new())]);
        let slice = Slice::closed(vec![page_ref_node(a, Some("page"), None)]);
        let mut diff = DiffMessage::new(1, 0, vec![Step::replace(2, 2, slice)]);

        assert!(detect_side_effects(&doc, &diff, DiffOrigin::Client).is_empty());
        let restored = detect_side_effects(&doc, &diff, DiffOrigin::PageRestored);
        assert_eq!(restored.restored, vec![a]);

        diff.undo = true;
        assert_eq!(detect_side_effects(&doc, &diff, DiffOrigin::Client).restored, vec![a]);
        assert!(detect_side_effects(&doc, &diff, DiffOrigin::PageCreated).is_empty());
        assert!(detect_side_effects(&doc, &diff, DiffOrigin::PageReordered).is_empty());
    }
}
