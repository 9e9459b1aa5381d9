//! Page lifecycle operations shared by diff side effects and space events.

use uuid::Uuid;

use quill_doc::{apply_steps, Node, Step};

use crate::context::SyncContext;
use crate::diff::{apply_server_edit, DiffOrigin, DiffOutcome};
use crate::error::SyncError;
use crate::protocol::{DiffMessage, PageIdPayload, SpaceServerMessage};
use crate::room::DocumentRoom;
use crate::storage::{PageSnapshot, StoredDiff, TrashRequest};

/// How an edit to a page's document was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageEdit {
    /// Applied to the open room and broadcast to its participants.
    Live(DiffOutcome),
    /// Written straight to the store; nobody had the page open.
    Persisted,
    /// Nothing to change.
    Unchanged,
}

impl PageEdit {
    pub fn applied(&self) -> bool {
        matches!(
            self,
            PageEdit::Live(DiffOutcome::Applied { .. }) | PageEdit::Persisted
        )
    }

    /// Whether the edit went through the diff path, which performs its own
    /// trash and restore side effects.
    pub fn applied_live(&self) -> bool {
        matches!(self, PageEdit::Live(DiffOutcome::Applied { .. }))
    }
}

impl SyncContext {
    /// Trashes or restores pages with their descendants and tells the
    /// space which pages changed.
    pub async fn trash_pages(&self, request: TrashRequest) -> Result<Vec<Uuid>, SyncError> {
        let changed = self.store.trash_pages(&request).await?;
        if changed.is_empty() {
            return Ok(changed);
        }

        log::info!(
            "{} {} pages in space {}",
            if request.trash { "Trashed" } else { "Restored" },
            changed.len(),
            request.space_id
        );
        let payload: Vec<PageIdPayload> = changed.iter().map(|id| PageIdPayload { id: *id }).collect();
        let message = if request.trash {
            SpaceServerMessage::PagesDeleted { payload }
        } else {
            SpaceServerMessage::PagesRestored { payload }
        };
        self.broadcaster.broadcast(&message, request.space_id).await;
        Ok(changed)
    }

    /// Edits the document of `page_id`. An open room gets a server diff;
    /// otherwise the stored content is updated directly.
    pub async fn edit_page<F>(
        &self,
        page_id: Uuid,
        user_id: Uuid,
        origin: DiffOrigin,
        build: F,
    ) -> Result<PageEdit, SyncError>
    where
        F: FnOnce(&Node) -> Option<Vec<Step>>,
    {
        if let Some(room) = self.rooms.get(page_id).await {
            let outcome = apply_server_edit(self, &room, origin, user_id, build).await;
            return Ok(match outcome {
                DiffOutcome::NoChange => PageEdit::Unchanged,
                outcome => PageEdit::Live(outcome),
            });
        }

        if self.apply_and_save(page_id, user_id, build).await? {
            Ok(PageEdit::Persisted)
        } else {
            Ok(PageEdit::Unchanged)
        }
    }

    /// Applies steps to the stored document of a page that is not open.
    /// Returns `false` when `build` had nothing to change.
    pub async fn apply_and_save<F>(&self, page_id: Uuid, user_id: Uuid, build: F) -> Result<bool, SyncError>
    where
        F: FnOnce(&Node) -> Option<Vec<Step>>,
    {
        let history = self.config.history_length;
        let page = self.store.find_page(page_id).await?;
        let diffs = self.store.load_diffs(page_id, history).await?;
        // Brings in diffs saved after the last snapshot.
        let current = DocumentRoom::from_page(page, diffs, history);

        let Some(steps) = build(&current.doc) else {
            return Ok(false);
        };
        let doc = apply_steps(&current.doc, &steps)?;
        let version = current.version;

        let diff = DiffMessage::server(version, steps);
        self.store
            .create_diff(StoredDiff::new(page_id, version, user_id, diff))
            .await?;
        self.store
            .update_page_content(PageSnapshot::from_doc(page_id, &doc, version + 1, user_id))
            .await?;
        log::debug!("Saved v{} of closed page {page_id}", version + 1);
        Ok(true)
    }
}
