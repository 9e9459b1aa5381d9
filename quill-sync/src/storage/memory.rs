use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    now_millis, NewPage, PageRecord, PageSnapshot, PageStore, StoreError, StoredDiff, TrashRequest,
};
use crate::protocol::DiffMessage;

/// In-process page store for tests and the development server.
#[derive(Debug, Default)]
pub struct MemoryPageStore {
    pages: RwLock<HashMap<Uuid, PageRecord>>,
    diffs: RwLock<HashMap<Uuid, Vec<StoredDiff>>>,
    fail_writes: AtomicBool,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a page as is, bypassing `create_page`.
    pub async fn insert_page(&self, page: PageRecord) {
        self.pages.write().await.insert(page.id, page);
    }

    pub async fn stored_diffs(&self, page_id: Uuid) -> Vec<StoredDiff> {
        self.diffs
            .read()
            .await
            .get(&page_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Makes every write fail until switched off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("writes disabled".to_string()));
        }
        Ok(())
    }
}

fn collect_descendants(pages: &HashMap<Uuid, PageRecord>, root: Uuid) -> Vec<Uuid> {
    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(parent) = queue.pop_front() {
        for page in pages.values() {
            if page.parent_id == Some(parent) && page.id != root && !found.contains(&page.id) {
                found.push(page.id);
                queue.push_back(page.id);
            }
        }
    }
    found
}

#[async_trait]
impl PageStore for MemoryPageStore {
    async fn find_page(&self, page_id: Uuid) -> Result<PageRecord, StoreError> {
        self.pages
            .read()
            .await
            .get(&page_id)
            .cloned()
            .ok_or(StoreError::NotFound(page_id))
    }

    async fn create_page(&self, page: NewPage, created_by: Uuid) -> Result<PageRecord, StoreError> {
        self.check_writable()?;
        let record = page.into_record(created_by);
        self.pages.write().await.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_page_content(&self, snapshot: PageSnapshot) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut pages = self.pages.write().await;
        let page = pages
            .get_mut(&snapshot.page_id)
            .ok_or(StoreError::NotFound(snapshot.page_id))?;
        page.apply_snapshot(snapshot);
        Ok(())
    }

    async fn set_page_parent(
        &self,
        page_id: Uuid,
        parent_id: Option<Uuid>,
        updated_by: Uuid,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut pages = self.pages.write().await;
        let page = pages.get_mut(&page_id).ok_or(StoreError::NotFound(page_id))?;
        page.parent_id = parent_id;
        page.updated_by = updated_by;
        page.updated_at = now_millis();
        Ok(())
    }

    async fn create_diff(&self, diff: StoredDiff) -> Result<(), StoreError> {
        self.check_writable()?;
        self.diffs
            .write()
            .await
            .entry(diff.page_id)
            .or_default()
            .push(diff);
        Ok(())
    }

    async fn load_diffs(&self, page_id: Uuid, limit: usize) -> Result<Vec<DiffMessage>, StoreError> {
        let diffs = self.diffs.read().await;
        let stored = diffs.get(&page_id).map(Vec::as_slice).unwrap_or(&[]);
        let skip = stored.len().saturating_sub(limit);
        Ok(stored[skip..].iter().map(|d| d.data.clone()).collect())
    }

    async fn trash_pages(&self, request: &TrashRequest) -> Result<Vec<Uuid>, StoreError> {
        self.check_writable()?;
        let mut pages = self.pages.write().await;
        let mut targets = Vec::new();
        for id in &request.page_ids {
            if !pages.contains_key(id) {
                return Err(StoreError::NotFound(*id));
            }
            targets.push(*id);
            targets.extend(collect_descendants(&pages, *id));
        }

        let now = now_millis();
        let mut changed = Vec::new();
        for id in targets {
            let Some(page) = pages.get_mut(&id) else {
                continue;
            };
            if page.space_id != request.space_id || changed.contains(&id) {
                continue;
            }
            match (request.trash, page.deleted_at) {
                (true, None) => page.deleted_at = Some(now),
                (false, Some(_)) => page.deleted_at = None,
                _ => continue,
            }
            page.updated_by = request.user_id;
            page.updated_at = now;
            changed.push(id);
        }
        Ok(changed)
    }

    async fn descendant_ids(&self, page_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let pages = self.pages.read().await;
        Ok(collect_descendants(&pages, page_id))
    }
}
