//! RocksDB-backed page store.
//!
//! Column families:
//! - `pages`    page headers (bincode), keyed by page id
//! - `content`  document body and extracted text (LZ4 compressed JSON)
//! - `diffs`    applied diffs (LZ4 compressed JSON, keyed by page_id:version)
//! - `children` parent/child index, keyed by parent_id:child_id
//!
//! Diff keys sort by version within a page, so the most recent history is a
//! short reverse scan from `page_id:u64::MAX`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use quill_doc::Node;

use super::{
    now_millis, NewPage, PageRecord, PageSnapshot, PageStore, StoreError, StoredDiff, TrashRequest,
};
use crate::protocol::DiffMessage;

const CF_PAGES: &str = "pages";
const CF_CONTENT: &str = "content";
const CF_DIFFS: &str = "diffs";
const CF_CHILDREN: &str = "children";

const COLUMN_FAMILIES: &[&str] = &[CF_PAGES, CF_CONTENT, CF_DIFFS, CF_CHILDREN];

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Everything in a [`PageRecord`] except the document body.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PageHeader {
    id: Uuid,
    space_id: Uuid,
    parent_id: Option<Uuid>,
    title: String,
    page_type: String,
    path: String,
    has_content: bool,
    gallery_image: Option<String>,
    version: u64,
    deleted_at: Option<u64>,
    created_by: Uuid,
    updated_by: Uuid,
    created_at: u64,
    updated_at: u64,
}

impl PageHeader {
    fn from_record(record: &PageRecord) -> Self {
        Self {
            id: record.id,
            space_id: record.space_id,
            parent_id: record.parent_id,
            title: record.title.clone(),
            page_type: record.page_type.clone(),
            path: record.path.clone(),
            has_content: record.has_content,
            gallery_image: record.gallery_image.clone(),
            version: record.version,
            deleted_at: record.deleted_at,
            created_by: record.created_by,
            updated_by: record.updated_by,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    fn into_record(self, body: ContentBody) -> PageRecord {
        PageRecord {
            id: self.id,
            space_id: self.space_id,
            parent_id: self.parent_id,
            title: self.title,
            page_type: self.page_type,
            path: self.path,
            content: body.content,
            content_text: body.content_text,
            has_content: self.has_content,
            gallery_image: self.gallery_image,
            version: self.version,
            deleted_at: self.deleted_at,
            created_by: self.created_by,
            updated_by: self.updated_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (header, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(header)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContentBody {
    content: Node,
    content_text: String,
}

fn compress_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let raw = serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

fn decompress_json<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    serde_json::from_slice(&raw).map_err(|e| StoreError::Deserialization(e.to_string()))
}

pub struct RocksPageStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write sequences.
    write_lock: Mutex<()>,
}

impl RocksPageStore {
    /// Opens the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened page store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_PAGES => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CONTENT => {
                // Values are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_DIFFS => {
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_CHILDREN => {
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flushes memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// page_id (16 bytes) + version (8 bytes big-endian).
    fn diff_key(page_id: Uuid, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(page_id.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    /// parent_id (16 bytes) + child_id (16 bytes).
    fn child_key(parent_id: Uuid, child_id: Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(parent_id.as_bytes());
        key.extend_from_slice(child_id.as_bytes());
        key
    }

    fn load_header(&self, page_id: Uuid) -> Result<PageHeader, StoreError> {
        let cf = self.cf(CF_PAGES)?;
        match self.db.get_cf(cf, page_id.as_bytes())? {
            Some(bytes) => PageHeader::decode(&bytes),
            None => Err(StoreError::NotFound(page_id)),
        }
    }

    fn load_body(&self, page_id: Uuid) -> Result<ContentBody, StoreError> {
        let cf = self.cf(CF_CONTENT)?;
        match self.db.get_cf(cf, page_id.as_bytes())? {
            Some(bytes) => decompress_json(&bytes),
            None => Ok(ContentBody {
                content: Node::empty_doc(),
                content_text: String::new(),
            }),
        }
    }

    fn child_ids(&self, parent_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_CHILDREN)?;
        let prefix = parent_id.as_bytes();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut children = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if key.len() != 32 || &key[..16] != prefix {
                break;
            }
            let id = Uuid::from_slice(&key[16..])
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            children.push(id);
        }
        Ok(children)
    }

    fn collect_descendants(&self, root: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let mut found = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(parent) = queue.pop_front() {
            for child in self.child_ids(parent)? {
                if child != root && !found.contains(&child) {
                    found.push(child);
                    queue.push_back(child);
                }
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl PageStore for RocksPageStore {
    async fn find_page(&self, page_id: Uuid) -> Result<PageRecord, StoreError> {
        let header = self.load_header(page_id)?;
        let body = self.load_body(page_id)?;
        Ok(header.into_record(body))
    }

    async fn create_page(&self, page: NewPage, created_by: Uuid) -> Result<PageRecord, StoreError> {
        let _guard = self.write_lock.lock().await;
        let record = page.into_record(created_by);

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_PAGES)?,
            record.id.as_bytes(),
            PageHeader::from_record(&record).encode()?,
        );
        let body = ContentBody {
            content: record.content.clone(),
            content_text: record.content_text.clone(),
        };
        batch.put_cf(self.cf(CF_CONTENT)?, record.id.as_bytes(), compress_json(&body)?);
        if let Some(parent) = record.parent_id {
            batch.put_cf(self.cf(CF_CHILDREN)?, Self::child_key(parent, record.id), b"");
        }
        self.db.write_opt(batch, &self.write_options())?;

        Ok(record)
    }

    async fn update_page_content(&self, snapshot: PageSnapshot) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let page_id = snapshot.page_id;
        let mut record = self.load_header(page_id)?.into_record(ContentBody {
            content: Node::empty_doc(),
            content_text: String::new(),
        });
        record.apply_snapshot(snapshot);

        let body = ContentBody {
            content: record.content.clone(),
            content_text: record.content_text.clone(),
        };
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_PAGES)?,
            page_id.as_bytes(),
            PageHeader::from_record(&record).encode()?,
        );
        batch.put_cf(self.cf(CF_CONTENT)?, page_id.as_bytes(), compress_json(&body)?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    async fn set_page_parent(
        &self,
        page_id: Uuid,
        parent_id: Option<Uuid>,
        updated_by: Uuid,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut header = self.load_header(page_id)?;
        let cf_children = self.cf(CF_CHILDREN)?;

        let mut batch = WriteBatch::default();
        if let Some(old) = header.parent_id {
            batch.delete_cf(cf_children, Self::child_key(old, page_id));
        }
        if let Some(new) = parent_id {
            batch.put_cf(cf_children, Self::child_key(new, page_id), b"");
        }
        header.parent_id = parent_id;
        header.updated_by = updated_by;
        header.updated_at = now_millis();
        batch.put_cf(self.cf(CF_PAGES)?, page_id.as_bytes(), header.encode()?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    async fn create_diff(&self, diff: StoredDiff) -> Result<(), StoreError> {
        let cf = self.cf(CF_DIFFS)?;
        let key = Self::diff_key(diff.page_id, diff.version);
        self.db
            .put_cf_opt(cf, key, compress_json(&diff)?, &self.write_options())?;
        Ok(())
    }

    async fn load_diffs(&self, page_id: Uuid, limit: usize) -> Result<Vec<DiffMessage>, StoreError> {
        let cf = self.cf(CF_DIFFS)?;
        let start = Self::diff_key(page_id, u64::MAX);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Reverse));

        let mut diffs = Vec::new();
        for item in iter {
            if diffs.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != page_id.as_bytes() {
                break;
            }
            let stored: StoredDiff = decompress_json(&value)?;
            diffs.push(stored.data);
        }
        diffs.reverse();
        Ok(diffs)
    }

    async fn trash_pages(&self, request: &TrashRequest) -> Result<Vec<Uuid>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut targets = Vec::new();
        for id in &request.page_ids {
            self.load_header(*id)?;
            targets.push(*id);
            targets.extend(self.collect_descendants(*id)?);
        }

        let cf_pages = self.cf(CF_PAGES)?;
        let now = now_millis();
        let mut batch = WriteBatch::default();
        let mut changed = Vec::new();
        for id in targets {
            if changed.contains(&id) {
                continue;
            }
            let mut header = match self.load_header(id) {
                Ok(header) => header,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if header.space_id != request.space_id {
                continue;
            }
            match (request.trash, header.deleted_at) {
                (true, None) => header.deleted_at = Some(now),
                (false, Some(_)) => header.deleted_at = None,
                _ => continue,
            }
            header.updated_by = request.user_id;
            header.updated_at = now;
            batch.put_cf(cf_pages, id.as_bytes(), header.encode()?);
            changed.push(id);
        }

        if !changed.is_empty() {
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(changed)
    }

    async fn descendant_ids(&self, page_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        self.collect_descendants(page_id)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
