//! RocksDB-backed document and session store.
//!
//! Column families:
//! - `documents`     : replicated state blobs (LZ4 compressed), keyed by document id
//! - `metadata`      : [`DocumentRecord`] (bincode), keyed by document id
//! - `sessions`      : [`SessionRecord`] (bincode), keyed by session UUID bytes
//! - `session_index` : `<document id> 0x00 <session UUID>` for active sessions only
//!
//! State writes put the blob and the refreshed metadata in one write batch,
//! so a reader never sees a state without its plain-text snapshot.
//!
//! RocksDB calls block, so the async trait methods run them on tokio's
//! blocking pool against a shared handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::{
    CursorPosition, DocumentRecord, DocumentStore, NewDocument, NewSession, SessionRecord,
    SessionStore, StoreError,
};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";
const CF_SESSIONS: &str = "sessions";
const CF_SESSION_INDEX: &str = "session_index";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA, CF_SESSIONS, CF_SESSION_INDEX];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
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

fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(bincode::serde::encode_to_vec(value, bincode::config::standard())?)
}

fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

/// RocksDB store implementing both [`DocumentStore`] and [`SessionStore`].
pub struct RocksStore {
    inner: Arc<StoreInner>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Ok(Self { inner: Arc::new(StoreInner::open(config)?) })
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.inner.db.flush()?;
        Ok(())
    }

    /// Every document id in the store.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_documents()
    }

    /// Run `op` on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&StoreInner) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| StoreError::Database(format!("store task failed: {e}")))?
    }
}

/// Database handle shared with blocking tasks.
struct StoreInner {
    /// Single-threaded column family mode; handles are never created after open.
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl StoreInner {
    fn open(config: StoreConfig) -> Result<Self, StoreError> {
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

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Blobs are already LZ4-compressed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA | CF_SESSIONS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_SESSION_INDEX => {
                // Empty values, prefix-scanned by document id.
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    // ─── Documents ────────────────────────────────────────────────────

    fn read_record(&self, document_id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(cf, document_id.as_bytes())?
            .map(|bytes| decode_record(&bytes))
            .transpose()
    }

    fn write_record(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .put_cf_opt(cf, record.id.as_bytes(), encode_record(record)?, &self.write_opts())?;
        Ok(())
    }

    fn read_state(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, document_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    fn write_state(&self, document_id: &str, state: &[u8], content: &str) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut record = self
            .read_record(document_id)?
            .unwrap_or_else(|| DocumentRecord::untitled(document_id));
        record.content = content.to_string();
        record.updated_at = Utc::now();

        let compressed = lz4_flex::compress_prepend_size(state);

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, document_id.as_bytes(), &compressed);
        batch.put_cf(cf_meta, document_id.as_bytes(), encode_record(&record)?);
        self.db.write_opt(batch, &self.write_opts())?;

        log::debug!(
            "Saved document {document_id}: {} bytes state ({} compressed)",
            state.len(),
            compressed.len()
        );
        Ok(())
    }

    fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = std::str::from_utf8(&key)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            ids.push(id.to_string());
        }
        Ok(ids)
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    fn read_session(&self, session_id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        self.db
            .get_cf(cf, session_id.as_bytes())?
            .map(|bytes| decode_record(&bytes))
            .transpose()
    }

    /// Write a session and keep the active index in step with `is_active`.
    fn write_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let cf_sessions = self.cf(CF_SESSIONS)?;
        let cf_index = self.cf(CF_SESSION_INDEX)?;
        let index_key = Self::index_key(&session.document_id, session.id);

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_sessions, session.id.as_bytes(), encode_record(session)?);
        if session.is_active {
            batch.put_cf(cf_index, &index_key, b"");
        } else {
            batch.delete_cf(cf_index, &index_key);
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn update_session(
        &self,
        session_id: Uuid,
        update: impl FnOnce(&mut SessionRecord),
    ) -> Result<(), StoreError> {
        let mut session = self
            .read_session(session_id)?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        update(&mut session);
        self.write_session(&session)
    }

    fn scan_active(&self, document_id: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let cf = self.cf(CF_SESSION_INDEX)?;
        let prefix = Self::index_prefix(document_id);

        let mut sessions = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let id_bytes: [u8; 16] = key[prefix.len()..]
                .try_into()
                .map_err(|_| StoreError::Deserialization("Invalid session index key".into()))?;
            if let Some(session) = self.read_session(Uuid::from_bytes(id_bytes))? {
                sessions.push(session);
            }
        }
        sessions.sort_by_key(|s| s.joined_at);
        Ok(sessions)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn index_prefix(document_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(document_id.len() + 1);
        prefix.extend_from_slice(document_id.as_bytes());
        prefix.push(0);
        prefix
    }

    fn index_key(document_id: &str, session_id: Uuid) -> Vec<u8> {
        let mut key = Self::index_prefix(document_id);
        key.extend_from_slice(session_id.as_bytes());
        key
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn create(&self, document: NewDocument) -> Result<DocumentRecord, StoreError> {
        let record = DocumentRecord::new(Uuid::new_v4().to_string(), document);
        let record = self
            .blocking(move |db| {
                db.write_record(&record)?;
                Ok(record)
            })
            .await?;
        log::info!("Created document {} ({})", record.id, record.title);
        Ok(record)
    }

    async fn get(&self, document_id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let document_id = document_id.to_string();
        self.blocking(move |db| db.read_record(&document_id)).await
    }

    async fn load_state(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let document_id = document_id.to_string();
        self.blocking(move |db| db.read_state(&document_id)).await
    }

    async fn save_state(
        &self,
        document_id: &str,
        state: &[u8],
        content: &str,
    ) -> Result<(), StoreError> {
        let document_id = document_id.to_string();
        let state = state.to_vec();
        let content = content.to_string();
        self.blocking(move |db| db.write_state(&document_id, &state, &content))
            .await
    }
}

#[async_trait]
impl SessionStore for RocksStore {
    async fn create(&self, session: NewSession) -> Result<SessionRecord, StoreError> {
        let record = SessionRecord::new(session);
        self.blocking(move |db| {
            db.write_session(&record)?;
            Ok(record)
        })
        .await
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        self.blocking(move |db| db.read_session(session_id)).await
    }

    async fn deactivate(&self, session_id: Uuid) -> Result<(), StoreError> {
        self.blocking(move |db| db.update_session(session_id, SessionRecord::deactivate))
            .await
    }

    async fn update_cursor(
        &self,
        session_id: Uuid,
        cursor: CursorPosition,
    ) -> Result<(), StoreError> {
        self.blocking(move |db| {
            db.update_session(session_id, |session| {
                session.cursor = cursor;
                session.last_seen = Utc::now().max(session.joined_at);
            })
        })
        .await
    }

    async fn active_sessions(&self, document_id: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let document_id = document_id.to_string();
        self.blocking(move |db| db.scan_active(&document_id)).await
    }
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Language;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    fn new_session(document_id: &str, user_id: &str) -> NewSession {
        NewSession {
            document_id: document_id.into(),
            user_id: user_id.into(),
            connection_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert!(store.list_documents().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_and_save_state() {
        let (_dir, store) = open_temp();
        let new = NewDocument::parse("Main", Some("python"), "owner").unwrap();
        let record = DocumentStore::create(&store, new).await.unwrap();
        assert!(store.load_state(&record.id).await.unwrap().is_none());

        let state = vec![7u8; 4096];
        store.save_state(&record.id, &state, "print(1)").await.unwrap();

        assert_eq!(store.load_state(&record.id).await.unwrap().unwrap(), state);
        let loaded = DocumentStore::get(&store, &record.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Main");
        assert_eq!(loaded.language, Language::Python);
        assert_eq!(loaded.content, "print(1)");
        assert!(loaded.updated_at >= loaded.created_at);
    }

    #[tokio::test]
    async fn test_save_state_without_record() {
        let (_dir, store) = open_temp();
        store.save_state("room-7", b"blob", "hi").await.unwrap();
        let record = DocumentStore::get(&store, "room-7").await.unwrap().unwrap();
        assert_eq!(record.title, crate::storage::UNTITLED);
        assert_eq!(store.list_documents().unwrap(), vec!["room-7".to_string()]);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        {
            let store = RocksStore::open(config.clone()).unwrap();
            store.save_state("doc", b"persisted", "text").await.unwrap();
            store.sync().unwrap();
        }
        let store = RocksStore::open(config).unwrap();
        assert_eq!(store.load_state("doc").await.unwrap().unwrap(), b"persisted");
    }

    #[tokio::test]
    async fn test_session_index_tracks_activity() {
        let (_dir, store) = open_temp();
        let a = SessionStore::create(&store, new_session("doc", "u1")).await.unwrap();
        let b = SessionStore::create(&store, new_session("doc", "u2")).await.unwrap();
        let _other = SessionStore::create(&store, new_session("doc-2", "u3")).await.unwrap();

        let active = store.active_sessions("doc").await.unwrap();
        assert_eq!(active.len(), 2);

        store.deactivate(a.id).await.unwrap();
        let active = store.active_sessions("doc").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b.id);

        let stored = SessionStore::get(&store, a.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert!(stored.last_seen >= stored.joined_at);
    }

    #[tokio::test]
    async fn test_document_id_prefix_isolation() {
        // "doc" must not match sessions of "doc-2" or "docx".
        let (_dir, store) = open_temp();
        SessionStore::create(&store, new_session("docx", "u1")).await.unwrap();
        assert!(store.active_sessions("doc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_cursor() {
        let (_dir, store) = open_temp();
        let session = SessionStore::create(&store, new_session("doc", "u1")).await.unwrap();
        store
            .update_cursor(session.id, CursorPosition { line: 9, column: 1 })
            .await
            .unwrap();
        let stored = SessionStore::get(&store, session.id).await.unwrap().unwrap();
        assert_eq!(stored.cursor, CursorPosition { line: 9, column: 1 });

        assert!(matches!(
            store.update_cursor(Uuid::new_v4(), CursorPosition::default()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writes_from_tasks() {
        let (_dir, store) = open_temp();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let id = format!("doc-{i}");
                    store.save_state(&id, &[i as u8; 64], &id).await?;
                    SessionStore::create(&*store, new_session(&id, "u1")).await?;
                    Ok::<_, StoreError>(())
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut ids = store.list_documents().unwrap();
        ids.sort();
        assert_eq!(ids.len(), 16);
        assert_eq!(store.load_state("doc-3").await.unwrap().unwrap(), vec![3u8; 64]);
        assert_eq!(store.active_sessions("doc-7").await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_store_calls_leave_runtime_responsive() {
        let (_dir, store) = open_temp();
        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    ticks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    tokio::task::yield_now().await;
                }
            })
        };

        // Each call awaits the blocking pool, so the ticker runs in between.
        for i in 0..8u8 {
            store.save_state("doc", &[i; 1024], "text").await.unwrap();
        }
        ticker.abort();
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.block_cache_size, 256 * 1024 * 1024);
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
