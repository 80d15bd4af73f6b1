//! Replicated document store.
//!
//! One [`Replica`] per live document: a yrs `Doc` holding a single text root
//! named `"monaco"`. Merges are commutative and idempotent, so the order in
//! which peers' updates arrive never changes the rendered text.
//!
//! Indexes and lengths are UTF-16 code units, the unit browser editors and
//! Yjs count in.
//!
//! ```text
//!                 get_or_create(id)
//! connection ───────────────────────► ReplicaStore ── load_state ──► DocumentStore
//!                                          │
//!                                          ▼
//!                                   Arc<Replica> ── save / schedule_save ──► DocumentStore
//! ```
//!
//! Persistence writes carry a per-replica sequence number; a write whose
//! snapshot is older than the last one written is skipped, so a slow
//! fire-and-forget save can never clobber a newer final flush.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use yrs::updates::decoder::Decode;
use yrs::{
    Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, Transact, Update, WriteTxn,
};

use crate::protocol::ProtocolError;
use crate::storage::{DocumentStore, NewDocument, StoreError};

/// Name of the shared text root (the editor binds to it by this name).
pub const TEXT_NAME: &str = "monaco";

/// Initial content of documents created through [`ReplicaStore::create_document`].
pub const WELCOME_TEMPLATE: &str = "// Welcome to the collaborative editor!\n// Start typing to see real-time collaboration in action.\n\n";

/// Full encoded state plus the rendered text, taken atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSnapshot {
    pub state: Vec<u8>,
    pub text: String,
    seq: u64,
}

/// A document's CRDT state.
pub struct Replica {
    doc: Mutex<Doc>,
    /// Sequence of the latest snapshot taken.
    snapshot_seq: AtomicU64,
    /// Sequence of the latest snapshot written to the store.
    persisted_seq: Mutex<u64>,
}

impl Replica {
    /// Empty replica.
    pub fn new() -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        });
        {
            let mut txn = doc.transact_mut();
            txn.get_or_insert_text(TEXT_NAME);
        }
        Self {
            doc: Mutex::new(doc),
            snapshot_seq: AtomicU64::new(0),
            persisted_seq: Mutex::new(0),
        }
    }

    /// Replica seeded with `text` at position 0.
    pub fn with_text(text: &str) -> Self {
        let mut replica = Self::new();
        {
            let doc = replica.doc.get_mut();
            let mut txn = doc.transact_mut();
            let root = txn.get_or_insert_text(TEXT_NAME);
            root.insert(&mut txn, 0, text);
        }
        replica
    }

    /// Replica hydrated from a persisted state blob.
    pub fn from_state(state: &[u8]) -> Result<Self, ProtocolError> {
        let update = Update::decode_v1(state).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        let mut replica = Self::new();
        {
            let doc = replica.doc.get_mut();
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| ProtocolError::Apply(e.to_string()))?;
        }
        Ok(replica)
    }

    /// Merge a peer's update. Re-applying a known update is a no-op.
    pub async fn apply_update(&self, update: &[u8]) -> Result<(), ProtocolError> {
        let doc = self.doc.lock().await;
        // Decoded under the lock: yrs updates are not `Send`.
        let update = Update::decode_v1(update).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| ProtocolError::Apply(e.to_string()))
    }

    pub async fn state_vector(&self) -> StateVector {
        let doc = self.doc.lock().await;
        let txn = doc.transact();
        txn.state_vector()
    }

    /// Updates a peer with `remote` state is missing.
    pub async fn encode_diff(&self, remote: &StateVector) -> Vec<u8> {
        let doc = self.doc.lock().await;
        let txn = doc.transact();
        txn.encode_diff_v1(remote)
    }

    /// Full state as a single update.
    pub async fn encode_state(&self) -> Vec<u8> {
        self.encode_diff(&StateVector::default()).await
    }

    /// Rendered plain text.
    pub async fn text(&self) -> String {
        let doc = self.doc.lock().await;
        let txn = doc.transact();
        txn.get_text(TEXT_NAME)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    /// State and text taken under one lock.
    pub async fn snapshot(&self) -> ReplicaSnapshot {
        let doc = self.doc.lock().await;
        let seq = self.snapshot_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let txn = doc.transact();
        let state = txn.encode_state_as_update_v1(&StateVector::default());
        let text = txn
            .get_text(TEXT_NAME)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default();
        ReplicaSnapshot { state, text, seq }
    }

    /// Insert `chunk` at `index` (clamped to the text length) and return the
    /// encoded update for broadcasting.
    pub async fn insert(&self, index: u32, chunk: &str) -> Vec<u8> {
        let doc = self.doc.lock().await;
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text(TEXT_NAME);
        let len = text.len(&txn);
        text.insert(&mut txn, index.min(len), chunk);
        txn.encode_update_v1()
    }

    /// Remove `len` code units starting at `index` and return the update.
    pub async fn remove(&self, index: u32, len: u32) -> Vec<u8> {
        let doc = self.doc.lock().await;
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text(TEXT_NAME);
        let total = text.len(&txn);
        let start = index.min(total);
        let len = len.min(total - start);
        if len > 0 {
            text.remove_range(&mut txn, start, len);
        }
        txn.encode_update_v1()
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of live replicas keyed by document id.
pub struct ReplicaStore {
    replicas: RwLock<HashMap<String, Arc<Replica>>>,
    store: Arc<dyn DocumentStore>,
}

impl ReplicaStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            replicas: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub fn document_store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Return the live replica, hydrating it from the store on first use.
    ///
    /// A failed or undecodable load is logged and the replica starts empty.
    pub async fn get_or_create(&self, document_id: &str) -> Arc<Replica> {
        // Fast path: read lock
        {
            let replicas = self.replicas.read().await;
            if let Some(replica) = replicas.get(document_id) {
                return replica.clone();
            }
        }

        // Hydrate outside the lock so other documents are not held up.
        let hydrated = self.hydrate(document_id).await;

        let mut replicas = self.replicas.write().await;
        // Double-check: a concurrent open may have won the race.
        if let Some(replica) = replicas.get(document_id) {
            return replica.clone();
        }
        let replica = Arc::new(hydrated);
        replicas.insert(document_id.to_string(), replica.clone());
        log::debug!("Replica for document {document_id} loaded ({} live)", replicas.len());
        replica
    }

    async fn hydrate(&self, document_id: &str) -> Replica {
        match self.store.load_state(document_id).await {
            Ok(Some(state)) => match Replica::from_state(&state) {
                Ok(replica) => {
                    log::info!("Hydrated document {document_id} from storage ({} bytes)", state.len());
                    replica
                }
                Err(e) => {
                    log::error!("Persisted state for document {document_id} is unreadable: {e}");
                    Replica::new()
                }
            },
            Ok(None) => Replica::new(),
            Err(e) => {
                log::error!("Failed to load document {document_id}: {e}");
                Replica::new()
            }
        }
    }

    pub async fn get(&self, document_id: &str) -> Option<Arc<Replica>> {
        self.replicas.read().await.get(document_id).cloned()
    }

    /// Allocate a document record, seed it with the welcome template, persist
    /// it and register the replica. Returns the new document id.
    pub async fn create_document(&self, document: NewDocument) -> Result<String, StoreError> {
        let record = self.store.create(document).await?;
        let replica = Arc::new(Replica::with_text(WELCOME_TEMPLATE));
        self.write_snapshot(&record.id, &replica, replica.snapshot().await)
            .await?;
        self.replicas
            .write()
            .await
            .insert(record.id.clone(), replica);
        log::info!("Created document {} ({}, {})", record.id, record.title, record.language);
        Ok(record.id)
    }

    /// Persist the replica's current state and text.
    pub async fn save(&self, document_id: &str, replica: &Replica) -> Result<(), StoreError> {
        let snapshot = replica.snapshot().await;
        self.write_snapshot(document_id, replica, snapshot).await
    }

    /// Snapshot now, write in the background. Failures are logged.
    pub async fn schedule_save(self: &Arc<Self>, document_id: &str, replica: Arc<Replica>) {
        let snapshot = replica.snapshot().await;
        let this = Arc::clone(self);
        let document_id = document_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.write_snapshot(&document_id, &replica, snapshot).await {
                log::error!("Failed to persist document {document_id}: {e}");
            }
        });
    }

    async fn write_snapshot(
        &self,
        document_id: &str,
        replica: &Replica,
        snapshot: ReplicaSnapshot,
    ) -> Result<(), StoreError> {
        let mut persisted = replica.persisted_seq.lock().await;
        if snapshot.seq <= *persisted {
            log::trace!("Skipping stale snapshot {} for document {document_id}", snapshot.seq);
            return Ok(());
        }
        self.store
            .save_state(document_id, &snapshot.state, &snapshot.text)
            .await?;
        *persisted = snapshot.seq;
        Ok(())
    }

    /// Drop the in-memory replica. Durable state is untouched.
    pub async fn remove(&self, document_id: &str) -> Option<Arc<Replica>> {
        self.replicas.write().await.remove(document_id)
    }

    pub async fn len(&self) -> usize {
        self.replicas.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
