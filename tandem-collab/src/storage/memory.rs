//! In-memory stores. Used by the default server and by tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    CursorPosition, DocumentRecord, DocumentStore, NewDocument, NewSession, SessionRecord,
    SessionStore, StoreError,
};

#[derive(Default)]
struct DocumentTable {
    records: HashMap<String, DocumentRecord>,
    states: HashMap<String, Vec<u8>>,
    saves: HashMap<String, usize>,
}

/// Document store held in process memory.
#[derive(Default)]
pub struct MemoryDocumentStore {
    table: RwLock<DocumentTable>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save_state` calls for a document.
    pub async fn save_count(&self, document_id: &str) -> usize {
        self.table.read().await.saves.get(document_id).copied().unwrap_or(0)
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create(&self, document: NewDocument) -> Result<DocumentRecord, StoreError> {
        let record = DocumentRecord::new(Uuid::new_v4().to_string(), document);
        self.table
            .write()
            .await
            .records
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, document_id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.table.read().await.records.get(document_id).cloned())
    }

    async fn load_state(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.table.read().await.states.get(document_id).cloned())
    }

    async fn save_state(
        &self,
        document_id: &str,
        state: &[u8],
        content: &str,
    ) -> Result<(), StoreError> {
        let mut table = self.table.write().await;
        let record = table
            .records
            .entry(document_id.to_string())
            .or_insert_with(|| DocumentRecord::untitled(document_id));
        record.content = content.to_string();
        record.updated_at = Utc::now();
        table.states.insert(document_id.to_string(), state.to_vec());
        *table.saves.entry(document_id.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

/// Session store held in process memory.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every session of a document, active or not.
    pub async fn all_sessions(&self, document_id: &str) -> Vec<SessionRecord> {
        let mut sessions: Vec<SessionRecord> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.document_id == document_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.joined_at);
        sessions
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: NewSession) -> Result<SessionRecord, StoreError> {
        let record = SessionRecord::new(session);
        self.sessions.write().await.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.read().await.get(&session_id).cloned())
    }

    async fn deactivate(&self, session_id: Uuid) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        session.deactivate();
        Ok(())
    }

    async fn update_cursor(
        &self,
        session_id: Uuid,
        cursor: CursorPosition,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        session.cursor = cursor;
        session.last_seen = Utc::now().max(session.joined_at);
        Ok(())
    }

    async fn active_sessions(&self, document_id: &str) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self
            .all_sessions(document_id)
            .await
            .into_iter()
            .filter(|s| s.is_active)
            .collect())
    }
}
