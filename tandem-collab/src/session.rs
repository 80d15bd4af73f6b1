//! Session lifecycle: one session record per identified connection.
//!
//! Session bookkeeping never blocks collaboration. Store failures are logged
//! and the connection carries on without a session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broadcast::ConnectionId;
use crate::storage::{CursorPosition, NewSession, SessionRecord, SessionStore, StoreError};

/// One participant entry of the REST projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub user_id: String,
    pub joined_at: DateTime<Utc>,
    pub cursor: CursorPosition,
}

impl From<SessionRecord> for SessionSummary {
    fn from(record: SessionRecord) -> Self {
        Self {
            user_id: record.user_id,
            joined_at: record.joined_at,
            cursor: record.cursor,
        }
    }
}

/// Body of `GET /api/documents/{id}/sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSessions {
    /// Live connections, anonymous ones included.
    pub active_connections: usize,
    /// Active session records.
    pub sessions: Vec<SessionSummary>,
}

pub struct SessionLifecycle {
    store: Arc<dyn SessionStore>,
}

impl SessionLifecycle {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Record a session for an identified connection.
    ///
    /// Anonymous connections get no session; a store failure is logged and
    /// yields `None`.
    pub async fn open(
        &self,
        document_id: &str,
        user_id: Option<&str>,
        connection_id: ConnectionId,
    ) -> Option<Uuid> {
        let user_id = user_id?;
        let new = NewSession {
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
            connection_id,
        };
        match self.store.create(new).await {
            Ok(record) => {
                log::debug!("Session {} opened for user {user_id} on {document_id}", record.id);
                Some(record.id)
            }
            Err(e) => {
                log::error!("Failed to record session for user {user_id} on {document_id}: {e}");
                None
            }
        }
    }

    /// Mark a session inactive and stamp `last_seen`.
    pub async fn close(&self, session_id: Uuid) {
        match self.store.deactivate(session_id).await {
            Ok(()) => log::debug!("Session {session_id} closed"),
            Err(e) => log::error!("Failed to close session {session_id}: {e}"),
        }
    }

    /// Best-effort cursor update.
    pub async fn record_cursor(&self, session_id: Uuid, cursor: CursorPosition) {
        if let Err(e) = self.store.update_cursor(session_id, cursor).await {
            log::warn!("Failed to update cursor for session {session_id}: {e}");
        }
    }

    pub async fn document_sessions(
        &self,
        document_id: &str,
        active_connections: usize,
    ) -> Result<DocumentSessions, StoreError> {
        let sessions = self
            .store
            .active_sessions(document_id)
            .await?
            .into_iter()
            .map(SessionSummary::from)
            .collect();
        Ok(DocumentSessions { active_connections, sessions })
    }
}
