//! Connection manager: connection table, per-document membership, fan-out.
//!
//! Every connection owns one bounded outbound queue drained by its socket
//! writer task. Fan-out walks the document's member set under a read lock
//! and uses `try_send`, so a slow or dead recipient never stalls the sender.
//! A full or closed queue counts as a failed send; the caller disconnects
//! those recipients after the fan-out completes.
//!
//! ```text
//!               broadcast(doc, frame, except)
//! sender ──────────────────┬────────────────────────┐
//!                          ▼                        ▼
//!                 [queue] conn B ──► ws      [queue] conn C ──► ws
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Server-generated connection identity.
pub type ConnectionId = Uuid;

/// A frame queued for a connection's socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Binary(Bytes),
    Text(String),
}

impl OutboundFrame {
    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        OutboundFrame::Binary(bytes.into())
    }

    pub fn len(&self) -> usize {
        match self {
            OutboundFrame::Binary(b) => b.len(),
            OutboundFrame::Text(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lifecycle of a connection. No transition leaves `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Registered, handshake in progress.
    Opening,
    /// Handshake sent; frames are being processed.
    Active,
    /// Deregistered.
    Closed,
}

/// Read-only view of a registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub document_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<Uuid>,
    pub phase: ConnectionPhase,
}

struct Connection {
    info: ConnectionInfo,
    outbound: mpsc::Sender<OutboundFrame>,
}

#[derive(Default)]
struct ConnectionTable {
    connections: HashMap<ConnectionId, Connection>,
    /// document id → members. An entry exists iff it has at least one member.
    documents: HashMap<String, HashSet<ConnectionId>>,
}

/// Result of removing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// The connection as it was just before removal (phase `Closed`).
    pub connection: ConnectionInfo,
    /// The document has no connections left.
    pub document_emptied: bool,
}

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub send_failures: u64,
    pub active_connections: usize,
    pub active_documents: usize,
}

/// Connection table shared by every transport task.
pub struct ConnectionManager {
    inner: RwLock<ConnectionTable>,
    frames_sent: AtomicU64,
    send_failures: AtomicU64,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ConnectionTable::default()),
            frames_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
        }
    }

    /// Register a connection in phase `Opening` and return its new id.
    pub async fn register(
        &self,
        document_id: &str,
        user_id: Option<String>,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> ConnectionId {
        let id = Uuid::new_v4();
        let info = ConnectionInfo {
            id,
            document_id: document_id.to_string(),
            user_id,
            session_id: None,
            phase: ConnectionPhase::Opening,
        };

        let mut table = self.inner.write().await;
        table.connections.insert(id, Connection { info, outbound });
        let members = table.documents.entry(document_id.to_string()).or_default();
        members.insert(id);
        log::debug!(
            "Registered connection {id} on document {document_id} ({} members)",
            members.len()
        );
        id
    }

    pub async fn set_session(&self, id: ConnectionId, session_id: Uuid) {
        if let Some(conn) = self.inner.write().await.connections.get_mut(&id) {
            conn.info.session_id = Some(session_id);
        }
    }

    /// `Opening → Active`. Returns false if the connection is gone.
    pub async fn mark_active(&self, id: ConnectionId) -> bool {
        match self.inner.write().await.connections.get_mut(&id) {
            Some(conn) if conn.info.phase == ConnectionPhase::Opening => {
                conn.info.phase = ConnectionPhase::Active;
                true
            }
            Some(conn) => conn.info.phase == ConnectionPhase::Active,
            None => false,
        }
    }

    pub async fn info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.inner.read().await.connections.get(&id).map(|c| c.info.clone())
    }

    /// Queue a frame for one connection. Returns false on a failed send.
    pub async fn send_to(&self, id: ConnectionId, frame: OutboundFrame) -> bool {
        let table = self.inner.read().await;
        match table.connections.get(&id) {
            Some(conn) => self.try_send(conn, frame),
            None => false,
        }
    }

    /// Fan a frame out to the sender's document.
    ///
    /// The sender is skipped unless `include_sender` is set. Returns the
    /// recipients whose queue was full or closed.
    pub async fn broadcast(
        &self,
        sender: ConnectionId,
        frame: OutboundFrame,
        include_sender: bool,
    ) -> Vec<ConnectionId> {
        let table = self.inner.read().await;
        let Some(document_id) = table.connections.get(&sender).map(|c| &c.info.document_id) else {
            return Vec::new();
        };
        let except = (!include_sender).then_some(sender);
        self.fan_out(&table, document_id, &frame, except)
    }

    /// Fan a frame out to every connection of a document, optionally
    /// skipping one. Returns the failed recipients.
    pub async fn broadcast_document(
        &self,
        document_id: &str,
        frame: OutboundFrame,
        except: Option<ConnectionId>,
    ) -> Vec<ConnectionId> {
        let table = self.inner.read().await;
        self.fan_out(&table, document_id, &frame, except)
    }

    fn fan_out(
        &self,
        table: &ConnectionTable,
        document_id: &str,
        frame: &OutboundFrame,
        except: Option<ConnectionId>,
    ) -> Vec<ConnectionId> {
        let Some(members) = table.documents.get(document_id) else {
            return Vec::new();
        };
        let mut failed = Vec::new();
        for id in members {
            if Some(*id) == except {
                continue;
            }
            let delivered = table
                .connections
                .get(id)
                .is_some_and(|conn| self.try_send(conn, frame.clone()));
            if !delivered {
                failed.push(*id);
            }
        }
        log::trace!(
            "Fan-out of {} bytes on document {document_id}: {} recipients, {} failed",
            frame.len(),
            members.len() - usize::from(except.is_some_and(|id| members.contains(&id))),
            failed.len()
        );
        failed
    }

    fn try_send(&self, conn: &Connection, frame: OutboundFrame) -> bool {
        match conn.outbound.try_send(frame) {
            Ok(()) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.send_failures.fetch_add(1, Ordering::Relaxed);
                log::debug!("Outbound queue full for connection {}", conn.info.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.send_failures.fetch_add(1, Ordering::Relaxed);
                log::debug!("Outbound queue closed for connection {}", conn.info.id);
                false
            }
        }
    }

    /// Remove a connection. Idempotent: a second call returns `None`.
    pub async fn disconnect(&self, id: ConnectionId) -> Option<Departure> {
        let mut table = self.inner.write().await;
        let conn = table.connections.remove(&id)?;
        let document_id = conn.info.document_id.clone();

        let document_emptied = match table.documents.get_mut(&document_id) {
            Some(members) => {
                members.remove(&id);
                members.is_empty()
            }
            None => true,
        };
        if document_emptied {
            table.documents.remove(&document_id);
        }

        let mut info = conn.info;
        info.phase = ConnectionPhase::Closed;
        log::debug!("Removed connection {id} from document {document_id} (emptied: {document_emptied})");
        Some(Departure { connection: info, document_emptied })
    }

    /// Number of live connections on a document.
    pub async fn active_count(&self, document_id: &str) -> usize {
        self.inner
            .read()
            .await
            .documents
            .get(document_id)
            .map_or(0, HashSet::len)
    }

    /// Live connections of a document.
    pub async fn connections(&self, document_id: &str) -> Vec<ConnectionInfo> {
        let table = self.inner.read().await;
        table
            .documents
            .get(document_id)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|id| table.connections.get(id).map(|c| c.info.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.inner.read().await.documents.keys().cloned().collect()
    }

    pub async fn stats(&self) -> ConnectionStats {
        let table = self.inner.read().await;
        ConnectionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            active_connections: table.connections.len(),
            active_documents: table.documents.len(),
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
