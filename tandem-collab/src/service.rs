//! The collaboration service: sync protocol handling on top of the replica
//! store, awareness registry, connection manager and session lifecycle.
//!
//! ```text
//!   inbound binary ──► InboundFrame::decode
//!                        ├─ SyncStep1(sv)        ──► Step2(diff) to sender only
//!                        ├─ SyncStep2 / Update   ──► merge ──► relay raw to others ──► schedule_save
//!                        └─ Awareness(update)    ──► registry ──► relay owned entries to others ──► session cursor
//!   inbound text   ──► ping → pong, otherwise EventHandler
//!   disconnect     ──► deregister ──► awareness removal broadcast ──► session close
//!                                                  └─ last connection? ──► flush replica
//! ```
//!
//! Transport tasks own the sockets; this type only sees connection ids,
//! frames and outbound queues. One instance is shared behind an `Arc`.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use yrs::sync::SyncMessage;

use crate::awareness::AwarenessRegistry;
use crate::broadcast::{
    ConnectionId, ConnectionInfo, ConnectionManager, ConnectionStats, OutboundFrame,
};
use crate::events::{EventHandler, LogEventHandler};
use crate::protocol::{
    encode_awareness, encode_sync_step1, encode_sync_step2, ControlMessage, InboundFrame,
    ProtocolError, StructuredEvent,
};
use crate::replica::{Replica, ReplicaStore};
use crate::session::{DocumentSessions, SessionLifecycle};
use crate::storage::{
    CursorPosition, DocumentStore, MemoryDocumentStore, MemorySessionStore, NewDocument,
    SessionStore, StoreError,
};

/// Text event answered with `{"type":"pong"}`.
pub const PING_EVENT: &str = "ping";

#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("missing documentId")]
    MissingDocumentId,
    #[error("connection {0} closed during handshake")]
    HandshakeFailed(ConnectionId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Parameters of a connection request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub document_id: String,
    pub user_id: Option<String>,
}

impl ConnectParams {
    pub fn new(document_id: impl Into<String>, user_id: Option<&str>) -> Self {
        Self {
            document_id: document_id.into(),
            user_id: user_id.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub connections: ConnectionStats,
    pub live_replicas: usize,
    pub awareness_documents: usize,
}

pub struct CollaborationService {
    replicas: Arc<ReplicaStore>,
    awareness: AwarenessRegistry,
    connections: ConnectionManager,
    sessions: SessionLifecycle,
    events: Arc<dyn EventHandler>,
    persist_on_update: bool,
}

impl CollaborationService {
    pub fn new(documents: Arc<dyn DocumentStore>, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            replicas: Arc::new(ReplicaStore::new(documents)),
            awareness: AwarenessRegistry::new(),
            connections: ConnectionManager::new(),
            sessions: SessionLifecycle::new(sessions),
            events: Arc::new(LogEventHandler),
            persist_on_update: true,
        }
    }

    /// Service over fresh in-memory stores.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MemorySessionStore::new()),
        )
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = handler;
        self
    }

    /// Toggle the fire-and-forget save after each merged update.
    pub fn with_persist_on_update(mut self, enabled: bool) -> Self {
        self.persist_on_update = enabled;
        self
    }

    pub fn replicas(&self) -> &Arc<ReplicaStore> {
        &self.replicas
    }

    pub fn awareness(&self) -> &AwarenessRegistry {
        &self.awareness
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn sessions(&self) -> &SessionLifecycle {
        &self.sessions
    }

    // ─── Connection lifecycle ─────────────────────────────────────────

    /// Register a connection and queue its handshake: SyncStep1 with the
    /// server's state vector, the awareness snapshot if any, then the
    /// `connection-established` control frame.
    ///
    /// On failure the connection is already cleaned up.
    pub async fn open(
        &self,
        params: ConnectParams,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Result<ConnectionId, CollabError> {
        let document_id = params.document_id.trim();
        if document_id.is_empty() {
            return Err(CollabError::MissingDocumentId);
        }

        let replica = self.replicas.get_or_create(document_id).await;
        let id = self
            .connections
            .register(document_id, params.user_id.clone(), outbound)
            .await;

        if let Some(session_id) = self
            .sessions
            .open(document_id, params.user_id.as_deref(), id)
            .await
        {
            self.connections.set_session(id, session_id).await;
        }

        if let Err(e) = self.send_handshake(id, document_id, &replica).await {
            self.disconnect(id).await;
            return Err(e);
        }
        self.connections.mark_active(id).await;

        log::info!(
            "Connection {id} joined document {document_id} (user: {}, {} connected)",
            params.user_id.as_deref().unwrap_or("anonymous"),
            self.connections.active_count(document_id).await
        );
        Ok(id)
    }

    async fn send_handshake(
        &self,
        id: ConnectionId,
        document_id: &str,
        replica: &Replica,
    ) -> Result<(), CollabError> {
        let mut frames = vec![OutboundFrame::binary(encode_sync_step1(
            replica.state_vector().await,
        ))];
        if let Some(snapshot) = self.awareness.snapshot(document_id).await {
            frames.push(OutboundFrame::binary(encode_awareness(snapshot)));
        }
        let established = ControlMessage::ConnectionEstablished {
            connection_id: id.to_string(),
            document_id: document_id.to_string(),
        };
        frames.push(OutboundFrame::Text(established.encode()?));

        for frame in frames {
            if !self.connections.send_to(id, frame).await {
                return Err(CollabError::HandshakeFailed(id));
            }
        }
        Ok(())
    }

    /// Tear down a connection. Safe to call more than once.
    pub async fn disconnect(&self, id: ConnectionId) {
        self.disconnect_all(vec![id]).await;
    }

    /// Tear down connections, including any recipient that fails while the
    /// awareness removals are broadcast.
    async fn disconnect_all(&self, mut pending: Vec<ConnectionId>) {
        while let Some(id) = pending.pop() {
            let Some(departure) = self.connections.disconnect(id).await else {
                continue;
            };
            let document_id = departure.connection.document_id.as_str();

            if let Some(removal) = self.awareness.remove_connection(document_id, id).await {
                log::debug!(
                    "Broadcasting removal of {} awareness client(s) of connection {id}",
                    removal.clients.len()
                );
                let frame = OutboundFrame::binary(encode_awareness(removal));
                pending.extend(self.connections.broadcast_document(document_id, frame, None).await);
            }

            if let Some(session_id) = departure.connection.session_id {
                self.sessions.close(session_id).await;
            }

            if departure.document_emptied {
                self.awareness.remove_document_if_idle(document_id).await;
                self.flush_idle(document_id).await;
            }

            log::info!("Connection {id} left document {document_id}");
        }
    }

    /// Persist a document whose last connection just closed.
    async fn flush_idle(&self, document_id: &str) {
        let Some(replica) = self.replicas.get(document_id).await else {
            return;
        };
        match self.replicas.save(document_id, &replica).await {
            Ok(()) => log::info!("Persisted document {document_id} (no connections left)"),
            Err(e) => log::error!("Failed to persist idle document {document_id}: {e}"),
        }
    }

    // ─── Inbound frames ───────────────────────────────────────────────

    /// Handle one binary frame. Bad frames are logged and dropped.
    pub async fn handle_binary(&self, id: ConnectionId, data: Bytes) {
        let Some(info) = self.connections.info(id).await else {
            log::debug!("Dropping frame from unregistered connection {id}");
            return;
        };
        let frame = match InboundFrame::decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping frame from connection {id}: {e}");
                return;
            }
        };
        log::trace!("{} frame ({} bytes) from connection {id}", frame.kind(), data.len());

        match frame {
            InboundFrame::Sync(SyncMessage::SyncStep1(remote)) => {
                let replica = self.replicas.get_or_create(&info.document_id).await;
                let diff = replica.encode_diff(&remote).await;
                if !self
                    .connections
                    .send_to(id, OutboundFrame::binary(encode_sync_step2(diff)))
                    .await
                {
                    self.disconnect(id).await;
                }
            }
            InboundFrame::Sync(SyncMessage::SyncStep2(update))
            | InboundFrame::Sync(SyncMessage::Update(update)) => {
                let replica = self.replicas.get_or_create(&info.document_id).await;
                if let Err(e) = replica.apply_update(&update).await {
                    log::warn!("Dropping update from connection {id}: {e}");
                    return;
                }
                self.relay(id, data).await;
                if self.persist_on_update {
                    self.replicas.schedule_save(&info.document_id, replica).await;
                }
            }
            InboundFrame::Awareness(mut update) => {
                let change = self.awareness.apply(&info.document_id, id, &update).await;

                if change.rejected.is_empty() {
                    self.relay(id, data).await;
                } else {
                    // Strip clients owned by other connections before relaying.
                    update.clients.retain(|client_id, _| !change.rejected.contains(client_id));
                    if !update.clients.is_empty() {
                        let filtered = encode_awareness(update.clone());
                        self.relay(id, Bytes::from(filtered)).await;
                    }
                }

                if let Some(session_id) = info.session_id {
                    let cursor = change
                        .added
                        .iter()
                        .chain(change.updated.iter())
                        .filter_map(|client_id| update.clients.get(client_id))
                        .filter_map(|e| serde_json::from_str::<serde_json::Value>(&e.json).ok())
                        .filter_map(|state| CursorPosition::from_awareness(&state))
                        .last();
                    if let Some(cursor) = cursor {
                        self.sessions.record_cursor(session_id, cursor).await;
                    }
                }
            }
        }
    }

    /// Forward a raw frame to every other connection of the sender's document.
    async fn relay(&self, sender: ConnectionId, data: Bytes) {
        let failed = self
            .connections
            .broadcast(sender, OutboundFrame::Binary(data), false)
            .await;
        if !failed.is_empty() {
            log::debug!("Disconnecting {} unreachable connection(s)", failed.len());
            self.disconnect_all(failed).await;
        }
    }

    /// Handle one text frame: answer pings, hand everything else to the
    /// event handler. Malformed JSON is dropped.
    pub async fn handle_text(&self, id: ConnectionId, text: &str) {
        let Some(info) = self.connections.info(id).await else {
            return;
        };
        let event = match StructuredEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                log::debug!("Dropping text frame from connection {id}: {e}");
                return;
            }
        };

        if event.event_type == PING_EVENT {
            match ControlMessage::Pong.encode() {
                Ok(pong) => {
                    if !self.connections.send_to(id, OutboundFrame::Text(pong)).await {
                        self.disconnect(id).await;
                    }
                }
                Err(e) => log::error!("Failed to encode pong: {e}"),
            }
            return;
        }
        self.events.handle(&info, event).await;
    }

    // ─── Documents & projections ──────────────────────────────────────

    pub async fn create_document(
        &self,
        title: &str,
        language: Option<&str>,
        owner_id: &str,
    ) -> Result<String, CollabError> {
        let document = NewDocument::parse(title, language, owner_id)?;
        Ok(self.replicas.create_document(document).await?)
    }

    /// Drop a document's in-memory replica. Connected clients keep their
    /// copies; the next frame re-hydrates it from storage.
    pub async fn remove_document(&self, document_id: &str) -> bool {
        self.replicas.remove(document_id).await.is_some()
    }

    pub async fn active_count(&self, document_id: &str) -> usize {
        self.connections.active_count(document_id).await
    }

    pub async fn connection(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.info(id).await
    }

    pub async fn document_sessions(&self, document_id: &str) -> Result<DocumentSessions, StoreError> {
        let active = self.connections.active_count(document_id).await;
        self.sessions.document_sessions(document_id, active).await
    }

    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            connections: self.connections.stats().await,
            live_replicas: self.replicas.len().await,
            awareness_documents: self.awareness.document_count().await,
        }
    }
}
