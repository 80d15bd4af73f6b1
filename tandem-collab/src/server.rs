//! HTTP/WebSocket transport.
//!
//! ```text
//! GET  /collaborate?documentId=..&userId=..   WebSocket (y-protocols binary + JSON text)
//! GET  /api/documents/{id}/sessions           {activeConnections, sessions}
//! POST /api/documents                         {title, language?, ownerId} → 201 {documentId}
//! GET  /health                                ok
//! ```
//!
//! Each socket gets a reader loop (this task) and a writer task draining the
//! connection's outbound queue. Whichever side ends first ends both, and the
//! service's disconnect runs on every exit path.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval};

use crate::broadcast::OutboundFrame;
use crate::config::ServerConfig;
use crate::service::{CollabError, CollaborationService, ConnectParams};
use crate::storage::{RocksStore, StoreConfig, StoreError};

#[derive(Clone)]
struct AppState {
    service: Arc<CollaborationService>,
    config: Arc<ServerConfig>,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    service: Arc<CollaborationService>,
}

impl CollabServer {
    /// Build a server, opening RocksDB when a storage path is configured and
    /// falling back to in-memory stores otherwise.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let service = match &config.storage_path {
            Some(path) => {
                let store = Arc::new(RocksStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?);
                CollaborationService::new(store.clone(), store)
            }
            None => CollaborationService::in_memory(),
        }
        .with_persist_on_update(config.persist_on_update);

        Ok(Self::with_service(config, Arc::new(service)))
    }

    /// Build a server around an existing service.
    pub fn with_service(config: ServerConfig, service: Arc<CollaborationService>) -> Self {
        Self { config, service }
    }

    pub fn service(&self) -> &Arc<CollaborationService> {
        &self.service
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            service: self.service.clone(),
            config: Arc::new(self.config.clone()),
        };
        Router::new()
            .route("/collaborate", get(collaborate_handler))
            .route("/api/documents", post(create_document_handler))
            .route("/api/documents/{id}/sessions", get(sessions_handler))
            .route("/health", get(health_handler))
            .with_state(state)
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        axum::serve(listener, self.router()).await
    }
}

// ─── WebSocket ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollaborateQuery {
    document_id: Option<String>,
    user_id: Option<String>,
}

async fn collaborate_handler(
    Query(query): Query<CollaborateQuery>,
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(document_id) = query.document_id.filter(|id| !id.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, "documentId is required").into_response();
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let params = ConnectParams {
        document_id,
        user_id: query.user_id.filter(|id| !id.is_empty()),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(socket: WebSocket, state: AppState, params: ConnectParams) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel(state.config.effective_outbound_capacity());

    let id = match state.service.open(params, tx).await {
        Ok(id) => id,
        Err(e) => {
            log::warn!("Rejecting connection: {e}");
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    let heartbeat_secs = state.config.heartbeat_interval_secs;
    let mut writer = tokio::spawn(async move {
        let mut heartbeat = (heartbeat_secs > 0).then(|| {
            let period = Duration::from_secs(heartbeat_secs);
            interval_at(Instant::now() + period, period)
        });
        loop {
            let message = tokio::select! {
                frame = rx.recv() => match frame {
                    Some(OutboundFrame::Binary(bytes)) => Message::Binary(bytes),
                    Some(OutboundFrame::Text(text)) => Message::Text(text.into()),
                    None => break,
                },
                _ = tick(&mut heartbeat) => Message::Ping(Bytes::new()),
            };
            if let Err(e) = sink.send(message).await {
                log::debug!("Write to connection {id} failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => state.service.handle_binary(id, data).await,
                Some(Ok(Message::Text(text))) => state.service.handle_text(id, text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => {
                    log::debug!("Connection {id} closed by peer");
                    break;
                }
                // Pings are answered by the WebSocket layer.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("WebSocket error on connection {id}: {e}");
                    break;
                }
            },
            _ = &mut writer => {
                log::debug!("Writer for connection {id} finished");
                break;
            }
        }
    }

    state.service.disconnect(id).await;
    writer.abort();
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ─── REST ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDocumentRequest {
    title: String,
    language: Option<String>,
    owner_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateDocumentResponse {
    document_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (status, Json(ErrorBody { error: error.to_string() })).into_response()
}

async fn create_document_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateDocumentRequest>,
) -> Response {
    let result = state
        .service
        .create_document(&request.title, request.language.as_deref(), &request.owner_id)
        .await;
    match result {
        Ok(document_id) => {
            (StatusCode::CREATED, Json(CreateDocumentResponse { document_id })).into_response()
        }
        Err(CollabError::Store(StoreError::Invalid(reason))) => {
            error_response(StatusCode::BAD_REQUEST, reason)
        }
        Err(e) => {
            log::error!("Failed to create document: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn sessions_handler(State(state): State<AppState>, Path(document_id): Path<String>) -> Response {
    match state.service.document_sessions(&document_id).await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => {
            log::error!("Failed to list sessions for document {document_id}: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn health_handler() -> &'static str {
    "ok"
}
