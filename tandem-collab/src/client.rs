//! WebSocket client with a local replica.
//!
//! Speaks the same y-protocols framing as browser providers: it sends its own
//! SyncStep1 on connect, answers the server's SyncStep1 with a SyncStep2,
//! and merges every SyncStep2/Update it receives. Used by the integration
//! tests and handy for scripting against a running server.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use yrs::sync::SyncMessage;

use crate::awareness::{AwarenessUpdate, AwarenessUpdateEntry, REMOVED_STATE};
use crate::protocol::{
    encode_awareness, encode_sync_step1, encode_sync_step2, encode_update, InboundFrame,
    ProtocolError,
};
use crate::replica::Replica;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The server acknowledged the connection.
    Established {
        connection_id: String,
        document_id: String,
    },
    /// Remote edits were merged into the local replica.
    RemoteUpdate,
    /// Awareness update relayed by the server.
    Awareness(AwarenessUpdate),
    /// Any other JSON control frame (e.g. `pong`).
    Control(serde_json::Value),
    /// The connection closed.
    Disconnected,
}

pub struct CollabClient {
    document_id: String,
    replica: Arc<Replica>,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: mpsc::Receiver<ClientEvent>,
    awareness_id: u64,
    awareness_clock: AtomicU32,
}

impl CollabClient {
    /// Connect to `base_url` (e.g. `ws://127.0.0.1:9090`) and start syncing
    /// `document_id`.
    pub async fn connect(
        base_url: &str,
        document_id: &str,
        user_id: Option<&str>,
    ) -> Result<Self, ProtocolError> {
        let url = collaborate_url(base_url, document_id, user_id);
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let replica = Arc::new(Replica::new());
        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        let (event_tx, event_rx) = mpsc::channel(1024);

        // Writer task: forward outgoing channel to the socket
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_writer.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: merge sync frames, surface everything else as events
        {
            let replica = replica.clone();
            let state = state.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                while let Some(message) = ws_reader.next().await {
                    let event = match message {
                        Ok(Message::Binary(data)) => {
                            handle_binary(&replica, &out_tx, &data).await
                        }
                        Ok(Message::Text(text)) => handle_text(text.as_str()),
                        Ok(Message::Close(_)) | Err(_) => break,
                        Ok(_) => None,
                    };
                    if let Some(event) = event {
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                *state.write().await = ConnectionState::Disconnected;
                let _ = event_tx.send(ClientEvent::Disconnected).await;
            });
        }

        let client = Self {
            document_id: document_id.to_string(),
            replica,
            state,
            outgoing_tx: Some(out_tx),
            event_rx,
            // Kept within 53 bits so JavaScript peers can read it.
            awareness_id: uuid::Uuid::new_v4().as_u64_pair().0 >> 11,
            awareness_clock: AtomicU32::new(0),
        };

        let step1 = encode_sync_step1(client.replica.state_vector().await);
        client.send_raw(step1).await?;
        Ok(client)
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Client id used in awareness updates.
    pub fn awareness_id(&self) -> u64 {
        self.awareness_id
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn text(&self) -> String {
        self.replica.text().await
    }

    /// Edit locally and send the resulting update.
    pub async fn insert(&self, index: u32, chunk: &str) -> Result<(), ProtocolError> {
        let update = self.replica.insert(index, chunk).await;
        self.send_raw(encode_update(update)).await
    }

    pub async fn remove(&self, index: u32, len: u32) -> Result<(), ProtocolError> {
        let update = self.replica.remove(index, len).await;
        self.send_raw(encode_update(update)).await
    }

    /// Publish this client's awareness state. `None` announces departure.
    pub async fn set_awareness(
        &self,
        state: Option<&serde_json::Value>,
    ) -> Result<(), ProtocolError> {
        let clock = self.awareness_clock.fetch_add(1, Ordering::SeqCst) + 1;
        let json = state
            .map(|s| s.to_string())
            .unwrap_or_else(|| REMOVED_STATE.to_string());
        let update = AwarenessUpdate {
            clients: [(self.awareness_id, AwarenessUpdateEntry { clock, json: json.into() })].into(),
        };
        self.send_raw(encode_awareness(update)).await
    }

    /// Send a pre-encoded binary frame.
    pub async fn send_raw(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(Message::Binary(frame.into())).await
    }

    /// Send a text frame.
    pub async fn send_text(&self, text: &str) -> Result<(), ProtocolError> {
        self.send(Message::Text(text.to_string().into())).await
    }

    async fn send(&self, message: Message) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(message)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Next event, or `None` after `timeout`.
    pub async fn next_event(&mut self, timeout: Duration) -> Option<ClientEvent> {
        tokio::time::timeout(timeout, self.event_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Consume events until `matches` accepts one. Returns it, or `None` on
    /// timeout or disconnect.
    pub async fn wait_for(
        &mut self,
        timeout: Duration,
        mut matches: impl FnMut(&ClientEvent) -> bool,
    ) -> Option<ClientEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let event = self.next_event(remaining).await?;
            if matches(&event) {
                return Some(event);
            }
            if event == ClientEvent::Disconnected {
                return None;
            }
        }
    }

    /// Wait until the local text equals `expected`.
    pub async fn wait_for_text(&mut self, expected: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.text().await == expected {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.next_event(remaining).await {
                Some(ClientEvent::Disconnected) | None => return self.text().await == expected,
                Some(_) => {}
            }
        }
    }

    /// Close the socket.
    pub async fn close(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
    }
}

/// WebSocket URL of the collaborate endpoint with a percent-encoded query.
fn collaborate_url(base_url: &str, document_id: &str, user_id: Option<&str>) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query.append_pair("documentId", document_id);
    if let Some(user_id) = user_id {
        query.append_pair("userId", user_id);
    }
    format!("{}/collaborate?{}", base_url.trim_end_matches('/'), query.finish())
}

async fn handle_binary(
    replica: &Replica,
    out_tx: &mpsc::Sender<Message>,
    data: &[u8],
) -> Option<ClientEvent> {
    let frame = match InboundFrame::decode(data) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Client dropping frame: {e}");
            return None;
        }
    };
    match frame {
        InboundFrame::Sync(SyncMessage::SyncStep1(remote)) => {
            let diff = replica.encode_diff(&remote).await;
            let _ = out_tx
                .send(Message::Binary(encode_sync_step2(diff).into()))
                .await;
            None
        }
        InboundFrame::Sync(SyncMessage::SyncStep2(update))
        | InboundFrame::Sync(SyncMessage::Update(update)) => {
            match replica.apply_update(&update).await {
                Ok(()) => Some(ClientEvent::RemoteUpdate),
                Err(e) => {
                    log::warn!("Client failed to merge update: {e}");
                    None
                }
            }
        }
        InboundFrame::Awareness(update) => Some(ClientEvent::Awareness(update)),
    }
}

fn handle_text(text: &str) -> Option<ClientEvent> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value.get("type").and_then(|t| t.as_str()) == Some("connection-established") {
        let field = |name: &str| value.get(name).and_then(|v| v.as_str()).map(str::to_string);
        return Some(ClientEvent::Established {
            connection_id: field("connectionId")?,
            document_id: field("documentId")?,
        });
    }
    Some(ClientEvent::Control(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_established_event() {
        let event =
            handle_text(r#"{"type":"connection-established","connectionId":"c","documentId":"d"}"#);
        assert_eq!(
            event,
            Some(ClientEvent::Established {
                connection_id: "c".into(),
                document_id: "d".into()
            })
        );
    }

    #[test]
    fn test_other_control_frames() {
        let event = handle_text(r#"{"type":"pong"}"#).unwrap();
        match event {
            ClientEvent::Control(value) => assert_eq!(value["type"], "pong"),
            other => panic!("expected control event, got {other:?}"),
        }
        assert!(handle_text("not json").is_none());
    }

    #[test]
    fn test_collaborate_url_encodes_ids() {
        assert_eq!(
            collaborate_url("ws://host:9090/", "doc-1", None),
            "ws://host:9090/collaborate?documentId=doc-1"
        );

        let url = collaborate_url("ws://host", "a b&c=d", Some("ü/1#x"));
        assert_eq!(
            url,
            "ws://host/collaborate?documentId=a+b%26c%3Dd&userId=%C3%BC%2F1%23x"
        );
        let query = url.split_once('?').unwrap().1;
        let pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("documentId".to_string(), "a b&c=d".to_string()),
                ("userId".to_string(), "ü/1#x".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_step1_is_answered() {
        let local = Replica::with_text("local");
        let (tx, mut rx) = mpsc::channel(4);
        let frame = encode_sync_step1(yrs::StateVector::default());
        assert!(handle_binary(&local, &tx, &frame).await.is_none());

        match rx.recv().await.unwrap() {
            Message::Binary(bytes) => match InboundFrame::decode(&bytes).unwrap() {
                InboundFrame::Sync(SyncMessage::SyncStep2(diff)) => {
                    let remote = Replica::new();
                    remote.apply_update(&diff).await.unwrap();
                    assert_eq!(remote.text().await, "local");
                }
                other => panic!("expected step2, got {other:?}"),
            },
            other => panic!("expected binary, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_is_merged() {
        let source = Replica::new();
        let update = source.insert(0, "remote").await;
        let local = Replica::new();
        let (tx, _rx) = mpsc::channel(4);

        let event = handle_binary(&local, &tx, &encode_update(update)).await;
        assert_eq!(event, Some(ClientEvent::RemoteUpdate));
        assert_eq!(local.text().await, "remote");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = CollabClient::connect(&format!("ws://{addr}"), "doc", None).await;
        assert!(matches!(result, Err(ProtocolError::Transport(_))));
    }
}
