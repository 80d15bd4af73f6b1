//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use std::future::Future;
use std::sync::Arc;

use tandem_collab::awareness::is_removal;
use tandem_collab::client::{ClientEvent, CollabClient, ConnectionState};
use tandem_collab::config::ServerConfig;
use tandem_collab::server::CollabServer;
use tandem_collab::service::CollaborationService;
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration, Instant};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(3);

/// Start a server on a free port, return its ws:// base URL and service.
async fn start_test_server() -> (String, Arc<CollaborationService>) {
    let server = CollabServer::new(ServerConfig::for_testing()).unwrap();
    let service = server.service().clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (format!("ws://{addr}"), service)
}

/// Connect and wait for the `connection-established` frame.
async fn join(url: &str, document_id: &str, user_id: Option<&str>) -> CollabClient {
    let mut client = CollabClient::connect(url, document_id, user_id)
        .await
        .expect("client should connect");
    let event = client
        .wait_for(WAIT, |e| matches!(e, ClientEvent::Established { .. }))
        .await;
    match event {
        Some(ClientEvent::Established { document_id: doc, .. }) => assert_eq!(doc, document_id),
        other => panic!("expected Established, got {other:?}"),
    }
    client
}

/// Discard whatever arrives within `quiet`.
async fn drain(client: &mut CollabClient, quiet: Duration) {
    while client.next_event(quiet).await.is_some() {}
}

/// Poll `check` until it returns true or the wait expires.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

fn new_document_id() -> String {
    Uuid::new_v4().to_string()
}

#[tokio::test]
async fn test_client_connects_and_is_acknowledged() {
    let (url, service) = start_test_server().await;
    let doc = new_document_id();

    let client = join(&url, &doc, Some("alice")).await;
    assert_eq!(client.state().await, ConnectionState::Connected);
    assert_eq!(service.active_count(&doc).await, 1);
}

#[tokio::test]
async fn test_missing_document_id_is_rejected() {
    let (url, _service) = start_test_server().await;
    let result = tokio_tungstenite::connect_async(format!("{url}/collaborate?userId=u1")).await;
    assert!(result.is_err(), "upgrade without documentId must fail");
}

#[tokio::test]
async fn test_edit_reaches_other_client() {
    let (url, _service) = start_test_server().await;
    let doc = new_document_id();

    let alice = join(&url, &doc, Some("alice")).await;
    let mut bob = join(&url, &doc, Some("bob")).await;

    alice.insert(0, "hello").await.unwrap();
    assert!(bob.wait_for_text("hello", WAIT).await);
    assert_eq!(alice.text().await, "hello");
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let (url, service) = start_test_server().await;
    let doc = new_document_id();

    let alice = join(&url, &doc, None).await;
    let bob = join(&url, &doc, None).await;

    let (a, b) = tokio::join!(alice.insert(0, "foo"), bob.insert(0, "bar"));
    a.unwrap();
    b.unwrap();

    let converged = eventually(|| async {
        let (ta, tb) = (alice.text().await, bob.text().await);
        ta.len() == 6 && ta == tb
    })
    .await;
    assert!(converged, "replicas did not converge");

    let text = alice.text().await;
    assert!(text == "foobar" || text == "barfoo", "unexpected merge: {text}");

    let replica = service.replicas().get(&doc).await.unwrap();
    assert_eq!(replica.text().await, text);
}

#[tokio::test]
async fn test_late_joiner_receives_state() {
    let (url, service) = start_test_server().await;
    let doc = new_document_id();

    let alice = join(&url, &doc, None).await;
    alice.insert(0, "already here").await.unwrap();
    let replica = service.replicas().get(&doc).await.unwrap();
    assert!(eventually(|| async { replica.text().await == "already here" }).await);

    let mut carol = join(&url, &doc, None).await;
    assert!(carol.wait_for_text("already here", WAIT).await);
}

#[tokio::test]
async fn test_sender_does_not_receive_own_update() {
    let (url, _service) = start_test_server().await;
    let doc = new_document_id();

    let mut alice = join(&url, &doc, None).await;
    let mut bob = join(&url, &doc, None).await;
    drain(&mut alice, Duration::from_millis(200)).await;
    drain(&mut bob, Duration::from_millis(200)).await;

    alice.insert(0, "mine").await.unwrap();
    assert!(bob.wait_for_text("mine", WAIT).await);
    assert_eq!(alice.next_event(Duration::from_millis(300)).await, None);
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let (url, _service) = start_test_server().await;
    let doc_a = new_document_id();
    let doc_b = new_document_id();

    let alice = join(&url, &doc_a, None).await;
    let mut bob = join(&url, &doc_b, None).await;
    drain(&mut bob, Duration::from_millis(200)).await;

    alice.insert(0, "private").await.unwrap();
    assert_eq!(bob.next_event(Duration::from_millis(300)).await, None);
    assert_eq!(bob.text().await, "");
}

#[tokio::test]
async fn test_awareness_relay_and_cleanup() {
    let (url, service) = start_test_server().await;
    let doc = new_document_id();

    let mut alice = join(&url, &doc, Some("alice")).await;
    let mut bob = join(&url, &doc, Some("bob")).await;
    let alice_id = alice.awareness_id();

    let state = serde_json::json!({"user": {"name": "Alice"}, "cursor": {"line": 3, "column": 7}});
    alice.set_awareness(Some(&state)).await.unwrap();

    let event = bob
        .wait_for(WAIT, |e| match e {
            ClientEvent::Awareness(update) => update.clients.contains_key(&alice_id),
            _ => false,
        })
        .await;
    match event {
        Some(ClientEvent::Awareness(update)) => {
            let entry = &update.clients[&alice_id];
            let parsed: serde_json::Value = serde_json::from_str(&entry.json).unwrap();
            assert_eq!(parsed["user"]["name"], "Alice");
        }
        other => panic!("expected awareness, got {other:?}"),
    }

    alice.close().await;
    let removal = bob
        .wait_for(WAIT, |e| match e {
            ClientEvent::Awareness(update) => update.clients.get(&alice_id).is_some_and(is_removal),
            _ => false,
        })
        .await;
    assert!(removal.is_some(), "bob should see alice's awareness removed");

    assert!(eventually(|| async { service.active_count(&doc).await == 1 }).await);
    let snapshot = service.awareness().snapshot(&doc).await;
    assert!(snapshot.map_or(true, |s| !s.clients.contains_key(&alice_id)));
}

#[tokio::test]
async fn test_late_joiner_receives_awareness_snapshot() {
    let (url, service) = start_test_server().await;
    let doc = new_document_id();

    let alice = join(&url, &doc, None).await;
    let alice_id = alice.awareness_id();
    alice
        .set_awareness(Some(&serde_json::json!({"user": {"name": "Alice"}})))
        .await
        .unwrap();
    assert!(
        eventually(|| async {
            service
                .awareness()
                .snapshot(&doc)
                .await
                .is_some_and(|s| s.clients.contains_key(&alice_id))
        })
        .await
    );

    let mut carol = CollabClient::connect(&url, &doc, None).await.unwrap();
    let event = carol
        .wait_for(WAIT, |e| match e {
            ClientEvent::Awareness(update) => update.clients.contains_key(&alice_id),
            _ => false,
        })
        .await;
    assert!(event.is_some(), "snapshot should include alice");
}

#[tokio::test]
async fn test_ping_is_answered_with_pong() {
    let (url, _service) = start_test_server().await;
    let doc = new_document_id();

    let mut alice = join(&url, &doc, None).await;
    alice.send_text(r#"{"type":"ping"}"#).await.unwrap();
    let event = alice
        .wait_for(WAIT, |e| matches!(e, ClientEvent::Control(v) if v["type"] == "pong"))
        .await;
    assert!(event.is_some(), "expected pong");
}

#[tokio::test]
async fn test_malformed_frames_keep_connection_open() {
    let (url, service) = start_test_server().await;
    let doc = new_document_id();

    let alice = join(&url, &doc, None).await;
    let mut bob = join(&url, &doc, None).await;

    alice.send_raw(vec![]).await.unwrap();
    alice.send_raw(vec![7, 1, 2]).await.unwrap();
    alice.send_raw(vec![0, 2, 5, 0xFF]).await.unwrap();
    alice.send_text("{not json").await.unwrap();

    alice.insert(0, "still alive").await.unwrap();
    assert!(bob.wait_for_text("still alive", WAIT).await);
    assert_eq!(service.active_count(&doc).await, 2);
}

#[tokio::test]
async fn test_sessions_projection() {
    let (url, service) = start_test_server().await;
    let doc = new_document_id();

    let _anonymous = join(&url, &doc, None).await;
    let mut user = join(&url, &doc, Some("u1")).await;

    let sessions = service.document_sessions(&doc).await.unwrap();
    assert_eq!(sessions.active_connections, 2);
    assert_eq!(sessions.sessions.len(), 1);
    assert_eq!(sessions.sessions[0].user_id, "u1");

    user.set_awareness(Some(&serde_json::json!({"cursor": {"line": 4, "column": 2}})))
        .await
        .unwrap();
    assert!(
        eventually(|| async {
            let sessions = service.document_sessions(&doc).await.unwrap();
            sessions.sessions.first().is_some_and(|s| s.cursor.line == 4 && s.cursor.column == 2)
        })
        .await
    );

    user.close().await;
    assert!(
        eventually(|| async {
            let sessions = service.document_sessions(&doc).await.unwrap();
            sessions.active_connections == 1 && sessions.sessions.is_empty()
        })
        .await
    );
}

#[tokio::test]
async fn test_disconnect_cleans_up_registry() {
    let (url, service) = start_test_server().await;
    let doc = new_document_id();

    let mut alice = join(&url, &doc, None).await;
    assert_eq!(service.stats().await.connections.active_connections, 1);

    alice.close().await;
    assert!(eventually(|| async { service.active_count(&doc).await == 0 }).await);
    assert!(
        alice
            .wait_for(WAIT, |e| *e == ClientEvent::Disconnected)
            .await
            .is_some()
            || alice.state().await == ConnectionState::Disconnected
    );

    let stats = service.stats().await;
    assert_eq!(stats.connections.active_connections, 0);
    assert_eq!(stats.awareness_documents, 0);
}
