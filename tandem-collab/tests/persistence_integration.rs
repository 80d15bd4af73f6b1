//! Persistence integration tests: documents survive their last connection
//! and are re-hydrated from storage by the next one.

use std::future::Future;
use std::sync::Arc;

use tandem_collab::client::{ClientEvent, CollabClient};
use tandem_collab::config::ServerConfig;
use tandem_collab::server::CollabServer;
use tandem_collab::service::CollaborationService;
use tandem_collab::storage::{
    DocumentStore, MemoryDocumentStore, MemorySessionStore, RocksStore, SessionStore, StoreConfig,
};
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration, Instant};

const WAIT: Duration = Duration::from_secs(3);

async fn serve(service: Arc<CollaborationService>) -> String {
    let server = CollabServer::with_service(ServerConfig::for_testing(), service);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    format!("ws://{addr}")
}

async fn join(url: &str, document_id: &str, user_id: Option<&str>) -> CollabClient {
    let mut client = CollabClient::connect(url, document_id, user_id).await.unwrap();
    client
        .wait_for(WAIT, |e| matches!(e, ClientEvent::Established { .. }))
        .await
        .expect("connection should be established");
    client
}

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

fn rocks_store(dir: &tempfile::TempDir) -> Arc<RocksStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap())
}

#[tokio::test]
async fn test_last_disconnect_persists_document() {
    let store = Arc::new(MemoryDocumentStore::new());
    let service = Arc::new(
        CollaborationService::new(store.clone(), Arc::new(MemorySessionStore::new()))
            .with_persist_on_update(false),
    );
    let url = serve(service.clone()).await;

    let mut alice = join(&url, "notes", None).await;
    alice.insert(0, "one ").await.unwrap();
    alice.insert(4, "two ").await.unwrap();
    alice.insert(8, "three").await.unwrap();
    let replica = service.replicas().get("notes").await.unwrap();
    assert!(eventually(|| async { replica.text().await == "one two three" }).await);
    assert_eq!(store.save_count("notes").await, 0);

    alice.close().await;
    assert!(eventually(|| async { store.save_count("notes").await == 1 }).await);
    let record = store.get("notes").await.unwrap().unwrap();
    assert_eq!(record.content, "one two three");
}

#[tokio::test]
async fn test_updates_persist_while_connected() {
    let store = Arc::new(MemoryDocumentStore::new());
    let service = Arc::new(CollaborationService::new(
        store.clone(),
        Arc::new(MemorySessionStore::new()),
    ));
    let url = serve(service).await;

    let alice = join(&url, "live", None).await;
    alice.insert(0, "saved early").await.unwrap();
    assert!(
        eventually(|| async {
            matches!(store.get("live").await, Ok(Some(record)) if record.content == "saved early")
        })
        .await
    );
}

#[tokio::test]
async fn test_rocks_document_rehydrates_after_unload() {
    let dir = tempfile::tempdir().unwrap();
    let store = rocks_store(&dir);
    let service = Arc::new(CollaborationService::new(store.clone(), store.clone()));
    let url = serve(service.clone()).await;

    let mut alice = join(&url, "durable", Some("alice")).await;
    alice.insert(0, "written to disk").await.unwrap();
    let replica = service.replicas().get("durable").await.unwrap();
    assert!(eventually(|| async { replica.text().await == "written to disk" }).await);
    alice.close().await;

    assert!(eventually(|| async { service.active_count("durable").await == 0 }).await);
    assert!(
        eventually(|| async {
            matches!(DocumentStore::get(store.as_ref(), "durable").await,
                Ok(Some(record)) if record.content == "written to disk")
        })
        .await
    );

    // Drop the in-memory replica; the next connection loads it from RocksDB.
    assert!(service.remove_document("durable").await);
    let mut bob = join(&url, "durable", None).await;
    assert!(bob.wait_for_text("written to disk", WAIT).await);
}

#[tokio::test]
async fn test_rocks_state_survives_service_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = rocks_store(&dir);

    {
        let service = Arc::new(CollaborationService::new(store.clone(), store.clone()));
        let url = serve(service.clone()).await;
        let mut alice = join(&url, "restart", None).await;
        alice.insert(0, "before restart").await.unwrap();
        let replica = service.replicas().get("restart").await.unwrap();
        assert!(eventually(|| async { replica.text().await == "before restart" }).await);
        alice.close().await;
        assert!(eventually(|| async { service.active_count("restart").await == 0 }).await);
        assert!(
            eventually(|| async {
                matches!(DocumentStore::get(store.as_ref(), "restart").await,
                    Ok(Some(record)) if record.content == "before restart")
            })
            .await
        );
    }

    // A fresh service over the same store starts with no live replicas.
    let service = Arc::new(CollaborationService::new(store.clone(), store.clone()));
    assert!(service.replicas().is_empty().await);
    let url = serve(service).await;
    let mut carol = join(&url, "restart", None).await;
    assert!(carol.wait_for_text("before restart", WAIT).await);
}

#[tokio::test]
async fn test_rocks_sessions_follow_connections() {
    let dir = tempfile::tempdir().unwrap();
    let store = rocks_store(&dir);
    let service = Arc::new(CollaborationService::new(store.clone(), store.clone()));
    let url = serve(service.clone()).await;

    let mut user = join(&url, "team", Some("u1")).await;
    let active = SessionStore::active_sessions(store.as_ref(), "team").await.unwrap();
    assert_eq!(active.len(), 1);
    let session_id = active[0].id;

    user.close().await;
    assert!(
        eventually(|| async {
            SessionStore::active_sessions(store.as_ref(), "team")
                .await
                .unwrap()
                .is_empty()
        })
        .await
    );
    let record = SessionStore::get(store.as_ref(), session_id).await.unwrap().unwrap();
    assert!(!record.is_active);
    assert!(record.last_seen >= record.joined_at);
}

#[tokio::test]
async fn test_created_document_is_served_with_template() {
    let dir = tempfile::tempdir().unwrap();
    let store = rocks_store(&dir);
    let service = Arc::new(CollaborationService::new(store.clone(), store.clone()));
    let url = serve(service.clone()).await;

    let id = service
        .create_document("Kickoff", Some("typescript"), "owner")
        .await
        .unwrap();
    let record = DocumentStore::get(store.as_ref(), &id).await.unwrap().unwrap();
    assert_eq!(record.title, "Kickoff");
    assert_eq!(record.language.as_str(), "typescript");

    let mut alice = join(&url, &id, None).await;
    assert!(
        alice
            .wait_for_text(tandem_collab::replica::WELCOME_TEMPLATE, WAIT)
            .await
    );
}
