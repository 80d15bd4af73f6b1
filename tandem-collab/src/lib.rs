//! # tandem-collab: Real-time collaborative editing core
//!
//! Many editors connect over WebSocket to a shared code document and see each
//! other's edits and cursors live. Document state is a yrs CRDT; presence is
//! y-protocols awareness. Both travel over the y-protocols binary framing, and
//! JSON control messages share the text channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    WebSocket     ┌──────────────────────────────┐
//! │ editor /     │ ◄──────────────► │ CollabServer (axum)          │
//! │ CollabClient │  binary + JSON   └──────────────┬───────────────┘
//! └──────────────┘                                 │
//!                                   ┌──────────────▼───────────────┐
//!                                   │ CollaborationService         │
//!                                   └─┬──────────┬─────────┬─────┬─┘
//!                                     │          │         │     │
//!                          ┌──────────▼─┐ ┌──────▼────┐ ┌──▼───┐ ┌▼───────────────┐
//!                          │ReplicaStore│ │Awareness  │ │Conn- │ │SessionLifecycle│
//!                          │ (yrs docs) │ │Registry   │ │ection│ │                │
//!                          └─────┬──────┘ └───────────┘ │Mgr   │ └──────┬─────────┘
//!                                │                      └──────┘        │
//!                          ┌─────▼──────────────────────────────────────▼──┐
//!                          │ DocumentStore / SessionStore (RocksDB, memory)│
//!                          └───────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: y-protocols framing and JSON control messages
//! - [`replica`]: per-document CRDT replicas and their persistence
//! - [`awareness`]: per-document presence with per-client clocks
//! - [`broadcast`]: connection registry and fan-out
//! - [`session`]: durable session records
//! - [`service`]: connection lifecycle and message dispatch
//! - [`server`]: axum transport and REST endpoints
//! - [`client`]: WebSocket client with a local replica
//! - [`storage`]: store traits, RocksDB and in-memory backends

pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod events;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod service;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use awareness::{AwarenessRegistry, AwarenessUpdate, AwarenessUpdateEntry};
pub use broadcast::{ConnectionId, ConnectionInfo, ConnectionManager, OutboundFrame};
pub use client::{ClientEvent, CollabClient, ConnectionState};
pub use config::ServerConfig;
pub use events::{EventHandler, LogEventHandler};
pub use protocol::{ControlMessage, InboundFrame, ProtocolError, StructuredEvent};
pub use replica::{Replica, ReplicaStore};
pub use server::CollabServer;
pub use service::{CollabError, CollaborationService, ConnectParams, ServiceStats};
pub use session::{DocumentSessions, SessionLifecycle, SessionSummary};
pub use storage::{
    DocumentRecord, DocumentStore, Language, MemoryDocumentStore, MemorySessionStore, NewDocument,
    RocksStore, SessionRecord, SessionStore, StoreConfig, StoreError,
};
