//! Durable storage for documents and participant sessions.
//!
//! ```text
//! ┌──────────────┐  load_state / save_state  ┌─────────────────┐
//! │ ReplicaStore │ ────────────────────────► │ DocumentStore   │──┐
//! └──────────────┘                           └─────────────────┘  │  MemoryDocumentStore
//! ┌──────────────────┐  create / deactivate  ┌─────────────────┐  ├─ MemorySessionStore
//! │ SessionLifecycle │ ────────────────────► │ SessionStore    │──┘  RocksStore (both)
//! └──────────────────┘                       └─────────────────┘
//! ```
//!
//! The collaboration core only ever talks to the two traits. The in-memory
//! implementations back tests and the default server; [`RocksStore`] gives
//! durability across restarts.

pub mod memory;
pub mod rocks;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use memory::{MemoryDocumentStore, MemorySessionStore};
pub use rocks::{RocksStore, StoreConfig};

/// Maximum title length in characters, after trimming.
pub const MAX_TITLE_CHARS: usize = 255;

/// Title given to documents first seen through a state save.
pub const UNTITLED: &str = "Untitled";

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("Database error: {0}")]
    Database(String),
    /// Document or session not found
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    /// Rejected input (title, language)
    #[error("Invalid input: {0}")]
    Invalid(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for StoreError {
    fn from(e: bincode::error::EncodeError) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for StoreError {
    fn from(e: bincode::error::DecodeError) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

// ─── Documents ────────────────────────────────────────────────────────

/// Editor language of a document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Javascript,
    Typescript,
    Python,
    Java,
    Cpp,
    Html,
    Css,
    Json,
    Markdown,
}

impl Language {
    pub const ALL: [Language; 9] = [
        Language::Javascript,
        Language::Typescript,
        Language::Python,
        Language::Java,
        Language::Cpp,
        Language::Html,
        Language::Css,
        Language::Json,
        Language::Markdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Javascript => "javascript",
            Language::Typescript => "typescript",
            Language::Python => "python",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::Html => "html",
            Language::Css => "css",
            Language::Json => "json",
            Language::Markdown => "markdown",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .iter()
            .copied()
            .find(|lang| lang.as_str() == s)
            .ok_or_else(|| StoreError::Invalid(format!("unsupported language '{s}'")))
    }
}

/// Request to allocate a new document record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDocument {
    pub title: String,
    pub language: Language,
    pub owner_id: String,
}

impl NewDocument {
    /// Build a request from raw input, trimming and validating the title and
    /// parsing the language (absent means the default).
    pub fn parse(
        title: &str,
        language: Option<&str>,
        owner_id: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let title = title.trim();
        let chars = title.chars().count();
        if chars == 0 {
            return Err(StoreError::Invalid("title must not be empty".into()));
        }
        if chars > MAX_TITLE_CHARS {
            return Err(StoreError::Invalid(format!(
                "title must be at most {MAX_TITLE_CHARS} characters"
            )));
        }
        let language = match language {
            Some(lang) => lang.parse()?,
            None => Language::default(),
        };
        Ok(Self {
            title: title.to_string(),
            language,
            owner_id: owner_id.into(),
        })
    }
}

/// Persisted document metadata plus the plain-text snapshot.
///
/// The replicated state blob is stored separately; see
/// [`DocumentStore::load_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub id: String,
    pub title: String,
    pub language: Language,
    pub owner_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    pub fn new(id: impl Into<String>, new: NewDocument) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: new.title,
            language: new.language,
            owner_id: new.owner_id,
            content: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Record for a document that was saved before it was ever created.
    pub fn untitled(id: impl Into<String>) -> Self {
        Self::new(
            id,
            NewDocument {
                title: UNTITLED.to_string(),
                language: Language::default(),
                owner_id: String::new(),
            },
        )
    }
}

/// Persistence of document records and replicated state.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Allocate a record with a fresh id.
    async fn create(&self, document: NewDocument) -> Result<DocumentRecord, StoreError>;

    async fn get(&self, document_id: &str) -> Result<Option<DocumentRecord>, StoreError>;

    /// Last persisted state blob, if any.
    async fn load_state(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Overwrite the state blob and plain text, stamping `updated_at`.
    /// Creates an untitled record if none exists.
    async fn save_state(
        &self,
        document_id: &str,
        state: &[u8],
        content: &str,
    ) -> Result<(), StoreError>;
}

// ─── Sessions ─────────────────────────────────────────────────────────

/// Zero-based cursor position reported through awareness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

impl CursorPosition {
    /// Extract `cursor: {line, column}` from an awareness JSON state.
    pub fn from_awareness(state: &serde_json::Value) -> Option<Self> {
        let cursor = state.get("cursor")?;
        let line = cursor.get("line")?.as_u64()?;
        let column = cursor.get("column")?.as_u64()?;
        Some(Self {
            line: u32::try_from(line).ok()?,
            column: u32::try_from(column).ok()?,
        })
    }
}

/// A participant's presence in a document, one per identified connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: Uuid,
    pub document_id: String,
    pub user_id: String,
    pub connection_id: Uuid,
    pub cursor: CursorPosition,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub document_id: String,
    pub user_id: String,
    pub connection_id: Uuid,
}

impl SessionRecord {
    pub fn new(new: NewSession) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            document_id: new.document_id,
            user_id: new.user_id,
            connection_id: new.connection_id,
            cursor: CursorPosition::default(),
            is_active: true,
            joined_at: now,
            last_seen: now,
        }
    }

    /// Mark inactive. `last_seen` never precedes `joined_at`.
    pub fn deactivate(&mut self) {
        self.is_active = false;
        self.last_seen = Utc::now().max(self.joined_at);
    }
}

/// Persistence of session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: NewSession) -> Result<SessionRecord, StoreError>;

    async fn get(&self, session_id: Uuid) -> Result<Option<SessionRecord>, StoreError>;

    /// Mark a session inactive and stamp `last_seen`.
    async fn deactivate(&self, session_id: Uuid) -> Result<(), StoreError>;

    async fn update_cursor(
        &self,
        session_id: Uuid,
        cursor: CursorPosition,
    ) -> Result<(), StoreError>;

    /// Active sessions of a document, oldest first.
    async fn active_sessions(&self, document_id: &str) -> Result<Vec<SessionRecord>, StoreError>;
}
