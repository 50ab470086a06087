//! Message Storage
//!
//! Append-only record of chat messages, replayed per conversation pair.
//! Supports both in-memory (for testing) and SQLite (for production).
//!
//! The SQLite schema is shared with the desktop client: `users` and
//! `contacts` are created if missing so both processes can open the same
//! database file, but the relay only ever writes to `messages`.

use std::fmt;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection};
use serde::Serialize;
use thiserror::Error;

/// User identity as announced in the handshake.
pub type UserId = i64;

/// Insertion-ordered sequence id of a stored message.
pub type MessageId = i64;

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage lock poisoned")]
    Poisoned,
}

/// Kind tag carried in the third field of an application frame.
///
/// `Text` is the "no special kind" marker; every other tag is kept
/// verbatim, including ones the relay does not recognize.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub enum MessageKind {
    Text,
    File,
    Sticker,
    Voice,
    Other(String),
}

impl MessageKind {
    /// Parses a kind tag. Never fails: unknown tags become `Other`.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "text" => MessageKind::Text,
            "file" => MessageKind::File,
            "sticker" => MessageKind::Sticker,
            "voice" => MessageKind::Voice,
            other => MessageKind::Other(other.to_string()),
        }
    }

    /// Returns the wire tag.
    pub fn as_tag(&self) -> &str {
        match self {
            MessageKind::Text => "text",
            MessageKind::File => "file",
            MessageKind::Sticker => "sticker",
            MessageKind::Voice => "voice",
            MessageKind::Other(tag) => tag,
        }
    }

    /// Value stored in the `file_type` column. `None` for plain text.
    pub fn to_column(&self) -> Option<&str> {
        match self {
            MessageKind::Text => None,
            other => Some(other.as_tag()),
        }
    }

    /// Inverse of [`MessageKind::to_column`].
    pub fn from_column(value: Option<String>) -> Self {
        match value {
            None => MessageKind::Text,
            Some(tag) => MessageKind::from_tag(&tag),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        kind.as_tag().to_string()
    }
}

/// A message about to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub kind: MessageKind,
    pub content: String,
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    /// Insertion sequence id; conversation replay is ordered by it.
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub kind: MessageKind,
    /// Text body, file name, or opaque reference depending on `kind`.
    pub content: String,
    /// When the relay stored the message (Unix timestamp in seconds).
    pub created_at_secs: u64,
}

impl StoredMessage {
    fn from_new(id: MessageId, message: NewMessage, created_at_secs: u64) -> Self {
        StoredMessage {
            id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            kind: message.kind,
            content: message.content,
            created_at_secs,
        }
    }

    /// Whether this message belongs to the conversation between `a` and `b`.
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Trait for message storage backends.
pub trait MessageStore: Send + Sync {
    /// Durably records a message and returns its sequence id.
    fn append(&self, message: NewMessage) -> Result<MessageId, StoreError>;

    /// Returns every message exchanged between `a` and `b`, in either
    /// direction, ascending by sequence id.
    fn query_conversation(&self, a: UserId, b: UserId) -> Result<Vec<StoredMessage>, StoreError>;

    /// Returns the total number of stored messages.
    fn message_count(&self) -> usize;
}

// ============================================================================
// In-Memory Storage (for testing and development)
// ============================================================================

/// In-memory message log.
pub struct MemoryMessageStore {
    messages: RwLock<Vec<StoredMessage>>,
}

impl MemoryMessageStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        MemoryMessageStore {
            messages: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for MemoryMessageStore {
    fn append(&self, message: NewMessage) -> Result<MessageId, StoreError> {
        let mut messages = self.messages.write().map_err(|_| StoreError::Poisoned)?;
        let id = messages.last().map_or(1, |m| m.id + 1);
        messages.push(StoredMessage::from_new(id, message, now_secs()));
        Ok(id)
    }

    fn query_conversation(&self, a: UserId, b: UserId) -> Result<Vec<StoredMessage>, StoreError> {
        let messages = self.messages.read().map_err(|_| StoreError::Poisoned)?;
        Ok(messages
            .iter()
            .filter(|m| m.is_between(a, b))
            .cloned()
            .collect())
    }

    fn message_count(&self) -> usize {
        self.messages.read().map(|m| m.len()).unwrap_or(0)
    }
}

// ============================================================================
// SQLite Storage (for production)
// ============================================================================

/// SQLite-backed persistent message log.
pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
}

impl SqliteMessageStore {
    /// Opens or creates a SQLite database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL lets the desktop client read history while the relay appends
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=10000;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                username TEXT UNIQUE,
                phone TEXT UNIQUE,
                password TEXT,
                profile_pic TEXT
            );
            CREATE TABLE IF NOT EXISTS contacts (
                id INTEGER PRIMARY KEY,
                user_id INTEGER,
                contact_id INTEGER
            );
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_id INTEGER NOT NULL,
                receiver_id INTEGER NOT NULL,
                content TEXT,
                file_data BLOB,
                file_type TEXT,
                created_at_secs INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_messages_pair
                ON messages(sender_id, receiver_id);",
        )?;

        Ok(SqliteMessageStore {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory SQLite database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
        Ok(StoredMessage {
            id: row.get(0)?,
            sender_id: row.get(1)?,
            receiver_id: row.get(2)?,
            kind: MessageKind::from_column(row.get(3)?),
            content: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            created_at_secs: row.get::<_, i64>(5)? as u64,
        })
    }
}

impl MessageStore for SqliteMessageStore {
    fn append(&self, message: NewMessage) -> Result<MessageId, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT INTO messages (sender_id, receiver_id, content, file_type, created_at_secs)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.sender_id,
                message.receiver_id,
                message.content,
                message.kind.to_column(),
                now_secs() as i64
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn query_conversation(&self, a: UserId, b: UserId) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, sender_id, receiver_id, file_type, content, created_at_secs
             FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![a, b], Self::read_row)?;
        let messages = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    fn message_count(&self) -> usize {
        let Ok(conn) = self.conn.lock() else {
            return 0;
        };
        conn.query_row("SELECT COUNT(*) FROM messages", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }
}

// ============================================================================
// Storage Factory
// ============================================================================

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// In-memory storage (lost on restart).
    Memory,
    /// SQLite persistent storage.
    #[default]
    Sqlite,
}

/// File name of the shared messenger database inside the data directory.
pub const DATABASE_FILE: &str = "messenger.db";

/// Creates a message store based on the backend type.
pub fn create_message_store(
    backend: StorageBackend,
    data_dir: Option<&Path>,
) -> Result<Box<dyn MessageStore>, StoreError> {
    match backend {
        StorageBackend::Memory => Ok(Box::new(MemoryMessageStore::new())),
        StorageBackend::Sqlite => {
            let path = data_dir
                .map(|d| d.join(DATABASE_FILE))
                .unwrap_or_else(|| std::path::PathBuf::from(DATABASE_FILE));

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            Ok(Box::new(SqliteMessageStore::open(&path)?))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
