//! Database module for conversation, message, and memory persistence

pub mod conversation;
pub mod memory;
mod schema;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::{Error, Result};

pub use conversation::{Conversation, ConversationRepo, Message, MessageRole};
pub use memory::{Memory, MemoryRepo};
pub use schema::SCHEMA_VERSION;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Pooled database connection
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Durable store used by the turn endpoint
///
/// Methods are synchronous; `SQLite` calls are short enough to run on the
/// request task.
pub trait ConversationStore: Send + Sync {
    /// Load the conversation for (user, persona), creating it if absent
    ///
    /// # Errors
    ///
    /// Returns error if the store fails
    fn find_or_create_conversation(&self, user_id: &str, persona_id: &str)
    -> Result<Conversation>;

    /// Append a message; messages keep insertion order
    ///
    /// # Errors
    ///
    /// Returns error if the store fails
    fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<Message>;

    /// Refresh the conversation's last-activity time
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown conversation
    fn touch_conversation(&self, conversation_id: &str) -> Result<DateTime<Utc>>;

    /// The newest `limit` messages, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if the store fails
    fn load_recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>>;

    /// Long-term memory notes for (user, persona), oldest first
    ///
    /// # Errors
    ///
    /// Returns error if the store fails
    fn load_memory(&self, user_id: &str, persona_id: &str) -> Result<Vec<String>>;
}

/// `SQLite`-backed [`ConversationStore`]
#[derive(Clone)]
pub struct SqliteStore {
    pub conversations: ConversationRepo,
    pub memories: MemoryRepo,
}

impl SqliteStore {
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self {
            conversations: ConversationRepo::new(pool.clone()),
            memories: MemoryRepo::new(pool),
        }
    }
}

impl ConversationStore for SqliteStore {
    fn find_or_create_conversation(
        &self,
        user_id: &str,
        persona_id: &str,
    ) -> Result<Conversation> {
        self.conversations.find_or_create(user_id, persona_id)
    }

    fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<Message> {
        self.conversations
            .append_message(conversation_id, role, content)
    }

    fn touch_conversation(&self, conversation_id: &str) -> Result<DateTime<Utc>> {
        self.conversations.touch(conversation_id)
    }

    fn load_recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        self.conversations.recent_messages(conversation_id, limit)
    }

    fn load_memory(&self, user_id: &str, persona_id: &str) -> Result<Vec<String>> {
        Ok(self
            .memories
            .list(user_id, persona_id)?
            .into_iter()
            .map(|m| m.content)
            .collect())
    }
}

fn with_pragmas(manager: SqliteConnectionManager) -> SqliteConnectionManager {
    manager.with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"))
}

/// Initialize the database
///
/// # Errors
///
/// Returns error if database cannot be opened or initialized
pub fn init<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    if let Some(parent) = path.as_ref().parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let manager = with_pragmas(SqliteConnectionManager::file(path));
    let pool = Pool::builder()
        .max_size(4)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    // Run migrations on first connection
    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    schema::init(&conn)?;

    tracing::info!(version = SCHEMA_VERSION, "database initialized");
    Ok(pool)
}

/// Initialize an in-memory database (for testing)
///
/// # Errors
///
/// Returns error if database cannot be initialized
pub fn init_memory() -> Result<DbPool> {
    let manager = with_pragmas(SqliteConnectionManager::memory());
    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    schema::init(&conn)?;

    Ok(pool)
}

/// Check that a connection can be taken and queried
///
/// # Errors
///
/// Returns error if the pool or the database is unavailable
pub fn ping(pool: &DbPool) -> Result<()> {
    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
    Ok(())
}

/// Fixed-width RFC 3339 so stored timestamps sort as text
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_memory() {
        let pool = init_memory().unwrap();
        ping(&pool).unwrap();
    }

    #[test]
    fn test_init_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("calls.db");

        let pool = init(&path).unwrap();
        ping(&pool).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_store_contract() {
        let store = SqliteStore::new(init_memory().unwrap());

        let conversation = store.find_or_create_conversation("u1", "P1").unwrap();
        store
            .append_message(&conversation.id, MessageRole::User, "hi")
            .unwrap();
        store.memories.add("u1", "P1", "likes tea").unwrap();

        let recent = store.load_recent_messages(&conversation.id, 5).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(store.load_memory("u1", "P1").unwrap(), vec!["likes tea"]);
        assert!(store.load_memory("u1", "P2").unwrap().is_empty());
    }
}
