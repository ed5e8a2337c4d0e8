//! Conversation repository

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use uuid::Uuid;

use super::{DbPool, parse_datetime, timestamp};
use crate::{Error, Result};

/// A conversation between one user and one persona
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub persona_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A message in a conversation
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    /// Position in the conversation's append order
    pub seq: i64,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        persona_id: row.get(2)?,
        created_at: parse_datetime(&row.get::<_, String>(3)?),
        updated_at: parse_datetime(&row.get::<_, String>(4)?),
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        seq: row.get(0)?,
        id: row.get(1)?,
        conversation_id: row.get(2)?,
        role: MessageRole::parse(&row.get::<_, String>(3)?).unwrap_or(MessageRole::User),
        content: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

/// Conversation repository
#[derive(Clone)]
pub struct ConversationRepo {
    pool: DbPool,
}

impl ConversationRepo {
    /// Create a new conversation repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Find or create the conversation for a user and persona
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_or_create(&self, user_id: &str, persona_id: &str) -> Result<Conversation> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let now = timestamp(Utc::now());

        // A concurrent request may have created it first
        let inserted = conn
            .execute(
                "INSERT INTO conversations (id, user_id, persona_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT (user_id, persona_id) DO NOTHING",
                [id.as_str(), user_id, persona_id, now.as_str()],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let conversation = conn
            .query_row(
                "SELECT id, user_id, persona_id, created_at, updated_at
                 FROM conversations WHERE user_id = ?1 AND persona_id = ?2",
                [user_id, persona_id],
                conversation_from_row,
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        if inserted > 0 {
            tracing::debug!(
                conversation_id = %conversation.id,
                user_id,
                persona_id,
                "created conversation"
            );
        }

        Ok(conversation)
    }

    /// Get a conversation by id
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the conversation doesn't exist
    pub fn get(&self, conversation_id: &str) -> Result<Conversation> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.query_row(
            "SELECT id, user_id, persona_id, created_at, updated_at
             FROM conversations WHERE id = ?1",
            [conversation_id],
            conversation_from_row,
        )
        .optional()
        .map_err(|e| Error::Database(e.to_string()))?
        .ok_or_else(|| Error::NotFound(format!("conversation '{conversation_id}'")))
    }

    /// Append a message to a conversation
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<Message> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![&id, conversation_id, role.as_str(), content, timestamp(now)],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            seq: conn.last_insert_rowid(),
            role,
            content: content.to_string(),
            created_at: now,
        })
    }

    /// Set a conversation's `updated_at` to now
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the conversation doesn't exist
    pub fn touch(&self, conversation_id: &str) -> Result<DateTime<Utc>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now();
        let updated = conn
            .execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                [timestamp(now).as_str(), conversation_id],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        if updated == 0 {
            return Err(Error::NotFound(format!("conversation '{conversation_id}'")));
        }

        Ok(now)
    }

    /// Get the newest `limit` messages in chronological order
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT seq, id, conversation_id, role, content, created_at
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY seq DESC LIMIT ?2",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        #[allow(clippy::cast_possible_wrap)]
        let messages = stmt
            .query_map(
                rusqlite::params![conversation_id, limit as i64],
                message_from_row,
            )
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect::<Vec<_>>();

        // Reverse to get chronological order
        Ok(messages.into_iter().rev().collect())
    }

    /// Count messages in a conversation
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn message_count(&self, conversation_id: &str) -> Result<usize> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Count messages across all conversations
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn total_messages(&self) -> Result<usize> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(usize::try_from(count).unwrap_or(0))
    }
}
