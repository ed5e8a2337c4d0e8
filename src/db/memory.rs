//! Memory repository for long-term notes about a user

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{DbPool, parse_datetime, timestamp};
use crate::{Error, Result};

/// A long-term note one persona keeps about one user
#[derive(Debug, Clone)]
pub struct Memory {
    pub id: String,
    pub user_id: String,
    pub persona_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Memory repository
#[derive(Clone)]
pub struct MemoryRepo {
    pool: DbPool,
}

impl MemoryRepo {
    /// Create a new memory repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Store a memory
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn add(&self, user_id: &str, persona_id: &str, content: &str) -> Result<Memory> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO memories (id, user_id, persona_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            [id.as_str(), user_id, persona_id, content, timestamp(now).as_str()],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Memory {
            id,
            user_id: user_id.to_string(),
            persona_id: persona_id.to_string(),
            content: content.to_string(),
            created_at: now,
        })
    }

    /// List memories for a user and persona, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self, user_id: &str, persona_id: &str) -> Result<Vec<Memory>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, persona_id, content, created_at
                 FROM memories WHERE user_id = ?1 AND persona_id = ?2
                 ORDER BY created_at ASC, rowid ASC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let memories = stmt
            .query_map([user_id, persona_id], |row| {
                Ok(Memory {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    persona_id: row.get(2)?,
                    content: row.get(3)?,
                    created_at: parse_datetime(&row.get::<_, String>(4)?),
                })
            })
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(memories)
    }

    /// Delete a memory
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no memory has this id
    pub fn delete(&self, id: &str) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let deleted = conn
            .execute("DELETE FROM memories WHERE id = ?1", [id])
            .map_err(|e| Error::Database(e.to_string()))?;

        if deleted == 0 {
            return Err(Error::NotFound(format!("memory '{id}'")));
        }
        Ok(())
    }
}
