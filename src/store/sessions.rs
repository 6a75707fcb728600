//! Session repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use super::{DbPool, SessionRecord, SessionStore, parse_datetime};
use crate::conversation::{Role, Turn};
use crate::{Error, Result};

/// A persisted session row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub summary: String,
    pub turn_count: usize,
}

/// `SQLite`-backed session store
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: DbPool,
}

impl SqliteSessionStore {
    /// Create a new session store
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Write a session and its turns in one transaction
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn insert(&self, record: &SessionRecord) -> Result<String> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO sessions (id, started_at, ended_at, duration_minutes, summary)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                record.started_at.to_rfc3339(),
                record.ended_at.to_rfc3339(),
                record.duration_minutes(),
                record.summary(),
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO messages (session_id, sequence, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for turn in &record.turns {
                stmt.execute(params![
                    id,
                    turn.sequence(),
                    turn.role().as_str(),
                    turn.content(),
                    turn.timestamp().to_rfc3339(),
                ])?;
            }
        }

        tx.commit()?;

        tracing::debug!(session_id = %id, turns = record.turns.len(), "session saved");
        Ok(id)
    }

    /// Most recent sessions, newest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self, limit: usize) -> Result<Vec<StoredSession>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn.prepare(
            "SELECT s.id, s.started_at, s.ended_at, s.duration_minutes, s.summary,
                    (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id)
             FROM sessions s
             ORDER BY s.started_at DESC
             LIMIT ?1",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sessions = stmt
            .query_map([limit], |row| {
                Ok(StoredSession {
                    id: row.get(0)?,
                    started_at: parse_datetime(&row.get::<_, String>(1)?),
                    ended_at: parse_datetime(&row.get::<_, String>(2)?),
                    duration_minutes: row.get(3)?,
                    summary: row.get(4)?,
                    turn_count: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(sessions)
    }

    /// Turns of a stored session, in order
    ///
    /// # Errors
    ///
    /// Returns error if the session does not exist or a row is invalid
    pub fn turns(&self, session_id: &str) -> Result<Vec<Turn>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
            [session_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(Error::NotFound(format!("session {session_id}")));
        }

        let mut stmt = conn.prepare(
            "SELECT role, content, sequence, created_at
             FROM messages WHERE session_id = ?1
             ORDER BY sequence ASC",
        )?;

        let rows = stmt
            .query_map([session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(role, content, sequence, created_at)| {
                Ok(Turn::restore(
                    role.parse::<Role>()?,
                    content,
                    sequence,
                    parse_datetime(&created_at),
                ))
            })
            .collect()
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn save(&self, record: &SessionRecord) -> Result<String> {
        self.insert(record)
    }
}
