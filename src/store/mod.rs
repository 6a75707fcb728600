//! Session persistence and subscription limits
//!
//! The controller talks to these collaborators through [`SessionStore`] and
//! [`LimitsProvider`]; the `SQLite` implementations here back the CLI.

pub mod limits;
mod schema;
pub mod sessions;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::conversation::{Role, Turn};
use crate::{Error, Result};

pub use limits::SqliteLimits;
pub use schema::SCHEMA_VERSION;
pub use sessions::{SqliteSessionStore, StoredSession};

/// Summary shown for sessions without an assistant reply
const BRIEF_SESSION_SUMMARY: &str = "Brief session";

/// Characters kept from the last reply in a summary
const SUMMARY_CHARS: usize = 80;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Pooled database connection
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Initialize the database
///
/// # Errors
///
/// Returns error if database cannot be opened or initialized
pub fn init<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(path);
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
    let manager = SqliteConnectionManager::memory();
    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    schema::init(&conn)?;

    Ok(pool)
}

/// A finished session handed to persistence
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Session start
    pub started_at: DateTime<Utc>,
    /// Session end
    pub ended_at: DateTime<Utc>,
    /// Ordered turns
    pub turns: Vec<Turn>,
}

impl SessionRecord {
    /// Length rounded to the nearest minute
    #[must_use]
    pub fn duration_minutes(&self) -> i64 {
        let ms = (self.ended_at - self.started_at).num_milliseconds().max(0);
        (ms + 30_000) / 60_000
    }

    /// Opening of the last assistant reply
    #[must_use]
    pub fn summary(&self) -> String {
        let Some(last) = self.turns.iter().rev().find(|t| t.role() == Role::Assistant) else {
            return BRIEF_SESSION_SUMMARY.to_string();
        };

        let content = last.content();
        match content.char_indices().nth(SUMMARY_CHARS) {
            Some((idx, _)) => format!("{}…", &content[..idx]),
            None => content.to_string(),
        }
    }
}

/// Persistence collaborator
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Save a finished session and return its identifier
    ///
    /// # Errors
    ///
    /// Returns error if the record cannot be written
    async fn save(&self, record: &SessionRecord) -> Result<String>;
}

/// Subscription plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    /// 3 sessions a month, 10 minutes each
    #[default]
    Free,
    /// 8 sessions a month, 20 minutes each
    Plus,
    /// 20 sessions a month, 30 minutes each
    Pro,
}

impl PlanTier {
    /// Sessions allowed per month
    #[must_use]
    pub const fn sessions_limit(self) -> u32 {
        match self {
            Self::Free => 3,
            Self::Plus => 8,
            Self::Pro => 20,
        }
    }

    /// Maximum length of one session
    #[must_use]
    pub const fn session_duration(self) -> Duration {
        let minutes = match self {
            Self::Free => 10,
            Self::Plus => 20,
            Self::Pro => 30,
        };
        Duration::from_secs(minutes * 60)
    }

    /// Storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Plus => "plus",
            Self::Pro => "pro",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "plus" => Ok(Self::Plus),
            "pro" => Ok(Self::Pro),
            other => Err(Error::Config(format!("unknown plan tier: {other}"))),
        }
    }
}

/// Usage gate read at session start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionLimits {
    /// Active plan
    pub tier: PlanTier,
    /// Sessions allowed this period
    pub sessions_limit: u32,
    /// Sessions already used this period
    pub sessions_used: u32,
    /// Maximum length of one session
    pub session_duration_limit: Duration,
}

impl SubscriptionLimits {
    /// Limits of `tier` with `sessions_used` already consumed
    #[must_use]
    pub const fn for_tier(tier: PlanTier, sessions_used: u32) -> Self {
        Self {
            tier,
            sessions_limit: tier.sessions_limit(),
            sessions_used,
            session_duration_limit: tier.session_duration(),
        }
    }

    /// Whether no sessions remain
    #[must_use]
    pub const fn exhausted(&self) -> bool {
        self.sessions_used >= self.sessions_limit
    }

    /// Sessions left this period
    #[must_use]
    pub const fn sessions_remaining(&self) -> u32 {
        self.sessions_limit.saturating_sub(self.sessions_used)
    }

    /// Message shown when a session is refused
    #[must_use]
    pub fn blocking_message(&self) -> String {
        format!(
            "You've reached your monthly limit of {} sessions. Please upgrade your plan for more sessions.",
            self.sessions_limit
        )
    }
}

/// Subscription-limits collaborator
#[async_trait]
pub trait LimitsProvider: Send + Sync {
    /// Current limits
    ///
    /// # Errors
    ///
    /// Returns error if limits cannot be read
    async fn limits(&self) -> Result<SubscriptionLimits>;

    /// Count one completed session against the limit
    ///
    /// # Errors
    ///
    /// Returns error if usage cannot be updated
    async fn record_session(&self) -> Result<()>;
}

/// Parse an RFC 3339 timestamp, falling back to now
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
