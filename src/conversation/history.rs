//! Session turns and history

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The person speaking
    User,
    /// The companion
    Assistant,
}

impl Role {
    /// Storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(Error::Database(format!("unknown role: {other}"))),
        }
    }
}

/// One immutable message in a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    role: Role,
    content: String,
    sequence: u32,
    timestamp: DateTime<Utc>,
}

impl Turn {
    /// Rebuild a stored turn
    #[must_use]
    pub const fn restore(role: Role, content: String, sequence: u32, timestamp: DateTime<Utc>) -> Self {
        Self {
            role,
            content,
            sequence,
            timestamp,
        }
    }

    /// Author of the turn
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Message text
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Position in the session, starting at 0
    #[must_use]
    pub const fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Creation time
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Ordered turns of the active session
///
/// Sequence numbers are assigned here on append, so they are always
/// contiguous and strictly increasing.
#[derive(Debug, Clone, Default)]
pub struct SessionHistory {
    turns: Vec<Turn>,
}

impl SessionHistory {
    /// Create an empty history
    #[must_use]
    pub const fn new() -> Self {
        Self { turns: Vec::new() }
    }

    /// Append a turn with the next sequence number
    pub fn append(&mut self, role: Role, content: impl Into<String>) -> &Turn {
        let sequence = self.turns.last().map_or(0, |t| t.sequence + 1);
        self.turns.push(Turn {
            role,
            content: content.into(),
            sequence,
            timestamp: Utc::now(),
        });
        &self.turns[self.turns.len() - 1]
    }

    /// All turns, oldest first
    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// The last `n` turns, oldest first
    #[must_use]
    pub fn recent(&self, n: usize) -> &[Turn] {
        &self.turns[self.turns.len().saturating_sub(n)..]
    }

    /// Number of turns
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether no turns were recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Move all turns out, leaving the history empty
    pub fn take(&mut self) -> Vec<Turn> {
        std::mem::take(&mut self.turns)
    }
}
