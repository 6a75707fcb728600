//! Controller state and session events

use std::fmt;
use std::time::Duration;

use super::history::Turn;
use crate::voice::ReplySource;

/// Turn-taking phase of the active session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ControllerState {
    /// No session activity
    #[default]
    Idle,
    /// Recording the user
    Listening,
    /// Transcribing or generating
    Processing,
    /// Playing or showing the reply
    Speaking,
}

impl ControllerState {
    /// Status line shown to the user
    #[must_use]
    pub const fn status_text(self) -> &'static str {
        match self {
            Self::Idle => "Ready",
            Self::Listening => "Listening…",
            Self::Processing => "Thinking…",
            Self::Speaking => "Speaking…",
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
        };
        f.write_str(name)
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The user ended the session
    Ended,
    /// The plan's session duration elapsed
    DurationLimit,
    /// Microphone access failed
    MicUnavailable(String),
}

/// Notifications for UI collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Controller state changed
    Status {
        /// New state
        state: ControllerState,
        /// Time left before the duration limit
        remaining: Duration,
    },
    /// The opening greeting was recorded
    Greeting(Turn),
    /// A user turn was recorded
    UserTurn(Turn),
    /// An assistant turn was recorded
    Reply {
        /// The recorded turn
        turn: Turn,
        /// Model or fallback table
        source: ReplySource,
    },
    /// Time left before the duration limit, sent every second
    Remaining(Duration),
    /// Informational message
    Notice(String),
    /// Session-ending error shown to the user
    Error(String),
    /// Session finished
    Ended {
        /// Cause
        reason: EndReason,
        /// Persisted record identifier, if saved
        session_id: Option<String>,
        /// Number of turns recorded
        turns: usize,
    },
}
