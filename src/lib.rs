//! Haven - Voice-driven conversational companion
//!
//! This library provides the turn-taking speech engine behind Haven:
//! - Voice capture with silence detection
//! - Speech recognition, reply generation and speech synthesis adapters
//! - The turn controller that sequences one spoken conversation
//! - Session persistence and plan usage limits
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Turn Controller                    │
//! │  Idle → Listening → Processing → Speaking → …        │
//! └──────┬───────────┬────────────┬────────────┬────────┘
//!        │           │            │            │
//! ┌──────▼───┐ ┌─────▼─────┐ ┌────▼─────┐ ┌────▼──────┐
//! │ Capture  │ │    STT    │ │   LLM    │ │ TTS/Play  │
//! │ (cpal)   │ │ (Google/  │ │ (Gemini) │ │ (Google/  │
//! │          │ │  Whisper) │ │          │ │  OpenAI)  │
//! └──────────┘ └───────────┘ └──────────┘ └───────────┘
//!                         │
//! ┌───────────────────────▼─────────────────────────────┐
//! │          Store (sessions, subscription)              │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod conversation;
pub mod error;
pub mod store;
pub mod voice;

pub use config::Config;
pub use conversation::{
    ControllerState, EndReason, SessionEvent, SessionHandle, SessionOutcome, TurnController,
};
pub use error::{Error, Result};
pub use store::{DbConn, DbPool, PlanTier, SqliteLimits, SqliteSessionStore};
