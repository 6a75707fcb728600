//! Conversation session: turns, controller state and the turn-taking loop

pub mod controller;
pub mod history;
pub mod state;

pub use controller::{
    Collaborators, MIC_REQUIRED_MESSAGE, SessionHandle, SessionOutcome, TurnController,
};
pub use history::{Role, SessionHistory, Turn};
pub use state::{ControllerState, EndReason, SessionEvent};
