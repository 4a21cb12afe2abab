//! Chat turn orchestration
//!
//! Sits between the upstream stream decoder and the transcript that the
//! presentation layer renders.

mod controller;

pub use controller::{ChatSnapshot, ConversationController, TurnError};
