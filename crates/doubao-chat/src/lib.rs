//! doubao-chat: chat turn orchestration and protocol translation.
//!
//! Sits between the OpenAI-compatible HTTP surface and the upstream chat
//! service: rotates account credentials, signs requests through the
//! browser signer, and translates the upstream event stream into
//! OpenAI-shaped completions.

pub mod cookie;
pub mod credentials;
pub mod events;
pub mod relay;
pub mod sessions;
pub mod types;

pub use relay::{collect_turn, ChatRelay, Turn, TurnEvent, TurnStream};
