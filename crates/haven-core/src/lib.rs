//! Haven chat engine: live response streaming reconciled against a
//! concurrently refreshed conversation cache.
//!
//! The UI-facing surface is [`controllers::ChatHandle`] (commands in,
//! published [`controllers::ChatState`] snapshots out); everything behind it
//! runs on a single owning task.

pub mod cache;
pub mod config;
pub mod controllers;
pub mod models;
pub mod services;
pub mod telemetry;

pub use cache::{KeyedCache, MemoryCache};
pub use config::EngineConfig;
pub use controllers::{ChatCommand, ChatController, ChatHandle, ChatState};
pub use models::{Conversation, Message, MessageRole, MessageStatus};
pub use services::{ConversationService, StreamEvent, StreamService, TitleGenerator};
