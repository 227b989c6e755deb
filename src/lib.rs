//! Osiris: a chat-relay bot that batches channel activity and forwards the
//! reconstructed conversation to a completion API.

pub mod agent;
pub mod commands;
pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod logging;
pub mod messaging;
pub mod settings;

pub use error::{Error, Result};

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Conversation identifier (the Discord guild id).
pub type ConversationId = u64;

/// Platform channel identifier.
pub type ChannelId = u64;

/// Platform user identifier.
pub type UserId = u64;

/// Platform message identifier.
pub type MessageId = u64;

/// A chat message, either freshly delivered or fetched from channel history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: MessageId,
    /// None for direct messages.
    pub conversation_id: Option<ConversationId>,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    /// Server nickname, falling back to the global display name.
    pub author_name: String,
    pub author_is_bot: bool,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// File attachment metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
    pub size_bytes: Option<u64>,
}

impl Attachment {
    /// Lowercased extension after the last dot, if any.
    pub fn extension(&self) -> Option<String> {
        self.filename
            .rsplit_once('.')
            .map(|(_, extension)| extension.to_ascii_lowercase())
    }
}

/// Outbound payload for a conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundResponse {
    Text(String),
    File { filename: String, data: Vec<u8> },
}

/// The bot's own account, known once the gateway reports ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    pub user_id: UserId,
}

/// Shared dependency bundle for the conversation actors and dispatch pipeline.
#[derive(Clone)]
pub struct BotDeps {
    pub config: Arc<config::Config>,
    pub settings: Arc<dyn settings::SettingsStore>,
    pub completions: Arc<dyn llm::CompletionApi>,
    pub messaging: Arc<dyn messaging::MessagingDyn>,
    pub identity: Arc<ArcSwapOption<BotIdentity>>,
}

impl BotDeps {
    /// The bot's user id, or None before the gateway is ready.
    pub fn bot_user_id(&self) -> Option<UserId> {
        self.identity.load().as_ref().map(|identity| identity.user_id)
    }
}

impl std::fmt::Debug for BotDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotDeps")
            .field("bot_user_id", &self.bot_user_id())
            .finish_non_exhaustive()
    }
}
