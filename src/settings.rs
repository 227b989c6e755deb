//! Per-conversation settings, user blacklist and the message log.

pub mod store;

pub use store::SqliteSettingsStore;

use crate::config::ConversationDefaults;
use crate::error::Result;
use crate::{ChannelId, ConversationId, UserId};

/// Read/write contract the bot depends on.
///
/// Every getter returns `None` when the conversation never set the value;
/// callers resolve fallbacks through [`resolve`].
#[async_trait::async_trait]
pub trait SettingsStore: Send + Sync + 'static {
    async fn target_channel(&self, conversation_id: ConversationId) -> Result<Option<ChannelId>>;
    async fn model(&self, conversation_id: ConversationId) -> Result<Option<String>>;
    async fn temperature(&self, conversation_id: ConversationId) -> Result<Option<f32>>;
    async fn instructions(&self, conversation_id: ConversationId) -> Result<Option<String>>;
    async fn opt_status(&self, conversation_id: ConversationId) -> Result<Option<bool>>;
    async fn is_blacklisted(&self, user_id: UserId) -> Result<bool>;

    /// Append a message to the data-collection log.
    async fn record_message(
        &self,
        conversation_id: ConversationId,
        author_id: UserId,
        channel_id: ChannelId,
        content: &str,
    ) -> Result<()>;

    async fn set_target_channel(
        &self,
        conversation_id: ConversationId,
        channel_id: ChannelId,
    ) -> Result<()>;
    async fn set_model(&self, conversation_id: ConversationId, model: &str) -> Result<()>;
    async fn set_temperature(&self, conversation_id: ConversationId, temperature: f32)
    -> Result<()>;
    async fn set_instructions(&self, conversation_id: ConversationId, instructions: &str)
    -> Result<()>;
    async fn set_opt_status(&self, conversation_id: ConversationId, opt_in: bool) -> Result<()>;

    /// Returns the blacklist size after the insert.
    async fn add_to_blacklist(&self, user_id: UserId) -> Result<usize>;
    /// Returns the blacklist size after the removal.
    async fn remove_from_blacklist(&self, user_id: UserId) -> Result<usize>;
    async fn blacklist(&self) -> Result<Vec<BlacklistEntry>>;

    /// Logged messages for a conversation, oldest first.
    async fn messages_for(&self, conversation_id: ConversationId) -> Result<Vec<LoggedMessage>>;

    /// Forget everything stored for a conversation.
    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlacklistEntry {
    pub user_id: UserId,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggedMessage {
    pub author_id: UserId,
    pub channel_id: ChannelId,
    pub content: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Settings for one turn, with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSettings {
    pub model: String,
    pub temperature: f32,
    pub instructions: String,
}

/// Read the completion settings for a conversation, falling back to defaults.
pub async fn resolve(
    store: &dyn SettingsStore,
    defaults: &ConversationDefaults,
    conversation_id: ConversationId,
) -> Result<ResolvedSettings> {
    let model = store
        .model(conversation_id)
        .await?
        .filter(|model| !model.trim().is_empty())
        .unwrap_or_else(|| defaults.model.clone());
    let temperature = store
        .temperature(conversation_id)
        .await?
        .unwrap_or(defaults.temperature);
    let instructions = store
        .instructions(conversation_id)
        .await?
        .unwrap_or_else(|| defaults.instructions.clone());

    Ok(ResolvedSettings {
        model,
        temperature,
        instructions,
    })
}
