//! Rebuilds the active conversation from channel history and the pending batch.

use crate::config::DispatchConfig;
use crate::conversation::window::{ConversationWindow, Role, WindowMessage, role_for};
use crate::error::Result;
use crate::messaging::MessagingDyn;
use crate::settings::SettingsStore;
use crate::{Attachment, ChannelId, InboundMessage, MessageId, UserId};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Bot-authored text that marks the start of a fresh conversation.
pub const RESET_SENTINEL: &str = "New conversation started!";

/// Attachment extensions read as text and inlined into the window.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "txt", "log", "py", "js", "json", "html", "css", "md", "csv", "tsv", "xml", "yaml", "yml",
    "ini", "cfg", "toml", "sh", "bat", "ps1", "psm1", "psd1", "ps1xml", "psc1", "pssc", "reg",
    "inf", "sql",
];

fn is_reset_sentinel(message: &InboundMessage, bot_user_id: UserId) -> bool {
    message.author_id == bot_user_id && message.content == RESET_SENTINEL
}

/// Id of the most recent reset sentinel in a newest-first history.
pub fn reset_marker(newest_first: &[InboundMessage], bot_user_id: UserId) -> Option<MessageId> {
    newest_first
        .iter()
        .find(|message| is_reset_sentinel(message, bot_user_id))
        .map(|message| message.id)
}

/// Keep the messages newer than the most recent reset sentinel.
///
/// Input and output are newest first. The sentinel itself is dropped; only a
/// bot-authored message with exactly the sentinel text counts.
pub fn trim_at_reset(newest_first: Vec<InboundMessage>, bot_user_id: UserId) -> Vec<InboundMessage> {
    newest_first
        .into_iter()
        .take_while(|message| !is_reset_sentinel(message, bot_user_id))
        .collect()
}

/// Append pending messages that history does not already contain.
///
/// `history` is chronological; pending messages keep their arrival order.
/// Pending messages posted before `reset_at` belong to the previous
/// conversation and are dropped. Message ids are time-ordered.
pub fn merge_pending(
    mut history: Vec<InboundMessage>,
    pending: &[InboundMessage],
    reset_at: Option<MessageId>,
) -> Vec<InboundMessage> {
    let mut seen: HashSet<_> = history.iter().map(|message| message.id).collect();
    for message in pending {
        if reset_at.is_some_and(|reset_id| message.id <= reset_id) {
            continue;
        }
        if seen.insert(message.id) {
            history.push(message.clone());
        }
    }
    history
}

pub fn is_supported_attachment(attachment: &Attachment) -> bool {
    attachment
        .extension()
        .is_some_and(|extension| SUPPORTED_EXTENSIONS.contains(&extension.as_str()))
}

/// First `limit` characters of `text`.
fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

/// Builds the [`ConversationWindow`] for one turn.
pub struct HistoryReconstructor {
    messaging: Arc<dyn MessagingDyn>,
    settings: Arc<dyn SettingsStore>,
    history_depth: u8,
    attachment_char_limit: usize,
}

impl HistoryReconstructor {
    pub fn new(
        messaging: Arc<dyn MessagingDyn>,
        settings: Arc<dyn SettingsStore>,
        dispatch: &DispatchConfig,
    ) -> Self {
        Self {
            messaging,
            settings,
            history_depth: dispatch.history_depth,
            attachment_char_limit: dispatch.attachment_char_limit,
        }
    }

    /// Chronological messages of the active conversation, pending batch last.
    ///
    /// A failed history fetch degrades to the pending batch alone.
    pub async fn collect(
        &self,
        channel_id: ChannelId,
        pending: &[InboundMessage],
        bot_user_id: UserId,
    ) -> Vec<InboundMessage> {
        let fetched = match self
            .messaging
            .fetch_history(channel_id, self.history_depth)
            .await
        {
            Ok(messages) => messages,
            Err(error) => {
                tracing::warn!(channel_id, %error, "history fetch failed, using pending batch only");
                Vec::new()
            }
        };

        let reset_at = reset_marker(&fetched, bot_user_id);
        let mut history = trim_at_reset(fetched, bot_user_id);
        history.reverse();
        merge_pending(history, pending, reset_at)
    }

    /// Drop messages whose author is blacklisted.
    pub async fn exclude_blacklisted(
        &self,
        messages: Vec<InboundMessage>,
    ) -> Result<Vec<InboundMessage>> {
        let mut verdicts: HashMap<UserId, bool> = HashMap::new();
        let mut kept = Vec::with_capacity(messages.len());
        for message in messages {
            let blacklisted = match verdicts.get(&message.author_id) {
                Some(verdict) => *verdict,
                None => {
                    let verdict = self.settings.is_blacklisted(message.author_id).await?;
                    verdicts.insert(message.author_id, verdict);
                    verdict
                }
            };
            if !blacklisted {
                kept.push(message);
            }
        }
        Ok(kept)
    }

    /// System instructions followed by every message, oldest first.
    pub async fn build_window(
        &self,
        instructions: &str,
        messages: &[InboundMessage],
        bot_user_id: UserId,
    ) -> ConversationWindow {
        let mut window = ConversationWindow::new(instructions);
        for message in messages {
            let role = role_for(message, bot_user_id);
            let mut content = match role {
                Role::User => format!("{}: {}", message.author_name, message.content),
                _ => message.content.clone(),
            };
            self.inline_attachments(message, &mut content).await;
            window.push(message.id, WindowMessage::new(role, content));
        }
        window
    }

    /// Fetch, trim, filter and assemble the window for a turn.
    pub async fn reconstruct(
        &self,
        channel_id: ChannelId,
        pending: &[InboundMessage],
        instructions: &str,
        bot_user_id: UserId,
    ) -> Result<ConversationWindow> {
        let messages = self.collect(channel_id, pending, bot_user_id).await;
        let messages = self.exclude_blacklisted(messages).await?;
        Ok(self.build_window(instructions, &messages, bot_user_id).await)
    }

    async fn inline_attachments(&self, message: &InboundMessage, content: &mut String) {
        for attachment in message.attachments.iter().filter(|a| is_supported_attachment(a)) {
            let bytes = match self.messaging.download_attachment(attachment).await {
                Ok(bytes) => bytes,
                Err(error) => {
                    tracing::warn!(
                        message_id = message.id,
                        filename = %attachment.filename,
                        %error,
                        "skipping attachment"
                    );
                    continue;
                }
            };
            let text = String::from_utf8_lossy(&bytes);
            let text = truncate_chars(&text, self.attachment_char_limit);
            content.push_str(&format!(
                "\n\n{}:\n```\n{}\n```",
                attachment.filename, text
            ));
        }
    }
}
