//! The ordered, role-tagged message list sent for one completion.

use crate::{InboundMessage, MessageId, UserId};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of the window, serialized as `{"role", "content"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowMessage {
    pub role: Role,
    pub content: String,
}

impl WindowMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Role for a chat message: `assistant` iff the bot wrote it.
///
/// Every human collapses into `user`; speakers are told apart only by the
/// display-name prefix the window adds to their content. Conversations with
/// three or more people therefore read as one user talking in several voices.
pub fn role_for(message: &InboundMessage, bot_user_id: UserId) -> Role {
    if message.author_id == bot_user_id {
        Role::Assistant
    } else {
        Role::User
    }
}

/// System instructions followed by the conversation, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationWindow {
    messages: Vec<WindowMessage>,
    /// Platform ids of the chat messages behind `messages[1..]`.
    source_ids: Vec<MessageId>,
}

impl ConversationWindow {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            messages: vec![WindowMessage::new(Role::System, instructions)],
            source_ids: Vec::new(),
        }
    }

    pub fn push(&mut self, source_id: MessageId, message: WindowMessage) {
        self.messages.push(message);
        self.source_ids.push(source_id);
    }

    pub fn messages(&self) -> &[WindowMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<WindowMessage> {
        self.messages
    }

    pub fn source_ids(&self) -> &[MessageId] {
        &self.source_ids
    }

    /// Number of chat turns, excluding the system entry.
    pub fn turn_count(&self) -> usize {
        self.source_ids.len()
    }

    /// Whether the window holds anything from a human to respond to.
    pub fn has_user_turn(&self) -> bool {
        self.messages.iter().any(|message| message.role == Role::User)
    }

    /// Every entry's content joined by newlines, for moderation.
    pub fn flatten(&self) -> String {
        self.messages
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
