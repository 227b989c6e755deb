//! Routes inbound messages to per-conversation actors.

use crate::agent::channel::{ConversationChannel, ConversationEvent, DispatchLane};
use crate::agent::dispatch::DispatchPipeline;
use crate::error::Result;
use crate::{BotDeps, ConversationId, InboundMessage};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

pub const BLACKLIST_NOTICE: &str = "You are blacklisted from using the bot!";

const INBOX_CAPACITY: usize = 64;

/// What the registry did with an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intake {
    /// Handed to the conversation's actor.
    Buffered,
    OwnMessage,
    DirectMessage,
    /// No target channel configured, or a different channel.
    NotTargetChannel,
    /// Rejection notice sent; the message never reaches a window.
    Blacklisted,
    /// Starts with the command prefix; recorded but not buffered.
    Command,
}

impl Intake {
    /// Whether a prefixed message with this intake may still run as a command.
    ///
    /// Commands work outside the target channel too, but never for the bot
    /// itself, in direct messages, or for a blacklisted author who was
    /// already sent a notice.
    pub fn allows_command(self) -> bool {
        matches!(self, Intake::Command | Intake::NotTargetChannel)
    }
}

/// Owns one [`ConversationChannel`] per conversation, spawned on first use.
pub struct ConversationRegistry {
    deps: BotDeps,
    pipeline: Arc<DispatchPipeline>,
    channels: Mutex<HashMap<ConversationId, mpsc::Sender<ConversationEvent>>>,
    /// Kept past `remove` while a dispatch still holds it.
    lanes: parking_lot::Mutex<HashMap<ConversationId, DispatchLane>>,
}

impl ConversationRegistry {
    pub fn new(deps: BotDeps) -> Self {
        let pipeline = Arc::new(DispatchPipeline::new(deps.clone()));
        Self {
            deps,
            pipeline,
            channels: Mutex::new(HashMap::new()),
            lanes: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Apply the qualifying-message filter and buffer the message if it passes.
    pub async fn handle(&self, message: InboundMessage) -> Result<Intake> {
        if self
            .deps
            .bot_user_id()
            .is_some_and(|bot_user_id| bot_user_id == message.author_id)
        {
            return Ok(Intake::OwnMessage);
        }
        let Some(conversation_id) = message.conversation_id else {
            return Ok(Intake::DirectMessage);
        };

        let settings = &self.deps.settings;
        if settings.target_channel(conversation_id).await? != Some(message.channel_id) {
            return Ok(Intake::NotTargetChannel);
        }

        let opted_in = settings
            .opt_status(conversation_id)
            .await?
            .unwrap_or(self.deps.config.defaults.opt_in);
        if opted_in
            && let Err(error) = settings
                .record_message(
                    conversation_id,
                    message.author_id,
                    message.channel_id,
                    &message.content,
                )
                .await
        {
            tracing::warn!(conversation_id, %error, "failed to record message");
        }

        if settings.is_blacklisted(message.author_id).await? {
            tracing::info!(
                conversation_id,
                author_id = message.author_id,
                "message from blacklisted user"
            );
            if let Err(error) = self
                .deps
                .messaging
                .send_text(message.channel_id, BLACKLIST_NOTICE)
                .await
            {
                tracing::warn!(conversation_id, %error, "failed to send blacklist notice");
            }
            return Ok(Intake::Blacklisted);
        }

        if message.content.starts_with(&self.deps.config.prefix) {
            return Ok(Intake::Command);
        }

        self.deliver(conversation_id, ConversationEvent::Message(message))
            .await;
        Ok(Intake::Buffered)
    }

    /// Force a dispatch cycle for a conversation.
    pub async fn retry(&self, conversation_id: ConversationId) {
        self.deliver(conversation_id, ConversationEvent::Retry).await;
    }

    /// Stop a conversation's actor. Its buffer is dropped undispatched.
    ///
    /// A dispatch already running finishes, and an actor spawned later for the
    /// same conversation waits for it.
    pub async fn remove(&self, conversation_id: ConversationId) {
        if self.channels.lock().await.remove(&conversation_id).is_some() {
            tracing::debug!(conversation_id, "conversation channel removed");
        }
        let mut lanes = self.lanes.lock();
        if lanes
            .get(&conversation_id)
            .is_some_and(|lane| lane.try_lock().is_ok())
        {
            lanes.remove(&conversation_id);
        }
    }

    /// Stop every actor.
    pub async fn shutdown(&self) {
        self.channels.lock().await.clear();
    }

    pub async fn active_conversations(&self) -> usize {
        self.channels.lock().await.len()
    }

    async fn deliver(&self, conversation_id: ConversationId, event: ConversationEvent) {
        let mut channels = self.channels.lock().await;
        let sender = channels
            .entry(conversation_id)
            .or_insert_with(|| self.spawn_channel(conversation_id));

        if let Err(mpsc::error::SendError(event)) = sender.send(event).await {
            // the actor exited; start a fresh one
            let sender = self.spawn_channel(conversation_id);
            if sender.send(event).await.is_err() {
                tracing::error!(conversation_id, "conversation channel unavailable");
            }
            channels.insert(conversation_id, sender);
        }
    }

    fn spawn_channel(&self, conversation_id: ConversationId) -> mpsc::Sender<ConversationEvent> {
        let (sender, receiver) = mpsc::channel(INBOX_CAPACITY);
        let lane = self.lanes.lock().entry(conversation_id).or_default().clone();
        let channel = ConversationChannel::new(
            conversation_id,
            self.pipeline.clone(),
            self.deps.config.debounce,
            receiver,
            lane,
        );
        tokio::spawn(channel.run());
        sender
    }
}

impl std::fmt::Debug for ConversationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationRegistry").finish_non_exhaustive()
    }
}
