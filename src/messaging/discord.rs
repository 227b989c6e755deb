//! Discord adapter (serenity): outbound calls and gateway event handling.

use crate::agent::{ConversationRegistry, Intake};
use crate::commands::{CommandContext, CommandRunner};
use crate::error::{MessagingError, Result};
use crate::llm::LlmManager;
use crate::messaging::traits::Messaging;
use crate::{
    Attachment, BotDeps, BotIdentity, ChannelId, ConversationId, InboundMessage,
    OutboundResponse,
};

use serenity::all::{
    ChannelType, ConnectionStage, Context, CreateAttachment, CreateMessage, EventHandler,
    GetMessages, Guild, Http, Message, Ready, ResumedEvent, ShardStageUpdateEvent,
    UnavailableGuild,
};
use std::sync::Arc;

const WELCOME_MESSAGE: &str = "**Welcome to Osiris!**\nTo get started, use the `osiris channel` \
     command in the channel you want Osiris to speak in.";

/// Outbound half of the Discord integration, shared with the conversation actors.
pub struct DiscordAdapter {
    http: Arc<Http>,
    downloads: reqwest::Client,
}

impl DiscordAdapter {
    pub fn new(token: &str) -> Self {
        Self {
            http: Arc::new(Http::new(token)),
            downloads: reqwest::Client::new(),
        }
    }
}

impl std::fmt::Debug for DiscordAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordAdapter").finish_non_exhaustive()
    }
}

fn send_failed(channel_id: ChannelId, error: impl std::fmt::Display) -> MessagingError {
    MessagingError::SendFailed {
        channel_id,
        message: error.to_string(),
    }
}

impl Messaging for DiscordAdapter {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send_text(&self, channel_id: ChannelId, text: &str) -> Result<()> {
        serenity::all::ChannelId::new(channel_id)
            .say(&*self.http, text)
            .await
            .map_err(|error| send_failed(channel_id, error))?;
        Ok(())
    }

    async fn send_file(&self, channel_id: ChannelId, data: Vec<u8>, filename: &str) -> Result<()> {
        let message = CreateMessage::new().add_file(CreateAttachment::bytes(data, filename));
        serenity::all::ChannelId::new(channel_id)
            .send_message(&*self.http, message)
            .await
            .map_err(|error| send_failed(channel_id, error))?;
        Ok(())
    }

    async fn set_display_status(&self, conversation_id: ConversationId, status: &str) -> Result<()> {
        serenity::all::GuildId::new(conversation_id)
            .edit_nickname(&*self.http, Some(status))
            .await
            .map_err(|error| MessagingError::StatusFailed(error.to_string()))?;
        Ok(())
    }

    async fn fetch_history(&self, channel_id: ChannelId, limit: u8) -> Result<Vec<InboundMessage>> {
        let messages = serenity::all::ChannelId::new(channel_id)
            .messages(&*self.http, GetMessages::new().limit(limit))
            .await
            .map_err(|error| MessagingError::HistoryFailed {
                channel_id,
                message: error.to_string(),
            })?;
        Ok(messages.iter().map(to_inbound).collect())
    }

    async fn download_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>> {
        let failed = |message: String| MessagingError::AttachmentFailed {
            filename: attachment.filename.clone(),
            message,
        };
        let response = self
            .downloads
            .get(&attachment.url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|error| failed(error.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|error| failed(error.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn send_typing(&self, channel_id: ChannelId) -> Result<()> {
        serenity::all::ChannelId::new(channel_id)
            .broadcast_typing(&*self.http)
            .await
            .map_err(|error| send_failed(channel_id, error))?;
        Ok(())
    }
}

/// A text channel the welcome notice could go to.
#[derive(Debug, Clone, Copy)]
struct WelcomeCandidate {
    id: ChannelId,
    position: u16,
    can_send: bool,
}

/// The system channel, else the top-most text channel the bot may post in.
fn welcome_channel(
    system_channel: Option<ChannelId>,
    candidates: impl IntoIterator<Item = WelcomeCandidate>,
) -> Option<ChannelId> {
    system_channel.or_else(|| {
        candidates
            .into_iter()
            .filter(|candidate| candidate.can_send)
            .min_by_key(|candidate| (candidate.position, candidate.id))
            .map(|candidate| candidate.id)
    })
}

/// Convert a serenity message into the platform-neutral shape.
pub fn to_inbound(message: &Message) -> InboundMessage {
    let author_name = message
        .member
        .as_ref()
        .and_then(|member| member.nick.clone())
        .or_else(|| message.author.global_name.clone())
        .unwrap_or_else(|| message.author.name.clone());
    let timestamp = chrono::DateTime::from_timestamp(message.timestamp.unix_timestamp(), 0)
        .unwrap_or_else(chrono::Utc::now);

    InboundMessage {
        id: message.id.get(),
        conversation_id: message.guild_id.map(|guild_id| guild_id.get()),
        channel_id: message.channel_id.get(),
        author_id: message.author.id.get(),
        author_name,
        author_is_bot: message.author.bot,
        content: message.content.clone(),
        attachments: message
            .attachments
            .iter()
            .map(|attachment| Attachment {
                filename: attachment.filename.clone(),
                url: attachment.url.clone(),
                size_bytes: Some(u64::from(attachment.size)),
            })
            .collect(),
        timestamp,
    }
}

/// Gateway event handler.
pub struct DiscordHandler {
    deps: BotDeps,
    registry: Arc<ConversationRegistry>,
    commands: CommandRunner,
    llm: Arc<LlmManager>,
}

impl DiscordHandler {
    pub fn new(deps: BotDeps, registry: Arc<ConversationRegistry>, llm: Arc<LlmManager>) -> Self {
        let commands = CommandRunner::new(deps.clone(), registry.clone());
        Self {
            deps,
            registry,
            commands,
            llm,
        }
    }

    async fn handle_command(&self, ctx: &Context, message: &Message, conversation_id: ConversationId) {
        let author_id = message.author.id.get();
        let is_admin = match message.member(ctx).await {
            Ok(member) => ctx
                .cache
                .guild(serenity::all::GuildId::new(conversation_id))
                .map(|guild| guild.member_permissions(&member).administrator())
                .unwrap_or(false),
            Err(error) => {
                tracing::debug!(author_id, %error, "could not resolve member permissions");
                false
            }
        };
        let context = CommandContext {
            conversation_id,
            channel_id: message.channel_id.get(),
            author_id,
            is_admin,
        };

        let replies = match self.commands.run(&message.content, &context).await {
            Ok(replies) => replies,
            Err(error) => {
                tracing::error!(conversation_id, %error, "command failed");
                vec![OutboundResponse::Text(
                    "Something went wrong while running that command.".into(),
                )]
            }
        };
        for reply in replies {
            if let Err(error) = self.deps.messaging.send(context.channel_id, reply).await {
                tracing::warn!(conversation_id, %error, "failed to send command reply");
            }
        }
    }
}

#[serenity::async_trait]
impl EventHandler for DiscordHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        self.deps.identity.store(Some(Arc::new(BotIdentity {
            user_id: ready.user.id.get(),
        })));
        self.llm.renew_session();
        tracing::info!(
            bot = %ready.user.name,
            guilds = ready.guilds.len(),
            "connected to discord"
        );
    }

    async fn resume(&self, _ctx: Context, _event: ResumedEvent) {
        tracing::info!("gateway session resumed");
        self.llm.renew_session();
    }

    async fn shard_stage_update(&self, _ctx: Context, event: ShardStageUpdateEvent) {
        if event.new == ConnectionStage::Disconnected {
            tracing::warn!(shard = %event.shard_id, "gateway disconnected");
            self.llm.close_session();
        }
    }

    async fn message(&self, ctx: Context, message: Message) {
        let inbound = to_inbound(&message);
        let conversation_id = inbound.conversation_id;
        let from_bot = inbound.author_is_bot;
        let is_command = inbound.content.starts_with(&self.deps.config.prefix);

        // the registry records the message before commands see it
        let allows_command = match self.registry.handle(inbound).await {
            Ok(Intake::Buffered) => false,
            Ok(intake) => {
                tracing::trace!(message_id = message.id.get(), ?intake, "message not buffered");
                intake.allows_command()
            }
            Err(error) => {
                tracing::error!(message_id = message.id.get(), %error, "failed to handle message");
                true
            }
        };

        if let Some(conversation_id) = conversation_id
            && is_command
            && allows_command
            && !from_bot
        {
            self.handle_command(&ctx, &message, conversation_id).await;
        }
    }

    async fn guild_create(&self, ctx: Context, guild: Guild, is_new: Option<bool>) {
        if is_new != Some(true) {
            return;
        }
        tracing::info!(guild_id = guild.id.get(), name = %guild.name, "joined guild");

        let bot_user_id = ctx.cache.current_user().id;
        let bot_member = guild.members.get(&bot_user_id);
        let candidates = guild
            .channels
            .values()
            .filter(|channel| channel.kind == ChannelType::Text)
            .map(|channel| WelcomeCandidate {
                id: channel.id.get(),
                position: channel.position,
                can_send: bot_member.is_some_and(|member| {
                    guild.user_permissions_in(channel, member).send_messages()
                }),
            });
        let Some(channel_id) =
            welcome_channel(guild.system_channel_id.map(|id| id.get()), candidates)
        else {
            tracing::info!(guild_id = guild.id.get(), "no channel to post the welcome notice in");
            return;
        };
        if let Err(error) = serenity::all::ChannelId::new(channel_id)
            .say(&ctx.http, WELCOME_MESSAGE)
            .await
        {
            tracing::warn!(guild_id = guild.id.get(), %error, "failed to send welcome message");
        }
    }

    async fn guild_delete(&self, _ctx: Context, incomplete: UnavailableGuild, _full: Option<Guild>) {
        if incomplete.unavailable {
            return;
        }
        let conversation_id = incomplete.id.get();
        tracing::info!(guild_id = conversation_id, "left guild");
        self.registry.remove(conversation_id).await;
        if let Err(error) = self.deps.settings.delete_conversation(conversation_id).await {
            tracing::error!(guild_id = conversation_id, %error, "failed to delete guild data");
        }
    }
}
