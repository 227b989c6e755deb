//! Prefix commands: conversation settings, resets, retries, export and the blacklist.

use crate::agent::ConversationRegistry;
use crate::conversation::RESET_SENTINEL;
use crate::error::Result;
use crate::settings::LoggedMessage;
use crate::{BotDeps, ChannelId, ConversationId, OutboundResponse, UserId};

use std::sync::Arc;

/// Largest export file, in bytes.
pub const EXPORT_CHUNK_BYTES: usize = 8_000_000;

const ROOT: &str = "osiris";

const HELP_TEXT: &str = "**Osiris Help**
Osiris reads the conversation in its channel and answers once things go quiet.
`osiris help`: Show this message.
`osiris retry`: Ask Osiris to answer again right away.
`osiris channel [#channel]`: Set the channel where the bot speaks.
`osiris new`: Start a new conversation.
`osiris opt get|in|out`: Show or change conversation data collection for your server.
`osiris model get|set <name>`: Show or set the model for the server.
`osiris temp get|set <0-2>`: Show or set the completion temperature for the server.
`osiris instructions get|set <text>`: Show or set Osiris' instructions in the server.
`osiris export`: Export conversation data for the server.";

const NOT_ALLOWED: &str = "You need to be a server administrator to use this command.";
const OWNER_ONLY: &str = "Only bot owners can use this command.";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    /// Target channel; None means the channel the command was sent in.
    Channel(Option<ChannelId>),
    New,
    Retry,
    Opt(OptAction),
    /// None reads the current model.
    Model(Option<String>),
    Temperature(Option<f32>),
    Instructions(Option<String>),
    Export,
    Blacklist(BlacklistAction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptAction {
    Get,
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistAction {
    Show,
    Add(UserId),
    Remove(UserId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permission {
    Anyone,
    Admin,
    Owner,
}

impl Command {
    fn permission(&self) -> Permission {
        match self {
            Command::Help | Command::New => Permission::Anyone,
            Command::Blacklist(_) => Permission::Owner,
            _ => Permission::Admin,
        }
    }
}

/// Parse a prefixed message.
///
/// Returns None when the message is not addressed to this bot, and
/// `Some(Err(usage))` when it is but the arguments are wrong.
pub fn parse(content: &str, prefix: &str) -> Option<std::result::Result<Command, String>> {
    let rest = content.strip_prefix(prefix)?;
    let mut words = rest.split_whitespace();
    let root = words.next()?;

    if root.eq_ignore_ascii_case("blacklist") {
        return Some(parse_blacklist(words.next(), words.next()));
    }
    if !root.eq_ignore_ascii_case(ROOT) {
        return None;
    }

    let Some(sub) = words.next() else {
        return Some(Ok(Command::Help));
    };
    let command = match sub.to_ascii_lowercase().as_str() {
        "help" => Ok(Command::Help),
        "new" => Ok(Command::New),
        "retry" => Ok(Command::Retry),
        "export" => Ok(Command::Export),
        "channel" => match words.next() {
            None => Ok(Command::Channel(None)),
            Some(raw) => parse_mention(raw, "<#")
                .map(|id| Command::Channel(Some(id)))
                .ok_or_else(|| "Usage: `osiris channel [#channel]`".to_string()),
        },
        "opt" => match words.next().map(str::to_ascii_lowercase).as_deref() {
            Some("get") => Ok(Command::Opt(OptAction::Get)),
            Some("in") => Ok(Command::Opt(OptAction::In)),
            Some("out") => Ok(Command::Opt(OptAction::Out)),
            _ => Err("Usage: `osiris opt get|in|out`".to_string()),
        },
        "model" => match words.next().map(str::to_ascii_lowercase).as_deref() {
            Some("get") => Ok(Command::Model(None)),
            Some("set") => match words.next() {
                Some(name) if is_valid_model_name(name) => Ok(Command::Model(Some(name.into()))),
                _ => Err("Invalid model name.".to_string()),
            },
            _ => Err("Usage: `osiris model get|set <name>`".to_string()),
        },
        "temp" => match words.next().map(str::to_ascii_lowercase).as_deref() {
            Some("get") => Ok(Command::Temperature(None)),
            Some("set") => match words.next().and_then(|raw| raw.parse::<f32>().ok()) {
                Some(value) if (0.0..=2.0).contains(&value) => {
                    Ok(Command::Temperature(Some(value)))
                }
                _ => Err("Temperature must be between 0 and 2.".to_string()),
            },
            _ => Err("Usage: `osiris temp get|set <0-2>`".to_string()),
        },
        "instructions" => match words.next().map(str::to_ascii_lowercase).as_deref() {
            Some("get") => Ok(Command::Instructions(None)),
            Some("set") => {
                let text = instructions_text(rest);
                if text.is_empty() {
                    Err("Usage: `osiris instructions set <text>`".to_string())
                } else {
                    Ok(Command::Instructions(Some(text.into())))
                }
            }
            _ => Err("Usage: `osiris instructions get|set <text>`".to_string()),
        },
        _ => Err(format!("Unknown command `{sub}`. Try `osiris help`.")),
    };
    Some(command)
}

fn parse_blacklist(
    action: Option<&str>,
    target: Option<&str>,
) -> std::result::Result<Command, String> {
    const USAGE: &str = "Action must be 'add', 'remove', or 'show'.";
    let user = target.and_then(|raw| parse_mention(raw, "<@"));
    match (action.map(str::to_ascii_lowercase).as_deref(), user) {
        (Some("show"), _) => Ok(Command::Blacklist(BlacklistAction::Show)),
        (Some("add"), Some(user)) => Ok(Command::Blacklist(BlacklistAction::Add(user))),
        (Some("remove"), Some(user)) => Ok(Command::Blacklist(BlacklistAction::Remove(user))),
        _ => Err(USAGE.to_string()),
    }
}

/// A raw id or a mention such as `<#123>`, `<@123>` or `<@!123>`.
fn parse_mention(raw: &str, open: &str) -> Option<u64> {
    let inner = match raw.strip_prefix(open) {
        Some(rest) => rest.strip_suffix('>')?.trim_start_matches('!'),
        None => raw,
    };
    inner.parse().ok()
}

/// Everything after `instructions set`, with its original spacing.
fn instructions_text(rest: &str) -> &str {
    let mut remaining = rest.trim_start();
    for _ in 0..3 {
        remaining = remaining
            .split_once(char::is_whitespace)
            .map(|(_, tail)| tail.trim_start())
            .unwrap_or("");
    }
    remaining.trim_end()
}

pub fn is_valid_model_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | ':' | '/'))
}

/// Logged messages as JSONL files of at most [`EXPORT_CHUNK_BYTES`] each.
///
/// A single line longer than the limit gets a file of its own.
pub fn export_chunks(
    messages: &[LoggedMessage],
    bot_user_id: Option<UserId>,
    chunk_bytes: usize,
) -> Vec<(String, Vec<u8>)> {
    let mut files = Vec::new();
    let mut current: Vec<u8> = Vec::new();

    for message in messages {
        let role = if Some(message.author_id) == bot_user_id {
            "assistant"
        } else {
            "user"
        };
        let line = serde_json::json!({ "role": role, "content": message.content }).to_string();
        let needed = line.len() + usize::from(!current.is_empty());

        if !current.is_empty() && current.len() + needed > chunk_bytes {
            files.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(b'\n');
        }
        current.extend_from_slice(line.as_bytes());
    }
    if !current.is_empty() {
        files.push(current);
    }

    files
        .into_iter()
        .enumerate()
        .map(|(index, data)| (format!("messages_{index}.jsonl"), data))
        .collect()
}

/// Who sent a command, and where.
#[derive(Debug, Clone, Copy)]
pub struct CommandContext {
    pub conversation_id: ConversationId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    /// Holds the administrator permission in the server.
    pub is_admin: bool,
}

/// Executes parsed commands against the settings store and the registry.
pub struct CommandRunner {
    deps: BotDeps,
    registry: Arc<ConversationRegistry>,
}

impl CommandRunner {
    pub fn new(deps: BotDeps, registry: Arc<ConversationRegistry>) -> Self {
        Self { deps, registry }
    }

    /// Replies for a prefixed message; empty when it is not a command for this bot.
    pub async fn run(&self, content: &str, context: &CommandContext) -> Result<Vec<OutboundResponse>> {
        let command = match parse(content, &self.deps.config.prefix) {
            None => return Ok(Vec::new()),
            Some(Err(usage)) => return Ok(vec![OutboundResponse::Text(usage)]),
            Some(Ok(command)) => command,
        };

        if self.deps.settings.is_blacklisted(context.author_id).await? {
            return Ok(vec![OutboundResponse::Text(
                crate::agent::registry::BLACKLIST_NOTICE.into(),
            )]);
        }

        let is_owner = self.deps.config.is_owner(context.author_id);
        let denied = match command.permission() {
            Permission::Anyone => None,
            Permission::Admin if context.is_admin || is_owner => None,
            Permission::Admin => Some(NOT_ALLOWED),
            Permission::Owner if is_owner => None,
            Permission::Owner => Some(OWNER_ONLY),
        };
        if let Some(reason) = denied {
            tracing::info!(
                conversation_id = context.conversation_id,
                author_id = context.author_id,
                ?command,
                "command refused"
            );
            return Ok(vec![OutboundResponse::Text(reason.into())]);
        }

        tracing::debug!(conversation_id = context.conversation_id, ?command, "running command");
        self.execute(command, context).await
    }

    async fn execute(
        &self,
        command: Command,
        context: &CommandContext,
    ) -> Result<Vec<OutboundResponse>> {
        let settings = &self.deps.settings;
        let conversation_id = context.conversation_id;
        let reply = |text: String| -> Result<Vec<OutboundResponse>> {
            Ok(vec![OutboundResponse::Text(text)])
        };

        match command {
            Command::Help => reply(HELP_TEXT.into()),
            Command::New => reply(RESET_SENTINEL.into()),
            Command::Retry => {
                self.registry.retry(conversation_id).await;
                Ok(Vec::new())
            }
            Command::Channel(target) => {
                let channel_id = target.unwrap_or(context.channel_id);
                settings.set_target_channel(conversation_id, channel_id).await?;
                reply(format!("Channel set to <#{channel_id}>"))
            }
            Command::Opt(OptAction::Get) => {
                let opted_in = settings
                    .opt_status(conversation_id)
                    .await?
                    .unwrap_or(self.deps.config.defaults.opt_in);
                reply(if opted_in {
                    "Your server is opted in to conversation data collection.".into()
                } else {
                    "Your server is opted out of conversation data collection.".into()
                })
            }
            Command::Opt(action) => {
                let opt_in = action == OptAction::In;
                settings.set_opt_status(conversation_id, opt_in).await?;
                reply(if opt_in {
                    "Opted in to conversation data collection.".into()
                } else {
                    "Opted out of conversation data collection.".into()
                })
            }
            Command::Model(None) => {
                let model = settings
                    .model(conversation_id)
                    .await?
                    .unwrap_or_else(|| self.deps.config.defaults.model.clone());
                reply(format!("Model is set to `{model}`"))
            }
            Command::Model(Some(model)) => {
                settings.set_model(conversation_id, &model).await?;
                reply(format!("Model set to `{model}`"))
            }
            Command::Temperature(None) => {
                let temperature = settings
                    .temperature(conversation_id)
                    .await?
                    .unwrap_or(self.deps.config.defaults.temperature);
                reply(format!("Temperature is set to {temperature}"))
            }
            Command::Temperature(Some(temperature)) => {
                settings.set_temperature(conversation_id, temperature).await?;
                reply(format!("Temperature set to {temperature}"))
            }
            Command::Instructions(None) => {
                let instructions = settings
                    .instructions(conversation_id)
                    .await?
                    .unwrap_or_else(|| self.deps.config.defaults.instructions.clone());
                reply(format!("Instructions are set to `{instructions}`"))
            }
            Command::Instructions(Some(instructions)) => {
                settings.set_instructions(conversation_id, &instructions).await?;
                reply(format!("Instructions set to `{instructions}`"))
            }
            Command::Export => self.export(conversation_id).await,
            Command::Blacklist(BlacklistAction::Show) => {
                let entries = settings.blacklist().await?;
                if entries.is_empty() {
                    return reply("There are currently no blacklisted users.".into());
                }
                let lines: Vec<String> = entries
                    .iter()
                    .map(|entry| {
                        format!(
                            "<@{}> ({}) since {}",
                            entry.user_id,
                            entry.user_id,
                            entry.created_at.format("%Y-%m-%d")
                        )
                    })
                    .collect();
                reply(format!("**Blacklisted Users**\n{}", lines.join("\n")))
            }
            Command::Blacklist(BlacklistAction::Add(user_id)) => {
                let total = settings.add_to_blacklist(user_id).await?;
                tracing::info!(user_id, total, "user blacklisted");
                reply(format!(
                    "<@{user_id}> has been added to the blacklist. There are now {total} blacklisted users."
                ))
            }
            Command::Blacklist(BlacklistAction::Remove(user_id)) => {
                let total = settings.remove_from_blacklist(user_id).await?;
                tracing::info!(user_id, total, "user removed from blacklist");
                reply(format!(
                    "<@{user_id}> has been removed from the blacklist. There are now {total} blacklisted users."
                ))
            }
        }
    }

    async fn export(&self, conversation_id: ConversationId) -> Result<Vec<OutboundResponse>> {
        let messages = self.deps.settings.messages_for(conversation_id).await?;
        if messages.is_empty() {
            return Ok(vec![OutboundResponse::Text("No messages to export.".into())]);
        }

        let chunks = export_chunks(&messages, self.deps.bot_user_id(), EXPORT_CHUNK_BYTES);
        let total = chunks.len();
        tracing::info!(conversation_id, messages = messages.len(), files = total, "exporting conversation data");

        let mut responses = Vec::with_capacity(total * 2);
        for (index, (filename, data)) in chunks.into_iter().enumerate() {
            responses.push(OutboundResponse::Text(format!(
                "Here's your conversation data, hot off the press! ({} of {total})",
                index + 1
            )));
            responses.push(OutboundResponse::File { filename, data });
        }
        Ok(responses)
    }
}

impl std::fmt::Debug for CommandRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRunner").finish_non_exhaustive()
    }
}
