//! In-memory fakes for the platform, completion API and settings store.

use crate::config::Config;
use crate::error::{LlmError, MessagingError, Result};
use crate::llm::{CompletionApi, CompletionRequest, CompletionResult, TokenUsage};
use crate::messaging::Messaging;
use crate::settings::{BlacklistEntry, LoggedMessage, SettingsStore};
use crate::{
    Attachment, BotDeps, BotIdentity, ChannelId, ConversationId, InboundMessage, MessageId,
    OutboundResponse, UserId,
};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub const BOT_ID: UserId = 999;
pub const GUILD: ConversationId = 10;
pub const CHANNEL: ChannelId = 555;

/// A human-authored message in the test guild's target channel.
pub fn message(id: MessageId, author_id: UserId, author_name: &str, content: &str) -> InboundMessage {
    InboundMessage {
        id,
        conversation_id: Some(GUILD),
        channel_id: CHANNEL,
        author_id,
        author_name: author_name.into(),
        author_is_bot: false,
        content: content.into(),
        attachments: Vec::new(),
        timestamp: chrono::Utc::now(),
    }
}

/// A message written by the bot itself.
pub fn bot_message(id: MessageId, content: &str) -> InboundMessage {
    InboundMessage {
        author_is_bot: true,
        ..message(id, BOT_ID, "Osiris", content)
    }
}

/// Records everything sent to the platform and serves canned history.
#[derive(Default)]
pub struct FakePlatform {
    /// Newest first, as the platform returns it.
    history: Mutex<Vec<InboundMessage>>,
    attachments: Mutex<HashMap<String, Vec<u8>>>,
    sent: Mutex<Vec<(ChannelId, OutboundResponse)>>,
    statuses: Mutex<Vec<(ConversationId, String)>>,
    typing: AtomicUsize,
    history_fetches: AtomicUsize,
    fail_status: AtomicBool,
    fail_send: AtomicBool,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_history_newest_first(&self, messages: Vec<InboundMessage>) {
        *self.history.lock() = messages;
    }

    /// Post a message as if it landed in the channel.
    pub fn post(&self, message: InboundMessage) {
        self.history.lock().insert(0, message);
    }

    pub fn add_attachment(&self, url: &str, data: &[u8]) {
        self.attachments.lock().insert(url.into(), data.to_vec());
    }

    pub fn sent(&self) -> Vec<(ChannelId, OutboundResponse)> {
        self.sent.lock().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|(_, response)| match response {
                OutboundResponse::Text(text) => Some(text.clone()),
                OutboundResponse::File { .. } => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<(ConversationId, String)> {
        self.statuses.lock().clone()
    }

    pub fn typing_count(&self) -> usize {
        self.typing.load(Ordering::SeqCst)
    }

    pub fn history_fetches(&self) -> usize {
        self.history_fetches.load(Ordering::SeqCst)
    }

    pub fn fail_status_updates(&self) {
        self.fail_status.store(true, Ordering::SeqCst);
    }

    pub fn fail_sends(&self) {
        self.fail_send.store(true, Ordering::SeqCst);
    }

    fn record(&self, channel_id: ChannelId, response: OutboundResponse) -> Result<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(MessagingError::SendFailed {
                channel_id,
                message: "forced failure".into(),
            }
            .into());
        }
        self.sent.lock().push((channel_id, response));
        Ok(())
    }
}

impl Messaging for FakePlatform {
    fn name(&self) -> &str {
        "fake"
    }

    async fn send_text(&self, channel_id: ChannelId, text: &str) -> Result<()> {
        self.record(channel_id, OutboundResponse::Text(text.into()))
    }

    async fn send_file(&self, channel_id: ChannelId, data: Vec<u8>, filename: &str) -> Result<()> {
        self.record(
            channel_id,
            OutboundResponse::File {
                filename: filename.into(),
                data,
            },
        )
    }

    async fn set_display_status(&self, conversation_id: ConversationId, status: &str) -> Result<()> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(MessagingError::StatusFailed("forced failure".into()).into());
        }
        self.statuses.lock().push((conversation_id, status.into()));
        Ok(())
    }

    async fn fetch_history(&self, _channel_id: ChannelId, limit: u8) -> Result<Vec<InboundMessage>> {
        self.history_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .history
            .lock()
            .iter()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn download_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>> {
        self.attachments
            .lock()
            .get(&attachment.url)
            .cloned()
            .ok_or_else(|| {
                MessagingError::AttachmentFailed {
                    filename: attachment.filename.clone(),
                    message: "not found".into(),
                }
                .into()
            })
    }

    async fn send_typing(&self, _channel_id: ChannelId) -> Result<()> {
        self.typing.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Scripted completion API that counts calls.
pub struct FakeCompletions {
    moderation: Mutex<VecDeque<std::result::Result<bool, LlmError>>>,
    completions: Mutex<VecDeque<std::result::Result<CompletionResult, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    moderation_inputs: Mutex<Vec<String>>,
    moderate_calls: AtomicUsize,
    complete_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    always_fail: AtomicBool,
    delay: Mutex<Duration>,
    reply: Mutex<String>,
}

impl Default for FakeCompletions {
    fn default() -> Self {
        Self {
            moderation: Mutex::new(VecDeque::new()),
            completions: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            moderation_inputs: Mutex::new(Vec::new()),
            moderate_calls: AtomicUsize::new(0),
            complete_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            always_fail: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            reply: Mutex::new("ok".into()),
        }
    }
}

impl FakeCompletions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_moderation(&self, result: std::result::Result<bool, LlmError>) {
        self.moderation.lock().push_back(result);
    }

    pub fn push_completion(&self, result: std::result::Result<CompletionResult, LlmError>) {
        self.completions.lock().push_back(result);
    }

    /// Every completion attempt fails at the transport level.
    pub fn fail_every_completion(&self) {
        self.always_fail.store(true, Ordering::SeqCst);
    }

    /// How long each completion call takes.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn set_reply(&self, reply: &str) {
        *self.reply.lock() = reply.into();
    }

    pub fn moderate_calls(&self) -> usize {
        self.moderate_calls.load(Ordering::SeqCst)
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    pub fn moderation_inputs(&self) -> Vec<String> {
        self.moderation_inputs.lock().clone()
    }
}

pub fn completion(text: &str, total_tokens: u64) -> CompletionResult {
    CompletionResult {
        text: text.into(),
        usage: TokenUsage {
            prompt_tokens: total_tokens / 2,
            completion_tokens: total_tokens - total_tokens / 2,
            total_tokens,
        },
    }
}

pub fn transport_error() -> LlmError {
    LlmError::Transport {
        endpoint: "chat/completions".into(),
        message: "connection reset by peer".into(),
    }
}

#[async_trait::async_trait]
impl CompletionApi for FakeCompletions {
    async fn moderate(&self, input: &str) -> std::result::Result<bool, LlmError> {
        self.moderate_calls.fetch_add(1, Ordering::SeqCst);
        self.moderation_inputs.lock().push(input.into());
        self.moderation.lock().pop_front().unwrap_or(Ok(false))
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<CompletionResult, LlmError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(transport_error());
        }
        let scripted = self.completions.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(completion(&self.reply.lock(), 4096)))
    }
}

/// Settings held in memory, for tests that run on paused time.
#[derive(Default)]
pub struct MemorySettings {
    target_channels: Mutex<HashMap<ConversationId, ChannelId>>,
    models: Mutex<HashMap<ConversationId, String>>,
    temperatures: Mutex<HashMap<ConversationId, f32>>,
    instructions: Mutex<HashMap<ConversationId, String>>,
    opt_statuses: Mutex<HashMap<ConversationId, bool>>,
    blacklist: Mutex<Vec<BlacklistEntry>>,
    messages: Mutex<Vec<(ConversationId, LoggedMessage)>>,
}

impl MemorySettings {
    pub fn logged_contents(&self, conversation_id: ConversationId) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|(id, _)| *id == conversation_id)
            .map(|(_, message)| message.content.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl SettingsStore for MemorySettings {
    async fn target_channel(&self, conversation_id: ConversationId) -> Result<Option<ChannelId>> {
        Ok(self.target_channels.lock().get(&conversation_id).copied())
    }

    async fn model(&self, conversation_id: ConversationId) -> Result<Option<String>> {
        Ok(self.models.lock().get(&conversation_id).cloned())
    }

    async fn temperature(&self, conversation_id: ConversationId) -> Result<Option<f32>> {
        Ok(self.temperatures.lock().get(&conversation_id).copied())
    }

    async fn instructions(&self, conversation_id: ConversationId) -> Result<Option<String>> {
        Ok(self.instructions.lock().get(&conversation_id).cloned())
    }

    async fn opt_status(&self, conversation_id: ConversationId) -> Result<Option<bool>> {
        Ok(self.opt_statuses.lock().get(&conversation_id).copied())
    }

    async fn is_blacklisted(&self, user_id: UserId) -> Result<bool> {
        Ok(self.blacklist.lock().iter().any(|entry| entry.user_id == user_id))
    }

    async fn record_message(
        &self,
        conversation_id: ConversationId,
        author_id: UserId,
        channel_id: ChannelId,
        content: &str,
    ) -> Result<()> {
        self.messages.lock().push((
            conversation_id,
            LoggedMessage {
                author_id,
                channel_id,
                content: content.into(),
                created_at: chrono::Utc::now(),
            },
        ));
        Ok(())
    }

    async fn set_target_channel(
        &self,
        conversation_id: ConversationId,
        channel_id: ChannelId,
    ) -> Result<()> {
        self.target_channels.lock().insert(conversation_id, channel_id);
        Ok(())
    }

    async fn set_model(&self, conversation_id: ConversationId, model: &str) -> Result<()> {
        self.models.lock().insert(conversation_id, model.into());
        Ok(())
    }

    async fn set_temperature(&self, conversation_id: ConversationId, temperature: f32) -> Result<()> {
        self.temperatures.lock().insert(conversation_id, temperature);
        Ok(())
    }

    async fn set_instructions(&self, conversation_id: ConversationId, instructions: &str) -> Result<()> {
        self.instructions.lock().insert(conversation_id, instructions.into());
        Ok(())
    }

    async fn set_opt_status(&self, conversation_id: ConversationId, opt_in: bool) -> Result<()> {
        self.opt_statuses.lock().insert(conversation_id, opt_in);
        Ok(())
    }

    async fn add_to_blacklist(&self, user_id: UserId) -> Result<usize> {
        let mut blacklist = self.blacklist.lock();
        if !blacklist.iter().any(|entry| entry.user_id == user_id) {
            blacklist.push(BlacklistEntry {
                user_id,
                created_at: chrono::Utc::now(),
            });
        }
        Ok(blacklist.len())
    }

    async fn remove_from_blacklist(&self, user_id: UserId) -> Result<usize> {
        let mut blacklist = self.blacklist.lock();
        blacklist.retain(|entry| entry.user_id != user_id);
        Ok(blacklist.len())
    }

    async fn blacklist(&self) -> Result<Vec<BlacklistEntry>> {
        Ok(self.blacklist.lock().clone())
    }

    async fn messages_for(&self, conversation_id: ConversationId) -> Result<Vec<LoggedMessage>> {
        Ok(self
            .messages
            .lock()
            .iter()
            .filter(|(id, _)| *id == conversation_id)
            .map(|(_, message)| message.clone())
            .collect())
    }

    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        self.target_channels.lock().remove(&conversation_id);
        self.models.lock().remove(&conversation_id);
        self.temperatures.lock().remove(&conversation_id);
        self.instructions.lock().remove(&conversation_id);
        self.opt_statuses.lock().remove(&conversation_id);
        self.messages.lock().retain(|(id, _)| *id != conversation_id);
        Ok(())
    }
}

/// Fresh settings with the test guild's target channel set.
pub fn memory_store() -> Arc<MemorySettings> {
    let store = MemorySettings::default();
    store.target_channels.lock().insert(GUILD, CHANNEL);
    Arc::new(store)
}

/// Dependency bundle over the fakes, with the bot identity already known.
pub fn deps(
    config: Config,
    platform: Arc<FakePlatform>,
    completions: Arc<FakeCompletions>,
    store: Arc<MemorySettings>,
) -> BotDeps {
    BotDeps {
        config: Arc::new(config),
        settings: store,
        completions,
        messaging: platform,
        identity: Arc::new(ArcSwapOption::from_pointee(BotIdentity {
            user_id: BOT_ID,
        })),
    }
}
