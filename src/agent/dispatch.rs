//! One turn: reconstruct, moderate, complete with retry, deliver, report usage.

use crate::config::DispatchConfig;
use crate::conversation::HistoryReconstructor;
use crate::error::{LlmError, Result};
use crate::llm::{CompletionApi, CompletionRequest, CompletionResult, TokenUsage};
use crate::settings;
use crate::{BotDeps, ConversationId, InboundMessage, OutboundResponse};

use rand::Rng as _;
use std::time::Duration;
use tokio::time::Instant;

pub const MODERATION_NOTICE: &str =
    "Your message was flagged by the moderation filter and will not be answered.";
pub const MODERATION_UNAVAILABLE_NOTICE: &str =
    "The moderation check could not be completed, so this message will not be answered. \
     Please try again later.";

/// Filename used when a reply is too long for a chat message.
pub const RESPONSE_FILENAME: &str = "response.txt";

/// How a dispatch cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Delivered { usage: TokenUsage, as_file: bool },
    /// Moderation flagged the window; a notice was sent.
    Flagged,
    /// Moderation call failed; the turn fails closed with a notice.
    ModerationUnavailable,
    /// Completion failed on every attempt; nothing was sent.
    Abandoned,
    /// No target channel, empty model, or unknown bot identity.
    NotConfigured,
    DeliveryFailed,
    /// Nothing from a human to respond to, or an empty completion.
    Empty,
}

/// Text up to `limit` characters goes out as a message, longer text as a file.
pub fn route_output(text: String, limit: usize) -> OutboundResponse {
    if text.chars().count() <= limit {
        OutboundResponse::Text(text)
    } else {
        OutboundResponse::File {
            filename: RESPONSE_FILENAME.into(),
            data: text.into_bytes(),
        }
    }
}

/// Display name with the share of the token budget the last turn used.
pub fn usage_status(display_name: &str, total_tokens: u64, budget_tokens: u64) -> String {
    let percent = total_tokens
        .saturating_mul(100)
        .checked_div(budget_tokens)
        .unwrap_or(0);
    format!("{display_name} ({percent}%)")
}

/// Exponential backoff from `base_ms` with up to `base_ms` of jitter.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exponential = base_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
    let jitter = if base_ms == 0 {
        0
    } else {
        rand::rng().random_range(0..=base_ms)
    };
    Duration::from_millis(exponential.saturating_add(jitter))
}

/// Call `complete` up to `max_attempts` times under per-attempt and per-turn deadlines.
pub async fn complete_with_retry(
    api: &dyn CompletionApi,
    request: &CompletionRequest,
    policy: &DispatchConfig,
) -> std::result::Result<CompletionResult, LlmError> {
    let turn_deadline = Instant::now() + policy.turn_deadline();
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts {
        let remaining = turn_deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let budget = policy.attempt_timeout().min(remaining);

        let result = match tokio::time::timeout(budget, api.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout {
                endpoint: "chat/completions".into(),
                timeout_secs: budget.as_secs(),
            }),
        };

        match result {
            Ok(completion) => return Ok(completion),
            Err(error) if !error.is_retriable() => return Err(error),
            Err(error) => {
                tracing::warn!(attempt, max_attempts = policy.max_attempts, %error, "completion attempt failed");
                last_error = Some(error);
            }
        }

        if attempt < policy.max_attempts {
            let delay = backoff_delay(policy.retry_base_delay_ms, attempt)
                .min(turn_deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(delay).await;
        }
    }

    Err(last_error.unwrap_or(LlmError::Timeout {
        endpoint: "chat/completions".into(),
        timeout_secs: policy.turn_deadline_secs,
    }))
}

/// Runs dispatch cycles for every conversation.
pub struct DispatchPipeline {
    deps: BotDeps,
    reconstructor: HistoryReconstructor,
}

impl DispatchPipeline {
    pub fn new(deps: BotDeps) -> Self {
        let reconstructor = HistoryReconstructor::new(
            deps.messaging.clone(),
            deps.settings.clone(),
            &deps.config.dispatch,
        );
        Self {
            deps,
            reconstructor,
        }
    }

    /// Run one turn for a captured batch. Never fails; the outcome says what happened.
    pub async fn run_turn(
        &self,
        conversation_id: ConversationId,
        batch: Vec<InboundMessage>,
    ) -> TurnOutcome {
        match self.try_turn(conversation_id, &batch).await {
            Ok(outcome) => {
                tracing::debug!(conversation_id, batch = batch.len(), ?outcome, "turn finished");
                outcome
            }
            Err(error) => {
                tracing::error!(conversation_id, %error, "turn failed");
                TurnOutcome::Abandoned
            }
        }
    }

    async fn try_turn(
        &self,
        conversation_id: ConversationId,
        batch: &[InboundMessage],
    ) -> Result<TurnOutcome> {
        let Some(bot_user_id) = self.deps.bot_user_id() else {
            tracing::debug!(conversation_id, "bot identity not known yet");
            return Ok(TurnOutcome::NotConfigured);
        };
        let Some(channel_id) = self.deps.settings.target_channel(conversation_id).await? else {
            return Ok(TurnOutcome::NotConfigured);
        };
        let resolved = settings::resolve(
            self.deps.settings.as_ref(),
            &self.deps.config.defaults,
            conversation_id,
        )
        .await?;
        if resolved.model.trim().is_empty() {
            return Ok(TurnOutcome::NotConfigured);
        }

        if let Err(error) = self.deps.messaging.send_typing(channel_id).await {
            tracing::debug!(channel_id, %error, "typing indicator failed");
        }

        let window = self
            .reconstructor
            .reconstruct(channel_id, batch, &resolved.instructions, bot_user_id)
            .await?;
        if !window.has_user_turn() {
            return Ok(TurnOutcome::Empty);
        }

        let policy = &self.deps.config.dispatch;
        let moderation = tokio::time::timeout(
            policy.attempt_timeout(),
            self.deps.completions.moderate(&window.flatten()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(LlmError::Timeout {
                endpoint: "moderations".into(),
                timeout_secs: policy.attempt_timeout_secs,
            })
        });
        match moderation {
            Ok(false) => {}
            Ok(true) => {
                tracing::info!(conversation_id, "window flagged by moderation");
                self.notify(channel_id, MODERATION_NOTICE).await;
                return Ok(TurnOutcome::Flagged);
            }
            Err(error) => {
                tracing::warn!(conversation_id, %error, "moderation failed, refusing turn");
                self.notify(channel_id, MODERATION_UNAVAILABLE_NOTICE).await;
                return Ok(TurnOutcome::ModerationUnavailable);
            }
        }

        let turns = window.turn_count();
        let request = CompletionRequest {
            model: resolved.model,
            messages: window.into_messages(),
            temperature: resolved.temperature,
            max_tokens: policy.max_tokens,
        };
        let completion =
            match complete_with_retry(self.deps.completions.as_ref(), &request, policy).await {
                Ok(completion) => completion,
                Err(error) => {
                    tracing::error!(
                        conversation_id,
                        model = %request.model,
                        turns,
                        %error,
                        "completion abandoned"
                    );
                    return Ok(TurnOutcome::Abandoned);
                }
            };

        if completion.text.trim().is_empty() {
            tracing::warn!(conversation_id, "completion returned no text");
            return Ok(TurnOutcome::Empty);
        }

        let response = route_output(completion.text, policy.message_limit);
        let as_file = matches!(response, OutboundResponse::File { .. });
        if let Err(error) = self.deps.messaging.send(channel_id, response).await {
            tracing::error!(
                conversation_id,
                channel_id,
                platform = self.deps.messaging.name(),
                %error,
                "failed to deliver reply"
            );
            return Ok(TurnOutcome::DeliveryFailed);
        }

        self.spawn_usage_update(conversation_id, completion.usage);

        Ok(TurnOutcome::Delivered {
            usage: completion.usage,
            as_file,
        })
    }

    async fn notify(&self, channel_id: u64, text: &str) {
        if let Err(error) = self.deps.messaging.send_text(channel_id, text).await {
            tracing::warn!(channel_id, %error, "failed to send notice");
        }
    }

    /// Best-effort; runs after delivery and never affects the outcome.
    fn spawn_usage_update(&self, conversation_id: ConversationId, usage: TokenUsage) {
        let messaging = self.deps.messaging.clone();
        let status = usage_status(
            &self.deps.config.display_name,
            usage.total_tokens,
            self.deps.config.dispatch.usage_budget_tokens,
        );
        tokio::spawn(async move {
            if let Err(error) = messaging.set_display_status(conversation_id, &status).await {
                tracing::debug!(conversation_id, %error, "usage status update failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::conversation::Role;
    use crate::messaging::testing::{
        FakeCompletions, FakePlatform, GUILD, bot_message, completion, deps, memory_store,
        message, transport_error,
    };
    use crate::conversation::RESET_SENTINEL;
    use crate::settings::SettingsStore;
    use std::sync::Arc;

    struct Harness {
        platform: Arc<FakePlatform>,
        completions: Arc<FakeCompletions>,
        pipeline: DispatchPipeline,
    }

    fn harness() -> Harness {
        let platform = FakePlatform::new();
        let completions = FakeCompletions::new();
        let deps = deps(
            Config::for_tests(),
            platform.clone(),
            completions.clone(),
            memory_store(),
        );
        Harness {
            platform,
            completions,
            pipeline: DispatchPipeline::new(deps),
        }
    }

    #[test]
    fn output_at_limit_is_text_and_above_is_file() {
        let at_limit = "a".repeat(2000);
        assert_eq!(
            route_output(at_limit.clone(), 2000),
            OutboundResponse::Text(at_limit)
        );

        let over = "a".repeat(2001);
        match route_output(over.clone(), 2000) {
            OutboundResponse::File { filename, data } => {
                assert_eq!(filename, RESPONSE_FILENAME);
                assert_eq!(data, over.into_bytes());
            }
            other => panic!("expected a file, got {other:?}"),
        }
    }

    #[test]
    fn output_length_counts_characters_not_bytes() {
        let accented = "é".repeat(2000);
        assert!(matches!(
            route_output(accented, 2000),
            OutboundResponse::Text(_)
        ));
    }

    #[test]
    fn usage_status_is_percent_of_budget() {
        assert_eq!(usage_status("Osiris", 4096, 8192), "Osiris (50%)");
        assert_eq!(usage_status("Osiris", 10_000, 8192), "Osiris (122%)");
        assert_eq!(usage_status("Osiris", 10, 0), "Osiris (0%)");
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let first = backoff_delay(100, 1);
        let third = backoff_delay(100, 3);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(200));
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
        assert_eq!(backoff_delay(0, 2), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn short_reply_is_sent_as_text_and_usage_reported() {
        let h = harness();
        h.completions.push_completion(Ok(completion("hello Ana", 2048)));

        let outcome = h
            .pipeline
            .run_turn(GUILD, vec![message(1, 1, "Ana", "hi")])
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(
            outcome,
            TurnOutcome::Delivered { as_file: false, .. }
        ));
        assert_eq!(h.platform.sent_texts(), vec!["hello Ana".to_string()]);
        assert_eq!(h.platform.statuses(), vec![(GUILD, "Osiris (25%)".to_string())]);
        assert_eq!(h.platform.typing_count(), 1);

        let requests = h.completions.requests();
        let request = &requests[0];
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[1].content, "Ana: hi");
        assert_eq!(request.max_tokens, 2048);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_discards_batch_buffered_before_it() {
        let h = harness();
        let old = message(1, 1, "Ana", "old secret");
        h.platform.post(old.clone());
        h.platform.post(message(2, 1, "Ana", "!osiris new"));
        h.platform.post(bot_message(3, RESET_SENTINEL));

        let outcome = h.pipeline.run_turn(GUILD, vec![old]).await;

        assert_eq!(outcome, TurnOutcome::Empty);
        assert_eq!(h.completions.moderate_calls(), 0);
        assert_eq!(h.completions.complete_calls(), 0);
        assert!(h.platform.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_skips_usage_status() {
        let h = harness();
        h.platform.fail_sends();

        let outcome = h
            .pipeline
            .run_turn(GUILD, vec![message(1, 1, "Ana", "hi")])
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(outcome, TurnOutcome::DeliveryFailed);
        assert_eq!(h.completions.complete_calls(), 1);
        assert!(h.platform.statuses().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn long_reply_is_sent_as_file() {
        let h = harness();
        h.completions
            .push_completion(Ok(completion(&"z".repeat(2001), 100)));

        let outcome = h
            .pipeline
            .run_turn(GUILD, vec![message(1, 1, "Ana", "essay please")])
            .await;

        assert!(matches!(outcome, TurnOutcome::Delivered { as_file: true, .. }));
        let sent = h.platform.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0].1,
            OutboundResponse::File { filename, .. } if filename == RESPONSE_FILENAME
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn flagged_window_never_reaches_completion() {
        let h = harness();
        h.completions.push_moderation(Ok(true));

        let outcome = h
            .pipeline
            .run_turn(GUILD, vec![message(1, 1, "Ana", "something awful")])
            .await;

        assert_eq!(outcome, TurnOutcome::Flagged);
        assert_eq!(h.completions.moderate_calls(), 1);
        assert_eq!(h.completions.complete_calls(), 0);
        assert_eq!(h.platform.sent_texts(), vec![MODERATION_NOTICE.to_string()]);
        assert!(h.platform.statuses().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn moderation_failure_fails_closed() {
        let h = harness();
        h.completions.push_moderation(Err(LlmError::RemoteApi {
            endpoint: "moderations".into(),
            status: 500,
            message: "upstream".into(),
        }));

        let outcome = h
            .pipeline
            .run_turn(GUILD, vec![message(1, 1, "Ana", "hi")])
            .await;

        assert_eq!(outcome, TurnOutcome::ModerationUnavailable);
        assert_eq!(h.completions.complete_calls(), 0);
        assert_eq!(
            h.platform.sent_texts(),
            vec![MODERATION_UNAVAILABLE_NOTICE.to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_stop_after_three_attempts() {
        let h = harness();
        h.completions.fail_every_completion();

        let outcome = h
            .pipeline
            .run_turn(GUILD, vec![message(1, 1, "Ana", "hi")])
            .await;

        assert_eq!(outcome, TurnOutcome::Abandoned);
        assert_eq!(h.completions.complete_calls(), 3);
        assert!(h.platform.sent().is_empty());
        assert!(h.platform.statuses().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let h = harness();
        h.completions.push_completion(Err(transport_error()));
        h.completions.push_completion(Ok(completion("second time lucky", 10)));

        let outcome = h
            .pipeline
            .run_turn(GUILD, vec![message(1, 1, "Ana", "hi")])
            .await;

        assert!(matches!(outcome, TurnOutcome::Delivered { .. }));
        assert_eq!(h.completions.complete_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn client_error_is_not_retried() {
        let h = harness();
        h.completions.push_completion(Err(LlmError::RemoteApi {
            endpoint: "chat/completions".into(),
            status: 400,
            message: "bad model".into(),
        }));

        let outcome = h
            .pipeline
            .run_turn(GUILD, vec![message(1, 1, "Ana", "hi")])
            .await;

        assert_eq!(outcome, TurnOutcome::Abandoned);
        assert_eq!(h.completions.complete_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out_within_turn_deadline() {
        let h = harness();
        h.completions.set_delay(Duration::from_secs(60));
        let started = Instant::now();

        let outcome = h
            .pipeline
            .run_turn(GUILD, vec![message(1, 1, "Ana", "hi")])
            .await;

        assert_eq!(outcome, TurnOutcome::Abandoned);
        assert_eq!(h.completions.complete_calls(), 3);
        assert!(started.elapsed() <= Duration::from_secs(75));
    }

    #[tokio::test(start_paused = true)]
    async fn status_failure_does_not_change_outcome() {
        let h = harness();
        h.platform.fail_status_updates();

        let outcome = h
            .pipeline
            .run_turn(GUILD, vec![message(1, 1, "Ana", "hi")])
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(outcome, TurnOutcome::Delivered { .. }));
        assert_eq!(h.platform.sent_texts(), vec!["ok".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn conversation_without_target_channel_is_ignored() {
        let h = harness();

        let outcome = h
            .pipeline
            .run_turn(GUILD + 1, vec![message(1, 1, "Ana", "hi")])
            .await;

        assert_eq!(outcome, TurnOutcome::NotConfigured);
        assert_eq!(h.completions.moderate_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stored_settings_override_defaults() {
        let platform = FakePlatform::new();
        let completions = FakeCompletions::new();
        let store = memory_store();
        store.set_model(GUILD, "gpt-4o").await.unwrap();
        store.set_temperature(GUILD, 1.25).await.unwrap();
        store.set_instructions(GUILD, "answer in haiku").await.unwrap();
        let pipeline = DispatchPipeline::new(deps(
            Config::for_tests(),
            platform,
            completions.clone(),
            store,
        ));

        pipeline
            .run_turn(GUILD, vec![message(1, 1, "Ana", "hi")])
            .await;

        let requests = completions.requests();
        let request = &requests[0];
        assert_eq!(request.model, "gpt-4o");
        assert_eq!(request.temperature, 1.25);
        assert_eq!(request.messages[0].content, "answer in haiku");
    }
}
