//! Moderation and chat-completion calls against an OpenAI-compatible API.
//!
//! Both calls are single-shot: retry policy belongs to the dispatch pipeline.

use crate::conversation::WindowMessage;
use crate::error::LlmError;
use crate::llm::manager::LlmManager;

use std::sync::Arc;

const MODERATIONS_PATH: &str = "moderations";
const CHAT_COMPLETIONS_PATH: &str = "chat/completions";

/// A chat completion request for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<WindowMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Token counters reported by the API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResult {
    pub text: String,
    pub usage: TokenUsage,
}

/// Remote completion endpoints.
#[async_trait::async_trait]
pub trait CompletionApi: Send + Sync + 'static {
    /// Returns whether the input was flagged. Any failure must be treated by
    /// the caller as a hard stop for the turn.
    async fn moderate(&self, input: &str) -> Result<bool, LlmError>;

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResult, LlmError>;
}

/// [`CompletionApi`] over the shared session in [`LlmManager`].
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    manager: Arc<LlmManager>,
}

impl OpenAiClient {
    pub fn new(manager: Arc<LlmManager>) -> Self {
        Self { manager }
    }

    /// POST a JSON body and return the parsed JSON response of a 2xx reply.
    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, LlmError> {
        let session = self.manager.session()?;
        let api_key = self.manager.pick_api_key()?;

        let response = session
            .post(self.manager.endpoint(path))
            .header("authorization", format!("Bearer {api_key}"))
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|error| LlmError::Transport {
                endpoint: path.into(),
                message: error.to_string(),
            })?;

        let status = response.status();
        let response_text = response.text().await.map_err(|error| LlmError::Transport {
            endpoint: path.into(),
            message: format!("failed to read response body: {error}"),
        })?;

        if !status.is_success() {
            return Err(LlmError::RemoteApi {
                endpoint: path.into(),
                status: status.as_u16(),
                message: error_message(&response_text),
            });
        }

        serde_json::from_str(&response_text).map_err(|error| LlmError::MalformedResponse {
            endpoint: path.into(),
            message: format!("{error}\nBody: {}", truncate_body(&response_text)),
        })
    }
}

#[async_trait::async_trait]
impl CompletionApi for OpenAiClient {
    async fn moderate(&self, input: &str) -> Result<bool, LlmError> {
        let body = serde_json::json!({ "input": input });
        let response = self.post_json(MODERATIONS_PATH, &body).await?;
        parse_moderation_response(&response)
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResult, LlmError> {
        let body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        let response = self.post_json(CHAT_COMPLETIONS_PATH, &body).await?;
        parse_completion_response(&response)
    }
}

fn parse_moderation_response(body: &serde_json::Value) -> Result<bool, LlmError> {
    body["results"][0]["flagged"]
        .as_bool()
        .ok_or_else(|| LlmError::MalformedResponse {
            endpoint: MODERATIONS_PATH.into(),
            message: "missing results[0].flagged".into(),
        })
}

fn parse_completion_response(body: &serde_json::Value) -> Result<CompletionResult, LlmError> {
    let text = body["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| LlmError::MalformedResponse {
            endpoint: CHAT_COMPLETIONS_PATH.into(),
            message: "missing choices[0].message.content".into(),
        })?
        .to_string();

    let usage = &body["usage"];
    let prompt_tokens = usage["prompt_tokens"].as_u64().unwrap_or(0);
    let completion_tokens = usage["completion_tokens"].as_u64().unwrap_or(0);
    let total_tokens = usage["total_tokens"]
        .as_u64()
        .unwrap_or(prompt_tokens + completion_tokens);

    Ok(CompletionResult {
        text,
        usage: TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        },
    })
}

/// Prefer the API's `error.message`, else a prefix of the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| truncate_body(body).to_string())
}

fn truncate_body(body: &str) -> &str {
    const LIMIT: usize = 500;
    match body.char_indices().nth(LIMIT) {
        Some((byte_index, _)) => &body[..byte_index],
        None => body,
    }
}
