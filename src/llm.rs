//! Completion API access: shared HTTP session, moderation and chat completion.

pub mod client;
pub mod manager;

pub use client::{CompletionApi, CompletionRequest, CompletionResult, OpenAiClient, TokenUsage};
pub use manager::LlmManager;
