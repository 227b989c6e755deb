//! LLM manager: the shared outbound session and credential selection.

use crate::config::Config;
use crate::error::LlmError;

use arc_swap::ArcSwapOption;
use rand::seq::IndexedRandom as _;
use std::sync::Arc;
use std::time::Duration;

/// Owns the single HTTP session shared by every conversation.
///
/// The session is built lazily on first use, rebuilt when the gateway
/// reconnects, and dropped when it disconnects. Callers always go through
/// [`LlmManager::session`], so a torn-down session is recreated on demand.
pub struct LlmManager {
    api_base: String,
    api_keys: Vec<Arc<str>>,
    session: ArcSwapOption<reqwest::Client>,
}

impl LlmManager {
    pub fn new(config: &Config) -> Self {
        Self {
            api_base: config.api_base.clone(),
            api_keys: config.api_keys.clone(),
            session: ArcSwapOption::empty(),
        }
    }

    /// Get the live session, creating it if it was never opened or was closed.
    pub fn session(&self) -> Result<Arc<reqwest::Client>, LlmError> {
        if let Some(session) = self.session.load_full() {
            return Ok(session);
        }

        // Two callers racing here both build a client; the last store wins
        // and the other client is dropped with its request.
        let session = Arc::new(build_session()?);
        self.session.store(Some(session.clone()));
        tracing::debug!("opened completion API session");
        Ok(session)
    }

    /// Replace the session with a fresh one (gateway ready/resume).
    pub fn renew_session(&self) {
        match build_session() {
            Ok(session) => {
                self.session.store(Some(Arc::new(session)));
                tracing::debug!("renewed completion API session");
            }
            Err(error) => {
                // Next call to session() retries the build.
                self.session.store(None);
                tracing::warn!(%error, "failed to renew completion API session");
            }
        }
    }

    /// Drop the session (gateway disconnect).
    pub fn close_session(&self) {
        if self.session.swap(None).is_some() {
            tracing::debug!("closed completion API session");
        }
    }

    pub fn has_session(&self) -> bool {
        self.session.load().is_some()
    }

    /// Pick one configured credential at random.
    pub fn pick_api_key(&self) -> Result<Arc<str>, LlmError> {
        self.api_keys
            .choose(&mut rand::rng())
            .cloned()
            .ok_or(LlmError::MissingApiKey)
    }

    /// Full URL for an API path such as `moderations`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }
}

impl std::fmt::Debug for LlmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmManager")
            .field("api_base", &self.api_base)
            .field("api_keys", &self.api_keys.len())
            .field("has_session", &self.has_session())
            .finish()
    }
}

fn build_session() -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|error| LlmError::Transport {
            endpoint: "session".into(),
            message: format!("failed to build HTTP client: {error}"),
        })
}
