//! AI chat endpoint client
//!
//! The endpoint takes `{message, history}` and answers `{response}`. Any
//! failure is masked by a short stock phrase so the chat never sees an error.

use crate::config::{AI_HISTORY_WINDOW, AI_TIMEOUT_SECS, CHAT_HISTORY_COLLECTION, CHAT_HISTORY_LIMIT};
use crate::identity::ChatId;
use crate::storage::{load_json, save_json, DocumentStore, StorageError};
use crate::utils::retry_store_operation;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Replies used whenever the endpoint is unreachable or misbehaves
pub const FALLBACK_REPLIES: [&str; 6] = [
    "...",
    "connection died lol",
    "brb",
    "tech issues rn",
    "give me a sec",
    "servers are cooked",
];

/// Reply used when the endpoint answers without a `response` field
const EMPTY_RESPONSE: &str = "...";

/// Errors talking to the AI endpoint
#[derive(Debug, Error)]
pub enum AiError {
    /// No endpoint configured
    #[error("AI endpoint is not configured")]
    NotConfigured,
    /// Connection failure or timeout
    #[error("Network error: {0}")]
    Network(String),
    /// Non-success status code
    #[error("API error: {0}")]
    Api(String),
    /// Response body was not the expected JSON
    #[error("JSON error: {0}")]
    Json(String),
}

/// Speaker of a history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human side
    User,
    /// The bot side
    Assistant,
}

/// One turn of conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    /// Who said it
    pub role: Role,
    /// What was said
    pub content: String,
}

impl ChatTurn {
    /// User turn
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Assistant turn
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Something that can complete a chat prompt
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatResponder: Send + Sync {
    /// Answer `message` given the recent `history`
    async fn complete(&self, message: &str, history: &[ChatTurn]) -> Result<String, AiError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    history: &'a [ChatTurn],
}

#[derive(Deserialize)]
struct ChatResponse {
    response: Option<String>,
}

/// HTTP client for the chat endpoint
pub struct HttpChatClient {
    http_client: HttpClient,
    endpoint: Option<String>,
    api_key: Option<String>,
}

impl HttpChatClient {
    /// Create a client; `endpoint = None` makes every call fail over to a
    /// stock phrase.
    #[must_use]
    pub fn new(endpoint: Option<String>, api_key: Option<String>) -> Self {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(AI_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| HttpClient::new());
        Self {
            http_client,
            endpoint: endpoint.filter(|e| !e.trim().is_empty()),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }
}

#[async_trait]
impl ChatResponder for HttpChatClient {
    async fn complete(&self, message: &str, history: &[ChatTurn]) -> Result<String, AiError> {
        let endpoint = self.endpoint.as_deref().ok_or(AiError::NotConfigured)?;

        let body = ChatRequest {
            message,
            history: recent(history),
        };
        let mut request = self.http_client.post(endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AiError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            let truncated = crate::utils::truncate_str(&error_text, 200);
            return Err(AiError::Api(format!("{status} - {truncated}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AiError::Json(e.to_string()))?;

        Ok(parsed
            .response
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| EMPTY_RESPONSE.to_string()))
    }
}

fn recent(history: &[ChatTurn]) -> &[ChatTurn] {
    &history[history.len().saturating_sub(AI_HISTORY_WINDOW)..]
}

/// Pick one of the stock replies at random
#[must_use]
pub fn fallback_reply() -> &'static str {
    FALLBACK_REPLIES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(EMPTY_RESPONSE)
}

/// Ask `responder`, masking any error with a stock reply.
pub async fn complete_or_fallback(
    responder: &dyn ChatResponder,
    message: &str,
    history: &[ChatTurn],
) -> String {
    match responder.complete(message, history).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, "AI endpoint failed, using stock reply");
            fallback_reply().to_string()
        }
    }
}

/// Prompt sent to the endpoint: chat kind and sender name, then the text.
#[must_use]
pub fn build_prompt(is_group: bool, sender_name: &str, text: &str) -> String {
    let scope = if is_group { "GROUP" } else { "PRIVATE" };
    format!("[{scope}: {sender_name}] {text}")
}

/// Per-chat conversation history kept in the document store
#[derive(Clone)]
pub struct ConversationHistory {
    store: Arc<dyn DocumentStore>,
}

impl ConversationHistory {
    /// Wrap a store
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Stored turns for `chat`, oldest first. Read errors yield an empty
    /// history.
    pub async fn load(&self, chat: &ChatId) -> Vec<ChatTurn> {
        let store = self.store.as_ref();
        let loaded: Result<Option<Vec<ChatTurn>>, StorageError> = retry_store_operation(|| {
            load_json(store, CHAT_HISTORY_COLLECTION, chat.as_str())
        })
        .await;
        match loaded {
            Ok(turns) => turns.unwrap_or_default(),
            Err(e) => {
                warn!(chat = %chat, error = %e, "Failed to load chat history");
                Vec::new()
            }
        }
    }

    /// Append turns, dropping the oldest beyond the per-chat cap.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn append(&self, chat: &ChatId, turns: &[ChatTurn]) -> Result<(), StorageError> {
        let mut history = self.load(chat).await;
        history.extend_from_slice(turns);
        let overflow = history.len().saturating_sub(CHAT_HISTORY_LIMIT);
        if overflow > 0 {
            history.drain(..overflow);
            debug!(chat = %chat, dropped = overflow, "Trimmed chat history");
        }
        let store = self.store.as_ref();
        retry_store_operation(|| save_json(store, CHAT_HISTORY_COLLECTION, chat.as_str(), &history))
            .await
    }

    /// Forget a chat's history
    ///
    /// # Errors
    ///
    /// Returns an error if the store delete fails.
    pub async fn clear(&self, chat: &ChatId) -> Result<(), StorageError> {
        self.store
            .delete(CHAT_HISTORY_COLLECTION, chat.as_str())
            .await
    }
}
