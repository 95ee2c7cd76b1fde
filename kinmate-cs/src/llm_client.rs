//! OpenAI-compatible chat-completions client
//!
//! Backs the default assistant and summarizer. Any server exposing
//! `POST {endpoint}/chat/completions` works.

use crate::collaborators::{Assistant, AssistantFactory, Summarizer};
use crate::history::Round;
use kinmate_common::config::LlmConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = concat!("kinmate-cs/", env!("CARGO_PKG_VERSION"));

const PERSONA: &str = "You are a warm, patient companion for an elderly person. \
Reply in the user's language with short, clear sentences. \
Pay attention to health, mood and safety, and gently suggest seeing a doctor or \
contacting family when something sounds worrying.";

const REPLY_TEMPERATURE: f32 = 0.7;
const SUMMARY_TEMPERATURE: f32 = 0.3;

/// Chat client errors
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("API error {0}: {1}")]
    ApiError(u16, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Empty completion")]
    EmptyCompletion,
}

impl From<ChatError> for kinmate_common::Error {
    fn from(e: ChatError) -> Self {
        kinmate_common::Error::Collaborator(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Chat-completions API client
#[derive(Clone)]
pub struct ChatClient {
    http_client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl ChatClient {
    /// Build a client; the API key is read from `config.api_key_env`
    pub fn new(config: &LlmConfig) -> Result<Self, ChatError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChatError::NetworkError(e.to_string()))?;

        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            tracing::warn!(
                "{} is not set; chat requests are sent without authorization",
                config.api_key_env
            );
        }

        Ok(Self {
            http_client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one chat completion and return the first choice's text
    pub async fn complete(&self, messages: &[ChatMessage], temperature: f32) -> Result<String, ChatError> {
        let url = format!("{}/chat/completions", self.endpoint);
        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature,
        };

        tracing::debug!(url = %url, model = %self.model, messages = messages.len(), "Requesting chat completion");

        let mut request = self.http_client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ChatError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ChatError::ApiError(status.as_u16(), error_text));
        }

        let text = response
            .text()
            .await
            .map_err(|e| ChatError::NetworkError(e.to_string()))?;
        extract_reply(&text)
    }
}

/// First choice's content from a chat-completions response body
fn extract_reply(body: &str) -> Result<String, ChatError> {
    let response: ChatResponse =
        serde_json::from_str(body).map_err(|e| ChatError::ParseError(e.to_string()))?;
    let content = response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content.trim().to_string())
        .unwrap_or_default();
    if content.is_empty() {
        return Err(ChatError::EmptyCompletion);
    }
    Ok(content)
}

/// Messages for one assistant reply
pub fn reply_messages(context: &str, text: &str) -> Vec<ChatMessage> {
    let mut prompt = String::new();
    if !context.trim().is_empty() {
        prompt.push_str(context.trim_end());
        prompt.push_str("\n\n");
    }
    prompt.push_str("User: ");
    prompt.push_str(text);
    vec![ChatMessage::system(PERSONA), ChatMessage::user(prompt)]
}

/// Prompt asking for a short summary of `rounds`
pub fn summary_prompt(start: usize, rounds: &[Round]) -> String {
    let mut prompt = String::from(
        "Summarize the following conversation with an elderly user in 100 to 150 characters. \
Cover any health issues mentioned, the advice given, and the user's mood.\n\n",
    );
    for (offset, round) in rounds.iter().enumerate() {
        prompt.push_str(&format!(
            "Round {}:\nUser: {}\nCompanion: {}\n\n",
            start + offset + 1,
            round.input,
            round.output
        ));
    }
    prompt
}

/// Assistant bound to one user
pub struct ChatAssistant {
    client: ChatClient,
    user_id: String,
}

#[async_trait::async_trait]
impl Assistant for ChatAssistant {
    async fn respond(&self, context: &str, text: &str) -> kinmate_common::Result<String> {
        let reply = self
            .client
            .complete(&reply_messages(context, text), REPLY_TEMPERATURE)
            .await?;
        tracing::debug!(user_id = %self.user_id, reply_len = reply.len(), "Assistant replied");
        Ok(reply)
    }
}

#[async_trait::async_trait]
impl AssistantFactory for ChatClient {
    async fn create(&self, user_id: &str) -> kinmate_common::Result<Arc<dyn Assistant>> {
        Ok(Arc::new(ChatAssistant {
            client: self.clone(),
            user_id: user_id.to_string(),
        }))
    }
}

#[async_trait::async_trait]
impl Summarizer for ChatClient {
    async fn summarize(&self, start: usize, rounds: &[Round]) -> kinmate_common::Result<String> {
        let messages = [ChatMessage::user(summary_prompt(start, rounds))];
        Ok(self.complete(&messages, SUMMARY_TEMPERATURE).await?)
    }
}
