//! Streaming client for the conversational completion endpoint.
//!
//! The endpoint answers every request as a server-sent-event stream of
//! JSON lines. `message` / `agent_message` events carry incremental
//! `answer` fragments; a terminal `message_end` carries the
//! authoritative conversation id. The client assembles the full reply
//! before returning, so callers only ever see complete text.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::errors::ChatError;

/// Overall budget for one streamed exchange, connect through last byte.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Full reply assembled from one streamed exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub text: String,
    /// Continuity token to thread into the next call of the same
    /// conversation. Echoes the request's id when the stream ends
    /// without a `message_end` event.
    pub conversation_id: String,
}

/// Chat capability the stage bots and the pipeline depend on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Conversational mode. An empty `conversation_id` starts a new
    /// conversation; a non-empty one continues it.
    async fn send(
        &self,
        api_key: &str,
        query: &str,
        conversation_id: &str,
    ) -> Result<ChatReply, ChatError>;

    /// One-shot completion mode: structured inputs in, full text out.
    async fn send_completion(
        &self,
        api_key: &str,
        inputs: serde_json::Value,
    ) -> Result<String, ChatError>;
}

/// Events on the streaming wire.
#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
pub enum StreamEvent {
    #[serde(rename = "message")]
    Message {
        #[serde(default)]
        answer: String,
    },

    #[serde(rename = "agent_message")]
    AgentMessage {
        #[serde(default)]
        answer: String,
    },

    #[serde(rename = "message_end")]
    MessageEnd {
        #[serde(default)]
        conversation_id: String,
    },

    #[serde(other)]
    Other,
}

/// Parse one line of the SSE body.
///
/// Returns `None` for blank lines and non-data fields, `Some(Err)` for a
/// data line whose payload is not valid JSON.
pub fn parse_stream_line(line: &str) -> Option<Result<StreamEvent, serde_json::Error>> {
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload.is_empty() {
        return None;
    }
    Some(serde_json::from_str(payload))
}

/// Folds stream events into the final reply.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    conversation_id: Option<String>,
}

impl StreamAccumulator {
    pub fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Message { answer } | StreamEvent::AgentMessage { answer } => {
                self.text.push_str(&answer);
            }
            StreamEvent::MessageEnd { conversation_id } => {
                if !conversation_id.is_empty() {
                    self.conversation_id = Some(conversation_id);
                }
            }
            StreamEvent::Other => {}
        }
    }

    pub fn finish(self, fallback_conversation_id: &str) -> ChatReply {
        ChatReply {
            text: self.text,
            conversation_id: self
                .conversation_id
                .unwrap_or_else(|| fallback_conversation_id.to_string()),
        }
    }
}

/// HTTP implementation of [`ChatApi`].
///
/// Stateless across invocations: all continuity lives in the
/// conversation id the caller threads through.
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    user: String,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>, user: impl Into<String>) -> Result<Self, ChatError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(ChatClient {
            http,
            base_url,
            user: user.into(),
        })
    }

    /// POST the body and fold the SSE response into a reply. Malformed
    /// data lines are skipped, not fatal.
    async fn stream_reply(
        &self,
        url: &str,
        api_key: &str,
        body: serde_json::Value,
        fallback_conversation_id: &str,
    ) -> Result<ChatReply, ChatError> {
        let response = self
            .http
            .post(url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ChatError::Api {
                status: status.as_u16(),
                detail,
            });
        }

        let mut accumulator = StreamAccumulator::default();
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                apply_line(&String::from_utf8_lossy(&line), &mut accumulator);
            }
        }
        if !buffer.is_empty() {
            apply_line(&String::from_utf8_lossy(&buffer), &mut accumulator);
        }

        Ok(accumulator.finish(fallback_conversation_id))
    }
}

fn apply_line(raw: &str, accumulator: &mut StreamAccumulator) {
    let line = raw.trim_end_matches(['\r', '\n']);
    match parse_stream_line(line) {
        Some(Ok(event)) => accumulator.apply(event),
        Some(Err(e)) => warn!("Skipping malformed stream line: {}", e),
        None => {}
    }
}

#[async_trait]
impl ChatApi for ChatClient {
    async fn send(
        &self,
        api_key: &str,
        query: &str,
        conversation_id: &str,
    ) -> Result<ChatReply, ChatError> {
        if api_key.is_empty() {
            return Err(ChatError::MissingCredential);
        }
        let body = json!({
            "inputs": {},
            "query": query,
            "response_mode": "streaming",
            "conversation_id": conversation_id,
            "user": self.user,
            "files": [],
        });
        let url = format!("{}/chat-messages", self.base_url);
        debug!("POST {} (conversation_id={:?})", url, conversation_id);
        self.stream_reply(&url, api_key, body, conversation_id).await
    }

    async fn send_completion(
        &self,
        api_key: &str,
        inputs: serde_json::Value,
    ) -> Result<String, ChatError> {
        if api_key.is_empty() {
            return Err(ChatError::MissingCredential);
        }
        let body = json!({
            "inputs": inputs,
            "response_mode": "streaming",
            "user": self.user,
        });
        let url = format!("{}/completion-messages", self.base_url);
        debug!("POST {}", url);
        let reply = self.stream_reply(&url, api_key, body, "").await?;
        Ok(reply.text)
    }
}
