//! Streaming chat-completion providers.
//!
//! A [`ChatModel`] opens an upstream completion and returns a
//! [`TokenStream`] of text fragments. Dropping the stream drops the HTTP
//! response body, which cancels the upstream request.
//!
//! - [`OpenAIChat`]: `POST {url}/v1/chat/completions` with `stream: true`,
//!   parsed as server-sent events. Works with any OpenAI-compatible server.
//! - [`OllamaChat`]: `POST {url}/api/chat`, newline-delimited JSON.
//! - [`DisabledChat`]: refuses to open.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, Stream, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

use crate::config::LlmConfig;

const OPENAI_URL: &str = "https://api.openai.com";
const OLLAMA_URL: &str = "http://localhost:11434";
const MAX_LINE_BYTES: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM provider is disabled. Set [llm] provider in config.")]
    Disabled,
    #[error("{provider} request failed: {message}")]
    Transport { provider: &'static str, message: String },
    #[error("{provider} returned HTTP {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("upstream stream error: {0}")]
    Stream(String),
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
}

impl From<LlmError> for docent_core::Error {
    fn from(err: LlmError) -> Self {
        docent_core::Error::GenerationFailed(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One completion request, already resolved against chatbot settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub messages: Vec<ChatMessage>,
}

/// Incremental text fragments from the model. Ends when the model is done.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    /// Open the upstream completion. Errors here mean nothing was produced.
    async fn stream_chat(&self, request: &ChatRequest) -> Result<TokenStream, LlmError>;
}

pub struct DisabledChat;

#[async_trait]
impl ChatModel for DisabledChat {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn stream_chat(&self, _request: &ChatRequest) -> Result<TokenStream, LlmError> {
        Err(LlmError::Disabled)
    }
}

fn http_client(config: &LlmConfig, provider: &'static str) -> Result<reqwest::Client, LlmError> {
    // No total timeout: streams are bounded per read by the generator.
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| LlmError::Transport {
            provider,
            message: e.to_string(),
        })
}

async fn open_lines(
    request: reqwest::RequestBuilder,
    provider: &'static str,
    timeout: Duration,
) -> Result<impl Stream<Item = Result<String, LlmError>> + Send, LlmError> {
    let response = tokio::time::timeout(timeout, request.send())
        .await
        .map_err(|_| LlmError::Timeout(timeout))?
        .map_err(|e| LlmError::Transport {
            provider,
            message: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::Status {
            provider,
            status: status.as_u16(),
            body,
        });
    }

    let bytes = response.bytes_stream().map_err(std::io::Error::other);
    let lines = FramedRead::new(
        StreamReader::new(bytes),
        LinesCodec::new_with_max_length(MAX_LINE_BYTES),
    );
    Ok(lines.map_err(|e| LlmError::Stream(e.to_string())))
}

/// A decoded upstream line.
#[derive(Debug, PartialEq)]
enum Delta {
    Token(String),
    Done,
}

pub struct OpenAIChat {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl OpenAIChat {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let base = config.url.as_deref().unwrap_or(OPENAI_URL).trim_end_matches('/');
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        if api_key.is_none() && config.url.is_none() {
            anyhow::bail!("OPENAI_API_KEY environment variable not set");
        }
        Ok(Self {
            client: http_client(config, "OpenAI")?,
            endpoint: format!("{}/v1/chat/completions", base),
            api_key,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl ChatModel for OpenAIChat {
    fn name(&self) -> &str {
        "openai"
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<TokenStream, LlmError> {
        let body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": true,
        });
        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let lines = open_lines(builder, "OpenAI", self.timeout).await?;
        Ok(deltas_to_tokens(
            lines.and_then(|line| future::ready(parse_openai_line(&line))),
        ))
    }
}

/// Parse one SSE line of an OpenAI streaming response.
fn parse_openai_line(line: &str) -> Result<Option<Delta>, LlmError> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(Some(Delta::Done));
    }
    let json: Value =
        serde_json::from_str(data).map_err(|e| LlmError::Stream(format!("bad chunk: {}", e)))?;
    if let Some(err) = json.get("error") {
        return Err(LlmError::Stream(error_message(err)));
    }
    let choice = &json["choices"][0];
    if let Some(content) = choice["delta"]["content"].as_str() {
        return Ok(Some(Delta::Token(content.to_string())));
    }
    Ok(None)
}

pub struct OllamaChat {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl OllamaChat {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let base = config.url.as_deref().unwrap_or(OLLAMA_URL).trim_end_matches('/');
        Ok(Self {
            client: http_client(config, "Ollama")?,
            endpoint: format!("{}/api/chat", base),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl ChatModel for OllamaChat {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<TokenStream, LlmError> {
        let body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "stream": true,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        });
        let lines = open_lines(self.client.post(&self.endpoint).json(&body), "Ollama", self.timeout).await?;
        Ok(deltas_to_tokens(
            lines.and_then(|line| future::ready(parse_ollama_line(&line))),
        ))
    }
}

/// Parse one NDJSON line of an Ollama chat stream.
fn parse_ollama_line(line: &str) -> Result<Option<Delta>, LlmError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let json: Value =
        serde_json::from_str(line).map_err(|e| LlmError::Stream(format!("bad chunk: {}", e)))?;
    if let Some(err) = json.get("error") {
        return Err(LlmError::Stream(error_message(err)));
    }
    let token = json["message"]["content"].as_str().unwrap_or_default();
    if json["done"].as_bool().unwrap_or(false) {
        return Ok(Some(if token.is_empty() {
            Delta::Done
        } else {
            Delta::Token(token.to_string())
        }));
    }
    Ok(Some(Delta::Token(token.to_string())))
}

fn error_message(err: &Value) -> String {
    err.get("message")
        .and_then(|m| m.as_str())
        .or_else(|| err.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string())
}

/// Stop at `Done`, drop empty fragments.
fn deltas_to_tokens<S>(deltas: S) -> TokenStream
where
    S: Stream<Item = Result<Option<Delta>, LlmError>> + Send + 'static,
{
    Box::pin(
        deltas
            .try_filter_map(|delta| future::ready(Ok(delta)))
            .try_take_while(|delta| future::ready(Ok(*delta != Delta::Done)))
            .try_filter_map(|delta| {
                future::ready(Ok(match delta {
                    Delta::Token(text) if !text.is_empty() => Some(text),
                    _ => None,
                }))
            }),
    )
}

/// Instantiate the model named by `llm.provider`.
pub fn create_chat_model(config: &LlmConfig) -> anyhow::Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledChat)),
        "openai" => Ok(Arc::new(OpenAIChat::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaChat::new(config)?)),
        other => anyhow::bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn openai_lines() {
        assert_eq!(parse_openai_line("").unwrap(), None);
        assert_eq!(parse_openai_line(": keep-alive").unwrap(), None);
        assert_eq!(
            parse_openai_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#).unwrap(),
            Some(Delta::Token("Hi".into()))
        );
        assert_eq!(
            parse_openai_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            None
        );
        assert_eq!(parse_openai_line("data: [DONE]").unwrap(), Some(Delta::Done));
        assert!(parse_openai_line(r#"data: {"error":{"message":"overloaded"}}"#).is_err());
    }

    #[test]
    fn ollama_lines() {
        assert_eq!(
            parse_ollama_line(r#"{"message":{"content":"Hel"},"done":false}"#).unwrap(),
            Some(Delta::Token("Hel".into()))
        );
        assert_eq!(
            parse_ollama_line(r#"{"message":{"content":""},"done":true}"#).unwrap(),
            Some(Delta::Done)
        );
        assert!(parse_ollama_line(r#"{"error":"model not found"}"#).is_err());
    }

    #[tokio::test]
    async fn tokens_stop_at_done() {
        let deltas = stream::iter(vec![
            Ok(Some(Delta::Token("a".into()))),
            Ok(None),
            Ok(Some(Delta::Token(String::new()))),
            Ok(Some(Delta::Token("b".into()))),
            Ok(Some(Delta::Done)),
            Ok(Some(Delta::Token("ignored".into()))),
        ]);
        let tokens: Vec<String> = deltas_to_tokens(deltas).try_collect().await.unwrap();
        assert_eq!(tokens, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn disabled_model_refuses() {
        let request = ChatRequest {
            model: "m".into(),
            temperature: 0.0,
            max_tokens: 1,
            messages: vec![ChatMessage::new(ChatRole::User, "hi")],
        };
        assert!(matches!(
            DisabledChat.stream_chat(&request).await,
            Err(LlmError::Disabled)
        ));
    }

    #[test]
    fn messages_serialize_lowercase_roles() {
        let json = serde_json::to_value(ChatMessage::new(ChatRole::System, "x")).unwrap();
        assert_eq!(json["role"], "system");
    }
}
