//! Streaming answer generation.
//!
//! Generation runs in two phases:
//!
//! 1. [`open_generation`] builds the prompt (chatbot instructions plus the
//!    retrieved context as the system message, the last N history turns,
//!    then the user message) and opens the upstream token stream. Failure
//!    here is [`Error::GenerationFailed`] and nothing has been sent.
//! 2. [`relay`] runs a single loop over the upstream: each fragment is
//!    delivered to the caller as a content frame and, only once delivered,
//!    appended to the capture buffer. The capture buffer is what gets
//!    persisted, so the stored answer is exactly the text the caller saw.
//!
//! ```text
//! upstream ──▶ relay ──▶ sink (SSE client / collector)
//!                 └────▶ capture ──▶ ChatStore::append_message
//! ```
//!
//! Frame order is metadata, content*, message-id, `[DONE]`. An upstream
//! error before any content yields an error frame and `[DONE]` with no
//! stored message; after content, the partial answer is stored and the
//! message-id frame precedes the error frame. If the caller goes away, even
//! while the upstream is stalled, the upstream stream is dropped at once and
//! whatever was delivered is still stored.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use docent_core::context::ConfidenceScore;
use docent_core::frame::StreamFrame;
use docent_core::models::{Chatbot, Message, Role, Source};
use docent_core::store::ChatStore;
use docent_core::Error;

use crate::config::LlmConfig;
use crate::llm::{ChatMessage, ChatModel, ChatRequest, ChatRole, TokenStream};

/// Per-answer model settings, resolved from the chatbot over `[llm]` defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub instructions: String,
    pub history_turns: usize,
    /// Bound on each read from the upstream stream.
    pub read_timeout: Duration,
}

impl GenerationConfig {
    pub fn resolve(bot: &Chatbot, llm: &LlmConfig) -> Self {
        Self {
            model: bot.model.clone().unwrap_or_else(|| llm.model.clone()),
            temperature: bot.temperature.unwrap_or(llm.temperature),
            max_tokens: bot.max_tokens.unwrap_or(llm.max_tokens),
            instructions: bot.instructions.clone(),
            history_turns: llm.history_turns,
            read_timeout: Duration::from_secs(llm.timeout_secs),
        }
    }
}

/// Everything the relay needs to describe and persist the answer.
#[derive(Debug, Clone)]
pub struct AnswerMeta {
    pub conversation_id: String,
    pub sources: Vec<Source>,
    pub confidence: ConfidenceScore,
}

/// Receives frames on their way to the caller.
#[async_trait]
pub trait FrameSink: Send {
    /// Deliver one frame. Returns `false` once the caller has gone away.
    async fn deliver(&mut self, frame: StreamFrame) -> bool;

    /// Resolves when the caller goes away. Never resolves for sinks that
    /// cannot disconnect.
    async fn closed(&mut self) {
        std::future::pending::<()>().await
    }
}

#[async_trait]
impl FrameSink for mpsc::Sender<StreamFrame> {
    async fn deliver(&mut self, frame: StreamFrame) -> bool {
        self.send(frame).await.is_ok()
    }

    async fn closed(&mut self) {
        mpsc::Sender::closed(self).await
    }
}

/// In-process sink for non-streaming answers.
#[derive(Debug, Default)]
pub struct FrameCollector {
    pub frames: Vec<StreamFrame>,
}

#[async_trait]
impl FrameSink for FrameCollector {
    async fn deliver(&mut self, frame: StreamFrame) -> bool {
        self.frames.push(frame);
        true
    }
}

/// What happened during one relay.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    /// Id of the stored assistant message, if one was stored.
    pub message_id: Option<String>,
    /// Capture buffer: the concatenation of delivered content frames.
    pub content: String,
    pub error: Option<String>,
    pub disconnected: bool,
}

pub fn build_system_prompt(instructions: &str, context: &str) -> String {
    let mut prompt = String::new();
    if !instructions.trim().is_empty() {
        prompt.push_str(instructions.trim());
        prompt.push_str("\n\n");
    }
    prompt.push_str(
        "Answer the user's question using the context below. \
         If the context does not contain the answer, say that you don't know.\n\n\
         Context:\n",
    );
    prompt.push_str(context);
    prompt
}

/// System prompt, the last `history_turns` messages, then the user message.
pub fn build_messages(
    config: &GenerationConfig,
    context: &str,
    history: &[Message],
    user_message: &str,
) -> Vec<ChatMessage> {
    let skip = history.len().saturating_sub(config.history_turns);
    let mut messages = Vec::with_capacity(history.len() - skip + 2);
    messages.push(ChatMessage::new(
        ChatRole::System,
        build_system_prompt(&config.instructions, context),
    ));
    for msg in &history[skip..] {
        let role = match msg.role {
            Role::User => ChatRole::User,
            Role::Assistant => ChatRole::Assistant,
        };
        messages.push(ChatMessage::new(role, msg.content.clone()));
    }
    messages.push(ChatMessage::new(ChatRole::User, user_message));
    messages
}

pub async fn open_generation(
    model: &dyn ChatModel,
    config: &GenerationConfig,
    context: &str,
    user_message: &str,
    history: &[Message],
) -> docent_core::Result<TokenStream> {
    let request = ChatRequest {
        model: config.model.clone(),
        temperature: config.temperature,
        max_tokens: config.max_tokens,
        messages: build_messages(config, context, history, user_message),
    };
    model.stream_chat(&request).await.map_err(|e| {
        warn!(model = %config.model, error = %e, "failed to open upstream");
        Error::from(e)
    })
}

/// Relay an opened upstream to `sink` and persist the captured answer.
///
/// Returns `Err(StorageFailed)` only when the answer could not be stored.
pub async fn relay(
    mut upstream: TokenStream,
    store: &dyn ChatStore,
    meta: AnswerMeta,
    read_timeout: Duration,
    sink: &mut dyn FrameSink,
) -> docent_core::Result<GenerationOutcome> {
    let mut capture = String::new();
    let mut error = None;
    let mut disconnected = !sink
        .deliver(StreamFrame::Metadata {
            sources: meta.sources.clone(),
            confidence: meta.confidence.label,
            confidence_score: meta.confidence.score,
        })
        .await;

    while !disconnected {
        let next = tokio::select! {
            biased;
            _ = sink.closed() => None,
            read = tokio::time::timeout(read_timeout, upstream.next()) => Some(read),
        };
        let Some(read) = next else {
            disconnected = true;
            break;
        };
        match read {
            Err(_) => {
                error = Some(format!("upstream timed out after {:?}", read_timeout));
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                error = Some(e.to_string());
                break;
            }
            Ok(Some(Ok(fragment))) => {
                if !sink.deliver(StreamFrame::Content(fragment.clone())).await {
                    disconnected = true;
                    break;
                }
                capture.push_str(&fragment);
            }
        }
    }
    drop(upstream);

    if let Some(e) = &error {
        warn!(conversation = %meta.conversation_id, delivered = capture.len(), error = %e, "upstream failed");
    }
    if disconnected {
        debug!(conversation = %meta.conversation_id, delivered = capture.len(), "caller disconnected");
    }

    let should_store = if disconnected || error.is_some() {
        !capture.is_empty()
    } else {
        true
    };

    let mut outcome = GenerationOutcome {
        message_id: None,
        content: capture,
        error,
        disconnected,
    };

    if should_store {
        let message = Message::assistant(
            &meta.conversation_id,
            outcome.content.clone(),
            meta.sources,
            meta.confidence.label,
            meta.confidence.score,
        );
        if let Err(e) = store.append_message(&message).await {
            warn!(conversation = %meta.conversation_id, error = %e, "failed to store answer");
            if !outcome.disconnected {
                sink.deliver(StreamFrame::Error("failed to save the answer".into()))
                    .await;
                sink.deliver(StreamFrame::Done).await;
            }
            return Err(Error::storage(e));
        }
        outcome.message_id = Some(message.id.clone());
    }

    if outcome.disconnected {
        return Ok(outcome);
    }
    if let Some(id) = &outcome.message_id {
        sink.deliver(StreamFrame::MessageId(id.clone())).await;
    }
    if let Some(e) = &outcome.error {
        sink.deliver(StreamFrame::Error(e.clone())).await;
    }
    sink.deliver(StreamFrame::Done).await;

    Ok(outcome)
}

/// Open the upstream and relay it in one call.
#[allow(clippy::too_many_arguments)]
pub async fn generate_streaming(
    model: &dyn ChatModel,
    store: &dyn ChatStore,
    config: &GenerationConfig,
    context: &str,
    user_message: &str,
    history: &[Message],
    meta: AnswerMeta,
    sink: &mut dyn FrameSink,
) -> docent_core::Result<GenerationOutcome> {
    let upstream = open_generation(model, config, context, user_message, history).await?;
    relay(upstream, store, meta, config.read_timeout, sink).await
}
