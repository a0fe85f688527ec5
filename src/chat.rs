//! Chat service: the query-time path from a user question to a stored answer.
//!
//! For each question the service loads the chatbot, enforces its monthly
//! quota before any provider is called, records the user message, embeds
//! the question, retrieves context for the chatbot's tenant, scores
//! confidence, and hands everything to the generator.
//!
//! Retrieval is best effort: when the store cannot run the similarity
//! query the answer proceeds with zero sources and a low confidence score.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use docent_core::context::{build_context, score_confidence, to_sources};
use docent_core::embedding::EmbeddingClient;
use docent_core::models::{Chatbot, Confidence, Reaction, Role, Source};
use docent_core::retrieval::{self, RetrievedChunk};
use docent_core::store::{ChatStore, KnowledgeStore};
use docent_core::Error;

use crate::config::{Config, LlmConfig, RetrievalConfig};
use crate::embedding;
use crate::generate::{
    self, AnswerMeta, FrameCollector, FrameSink, GenerationConfig, GenerationOutcome,
};
use crate::llm::{self, ChatModel, TokenStream};

/// A question from an end user.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatQuery {
    pub chatbot_id: String,
    pub session_id: String,
    pub message: String,
}

/// A completed, stored answer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAnswer {
    pub id: String,
    pub content: String,
    pub sources: Vec<Source>,
    pub confidence: Confidence,
    pub confidence_score: f64,
}

/// Public settings for the embeddable widget.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetConfig {
    pub chatbot_id: String,
    pub name: String,
    pub welcome_message: Option<String>,
}

/// An answer whose upstream is open and whose metadata is known, ready to
/// be relayed to a sink.
pub struct PreparedAnswer {
    upstream: TokenStream,
    meta: AnswerMeta,
    read_timeout: Duration,
    chats: Arc<dyn ChatStore>,
}

impl PreparedAnswer {
    pub fn meta(&self) -> &AnswerMeta {
        &self.meta
    }

    pub async fn relay(self, sink: &mut dyn FrameSink) -> docent_core::Result<GenerationOutcome> {
        generate::relay(
            self.upstream,
            self.chats.as_ref(),
            self.meta,
            self.read_timeout,
            sink,
        )
        .await
    }
}

#[derive(Clone)]
pub struct ChatService {
    knowledge: Arc<dyn KnowledgeStore>,
    chats: Arc<dyn ChatStore>,
    embedder: EmbeddingClient,
    model: Arc<dyn ChatModel>,
    llm: LlmConfig,
    retrieval: RetrievalConfig,
}

impl ChatService {
    pub fn new(
        knowledge: Arc<dyn KnowledgeStore>,
        chats: Arc<dyn ChatStore>,
        embedder: EmbeddingClient,
        model: Arc<dyn ChatModel>,
        llm: LlmConfig,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            knowledge,
            chats,
            embedder,
            model,
            llm,
            retrieval,
        }
    }

    /// Build the service with the providers named in the config.
    pub fn from_config(
        config: &Config,
        knowledge: Arc<dyn KnowledgeStore>,
        chats: Arc<dyn ChatStore>,
    ) -> anyhow::Result<Self> {
        Ok(Self::new(
            knowledge,
            chats,
            embedding::create_client(&config.embedding)?,
            llm::create_chat_model(&config.llm)?,
            config.llm.clone(),
            config.retrieval.clone(),
        ))
    }

    /// Answer and wait for the full text.
    ///
    /// An upstream failure is returned as `GenerationFailed`, even when
    /// partial text was stored.
    pub async fn answer(&self, query: &ChatQuery) -> docent_core::Result<ChatAnswer> {
        let prepared = self.prepare(query).await?;
        let meta = prepared.meta().clone();
        let mut collector = FrameCollector::default();
        let outcome = prepared.relay(&mut collector).await?;

        if let Some(e) = outcome.error {
            return Err(Error::GenerationFailed(e));
        }
        let id = outcome
            .message_id
            .ok_or_else(|| Error::GenerationFailed("no answer was produced".to_string()))?;
        Ok(ChatAnswer {
            id,
            content: outcome.content,
            sources: meta.sources,
            confidence: meta.confidence.label,
            confidence_score: meta.confidence.score,
        })
    }

    /// Answer into `sink` frame by frame.
    pub async fn answer_stream(
        &self,
        query: &ChatQuery,
        sink: &mut dyn FrameSink,
    ) -> docent_core::Result<GenerationOutcome> {
        self.prepare(query).await?.relay(sink).await
    }

    /// Do everything up to and including opening the upstream, then store
    /// the user message.
    ///
    /// Errors here happen before any frame is sent, so HTTP callers can
    /// still answer with a status code.
    pub async fn prepare(&self, query: &ChatQuery) -> docent_core::Result<PreparedAnswer> {
        let message = query.message.trim();
        if message.is_empty() {
            return Err(Error::InvalidInput("message must not be empty".to_string()));
        }
        if query.session_id.trim().is_empty() {
            return Err(Error::InvalidInput("sessionId must not be empty".to_string()));
        }

        let bot = self.chatbot(&query.chatbot_id).await?;
        self.enforce_quota(&bot).await?;

        let conversation = self
            .chats
            .get_or_create_conversation(&bot.id, &query.session_id)
            .await
            .map_err(Error::storage)?;
        let history = self
            .chats
            .recent_messages(&conversation.id, self.llm.history_turns)
            .await
            .map_err(Error::storage)?;

        let query_vec = self.embedder.embed(message).await?;
        let retrieved = self.retrieve(&bot.tenant_id, &query_vec).await;
        let confidence = score_confidence(&retrieved);
        let context = build_context(&retrieved);
        debug!(
            chatbot = %bot.id,
            sources = retrieved.len(),
            confidence = confidence.score,
            "context assembled"
        );

        let gen_config = GenerationConfig::resolve(&bot, &self.llm);
        let upstream =
            generate::open_generation(self.model.as_ref(), &gen_config, &context, message, &history)
                .await?;

        // A turn that fails before this point leaves no user message.
        self.chats
            .append_message(&docent_core::models::Message::user(&conversation.id, message))
            .await
            .map_err(Error::storage)?;

        Ok(PreparedAnswer {
            upstream,
            meta: AnswerMeta {
                conversation_id: conversation.id,
                sources: to_sources(&retrieved),
                confidence,
            },
            read_timeout: gen_config.read_timeout,
            chats: self.chats.clone(),
        })
    }

    /// Tenant-scoped search for a free-text query.
    pub async fn search(
        &self,
        tenant_id: &str,
        query: &str,
        limit: Option<usize>,
    ) -> docent_core::Result<Vec<RetrievedChunk>> {
        let query_vec = self.embedder.embed(query).await?;
        retrieval::search(
            self.knowledge.as_ref(),
            tenant_id,
            &query_vec,
            limit.unwrap_or(self.retrieval.limit),
            self.retrieval.min_similarity,
        )
        .await
    }

    /// Set the reaction on an assistant message.
    pub async fn react(&self, message_id: &str, reaction: Reaction) -> docent_core::Result<()> {
        let message = self
            .chats
            .get_message(message_id)
            .await
            .map_err(Error::storage)?
            .ok_or_else(|| Error::NotFound(format!("message {}", message_id)))?;
        if message.role != Role::Assistant {
            return Err(Error::InvalidInput(
                "only assistant messages take reactions".to_string(),
            ));
        }
        self.chats
            .set_reaction(message_id, reaction)
            .await
            .map_err(Error::storage)?;
        info!(message = %message_id, reaction = reaction.as_str(), "reaction recorded");
        Ok(())
    }

    pub async fn widget_config(&self, chatbot_id: &str) -> docent_core::Result<WidgetConfig> {
        let bot = self.chatbot(chatbot_id).await?;
        Ok(WidgetConfig {
            chatbot_id: bot.id,
            name: bot.name,
            welcome_message: bot.welcome_message,
        })
    }

    async fn chatbot(&self, chatbot_id: &str) -> docent_core::Result<Chatbot> {
        self.chats
            .get_chatbot(chatbot_id)
            .await
            .map_err(Error::storage)?
            .ok_or_else(|| Error::NotFound(format!("chatbot {}", chatbot_id)))
    }

    async fn enforce_quota(&self, bot: &Chatbot) -> docent_core::Result<()> {
        let Some(limit) = bot.monthly_message_limit else {
            return Ok(());
        };
        let used = self
            .chats
            .count_assistant_messages_since(&bot.tenant_id, month_start(Utc::now().timestamp()))
            .await
            .map_err(Error::storage)?;
        if used >= limit {
            warn!(tenant = %bot.tenant_id, used, limit, "message quota exceeded");
            return Err(Error::QuotaExceeded { used, limit });
        }
        Ok(())
    }

    async fn retrieve(&self, tenant_id: &str, query_vec: &[f32]) -> Vec<RetrievedChunk> {
        match retrieval::search(
            self.knowledge.as_ref(),
            tenant_id,
            query_vec,
            self.retrieval.limit,
            self.retrieval.min_similarity,
        )
        .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!(tenant = %tenant_id, error = %e, "retrieval failed, answering without sources");
                Vec::new()
            }
        }
    }
}

/// Unix timestamp of the first second of the UTC month containing `ts`.
pub fn month_start(ts: i64) -> i64 {
    Utc.timestamp_opt(ts, 0)
        .single()
        .and_then(|dt| {
            Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
                .single()
        })
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}
