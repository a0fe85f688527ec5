//! Shared fakes for the integration tests: a deterministic embedder, a
//! scripted chat model, and a store wrapper that fails on demand.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use docent::llm::{ChatModel, ChatRequest, LlmError, TokenStream};
use docent_core::embedding::EmbeddingProvider;
use docent_core::models::{
    Chatbot, Chunk, Conversation, DataSource, DataSourceStatus, Document, Message, Reaction,
};
use docent_core::store::memory::InMemoryStore;
use docent_core::store::{ChatStore, ChunkCandidate, KnowledgeStore};

pub const DIMS: usize = 64;

/// Hashes lowercase words into a fixed number of buckets, so texts sharing
/// words point the same way.
#[derive(Default)]
pub struct BagOfWords {
    pub calls: AtomicUsize,
}

pub fn bag_of_words(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
    {
        let bucket = word
            .to_lowercase()
            .bytes()
            .fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize))
            % DIMS;
        v[bucket] += 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingProvider for BagOfWords {
    fn model_name(&self) -> &str {
        "bag-of-words"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| bag_of_words(t)).collect())
    }
}

/// Replies with fixed fragments and records every request.
pub struct ScriptedChat {
    pub fragments: Vec<String>,
    /// After the fragments, never finish.
    pub stall: bool,
    pub requests: Mutex<Vec<ChatRequest>>,
    pub upstream_dropped: Arc<AtomicBool>,
}

impl ScriptedChat {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            stall: false,
            requests: Mutex::new(Vec::new()),
            upstream_dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stalling(fragments: &[&str]) -> Self {
        Self {
            stall: true,
            ..Self::new(fragments)
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<TokenStream, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let guard = SetOnDrop(self.upstream_dropped.clone());
        let items = stream::iter(self.fragments.clone()).map(move |f| {
            let _alive = &guard;
            Ok(f)
        });
        if self.stall {
            Ok(Box::pin(items.chain(stream::pending())))
        } else {
            Ok(Box::pin(items))
        }
    }
}

/// [`InMemoryStore`] with switchable failures.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryStore,
    /// Fail `insert_chunk` once this many chunks were written.
    pub fail_chunk_after: Mutex<Option<usize>>,
    pub chunks_written: AtomicUsize,
    pub fail_search: AtomicBool,
}

#[async_trait]
impl KnowledgeStore for FlakyStore {
    async fn create_data_source(&self, ds: &DataSource) -> Result<()> {
        self.inner.create_data_source(ds).await
    }
    async fn get_data_source(&self, id: &str) -> Result<Option<DataSource>> {
        self.inner.get_data_source(id).await
    }
    async fn list_data_sources(&self, tenant_id: &str) -> Result<Vec<DataSource>> {
        self.inner.list_data_sources(tenant_id).await
    }
    async fn begin_processing(&self, id: &str) -> Result<bool> {
        self.inner.begin_processing(id).await
    }
    async fn set_status(
        &self,
        id: &str,
        status: DataSourceStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.inner.set_status(id, status, error).await
    }
    async fn delete_data_source(&self, id: &str) -> Result<bool> {
        self.inner.delete_data_source(id).await
    }
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        self.inner.insert_document(doc).await
    }
    async fn list_documents(&self, data_source_id: &str) -> Result<Vec<Document>> {
        self.inner.list_documents(data_source_id).await
    }
    async fn delete_documents(&self, data_source_id: &str) -> Result<u64> {
        self.inner.delete_documents(data_source_id).await
    }
    async fn insert_chunk(&self, chunk: &Chunk) -> Result<()> {
        let limit = self.fail_chunk_after.lock().map(|l| *l).unwrap_or(None);
        if let Some(limit) = limit {
            if self.chunks_written.load(Ordering::SeqCst) >= limit {
                bail!("disk full");
            }
        }
        self.inner.insert_chunk(chunk).await?;
        self.chunks_written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn save_embedding(&self, chunk_id: &str, vector: &[f32]) -> Result<()> {
        self.inner.save_embedding(chunk_id, vector).await
    }
    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        self.inner.list_chunks(document_id).await
    }
    async fn search(
        &self,
        tenant_id: &str,
        query_vec: &[f32],
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<ChunkCandidate>> {
        if self.fail_search.load(Ordering::SeqCst) {
            bail!("connection reset");
        }
        self.inner
            .search(tenant_id, query_vec, limit, min_similarity)
            .await
    }
}

#[async_trait]
impl ChatStore for FlakyStore {
    async fn upsert_chatbot(&self, bot: &Chatbot) -> Result<()> {
        self.inner.upsert_chatbot(bot).await
    }
    async fn get_chatbot(&self, id: &str) -> Result<Option<Chatbot>> {
        self.inner.get_chatbot(id).await
    }
    async fn list_chatbots(&self, tenant_id: &str) -> Result<Vec<Chatbot>> {
        self.inner.list_chatbots(tenant_id).await
    }
    async fn get_or_create_conversation(
        &self,
        chatbot_id: &str,
        session_id: &str,
    ) -> Result<Conversation> {
        self.inner
            .get_or_create_conversation(chatbot_id, session_id)
            .await
    }
    async fn append_message(&self, msg: &Message) -> Result<()> {
        self.inner.append_message(msg).await
    }
    async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        self.inner.get_message(id).await
    }
    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        self.inner.recent_messages(conversation_id, limit).await
    }
    async fn set_reaction(&self, message_id: &str, reaction: Reaction) -> Result<bool> {
        self.inner.set_reaction(message_id, reaction).await
    }
    async fn count_assistant_messages_since(&self, tenant_id: &str, since: i64) -> Result<u64> {
        self.inner
            .count_assistant_messages_since(tenant_id, since)
            .await
    }
}
