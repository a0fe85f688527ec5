//! In-memory store implementing [`KnowledgeStore`] and [`ChatStore`].
//!
//! All state sits behind one `std::sync::RwLock`, so every operation is
//! atomic with respect to the others. Vector search is brute-force cosine
//! similarity over stored embeddings. Used by tests and by embedders that
//! do not want a database.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{
    Chatbot, Chunk, Conversation, DataSource, DataSourceStatus, Document, Message, Reaction, Role,
};

use super::{ChatStore, ChunkCandidate, KnowledgeStore};

#[derive(Default)]
struct State {
    data_sources: HashMap<String, DataSource>,
    documents: HashMap<String, Document>,
    chunks: HashMap<String, Chunk>,
    chatbots: HashMap<String, Chatbot>,
    conversations: HashMap<String, Conversation>,
    messages: Vec<Message>,
}

impl State {
    fn remove_documents_of(&mut self, data_source_id: &str) -> u64 {
        let doc_ids: Vec<String> = self
            .documents
            .values()
            .filter(|d| d.data_source_id == data_source_id)
            .map(|d| d.id.clone())
            .collect();
        for id in &doc_ids {
            self.documents.remove(id);
        }
        self.chunks.retain(|_, c| !doc_ids.contains(&c.document_id));
        doc_ids.len() as u64
    }
}

/// In-memory store for tests and database-free embedding.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    /// Total chunks across all tenants. Handy for assertions.
    pub fn chunk_count(&self) -> usize {
        self.read().map(|s| s.chunks.len()).unwrap_or(0)
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryStore {
    async fn create_data_source(&self, ds: &DataSource) -> Result<()> {
        self.write()?.data_sources.insert(ds.id.clone(), ds.clone());
        Ok(())
    }

    async fn get_data_source(&self, id: &str) -> Result<Option<DataSource>> {
        Ok(self.read()?.data_sources.get(id).cloned())
    }

    async fn list_data_sources(&self, tenant_id: &str) -> Result<Vec<DataSource>> {
        let mut list: Vec<DataSource> = self
            .read()?
            .data_sources
            .values()
            .filter(|ds| ds.tenant_id == tenant_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn begin_processing(&self, id: &str) -> Result<bool> {
        let mut state = self.write()?;
        let ds = state
            .data_sources
            .get_mut(id)
            .ok_or_else(|| anyhow!("data source not found: {}", id))?;
        if ds.status == DataSourceStatus::Processing {
            return Ok(false);
        }
        ds.status = DataSourceStatus::Processing;
        Ok(true)
    }

    async fn set_status(
        &self,
        id: &str,
        status: DataSourceStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut state = self.write()?;
        let ds = state
            .data_sources
            .get_mut(id)
            .ok_or_else(|| anyhow!("data source not found: {}", id))?;
        ds.status = status;
        ds.error = error.map(str::to_string);
        if status == DataSourceStatus::Complete {
            ds.last_sync_at = Some(chrono::Utc::now().timestamp());
        }
        Ok(())
    }

    async fn delete_data_source(&self, id: &str) -> Result<bool> {
        let mut state = self.write()?;
        state.remove_documents_of(id);
        Ok(state.data_sources.remove(id).is_some())
    }

    async fn insert_document(&self, doc: &Document) -> Result<()> {
        let mut state = self.write()?;
        if !state.data_sources.contains_key(&doc.data_source_id) {
            bail!("data source not found: {}", doc.data_source_id);
        }
        state.documents.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn list_documents(&self, data_source_id: &str) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .read()?
            .documents
            .values()
            .filter(|d| d.data_source_id == data_source_id)
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn delete_documents(&self, data_source_id: &str) -> Result<u64> {
        Ok(self.write()?.remove_documents_of(data_source_id))
    }

    async fn insert_chunk(&self, chunk: &Chunk) -> Result<()> {
        let mut state = self.write()?;
        if !state.documents.contains_key(&chunk.document_id) {
            bail!("document not found: {}", chunk.document_id);
        }
        let duplicate = state
            .chunks
            .values()
            .any(|c| c.document_id == chunk.document_id && c.chunk_index == chunk.chunk_index);
        if duplicate {
            bail!(
                "chunk {} already exists for document {}",
                chunk.chunk_index,
                chunk.document_id
            );
        }
        state.chunks.insert(chunk.id.clone(), chunk.clone());
        Ok(())
    }

    async fn save_embedding(&self, chunk_id: &str, vector: &[f32]) -> Result<()> {
        let mut state = self.write()?;
        let chunk = state
            .chunks
            .get_mut(chunk_id)
            .ok_or_else(|| anyhow!("chunk not found: {}", chunk_id))?;
        chunk.embedding = Some(vector.to_vec());
        Ok(())
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let mut chunks: Vec<Chunk> = self
            .read()?
            .chunks
            .values()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn search(
        &self,
        tenant_id: &str,
        query_vec: &[f32],
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<ChunkCandidate>> {
        let state = self.read()?;
        let mut candidates: Vec<ChunkCandidate> = state
            .chunks
            .values()
            .filter_map(|chunk| {
                let embedding = chunk.embedding.as_ref()?;
                let doc = state.documents.get(&chunk.document_id)?;
                let ds = state.data_sources.get(&doc.data_source_id)?;
                if ds.tenant_id != tenant_id || ds.status != DataSourceStatus::Complete {
                    return None;
                }
                let similarity = cosine_similarity(query_vec, embedding) as f64;
                if similarity < min_similarity {
                    return None;
                }
                Some(ChunkCandidate {
                    chunk_id: chunk.id.clone(),
                    document_id: doc.id.clone(),
                    data_source_id: ds.id.clone(),
                    content: chunk.content.clone(),
                    similarity,
                    document_title: doc.title.clone(),
                    data_source_name: ds.name.clone(),
                })
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }
}

#[async_trait]
impl ChatStore for InMemoryStore {
    async fn upsert_chatbot(&self, bot: &Chatbot) -> Result<()> {
        self.write()?.chatbots.insert(bot.id.clone(), bot.clone());
        Ok(())
    }

    async fn get_chatbot(&self, id: &str) -> Result<Option<Chatbot>> {
        Ok(self.read()?.chatbots.get(id).cloned())
    }

    async fn list_chatbots(&self, tenant_id: &str) -> Result<Vec<Chatbot>> {
        let mut bots: Vec<Chatbot> = self
            .read()?
            .chatbots
            .values()
            .filter(|b| b.tenant_id == tenant_id)
            .cloned()
            .collect();
        bots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(bots)
    }

    async fn get_or_create_conversation(
        &self,
        chatbot_id: &str,
        session_id: &str,
    ) -> Result<Conversation> {
        let mut state = self.write()?;
        if let Some(existing) = state
            .conversations
            .values()
            .find(|c| c.chatbot_id == chatbot_id && c.session_id == session_id)
        {
            return Ok(existing.clone());
        }
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            chatbot_id: chatbot_id.to_string(),
            session_id: session_id.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        state
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn append_message(&self, msg: &Message) -> Result<()> {
        let mut state = self.write()?;
        if !state.conversations.contains_key(&msg.conversation_id) {
            bail!("conversation not found: {}", msg.conversation_id);
        }
        state.messages.push(msg.clone());
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        Ok(self.read()?.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let state = self.read()?;
        let all: Vec<&Message> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .collect();
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).cloned().collect())
    }

    async fn set_reaction(&self, message_id: &str, reaction: Reaction) -> Result<bool> {
        let mut state = self.write()?;
        match state.messages.iter_mut().find(|m| m.id == message_id) {
            Some(msg) => {
                msg.reaction = Some(reaction);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_assistant_messages_since(&self, tenant_id: &str, since: i64) -> Result<u64> {
        let state = self.read()?;
        let count = state
            .messages
            .iter()
            .filter(|m| m.role == Role::Assistant && m.created_at >= since)
            .filter(|m| {
                state
                    .conversations
                    .get(&m.conversation_id)
                    .and_then(|c| state.chatbots.get(&c.chatbot_id))
                    .map(|b| b.tenant_id == tenant_id)
                    .unwrap_or(false)
            })
            .count();
        Ok(count as u64)
    }
}
