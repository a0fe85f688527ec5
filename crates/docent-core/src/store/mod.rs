//! Storage abstraction for Docent.
//!
//! Two traits split the persistence surface:
//!
//! - [`KnowledgeStore`]: data sources, documents, chunks, embeddings, and
//!   the tenant-scoped nearest-neighbour query used by retrieval.
//! - [`ChatStore`]: chatbots, conversations, and messages.
//!
//! Any backend (SQLite with BLOB vectors, Postgres + pgvector, a dedicated
//! vector database, the in-memory store used in tests) satisfies the same
//! interface. Implementations must be `Send + Sync` to work with async
//! runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    Chatbot, Chunk, Conversation, DataSource, DataSourceStatus, Document, Message, Reaction,
};

/// A chunk returned by [`KnowledgeStore::search`], joined with the
/// document and data source fields needed for citations.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub document_id: String,
    pub data_source_id: String,
    pub content: String,
    /// Cosine similarity to the query vector.
    pub similarity: f64,
    pub document_title: String,
    pub data_source_name: String,
}

/// Knowledge-base persistence.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`begin_processing`](KnowledgeStore::begin_processing) | Claim a data source for one ingestion attempt |
/// | [`set_status`](KnowledgeStore::set_status) | Record a terminal (or reset) status |
/// | [`delete_documents`](KnowledgeStore::delete_documents) | Remove documents and, by cascade, chunks |
/// | [`insert_chunk`](KnowledgeStore::insert_chunk) | Write one chunk without embedding |
/// | [`save_embedding`](KnowledgeStore::save_embedding) | Attach a vector to a chunk |
/// | [`search`](KnowledgeStore::search) | Tenant-scoped cosine search |
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn create_data_source(&self, ds: &DataSource) -> Result<()>;

    async fn get_data_source(&self, id: &str) -> Result<Option<DataSource>>;

    /// All data sources of a tenant, newest first.
    async fn list_data_sources(&self, tenant_id: &str) -> Result<Vec<DataSource>>;

    /// Atomically move a data source to `PROCESSING`.
    ///
    /// Returns `false`, leaving the row untouched, when it is already
    /// processing. Errors when the data source does not exist.
    async fn begin_processing(&self, id: &str) -> Result<bool>;

    /// Set the status and error text. `COMPLETE` also stamps the last-sync
    /// time; `PENDING` and `COMPLETE` clear any previous error.
    async fn set_status(&self, id: &str, status: DataSourceStatus, error: Option<&str>)
        -> Result<()>;

    /// Delete a data source with its documents and chunks.
    async fn delete_data_source(&self, id: &str) -> Result<bool>;

    async fn insert_document(&self, doc: &Document) -> Result<()>;

    async fn list_documents(&self, data_source_id: &str) -> Result<Vec<Document>>;

    /// Delete every document of a data source, cascading to chunks.
    /// Returns the number of documents removed.
    async fn delete_documents(&self, data_source_id: &str) -> Result<u64>;

    async fn insert_chunk(&self, chunk: &Chunk) -> Result<()>;

    async fn save_embedding(&self, chunk_id: &str, vector: &[f32]) -> Result<()>;

    /// Chunks of a document in ordinal order.
    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>>;

    /// Nearest chunks to `query_vec` for one tenant.
    ///
    /// Only chunks with an embedding, under a `COMPLETE` data source owned
    /// by `tenant_id`, are candidates. Results are sorted by descending
    /// similarity, never below `min_similarity`, at most `limit` long.
    async fn search(
        &self,
        tenant_id: &str,
        query_vec: &[f32],
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<ChunkCandidate>>;
}

/// Chatbot, conversation, and message persistence.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn upsert_chatbot(&self, bot: &Chatbot) -> Result<()>;

    async fn get_chatbot(&self, id: &str) -> Result<Option<Chatbot>>;

    async fn list_chatbots(&self, tenant_id: &str) -> Result<Vec<Chatbot>>;

    /// The conversation for `(chatbot_id, session_id)`, created on first use.
    async fn get_or_create_conversation(
        &self,
        chatbot_id: &str,
        session_id: &str,
    ) -> Result<Conversation>;

    async fn append_message(&self, msg: &Message) -> Result<()>;

    async fn get_message(&self, id: &str) -> Result<Option<Message>>;

    /// The last `limit` messages of a conversation, oldest first.
    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>>;

    /// Set the reaction on a message. Returns `false` if it does not exist.
    async fn set_reaction(&self, message_id: &str, reaction: Reaction) -> Result<bool>;

    /// Assistant messages produced by any of a tenant's chatbots since `since`.
    async fn count_assistant_messages_since(&self, tenant_id: &str, since: i64) -> Result<u64>;
}
