//! SQLite-backed [`KnowledgeStore`] and [`ChatStore`].
//!
//! Embeddings live in `chunks.embedding` as little-endian `f32` BLOBs.
//! [`KnowledgeStore::search`] filters by tenant and `COMPLETE` status in
//! SQL, then scores the surviving rows with cosine similarity in Rust.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use docent_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use docent_core::models::{
    Chatbot, Chunk, Conversation, DataSource, DataSourceOrigin, DataSourceStatus, Document,
    Message, Reaction, Source,
};
use docent_core::store::{ChatStore, ChunkCandidate, KnowledgeStore};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn data_source_from_row(row: &SqliteRow) -> Result<DataSource> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let origin_json: String = row.get("origin_json");
    let origin: DataSourceOrigin = serde_json::from_str(&origin_json)?;
    Ok(DataSource {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        kind: kind.parse()?,
        status: status.parse()?,
        name: row.get("name"),
        origin,
        error: row.get("error"),
        last_sync_at: row.get("last_sync_at"),
        created_at: row.get("created_at"),
    })
}

fn document_from_row(row: &SqliteRow) -> Document {
    let metadata_json: String = row.get("metadata_json");
    Document {
        id: row.get("id"),
        data_source_id: row.get("data_source_id"),
        title: row.get("title"),
        body: row.get("body"),
        content_hash: row.get("content_hash"),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({})),
        created_at: row.get("created_at"),
    }
}

fn chatbot_from_row(row: &SqliteRow) -> Chatbot {
    let temperature: Option<f64> = row.get("temperature");
    let max_tokens: Option<i64> = row.get("max_tokens");
    let limit: Option<i64> = row.get("monthly_message_limit");
    Chatbot {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        name: row.get("name"),
        instructions: row.get("instructions"),
        model: row.get("model"),
        temperature: temperature.map(|t| t as f32),
        max_tokens: max_tokens.map(|m| m as u32),
        monthly_message_limit: limit.map(|l| l as u64),
        welcome_message: row.get("welcome_message"),
        created_at: row.get("created_at"),
    }
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let role: String = row.get("role");
    let sources_json: String = row.get("sources_json");
    let confidence: Option<String> = row.get("confidence");
    let reaction: Option<String> = row.get("reaction");
    let sources: Vec<Source> = serde_json::from_str(&sources_json)?;
    Ok(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        role: role.parse()?,
        content: row.get("content"),
        sources,
        confidence: confidence.map(|c| c.parse()).transpose()?,
        confidence_score: row.get("confidence_score"),
        reaction: reaction.map(|r| r.parse()).transpose()?,
        created_at: row.get("created_at"),
    })
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, sources_json, confidence, \
                               confidence_score, reaction, created_at";

#[async_trait]
impl KnowledgeStore for SqliteStore {
    async fn create_data_source(&self, ds: &DataSource) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO data_sources (id, tenant_id, kind, status, name, origin_json,
                                      error, last_sync_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&ds.id)
        .bind(&ds.tenant_id)
        .bind(ds.kind.as_str())
        .bind(ds.status.as_str())
        .bind(&ds.name)
        .bind(serde_json::to_string(&ds.origin)?)
        .bind(&ds.error)
        .bind(ds.last_sync_at)
        .bind(ds.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_data_source(&self, id: &str) -> Result<Option<DataSource>> {
        let row = sqlx::query("SELECT * FROM data_sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(data_source_from_row).transpose()
    }

    async fn list_data_sources(&self, tenant_id: &str) -> Result<Vec<DataSource>> {
        let rows = sqlx::query(
            "SELECT * FROM data_sources WHERE tenant_id = ? ORDER BY created_at DESC, id ASC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(data_source_from_row).collect()
    }

    async fn begin_processing(&self, id: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE data_sources SET status = ? WHERE id = ? AND status != ?")
                .bind(DataSourceStatus::Processing.as_str())
                .bind(id)
                .bind(DataSourceStatus::Processing.as_str())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM data_sources WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            bail!("data source not found: {}", id);
        }
        Ok(false)
    }

    async fn set_status(
        &self,
        id: &str,
        status: DataSourceStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let last_sync = (status == DataSourceStatus::Complete).then(|| chrono::Utc::now().timestamp());
        let result = sqlx::query(
            r#"
            UPDATE data_sources
            SET status = ?, error = ?, last_sync_at = COALESCE(?, last_sync_at)
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(last_sync)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("data source not found: {}", id);
        }
        Ok(())
    }

    async fn delete_data_source(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM chunks WHERE document_id IN (SELECT id FROM documents WHERE data_source_id = ?)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM documents WHERE data_source_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM data_sources WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, data_source_id, title, body, content_hash,
                                   metadata_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.data_source_id)
        .bind(&doc.title)
        .bind(&doc.body)
        .bind(&doc.content_hash)
        .bind(doc.metadata.to_string())
        .bind(doc.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_documents(&self, data_source_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE data_source_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(data_source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(document_from_row).collect())
    }

    async fn delete_documents(&self, data_source_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM chunks WHERE document_id IN (SELECT id FROM documents WHERE data_source_id = ?)",
        )
        .bind(data_source_id)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM documents WHERE data_source_id = ?")
            .bind(data_source_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn insert_chunk(&self, chunk: &Chunk) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, chunk_index, content, token_count, hash, embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.content)
        .bind(chunk.token_count)
        .bind(&chunk.hash)
        .bind(chunk.embedding.as_deref().map(vec_to_blob))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_embedding(&self, chunk_id: &str, vector: &[f32]) -> Result<()> {
        let result = sqlx::query("UPDATE chunks SET embedding = ? WHERE id = ?")
            .bind(vec_to_blob(vector))
            .bind(chunk_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("chunk not found: {}", chunk_id);
        }
        Ok(())
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Option<Vec<u8>> = row.get("embedding");
                Chunk {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    chunk_index: row.get("chunk_index"),
                    content: row.get("content"),
                    token_count: row.get("token_count"),
                    hash: row.get("hash"),
                    embedding: blob.map(|b| blob_to_vec(&b)),
                }
            })
            .collect())
    }

    async fn search(
        &self,
        tenant_id: &str,
        query_vec: &[f32],
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<ChunkCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id AS chunk_id, c.content, c.embedding,
                   d.id AS document_id, d.title AS document_title,
                   ds.id AS data_source_id, ds.name AS data_source_name
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            JOIN data_sources ds ON ds.id = d.data_source_id
            WHERE ds.tenant_id = ?
              AND ds.status = 'COMPLETE'
              AND c.embedding IS NOT NULL
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates: Vec<ChunkCandidate> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                (similarity >= min_similarity).then(|| ChunkCandidate {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    data_source_id: row.get("data_source_id"),
                    content: row.get("content"),
                    similarity,
                    document_title: row.get("document_title"),
                    data_source_name: row.get("data_source_name"),
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        candidates.truncate(limit);

        Ok(candidates)
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn upsert_chatbot(&self, bot: &Chatbot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chatbots (id, tenant_id, name, instructions, model, temperature,
                                  max_tokens, monthly_message_limit, welcome_message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                instructions = excluded.instructions,
                model = excluded.model,
                temperature = excluded.temperature,
                max_tokens = excluded.max_tokens,
                monthly_message_limit = excluded.monthly_message_limit,
                welcome_message = excluded.welcome_message
            "#,
        )
        .bind(&bot.id)
        .bind(&bot.tenant_id)
        .bind(&bot.name)
        .bind(&bot.instructions)
        .bind(&bot.model)
        .bind(bot.temperature.map(|t| t as f64))
        .bind(bot.max_tokens.map(|m| m as i64))
        .bind(bot.monthly_message_limit.map(|l| l as i64))
        .bind(&bot.welcome_message)
        .bind(bot.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_chatbot(&self, id: &str) -> Result<Option<Chatbot>> {
        let row = sqlx::query("SELECT * FROM chatbots WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(chatbot_from_row))
    }

    async fn list_chatbots(&self, tenant_id: &str) -> Result<Vec<Chatbot>> {
        let rows = sqlx::query("SELECT * FROM chatbots WHERE tenant_id = ? ORDER BY name ASC")
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(chatbot_from_row).collect())
    }

    async fn get_or_create_conversation(
        &self,
        chatbot_id: &str,
        session_id: &str,
    ) -> Result<Conversation> {
        sqlx::query(
            r#"
            INSERT INTO conversations (id, chatbot_id, session_id, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chatbot_id, session_id) DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(chatbot_id)
        .bind(session_id)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT id, chatbot_id, session_id, created_at FROM conversations WHERE chatbot_id = ? AND session_id = ?",
        )
        .bind(chatbot_id)
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Conversation {
            id: row.get("id"),
            chatbot_id: row.get("chatbot_id"),
            session_id: row.get("session_id"),
            created_at: row.get("created_at"),
        })
    }

    async fn append_message(&self, msg: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, seq, role, content, sources_json,
                                  confidence, confidence_score, reaction, created_at)
            VALUES (?, ?,
                    (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?),
                    ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&msg.id)
        .bind(&msg.conversation_id)
        .bind(&msg.conversation_id)
        .bind(msg.role.as_str())
        .bind(&msg.content)
        .bind(serde_json::to_string(&msg.sources)?)
        .bind(msg.confidence.map(|c| c.as_str()))
        .bind(msg.confidence_score)
        .bind(msg.reaction.map(|r| r.as_str()))
        .bind(msg.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let row = sqlx::query(&format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM (SELECT * FROM messages WHERE conversation_id = ? ORDER BY seq DESC LIMIT ?) ORDER BY seq ASC",
            MESSAGE_COLUMNS
        ))
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn set_reaction(&self, message_id: &str, reaction: Reaction) -> Result<bool> {
        let result = sqlx::query("UPDATE messages SET reaction = ? WHERE id = ?")
            .bind(reaction.as_str())
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_assistant_messages_since(&self, tenant_id: &str, since: i64) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM messages m
            JOIN conversations c ON c.id = m.conversation_id
            JOIN chatbots b ON b.id = c.chatbot_id
            WHERE b.tenant_id = ? AND m.role = 'ASSISTANT' AND m.created_at >= ?
            "#,
        )
        .bind(tenant_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}
