//! Tenant-scoped semantic retrieval.
//!
//! [`search`] runs the nearest-neighbour query through a
//! [`KnowledgeStore`] and hands back [`RetrievedChunk`]s ranked by cosine
//! similarity. Tenant and status filtering happen inside the store query;
//! this layer re-checks the ordering and threshold on whatever the store
//! returns and maps store failures to
//! [`Error::RetrievalUnavailable`](crate::Error::RetrievalUnavailable).

use serde::Serialize;

use crate::error::Error;
use crate::store::{ChunkCandidate, KnowledgeStore};

/// Default number of chunks fed into a prompt.
pub const DEFAULT_LIMIT: usize = 5;

/// Default similarity floor. Chunks strictly below it are dropped.
pub const DEFAULT_MIN_SIMILARITY: f64 = 0.2;

/// A ranked retrieval hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub content: String,
    pub similarity: f64,
    pub document_id: String,
    pub data_source_id: String,
    pub document_title: String,
    pub data_source_name: String,
}

impl From<ChunkCandidate> for RetrievedChunk {
    fn from(c: ChunkCandidate) -> Self {
        Self {
            chunk_id: c.chunk_id,
            content: c.content,
            similarity: c.similarity,
            document_id: c.document_id,
            data_source_id: c.data_source_id,
            document_title: c.document_title,
            data_source_name: c.data_source_name,
        }
    }
}

/// Find the chunks of `tenant_id` most similar to `query_vec`.
///
/// Results are in descending similarity, at most `limit` long, none below
/// `min_similarity`. `limit == 0` returns an empty list without touching
/// the store.
pub async fn search(
    store: &dyn KnowledgeStore,
    tenant_id: &str,
    query_vec: &[f32],
    limit: usize,
    min_similarity: f64,
) -> crate::Result<Vec<RetrievedChunk>> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let candidates = store
        .search(tenant_id, query_vec, limit, min_similarity)
        .await
        .map_err(|e| Error::RetrievalUnavailable(format!("{:#}", e)))?;

    let mut hits: Vec<RetrievedChunk> = candidates
        .into_iter()
        .filter(|c| c.similarity >= min_similarity)
        .map(RetrievedChunk::from)
        .collect();
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(limit);
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, DataSource, DataSourceStatus, Document};
    use crate::store::memory::InMemoryStore;

    async fn seed(
        store: &InMemoryStore,
        tenant: &str,
        status: DataSourceStatus,
        vectors: &[(&str, Vec<f32>)],
    ) -> DataSource {
        let ds = DataSource::new_url(tenant, &format!("{} docs", tenant), "https://example.com");
        store.create_data_source(&ds).await.unwrap();
        let doc = Document::new(&ds.id, "Guide", "body".into(), serde_json::json!({}));
        store.insert_document(&doc).await.unwrap();
        for (i, (content, vec)) in vectors.iter().enumerate() {
            let chunk = Chunk {
                id: uuid::Uuid::new_v4().to_string(),
                document_id: doc.id.clone(),
                chunk_index: i as i64,
                content: content.to_string(),
                token_count: 1,
                hash: String::new(),
                embedding: None,
            };
            store.insert_chunk(&chunk).await.unwrap();
            store.save_embedding(&chunk.id, vec).await.unwrap();
        }
        store.set_status(&ds.id, status, None).await.unwrap();
        ds
    }

    #[tokio::test]
    async fn ranks_by_similarity_and_applies_threshold() {
        let store = InMemoryStore::new();
        seed(
            &store,
            "t1",
            DataSourceStatus::Complete,
            &[
                ("exact", vec![1.0, 0.0]),
                ("close", vec![0.9, 0.1]),
                ("orthogonal", vec![0.0, 1.0]),
                ("opposite", vec![-1.0, 0.0]),
            ],
        )
        .await;

        let hits = search(&store, "t1", &[1.0, 0.0], 10, 0.2).await.unwrap();
        let contents: Vec<&str> = hits.iter().map(|h| h.content.as_str()).collect();
        assert_eq!(contents, vec!["exact", "close"]);
        assert!(hits[0].similarity >= hits[1].similarity);
        assert!(hits.iter().all(|h| h.similarity >= 0.2));
        assert_eq!(hits[0].document_title, "Guide");
        assert_eq!(hits[0].data_source_name, "t1 docs");
    }

    #[tokio::test]
    async fn other_tenants_and_incomplete_sources_are_invisible() {
        let store = InMemoryStore::new();
        seed(&store, "t1", DataSourceStatus::Complete, &[("mine", vec![1.0, 0.0])]).await;
        seed(&store, "t2", DataSourceStatus::Complete, &[("theirs", vec![1.0, 0.0])]).await;
        seed(&store, "t1", DataSourceStatus::Processing, &[("half", vec![1.0, 0.0])]).await;
        seed(&store, "t1", DataSourceStatus::Failed, &[("broken", vec![1.0, 0.0])]).await;

        let hits = search(&store, "t1", &[1.0, 0.0], 10, 0.0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "mine");
    }

    #[tokio::test]
    async fn limit_is_respected() {
        let store = InMemoryStore::new();
        let vectors: Vec<(&str, Vec<f32>)> = (0..8)
            .map(|i| ("chunk", vec![1.0, i as f32 * 0.1]))
            .collect();
        seed(&store, "t1", DataSourceStatus::Complete, &vectors).await;

        assert_eq!(search(&store, "t1", &[1.0, 0.0], 3, 0.0).await.unwrap().len(), 3);
        assert!(search(&store, "t1", &[1.0, 0.0], 0, 0.0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chunks_without_embedding_are_skipped() {
        let store = InMemoryStore::new();
        let ds = seed(&store, "t1", DataSourceStatus::Complete, &[]).await;
        let doc = Document::new(&ds.id, "Raw", "body".into(), serde_json::json!({}));
        store.insert_document(&doc).await.unwrap();
        store
            .insert_chunk(&Chunk {
                id: "unembedded".into(),
                document_id: doc.id.clone(),
                chunk_index: 0,
                content: "pending".into(),
                token_count: 1,
                hash: String::new(),
                embedding: None,
            })
            .await
            .unwrap();

        assert!(search(&store, "t1", &[1.0, 0.0], 5, -1.0).await.unwrap().is_empty());
    }
}
