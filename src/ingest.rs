//! Ingestion pipeline: parse → chunk → embed → persist.
//!
//! Every attempt starts by claiming the data source with an atomic
//! `PENDING|COMPLETE|FAILED → PROCESSING` transition and ends in exactly one
//! of `COMPLETE` or `FAILED`. Once claimed, the attempt clears the source's
//! previous documents before writing new ones. A failed attempt deletes
//! every document (and, by cascade, every chunk) written for the data
//! source before recording the error, so a `FAILED` source never has
//! partial content. A panic inside an attempt is recorded as a failure.
//!
//! [`IngestQueue`] runs jobs on a fixed pool of workers; [`IngestTicket`]
//! lets the submitter await the outcome while the status stays pollable
//! through the store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use docent_core::chunk::chunk_text;
use docent_core::embedding::EmbeddingClient;
use docent_core::models::{sha256_hex, Chunk, DataSource, DataSourceStatus, Document};
use docent_core::store::KnowledgeStore;
use docent_core::Error;

use crate::config::Config;
use crate::crawl::{self, CrawledPage};
use crate::extract;

/// Content handed to the pipeline.
#[derive(Debug, Clone)]
pub enum IngestInput {
    /// Uploaded file bytes with their declared MIME type.
    File { bytes: Vec<u8>, mime: String },
    /// Pages that were already fetched.
    Pages(Vec<CrawledPage>),
    /// Crawl this URL inside the attempt; fetch failures mark the source failed.
    Crawl { url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub documents: usize,
    pub chunks: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkSettings {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct CrawlSettings {
    pub max_pages: usize,
    /// Largest response body read for a single page.
    pub max_page_bytes: usize,
    pub timeout: Duration,
}

/// Runs ingestion attempts against a knowledge store. Cheap to clone.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn KnowledgeStore>,
    embedder: EmbeddingClient,
    chunking: ChunkSettings,
    crawling: CrawlSettings,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        embedder: EmbeddingClient,
        chunking: ChunkSettings,
        crawling: CrawlSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            chunking,
            crawling,
        }
    }

    /// Build from `[chunking]` and `[ingest]`.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn KnowledgeStore>,
        embedder: EmbeddingClient,
    ) -> Self {
        Self::new(
            store,
            embedder,
            ChunkSettings {
                max_tokens: config.chunking.max_tokens,
                overlap_tokens: config.chunking.overlap_tokens,
            },
            CrawlSettings {
                max_pages: config.ingest.crawl_max_pages,
                max_page_bytes: config.ingest.max_upload_bytes,
                timeout: Duration::from_secs(config.ingest.crawl_timeout_secs),
            },
        )
    }

    pub fn store(&self) -> &Arc<dyn KnowledgeStore> {
        &self.store
    }

    /// Run one ingestion attempt for `data_source_id`.
    pub async fn ingest(&self, data_source_id: &str, input: IngestInput) -> docent_core::Result<IngestReport> {
        let ds = self.load(data_source_id).await?;

        let claimed = self
            .store
            .begin_processing(&ds.id)
            .await
            .map_err(Error::storage)?;
        if !claimed {
            return Err(Error::AlreadyProcessing(ds.id));
        }
        info!(data_source = %ds.id, name = %ds.name, "ingestion started");

        let id = ds.id.clone();
        let ingestor = self.clone();
        let outcome = tokio::spawn(async move { ingestor.attempt(&ds, input).await })
            .await
            .unwrap_or_else(|e| {
                Err(Error::StorageFailed(format!("ingestion attempt aborted: {}", e)))
            });

        match outcome {
            Ok(report) => {
                info!(
                    data_source = %id,
                    documents = report.documents,
                    chunks = report.chunks,
                    "ingestion complete"
                );
                Ok(report)
            }
            Err(err) => {
                self.fail(&id, &err).await;
                Err(err)
            }
        }
    }

    /// Ingest the source again, replacing its content.
    ///
    /// Without `input`, URL sources re-crawl their stored URL; file sources
    /// need the file content and are rejected with `InvalidInput` before
    /// anything is touched. A source that is already processing is rejected
    /// with `AlreadyProcessing` and keeps its content.
    pub async fn resync(
        &self,
        data_source_id: &str,
        input: Option<IngestInput>,
    ) -> docent_core::Result<IngestReport> {
        let ds = self.load(data_source_id).await?;
        let input = match (input, ds.url()) {
            (Some(input), _) => input,
            (None, Some(url)) => IngestInput::Crawl {
                url: url.to_string(),
            },
            (None, None) => {
                return Err(Error::InvalidInput(format!(
                    "data source {} is a file; resync needs its content",
                    ds.id
                )))
            }
        };
        self.ingest(&ds.id, input).await
    }

    /// Ingest several data sources concurrently. One failure never affects
    /// the others; outcomes come back in job order.
    pub async fn ingest_batch(
        &self,
        jobs: Vec<IngestJob>,
    ) -> Vec<(String, docent_core::Result<IngestReport>)> {
        let mut set = JoinSet::new();
        let ids: Vec<String> = jobs.iter().map(|j| j.data_source_id.clone()).collect();
        for (pos, job) in jobs.into_iter().enumerate() {
            let ingestor = self.clone();
            set.spawn(async move { (pos, ingestor.run(job).await) });
        }

        let mut outcomes: Vec<Option<docent_core::Result<IngestReport>>> =
            ids.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((pos, outcome)) => outcomes[pos] = Some(outcome),
                Err(e) => warn!(error = %e, "ingest task aborted"),
            }
        }

        ids.into_iter()
            .zip(outcomes)
            .map(|(id, outcome)| {
                let outcome = outcome
                    .unwrap_or_else(|| Err(Error::StorageFailed("ingest task aborted".to_string())));
                (id, outcome)
            })
            .collect()
    }

    /// Execute a queued job.
    pub async fn run(&self, job: IngestJob) -> docent_core::Result<IngestReport> {
        if job.resync {
            self.resync(&job.data_source_id, job.input).await
        } else {
            let input = match job.input {
                Some(input) => input,
                None => self.default_input(&job.data_source_id).await?,
            };
            self.ingest(&job.data_source_id, input).await
        }
    }

    async fn default_input(&self, data_source_id: &str) -> docent_core::Result<IngestInput> {
        let ds = self.load(data_source_id).await?;
        ds.url()
            .map(|url| IngestInput::Crawl {
                url: url.to_string(),
            })
            .ok_or_else(|| Error::InvalidInput(format!("no content given for data source {}", ds.id)))
    }

    async fn load(&self, data_source_id: &str) -> docent_core::Result<DataSource> {
        self.store
            .get_data_source(data_source_id)
            .await
            .map_err(Error::storage)?
            .ok_or_else(|| Error::NotFound(format!("data source {}", data_source_id)))
    }

    async fn attempt(&self, ds: &DataSource, input: IngestInput) -> docent_core::Result<IngestReport> {
        let removed = self
            .store
            .delete_documents(&ds.id)
            .await
            .map_err(Error::storage)?;
        if removed > 0 {
            debug!(data_source = %ds.id, removed, "cleared previous documents");
        }

        let parsed = self.parse_input(ds, input).await?;

        let mut report = IngestReport {
            documents: 0,
            chunks: 0,
        };
        for (title, body, metadata) in parsed {
            let doc = Document::new(&ds.id, &title, body, metadata);
            self.store
                .insert_document(&doc)
                .await
                .map_err(Error::storage)?;
            report.documents += 1;
            report.chunks += self.write_chunks(&doc).await?;
        }

        self.store
            .set_status(&ds.id, DataSourceStatus::Complete, None)
            .await
            .map_err(Error::storage)?;
        Ok(report)
    }

    async fn parse_input(
        &self,
        ds: &DataSource,
        input: IngestInput,
    ) -> docent_core::Result<Vec<(String, String, serde_json::Value)>> {
        let pages = match input {
            IngestInput::File { bytes, mime } => {
                let parsed = extract::parse_blocking(bytes, mime).await?;
                let title = parsed.title.unwrap_or_else(|| ds.name.clone());
                return Ok(vec![(title, parsed.text, parsed.metadata)]);
            }
            IngestInput::Pages(pages) => pages,
            IngestInput::Crawl { url } => {
                crawl::crawl(
                    &url,
                    self.crawling.max_pages,
                    self.crawling.max_page_bytes,
                    self.crawling.timeout,
                )
                .await?
            }
        };

        Ok(pages
            .into_iter()
            .map(|page| {
                let title = page.title.unwrap_or_else(|| page.url.clone());
                (title, page.text, serde_json::json!({ "url": page.url }))
            })
            .collect())
    }

    /// Chunk, embed in one batch, then write each chunk and its vector in
    /// ordinal order.
    async fn write_chunks(&self, doc: &Document) -> docent_core::Result<usize> {
        let pieces = chunk_text(
            &doc.body,
            self.chunking.max_tokens,
            self.chunking.overlap_tokens,
        );
        if pieces.is_empty() {
            debug!(document = %doc.id, "document produced no chunks");
            return Ok(0);
        }

        let texts: Vec<String> = pieces.iter().map(|p| p.content.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        for (piece, vector) in pieces.iter().zip(&vectors) {
            let chunk = Chunk {
                id: Uuid::new_v4().to_string(),
                document_id: doc.id.clone(),
                chunk_index: piece.index as i64,
                content: piece.content.clone(),
                token_count: piece.token_count as i64,
                hash: sha256_hex(&piece.content),
                embedding: None,
            };
            self.store
                .insert_chunk(&chunk)
                .await
                .map_err(Error::storage)?;
            self.store
                .save_embedding(&chunk.id, vector)
                .await
                .map_err(Error::storage)?;
        }
        Ok(pieces.len())
    }

    /// Roll back everything written for the source and mark it failed.
    async fn fail(&self, data_source_id: &str, err: &Error) {
        warn!(data_source = %data_source_id, error = %err, "ingestion failed, rolling back");
        if let Err(e) = self.store.delete_documents(data_source_id).await {
            warn!(data_source = %data_source_id, error = %e, "rollback failed");
        }
        let message = err.to_string();
        if let Err(e) = self
            .store
            .set_status(data_source_id, DataSourceStatus::Failed, Some(&message))
            .await
        {
            warn!(data_source = %data_source_id, error = %e, "could not record failure");
        }
    }
}

/// A unit of work for [`Ingestor::run`] and [`IngestQueue`].
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub data_source_id: String,
    /// `None` re-crawls URL sources.
    pub input: Option<IngestInput>,
    pub resync: bool,
}

impl IngestJob {
    pub fn ingest(data_source_id: &str, input: IngestInput) -> Self {
        Self {
            data_source_id: data_source_id.to_string(),
            input: Some(input),
            resync: false,
        }
    }

    pub fn resync(data_source_id: &str, input: Option<IngestInput>) -> Self {
        Self {
            data_source_id: data_source_id.to_string(),
            input,
            resync: true,
        }
    }
}

type Envelope = (IngestJob, oneshot::Sender<docent_core::Result<IngestReport>>);

/// Bounded worker pool for background ingestion.
pub struct IngestQueue {
    tx: mpsc::Sender<Envelope>,
    workers: Vec<JoinHandle<()>>,
}

impl IngestQueue {
    /// Spawn `workers` tasks pulling from a shared queue. Must be called
    /// inside a Tokio runtime.
    pub fn start(ingestor: Ingestor, workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Envelope>(workers * 16);
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers)
            .map(|n| {
                let rx = rx.clone();
                let ingestor = ingestor.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some((job, reply)) = next else { break };
                        debug!(worker = n, data_source = %job.data_source_id, "picked up job");
                        let runner = ingestor.clone();
                        let outcome = tokio::spawn(async move { runner.run(job).await })
                            .await
                            .unwrap_or_else(|e| {
                                warn!(worker = n, error = %e, "ingest job aborted");
                                Err(Error::StorageFailed("ingest task aborted".to_string()))
                            });
                        // The submitter may have dropped its ticket.
                        let _ = reply.send(outcome);
                    }
                })
            })
            .collect();

        Self {
            tx,
            workers: handles,
        }
    }

    /// Queue a job. Waits when the queue is full.
    pub async fn submit(&self, job: IngestJob) -> anyhow::Result<IngestTicket> {
        let (reply, rx) = oneshot::channel();
        let data_source_id = job.data_source_id.clone();
        self.tx
            .send((job, reply))
            .await
            .map_err(|_| anyhow::anyhow!("ingest queue is closed"))?;
        Ok(IngestTicket { data_source_id, rx })
    }

    /// Stop accepting jobs and wait for the queued ones to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        for handle in self.workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "ingest worker exited abnormally");
            }
        }
    }
}

/// Awaitable handle on a queued job.
pub struct IngestTicket {
    data_source_id: String,
    rx: oneshot::Receiver<docent_core::Result<IngestReport>>,
}

impl IngestTicket {
    pub fn data_source_id(&self) -> &str {
        &self.data_source_id
    }

    pub async fn wait(self) -> docent_core::Result<IngestReport> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(Error::StorageFailed("ingest worker stopped".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use async_trait::async_trait;
    use docent_core::embedding::EmbeddingProvider;
    use docent_core::store::memory::InMemoryStore;

    struct LengthEmbedder;

    #[async_trait]
    impl EmbeddingProvider for LengthEmbedder {
        fn model_name(&self) -> &str {
            "length"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![1.0, t.len() as f32]).collect())
        }
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl EmbeddingProvider for BrokenEmbedder {
        fn model_name(&self) -> &str {
            "broken"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            bail!("provider returned HTTP 503")
        }
    }

    /// Sleeps before answering so a second attempt can overlap the first.
    struct SlowEmbedder;

    #[async_trait]
    impl EmbeddingProvider for SlowEmbedder {
        fn model_name(&self) -> &str {
            "slow"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(texts.iter().map(|t| vec![1.0, t.len() as f32]).collect())
        }
    }

    /// Panics on any text mentioning "explode".
    struct FragileEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FragileEmbedder {
        fn model_name(&self) -> &str {
            "fragile"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t.contains("explode")) {
                panic!("provider client bug");
            }
            Ok(texts.iter().map(|t| vec![1.0, t.len() as f32]).collect())
        }
    }

    fn ingestor(store: Arc<InMemoryStore>, provider: Arc<dyn EmbeddingProvider>) -> Ingestor {
        Ingestor::new(
            store,
            EmbeddingClient::new(provider),
            ChunkSettings {
                max_tokens: 20,
                overlap_tokens: 2,
            },
            CrawlSettings {
                max_pages: 1,
                max_page_bytes: 64 * 1024,
                timeout: Duration::from_secs(1),
            },
        )
    }

    fn text_file(text: &str) -> IngestInput {
        IngestInput::File {
            bytes: text.as_bytes().to_vec(),
            mime: "text/plain".into(),
        }
    }

    async fn new_source(store: &InMemoryStore) -> DataSource {
        let ds = DataSource::new_file("t1", "Handbook", "handbook.txt", "text/plain", 10);
        store.create_data_source(&ds).await.unwrap();
        ds
    }

    fn long_text() -> String {
        (0..40)
            .map(|i| format!("Sentence number {} talks about refunds.", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn site_pages() -> Vec<CrawledPage> {
        vec![
            CrawledPage {
                url: "https://example.com".into(),
                title: Some("Home".into()),
                text: "Welcome home.".into(),
            },
            CrawledPage {
                url: "https://example.com/faq".into(),
                title: None,
                text: "Questions and answers.".into(),
            },
        ]
    }

    async fn new_site(store: &InMemoryStore) -> DataSource {
        let ds = DataSource::new_url("t1", "Site", "https://example.com");
        store.create_data_source(&ds).await.unwrap();
        ds
    }

    #[tokio::test]
    async fn successful_ingest_completes_with_embeddings() {
        let store = Arc::new(InMemoryStore::new());
        let ds = new_source(&store).await;
        let report = ingestor(store.clone(), Arc::new(LengthEmbedder))
            .ingest(&ds.id, text_file(&long_text()))
            .await
            .unwrap();

        assert_eq!(report.documents, 1);
        assert!(report.chunks > 1);
        let ds = store.get_data_source(&ds.id).await.unwrap().unwrap();
        assert_eq!(ds.status, DataSourceStatus::Complete);
        assert!(ds.last_sync_at.is_some());
        assert!(ds.error.is_none());

        let docs = store.list_documents(&ds.id).await.unwrap();
        let chunks = store.list_chunks(&docs[0].id).await.unwrap();
        assert_eq!(chunks.len(), report.chunks);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as i64);
            assert!(chunk.embedding.is_some());
        }
    }

    #[tokio::test]
    async fn empty_document_writes_no_chunks() {
        let store = Arc::new(InMemoryStore::new());
        let ds = new_source(&store).await;
        let report = ingestor(store.clone(), Arc::new(BrokenEmbedder))
            .ingest(&ds.id, text_file("   \n  "))
            .await
            .unwrap();

        // the broken embedder is never called
        assert_eq!(report.chunks, 0);
        assert_eq!(store.chunk_count(), 0);
        let ds = store.get_data_source(&ds.id).await.unwrap().unwrap();
        assert_eq!(ds.status, DataSourceStatus::Complete);
    }

    #[tokio::test]
    async fn embedding_failure_rolls_back() {
        let store = Arc::new(InMemoryStore::new());
        let ds = new_source(&store).await;
        let err = ingestor(store.clone(), Arc::new(BrokenEmbedder))
            .ingest(&ds.id, text_file(&long_text()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::EmbeddingFailed(_)));
        let ds = store.get_data_source(&ds.id).await.unwrap().unwrap();
        assert_eq!(ds.status, DataSourceStatus::Failed);
        assert!(ds.error.unwrap().contains("503"));
        assert!(store.list_documents(&ds.id).await.unwrap().is_empty());
        assert_eq!(store.chunk_count(), 0);
    }

    #[tokio::test]
    async fn unsupported_format_fails_source() {
        let store = Arc::new(InMemoryStore::new());
        let ds = new_source(&store).await;
        let err = ingestor(store.clone(), Arc::new(LengthEmbedder))
            .ingest(
                &ds.id,
                IngestInput::File {
                    bytes: vec![0, 1, 2],
                    mime: "image/png".into(),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnsupportedFormat(_)));
        let ds = store.get_data_source(&ds.id).await.unwrap().unwrap();
        assert_eq!(ds.status, DataSourceStatus::Failed);
    }

    #[tokio::test]
    async fn processing_source_is_rejected_untouched() {
        let store = Arc::new(InMemoryStore::new());
        let ds = new_source(&store).await;
        assert!(store.begin_processing(&ds.id).await.unwrap());

        let err = ingestor(store.clone(), Arc::new(LengthEmbedder))
            .ingest(&ds.id, text_file("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyProcessing(_)));
        let ds = store.get_data_source(&ds.id).await.unwrap().unwrap();
        assert_eq!(ds.status, DataSourceStatus::Processing);
        assert!(store.list_documents(&ds.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resync_replaces_content() {
        let store = Arc::new(InMemoryStore::new());
        let ds = new_source(&store).await;
        let ingestor = ingestor(store.clone(), Arc::new(LengthEmbedder));

        let first = ingestor.ingest(&ds.id, text_file(&long_text())).await.unwrap();
        let second = ingestor
            .resync(&ds.id, Some(text_file(&long_text())))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.list_documents(&ds.id).await.unwrap().len(), 1);
        assert_eq!(store.chunk_count(), second.chunks);
    }

    #[tokio::test]
    async fn repeated_ingest_replaces_previous_documents() {
        let store = Arc::new(InMemoryStore::new());
        let ds = new_site(&store).await;
        let ingestor = ingestor(store.clone(), Arc::new(LengthEmbedder));

        ingestor
            .ingest(&ds.id, IngestInput::Pages(site_pages()))
            .await
            .unwrap();
        let second = ingestor
            .ingest(&ds.id, IngestInput::Pages(site_pages()))
            .await
            .unwrap();

        assert_eq!(store.list_documents(&ds.id).await.unwrap().len(), 2);
        assert_eq!(store.chunk_count(), second.chunks);
    }

    #[tokio::test]
    async fn overlapping_ingest_and_resync_claim_once() {
        let store = Arc::new(InMemoryStore::new());
        let ds = new_site(&store).await;
        let ingestor = ingestor(store.clone(), Arc::new(SlowEmbedder));

        let (first, second) = tokio::join!(
            ingestor.ingest(&ds.id, IngestInput::Pages(site_pages())),
            ingestor.resync(&ds.id, Some(IngestInput::Pages(site_pages()))),
        );

        let outcomes = [first, second];
        let reports: Vec<&IngestReport> = outcomes.iter().filter_map(|o| o.as_ref().ok()).collect();
        assert_eq!(reports.len(), 1);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, Err(Error::AlreadyProcessing(_)))));

        let ds = store.get_data_source(&ds.id).await.unwrap().unwrap();
        assert_eq!(ds.status, DataSourceStatus::Complete);
        assert_eq!(store.list_documents(&ds.id).await.unwrap().len(), 2);
        assert_eq!(store.chunk_count(), reports[0].chunks);
    }

    #[tokio::test]
    async fn resync_of_claimed_source_keeps_content() {
        let store = Arc::new(InMemoryStore::new());
        let ds = new_site(&store).await;
        let ingestor = ingestor(store.clone(), Arc::new(LengthEmbedder));
        let report = ingestor
            .ingest(&ds.id, IngestInput::Pages(site_pages()))
            .await
            .unwrap();

        // another worker holds the claim
        assert!(store.begin_processing(&ds.id).await.unwrap());
        let err = ingestor
            .resync(&ds.id, Some(IngestInput::Pages(site_pages())))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AlreadyProcessing(_)));
        let ds = store.get_data_source(&ds.id).await.unwrap().unwrap();
        assert_eq!(ds.status, DataSourceStatus::Processing);
        assert_eq!(store.list_documents(&ds.id).await.unwrap().len(), 2);
        assert_eq!(store.chunk_count(), report.chunks);
    }

    #[tokio::test]
    async fn provider_panic_marks_source_failed() {
        let store = Arc::new(InMemoryStore::new());
        let ds = new_source(&store).await;
        let err = ingestor(store.clone(), Arc::new(FragileEmbedder))
            .ingest(&ds.id, text_file("This upload will explode the provider."))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::StorageFailed(_)));
        let ds = store.get_data_source(&ds.id).await.unwrap().unwrap();
        assert_eq!(ds.status, DataSourceStatus::Failed);
        assert!(ds.error.unwrap().contains("aborted"));
        assert!(store.list_documents(&ds.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn queue_worker_survives_panicking_job() {
        let store = Arc::new(InMemoryStore::new());
        let bad = new_source(&store).await;
        let good = new_source(&store).await;
        let queue = IngestQueue::start(ingestor(store.clone(), Arc::new(FragileEmbedder)), 1);

        let first = queue
            .submit(IngestJob::ingest(&bad.id, text_file("Please explode.")))
            .await
            .unwrap();
        assert!(first.wait().await.is_err());

        let second = queue
            .submit(IngestJob::ingest(&good.id, text_file("A short note.")))
            .await
            .unwrap();
        assert_eq!(second.wait().await.unwrap().chunks, 1);
        queue.shutdown().await;

        let bad = store.get_data_source(&bad.id).await.unwrap().unwrap();
        assert_eq!(bad.status, DataSourceStatus::Failed);
    }

    #[tokio::test]
    async fn file_resync_requires_content() {
        let store = Arc::new(InMemoryStore::new());
        let ds = new_source(&store).await;
        let err = ingestor(store.clone(), Arc::new(LengthEmbedder))
            .resync(&ds.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        let ds = store.get_data_source(&ds.id).await.unwrap().unwrap();
        assert_eq!(ds.status, DataSourceStatus::Pending);
    }

    #[tokio::test]
    async fn pages_become_documents() {
        let store = Arc::new(InMemoryStore::new());
        let ds = new_site(&store).await;
        let report = ingestor(store.clone(), Arc::new(LengthEmbedder))
            .ingest(&ds.id, IngestInput::Pages(site_pages()))
            .await
            .unwrap();

        assert_eq!(report.documents, 2);
        let mut titles: Vec<String> = store
            .list_documents(&ds.id)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.title)
            .collect();
        titles.sort();
        assert_eq!(titles, vec!["Home", "https://example.com/faq"]);
    }

    #[tokio::test]
    async fn queue_ticket_resolves() {
        let store = Arc::new(InMemoryStore::new());
        let ds = new_source(&store).await;
        let queue = IngestQueue::start(ingestor(store.clone(), Arc::new(LengthEmbedder)), 2);

        let ticket = queue
            .submit(IngestJob::ingest(&ds.id, text_file("A short note.")))
            .await
            .unwrap();
        assert_eq!(ticket.data_source_id(), ds.id);
        let report = ticket.wait().await.unwrap();
        assert_eq!(report.chunks, 1);
        queue.shutdown().await;

        let ds = store.get_data_source(&ds.id).await.unwrap().unwrap();
        assert_eq!(ds.status, DataSourceStatus::Complete);
    }
}
