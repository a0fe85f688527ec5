//! CLI command implementations.
//!
//! Each `run_*` function backs one `docent` subcommand. Results go to
//! stdout in plain columns; diagnostics go through `tracing` to stderr.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSetBuilder};
use tokio::sync::mpsc;
use walkdir::WalkDir;

use docent_core::frame::StreamFrame;
use docent_core::models::{format_ts_iso, Chatbot, DataSource};
use docent_core::store::{ChatStore, KnowledgeStore};

use crate::chat::{ChatQuery, ChatService};
use crate::config::Config;
use crate::crawl;
use crate::db;
use crate::embedding;
use crate::extract;
use crate::ingest::{IngestInput, IngestJob, Ingestor};
use crate::migrate;
use crate::sqlite_store::SqliteStore;

async fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

async fn open_ingestor(config: &Config) -> Result<(Arc<SqliteStore>, Ingestor)> {
    let store = open_store(config).await?;
    let ingestor = Ingestor::from_config(
        config,
        store.clone(),
        embedding::create_client(&config.embedding)?,
    );
    Ok((store, ingestor))
}

async fn open_chat(config: &Config) -> Result<ChatService> {
    let store = open_store(config).await?;
    ChatService::from_config(config, store.clone(), store)
}

pub async fn run_init(config: &Config) -> Result<()> {
    migrate::run_migrations(config).await?;
    println!("Database initialized at {}", config.db.path.display());
    Ok(())
}

/// Options for `docent chatbot create`.
#[derive(Debug, Default)]
pub struct NewChatbot {
    pub tenant: String,
    pub name: String,
    pub instructions: String,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub monthly_limit: Option<u64>,
    pub welcome: Option<String>,
}

pub async fn run_chatbot_create(config: &Config, opts: NewChatbot) -> Result<()> {
    let store = open_store(config).await?;
    let mut bot = Chatbot::new(&opts.tenant, &opts.name, &opts.instructions);
    bot.model = opts.model;
    bot.temperature = opts.temperature;
    bot.max_tokens = opts.max_tokens;
    bot.monthly_message_limit = opts.monthly_limit;
    bot.welcome_message = opts.welcome;
    store.upsert_chatbot(&bot).await?;
    println!("{}", bot.id);
    Ok(())
}

pub async fn run_chatbot_list(config: &Config, tenant: &str) -> Result<()> {
    let store = open_store(config).await?;
    let bots = store.list_chatbots(tenant).await?;
    if bots.is_empty() {
        println!("No chatbots for tenant '{}'.", tenant);
        return Ok(());
    }
    println!("{:<38} {:<24} {:<10} LIMIT", "ID", "NAME", "MODEL");
    for bot in bots {
        println!(
            "{:<38} {:<24} {:<10} {}",
            bot.id,
            bot.name,
            bot.model.as_deref().unwrap_or("default"),
            bot.monthly_message_limit
                .map(|l| l.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

fn file_source(tenant: &str, path: &Path, name: Option<&str>) -> Result<(DataSource, IngestInput)> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mime = extract::mime_for_path(path);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let ds = DataSource::new_file(
        tenant,
        name.unwrap_or(&file_name),
        &file_name,
        mime,
        bytes.len() as u64,
    );
    let input = IngestInput::File {
        bytes,
        mime: mime.to_string(),
    };
    Ok((ds, input))
}

pub async fn run_ingest_file(config: &Config, tenant: &str, path: &Path, name: Option<&str>) -> Result<()> {
    let (store, ingestor) = open_ingestor(config).await?;
    let (ds, input) = file_source(tenant, path, name)?;
    store.create_data_source(&ds).await?;

    let report = ingestor.ingest(&ds.id, input).await?;
    println!("ingest {}", path.display());
    println!("  data source: {}", ds.id);
    println!("  documents: {}", report.documents);
    println!("  chunks: {}", report.chunks);
    println!("ok");
    Ok(())
}

pub async fn run_ingest_url(config: &Config, tenant: &str, url: &str, name: Option<&str>) -> Result<()> {
    let url = crawl::validate_url(url)?;
    let (store, ingestor) = open_ingestor(config).await?;
    let ds = DataSource::new_url(tenant, name.unwrap_or(url.as_str()), url.as_str());
    store.create_data_source(&ds).await?;

    let input = IngestInput::Crawl {
        url: url.to_string(),
    };
    let report = ingestor.ingest(&ds.id, input).await?;
    println!("ingest {}", url);
    println!("  data source: {}", ds.id);
    println!("  pages: {}", report.documents);
    println!("  chunks: {}", report.chunks);
    println!("ok");
    Ok(())
}

/// Ingest every supported file under `root`, one data source per file.
/// Failures are reported per file and do not stop the others.
pub async fn run_ingest_dir(
    config: &Config,
    tenant: &str,
    root: &Path,
    include: &[String],
) -> Result<()> {
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    let mut globs = GlobSetBuilder::new();
    for pattern in include {
        globs.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    let globs = globs.build()?;

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if !include.is_empty() && !globs.is_match(rel) {
            continue;
        }
        if extract::is_supported(extract::mime_for_path(entry.path())) {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();

    let (store, ingestor) = open_ingestor(config).await?;
    let mut jobs = Vec::with_capacity(files.len());
    let mut names = Vec::with_capacity(files.len());
    for path in &files {
        let rel = path.strip_prefix(root).unwrap_or(path).display().to_string();
        let (ds, input) = file_source(tenant, path, Some(&rel))?;
        store.create_data_source(&ds).await?;
        jobs.push(IngestJob::ingest(&ds.id, input));
        names.push(rel);
    }

    let outcomes = ingestor.ingest_batch(jobs).await;
    let mut failed = 0usize;
    println!("ingest {}", root.display());
    for (name, (_, outcome)) in names.iter().zip(&outcomes) {
        match outcome {
            Ok(report) => println!("  {:<40} ok      {} chunks", name, report.chunks),
            Err(e) => {
                failed += 1;
                println!("  {:<40} failed  {}", name, e);
            }
        }
    }
    println!("  files: {}  failed: {}", outcomes.len(), failed);
    println!("ok");
    Ok(())
}

pub async fn run_resync(config: &Config, id: &str, file: Option<&Path>) -> Result<()> {
    let (_store, ingestor) = open_ingestor(config).await?;
    let input = match file {
        Some(path) => {
            let bytes =
                std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
            Some(IngestInput::File {
                bytes,
                mime: extract::mime_for_path(path).to_string(),
            })
        }
        None => None,
    };
    let report = ingestor.resync(id, input).await?;
    println!("resync {}", id);
    println!("  documents: {}", report.documents);
    println!("  chunks: {}", report.chunks);
    println!("ok");
    Ok(())
}

pub async fn run_sources(config: &Config, tenant: &str) -> Result<()> {
    let store = open_store(config).await?;
    let sources = store.list_data_sources(tenant).await?;
    if sources.is_empty() {
        println!("No data sources for tenant '{}'.", tenant);
        return Ok(());
    }
    println!(
        "{:<38} {:<5} {:<11} {:<21} NAME",
        "ID", "KIND", "STATUS", "LAST SYNC"
    );
    for ds in sources {
        println!(
            "{:<38} {:<5} {:<11} {:<21} {}",
            ds.id,
            ds.kind.as_str(),
            ds.status.as_str(),
            ds.last_sync_at
                .map(format_ts_iso)
                .unwrap_or_else(|| "-".to_string()),
            ds.name
        );
        if let Some(err) = ds.error {
            println!("    error: {}", err);
        }
    }
    Ok(())
}

pub async fn run_search(config: &Config, tenant: &str, query: &str, limit: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        bail!("query must not be empty");
    }
    let chat = open_chat(config).await?;
    let hits = chat.search(tenant, query, limit).await?;
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} ({})",
            i + 1,
            hit.similarity,
            hit.document_title,
            hit.data_source_name
        );
        println!("    {}", docent_core::context::preview(&hit.content).replace('\n', " "));
    }
    Ok(())
}

/// Stream an answer to stdout, then list its sources.
pub async fn run_ask(config: &Config, chatbot: &str, session: &str, message: &str) -> Result<()> {
    let chat = open_chat(config).await?;
    let prepared = chat
        .prepare(&ChatQuery {
            chatbot_id: chatbot.to_string(),
            session_id: session.to_string(),
            message: message.to_string(),
        })
        .await?;

    let (tx, mut rx) = mpsc::channel::<StreamFrame>(32);
    let relay = tokio::spawn(async move {
        let mut tx = tx;
        prepared.relay(&mut tx).await
    });

    let mut stdout = std::io::stdout();
    let mut sources = Vec::new();
    let mut confidence = None;
    let mut failure = None;
    while let Some(frame) = rx.recv().await {
        match frame {
            StreamFrame::Metadata {
                sources: s,
                confidence: label,
                confidence_score,
            } => {
                sources = s;
                confidence = Some((label, confidence_score));
            }
            StreamFrame::Content(text) => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            StreamFrame::Error(e) => failure = Some(e),
            StreamFrame::MessageId(_) | StreamFrame::Done => {}
        }
    }
    writeln!(stdout)?;
    relay.await??;

    if let Some((label, score)) = confidence {
        println!();
        println!("confidence: {} ({:.2})", label.as_str(), score);
    }
    for (i, source) in sources.iter().enumerate() {
        println!(
            "[{}] {} - {} ({:.2})",
            i + 1,
            source.document_title,
            source.data_source_name,
            source.similarity
        );
    }
    if let Some(e) = failure {
        bail!("generation failed: {}", e);
    }
    Ok(())
}
