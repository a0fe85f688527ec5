//! # Docent CLI (`docent`)
//!
//! The `docent` binary manages chatbots and knowledge bases, asks questions
//! from the terminal, and runs the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! docent --config ./config/docent.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docent init` | Create the SQLite database and run schema migrations |
//! | `docent chatbot create` | Create a chatbot for a tenant |
//! | `docent chatbot list` | List a tenant's chatbots |
//! | `docent ingest file <path>` | Ingest one PDF, DOCX, text, Markdown, or HTML file |
//! | `docent ingest url <url>` | Crawl and ingest a web page |
//! | `docent ingest dir <path>` | Ingest every supported file under a directory |
//! | `docent resync <id>` | Re-ingest a data source from scratch |
//! | `docent sources` | List a tenant's data sources and their status |
//! | `docent search "<query>"` | Tenant-scoped semantic search |
//! | `docent ask "<question>"` | Stream an answer from a chatbot |
//! | `docent serve` | Start the HTTP server |
//! | `docent completions <shell>` | Print shell completions |
//!
//! Logs go to stderr. Set `RUST_LOG` or pass `-v` for more detail.

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

use docent::commands::{self, NewChatbot};
use docent::config;
use docent::server;

/// Docent: multi-tenant retrieval-augmented chat.
///
/// All commands except `completions` read a TOML configuration file. See
/// `config/docent.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docent",
    about = "Docent: answer questions from your documents with cited, streamed responses",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docent.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// Manage chatbots.
    Chatbot {
        #[command(subcommand)]
        action: ChatbotAction,
    },

    /// Add content to a tenant's knowledge base.
    Ingest {
        #[command(subcommand)]
        source: IngestSource,
    },

    /// Delete a data source's content and ingest it again.
    ///
    /// URL sources are re-crawled. File sources need `--file`.
    Resync {
        /// Data source id.
        id: String,

        /// New content for a file data source.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// List a tenant's data sources.
    Sources {
        #[arg(long)]
        tenant: String,
    },

    /// Search a tenant's knowledge base.
    Search {
        query: String,

        #[arg(long)]
        tenant: String,

        /// Maximum number of results (defaults to `[retrieval] limit`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Ask a chatbot a question and stream the answer.
    Ask {
        message: String,

        /// Chatbot id.
        #[arg(long)]
        chatbot: String,

        /// Conversation session; reuse it to keep history.
        #[arg(long, default_value = "cli")]
        session: String,
    },

    /// Start the HTTP server on `[server] bind`.
    Serve,

    /// Print shell completions to stdout.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ChatbotAction {
    /// Create a chatbot and print its id.
    Create {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        name: String,
        /// System instructions prepended to every prompt.
        #[arg(long, default_value = "")]
        instructions: String,
        /// Model override (defaults to `[llm] model`).
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
        /// Assistant messages allowed per calendar month.
        #[arg(long)]
        monthly_limit: Option<u64>,
        #[arg(long)]
        welcome: Option<String>,
    },
    /// List a tenant's chatbots.
    List {
        #[arg(long)]
        tenant: String,
    },
}

#[derive(Subcommand)]
enum IngestSource {
    /// Ingest one file.
    File {
        path: PathBuf,
        #[arg(long)]
        tenant: String,
        /// Display name (defaults to the file name).
        #[arg(long)]
        name: Option<String>,
    },
    /// Crawl a URL, following same-host links up to `[ingest] crawl_max_pages`.
    Url {
        url: String,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Ingest every supported file under a directory.
    Dir {
        path: PathBuf,
        #[arg(long)]
        tenant: String,
        /// Only files matching these globs (relative to `path`).
        #[arg(long = "include")]
        include: Vec<String>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "docent=debug" } else { "docent=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "docent", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing(cli.verbose);
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Chatbot { action } => match action {
            ChatbotAction::Create {
                tenant,
                name,
                instructions,
                model,
                temperature,
                max_tokens,
                monthly_limit,
                welcome,
            } => {
                commands::run_chatbot_create(
                    &cfg,
                    NewChatbot {
                        tenant,
                        name,
                        instructions,
                        model,
                        temperature,
                        max_tokens,
                        monthly_limit,
                        welcome,
                    },
                )
                .await?
            }
            ChatbotAction::List { tenant } => commands::run_chatbot_list(&cfg, &tenant).await?,
        },
        Commands::Ingest { source } => match source {
            IngestSource::File { path, tenant, name } => {
                commands::run_ingest_file(&cfg, &tenant, &path, name.as_deref()).await?
            }
            IngestSource::Url { url, tenant, name } => {
                commands::run_ingest_url(&cfg, &tenant, &url, name.as_deref()).await?
            }
            IngestSource::Dir {
                path,
                tenant,
                include,
            } => commands::run_ingest_dir(&cfg, &tenant, &path, &include).await?,
        },
        Commands::Resync { id, file } => commands::run_resync(&cfg, &id, file.as_deref()).await?,
        Commands::Sources { tenant } => commands::run_sources(&cfg, &tenant).await?,
        Commands::Search {
            query,
            tenant,
            limit,
        } => commands::run_search(&cfg, &tenant, &query, limit).await?,
        Commands::Ask {
            message,
            chatbot,
            session,
        } => commands::run_ask(&cfg, &chatbot, &session, &message).await?,
        Commands::Serve => server::run_server(&cfg).await?,
        Commands::Completions { .. } => {
            // Handled above (before config loading)
        }
    }

    Ok(())
}
