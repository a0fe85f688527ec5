//! # Docent
//!
//! Multi-tenant retrieval-augmented chat.
//!
//! A tenant uploads documents or submits URLs; their text is chunked,
//! embedded, and stored per tenant. Chat questions are answered by
//! retrieving the closest chunks, assembling them into a prompt with a
//! confidence score, and streaming the model's answer back while the same
//! text is stored with its citations.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌──────────┐
//! │ File / URL  │──▶│  Ingest pipeline │──▶│  SQLite  │
//! │ parse/crawl │   │ chunk+embed      │   │ BLOB vec │
//! └─────────────┘   └──────────────────┘   └────┬─────┘
//!                                               │
//!             question ──▶ embed ──▶ retrieve ◀─┘
//!                                       │
//!                               context + confidence
//!                                       ▼
//!                              ┌─────────────────┐
//!                              │ generator relay │──▶ SSE / CLI
//!                              └────────┬────────┘
//!                                       ▼
//!                                stored message
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docent init
//! docent chatbot create --tenant acme --name Helper
//! docent ingest file --tenant acme ./handbook.pdf
//! docent ask --chatbot <id> "What is the refund policy?"
//! docent serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the store traits |
//! | [`extract`] | PDF, DOCX, text, and HTML parsing |
//! | [`crawl`] | Same-host web crawling |
//! | [`embedding`] | Embedding providers |
//! | [`llm`] | Streaming chat model providers |
//! | [`ingest`] | Ingestion pipeline and worker queue |
//! | [`generate`] | Streaming answer relay |
//! | [`chat`] | Query-time chat service |
//! | [`rate_limit`] | Fixed-window rate limiter |
//! | [`server`] | HTTP API |
//! | [`commands`] | CLI command implementations |
//!
//! Runtime-independent pieces (models, chunker, retriever, context
//! assembly, store traits) live in [`docent_core`].

pub mod chat;
pub mod commands;
pub mod config;
pub mod crawl;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod generate;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod rate_limit;
pub mod server;
pub mod sqlite_store;

pub use docent_core;
