//! # Docent Core
//!
//! Shared, runtime-agnostic logic for Docent: data models, the overlapping
//! text chunker, store abstractions, the tenant-scoped retriever, context
//! assembly with confidence scoring, the embedding client, and the frames
//! of the streaming chat protocol.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or HTTP client.
//! Concrete stores, providers, and the streaming generator live in the
//! `docent` app crate.

pub mod chunk;
pub mod context;
pub mod embedding;
pub mod error;
pub mod frame;
pub mod models;
pub mod retrieval;
pub mod store;

pub use error::{Error, Result};
