//! Error taxonomy for the RAG pipeline.
//!
//! Store traits and application plumbing use `anyhow`; component
//! boundaries (parser, embedding client, ingestion, retrieval, generation,
//! chat) report one of these variants so callers can decide between
//! recording a failure, degrading, or surfacing it to the end user.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The parser does not handle this MIME type. Not retryable without
    /// changing the input.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The input claimed a supported format but could not be decoded.
    #[error("failed to parse document: {0}")]
    ParseFailed(String),

    /// The embedding provider rejected the request, timed out, or returned
    /// a malformed response. Retryable by re-triggering ingestion.
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    /// The store could not write a document, chunk, or embedding.
    #[error("storage failed: {0}")]
    StorageFailed(String),

    /// Similarity search could not execute.
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    /// The language model call failed.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// The tenant is over its message limit for the current period.
    #[error("quota exceeded: {used} of {limit} messages used this period")]
    QuotaExceeded {
        /// Messages already counted in the period.
        used: u64,
        /// Configured limit for the period.
        limit: u64,
    },

    /// Another ingestion attempt holds the data source.
    #[error("data source {0} is already processing")]
    AlreadyProcessing(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Wrap a store error raised while writing.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Error::StorageFailed(err.to_string())
    }

    /// Stable machine-readable code, used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::UnsupportedFormat(_) => "unsupported_format",
            Error::ParseFailed(_) => "parse_failed",
            Error::EmbeddingFailed(_) => "embedding_failed",
            Error::StorageFailed(_) => "storage_failed",
            Error::RetrievalUnavailable(_) => "retrieval_unavailable",
            Error::GenerationFailed(_) => "generation_failed",
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::AlreadyProcessing(_) => "already_processing",
            Error::NotFound(_) => "not_found",
            Error::InvalidInput(_) => "bad_request",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_message_names_usage() {
        let err = Error::QuotaExceeded {
            used: 100,
            limit: 100,
        };
        assert_eq!(
            err.to_string(),
            "quota exceeded: 100 of 100 messages used this period"
        );
        assert_eq!(err.code(), "quota_exceeded");
    }
}
