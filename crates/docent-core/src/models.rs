//! Core data models used throughout Docent.
//!
//! These types represent the data sources, documents, chunks, chatbots,
//! conversations, and messages that flow through ingestion and chat.
//! Timestamps are Unix seconds, matching how the SQLite store persists them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Kind of ingestion unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSourceKind {
    File,
    Url,
}

/// Lifecycle of a data source. Each ingestion attempt moves
/// `Pending → Processing → (Complete | Failed)` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSourceStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl DataSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceKind::File => "FILE",
            DataSourceKind::Url => "URL",
        }
    }
}

impl DataSourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceStatus::Pending => "PENDING",
            DataSourceStatus::Processing => "PROCESSING",
            DataSourceStatus::Complete => "COMPLETE",
            DataSourceStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for DataSourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "FILE" => Ok(DataSourceKind::File),
            "URL" => Ok(DataSourceKind::Url),
            other => anyhow::bail!("unknown data source kind: {}", other),
        }
    }
}

impl FromStr for DataSourceStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "PENDING" => Ok(DataSourceStatus::Pending),
            "PROCESSING" => Ok(DataSourceStatus::Processing),
            "COMPLETE" => Ok(DataSourceStatus::Complete),
            "FAILED" => Ok(DataSourceStatus::Failed),
            other => anyhow::bail!("unknown data source status: {}", other),
        }
    }
}

impl fmt::Display for DataSourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a data source's content comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DataSourceOrigin {
    #[serde(rename_all = "camelCase")]
    File {
        file_name: String,
        mime_type: String,
        size_bytes: u64,
    },
    Url { url: String },
}

/// A tenant-owned ingestion unit: one uploaded file or one submitted URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    pub id: String,
    pub tenant_id: String,
    pub kind: DataSourceKind,
    pub status: DataSourceStatus,
    pub name: String,
    pub origin: DataSourceOrigin,
    pub error: Option<String>,
    pub last_sync_at: Option<i64>,
    pub created_at: i64,
}

impl DataSource {
    pub fn new_file(tenant_id: &str, name: &str, file_name: &str, mime_type: &str, size: u64) -> Self {
        Self::new(
            tenant_id,
            name,
            DataSourceKind::File,
            DataSourceOrigin::File {
                file_name: file_name.to_string(),
                mime_type: mime_type.to_string(),
                size_bytes: size,
            },
        )
    }

    pub fn new_url(tenant_id: &str, name: &str, url: &str) -> Self {
        Self::new(
            tenant_id,
            name,
            DataSourceKind::Url,
            DataSourceOrigin::Url {
                url: url.to_string(),
            },
        )
    }

    fn new(tenant_id: &str, name: &str, kind: DataSourceKind, origin: DataSourceOrigin) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            kind,
            status: DataSourceStatus::Pending,
            name: name.to_string(),
            origin,
            error: None,
            last_sync_at: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Source URL for URL data sources.
    pub fn url(&self) -> Option<&str> {
        match &self.origin {
            DataSourceOrigin::Url { url } => Some(url),
            DataSourceOrigin::File { .. } => None,
        }
    }
}

/// Normalized plain text extracted from a data source. One file produces
/// one document; one crawled page produces one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub data_source_id: String,
    pub title: String,
    pub body: String,
    /// SHA-256 of `body`.
    pub content_hash: String,
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

impl Document {
    pub fn new(data_source_id: &str, title: &str, body: String, metadata: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            data_source_id: data_source_id.to_string(),
            title: title.to_string(),
            content_hash: sha256_hex(&body),
            body,
            metadata,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// A slice of a document's text, the unit of embedding and retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub token_count: i64,
    pub hash: String,
    /// `None` until the embedding pass writes it; such chunks are never
    /// retrieval candidates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// A tenant-configured assistant. Its settings become the
/// `GenerationConfig` of every answer it produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chatbot {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub instructions: String,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Assistant messages allowed per calendar month, if limited.
    pub monthly_message_limit: Option<u64>,
    pub welcome_message: Option<String>,
    pub created_at: i64,
}

impl Chatbot {
    pub fn new(tenant_id: &str, name: &str, instructions: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            instructions: instructions.to_string(),
            model: None,
            temperature: None,
            max_tokens: None,
            monthly_message_limit: None,
            welcome_message: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// A session between one end user and one chatbot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub chatbot_id: String,
    pub session_id: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "USER" => Ok(Role::User),
            "ASSISTANT" => Ok(Role::Assistant),
            other => anyhow::bail!("unknown message role: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reaction {
    Up,
    Down,
}

impl Reaction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reaction::Up => "up",
            Reaction::Down => "down",
        }
    }
}

impl FromStr for Reaction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "up" => Ok(Reaction::Up),
            "down" => Ok(Reaction::Down),
            other => anyhow::bail!("unknown reaction: {}", other),
        }
    }
}

/// Calibrated confidence label attached to an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

impl FromStr for Confidence {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "high" => Ok(Confidence::High),
            "medium" => Ok(Confidence::Medium),
            "low" => Ok(Confidence::Low),
            other => anyhow::bail!("unknown confidence label: {}", other),
        }
    }
}

/// Citation attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub chunk_id: String,
    /// Preview of the chunk, at most 200 characters plus `...`.
    pub content: String,
    pub similarity: f64,
    pub document_title: String,
    pub data_source_name: String,
}

/// One conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<Source>,
    pub confidence: Option<Confidence>,
    pub confidence_score: Option<f64>,
    pub reaction: Option<Reaction>,
    pub created_at: i64,
}

impl Message {
    pub fn user(conversation_id: &str, content: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role: Role::User,
            content: content.to_string(),
            sources: Vec::new(),
            confidence: None,
            confidence_score: None,
            reaction: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn assistant(
        conversation_id: &str,
        content: String,
        sources: Vec<Source>,
        confidence: Confidence,
        confidence_score: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role: Role::Assistant,
            content,
            sources,
            confidence: Some(confidence),
            confidence_score: Some(confidence_score),
            reaction: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Hex-encoded SHA-256 of a string.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Format a Unix timestamp as ISO 8601.
pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
