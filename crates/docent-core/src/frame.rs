//! Stream frames emitted by the generator.
//!
//! A well-formed answer stream is one `Metadata` frame, any number of
//! `Content` frames, a `MessageId` frame once the answer is persisted, an
//! optional `Error` frame, and a final `Done`. [`StreamFrame::to_sse_data`]
//! renders the payload of an SSE `data:` line.

use serde::Serialize;
use serde_json::json;

use crate::models::{Confidence, Source};

/// Terminal SSE payload.
pub const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Metadata {
        sources: Vec<Source>,
        confidence: Confidence,
        confidence_score: f64,
    },
    Content(String),
    MessageId(String),
    Error(String),
    Done,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetadataPayload<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    sources: &'a [Source],
    confidence: Confidence,
    confidence_score: f64,
}

impl StreamFrame {
    /// JSON (or `[DONE]`) for an SSE `data:` line.
    pub fn to_sse_data(&self) -> String {
        match self {
            StreamFrame::Metadata {
                sources,
                confidence,
                confidence_score,
            } => serde_json::to_string(&MetadataPayload {
                kind: "metadata",
                sources,
                confidence: *confidence,
                confidence_score: *confidence_score,
            })
            .unwrap_or_else(|_| json!({ "type": "metadata" }).to_string()),
            StreamFrame::Content(text) => json!({ "content": text }).to_string(),
            StreamFrame::MessageId(id) => json!({ "messageId": id }).to_string(),
            StreamFrame::Error(message) => json!({ "error": message }).to_string(),
            StreamFrame::Done => DONE_MARKER.to_string(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamFrame::Done)
    }
}
