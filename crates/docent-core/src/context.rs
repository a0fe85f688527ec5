//! Prompt context assembly and confidence scoring.
//!
//! Turns ranked [`RetrievedChunk`]s into the context block of the system
//! prompt, the citation list returned to clients, and a calibrated
//! confidence estimate.
//!
//! # Confidence
//!
//! With no sources the score is `0.2`. Otherwise it is the average
//! similarity plus a bonus of `0.05` per source at or above `0.8`, the bonus
//! capped at `0.15` and the total at `1.0`.
//!
//! | Score | Label |
//! |-------|-------|
//! | `>= 0.8` | `high` |
//! | `>= 0.5` | `medium` |
//! | otherwise | `low` |

use crate::models::{Confidence, Source};
use crate::retrieval::RetrievedChunk;

/// Context used when retrieval found nothing.
pub const NO_RELEVANT_INFORMATION: &str = "No relevant information found in the knowledge base.";

/// Separator between source blocks in the prompt.
pub const SOURCE_DELIMITER: &str = "\n\n---\n\n";

/// Characters of chunk content kept in a citation preview.
pub const PREVIEW_CHARS: usize = 200;

const EMPTY_SCORE: f64 = 0.2;
const STRONG_MATCH: f64 = 0.8;
const STRONG_MATCH_BONUS: f64 = 0.05;
const MAX_BONUS: f64 = 0.15;

/// Score plus label, as attached to assistant messages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceScore {
    pub label: Confidence,
    pub score: f64,
}

/// Render retrieved chunks as `[Source N: title]` blocks, numbered from 1.
pub fn build_context(chunks: &[RetrievedChunk]) -> String {
    if chunks.is_empty() {
        return NO_RELEVANT_INFORMATION.to_string();
    }
    chunks
        .iter()
        .enumerate()
        .map(|(i, c)| format!("[Source {}: {}]\n{}", i + 1, c.document_title, c.content))
        .collect::<Vec<_>>()
        .join(SOURCE_DELIMITER)
}

pub fn score_confidence(chunks: &[RetrievedChunk]) -> ConfidenceScore {
    if chunks.is_empty() {
        return ConfidenceScore {
            label: Confidence::Low,
            score: EMPTY_SCORE,
        };
    }

    let avg = chunks.iter().map(|c| c.similarity).sum::<f64>() / chunks.len() as f64;
    let strong = chunks.iter().filter(|c| c.similarity >= STRONG_MATCH).count();
    let bonus = (STRONG_MATCH_BONUS * strong as f64).min(MAX_BONUS);
    let score = (avg + bonus).min(1.0);

    ConfidenceScore {
        label: label_for(score),
        score,
    }
}

fn label_for(score: f64) -> Confidence {
    if score >= 0.8 {
        Confidence::High
    } else if score >= 0.5 {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

/// Citation objects for retrieved chunks, in rank order.
pub fn to_sources(chunks: &[RetrievedChunk]) -> Vec<Source> {
    chunks
        .iter()
        .map(|c| Source {
            chunk_id: c.chunk_id.clone(),
            content: preview(&c.content),
            similarity: c.similarity,
            document_title: c.document_title.clone(),
            data_source_name: c.data_source_name.clone(),
        })
        .collect()
}

/// First 200 characters, followed by `...` when anything was cut.
pub fn preview(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
