//! Paragraph-boundary text chunker with overlap.
//!
//! Splits document text into [`TextChunk`]s that respect a `max_tokens`
//! budget, carrying a trailing overlap from each chunk into the next so a
//! passage cut at a boundary stays retrievable from either side.
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` and `overlap_tokens` to characters (4 chars ≈ 1 token).
//! 2. Normalize line endings and collapse runs of blank lines to one.
//! 3. Split on blank lines and accumulate paragraphs into a buffer while it
//!    stays within `max_chars`.
//! 4. On overflow, flush the buffer and seed the next one with the trailing
//!    `overlap_chars` of the flushed text plus the new paragraph.
//! 5. A buffer that is still too long is hard-split: at the last `". "` in
//!    the final 20% of the window, else the last whitespace, else a plain
//!    character cut. Each piece carries its trailing overlap forward.
//!
//! Lengths are counted in `char`s, so multibyte text is never split inside
//! a code point. Whitespace-only input yields no chunks.
//!
//! # Example
//!
//! ```rust
//! use docent_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("Hello world.\n\nSecond paragraph.", 500, 50);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].index, 0);
//! ```

/// Default chunk budget in tokens.
pub const DEFAULT_MAX_TOKENS: usize = 500;

/// Default overlap carried between consecutive chunks, in tokens.
pub const DEFAULT_OVERLAP_TOKENS: usize = 50;

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// A passage produced by [`chunk_text`], before it is bound to a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Zero-based position within the document.
    pub index: usize,
    pub content: String,
    /// `ceil(chars / 4)`.
    pub token_count: usize,
}

/// Cheap token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Split text into overlapping chunks of at most `max_tokens * 4` characters.
///
/// Pure function of its inputs: the same text and parameters always give
/// the same chunks. The overlap is clamped to half of the window so every
/// split makes progress.
pub fn chunk_text(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<TextChunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = (overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2);

    let normalized = normalize(text);
    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();

    for para in normalized.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        if buf.is_empty() {
            buf.push_str(para);
        } else if char_len(&buf) + 2 + char_len(para) <= max_chars {
            buf.push_str("\n\n");
            buf.push_str(para);
        } else {
            let tail = overlap_tail(&buf, overlap_chars);
            pieces.push(std::mem::take(&mut buf));
            if !tail.is_empty() {
                buf.push_str(&tail);
                buf.push_str("\n\n");
            }
            buf.push_str(para);
        }

        if char_len(&buf) > max_chars {
            let mut split = hard_split(&buf, max_chars, overlap_chars);
            buf = split.pop().unwrap_or_default();
            pieces.extend(split);
        }
    }

    if !buf.trim().is_empty() {
        pieces.push(buf);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, content)| TextChunk {
            index,
            token_count: estimate_tokens(&content),
            content,
        })
        .collect()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Unify line endings, strip trailing spaces per line, and collapse three or
/// more consecutive newlines into a single blank line.
fn normalize(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut run = 0usize;
    for (i, line) in unified.split('\n').enumerate() {
        if i > 0 {
            run += 1;
            if run <= 2 {
                out.push('\n');
            }
        }
        let line = line.trim_end();
        if !line.is_empty() {
            run = 0;
            out.push_str(line);
        }
    }
    out
}

/// The last `n` characters of `text`, with leading whitespace removed.
fn overlap_tail(text: &str, n: usize) -> String {
    if n == 0 {
        return String::new();
    }
    let total = char_len(text);
    let skip = total.saturating_sub(n);
    text.chars().skip(skip).collect::<String>().trim_start().to_string()
}

/// Split text longer than `max_chars` into pieces of at most `max_chars`,
/// each starting with the trailing `overlap_chars` of the previous piece.
/// The last element is the (possibly short) remainder.
fn hard_split(text: &str, max_chars: usize, overlap_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut pieces = Vec::new();
    let mut start = 0usize;

    while chars.len() - start > max_chars {
        let window = &chars[start..start + max_chars];
        let cut = find_cut(window, overlap_chars);
        let piece: String = window[..cut].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        start += cut - overlap_chars;
        while overlap_chars == 0 && start < chars.len() && chars[start].is_whitespace() {
            start += 1;
        }
    }

    let rest: String = chars[start..].iter().collect();
    pieces.push(rest.trim().to_string());
    pieces
}

/// Choose where to end a piece inside `window`. The result is always
/// greater than `overlap_chars` so the next piece starts further along.
fn find_cut(window: &[char], overlap_chars: usize) -> usize {
    let len = window.len();
    let floor = overlap_chars + 1;

    let sentence_from = (len - len / 5).max(floor);
    for i in (sentence_from..len.saturating_sub(1)).rev() {
        if window[i] == '.' && window[i + 1] == ' ' {
            return i + 1;
        }
    }

    for i in (floor..len).rev() {
        if window[i].is_whitespace() {
            return i;
        }
    }

    len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", 500, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].content, "Hello, world!");
        assert_eq!(chunks[0].token_count, 4);
    }

    #[test]
    fn test_empty_and_whitespace_yield_nothing() {
        assert!(chunk_text("", 500, 50).is_empty());
        assert!(chunk_text("   \n\n\t \r\n  ", 500, 50).is_empty());
    }

    #[test]
    fn test_single_paragraph_under_default_budget() {
        let text = "a".repeat(1200);
        let chunks = chunk_text(&text, DEFAULT_MAX_TOKENS, DEFAULT_OVERLAP_TOKENS);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].token_count, 300);
    }

    #[test]
    fn test_line_endings_and_blank_runs_normalized() {
        let chunks = chunk_text("First\r\n\r\n\r\n\r\nSecond\rline", 500, 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "First\n\nSecond\nline");
    }

    #[test]
    fn test_paragraphs_flush_with_overlap() {
        let text = (0..30)
            .map(|i| format!("Paragraph number {} talks about topic {}.", i, i * 7))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text(&text, 40, 5);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let last_word = pair[0].content.split_whitespace().last().unwrap();
            assert!(
                pair[1].content.contains(last_word),
                "chunk {:?} does not carry overlap from {:?}",
                pair[1].content,
                pair[0].content
            );
        }
    }

    #[test]
    fn test_every_chunk_within_budget() {
        let mut text = String::new();
        for i in 0..12 {
            text.push_str(&words(20 + i * 37));
            text.push_str(".\n\n");
        }
        for (max, overlap) in [(10, 2), (25, 5), (64, 16), (500, 50)] {
            let chunks = chunk_text(&text, max, overlap);
            assert!(!chunks.is_empty());
            for c in &chunks {
                assert!(
                    c.content.chars().count() <= max * 4,
                    "chunk of {} chars exceeds {}",
                    c.content.chars().count(),
                    max * 4
                );
            }
        }
    }

    #[test]
    fn test_oversized_paragraph_prefers_sentence_end() {
        // 100-char window; a sentence ends inside the final 20%.
        let first = format!("{}. ", "x".repeat(84));
        let text = format!("{}{}", first, "tail ".repeat(30));
        let chunks = chunk_text(&text, 25, 2);
        assert!(chunks.len() > 1);
        assert!(chunks[0].content.ends_with('.'), "{:?}", chunks[0].content);
    }

    #[test]
    fn test_unbreakable_text_hard_cut() {
        let text = "z".repeat(250);
        let chunks = chunk_text(&text, 25, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].content.len(), 100);
        assert_eq!(chunks[1].content.len(), 100);
        assert_eq!(chunks[2].content.len(), 50);
    }

    #[test]
    fn test_oversized_paragraph_pieces_overlap() {
        let text = words(400);
        let chunks = chunk_text(&text, 50, 10);
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            let last_word = pair[0].content.split_whitespace().last().unwrap();
            assert!(pair[1].content.contains(last_word));
        }
    }

    #[test]
    fn test_chunk_indices_contiguous() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text(&text, 10, 2);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i, "Index mismatch at position {}", i);
        }
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘\n\n".repeat(10);
        let chunks = chunk_text(&text, 3, 1);
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(c.content.chars().count() <= 12);
        }
    }

    #[test]
    fn test_deterministic() {
        let text = format!("Alpha\n\nBeta\n\n{}\n\nDelta", words(300));
        let c1 = chunk_text(&text, 20, 5);
        let c2 = chunk_text(&text, 20, 5);
        assert_eq!(c1, c2);
    }
}
