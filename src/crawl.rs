//! Web page fetching and HTML-to-text normalization for URL data sources.
//!
//! [`crawl`] walks breadth-first from a start URL over links on the same
//! host, up to `max_pages`, and returns one [`CrawledPage`] per page that
//! produced text. The start page must succeed; later pages that fail are
//! logged and skipped. Bodies larger than `max_page_bytes` are rejected
//! before they are buffered in full.

use std::collections::{HashSet, VecDeque};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::Url;
use thiserror::Error;
use tracing::{debug, warn};

use crate::extract;

const USER_AGENT: &str = concat!("docent/", env!("CARGO_PKG_VERSION"), " (+crawler)");

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("invalid URL '{0}': must be an absolute http(s) URL")]
    InvalidUrl(String),
    #[error("fetching {url} failed: {message}")]
    Fetch { url: String, message: String },
    #[error("fetching {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("{url} is larger than {limit} bytes")]
    TooLarge { url: String, limit: usize },
    #[error(transparent)]
    Extract(#[from] extract::ExtractError),
}

impl From<CrawlError> for docent_core::Error {
    fn from(err: CrawlError) -> Self {
        match err {
            CrawlError::InvalidUrl(_) => docent_core::Error::InvalidInput(err.to_string()),
            CrawlError::Extract(inner) => inner.into(),
            other => docent_core::Error::ParseFailed(other.to_string()),
        }
    }
}

/// One fetched page, already reduced to text.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawledPage {
    pub url: String,
    pub title: Option<String>,
    pub text: String,
}

/// Text and title of an HTML document.
#[derive(Debug, Clone, PartialEq)]
pub struct HtmlText {
    pub title: Option<String>,
    pub text: String,
}

/// Parse and check that `raw` is an absolute http(s) URL.
pub fn validate_url(raw: &str) -> Result<Url, CrawlError> {
    let url = Url::parse(raw.trim()).map_err(|_| CrawlError::InvalidUrl(raw.to_string()))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(CrawlError::InvalidUrl(raw.to_string())),
    }
}

pub async fn crawl(
    start: &str,
    max_pages: usize,
    max_page_bytes: usize,
    timeout: Duration,
) -> Result<Vec<CrawledPage>, CrawlError> {
    let start = validate_url(start)?;
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| CrawlError::Fetch {
            url: start.to_string(),
            message: e.to_string(),
        })?;

    let mut queue = VecDeque::from([start.clone()]);
    let mut seen: HashSet<String> = HashSet::from([start.to_string()]);
    let mut pages = Vec::new();

    while let Some(url) = queue.pop_front() {
        if pages.len() >= max_pages.max(1) {
            break;
        }
        let is_start = url == start;
        let (page, links) = match fetch_page(&client, &url, max_page_bytes).await {
            Ok(fetched) => fetched,
            Err(e) if is_start => return Err(e),
            Err(e) => {
                warn!(url = %url, error = %e, "skipping page");
                continue;
            }
        };
        debug!(url = %url, chars = page.text.len(), links = links.len(), "fetched page");

        for link in links {
            if link.host_str() == start.host_str() && seen.insert(link.to_string()) {
                queue.push_back(link);
            }
        }
        if !page.text.trim().is_empty() {
            pages.push(page);
        }
    }

    Ok(pages)
}

async fn fetch_page(
    client: &reqwest::Client,
    url: &Url,
    max_bytes: usize,
) -> Result<(CrawledPage, Vec<Url>), CrawlError> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| fetch_err(url, e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(CrawlError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .map(extract::normalize_mime)
        .unwrap_or_else(|| extract::MIME_HTML.to_string());
    let bytes = read_capped(response, url, max_bytes).await?;

    if content_type == extract::MIME_HTML || content_type == "application/xhtml+xml" {
        let html = String::from_utf8_lossy(&bytes);
        let parsed = html_to_text(&html);
        let links = extract_links(&html, url);
        return Ok((
            CrawledPage {
                url: url.to_string(),
                title: parsed.title,
                text: parsed.text,
            },
            links,
        ));
    }

    let parsed = extract::parse_blocking(bytes, content_type).await?;
    Ok((
        CrawledPage {
            url: url.to_string(),
            title: parsed.title,
            text: parsed.text,
        },
        Vec::new(),
    ))
}

fn fetch_err(url: &Url, e: reqwest::Error) -> CrawlError {
    CrawlError::Fetch {
        url: url.to_string(),
        message: e.to_string(),
    }
}

/// Read the body chunk by chunk, giving up as soon as it passes `limit`.
async fn read_capped(
    mut response: reqwest::Response,
    url: &Url,
    limit: usize,
) -> Result<Vec<u8>, CrawlError> {
    let too_large = || CrawlError::TooLarge {
        url: url.to_string(),
        limit,
    };
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(too_large());
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(|e| fetch_err(url, e))? {
        if body.len() + chunk.len() > limit {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

struct Patterns {
    comment: Regex,
    hidden: Regex,
    title: Regex,
    block: Regex,
    tag: Regex,
    numeric_entity: Regex,
    href: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            comment: Regex::new(r"(?s)<!--.*?-->")?,
            hidden: Regex::new(
                r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>|<noscript\b.*?</noscript\s*>|<template\b.*?</template\s*>|<head\b.*?</head\s*>",
            )?,
            title: Regex::new(r"(?is)<title[^>]*>(.*?)</title\s*>")?,
            block: Regex::new(
                r"(?i)</?(?:p|div|section|article|header|footer|nav|main|aside|h[1-6]|li|ul|ol|dl|dt|dd|table|tr|blockquote|pre|figure|figcaption|br|hr)\b[^>]*>",
            )?,
            tag: Regex::new(r"(?s)<[^>]*>")?,
            numeric_entity: Regex::new(r"&#(?:[xX]([0-9a-fA-F]+)|([0-9]+));")?,
            href: Regex::new(r#"(?is)<a\b[^>]*?\bhref\s*=\s*["']([^"']+)["']"#)?,
        })
    }
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns::compile().ok()).as_ref()
}

/// Strip an HTML document to readable text.
///
/// Comments, scripts, styles and the `<head>` are dropped, block elements
/// become paragraph breaks, remaining tags are removed, and entities are
/// decoded. Runs of spaces collapse; paragraphs are separated by one blank
/// line.
pub fn html_to_text(html: &str) -> HtmlText {
    let Some(p) = patterns() else {
        return HtmlText {
            title: None,
            text: collapse_whitespace(html),
        };
    };

    let without_comments = p.comment.replace_all(html, "");
    let title = p
        .title
        .captures(&without_comments)
        .and_then(|c| c.get(1))
        .map(|m| collapse_whitespace(&decode_entities(p, m.as_str())))
        .filter(|t| !t.is_empty());

    let visible = p.hidden.replace_all(&without_comments, " ");
    let blocks = p.block.replace_all(&visible, "\n\n");
    let stripped = p.tag.replace_all(&blocks, "");
    let decoded = decode_entities(p, &stripped);

    HtmlText {
        title,
        text: normalize_paragraphs(&decoded),
    }
}

fn decode_entities(p: &Patterns, text: &str) -> String {
    let numeric = p.numeric_entity.replace_all(text, |caps: &regex::Captures| {
        let code = match (caps.get(1), caps.get(2)) {
            (Some(hex), _) => u32::from_str_radix(hex.as_str(), 16).ok(),
            (_, Some(dec)) => dec.as_str().parse::<u32>().ok(),
            _ => None,
        };
        code.and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });
    numeric
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_paragraphs(text: &str) -> String {
    let mut out = String::new();
    let mut pending_break = false;
    for line in text.lines() {
        let line = collapse_whitespace(line);
        if line.is_empty() {
            pending_break = true;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if pending_break { "\n\n" } else { "\n" });
        }
        out.push_str(&line);
        pending_break = false;
    }
    out
}

/// Absolute http(s) links in `html`, resolved against `base`, fragments removed.
fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    let Some(p) = patterns() else {
        return Vec::new();
    };
    p.href
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .filter_map(|m| base.join(m.as_str().trim()).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .map(|mut u| {
            u.set_fragment(None);
            u
        })
        .collect()
}
