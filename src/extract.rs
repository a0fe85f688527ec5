//! Document parsing: raw bytes plus a declared MIME type in, plain UTF-8
//! text and format metadata out.
//!
//! | MIME type | Backend |
//! |-----------|---------|
//! | `application/pdf` | `pdf-extract` for text, `lopdf` for page count, title, author |
//! | DOCX, `application/msword` | `zip` + `quick-xml` over `word/document.xml` |
//! | `text/plain`, `text/markdown` | lossy UTF-8, BOM stripped |
//! | `text/html` | [`crate::crawl::html_to_text`] |
//!
//! MIME parameters are ignored and matching is case-insensitive. Anything
//! else is [`ExtractError::Unsupported`].

use std::io::Read;
use std::path::Path;

use serde_json::{json, Map, Value};
use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_MSWORD: &str = "application/msword";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_HTML: &str = "text/html";

/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    Unsupported(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
    #[error("parser aborted: {0}")]
    Aborted(String),
}

impl From<ExtractError> for docent_core::Error {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Unsupported(mime) => docent_core::Error::UnsupportedFormat(mime),
            other => docent_core::Error::ParseFailed(other.to_string()),
        }
    }
}

/// Text and metadata extracted from one file.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub text: String,
    /// Title found inside the file (PDF Info dictionary, HTML `<title>`).
    pub title: Option<String>,
    pub metadata: Value,
}

/// Lowercased MIME essence without parameters.
pub fn normalize_mime(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub fn is_supported(mime: &str) -> bool {
    matches!(
        normalize_mime(mime).as_str(),
        MIME_PDF | MIME_DOCX | MIME_MSWORD | MIME_TEXT | MIME_MARKDOWN | MIME_HTML
    )
}

/// Guess a MIME type from a file extension. Unknown extensions map to
/// `application/octet-stream`, which [`parse`] rejects.
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => MIME_PDF,
        "docx" => MIME_DOCX,
        "doc" => MIME_MSWORD,
        "txt" | "text" => MIME_TEXT,
        "md" | "markdown" => MIME_MARKDOWN,
        "html" | "htm" => MIME_HTML,
        _ => "application/octet-stream",
    }
}

pub fn parse(bytes: &[u8], mime: &str) -> Result<ParsedDocument, ExtractError> {
    match normalize_mime(mime).as_str() {
        MIME_PDF => parse_pdf(bytes),
        MIME_DOCX | MIME_MSWORD => parse_docx(bytes),
        MIME_TEXT | MIME_MARKDOWN => Ok(ParsedDocument {
            text: decode_utf8(bytes),
            title: None,
            metadata: json!({}),
        }),
        MIME_HTML => {
            let page = crate::crawl::html_to_text(&decode_utf8(bytes));
            Ok(ParsedDocument {
                text: page.text,
                title: page.title,
                metadata: json!({}),
            })
        }
        _ => Err(ExtractError::Unsupported(mime.to_string())),
    }
}

/// [`parse`] on the blocking pool. A panic inside a parser backend comes
/// back as [`ExtractError::Aborted`] instead of unwinding into the caller.
pub async fn parse_blocking(bytes: Vec<u8>, mime: String) -> Result<ParsedDocument, ExtractError> {
    run_blocking(move || parse(&bytes, &mime)).await
}

async fn run_blocking<F>(job: F) -> Result<ParsedDocument, ExtractError>
where
    F: FnOnce() -> Result<ParsedDocument, ExtractError> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| ExtractError::Aborted(e.to_string()))?
}

fn decode_utf8(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

fn parse_pdf(bytes: &[u8]) -> Result<ParsedDocument, ExtractError> {
    let text = pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;

    let mut metadata = Map::new();
    let mut title = None;
    // Metadata is best effort; text extraction already succeeded.
    if let Ok(doc) = lopdf::Document::load_mem(bytes) {
        metadata.insert("pageCount".into(), json!(doc.get_pages().len()));
        title = pdf_info_string(&doc, b"Title");
        if let Some(t) = &title {
            metadata.insert("title".into(), json!(t));
        }
        if let Some(author) = pdf_info_string(&doc, b"Author") {
            metadata.insert("author".into(), json!(author));
        }
    }

    Ok(ParsedDocument {
        text,
        title,
        metadata: Value::Object(metadata),
    })
}

fn pdf_info_string(doc: &lopdf::Document, key: &[u8]) -> Option<String> {
    let info = match doc.trailer.get(b"Info").ok()? {
        lopdf::Object::Reference(id) => doc.get_object(*id).ok()?,
        other => other,
    };
    let value = match info.as_dict().ok()?.get(key).ok()? {
        lopdf::Object::String(bytes, _) => decode_pdf_string(bytes),
        _ => return None,
    };
    let value = value.trim().to_string();
    (!value.is_empty()).then_some(value)
}

/// PDF text strings are UTF-16BE with a BOM, or PDFDocEncoding (treated as Latin-1).
fn decode_pdf_string(bytes: &[u8]) -> String {
    match bytes.strip_prefix(&[0xFE, 0xFF]) {
        Some(rest) => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        None => bytes.iter().map(|&b| b as char).collect(),
    }
}

fn parse_docx(bytes: &[u8]) -> Result<ParsedDocument, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| {
        ExtractError::Docx(format!("not an OOXML package (legacy .doc is unsupported): {}", e))
    })?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    let text = docx_paragraphs(&xml)?;
    let paragraphs = text.split("\n\n").filter(|p| !p.trim().is_empty()).count();
    Ok(ParsedDocument {
        text,
        title: None,
        metadata: json!({ "paragraphCount": paragraphs }),
    })
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Docx(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Docx(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Collect `<w:t>` runs; each `<w:p>` ends a paragraph.
fn docx_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let para = std::mem::take(&mut current);
                    if !para.trim().is_empty() {
                        paragraphs.push(para.trim().to_string());
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" | b"cr" => current.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| ExtractError::Docx(e.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !current.trim().is_empty() {
        paragraphs.push(current.trim().to_string());
    }
    Ok(paragraphs.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_content_type_returns_error() {
        let err = parse(b"foo", "application/octet-stream").unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));
        assert!(matches!(
            docent_core::Error::from(err),
            docent_core::Error::UnsupportedFormat(_)
        ));
    }

    #[tokio::test]
    async fn blocking_parse_matches_inline_parse() {
        let parsed = parse_blocking(b"hello there".to_vec(), "text/plain".into())
            .await
            .unwrap();
        assert_eq!(parsed.text, "hello there");
        let err = parse_blocking(vec![1, 2], "image/png".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));
    }

    #[tokio::test]
    async fn parser_panic_becomes_parse_failure() {
        let err = run_blocking(|| panic!("malformed xref table")).await.unwrap_err();
        assert!(matches!(err, ExtractError::Aborted(_)));
        assert!(matches!(
            docent_core::Error::from(err),
            docent_core::Error::ParseFailed(_)
        ));
    }

    #[test]
    fn mime_parameters_and_case_ignored() {
        let parsed = parse(b"\xEF\xBB\xBFhello", "Text/Plain; charset=utf-8").unwrap();
        assert_eq!(parsed.text, "hello");
        assert!(is_supported("TEXT/MARKDOWN"));
        assert!(!is_supported("image/png"));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = parse(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
        assert!(matches!(
            docent_core::Error::from(err),
            docent_core::Error::ParseFailed(_)
        ));
    }

    #[test]
    fn legacy_doc_bytes_fail_to_parse() {
        let err = parse(b"\xD0\xCF\x11\xE0 binary word", MIME_MSWORD).unwrap_err();
        assert!(matches!(err, ExtractError::Docx(_)));
    }

    #[test]
    fn docx_paragraphs_are_separated() {
        let xml = br#"<w:document xmlns:w="w"><w:body>
            <w:p><w:r><w:t xml:space="preserve">Hello </w:t></w:r><w:r><w:t>world</w:t></w:r></w:p>
            <w:p><w:r><w:t>Second &amp; last</w:t></w:r></w:p>
        </w:body></w:document>"#;
        assert_eq!(docx_paragraphs(xml).unwrap(), "Hello world\n\nSecond & last");
    }

    #[test]
    fn html_is_stripped() {
        let parsed = parse(
            b"<html><head><title>Guide</title><style>p{}</style></head><body><p>One</p><p>Two</p></body></html>",
            MIME_HTML,
        )
        .unwrap();
        assert_eq!(parsed.title.as_deref(), Some("Guide"));
        assert_eq!(parsed.text, "One\n\nTwo");
    }

    #[test]
    fn pdf_string_decoding() {
        assert_eq!(decode_pdf_string(b"Plain"), "Plain");
        assert_eq!(decode_pdf_string(&[0xFE, 0xFF, 0x00, 0x48, 0x00, 0x69]), "Hi");
    }

    #[test]
    fn extension_mapping() {
        assert_eq!(mime_for_path(Path::new("a/b.PDF")), MIME_PDF);
        assert_eq!(mime_for_path(Path::new("notes.md")), MIME_MARKDOWN);
        assert_eq!(mime_for_path(Path::new("x.bin")), "application/octet-stream");
    }
}
