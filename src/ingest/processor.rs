//! Document content validation and text extraction.
//!
//! Files are validated against magic-byte signatures before extraction so a
//! renamed executable cannot masquerade as a PDF. ZIP-based OOXML formats
//! (DOCX/PPTX/XLSX) share the `PK\x03\x04` signature and are disambiguated by
//! inspecting the container for their well-known member files.

use std::io::{Cursor, Read};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str = "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_PNG: &str = "image/png";

/// MIME types accepted at upload admission.
pub const SUPPORTED_TYPES: &[&str] = &[
  MIME_PDF,
  MIME_DOCX,
  MIME_PPTX,
  MIME_XLSX,
  MIME_TEXT,
  MIME_MARKDOWN,
  MIME_JPEG,
  "image/jpg",
  MIME_PNG,
];

/// Magic-byte signatures: (prefix, mime).
const FILE_SIGNATURES: &[(&[u8], &str)] = &[
  (b"%PDF", MIME_PDF),
  (b"PK\x03\x04", "application/zip"),
  (b"\xff\xd8\xff", MIME_JPEG),
  (b"\x89PNG\r\n\x1a\n", MIME_PNG),
  (b"GIF87a", "image/gif"),
  (b"GIF89a", "image/gif"),
  (b"BM", "image/bmp"),
  (b"II*\x00", "image/tiff"),
  (b"MM\x00*", "image/tiff"),
  (b"\xef\xbb\xbf", MIME_TEXT),
];

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
  #[error("file content does not match claimed type: claimed {claimed}, detected {detected}")]
  TypeMismatch { claimed: String, detected: String },
  #[error("unsupported file type: {0}")]
  Unsupported(String),
  #[error("text extraction failed: {0}")]
  Extraction(String),
  #[error("no text extracted from document")]
  EmptyText,
  #[error("image requires OCR")]
  OcrRequired,
}

/// Character range of one page within the extracted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
  /// 1-based page number
  pub page: u32,
  pub start: usize,
  pub end: usize,
}

/// Result of extracting a document.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
  pub text: String,
  /// Page boundaries; empty for non-paginated formats
  pub page_info: Vec<PageInfo>,
  /// Best-effort structured metadata (title, author, creation_date)
  pub metadata: serde_json::Value,
}

/// A citation or cross-reference found in document text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
  pub kind: ReferenceKind,
  pub text: String,
  pub position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
  Citation,
  CrossReference,
}

// ============================================================================
// Validation
// ============================================================================

/// Detect a file's MIME type from its magic bytes, inspecting ZIP containers
/// for the OOXML subtype. Returns `None` when no signature matches.
pub fn detect_type(bytes: &[u8]) -> Option<String> {
  let matched = FILE_SIGNATURES
    .iter()
    .find(|(magic, _)| bytes.starts_with(magic))
    .map(|(_, mime)| *mime)?;

  if matched == "application/zip" {
    return Some(detect_ooxml_subtype(bytes));
  }

  Some(matched.to_string())
}

/// Inspect a ZIP container for the OOXML member that identifies its subtype.
fn detect_ooxml_subtype(bytes: &[u8]) -> String {
  let cursor = Cursor::new(bytes);
  match zip::ZipArchive::new(cursor) {
    Ok(archive) => {
      let names: Vec<&str> = archive.file_names().collect();
      if names.iter().any(|n| n.contains("word/document.xml")) {
        MIME_DOCX.to_string()
      } else if names.iter().any(|n| n.contains("ppt/presentation.xml")) {
        MIME_PPTX.to_string()
      } else if names.iter().any(|n| n.contains("xl/workbook.xml")) {
        MIME_XLSX.to_string()
      } else {
        "application/zip".to_string()
      }
    }
    Err(e) => {
      warn!(error = %e, "Failed to inspect ZIP structure");
      "application/zip".to_string()
    }
  }
}

/// Validate that file content matches the claimed MIME type.
///
/// Text claims are validated by UTF-8 decodability of the first 1 KiB instead
/// of magic bytes. Unknown signatures are allowed through with a warning (the
/// file may be plain text without a BOM).
pub fn validate_content(bytes: &[u8], claimed: &str) -> Result<Option<String>, ProcessError> {
  if bytes.is_empty() {
    return Err(ProcessError::Extraction("file is empty".to_string()));
  }

  if claimed == MIME_TEXT || claimed == MIME_MARKDOWN {
    let head = &bytes[..bytes.len().min(1024)];
    return match std::str::from_utf8(trim_partial_utf8(head)) {
      Ok(_) => Ok(Some(claimed.to_string())),
      Err(_) => Err(ProcessError::TypeMismatch {
        claimed: claimed.to_string(),
        detected: "binary".to_string(),
      }),
    };
  }

  match detect_type(bytes) {
    Some(detected) => {
      let claimed_norm = if claimed == "image/jpg" { MIME_JPEG } else { claimed };
      if detected == claimed_norm {
        Ok(Some(detected))
      } else {
        warn!(claimed = claimed, detected = %detected, "File content mismatch");
        Err(ProcessError::TypeMismatch {
          claimed: claimed.to_string(),
          detected,
        })
      }
    }
    None => {
      warn!(claimed = claimed, "Could not detect file type from magic bytes");
      Ok(None)
    }
  }
}

/// Drop trailing bytes that are part of an incomplete UTF-8 sequence, so a
/// 1 KiB prefix of valid UTF-8 still validates.
fn trim_partial_utf8(bytes: &[u8]) -> &[u8] {
  let mut end = bytes.len();
  while end > 0 && end > bytes.len().saturating_sub(4) {
    if std::str::from_utf8(&bytes[..end]).is_ok() {
      return &bytes[..end];
    }
    end -= 1;
  }
  &bytes[..end]
}

/// Whether this MIME type is extracted through the OCR path.
pub fn requires_ocr(mime: &str) -> bool {
  mime.starts_with("image/")
}

/// Whether this MIME type is accepted at upload admission.
pub fn is_supported(mime: &str) -> bool {
  SUPPORTED_TYPES.contains(&mime)
}

/// Guess a MIME type from a filename extension (used by auto-import).
pub fn type_from_extension(file_name: &str) -> Option<&'static str> {
  let ext = file_name.rsplit('.').next()?.to_lowercase();
  match ext.as_str() {
    "pdf" => Some(MIME_PDF),
    "docx" => Some(MIME_DOCX),
    "pptx" => Some(MIME_PPTX),
    "xlsx" => Some(MIME_XLSX),
    "txt" => Some(MIME_TEXT),
    "md" | "markdown" => Some(MIME_MARKDOWN),
    "jpg" | "jpeg" => Some(MIME_JPEG),
    "png" => Some(MIME_PNG),
    _ => None,
  }
}

// ============================================================================
// Extraction
// ============================================================================

/// Extract text (plus page offsets and metadata where the format supports
/// them) from validated file bytes. Images return [`ProcessError::OcrRequired`];
/// the orchestrator routes those through the provider gateway instead.
pub fn extract(bytes: &[u8], mime: &str) -> Result<Extraction, ProcessError> {
  validate_content(bytes, mime)?;

  let extraction = match mime {
    MIME_PDF => extract_pdf(bytes)?,
    MIME_DOCX => extract_docx(bytes)?,
    MIME_PPTX => extract_pptx(bytes)?,
    MIME_XLSX => extract_xlsx(bytes)?,
    MIME_TEXT | MIME_MARKDOWN => extract_text_file(bytes)?,
    m if requires_ocr(m) => return Err(ProcessError::OcrRequired),
    other => return Err(ProcessError::Unsupported(other.to_string())),
  };

  if extraction.text.trim().is_empty() {
    return Err(ProcessError::EmptyText);
  }

  Ok(extraction)
}

/// PDF: pages joined with `\n\n`, each page's character range recorded.
fn extract_pdf(bytes: &[u8]) -> Result<Extraction, ProcessError> {
  let pages = pdf_extract::extract_text_from_mem_by_pages(bytes).map_err(|e| ProcessError::Extraction(e.to_string()))?;

  let mut text = String::new();
  let mut page_info = Vec::new();
  let mut current = 0usize;

  for (i, page_text) in pages.iter().enumerate() {
    let page_text = page_text.trim();
    if page_text.is_empty() {
      continue;
    }
    if !text.is_empty() {
      text.push_str("\n\n");
      current += 2;
    }
    let start = current;
    text.push_str(page_text);
    current += page_text.chars().count();
    page_info.push(PageInfo {
      page: (i + 1) as u32,
      start,
      end: current,
    });
  }

  debug!(pages = page_info.len(), chars = text.len(), "PDF extraction complete");

  Ok(Extraction {
    text,
    page_info,
    metadata: pdf_metadata(bytes),
  })
}

/// Best-effort scan of the PDF Info dictionary for title/author/creation date.
fn pdf_metadata(bytes: &[u8]) -> serde_json::Value {
  static TITLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/Title\s*\(([^)]*)\)").expect("title pattern"));
  static AUTHOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"/Author\s*\(([^)]*)\)").expect("author pattern"));
  static CREATED: Lazy<Regex> = Lazy::new(|| Regex::new(r"/CreationDate\s*\(([^)]*)\)").expect("creation pattern"));

  let haystack = String::from_utf8_lossy(bytes);
  let mut map = serde_json::Map::new();
  if let Some(caps) = TITLE.captures(&haystack)
    && !caps[1].trim().is_empty()
  {
    map.insert("title".to_string(), serde_json::Value::String(caps[1].to_string()));
  }
  if let Some(caps) = AUTHOR.captures(&haystack)
    && !caps[1].trim().is_empty()
  {
    map.insert("author".to_string(), serde_json::Value::String(caps[1].to_string()));
  }
  if let Some(caps) = CREATED.captures(&haystack)
    && !caps[1].trim().is_empty()
  {
    map.insert("creation_date".to_string(), serde_json::Value::String(caps[1].to_string()));
  }

  if map.is_empty() {
    serde_json::Value::Null
  } else {
    serde_json::Value::Object(map)
  }
}

/// DOCX: paragraph text from `word/document.xml`, paragraphs joined with `\n\n`.
fn extract_docx(bytes: &[u8]) -> Result<Extraction, ProcessError> {
  let xml = read_zip_member(bytes, "word/document.xml")?;
  let mut paragraphs: Vec<String> = Vec::new();
  let mut current = String::new();
  let mut in_text = false;

  let mut reader = quick_xml::Reader::from_reader(xml.as_bytes());
  let mut buf = Vec::new();
  loop {
    match reader.read_event_into(&mut buf) {
      Ok(quick_xml::events::Event::Start(e)) if e.name().as_ref() == b"w:t" => in_text = true,
      Ok(quick_xml::events::Event::End(e)) => match e.name().as_ref() {
        b"w:t" => in_text = false,
        b"w:p" => {
          if !current.trim().is_empty() {
            paragraphs.push(current.trim().to_string());
          }
          current.clear();
        }
        _ => {}
      },
      Ok(quick_xml::events::Event::Text(e)) if in_text => {
        let fragment = e.unescape().map_err(|e| ProcessError::Extraction(e.to_string()))?;
        current.push_str(&fragment);
      }
      Ok(quick_xml::events::Event::Eof) => break,
      Err(e) => return Err(ProcessError::Extraction(e.to_string())),
      _ => {}
    }
    buf.clear();
  }

  if !current.trim().is_empty() {
    paragraphs.push(current.trim().to_string());
  }

  Ok(Extraction {
    text: paragraphs.join("\n\n"),
    page_info: Vec::new(),
    metadata: ooxml_core_properties(bytes),
  })
}

/// PPTX: text runs (`a:t`) from every slide, slides joined with `\n\n`.
fn extract_pptx(bytes: &[u8]) -> Result<Extraction, ProcessError> {
  let cursor = Cursor::new(bytes);
  let mut archive = zip::ZipArchive::new(cursor).map_err(|e| ProcessError::Extraction(e.to_string()))?;

  let mut slide_names: Vec<String> = archive
    .file_names()
    .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
    .map(String::from)
    .collect();
  slide_names.sort();

  let mut slides = Vec::new();
  for name in slide_names {
    let mut xml = String::new();
    archive
      .by_name(&name)
      .map_err(|e| ProcessError::Extraction(e.to_string()))?
      .read_to_string(&mut xml)
      .map_err(|e| ProcessError::Extraction(e.to_string()))?;
    let text = collect_xml_text(&xml, b"a:t")?;
    if !text.trim().is_empty() {
      slides.push(text.trim().to_string());
    }
  }

  Ok(Extraction {
    text: slides.join("\n\n"),
    page_info: Vec::new(),
    metadata: ooxml_core_properties(bytes),
  })
}

/// XLSX: shared strings plus inline cell strings, one per line.
fn extract_xlsx(bytes: &[u8]) -> Result<Extraction, ProcessError> {
  let xml = read_zip_member(bytes, "xl/sharedStrings.xml")
    .or_else(|_| read_zip_member(bytes, "xl/worksheets/sheet1.xml"))?;
  let text = collect_xml_text(&xml, b"t")?;

  Ok(Extraction {
    text: text.lines().map(str::trim).filter(|l| !l.is_empty()).collect::<Vec<_>>().join("\n"),
    page_info: Vec::new(),
    metadata: ooxml_core_properties(bytes),
  })
}

/// Plain text / markdown: UTF-8 first, Latin-1 as a last resort.
fn extract_text_file(bytes: &[u8]) -> Result<Extraction, ProcessError> {
  let text = match String::from_utf8(bytes.to_vec()) {
    Ok(s) => s,
    Err(_) => bytes.iter().map(|&b| b as char).collect(),
  };

  Ok(Extraction {
    text,
    page_info: Vec::new(),
    metadata: serde_json::Value::Null,
  })
}

fn read_zip_member(bytes: &[u8], member: &str) -> Result<String, ProcessError> {
  let cursor = Cursor::new(bytes);
  let mut archive = zip::ZipArchive::new(cursor).map_err(|e| ProcessError::Extraction(e.to_string()))?;
  let mut file = archive
    .by_name(member)
    .map_err(|e| ProcessError::Extraction(format!("{member}: {e}")))?;
  let mut xml = String::new();
  file
    .read_to_string(&mut xml)
    .map_err(|e| ProcessError::Extraction(e.to_string()))?;
  Ok(xml)
}

/// Collect the character content of every `tag` element, one per line.
fn collect_xml_text(xml: &str, tag: &[u8]) -> Result<String, ProcessError> {
  let mut out = String::new();
  let mut in_tag = false;

  let mut reader = quick_xml::Reader::from_reader(xml.as_bytes());
  let mut buf = Vec::new();
  loop {
    match reader.read_event_into(&mut buf) {
      Ok(quick_xml::events::Event::Start(e)) if e.name().as_ref() == tag => in_tag = true,
      Ok(quick_xml::events::Event::End(e)) if e.name().as_ref() == tag => {
        in_tag = false;
        out.push('\n');
      }
      Ok(quick_xml::events::Event::Text(e)) if in_tag => {
        let fragment = e.unescape().map_err(|e| ProcessError::Extraction(e.to_string()))?;
        out.push_str(&fragment);
      }
      Ok(quick_xml::events::Event::Eof) => break,
      Err(e) => return Err(ProcessError::Extraction(e.to_string())),
      _ => {}
    }
    buf.clear();
  }

  Ok(out)
}

/// OOXML core properties (`docProps/core.xml`): title, creator, created.
fn ooxml_core_properties(bytes: &[u8]) -> serde_json::Value {
  let Ok(xml) = read_zip_member(bytes, "docProps/core.xml") else {
    return serde_json::Value::Null;
  };

  let mut map = serde_json::Map::new();
  for (tag, key) in [
    (&b"dc:title"[..], "title"),
    (&b"dc:creator"[..], "author"),
    (&b"dcterms:created"[..], "creation_date"),
  ] {
    if let Ok(value) = collect_xml_text(&xml, tag) {
      let value = value.trim();
      if !value.is_empty() {
        map.insert(key.to_string(), serde_json::Value::String(value.to_string()));
      }
    }
  }

  if map.is_empty() {
    serde_json::Value::Null
  } else {
    serde_json::Value::Object(map)
  }
}

// ============================================================================
// Language detection
// ============================================================================

/// Best-effort language detection over the first 1000 characters.
///
/// Returns `zh` when the CJK ratio is significant, `en` when the text is
/// predominantly Latin, `None` when the sample is too short to judge.
pub fn detect_language(text: &str) -> Option<String> {
  let trimmed = text.trim();
  if trimmed.chars().count() < 10 {
    return None;
  }

  let sample: Vec<char> = trimmed.chars().take(1000).collect();
  let mut cjk = 0usize;
  let mut latin = 0usize;
  for &c in &sample {
    if ('\u{4E00}'..='\u{9FFF}').contains(&c) || ('\u{3400}'..='\u{4DBF}').contains(&c) {
      cjk += 1;
    } else if c.is_ascii_alphabetic() {
      latin += 1;
    }
  }

  let total = cjk + latin;
  if total == 0 {
    return None;
  }

  if (cjk as f64) / (total as f64) > 0.15 {
    Some("zh".to_string())
  } else {
    Some("en".to_string())
  }
}

// ============================================================================
// Reference extraction
// ============================================================================

static CITATION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
  vec![
    Regex::new(r"\[(\d+)\]").expect("numeric citation"),
    Regex::new(r"\(([A-Z][a-z]+(?:\s+et\s+al\.)?,\s+\d{4})\)").expect("author citation"),
    Regex::new(r"\[([A-Z][a-z]+(?:\s+et\s+al\.)?,\s+\d{4})\]").expect("bracket author citation"),
  ]
});

static CROSS_REF: Lazy<Regex> = Lazy::new(|| {
  Regex::new(r"(?i)(?:see|refer to|see also)\s+(?:section|chapter|figure|table|appendix)\s+(\d+)")
    .expect("cross reference")
});

/// Scan text for citations and cross-references, in document order.
pub fn extract_references(text: &str) -> Vec<Reference> {
  let mut references = Vec::new();

  for pattern in CITATION_PATTERNS.iter() {
    for m in pattern.find_iter(text) {
      references.push(Reference {
        kind: ReferenceKind::Citation,
        text: m.as_str().to_string(),
        position: m.start(),
      });
    }
  }

  for m in CROSS_REF.find_iter(text) {
    references.push(Reference {
      kind: ReferenceKind::CrossReference,
      text: m.as_str().to_string(),
      position: m.start(),
    });
  }

  references.sort_by_key(|r| r.position);
  references
}

/// Map page-info entries onto a chunk start offset.
pub fn page_for_offset(page_info: &[PageInfo], offset: usize) -> Option<u32> {
  page_info
    .iter()
    .find(|p| p.start <= offset && offset < p.end)
    .map(|p| p.page)
}
