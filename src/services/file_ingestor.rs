// src/services/file_ingestor.rs
// Turns uploaded attachments into model-facing context fragments
use crate::ai::ImageRef;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::Path;
use thiserror::Error;

const TRUNCATION_MARKER: &str = "\n[... content truncated ...]";

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),
    #[error("file {0} is empty")]
    Empty(String),
    #[error("file is too large ({size} bytes, limit {limit})")]
    TooLarge { size: usize, limit: usize },
    #[error("file {0} is not valid UTF-8 text")]
    InvalidEncoding(String),
    #[error("attachment payload is not valid base64: {0}")]
    InvalidPayload(#[from] base64::DecodeError),
    #[error("failed to extract PDF text: {0}")]
    Pdf(String),
    #[error("extraction task failed: {0}")]
    Task(String),
}

/// Request-scoped extraction result. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Text { filename: String, content: String },
    Table { filename: String, content: String },
    Code { filename: String, language: String, content: String },
    Image(ImageRef),
}

impl Fragment {
    /// Text appended to the model-facing message; images travel separately.
    pub fn context_text(&self) -> Option<String> {
        match self {
            Fragment::Text { filename, content } | Fragment::Table { filename, content } => {
                Some(format!("File: {}\n{}", filename, content))
            }
            Fragment::Code { filename, language, content } => {
                Some(format!("File: {}\n```{}\n{}\n```", filename, language, content))
            }
            Fragment::Image(_) => None,
        }
    }
}

#[async_trait]
pub trait FileIngestor: Send + Sync {
    async fn process(&self, bytes: Vec<u8>, filename: &str, mime_type: &str) -> Result<Fragment, IngestError>;
}

/// Decodes a client attachment payload; a `data:<mime>;base64,` prefix is accepted.
pub fn decode_payload(data: &str) -> Result<Vec<u8>, IngestError> {
    let encoded = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    Ok(STANDARD.decode(encoded.trim())?)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    Image(&'static str),
    Pdf,
    Table(char),
    Code(&'static str),
    Text,
}

const CODE_EXTENSIONS: &[(&str, &str)] = &[
    ("rs", "rust"),
    ("py", "python"),
    ("js", "javascript"),
    ("mjs", "javascript"),
    ("ts", "typescript"),
    ("tsx", "tsx"),
    ("jsx", "jsx"),
    ("go", "go"),
    ("java", "java"),
    ("kt", "kotlin"),
    ("c", "c"),
    ("h", "c"),
    ("cpp", "cpp"),
    ("hpp", "cpp"),
    ("cs", "csharp"),
    ("rb", "ruby"),
    ("php", "php"),
    ("swift", "swift"),
    ("sh", "bash"),
    ("sql", "sql"),
    ("html", "html"),
    ("css", "css"),
    ("json", "json"),
    ("yaml", "yaml"),
    ("yml", "yaml"),
    ("toml", "toml"),
    ("xml", "xml"),
];

fn classify(filename: &str, mime_type: &str) -> Option<Kind> {
    let mime = mime_type.trim().to_ascii_lowercase();
    let mime = mime.split(';').next().unwrap_or_default().trim();

    match mime {
        "image/png" => return Some(Kind::Image("image/png")),
        "image/jpeg" | "image/jpg" => return Some(Kind::Image("image/jpeg")),
        "image/gif" => return Some(Kind::Image("image/gif")),
        "image/webp" => return Some(Kind::Image("image/webp")),
        "application/pdf" => return Some(Kind::Pdf),
        "text/csv" => return Some(Kind::Table(',')),
        "text/tab-separated-values" => return Some(Kind::Table('\t')),
        "application/json" => return Some(Kind::Code("json")),
        _ => {}
    }

    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let by_extension = match ext.as_str() {
        "png" => Some(Kind::Image("image/png")),
        "jpg" | "jpeg" => Some(Kind::Image("image/jpeg")),
        "gif" => Some(Kind::Image("image/gif")),
        "webp" => Some(Kind::Image("image/webp")),
        "pdf" => Some(Kind::Pdf),
        "csv" => Some(Kind::Table(',')),
        "tsv" => Some(Kind::Table('\t')),
        "txt" | "md" | "markdown" | "log" | "text" => Some(Kind::Text),
        other => CODE_EXTENSIONS
            .iter()
            .find(|(e, _)| *e == other)
            .map(|(_, language)| Kind::Code(*language)),
    };

    by_extension.or_else(|| mime.starts_with("text/").then_some(Kind::Text))
}

/// Splits delimited text into rows, honouring double-quoted fields and `""` escapes.
fn parse_delimited(text: &str, delimiter: char) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' if field.is_empty() => in_quotes = true,
            '\r' if !in_quotes => {}
            '\n' if !in_quotes => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            c if c == delimiter && !in_quotes => row.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }

    rows.retain(|r| r.iter().any(|cell| !cell.trim().is_empty()));
    rows
}

fn render_table(rows: &[Vec<String>]) -> String {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let line = |cells: &[String]| {
        let mut padded: Vec<String> = cells
            .iter()
            .map(|c| c.trim().replace('|', "\\|").replace('\n', " "))
            .collect();
        padded.resize(width, String::new());
        format!("| {} |", padded.join(" | "))
    };

    let mut out = Vec::with_capacity(rows.len() + 1);
    if let Some((header, body)) = rows.split_first() {
        out.push(line(header.as_slice()));
        out.push(format!("|{}", " --- |".repeat(width)));
        out.extend(body.iter().map(|r| line(r.as_slice())));
    }
    out.join("\n")
}

pub struct DefaultFileIngestor {
    max_bytes: usize,
    max_chars: usize,
}

impl DefaultFileIngestor {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            max_chars: 100_000,
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    fn truncate(&self, text: &str) -> String {
        match text.char_indices().nth(self.max_chars) {
            Some((cut, _)) => format!("{}{}", &text[..cut], TRUNCATION_MARKER),
            None => text.to_string(),
        }
    }

    fn decode_text(bytes: Vec<u8>, filename: &str) -> Result<String, IngestError> {
        let text = String::from_utf8(bytes).map_err(|_| IngestError::InvalidEncoding(filename.to_string()))?;
        let text = text.strip_prefix('\u{feff}').map(str::to_string).unwrap_or(text);
        if text.trim().is_empty() {
            return Err(IngestError::Empty(filename.to_string()));
        }
        Ok(text)
    }
}

#[async_trait]
impl FileIngestor for DefaultFileIngestor {
    async fn process(&self, bytes: Vec<u8>, filename: &str, mime_type: &str) -> Result<Fragment, IngestError> {
        if bytes.is_empty() {
            return Err(IngestError::Empty(filename.to_string()));
        }
        if bytes.len() > self.max_bytes {
            return Err(IngestError::TooLarge { size: bytes.len(), limit: self.max_bytes });
        }

        let kind = classify(filename, mime_type)
            .ok_or_else(|| IngestError::Unsupported(format!("{} ({})", filename, mime_type)))?;
        tracing::debug!("Ingesting {} ({} bytes) as {:?}", filename, bytes.len(), kind);

        let filename_owned = filename.to_string();
        match kind {
            Kind::Image(media_type) => Ok(Fragment::Image(ImageRef {
                media_type: media_type.to_string(),
                data: STANDARD.encode(&bytes),
            })),
            Kind::Pdf => {
                let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
                    .await
                    .map_err(|e| IngestError::Task(e.to_string()))?
                    .map_err(|e| IngestError::Pdf(e.to_string()))?;
                if text.trim().is_empty() {
                    return Err(IngestError::Empty(filename_owned));
                }
                Ok(Fragment::Text {
                    content: self.truncate(text.trim()),
                    filename: filename_owned,
                })
            }
            Kind::Table(delimiter) => {
                let text = Self::decode_text(bytes, filename)?;
                let table = render_table(&parse_delimited(&text, delimiter));
                Ok(Fragment::Table {
                    content: self.truncate(&table),
                    filename: filename_owned,
                })
            }
            Kind::Code(language) => {
                let text = Self::decode_text(bytes, filename)?;
                Ok(Fragment::Code {
                    language: language.to_string(),
                    content: self.truncate(text.trim_end()),
                    filename: filename_owned,
                })
            }
            Kind::Text => {
                let text = Self::decode_text(bytes, filename)?;
                Ok(Fragment::Text {
                    content: self.truncate(text.trim()),
                    filename: filename_owned,
                })
            }
        }
    }
}
