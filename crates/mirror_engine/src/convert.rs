use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::key::short_hash;

/// A document handed to the conversion service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedBlob {
    pub name: String,
    pub bytes: Vec<u8>,
    pub media_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionErrorKind {
    UnsupportedMediaType,
    /// Failure kind reported by the service itself.
    Service(String),
    Transport,
    InvalidResponse,
}

impl fmt::Display for ConversionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionErrorKind::UnsupportedMediaType => write!(f, "unsupported media type"),
            ConversionErrorKind::Service(kind) => write!(f, "conversion failed ({kind})"),
            ConversionErrorKind::Transport => write!(f, "conversion service unreachable"),
            ConversionErrorKind::InvalidResponse => write!(f, "invalid conversion response"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {reason}")]
pub struct ConversionError {
    pub kind: ConversionErrorKind,
    pub reason: String,
}

impl ConversionError {
    pub fn new(kind: ConversionErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

#[async_trait::async_trait]
pub trait ConversionService: Send + Sync {
    async fn convert(&self, blob: NamedBlob) -> Result<String, ConversionError>;
}

/// Local HTML conversion through `html2md`; plain text passes through.
#[derive(Debug, Default, Clone, Copy)]
pub struct Html2MdConversion;

#[async_trait::async_trait]
impl ConversionService for Html2MdConversion {
    async fn convert(&self, blob: NamedBlob) -> Result<String, ConversionError> {
        let text = String::from_utf8_lossy(&blob.bytes);
        match essence(&blob.media_type).as_str() {
            "text/html" | "application/xhtml+xml" => Ok(html2md::parse_html(&text)),
            "text/plain" | "text/markdown" => Ok(text.into_owned()),
            other => Err(ConversionError::new(
                ConversionErrorKind::UnsupportedMediaType,
                format!("cannot convert {other} locally"),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConversionReply {
    Text { text: String },
    Failure { error_kind: String, reason: String },
}

/// Remote conversion service reached by a multipart POST of the blob.
///
/// The reply is JSON: `{"text": "..."}` on success or
/// `{"error_kind": "...", "reason": "..."}` on failure.
#[derive(Debug, Clone)]
pub struct HttpConversionService {
    client: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
}

impl HttpConversionService {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, ConversionError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|err| ConversionError::new(ConversionErrorKind::Transport, err.to_string()))?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| ConversionError::new(ConversionErrorKind::Transport, err.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }
}

#[async_trait::async_trait]
impl ConversionService for HttpConversionService {
    async fn convert(&self, blob: NamedBlob) -> Result<String, ConversionError> {
        let part = reqwest::multipart::Part::bytes(blob.bytes)
            .file_name(blob.name)
            .mime_str(&blob.media_type)
            .map_err(|err| {
                ConversionError::new(ConversionErrorKind::UnsupportedMediaType, err.to_string())
            })?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(self.endpoint.clone())
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| ConversionError::new(ConversionErrorKind::Transport, err.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ConversionError::new(ConversionErrorKind::Transport, err.to_string()))?;

        match serde_json::from_slice::<ConversionReply>(&body) {
            Ok(ConversionReply::Text { text }) if status.is_success() => Ok(text),
            Ok(ConversionReply::Text { .. }) => Err(ConversionError::new(
                ConversionErrorKind::InvalidResponse,
                format!("text reply with status {status}"),
            )),
            Ok(ConversionReply::Failure { error_kind, reason }) => Err(ConversionError::new(
                ConversionErrorKind::Service(error_kind),
                reason,
            )),
            Err(err) => Err(ConversionError::new(
                ConversionErrorKind::InvalidResponse,
                format!("status {status}: {err}"),
            )),
        }
    }
}

/// Media type without parameters, lowercased.
pub fn essence(media_type: &str) -> String {
    media_type
        .split(';')
        .next()
        .unwrap_or(media_type)
        .trim()
        .to_ascii_lowercase()
}

/// Deterministic blob name: `{sanitized last path segment}--{short_hash(url)}.{ext}`.
pub fn blob_name(url: &str, media_type: &str) -> String {
    let stem = Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string))
        })
        .map(|segment| sanitize_stem(&segment))
        .unwrap_or_else(|| "document".to_string());
    let hash = short_hash(url, 4);
    let extension = extension_for(media_type);
    format!("{stem}--{hash}.{extension}")
}

fn sanitize_stem(input: &str) -> String {
    let stem = input.rsplit_once('.').map_or(input, |(stem, _)| stem);
    let mut cleaned = String::with_capacity(stem.len());
    let mut prev_underscore = false;
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            cleaned.push(c);
            prev_underscore = false;
        } else if !prev_underscore {
            cleaned.push('_');
            prev_underscore = true;
        }
    }
    let mut cleaned = cleaned.trim_matches('_').to_string();
    cleaned.truncate(60);
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned
    }
}

fn extension_for(media_type: &str) -> &'static str {
    match essence(media_type).as_str() {
        "text/html" => "html",
        "application/xhtml+xml" => "xhtml",
        "text/plain" => "txt",
        "text/markdown" => "md",
        "application/pdf" => "pdf",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        _ => "bin",
    }
}
