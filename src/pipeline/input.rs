//! Input resolution: turn a print request into an in-memory [`Document`].
//!
//! Everything downstream works on bytes in memory. A request either points
//! at a file (typically in a shared folder, read once and never modified) or
//! carries the document inline as base64. The media type is decided here,
//! once, so the rasterizer never has to guess.

use crate::config::ScalePolicy;
use crate::error::LabelError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tiff", "tif", "gif", "webp"];

/// Declared kind of an input document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Pdf,
    Image,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Pdf => "pdf",
            MediaType::Image => "image",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw input bytes plus their media type and original filename.
///
/// Cloning is cheap: the bytes are shared.
#[derive(Clone)]
pub struct Document {
    bytes: Arc<[u8]>,
    media_type: MediaType,
    filename: String,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("filename", &self.filename)
            .field("media_type", &self.media_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Document {
    /// Wrap `bytes`, detecting the media type from `filename` and content.
    pub fn new(bytes: impl Into<Arc<[u8]>>, filename: impl Into<String>) -> Result<Self, LabelError> {
        let bytes = bytes.into();
        let filename = filename.into();
        let media_type = detect_media_type(&filename, &bytes);
        Self::with_media_type(bytes, filename, media_type)
    }

    /// Wrap `bytes` with an explicitly declared media type.
    pub fn with_media_type(
        bytes: impl Into<Arc<[u8]>>,
        filename: impl Into<String>,
        media_type: MediaType,
    ) -> Result<Self, LabelError> {
        let bytes = bytes.into();
        let filename = filename.into();
        if bytes.is_empty() {
            return Err(LabelError::UnsupportedFormat {
                filename,
                detail: "empty file".into(),
            });
        }
        Ok(Self {
            bytes,
            media_type,
            filename,
        })
    }

    /// Read a document from the local filesystem.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, LabelError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LabelError::FileNotFound {
                path: path.to_path_buf(),
            },
            std::io::ErrorKind::PermissionDenied => LabelError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => LabelError::Internal(format!("Failed to read {}: {}", path.display(), e)),
        })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        debug!("Read {} bytes from {}", bytes.len(), path.display());
        Self::new(bytes, filename)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The shared byte buffer, for moving into blocking tasks.
    pub fn shared_bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Decide whether `bytes` is a PDF or an image.
///
/// The extension wins when it is one we know; otherwise the leading magic
/// bytes decide. Anything unrecognised is treated as an image and left to
/// the decoder to reject.
pub fn detect_media_type(filename: &str, bytes: &[u8]) -> MediaType {
    let ext = Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase());
    match ext.as_deref() {
        Some("pdf") => return MediaType::Pdf,
        Some(e) if IMAGE_EXTENSIONS.contains(&e) => return MediaType::Image,
        _ => {}
    }

    // PNG, JPEG and every other raster signature land on Image.
    if bytes.starts_with(b"%PDF-") {
        MediaType::Pdf
    } else {
        MediaType::Image
    }
}

// ── Request boundary ─────────────────────────────────────────────────────

/// The `scale` request parameter: a bare number or a string.
///
/// `75`, `"75"`, `"75%"`, `"fit"` and `"fill"` are all accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScaleParam {
    Percent(f64),
    Named(String),
}

impl ScaleParam {
    pub fn to_policy(&self) -> Result<ScalePolicy, LabelError> {
        match self {
            ScaleParam::Percent(p) if p.is_finite() => {
                Ok(ScalePolicy::from_percent(p.round().max(0.0) as u32))
            }
            ScaleParam::Percent(p) => Err(LabelError::InvalidRequest(format!(
                "scale must be a finite number, got {p}"
            ))),
            ScaleParam::Named(s) => s.parse(),
        }
    }
}

/// JSON body of a print request.
///
/// Exactly one of `file_path` and `file_base64` must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrintRequestBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub printer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<ScaleParam>,
}

/// A resolved request, ready for [`crate::process::LabelPipeline::run`].
#[derive(Debug, Clone)]
pub struct PrintRequest {
    pub document: Document,
    /// Overrides the configured default printer.
    pub printer: Option<String>,
    /// Overrides the configured default scale policy.
    pub scale: Option<ScalePolicy>,
}

impl PrintRequest {
    pub fn new(document: Document) -> Self {
        Self {
            document,
            printer: None,
            scale: None,
        }
    }

    pub fn with_printer(mut self, printer: impl Into<String>) -> Self {
        self.printer = Some(printer.into());
        self
    }

    pub fn with_scale(mut self, scale: ScalePolicy) -> Self {
        self.scale = Some(scale);
        self
    }
}

impl PrintRequestBody {
    /// Load the referenced document and parse the options.
    pub async fn resolve(self) -> Result<PrintRequest, LabelError> {
        let scale = self.scale.as_ref().map(ScaleParam::to_policy).transpose()?;

        let document = match (self.file_path, self.file_base64) {
            (Some(_), Some(_)) => {
                return Err(LabelError::InvalidRequest(
                    "set either file_path or file_base64, not both".into(),
                ))
            }
            (None, None) => {
                return Err(LabelError::InvalidRequest(
                    "one of file_path or file_base64 is required".into(),
                ))
            }
            (Some(path), None) => {
                let doc = Document::from_path(&path).await?;
                match self.filename {
                    Some(name) => Document::new(doc.shared_bytes(), name)?,
                    None => doc,
                }
            }
            (None, Some(b64)) => {
                let filename = self.filename.unwrap_or_else(|| "upload".to_string());
                let bytes = decode_base64_payload(&b64).map_err(|detail| {
                    LabelError::UnsupportedFormat {
                        filename: filename.clone(),
                        detail,
                    }
                })?;
                Document::new(bytes, filename)?
            }
        };

        Ok(PrintRequest {
            document,
            printer: self.printer.filter(|p| !p.trim().is_empty()),
            scale,
        })
    }
}

/// Resolve a request body. Shorthand for [`PrintRequestBody::resolve`].
pub async fn resolve_request(body: PrintRequestBody) -> Result<PrintRequest, LabelError> {
    body.resolve().await
}

/// Decode inline base64, tolerating a `data:` URI prefix and line breaks.
fn decode_base64_payload(b64: &str) -> Result<Vec<u8>, String> {
    let body = match b64.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => b64,
    };
    let cleaned: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(cleaned)
        .map_err(|e| format!("invalid base64: {e}"))
}
