//! Error types for the zpl-label library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`LabelError`] — **Fatal**: the print request cannot proceed (the input
//!   is not a document we can read, normalization produced nothing, the
//!   print queue refused the job). It aborts the pipeline at the failing
//!   stage and becomes the error of the [`crate::output::PipelineResult`].
//!
//! * [`LocatorDegraded`] — **Non-fatal**: the vision service could not be
//!   used or gave an answer we could not trust. The locator recovers locally
//!   by falling back to the full page, and the reason is only reported in
//!   the stage detail.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the zpl-label library.
///
/// Locator problems use [`LocatorDegraded`] and never surface here unless
/// strict mode turns them into [`LabelError::LabelNotFound`].
#[derive(Debug, Error)]
pub enum LabelError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The request named a file that does not exist.
    #[error("Input file not found: {path}")]
    FileNotFound { path: PathBuf },

    /// The request named a file the process is not allowed to read.
    #[error("Permission denied reading: {path}")]
    PermissionDenied { path: PathBuf },

    /// The request body is inconsistent (no document, or two of them).
    #[error("Invalid print request: {0}")]
    InvalidRequest(String),

    /// The bytes are not a PDF or an image format we can decode.
    #[error("Unsupported document format for '{filename}': {detail}")]
    UnsupportedFormat { filename: String, detail: String },

    /// The format was recognised but the document could not be parsed.
    #[error("Failed to parse document '{filename}': {detail}\nThe file may be truncated or corrupt.")]
    CorruptDocument { filename: String, detail: String },

    /// A page index past the end of the document was requested.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    // ── Locator errors (strict mode only) ─────────────────────────────────
    /// Strict mode was requested and no trustworthy label box was found.
    #[error("No shipping label found: {reason}")]
    LabelNotFound { reason: String },

    // ── Processing errors ─────────────────────────────────────────────────
    /// Cropping, scaling or dithering could not produce a label image.
    #[error("Image processing failed: {0}")]
    ImageProcessing(String),

    /// The ZPL codec hit an internal invariant violation or malformed data.
    #[error("ZPL encoding failed: {0}")]
    Encoding(String),

    // ── Printing errors ───────────────────────────────────────────────────
    /// The print queue rejected or failed to accept the job.
    #[error("Print submission to '{printer}' failed: {detail}")]
    PrintSubmission { printer: String, detail: String },

    /// Listing the available print queues failed.
    #[error("Printer discovery failed: {0}")]
    PrinterDiscovery(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or environment validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
PDF input needs the pdfium shared library. You can:\n\
  • Place libpdfium next to the binary (or in the working directory).\n\
  • Install it system-wide so the dynamic loader can find it.\n\
  • Set ZLP_PDFIUM_LIB_PATH=/path/to/libpdfium.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LabelError {
    /// True for failures caused by the input document itself.
    pub fn is_document_error(&self) -> bool {
        matches!(
            self,
            LabelError::UnsupportedFormat { .. }
                | LabelError::CorruptDocument { .. }
                | LabelError::PageOutOfRange { .. }
        )
    }
}

/// Why the locator fell back to the full page.
///
/// Carried inside [`crate::pipeline::locate::LocateOutcome::Fallback`] and
/// rendered into the `Located` stage detail.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum LocatorDegraded {
    /// No credential or provider is configured. The documented degraded mode.
    #[error("fallback: no API key")]
    NoService,

    /// The vision call did not finish within the configured bound.
    #[error("fallback: vision service timed out after {secs}s")]
    Timeout { secs: f64 },

    /// Network failure, HTTP error status or provider error.
    #[error("fallback: vision service error: {detail}")]
    Service { detail: String },

    /// The reply could not be parsed as a bounding box.
    #[error("fallback: malformed response: {detail}")]
    Malformed { detail: String },

    /// The service answered that the page holds no shipping label.
    #[error("fallback: no label detected")]
    NoLabel,

    /// A box was parsed but failed validation against the page.
    #[error("fallback: rejected box: {detail}")]
    Rejected { detail: String },
}
