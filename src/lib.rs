//! # zpl-label
//!
//! Turn shipping-label documents (PDF or raster image) into ZPL for thermal
//! label printers.
//!
//! Carrier labels arrive as letter-size PDFs, phone screenshots or scans,
//! with the label somewhere on the page and often sideways. This crate finds
//! the label (optionally with a vision model), fits it onto the physical
//! label stock at the printer's resolution, dithers it to 1 bit and wraps it
//! in a `^GF` graphic field the printer can consume directly.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / PNG / JPEG
//!  │
//!  ├─ 1. Received    media type detected, bytes shared read-only
//!  ├─ 2. Rasterized  pdfium at 300 dpi, or image decode (spawn_blocking)
//!  ├─ 3. Located     vision model box, or full-page fallback
//!  ├─ 4. Normalized  crop, rotate, scale, dither to exactly W×H dots
//!  ├─ 5. Encoded     ^GFA graphic field (Z64, hex or compressed hex)
//!  └─ 6. Submitted   CUPS raw job via `lp`, or a file
//! ```
//!
//! Each request produces one [`PipelineResult`] carrying the ordered stage
//! records, a 1-bit PNG preview and either the print job or the error.
//! Locator problems never fail a request in the default mode; they are
//! reported in the `located` stage detail and the full page is printed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use zpl_label::{Document, LabelPipeline, PrintRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // ZLP_PRINTER_NAME, ZLP_ANTHROPIC_API_KEY, ZLP_LABEL_* …
//!     let pipeline = LabelPipeline::from_env()?;
//!     let document = Document::from_path("label.pdf").await?;
//!     let result = pipeline.run(PrintRequest::new(document)).await;
//!     for stage in &result.stages {
//!         eprintln!("{:<11} {:>6.2}s  {}", stage.name, stage.elapsed_seconds, stage.detail);
//!     }
//!     println!("{}", result.message);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `zlp` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ## Vision Services
//!
//! | Source | Selected by |
//! |--------|-------------|
//! | Injected [`VisionService`] | [`LabelConfigBuilder::vision`] |
//! | `edgequake-llm` provider (openai, gemini, ollama, …) | `ZLP_VISION_PROVIDER` |
//! | Anthropic Messages API | `ZLP_ANTHROPIC_API_KEY` |
//!
//! With none of these the locator prints the whole page.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod bitmap;
pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod print;
pub mod process;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use bitmap::MonoBitmap;
pub use config::{
    DitherMode, GraphicEncoding, LabelConfig, LabelConfigBuilder, LocateMode, PageStrategy,
    ScalePolicy,
};
pub use error::{LabelError, LocatorDegraded};
pub use output::{PipelineResult, Stage, StageRecord};
pub use pipeline::input::{Document, MediaType, PrintRequest, PrintRequestBody, ScaleParam};
pub use pipeline::locate::{BoundingBox, LabelLocator, LocateOutcome};
pub use pipeline::vision::{AnthropicVision, ProviderVision, VisionError, VisionService};
pub use pipeline::zpl::{decode_graphic_field, decode_label, encode_label, ZplPayload};
pub use print::{FileSink, LpPrintQueue, PrintJob, PrintQueue, PrinterInfo, PrinterListing};
pub use process::LabelPipeline;
pub use progress::{NoopStageCallback, StageCallback, StageCallbackRef};
