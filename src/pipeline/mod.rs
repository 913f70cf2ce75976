//! Pipeline stages for document-to-ZPL conversion.
//!
//! Each submodule implements one transformation step and is testable on its
//! own; [`crate::process`] strings them together and records the stages.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ locate ──▶ normalize ──▶ zpl ──▶ (print queue)
//! (bytes)   (pdfium)   (vision)   (1-bit)       (^GF)
//! ```
//!
//! 1. [`input`]  — request bodies, documents and media-type detection
//! 2. [`render`] — rasterise PDF pages or decode images; pdfium runs in
//!    `spawn_blocking`
//! 3. [`encode`] — PNG/base64 helpers for the vision request and preview
//! 4. [`vision`] — vision-service seam: Anthropic Messages API or any
//!    `edgequake-llm` provider
//! 5. [`locate`] — ask the vision service for the label box and validate it
//! 6. [`normalize`] — crop, orient, scale and dither onto the label canvas
//! 7. [`zpl`]    — `^GF` graphic-field codec and label framing

pub mod encode;
pub mod input;
pub mod locate;
pub mod normalize;
pub mod render;
pub mod vision;
pub mod zpl;
