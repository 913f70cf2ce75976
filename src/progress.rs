//! Stage-callback trait for live pipeline events.
//!
//! Inject an [`Arc<dyn StageCallback>`] via
//! [`crate::config::LabelConfigBuilder::stage_callback`] to see each
//! [`StageRecord`] the moment it is appended, rather than only in the final
//! [`crate::output::PipelineResult`].
//!
//! # Example
//!
//! ```rust
//! use zpl_label::{LabelConfig, StageCallback, StageRecord};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     stages: AtomicUsize,
//! }
//!
//! impl StageCallback for CountingCallback {
//!     fn on_stage_complete(&self, record: &StageRecord) {
//!         self.stages.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{}: {}", record.name, record.detail);
//!     }
//! }
//!
//! let config = LabelConfig::builder()
//!     .stage_callback(Arc::new(CountingCallback { stages: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::StageRecord;
use std::sync::Arc;

/// Called by the pipeline as a request moves through its stages.
///
/// Implementations must be `Send + Sync`: one config (and its callback) is
/// shared by every concurrent request. All methods default to no-ops.
pub trait StageCallback: Send + Sync {
    /// Called once when a request enters the pipeline.
    fn on_request_start(&self, filename: &str) {
        let _ = filename;
    }

    /// Called after each stage record is appended.
    fn on_stage_complete(&self, record: &StageRecord) {
        let _ = record;
    }

    /// Called once when the request fails.
    fn on_failed(&self, error: &str) {
        let _ = error;
    }

    /// Called once when the request succeeds.
    fn on_succeeded(&self, total_seconds: f64) {
        let _ = total_seconds;
    }
}

/// A no-op implementation for callers that don't need stage events.
pub struct NoopStageCallback;

impl StageCallback for NoopStageCallback {}

/// Convenience alias matching the type stored in [`crate::config::LabelConfig`].
pub type StageCallbackRef = Arc<dyn StageCallback>;
