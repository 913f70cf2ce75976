//! Orchestrator: run one print request through every stage.
//!
//! ```text
//! Received ──▶ Rasterized ──▶ Located ──▶ Normalized ──▶ Encoded ──▶ Submitted
//!                                                                     │
//!                        any stage error ──▶ Failed      success ◀────┘
//! ```
//!
//! Each completed stage appends one record to the request's
//! [`StageTracker`]. The first error stops the run; the records collected so
//! far travel with the error in the [`PipelineResult`]. A [`LabelPipeline`]
//! holds only read-only config and shared collaborators, so one instance
//! serves any number of concurrent requests.

use crate::config::{LabelConfig, LocateMode, PageStrategy};
use crate::error::LabelError;
use crate::output::{PipelineResult, Stage, StageTracker};
use crate::pipeline::encode::preview_png_base64;
use crate::pipeline::input::{PrintRequest, PrintRequestBody};
use crate::pipeline::locate::{LabelLocator, LocateOutcome};
use crate::pipeline::normalize::normalize;
use crate::pipeline::render::{rasterize_pages, PageRaster, Rasterized};
use crate::pipeline::zpl::encode_label;
use crate::print::{LpPrintQueue, PrintJob, PrintQueue, PrinterListing};
use std::sync::Arc;
use tracing::{info, warn};

/// The label pipeline: config, locator and print queue.
pub struct LabelPipeline {
    config: Arc<LabelConfig>,
    locator: LabelLocator,
    queue: Arc<dyn PrintQueue>,
}

impl LabelPipeline {
    pub fn new(config: LabelConfig, queue: Arc<dyn PrintQueue>) -> Self {
        let locator = LabelLocator::from_config(&config);
        info!(
            "Label pipeline: {}x{} dots @ {} dpi, vision={}, encoding={}",
            config.label_width_px(),
            config.label_height_px(),
            config.label_dpi,
            locator.has_service(),
            config.encoding
        );
        Self {
            config: Arc::new(config),
            locator,
            queue,
        }
    }

    /// Config from the `ZLP_*` environment, printing through CUPS.
    pub fn from_env() -> Result<Self, LabelError> {
        let config = LabelConfig::from_env()?;
        let queue = Arc::new(LpPrintQueue::from_config(&config));
        Ok(Self::new(config, queue))
    }

    pub fn config(&self) -> &LabelConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<dyn PrintQueue> {
        &self.queue
    }

    /// Resolve a JSON request body, then run it.
    ///
    /// A body that cannot be resolved fails with no stage records.
    pub async fn run_body(&self, body: PrintRequestBody) -> PipelineResult {
        match body.resolve().await {
            Ok(request) => self.run(request).await,
            Err(e) => {
                warn!("Rejected request: {}", e);
                StageTracker::new(self.config.stage_callback.clone()).fail(&e)
            }
        }
    }

    /// Run one request to completion. Never panics, never returns `Err`:
    /// failures are reported inside the result.
    pub async fn run(&self, request: PrintRequest) -> PipelineResult {
        if let Some(ref cb) = self.config.stage_callback {
            cb.on_request_start(request.document.filename());
        }
        let mut tracker = StageTracker::new(self.config.stage_callback.clone());

        match self.execute(&request, &mut tracker).await {
            Ok(job) => {
                let message = match job.job_id {
                    Some(ref id) => format!("Label sent to {} (job {})", job.printer, id),
                    None => format!("Label sent to {}", job.printer),
                };
                tracker.succeed(message, Some(job))
            }
            Err(e) => {
                warn!("Request '{}' failed: {}", request.document.filename(), e);
                tracker.fail(&e)
            }
        }
    }

    async fn execute(
        &self,
        request: &PrintRequest,
        tracker: &mut StageTracker,
    ) -> Result<PrintJob, LabelError> {
        let document = &request.document;
        tracker.record(
            Stage::Received,
            format!(
                "type={}, {} bytes, {}",
                document.media_type(),
                document.len(),
                document.filename()
            ),
        );

        // ── Rasterize ─────────────────────────────────────────────────────
        let limit = self.page_limit();
        let Rasterized { pages, total_pages } =
            rasterize_pages(document, &self.config, limit).await?;
        let first = pages.first().ok_or_else(|| LabelError::CorruptDocument {
            filename: document.filename().to_string(),
            detail: "no pages rendered".into(),
        })?;
        tracker.record(
            Stage::Rasterized,
            format!(
                "{} of {} page(s), {}x{} px",
                pages.len(),
                total_pages,
                first.width(),
                first.height()
            ),
        );

        // ── Locate ────────────────────────────────────────────────────────
        let (page_index, outcome) = self.locate(&pages).await;
        if self.config.locate_mode == LocateMode::Strict {
            if let LocateOutcome::Fallback(ref reason) = outcome {
                return Err(LabelError::LabelNotFound {
                    reason: reason.to_string(),
                });
            }
        }
        let detail = if pages.len() > 1 {
            format!("page {}: {}", page_index + 1, outcome.detail())
        } else {
            outcome.detail()
        };
        tracker.record(Stage::Located, detail);

        // ── Normalize ─────────────────────────────────────────────────────
        let raster = pages
            .into_iter()
            .nth(page_index)
            .ok_or_else(|| LabelError::Internal(format!("page {} vanished", page_index + 1)))?;
        let bbox = outcome.bounding_box(raster.width(), raster.height());
        let scale = request.scale.unwrap_or(self.config.scale);
        let config = Arc::clone(&self.config);
        let (label, preview) = blocking("Normalize", move || {
            let label = normalize(&raster, bbox, &config, scale)?;
            let preview = preview_png_base64(&label.bitmap)?;
            Ok((label, preview))
        })
        .await?;
        tracker.set_preview(preview);
        tracker.record(Stage::Normalized, label.detail());

        // ── Encode ────────────────────────────────────────────────────────
        let encoding = self.config.encoding;
        let bitmap = label.bitmap;
        let payload = blocking("Encode", move || encode_label(&bitmap, encoding)).await?;
        tracker.record(
            Stage::Encoded,
            format!(
                "{} bytes ({}), {}x{} dots",
                payload.len(),
                payload.encoding(),
                payload.width_dots(),
                payload.height_dots()
            ),
        );
        tracker.set_payload(payload.clone());

        // ── Submit ────────────────────────────────────────────────────────
        let printer = request
            .printer
            .clone()
            .or_else(|| self.config.printer_name.clone())
            .ok_or_else(|| LabelError::PrintSubmission {
                printer: "(none)".into(),
                detail: "no printer named in the request and no default configured".into(),
            })?;
        let job = self.queue.submit(&printer, &payload).await?;
        tracker.record(
            Stage::Submitted,
            match job.job_id {
                Some(ref id) => format!("job {} on {}", id, job.printer),
                None => format!("sent to {}", job.printer),
            },
        );
        Ok(job)
    }

    /// Pages to rasterize. Scanning needs a vision service; without one only
    /// page 1 could ever be printed.
    fn page_limit(&self) -> Option<usize> {
        match self.config.page_strategy {
            PageStrategy::ScanForLabel if self.locator.has_service() => None,
            _ => Some(1),
        }
    }

    /// Printers known to the queue, with the configured printer as default.
    pub async fn list_printers(&self) -> Result<PrinterListing, LabelError> {
        Ok(self
            .queue
            .discover()
            .await?
            .with_configured_default(self.config.printer_name.as_deref()))
    }

    /// Pick the page and box to print.
    ///
    /// With several pages (scan mode) the first located label wins; if none
    /// is found, page 1 is used with its fallback reason.
    async fn locate(&self, pages: &[PageRaster]) -> (usize, LocateOutcome) {
        let Some(first) = pages.first() else {
            return (
                0,
                LocateOutcome::Fallback(crate::error::LocatorDegraded::NoLabel),
            );
        };
        let first_outcome = self.locator.locate(first).await;
        if first_outcome.is_located() || pages.len() == 1 || !self.locator.has_service() {
            return (0, first_outcome);
        }

        info!("Scanning {} page(s) for a label", pages.len());
        for raster in &pages[1..] {
            let outcome = self.locator.locate(raster).await;
            if outcome.is_located() {
                return (raster.index, outcome);
            }
        }
        info!("No label found on any page, falling back to page 1");
        (0, first_outcome)
    }
}

async fn blocking<T, F>(what: &str, f: F) -> Result<T, LabelError>
where
    F: FnOnce() -> Result<T, LabelError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LabelError::Internal(format!("{what} task panicked: {e}")))?
}
