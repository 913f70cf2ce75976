//! Stage records and the terminal pipeline result.
//!
//! A request appends one [`StageRecord`] per completed stage to a
//! [`StageTracker`] it owns. The tracker is consumed exactly once, by
//! [`StageTracker::succeed`] or [`StageTracker::fail`], which moves the
//! ordered records into the [`PipelineResult`] returned to the caller.

use crate::error::LabelError;
use crate::pipeline::zpl::ZplPayload;
use crate::print::PrintJob;
use crate::progress::StageCallbackRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tracing::info;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Received,
    Rasterized,
    Located,
    Normalized,
    Encoded,
    Submitted,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Rasterized => "rasterized",
            Stage::Located => "located",
            Stage::Normalized => "normalized",
            Stage::Encoded => "encoded",
            Stage::Submitted => "submitted",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed pipeline phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage name, lowercase (`"rasterized"`, `"located"`, …).
    pub name: String,
    /// Human-readable diagnostic, e.g. `"page 1 of 2, 1275x1650"`.
    pub detail: String,
    /// Wall-clock time spent in this phase.
    pub elapsed_seconds: f64,
}

impl StageRecord {
    pub fn new(stage: Stage, detail: impl Into<String>, elapsed_seconds: f64) -> Self {
        Self {
            name: stage.as_str().to_string(),
            detail: detail.into(),
            elapsed_seconds,
        }
    }
}

/// The terminal artifact of one print request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    /// Summary line on success, the error text on failure.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Completed stages in execution order, present on success and failure.
    pub stages: Vec<StageRecord>,
    /// Base64 PNG of the normalized 1-bit label, once normalization succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_base64: Option<String>,
    /// Print-queue receipt on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<PrintJob>,
    /// Wall-clock time for the whole request.
    pub total_seconds: f64,
    /// The encoded label, once encoding succeeded.
    #[serde(skip)]
    pub payload: Option<ZplPayload>,
}

impl PipelineResult {
    /// Names of the recorded stages, in order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Append-only stage log for one request.
pub struct StageTracker {
    started: Instant,
    phase_start: Instant,
    stages: Vec<StageRecord>,
    preview_base64: Option<String>,
    payload: Option<ZplPayload>,
    callback: Option<StageCallbackRef>,
}

impl StageTracker {
    pub fn new(callback: Option<StageCallbackRef>) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            phase_start: now,
            stages: Vec::with_capacity(6),
            preview_base64: None,
            payload: None,
            callback,
        }
    }

    /// Close the current phase and append its record.
    pub fn record(&mut self, stage: Stage, detail: impl Into<String>) {
        let now = Instant::now();
        let elapsed = round_ms(now.duration_since(self.phase_start).as_secs_f64());
        self.phase_start = now;

        let record = StageRecord::new(stage, detail, elapsed);
        info!("Stage: {} {} ({:.3}s)", record.name, record.detail, elapsed);
        if let Some(ref cb) = self.callback {
            cb.on_stage_complete(&record);
        }
        self.stages.push(record);
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    pub fn set_preview(&mut self, preview_base64: String) {
        self.preview_base64 = Some(preview_base64);
    }

    pub fn set_payload(&mut self, payload: ZplPayload) {
        self.payload = Some(payload);
    }

    fn total_seconds(&self) -> f64 {
        round_ms(self.started.elapsed().as_secs_f64())
    }

    /// Finish the request successfully.
    pub fn succeed(self, message: impl Into<String>, job: Option<PrintJob>) -> PipelineResult {
        let total_seconds = self.total_seconds();
        if let Some(ref cb) = self.callback {
            cb.on_succeeded(total_seconds);
        }
        PipelineResult {
            success: true,
            message: message.into(),
            error: None,
            stages: self.stages,
            preview_base64: self.preview_base64,
            job,
            total_seconds,
            payload: self.payload,
        }
    }

    /// Finish the request with `error`, keeping every completed stage.
    pub fn fail(self, error: &LabelError) -> PipelineResult {
        let total_seconds = self.total_seconds();
        let text = error.to_string();
        if let Some(ref cb) = self.callback {
            cb.on_failed(&text);
        }
        PipelineResult {
            success: false,
            message: text.clone(),
            error: Some(text),
            stages: self.stages,
            preview_base64: self.preview_base64,
            job: None,
            total_seconds,
            payload: self.payload,
        }
    }
}

fn round_ms(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_appends_in_order() {
        let mut t = StageTracker::new(None);
        t.record(Stage::Received, "type=image");
        t.record(Stage::Rasterized, "1 page");
        let names: Vec<_> = t.stages().iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["received", "rasterized"]);
        assert!(t.stages().iter().all(|s| s.elapsed_seconds >= 0.0));
    }

    #[test]
    fn fail_keeps_recorded_stages() {
        let mut t = StageTracker::new(None);
        t.record(Stage::Received, "type=image");
        t.record(Stage::Rasterized, "1 page");
        let err = LabelError::ImageProcessing("zero-area crop".into());
        let result = t.fail(&err);
        assert!(!result.success);
        assert_eq!(result.stage_names(), vec!["received", "rasterized"]);
        assert!(result.error.as_deref().unwrap().contains("zero-area"));
        assert_eq!(result.message, result.error.clone().unwrap());
    }

    #[test]
    fn result_json_shape() {
        let mut t = StageTracker::new(None);
        t.record(Stage::Received, "type=pdf");
        let json = serde_json::to_value(t.succeed("printed", None)).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["stages"][0]["name"], "received");
        assert!(json["stages"][0]["elapsed_seconds"].is_number());
        assert!(json.get("error").is_none());
        assert!(json.get("preview_base64").is_none());
    }

    #[test]
    fn round_ms_rounds() {
        assert_eq!(round_ms(1.23456), 1.235);
        assert_eq!(round_ms(0.0), 0.0);
    }
}
