//! Label locator: find the shipping-label rectangle on a page raster.
//!
//! The locator never fails. Every problem on the way (no service configured,
//! network error, timeout, unparsable reply, implausible box) degrades to a
//! full-page [`LocateOutcome::Fallback`] carrying the reason, which the
//! orchestrator writes into the stage detail.
//!
//! ## Reply contract
//!
//! The model answers with a JSON object, possibly wrapped in prose or code
//! fences; everything between the first `{` and the last `}` is parsed.
//!
//! ```text
//! {"found": true, "x1": 40, "y1": 60, "x2": 1240, "y2": 1860}     pixels
//! {"x1_pct": 3.1, "y1_pct": 3.6, "x2_pct": 97.2, "y2_pct": 96.4}   percent of the image
//! {"found": false}  or  {"no_label": true}                         no label
//! ```

use crate::config::LabelConfig;
use crate::error::LocatorDegraded;
use crate::pipeline::encode::{prepare_vision_image, VISION_MAX_EDGE};
use crate::pipeline::render::PageRaster;
use crate::pipeline::vision::{resolve_vision, VisionService};
use crate::prompts::locator_prompt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Boxes may overshoot the page by this many pixels before being rejected.
pub const EDGE_TOLERANCE_PX: f64 = 5.0;

/// Boxes covering less than this fraction of the page are rejected.
pub const MIN_AREA_FRACTION: f64 = 0.10;

/// Pixel rectangle within a page raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The whole page.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_full_page(&self, width: u32, height: u32) -> bool {
        *self == Self::full(width, height)
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} at ({},{})", self.width, self.height, self.x, self.y)
    }
}

/// Result of locating a label on one page.
#[derive(Debug, Clone, PartialEq)]
pub enum LocateOutcome {
    /// A validated box, already clamped to the page.
    Located(BoundingBox),
    /// Use the full page; the reason is diagnostic only.
    Fallback(LocatorDegraded),
}

impl LocateOutcome {
    pub fn is_located(&self) -> bool {
        matches!(self, LocateOutcome::Located(_))
    }

    /// The box to crop to on a page of `width`×`height`.
    pub fn bounding_box(&self, width: u32, height: u32) -> BoundingBox {
        match self {
            LocateOutcome::Located(b) => *b,
            LocateOutcome::Fallback(_) => BoundingBox::full(width, height),
        }
    }

    /// Stage-record detail text.
    pub fn detail(&self) -> String {
        match self {
            LocateOutcome::Located(b) => format!("cropped to {b}"),
            LocateOutcome::Fallback(reason) => format!("full page ({reason})"),
        }
    }
}

/// Box corners as returned by the model, in floating-point pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl RawBox {
    fn scaled(self, factor: f64) -> Self {
        Self {
            x1: self.x1 * factor,
            y1: self.y1 * factor,
            x2: self.x2 * factor,
            y2: self.y2 * factor,
        }
    }
}

/// What a reply said, before validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParsedReply {
    Box(RawBox),
    NoLabel,
}

/// Parse a model reply for an image of `width`×`height` pixels.
pub fn parse_reply(text: &str, width: u32, height: u32) -> Result<ParsedReply, LocatorDegraded> {
    let malformed = |detail: &str| LocatorDegraded::Malformed {
        detail: detail.to_string(),
    };

    let start = text.find('{').ok_or_else(|| malformed("no JSON object in reply"))?;
    let end = text.rfind('}').ok_or_else(|| malformed("no JSON object in reply"))?;
    if end < start {
        return Err(malformed("no JSON object in reply"));
    }
    let value: Value = serde_json::from_str(&text[start..=end])
        .map_err(|e| malformed(&format!("invalid JSON: {e}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| malformed("reply is not a JSON object"))?;

    if obj.get("found").and_then(Value::as_bool) == Some(false)
        || obj.get("no_label").and_then(Value::as_bool) == Some(true)
    {
        return Ok(ParsedReply::NoLabel);
    }

    let coord = |key: &str| obj.get(key).and_then(number);
    if let (Some(x1), Some(y1), Some(x2), Some(y2)) =
        (coord("x1"), coord("y1"), coord("x2"), coord("y2"))
    {
        return Ok(ParsedReply::Box(RawBox { x1, y1, x2, y2 }));
    }
    if let (Some(x1), Some(y1), Some(x2), Some(y2)) = (
        coord("x1_pct"),
        coord("y1_pct"),
        coord("x2_pct"),
        coord("y2_pct"),
    ) {
        let (w, h) = (width as f64, height as f64);
        return Ok(ParsedReply::Box(RawBox {
            x1: x1 / 100.0 * w,
            y1: y1 / 100.0 * h,
            x2: x2 / 100.0 * w,
            y2: y2 / 100.0 * h,
        }));
    }

    Err(malformed("missing x1/y1/x2/y2 coordinates"))
}

fn number(v: &Value) -> Option<f64> {
    let n: Option<f64> = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    n.filter(|f| f.is_finite())
}

/// Check a raw box against a page of `width`×`height` and clamp it.
pub fn validate_bbox(raw: RawBox, width: u32, height: u32) -> Result<BoundingBox, LocatorDegraded> {
    let rejected = |detail: String| LocatorDegraded::Rejected { detail };
    let (w, h) = (width as f64, height as f64);

    if raw.x2 <= raw.x1 || raw.y2 <= raw.y1 {
        return Err(rejected(format!(
            "degenerate box ({:.0},{:.0})-({:.0},{:.0})",
            raw.x1, raw.y1, raw.x2, raw.y2
        )));
    }
    if raw.x1 < -EDGE_TOLERANCE_PX
        || raw.y1 < -EDGE_TOLERANCE_PX
        || raw.x2 > w + EDGE_TOLERANCE_PX
        || raw.y2 > h + EDGE_TOLERANCE_PX
    {
        return Err(rejected(format!(
            "box ({:.0},{:.0})-({:.0},{:.0}) extends outside the {}x{} page",
            raw.x1, raw.y1, raw.x2, raw.y2, width, height
        )));
    }

    let left = raw.x1.clamp(0.0, w).round() as u32;
    let top = raw.y1.clamp(0.0, h).round() as u32;
    let right = raw.x2.clamp(0.0, w).round() as u32;
    let bottom = raw.y2.clamp(0.0, h).round() as u32;
    if right <= left || bottom <= top {
        return Err(rejected("box collapses after clamping".into()));
    }

    let bbox = BoundingBox::new(left, top, right - left, bottom - top);
    let page_area = width as f64 * height as f64;
    let fraction = bbox.area() as f64 / page_area;
    if fraction < MIN_AREA_FRACTION {
        return Err(rejected(format!(
            "box covers only {:.1}% of the page",
            fraction * 100.0
        )));
    }
    Ok(bbox)
}

/// Locates labels on page rasters through an optional vision service.
pub struct LabelLocator {
    service: Option<Arc<dyn VisionService>>,
    /// Why a configured service could not be built.
    unavailable: Option<String>,
    timeout: Duration,
    max_edge: u32,
}

impl LabelLocator {
    pub fn new(service: Option<Arc<dyn VisionService>>, timeout: Duration) -> Self {
        Self {
            service,
            unavailable: None,
            timeout,
            max_edge: VISION_MAX_EDGE,
        }
    }

    /// Build from config, resolving the vision service.
    ///
    /// A provider that cannot be constructed does not fail the pipeline; every
    /// locate call then falls back with the construction error.
    pub fn from_config(config: &LabelConfig) -> Self {
        let timeout = Duration::from_secs(config.vision_timeout_secs);
        match resolve_vision(config) {
            Ok(service) => Self::new(service, timeout),
            Err(e) => {
                warn!("Vision service unavailable: {}", e);
                let mut locator = Self::new(None, timeout);
                locator.unavailable = Some(e.to_string());
                locator
            }
        }
    }

    /// Longest edge of the image sent to the service.
    pub fn with_max_edge(mut self, max_edge: u32) -> Self {
        self.max_edge = max_edge.max(64);
        self
    }

    pub fn has_service(&self) -> bool {
        self.service.is_some()
    }

    /// Locate the label on `raster`.
    pub async fn locate(&self, raster: &PageRaster) -> LocateOutcome {
        let Some(service) = self.service.as_ref() else {
            let reason = match &self.unavailable {
                Some(detail) => LocatorDegraded::Service {
                    detail: detail.clone(),
                },
                None => LocatorDegraded::NoService,
            };
            info!("Page {}: {}", raster.index + 1, reason);
            return LocateOutcome::Fallback(reason);
        };

        let (page_w, page_h) = (raster.width(), raster.height());
        let page = raster.image.clone();
        let max_edge = self.max_edge;
        let image = match tokio::task::spawn_blocking(move || prepare_vision_image(&page, max_edge))
            .await
        {
            Ok(Ok(image)) => image,
            Ok(Err(e)) => return self.degrade(raster, LocatorDegraded::Service { detail: e.to_string() }),
            Err(e) => {
                return self.degrade(
                    raster,
                    LocatorDegraded::Service {
                        detail: format!("encode task panicked: {e}"),
                    },
                )
            }
        };

        let prompt = locator_prompt(image.width, image.height);
        debug!(
            "Page {}: asking {} ({}x{} px sent)",
            raster.index + 1,
            service.name(),
            image.width,
            image.height
        );

        let reply = match tokio::time::timeout(self.timeout, service.complete(&image, &prompt)).await
        {
            Err(_) => {
                return self.degrade(
                    raster,
                    LocatorDegraded::Timeout {
                        secs: self.timeout.as_secs_f64(),
                    },
                )
            }
            Ok(Err(e)) => {
                return self.degrade(raster, LocatorDegraded::Service { detail: e.to_string() })
            }
            Ok(Ok(text)) => text,
        };

        let outcome = match parse_reply(&reply, image.width, image.height) {
            Err(reason) => LocateOutcome::Fallback(reason),
            Ok(ParsedReply::NoLabel) => LocateOutcome::Fallback(LocatorDegraded::NoLabel),
            Ok(ParsedReply::Box(raw)) => match validate_bbox(raw.scaled(image.scale), page_w, page_h)
            {
                Ok(bbox) => LocateOutcome::Located(bbox),
                Err(reason) => LocateOutcome::Fallback(reason),
            },
        };

        match &outcome {
            LocateOutcome::Located(b) => info!("Page {}: label at {}", raster.index + 1, b),
            LocateOutcome::Fallback(reason) => warn!("Page {}: {}", raster.index + 1, reason),
        }
        outcome
    }

    fn degrade(&self, raster: &PageRaster, reason: LocatorDegraded) -> LocateOutcome {
        warn!("Page {}: {}", raster.index + 1, reason);
        LocateOutcome::Fallback(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::encode::VisionImage;
    use crate::pipeline::vision::VisionError;
    use async_trait::async_trait;
    use image::{DynamicImage, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        reply: Result<String, String>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn ok(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(detail: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(detail.to_string()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok("{}".into()),
                delay,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl VisionService for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _image: &VisionImage, _prompt: &str) -> Result<String, VisionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.reply.clone().map_err(VisionError::Transport)
        }
    }

    fn page(w: u32, h: u32) -> PageRaster {
        PageRaster {
            index: 0,
            image: DynamicImage::ImageRgb8(RgbImage::new(w, h)),
            dpi: 300,
        }
    }

    fn locator(service: Arc<Scripted>) -> LabelLocator {
        LabelLocator::new(Some(service), Duration::from_secs(5))
    }

    #[test]
    fn parse_pixel_keys_inside_prose() {
        let reply = "Sure! ```json\n{\"found\": true, \"x1\": 10, \"y1\": 20, \"x2\": 110, \"y2\": 220}\n```";
        assert_eq!(
            parse_reply(reply, 500, 500).unwrap(),
            ParsedReply::Box(RawBox {
                x1: 10.0,
                y1: 20.0,
                x2: 110.0,
                y2: 220.0
            })
        );
    }

    #[test]
    fn parse_percentage_keys() {
        let reply = r#"{"x1_pct": 10, "y1_pct": 25, "x2_pct": 90, "y2_pct": 75}"#;
        let ParsedReply::Box(b) = parse_reply(reply, 200, 400).unwrap() else {
            panic!("expected a box");
        };
        assert_eq!((b.x1, b.y1, b.x2, b.y2), (20.0, 100.0, 180.0, 300.0));
    }

    #[test]
    fn parse_no_label_variants() {
        assert_eq!(parse_reply(r#"{"found": false}"#, 1, 1).unwrap(), ParsedReply::NoLabel);
        assert_eq!(
            parse_reply(r#"{"no_label": true, "x1": 0}"#, 1, 1).unwrap(),
            ParsedReply::NoLabel
        );
    }

    #[test]
    fn parse_malformed_replies() {
        for reply in ["I could not find it.", "} backwards {", r#"{"x1": 1, "y1": 2}"#, "{not json}"] {
            let err = parse_reply(reply, 100, 100).unwrap_err();
            assert!(matches!(err, LocatorDegraded::Malformed { .. }), "{reply}: {err}");
        }
    }

    #[test]
    fn validate_clamps_within_tolerance() {
        let raw = RawBox {
            x1: -3.0,
            y1: -4.0,
            x2: 104.0,
            y2: 52.0,
        };
        assert_eq!(validate_bbox(raw, 100, 100).unwrap(), BoundingBox::new(0, 0, 100, 52));
    }

    #[test]
    fn validate_rejects_bad_boxes() {
        let check = |raw: RawBox| validate_bbox(raw, 100, 100).unwrap_err();
        let degenerate = check(RawBox {
            x1: 50.0,
            y1: 10.0,
            x2: 50.0,
            y2: 90.0,
        });
        assert!(degenerate.to_string().contains("degenerate"));

        let outside = check(RawBox {
            x1: 0.0,
            y1: 0.0,
            x2: 110.0,
            y2: 100.0,
        });
        assert!(outside.to_string().contains("outside"));

        let tiny = check(RawBox {
            x1: 0.0,
            y1: 0.0,
            x2: 30.0,
            y2: 30.0,
        });
        assert!(tiny.to_string().contains("9.0%"), "{tiny}");
    }

    #[test]
    fn outcome_detail_text() {
        let located = LocateOutcome::Located(BoundingBox::new(1, 2, 30, 40));
        assert_eq!(located.detail(), "cropped to 30x40 at (1,2)");
        let fb = LocateOutcome::Fallback(LocatorDegraded::NoService);
        assert_eq!(fb.detail(), "full page (fallback: no API key)");
        assert_eq!(fb.bounding_box(7, 9), BoundingBox::full(7, 9));
    }

    #[tokio::test]
    async fn no_service_falls_back_without_io() {
        let l = LabelLocator::new(None, Duration::from_secs(30));
        assert!(!l.has_service());
        let outcome = l.locate(&page(50, 80)).await;
        assert_eq!(outcome, LocateOutcome::Fallback(LocatorDegraded::NoService));
    }

    #[tokio::test]
    async fn located_box_is_returned() {
        let svc = Scripted::ok(r#"{"found":true,"x1":10,"y1":10,"x2":90,"y2":190}"#);
        let outcome = locator(svc.clone()).locate(&page(100, 200)).await;
        assert_eq!(outcome, LocateOutcome::Located(BoundingBox::new(10, 10, 80, 180)));
        assert_eq!(svc.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn box_from_downscaled_image_maps_back_to_page() {
        // 400x800 page sent at 200x400: the model's coordinates are halved.
        let svc = Scripted::ok(r#"{"x1":0,"y1":0,"x2":100,"y2":200}"#);
        let outcome = LabelLocator::new(Some(svc), Duration::from_secs(5))
            .with_max_edge(400)
            .locate(&page(400, 800))
            .await;
        assert_eq!(outcome, LocateOutcome::Located(BoundingBox::new(0, 0, 200, 400)));
    }

    #[tokio::test]
    async fn service_error_degrades() {
        let outcome = locator(Scripted::failing("connection refused"))
            .locate(&page(100, 100))
            .await;
        match outcome {
            LocateOutcome::Fallback(LocatorDegraded::Service { detail }) => {
                assert!(detail.contains("connection refused"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_degrades() {
        let l = LabelLocator::new(
            Some(Scripted::slow(Duration::from_secs(10))),
            Duration::from_millis(50),
        );
        let outcome = l.locate(&page(20, 20)).await;
        assert_eq!(
            outcome,
            LocateOutcome::Fallback(LocatorDegraded::Timeout { secs: 0.05 })
        );
        assert!(outcome.detail().contains("after 0.05s"), "{}", outcome.detail());
    }

    #[tokio::test]
    async fn no_label_reply_degrades() {
        let outcome = locator(Scripted::ok(r#"{"found": false}"#))
            .locate(&page(100, 100))
            .await;
        assert_eq!(outcome, LocateOutcome::Fallback(LocatorDegraded::NoLabel));
    }
}
