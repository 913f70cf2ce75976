//! End-to-end tests for the label pipeline.
//!
//! Everything here runs offline: the vision service and the print queue are
//! replaced by in-process mocks and the documents are PNGs generated in
//! memory. Tests that rasterize PDFs need a pdfium shared library and are
//! gated behind `PDFIUM_TESTS`:
//!
//!   PDFIUM_TESTS=1 ZLP_PDFIUM_LIB_PATH=/opt/pdfium/lib cargo test --test pipeline

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use zpl_label::pipeline::encode::VisionImage;
use zpl_label::{
    decode_label, encode_label, DitherMode, Document, GraphicEncoding, LabelConfig, LabelError,
    LabelPipeline, MonoBitmap, PageStrategy, PrintJob, PrintQueue, PrintRequest, PrinterInfo,
    StageCallback, StageRecord, VisionError, VisionService, ZplPayload,
};

// ── Test helpers ─────────────────────────────────────────────────────────────

const ALL_STAGES: [&str; 6] = [
    "received",
    "rasterized",
    "located",
    "normalized",
    "encoded",
    "submitted",
];

/// Print queue that keeps every payload it accepts.
#[derive(Default)]
struct RecordingQueue {
    jobs: Mutex<Vec<(String, String)>>,
}

impl RecordingQueue {
    fn count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

#[async_trait]
impl PrintQueue for RecordingQueue {
    async fn submit(&self, printer: &str, payload: &ZplPayload) -> Result<PrintJob, LabelError> {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.push((printer.to_string(), payload.as_str().to_string()));
        Ok(PrintJob {
            printer: printer.to_string(),
            job_id: Some(format!("{printer}-{}", jobs.len())),
        })
    }

    async fn list_printers(&self) -> Result<Vec<PrinterInfo>, LabelError> {
        Ok(Vec::new())
    }
}

/// Print queue whose printer is always offline.
struct OfflineQueue;

#[async_trait]
impl PrintQueue for OfflineQueue {
    async fn submit(&self, printer: &str, _payload: &ZplPayload) -> Result<PrintJob, LabelError> {
        Err(LabelError::PrintSubmission {
            printer: printer.to_string(),
            detail: "printer is offline".into(),
        })
    }

    async fn list_printers(&self) -> Result<Vec<PrinterInfo>, LabelError> {
        Ok(Vec::new())
    }
}

/// Vision service that replays canned replies, one per call.
struct ScriptedVision {
    replies: Mutex<VecDeque<String>>,
    delay: Duration,
}

impl ScriptedVision {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            delay: Duration::ZERO,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            delay,
        })
    }
}

#[async_trait]
impl VisionService for ScriptedVision {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _image: &VisionImage, _prompt: &str) -> Result<String, VisionError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| VisionError::Response("script exhausted".into()))
    }
}

/// A white page with a black rectangle over `[x0, x1) × [y0, y1)`.
fn page_png(w: u32, h: u32, rect: (u32, u32, u32, u32)) -> Vec<u8> {
    let (x0, y0, x1, y1) = rect;
    let img = RgbImage::from_fn(w, h, |x, y| {
        if (x0..x1).contains(&x) && (y0..y1).contains(&y) {
            Rgb([0, 0, 0])
        } else {
            Rgb([255, 255, 255])
        }
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// A 1×1.5 in label at 100 dpi keeps the tests fast: 100×150 dots.
fn small_label() -> zpl_label::LabelConfigBuilder {
    LabelConfig::builder()
        .label_size_inches(1.0, 1.5)
        .label_dpi(100)
        .printer_name("Zebra")
        .dither(DitherMode::Threshold)
}

/// Route library logs through the test harness; `RUST_LOG=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn png_request(bytes: Vec<u8>) -> PrintRequest {
    PrintRequest::new(Document::new(bytes, "label.png").unwrap())
}

// ── End-to-end ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn image_without_credential_runs_every_stage() {
    init_tracing();
    let queue = Arc::new(RecordingQueue::default());
    let config = LabelConfig::default()
        .into_builder()
        .printer_name("Zebra")
        .build()
        .unwrap();
    let pipeline = LabelPipeline::new(config, queue.clone());

    let result = pipeline
        .run(png_request(page_png(400, 600, (50, 50, 350, 550))))
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.stage_names(), ALL_STAGES);
    let located = &result.stages[2].detail;
    assert!(located.contains("no API key"), "{located}");
    assert!(result.preview_base64.is_some());
    assert!(result.error.is_none());

    let payload = result.payload.expect("payload");
    assert!(!payload.is_empty());
    assert_eq!((payload.width_dots(), payload.height_dots()), (812, 1218));
    assert!(payload.as_str().starts_with("^XA"));
    assert!(payload.as_str().contains(":Z64:"));
    assert_eq!(queue.count(), 1);
    assert_eq!(result.job.unwrap().job_id.as_deref(), Some("Zebra-1"));
}

#[tokio::test]
async fn corrupt_document_fails_before_rasterizing() {
    let queue = Arc::new(RecordingQueue::default());
    let pipeline = LabelPipeline::new(small_label().build().unwrap(), queue.clone());

    // A PNG signature followed by garbage.
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.extend_from_slice(b"definitely not an IHDR chunk");
    let result = pipeline.run(png_request(bytes)).await;

    assert!(!result.success);
    assert!(result.stages.len() <= 1);
    let error = result.error.unwrap();
    assert!(error.contains("Failed to parse document"), "{error}");
    assert!(result.preview_base64.is_none());
    assert_eq!(queue.count(), 0);
}

#[tokio::test]
async fn unrecognised_bytes_are_unsupported() {
    let pipeline = LabelPipeline::new(
        small_label().build().unwrap(),
        Arc::new(RecordingQueue::default()),
    );
    let result = pipeline
        .run(PrintRequest::new(
            Document::new(b"hello, world".to_vec(), "notes.txt").unwrap(),
        ))
        .await;
    assert!(!result.success);
    assert!(result.stages.len() <= 1);
}

#[tokio::test]
async fn print_failure_keeps_encoding_records() {
    let pipeline = LabelPipeline::new(small_label().build().unwrap(), Arc::new(OfflineQueue));
    let result = pipeline
        .run(png_request(page_png(200, 300, (20, 20, 180, 280))))
        .await;

    assert!(!result.success);
    assert_eq!(result.stage_names(), &ALL_STAGES[..5]);
    assert!(result.message.contains("printer is offline"), "{}", result.message);
    assert!(result.stages[4].detail.contains("z64"));
    assert!(result.job.is_none());
    assert!(result.payload.is_some());
}

#[tokio::test]
async fn identical_input_yields_identical_zpl() {
    let queue = Arc::new(RecordingQueue::default());
    let config = small_label().dither(DitherMode::FloydSteinberg).build().unwrap();
    let pipeline = LabelPipeline::new(config, queue.clone());

    let bytes = page_png(321, 477, (10, 30, 300, 460));
    let a = pipeline.run(png_request(bytes.clone())).await;
    let b = pipeline.run(png_request(bytes)).await;
    assert!(a.success && b.success);

    let jobs = queue.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].1, jobs[1].1);
    assert_eq!(a.preview_base64, b.preview_base64);
}

// ── Locator degradation ──────────────────────────────────────────────────────

#[tokio::test]
async fn located_box_is_cropped() {
    init_tracing();
    let vision = ScriptedVision::new(&[
        r#"{"found": true, "x1": 100, "y1": 150, "x2": 300, "y2": 450}"#,
    ]);
    let config = small_label().vision(vision).build().unwrap();
    let queue = Arc::new(RecordingQueue::default());
    let pipeline = LabelPipeline::new(config, queue.clone());

    let result = pipeline
        .run(png_request(page_png(400, 600, (100, 150, 300, 450))))
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.stages[2].detail, "cropped to 200x300 at (100,150)");

    // The crop is exactly the black rectangle and has the label's aspect.
    let zpl = &queue.jobs.lock().unwrap()[0].1;
    let bitmap = decode_label(zpl).unwrap();
    assert_eq!((bitmap.width(), bitmap.height()), (100, 150));
    assert_eq!(bitmap.black_count(), 100 * 150);
}

#[tokio::test]
async fn locator_timeout_still_succeeds() {
    init_tracing();
    let config = small_label()
        .vision(ScriptedVision::slow(Duration::from_secs(5)))
        .vision_timeout_secs(1)
        .build()
        .unwrap();
    let pipeline = LabelPipeline::new(config, Arc::new(RecordingQueue::default()));

    let result = pipeline
        .run(png_request(page_png(200, 300, (0, 0, 10, 10))))
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.stage_names(), ALL_STAGES);
    let located = &result.stages[2].detail;
    assert!(located.contains("timed out"), "{located}");
}

#[tokio::test]
async fn malformed_and_rejected_replies_fall_back() {
    for (reply, expect) in [
        ("I think the label is in the top half.", "malformed"),
        (r#"{"found": true, "x1": 0, "y1": 0, "x2": 10, "y2": 10}"#, "rejected"),
        (r#"{"found": false}"#, "no label"),
    ] {
        let config = small_label().vision(ScriptedVision::new(&[reply])).build().unwrap();
        let pipeline = LabelPipeline::new(config, Arc::new(RecordingQueue::default()));
        let result = pipeline
            .run(png_request(page_png(200, 300, (0, 0, 200, 300))))
            .await;
        assert!(result.success, "{reply}: {}", result.message);
        let detail = &result.stages[2].detail;
        assert!(detail.starts_with("full page"), "{detail}");
        assert!(detail.contains(expect), "{reply}: {detail}");
    }
}

// ── Observers and concurrency ────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    started: Mutex<Vec<String>>,
    names: Mutex<Vec<String>>,
    succeeded: AtomicBool,
}

impl StageCallback for Recorder {
    fn on_request_start(&self, filename: &str) {
        self.started.lock().unwrap().push(filename.to_string());
    }

    fn on_stage_complete(&self, record: &StageRecord) {
        self.names.lock().unwrap().push(record.name.clone());
    }

    fn on_succeeded(&self, _total_seconds: f64) {
        self.succeeded.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn stage_callback_sees_every_record() {
    let recorder = Arc::new(Recorder::default());
    let config = small_label().stage_callback(recorder.clone()).build().unwrap();
    let pipeline = LabelPipeline::new(config, Arc::new(RecordingQueue::default()));

    let result = pipeline
        .run(png_request(page_png(100, 150, (0, 0, 50, 50))))
        .await;

    assert!(result.success);
    assert_eq!(*recorder.started.lock().unwrap(), vec!["label.png"]);
    assert_eq!(*recorder.names.lock().unwrap(), result.stage_names());
    assert!(recorder.succeeded.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_pipeline_serves_concurrent_requests() {
    let queue = Arc::new(RecordingQueue::default());
    let pipeline = Arc::new(LabelPipeline::new(
        small_label().build().unwrap(),
        queue.clone(),
    ));

    let handles: Vec<_> = (0..4u32)
        .map(|i| {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                let bytes = page_png(120 + i * 10, 180, (0, 0, 60, 90));
                pipeline
                    .run(png_request(bytes).with_printer(format!("P{i}")))
                    .await
            })
        })
        .collect();

    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.success, "{}", result.message);
    }
    assert_eq!(queue.count(), 4);
}

// ── Codec ────────────────────────────────────────────────────────────────────

#[test]
fn random_bitmaps_survive_every_encoding() {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    for encoding in [
        GraphicEncoding::Z64,
        GraphicEncoding::Hex,
        GraphicEncoding::CompressedHex,
    ] {
        for _ in 0..40 {
            let w = rng.random_range(1..=70u32);
            let h = rng.random_range(1..=24u32);
            // Solid fills, plus random fields with long-run rows mixed in.
            let density: f64 = rng.random();
            let mode = rng.random_range(0..4u8);
            let bitmap = MonoBitmap::from_fn(w, h, |x, y| match mode {
                0 => false,
                1 => true,
                _ if y % 5 == 0 => x < w / 2,
                _ => rng.random_bool(density),
            });
            let payload = encode_label(&bitmap, encoding).unwrap();
            let back = decode_label(payload.as_str()).unwrap();
            assert_eq!(back, bitmap, "{encoding} {w}x{h}");
        }
    }
}

// ── PDF (needs pdfium) ───────────────────────────────────────────────────────

macro_rules! skip_unless_pdfium {
    () => {
        if std::env::var("PDFIUM_TESTS").is_err() {
            println!("SKIP — set PDFIUM_TESTS=1 to run PDF tests");
            return;
        }
    };
}

/// A PDF of 2×3 in pages; each entry is an optional filled rectangle
/// `(x, y, w, h)` in points from the bottom-left corner.
fn build_pdf(pages: &[Option<(u32, u32, u32, u32)>]) -> Vec<u8> {
    let mut objects: Vec<String> = Vec::new();
    let kids: Vec<String> = (0..pages.len())
        .map(|i| format!("{} 0 R", 3 + i * 2))
        .collect();
    objects.push("<< /Type /Catalog /Pages 2 0 R >>".into());
    objects.push(format!(
        "<< /Type /Pages /Kids [{}] /Count {} >>",
        kids.join(" "),
        pages.len()
    ));
    for (i, rect) in pages.iter().enumerate() {
        let content = match rect {
            Some((x, y, w, h)) => format!("0 0 0 rg {x} {y} {w} {h} re f"),
            None => String::new(),
        };
        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 144 216] /Contents {} 0 R >>",
            4 + i * 2
        ));
        objects.push(format!(
            "<< /Length {} >>\nstream\n{}\nendstream",
            content.len(),
            content
        ));
    }

    let mut pdf = String::from("%PDF-1.4\n");
    let mut offsets = Vec::new();
    for (i, body) in objects.iter().enumerate() {
        offsets.push(pdf.len());
        pdf.push_str(&format!("{} 0 obj\n{}\nendobj\n", i + 1, body));
    }
    let xref = pdf.len();
    pdf.push_str(&format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1));
    for off in offsets {
        pdf.push_str(&format!("{off:010} 00000 n \n"));
    }
    pdf.push_str(&format!(
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
        objects.len() + 1,
        xref
    ));
    pdf.into_bytes()
}

fn pdf_config() -> zpl_label::LabelConfigBuilder {
    let mut builder = small_label().render_dpi(72);
    if let Ok(path) = std::env::var("ZLP_PDFIUM_LIB_PATH") {
        builder = builder.pdfium_lib_path(path);
    }
    builder
}

#[tokio::test]
async fn pdf_first_page_is_printed() {
    skip_unless_pdfium!();
    let queue = Arc::new(RecordingQueue::default());
    let pipeline = LabelPipeline::new(pdf_config().build().unwrap(), queue.clone());
    let doc = Document::new(build_pdf(&[Some((0, 0, 144, 216)), None]), "label.pdf").unwrap();

    let result = pipeline.run(PrintRequest::new(doc)).await;

    assert!(result.success, "{}", result.message);
    assert!(result.stages[0].detail.contains("type=pdf"));
    let detail = &result.stages[1].detail;
    assert!(detail.starts_with("1 of 2 page(s), 144x216"), "{detail}");
    let bitmap = decode_label(&queue.jobs.lock().unwrap()[0].1).unwrap();
    assert_eq!(bitmap.black_count(), 100 * 150);
}

#[tokio::test]
async fn pdf_scan_finds_label_on_second_page() {
    init_tracing();
    skip_unless_pdfium!();
    let vision = ScriptedVision::new(&[
        r#"{"found": false}"#,
        r#"{"found": true, "x1": 0, "y1": 0, "x2": 72, "y2": 108}"#,
    ]);
    let config = pdf_config()
        .vision(vision)
        .page_strategy(PageStrategy::ScanForLabel)
        .build()
        .unwrap();
    let pipeline = LabelPipeline::new(config, Arc::new(RecordingQueue::default()));
    let doc = Document::new(build_pdf(&[None, Some((0, 108, 72, 108))]), "two.pdf").unwrap();

    let result = pipeline.run(PrintRequest::new(doc)).await;

    assert!(result.success, "{}", result.message);
    assert!(result.stages[1].detail.starts_with("2 of 2 page(s)"));
    assert_eq!(result.stages[2].detail, "page 2: cropped to 72x108 at (0,0)");
}

#[tokio::test]
async fn truncated_pdf_is_a_parse_failure() {
    skip_unless_pdfium!();
    let pipeline = LabelPipeline::new(
        pdf_config().build().unwrap(),
        Arc::new(RecordingQueue::default()),
    );
    let mut bytes = build_pdf(&[Some((0, 0, 10, 10))]);
    bytes.truncate(20);
    let doc = Document::new(bytes, "broken.pdf").unwrap();

    let result = pipeline.run(PrintRequest::new(doc)).await;

    assert!(!result.success);
    assert!(result.stages.len() <= 1);
    assert!(result.error.unwrap().contains("Failed to parse document"));
}
