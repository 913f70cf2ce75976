//! CLI binary for zpl-label.
//!
//! A thin shim over the library crate: `ZLP_*` environment first, flags on
//! top, one request through [`LabelPipeline`], results to stdout.

use anyhow::{Context, Result};
use base64::Engine;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use zpl_label::{
    DitherMode, Document, FileSink, GraphicEncoding, LabelConfig, LabelPipeline, LocateMode,
    LpPrintQueue, PageStrategy, PipelineResult, PrintQueue, PrintRequest, PrintRequestBody,
    ScalePolicy, StageCallback, StageRecord,
};

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── Live stage log ───────────────────────────────────────────────────────────

/// Spinner with one log line per completed stage.
struct CliStageLog {
    bar: ProgressBar,
}

impl CliStageLog {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Label");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl StageCallback for CliStageLog {
    fn on_request_start(&self, filename: &str) {
        self.bar.set_message(format!("reading {filename}…"));
    }

    fn on_stage_complete(&self, record: &StageRecord) {
        self.bar.println(format!(
            "  {} {:<11} {}  {}",
            green("✓"),
            record.name,
            dim(&format!("{:>5.2}s", record.elapsed_seconds)),
            record.detail,
        ));
        self.bar.set_message(format!("{} done", record.name));
    }

    fn on_failed(&self, error: &str) {
        self.bar.finish_and_clear();
        let first_line = error.lines().next().unwrap_or(error);
        eprintln!("{} {}", red("✘"), red(first_line));
    }

    fn on_succeeded(&self, total_seconds: f64) {
        self.bar.finish_and_clear();
        eprintln!("{} label ready in {:.2}s", green("✔"), total_seconds);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Print the first page of a carrier PDF on the default printer
  zlp label.pdf

  # Pick the printer and leave a 10% margin
  zlp -p Zebra_ZD420 --scale 90 label.png

  # Dry run: write ZPL and a 1-bit preview, print nothing
  zlp label.pdf -o label.zpl --preview label.png

  # Maximum-compatibility encoding for older printers
  zlp --encoding hex label.pdf -o label.zpl

  # Run a JSON request body and print the result as JSON
  zlp --request body.json --json

  # Show CUPS printers
  zlp --list-printers

REQUEST BODY:
  {"file_path": "/share/label.pdf", "printer": "Zebra", "scale": "fill"}
  {"file_base64": "JVBERi0…", "filename": "label.pdf", "scale": 90}

ENVIRONMENT VARIABLES:
  ZLP_PRINTER_NAME         Default CUPS printer
  ZLP_ANTHROPIC_API_KEY    Enables the vision label locator (Claude)
  ZLP_CLAUDE_MODEL         Claude model ID
  ZLP_VISION_PROVIDER      edgequake-llm provider instead (openai, gemini, ollama, …)
  ZLP_CUPS_SERVER          Remote CUPS scheduler (host:port)
  ZLP_LABEL_WIDTH_INCHES   Label width (default 4)
  ZLP_LABEL_HEIGHT_INCHES  Label height (default 6)
  ZLP_LABEL_DPI            Printer resolution (default 203)
  ZLP_RENDER_DPI           PDF rasterization resolution (default 300)
  ZLP_PDFIUM_LIB_PATH      Directory or file of the pdfium shared library

Without a vision credential the whole page is printed.
"#;

/// Print shipping-label PDFs and images on ZPL thermal printers.
#[derive(Parser, Debug)]
#[command(
    name = "zlp",
    version,
    about = "Print shipping-label PDFs and images on ZPL thermal printers",
    long_about = "Locate the shipping label on a PDF page or image, fit it to the label \
stock, dither it to 1 bit and send it to a CUPS printer as raw ZPL.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// PDF or image file.
    #[arg(required_unless_present_any = ["list_printers", "request"])]
    input: Option<PathBuf>,

    /// JSON request body file (file_path / file_base64, printer, scale).
    #[arg(long, conflicts_with = "input")]
    request: Option<PathBuf>,

    /// List CUPS printers and exit.
    #[arg(long)]
    list_printers: bool,

    /// Destination printer (overrides ZLP_PRINTER_NAME).
    #[arg(short, long)]
    printer: Option<String>,

    /// Scale policy: fit, fill, or a percentage 50–100.
    #[arg(long)]
    scale: Option<String>,

    /// Write the ZPL to this file instead of printing.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write the 1-bit label preview PNG to this file.
    #[arg(long)]
    preview: Option<PathBuf>,

    /// Graphic field encoding.
    #[arg(long, value_enum, default_value = "z64")]
    encoding: EncodingArg,

    /// 1-bit conversion.
    #[arg(long, value_enum, default_value = "fs")]
    dither: DitherArg,

    /// Fail instead of printing the full page when no label is found.
    #[arg(long)]
    strict: bool,

    /// Search every PDF page for the label, not just the first.
    #[arg(long)]
    scan_pages: bool,

    /// Label width in inches (overrides ZLP_LABEL_WIDTH_INCHES).
    #[arg(long)]
    width: Option<f64>,

    /// Label height in inches (overrides ZLP_LABEL_HEIGHT_INCHES).
    #[arg(long)]
    height: Option<f64>,

    /// Printer resolution in dots per inch.
    #[arg(long, value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: Option<u32>,

    /// Vision call timeout in seconds.
    #[arg(long, default_value_t = 30)]
    vision_timeout: u64,

    /// Print the pipeline result as JSON.
    #[arg(long)]
    json: bool,

    /// Disable the live stage log.
    #[arg(long)]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum EncodingArg {
    Z64,
    Hex,
    Compressed,
}

impl From<EncodingArg> for GraphicEncoding {
    fn from(v: EncodingArg) -> Self {
        match v {
            EncodingArg::Z64 => GraphicEncoding::Z64,
            EncodingArg::Hex => GraphicEncoding::Hex,
            EncodingArg::Compressed => GraphicEncoding::CompressedHex,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum DitherArg {
    Fs,
    Bayer,
    Threshold,
}

impl From<DitherArg> for DitherMode {
    fn from(v: DitherArg) -> Self {
        match v {
            DitherArg::Fs => DitherMode::FloydSteinberg,
            DitherArg::Bayer => DitherMode::Bayer,
            DitherArg::Threshold => DitherMode::Threshold,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The stage log replaces INFO output while it is on screen.
    let show_progress =
        !cli.quiet && !cli.no_progress && !cli.json && io::stderr().is_terminal();
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let env_config = LabelConfig::from_env().context("Invalid ZLP_* environment")?;

    // ── Printer discovery ────────────────────────────────────────────────
    if cli.list_printers {
        let configured = cli.printer.as_deref().or(env_config.printer_name.as_deref());
        return list_printers(&LpPrintQueue::from_config(&env_config), configured, cli.json).await;
    }

    // ── Build config and pipeline ────────────────────────────────────────
    let stage_log = show_progress.then(CliStageLog::new);
    let config = build_config(&cli, env_config, stage_log.clone())?;
    let queue: Arc<dyn PrintQueue> = match cli.output {
        Some(ref path) => Arc::new(FileSink::new(path)),
        None => Arc::new(LpPrintQueue::from_config(&config)),
    };
    let pipeline = LabelPipeline::new(config, queue);

    // ── Run ──────────────────────────────────────────────────────────────
    let result = match cli.request {
        Some(ref path) => {
            let mut body = read_request_body(path).await?;
            if body.printer.is_none() {
                body.printer = default_printer(&cli);
            }
            pipeline.run_body(body).await
        }
        None => {
            let path = cli
                .input
                .as_deref()
                .context("No input file given")?;
            let document = Document::from_path(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let mut request = PrintRequest::new(document);
            if let Some(printer) = default_printer(&cli) {
                request = request.with_printer(printer);
            }
            if let Some(ref scale) = cli.scale {
                let policy: ScalePolicy = scale.parse().context("Invalid --scale")?;
                request = request.with_scale(policy);
            }
            pipeline.run(request).await
        }
    };

    if let Some(ref path) = cli.preview {
        write_preview(&result, path).await?;
    }
    report(&cli, &result, stage_log.is_some())?;

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

/// Layer CLI flags over the environment config.
fn build_config(
    cli: &Cli,
    env_config: LabelConfig,
    stage_log: Option<Arc<CliStageLog>>,
) -> Result<LabelConfig> {
    let width = cli.width.unwrap_or(env_config.label_width_inches);
    let height = cli.height.unwrap_or(env_config.label_height_inches);

    let mut builder = env_config
        .into_builder()
        .label_size_inches(width, height)
        .encoding(cli.encoding.into())
        .dither(cli.dither.into())
        .vision_timeout_secs(cli.vision_timeout);

    if let Some(dpi) = cli.dpi {
        builder = builder.label_dpi(dpi);
    }
    if cli.strict {
        builder = builder.locate_mode(LocateMode::Strict);
    }
    if cli.scan_pages {
        builder = builder.page_strategy(PageStrategy::ScanForLabel);
    }
    if let Some(cb) = stage_log {
        builder = builder.stage_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// `--printer`, or a placeholder name for file output.
fn default_printer(cli: &Cli) -> Option<String> {
    cli.printer
        .clone()
        .or_else(|| cli.output.as_ref().map(|_| "file".to_string()))
}

async fn read_request_body(path: &Path) -> Result<PrintRequestBody> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read request body from {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid request body", path.display()))
}

async fn write_preview(result: &PipelineResult, path: &Path) -> Result<()> {
    let Some(ref b64) = result.preview_base64 else {
        eprintln!("{}", dim("no preview: the request failed before normalization"));
        return Ok(());
    };
    let png = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .context("Preview is not valid base64")?;
    tokio::fs::write(path, png)
        .await
        .with_context(|| format!("Failed to write preview to {}", path.display()))
}

fn report(cli: &Cli, result: &PipelineResult, live_log: bool) -> Result<()> {
    if cli.json {
        let json = serde_json::to_string_pretty(result).context("Failed to serialise result")?;
        println!("{json}");
        return Ok(());
    }
    if cli.quiet {
        if !result.success {
            eprintln!("{}", result.message);
        }
        return Ok(());
    }

    // The live log already printed the stages.
    if !live_log {
        for stage in &result.stages {
            eprintln!(
                "  {:<11} {:>6.2}s  {}",
                stage.name, stage.elapsed_seconds, stage.detail
            );
        }
    }
    if result.success {
        println!("{}", result.message);
    } else {
        eprintln!("{} {}", red("✘"), bold(&result.message));
    }
    Ok(())
}

async fn list_printers(queue: &LpPrintQueue, configured: Option<&str>, json: bool) -> Result<()> {
    let listing = queue
        .discover()
        .await
        .context("Printer discovery failed")?
        .with_configured_default(configured);

    if json {
        let out = serde_json::to_string_pretty(&listing).context("Failed to serialise printers")?;
        println!("{out}");
        return Ok(());
    }
    if listing.printers.is_empty() {
        eprintln!("No printers configured in CUPS");
    }
    for p in &listing.printers {
        let marker = if p.is_default { green("*") } else { " ".into() };
        println!("{} {:<24} {}", marker, p.name, dim(&p.info));
    }
    match listing.default {
        Some(ref name) if !listing.printers.iter().any(|p| &p.name == name) => {
            eprintln!("default: {} {}", bold(name), dim("(not listed by CUPS)"));
        }
        Some(ref name) => eprintln!("default: {}", bold(name)),
        None => {}
    }
    Ok(())
}
