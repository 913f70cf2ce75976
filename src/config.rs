//! Configuration types for label extraction and printing.
//!
//! All pipeline behaviour is controlled through [`LabelConfig`], built via
//! [`LabelConfigBuilder`] or loaded from the process environment with
//! [`LabelConfig::from_env`]. The config is read-only once built and shared
//! by every request a [`crate::process::LabelPipeline`] serves.

use crate::error::LabelError;
use crate::pipeline::vision::VisionService;
use crate::progress::StageCallbackRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Default Anthropic model used by the built-in vision client.
pub const DEFAULT_CLAUDE_MODEL: &str = "claude-sonnet-4-20250514";

/// Environment keys recognised by [`LabelConfig::from_env`].
pub mod env_keys {
    pub const PRINTER_NAME: &str = "ZLP_PRINTER_NAME";
    pub const ANTHROPIC_API_KEY: &str = "ZLP_ANTHROPIC_API_KEY";
    pub const CLAUDE_MODEL: &str = "ZLP_CLAUDE_MODEL";
    pub const VISION_PROVIDER: &str = "ZLP_VISION_PROVIDER";
    pub const CUPS_SERVER: &str = "ZLP_CUPS_SERVER";
    pub const LABEL_WIDTH_INCHES: &str = "ZLP_LABEL_WIDTH_INCHES";
    pub const LABEL_HEIGHT_INCHES: &str = "ZLP_LABEL_HEIGHT_INCHES";
    pub const LABEL_DPI: &str = "ZLP_LABEL_DPI";
    pub const RENDER_DPI: &str = "ZLP_RENDER_DPI";
    pub const PDFIUM_LIB_PATH: &str = "ZLP_PDFIUM_LIB_PATH";
}

/// Configuration for the label pipeline.
///
/// Built via [`LabelConfig::builder()`], [`LabelConfig::from_env()`] or
/// [`LabelConfig::default()`].
///
/// # Example
/// ```rust
/// use zpl_label::LabelConfig;
///
/// let config = LabelConfig::builder()
///     .label_size_inches(4.0, 6.0)
///     .label_dpi(203)
///     .printer_name("Zebra_ZD420")
///     .build()
///     .unwrap();
/// assert_eq!(config.label_width_px(), 812);
/// assert_eq!(config.label_height_px(), 1218);
/// ```
#[derive(Clone)]
pub struct LabelConfig {
    /// Physical label width in inches. Default: 4.0.
    pub label_width_inches: f64,

    /// Physical label height in inches. Default: 6.0.
    pub label_height_inches: f64,

    /// Printer resolution in dots per inch. Default: 203.
    ///
    /// Most desktop Zebra printers are 203 dpi; 300 and 600 dpi heads exist.
    /// The normalized label is exactly `inches × dpi` dots on each axis.
    pub label_dpi: u32,

    /// DPI used when rasterising PDF pages. Range: 72–600. Default: 300.
    pub render_dpi: u32,

    /// Longest edge, in pixels, of a rasterised PDF page. Default: 4000.
    ///
    /// Caps memory on oversized pages independent of `render_dpi`.
    pub max_rendered_pixels: u32,

    /// Default print queue when a request does not name one.
    pub printer_name: Option<String>,

    /// Remote CUPS server (`host[:port]`). `None` uses the local scheduler.
    pub cups_server: Option<String>,

    /// Anthropic API key for the built-in vision client.
    pub api_key: Option<String>,

    /// Vision model identifier. Default: [`DEFAULT_CLAUDE_MODEL`].
    pub model: String,

    /// Named `edgequake-llm` provider ("openai", "gemini", "ollama", …).
    /// Takes precedence over `api_key`.
    pub vision_provider: Option<String>,

    /// Pre-constructed vision service. Takes precedence over everything else.
    pub vision: Option<Arc<dyn VisionService>>,

    /// Upper bound on one vision call, in seconds. Default: 30.
    pub vision_timeout_secs: u64,

    /// Maximum tokens the vision model may generate. Default: 256.
    ///
    /// The reply is a single small JSON object.
    pub vision_max_tokens: usize,

    /// What to do when the locator cannot find a label. Default: best effort.
    pub locate_mode: LocateMode,

    /// Which pages of a multi-page PDF are considered. Default: first page.
    pub page_strategy: PageStrategy,

    /// Default scale policy when a request does not specify one.
    pub scale: ScalePolicy,

    /// Monochrome conversion. Default: Floyd–Steinberg.
    pub dither: DitherMode,

    /// `^GF` data encoding. Default: Z64.
    pub encoding: GraphicEncoding,

    /// Explicit pdfium shared-library path.
    pub pdfium_lib_path: Option<PathBuf>,

    /// Observer notified as each stage completes.
    pub stage_callback: Option<StageCallbackRef>,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            label_width_inches: 4.0,
            label_height_inches: 6.0,
            label_dpi: 203,
            render_dpi: 300,
            max_rendered_pixels: 4000,
            printer_name: None,
            cups_server: None,
            api_key: None,
            model: DEFAULT_CLAUDE_MODEL.to_string(),
            vision_provider: None,
            vision: None,
            vision_timeout_secs: 30,
            vision_max_tokens: 256,
            locate_mode: LocateMode::default(),
            page_strategy: PageStrategy::default(),
            scale: ScalePolicy::default(),
            dither: DitherMode::default(),
            encoding: GraphicEncoding::default(),
            pdfium_lib_path: None,
            stage_callback: None,
        }
    }
}

impl fmt::Debug for LabelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabelConfig")
            .field("label_width_inches", &self.label_width_inches)
            .field("label_height_inches", &self.label_height_inches)
            .field("label_dpi", &self.label_dpi)
            .field("render_dpi", &self.render_dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("printer_name", &self.printer_name)
            .field("cups_server", &self.cups_server)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("vision_provider", &self.vision_provider)
            .field("vision", &self.vision.as_ref().map(|v| v.name().to_string()))
            .field("vision_timeout_secs", &self.vision_timeout_secs)
            .field("locate_mode", &self.locate_mode)
            .field("page_strategy", &self.page_strategy)
            .field("scale", &self.scale)
            .field("dither", &self.dither)
            .field("encoding", &self.encoding)
            .field("pdfium_lib_path", &self.pdfium_lib_path)
            .finish()
    }
}

impl LabelConfig {
    /// Create a new builder for `LabelConfig`.
    pub fn builder() -> LabelConfigBuilder {
        LabelConfigBuilder {
            config: Self::default(),
        }
    }

    /// Reopen a built config for further overrides; `build()` re-validates.
    pub fn into_builder(self) -> LabelConfigBuilder {
        LabelConfigBuilder { config: self }
    }

    /// Load configuration from the `ZLP_*` process environment.
    ///
    /// Unset keys keep their defaults. Empty values count as unset.
    pub fn from_env() -> Result<Self, LabelError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key/value source.
    ///
    /// [`LabelConfig::from_env`] is this function over `std::env::var`;
    /// tests and embedders pass their own map instead.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, LabelError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut builder = Self::builder();

        if let Some(v) = get(env_keys::PRINTER_NAME) {
            builder = builder.printer_name(v);
        }
        if let Some(v) = get(env_keys::ANTHROPIC_API_KEY) {
            builder = builder.api_key(v);
        }
        if let Some(v) = get(env_keys::CLAUDE_MODEL) {
            builder = builder.model(v);
        }
        if let Some(v) = get(env_keys::VISION_PROVIDER) {
            builder = builder.vision_provider(v);
        }
        if let Some(v) = get(env_keys::CUPS_SERVER) {
            builder = builder.cups_server(v);
        }
        if let Some(v) = get(env_keys::PDFIUM_LIB_PATH) {
            builder = builder.pdfium_lib_path(v);
        }

        let width = parse_key::<f64>(env_keys::LABEL_WIDTH_INCHES, get(env_keys::LABEL_WIDTH_INCHES))?;
        let height =
            parse_key::<f64>(env_keys::LABEL_HEIGHT_INCHES, get(env_keys::LABEL_HEIGHT_INCHES))?;
        if width.is_some() || height.is_some() {
            let defaults = Self::default();
            builder = builder.label_size_inches(
                width.unwrap_or(defaults.label_width_inches),
                height.unwrap_or(defaults.label_height_inches),
            );
        }
        if let Some(dpi) = parse_key::<u32>(env_keys::LABEL_DPI, get(env_keys::LABEL_DPI))? {
            builder = builder.label_dpi(dpi);
        }
        if let Some(dpi) = parse_key::<u32>(env_keys::RENDER_DPI, get(env_keys::RENDER_DPI))? {
            builder = builder.render_dpi(dpi);
        }

        builder.build()
    }

    /// Target label width in printer dots.
    pub fn label_width_px(&self) -> u32 {
        inches_to_dots(self.label_width_inches, self.label_dpi)
    }

    /// Target label height in printer dots.
    pub fn label_height_px(&self) -> u32 {
        inches_to_dots(self.label_height_inches, self.label_dpi)
    }

    /// True when some vision service could be resolved from this config.
    pub fn has_vision(&self) -> bool {
        self.vision.is_some() || self.vision_provider.is_some() || self.api_key.is_some()
    }
}

fn inches_to_dots(inches: f64, dpi: u32) -> u32 {
    (inches * dpi as f64).round() as u32
}

fn parse_key<T: FromStr>(key: &str, value: Option<String>) -> Result<Option<T>, LabelError> {
    match value {
        None => Ok(None),
        Some(v) => v.trim().parse::<T>().map(Some).map_err(|_| {
            LabelError::InvalidConfig(format!("{key}: cannot parse '{v}'"))
        }),
    }
}

/// Builder for [`LabelConfig`].
pub struct LabelConfigBuilder {
    config: LabelConfig,
}

impl fmt::Debug for LabelConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabelConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl LabelConfigBuilder {
    pub fn label_size_inches(mut self, width: f64, height: f64) -> Self {
        self.config.label_width_inches = width;
        self.config.label_height_inches = height;
        self
    }

    pub fn label_dpi(mut self, dpi: u32) -> Self {
        self.config.label_dpi = dpi;
        self
    }

    pub fn render_dpi(mut self, dpi: u32) -> Self {
        self.config.render_dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn printer_name(mut self, name: impl Into<String>) -> Self {
        self.config.printer_name = Some(name.into());
        self
    }

    pub fn cups_server(mut self, server: impl Into<String>) -> Self {
        self.config.cups_server = Some(server.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn vision_provider(mut self, name: impl Into<String>) -> Self {
        self.config.vision_provider = Some(name.into());
        self
    }

    pub fn vision(mut self, service: Arc<dyn VisionService>) -> Self {
        self.config.vision = Some(service);
        self
    }

    pub fn vision_timeout_secs(mut self, secs: u64) -> Self {
        self.config.vision_timeout_secs = secs.max(1);
        self
    }

    pub fn vision_max_tokens(mut self, n: usize) -> Self {
        self.config.vision_max_tokens = n;
        self
    }

    pub fn locate_mode(mut self, mode: LocateMode) -> Self {
        self.config.locate_mode = mode;
        self
    }

    pub fn page_strategy(mut self, strategy: PageStrategy) -> Self {
        self.config.page_strategy = strategy;
        self
    }

    pub fn scale(mut self, scale: ScalePolicy) -> Self {
        self.config.scale = scale.normalized();
        self
    }

    pub fn dither(mut self, dither: DitherMode) -> Self {
        self.config.dither = dither;
        self
    }

    pub fn encoding(mut self, encoding: GraphicEncoding) -> Self {
        self.config.encoding = encoding;
        self
    }

    pub fn pdfium_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(path.into());
        self
    }

    pub fn stage_callback(mut self, cb: StageCallbackRef) -> Self {
        self.config.stage_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<LabelConfig, LabelError> {
        let c = &self.config;
        for (name, inches) in [("width", c.label_width_inches), ("height", c.label_height_inches)] {
            if !inches.is_finite() || inches <= 0.0 || inches > 40.0 {
                return Err(LabelError::InvalidConfig(format!(
                    "Label {name} must be within (0, 40] inches, got {inches}"
                )));
            }
        }
        if c.label_dpi < 72 || c.label_dpi > 600 {
            return Err(LabelError::InvalidConfig(format!(
                "Label DPI must be 72–600, got {}",
                c.label_dpi
            )));
        }
        if c.label_width_px() == 0 || c.label_height_px() == 0 {
            return Err(LabelError::InvalidConfig(
                "Label size rounds to zero dots".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How the located region is scaled onto the label.
///
/// | Policy | Effect |
/// |--------|--------|
/// | `Fit` | Whole region visible, white margins on the short axis (default) |
/// | `Fill` | Label fully covered, overflow center-cropped |
/// | `Shrink(n)` | `n`% of the fit size (50–100), centered with margins |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalePolicy {
    #[default]
    Fit,
    Fill,
    Shrink(u8),
}

impl ScalePolicy {
    /// Clamp `Shrink` into 50–100 and fold `Shrink(100)` into `Fit`.
    pub fn normalized(self) -> Self {
        match self {
            ScalePolicy::Shrink(p) => match p.clamp(50, 100) {
                100 => ScalePolicy::Fit,
                p => ScalePolicy::Shrink(p),
            },
            other => other,
        }
    }

    /// Construct from a percentage as accepted on the request boundary.
    pub fn from_percent(pct: u32) -> Self {
        ScalePolicy::Shrink(pct.min(100) as u8).normalized()
    }
}

impl FromStr for ScalePolicy {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "" | "fit" => Ok(ScalePolicy::Fit),
            "fill" | "cover" => Ok(ScalePolicy::Fill),
            other => other
                .trim_end_matches('%')
                .parse::<u32>()
                .map(ScalePolicy::from_percent)
                .map_err(|_| {
                    LabelError::InvalidConfig(format!(
                        "scale must be 'fit', 'fill' or a percentage, got '{s}'"
                    ))
                }),
        }
    }
}

impl fmt::Display for ScalePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalePolicy::Fit => write!(f, "fit"),
            ScalePolicy::Fill => write!(f, "fill"),
            ScalePolicy::Shrink(p) => write!(f, "{p}%"),
        }
    }
}

/// 1-bit conversion algorithm.
///
/// Dithering quality is perceptual only; every mode is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DitherMode {
    /// Floyd–Steinberg error diffusion. Best for photos and gradients. (default)
    #[default]
    FloydSteinberg,
    /// Bayer 8×8 ordered dithering. Regular halftone screen.
    Bayer,
    /// Hard threshold at mid-gray. Crispest barcodes, no gray levels.
    Threshold,
}

impl FromStr for DitherMode {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "floyd-steinberg" | "floyd_steinberg" | "fs" => Ok(DitherMode::FloydSteinberg),
            "bayer" | "ordered" => Ok(DitherMode::Bayer),
            "threshold" | "none" => Ok(DitherMode::Threshold),
            other => Err(LabelError::InvalidConfig(format!(
                "unknown dither mode '{other}'"
            ))),
        }
    }
}

/// Data encoding of the `^GF` graphic field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GraphicEncoding {
    /// zlib + base64 with CRC, `:Z64:…:CRC`. Smallest payload. (default)
    #[default]
    Z64,
    /// Plain uppercase ASCII hex. Understood by every ZPL printer.
    Hex,
    /// ASCII hex with ZPL's run-length repeat alphabet.
    CompressedHex,
}

impl FromStr for GraphicEncoding {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "z64" => Ok(GraphicEncoding::Z64),
            "hex" | "ascii" => Ok(GraphicEncoding::Hex),
            "compressed" | "compressed-hex" | "acs" => Ok(GraphicEncoding::CompressedHex),
            other => Err(LabelError::InvalidConfig(format!(
                "unknown graphic encoding '{other}'"
            ))),
        }
    }
}

impl fmt::Display for GraphicEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphicEncoding::Z64 => write!(f, "z64"),
            GraphicEncoding::Hex => write!(f, "hex"),
            GraphicEncoding::CompressedHex => write!(f, "compressed-hex"),
        }
    }
}

/// Locator failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LocateMode {
    /// Fall back to the full page on any locator problem. (default)
    #[default]
    BestEffort,
    /// Treat a fallback as [`LabelError::LabelNotFound`].
    Strict,
}

/// Which pages of a PDF are searched for the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PageStrategy {
    /// Use page 1 only. (default)
    #[default]
    FirstPage,
    /// Locate on each page in order; the first located label wins, else page 1.
    ScanForLabel,
}
