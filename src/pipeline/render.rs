//! Rasterisation: turn a [`Document`] into page images.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state and image decoding is
//! pure CPU work. Both run on tokio's blocking pool so the async workers
//! keep serving other requests while a large page renders.
//!
//! ## Why cap pixels as well as DPI?
//!
//! A label PDF is usually letter-sized, but nothing stops a caller sending
//! an A0 sheet. `max_rendered_pixels` bounds the longest edge regardless of
//! physical size, keeping memory predictable.

use crate::config::LabelConfig;
use crate::error::LabelError;
use crate::pipeline::input::{Document, MediaType};
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// One rendered page.
#[derive(Debug, Clone)]
pub struct PageRaster {
    /// 0-based page index.
    pub index: usize,
    pub image: DynamicImage,
    /// Resolution the page was rendered at (nominal for image inputs).
    pub dpi: u32,
}

impl PageRaster {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Rendered pages plus the document's total page count.
#[derive(Debug, Clone)]
pub struct Rasterized {
    pub pages: Vec<PageRaster>,
    pub total_pages: usize,
}

/// Render every page of `document`, in page order.
pub async fn rasterize(
    document: &Document,
    config: &LabelConfig,
) -> Result<Vec<PageRaster>, LabelError> {
    rasterize_pages(document, config, None).await.map(|r| r.pages)
}

/// Render at most `limit` leading pages of `document`.
///
/// Image inputs always yield exactly one page equal to the decoded image.
pub async fn rasterize_pages(
    document: &Document,
    config: &LabelConfig,
    limit: Option<usize>,
) -> Result<Rasterized, LabelError> {
    let bytes = document.shared_bytes();
    let filename = document.filename().to_string();
    let dpi = config.render_dpi;

    let result = match document.media_type() {
        MediaType::Image => tokio::task::spawn_blocking(move || -> Result<Rasterized, LabelError> {
            let image = decode_image(&bytes, &filename)?;
            debug!("Decoded image → {}x{} px", image.width(), image.height());
            Ok(Rasterized {
                pages: vec![PageRaster {
                    index: 0,
                    image,
                    dpi,
                }],
                total_pages: 1,
            })
        })
        .await,
        MediaType::Pdf => {
            let max_pixels = config.max_rendered_pixels;
            let lib_path = config.pdfium_lib_path.clone();
            tokio::task::spawn_blocking(move || {
                let pdfium = bind_pdfium(lib_path.as_deref())?;
                render_pdf_blocking(&pdfium, &bytes, &filename, dpi, max_pixels, limit)
            })
            .await
        }
    };

    result.map_err(|e| LabelError::Internal(format!("Render task panicked: {}", e)))?
}

/// Number of pages in `document` without rendering any of them.
pub async fn page_count(document: &Document, config: &LabelConfig) -> Result<usize, LabelError> {
    match document.media_type() {
        MediaType::Image => Ok(1),
        MediaType::Pdf => {
            let bytes = document.shared_bytes();
            let filename = document.filename().to_string();
            let lib_path = config.pdfium_lib_path.clone();
            tokio::task::spawn_blocking(move || -> Result<usize, LabelError> {
                let pdfium = bind_pdfium(lib_path.as_deref())?;
                let pdf = open_pdf(&pdfium, &bytes, &filename)?;
                let count = pdf.pages().len() as usize;
                Ok(count)
            })
            .await
            .map_err(|e| LabelError::Internal(format!("Page-count task panicked: {}", e)))?
        }
    }
}

/// Bind to a pdfium shared library.
///
/// Search order: `lib_path` (a library file or a directory holding one),
/// then the working directory, then the system loader path.
pub fn bind_pdfium(lib_path: Option<&Path>) -> Result<Pdfium, LabelError> {
    let bindings = match lib_path {
        Some(path) => {
            let file: PathBuf = if path.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(path)
            } else {
                path.to_path_buf()
            };
            Pdfium::bind_to_library(&file).map_err(|e| {
                LabelError::PdfiumBindingFailed(format!("{}: {}", file.display(), e))
            })?
        }
        None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library())
            .map_err(|e| LabelError::PdfiumBindingFailed(e.to_string()))?,
    };
    Ok(Pdfium::new(bindings))
}

fn open_pdf<'a>(
    pdfium: &'a Pdfium,
    bytes: &'a [u8],
    filename: &str,
) -> Result<PdfDocument<'a>, LabelError> {
    pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| LabelError::CorruptDocument {
            filename: filename.to_string(),
            detail: format!("{:?}", e),
        })
}

fn render_pdf_blocking(
    pdfium: &Pdfium,
    bytes: &Arc<[u8]>,
    filename: &str,
    dpi: u32,
    max_pixels: u32,
    limit: Option<usize>,
) -> Result<Rasterized, LabelError> {
    let pdf = open_pdf(pdfium, bytes, filename)?;
    let pages = pdf.pages();
    let total_pages = pages.len() as usize;
    if total_pages == 0 {
        return Err(LabelError::CorruptDocument {
            filename: filename.to_string(),
            detail: "document has no pages".into(),
        });
    }
    info!("PDF loaded: {} pages", total_pages);

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(dpi as f32 / 72.0)
        .set_maximum_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let wanted = limit.unwrap_or(total_pages).min(total_pages);
    let mut rasters = Vec::with_capacity(wanted);
    for idx in 0..wanted {
        let page = pages
            .get(idx as u16)
            .map_err(|e| LabelError::CorruptDocument {
                filename: filename.to_string(),
                detail: format!("page {}: {:?}", idx + 1, e),
            })?;

        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| LabelError::CorruptDocument {
                filename: filename.to_string(),
                detail: format!("page {} failed to render: {:?}", idx + 1, e),
            })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        rasters.push(PageRaster {
            index: idx,
            image,
            dpi,
        });
    }

    Ok(Rasterized {
        pages: rasters,
        total_pages,
    })
}

/// Decode a raster image.
///
/// An unrecognised signature is an unsupported format; a recognised header
/// with a body that fails to decode is a corrupt document.
pub fn decode_image(bytes: &[u8], filename: &str) -> Result<DynamicImage, LabelError> {
    let format = image::guess_format(bytes).map_err(|_| LabelError::UnsupportedFormat {
        filename: filename.to_string(),
        detail: "not a PDF or a recognised image format".into(),
    })?;
    let image = image::load_from_memory_with_format(bytes, format).map_err(|e| {
        LabelError::CorruptDocument {
            filename: filename.to_string(),
            detail: e.to_string(),
        }
    })?;
    if image.width() == 0 || image.height() == 0 {
        return Err(LabelError::CorruptDocument {
            filename: filename.to_string(),
            detail: "image has zero area".into(),
        });
    }
    Ok(image)
}
