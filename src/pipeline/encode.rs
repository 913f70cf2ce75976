//! Image payload encoding: `DynamicImage` → PNG → base64.
//!
//! Two consumers: the vision service (the page raster, as an attachment)
//! and the pipeline result (a preview of the 1-bit label). PNG is lossless,
//! so thin barcode bars and small address text survive the trip intact.

use crate::bitmap::MonoBitmap;
use crate::error::LabelError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use tracing::debug;

/// Longest edge sent to a vision model.
///
/// Larger images are downscaled by the provider anyway, and the box it
/// returns would then be in the provider's coordinate space instead of ours.
pub const VISION_MAX_EDGE: u32 = 1568;

/// A page image prepared for a vision call.
#[derive(Debug, Clone)]
pub struct VisionImage {
    /// Base64 PNG.
    pub base64: String,
    pub width: u32,
    pub height: u32,
    /// Multiply coordinates in this image by `scale` to get page pixels.
    pub scale: f64,
}

impl VisionImage {
    /// The same payload in the shape `edgequake-llm` providers expect.
    pub fn to_image_data(&self) -> ImageData {
        ImageData::new(self.base64.clone(), "image/png").with_detail("high")
    }
}

/// Encode an image as PNG bytes.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, LabelError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| LabelError::ImageProcessing(format!("PNG encode: {e}")))?;
    Ok(buf)
}

/// Encode an image as a base64 PNG string.
pub fn encode_png_base64(img: &DynamicImage) -> Result<String, LabelError> {
    let b64 = STANDARD.encode(encode_png(img)?);
    debug!("Encoded image → {} bytes base64", b64.len());
    Ok(b64)
}

/// Downscale (if needed) and encode a page raster for the vision service.
pub fn prepare_vision_image(img: &DynamicImage, max_edge: u32) -> Result<VisionImage, LabelError> {
    let longest = img.width().max(img.height());
    let (sent, scale) = if longest > max_edge && max_edge > 0 {
        let resized = img.resize(max_edge, max_edge, FilterType::Triangle);
        let scale = img.width() as f64 / resized.width().max(1) as f64;
        (resized, scale)
    } else {
        (img.clone(), 1.0)
    };

    Ok(VisionImage {
        base64: encode_png_base64(&sent)?,
        width: sent.width(),
        height: sent.height(),
        scale,
    })
}

/// Base64 PNG preview of a normalized label.
pub fn preview_png_base64(bitmap: &MonoBitmap) -> Result<String, LabelError> {
    encode_png_base64(&DynamicImage::ImageLuma8(bitmap.to_gray_image()))
}
