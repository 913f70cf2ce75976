//! Image normalizer: located region → exact-size 1-bit label.
//!
//! ```text
//! crop ──▶ flatten alpha on white ──▶ luma ──▶ orient (0° / 90° CCW)
//!      ──▶ Lanczos3 resize per scale policy ──▶ center on W×H white canvas
//!      ──▶ dither (Floyd–Steinberg | Bayer 8×8 | threshold) ──▶ MonoBitmap
//! ```
//!
//! The output is always exactly `W×H` dots whatever the input aspect ratio or
//! scale policy: shortfall is padded with white, overflow is center-cropped.
//! Every step is deterministic, so identical input gives identical bits.

use crate::bitmap::MonoBitmap;
use crate::config::{DitherMode, LabelConfig, ScalePolicy};
use crate::error::LabelError;
use crate::pipeline::locate::BoundingBox;
use crate::pipeline::render::PageRaster;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma};
use tracing::debug;

/// Bayer 8×8 ordered-dither thresholds, 0–63.
pub const BAYER8: [[u8; 8]; 8] = [
    [0, 32, 8, 40, 2, 34, 10, 42],
    [48, 16, 56, 24, 50, 18, 58, 26],
    [12, 44, 4, 36, 14, 46, 6, 38],
    [60, 28, 52, 20, 62, 30, 54, 22],
    [3, 35, 11, 43, 1, 33, 9, 41],
    [51, 19, 59, 27, 49, 17, 57, 25],
    [15, 47, 7, 39, 13, 45, 5, 37],
    [63, 31, 55, 23, 61, 29, 53, 21],
];

/// The normalized label plus what was done to get there.
#[derive(Debug, Clone)]
pub struct NormalizedLabel {
    pub bitmap: MonoBitmap,
    /// The region was rotated 90° counter-clockwise.
    pub rotated: bool,
    /// Size of the scaled region before it was placed on the canvas.
    pub content_width: u32,
    pub content_height: u32,
    pub scale: ScalePolicy,
}

impl NormalizedLabel {
    /// Stage-record detail text.
    pub fn detail(&self) -> String {
        format!(
            "{}x{} mono, {}{}",
            self.bitmap.width(),
            self.bitmap.height(),
            self.scale,
            if self.rotated { ", rotated 90°" } else { "" }
        )
    }
}

/// Normalize the `bbox` region of `raster` to the configured label size.
pub fn normalize(
    raster: &PageRaster,
    bbox: BoundingBox,
    config: &LabelConfig,
    scale: ScalePolicy,
) -> Result<NormalizedLabel, LabelError> {
    normalize_image(
        &raster.image,
        bbox,
        config.label_width_px(),
        config.label_height_px(),
        scale,
        config.dither,
    )
}

/// Normalize the `bbox` region of `image` to a `width`×`height` bitmap.
pub fn normalize_image(
    image: &DynamicImage,
    bbox: BoundingBox,
    width: u32,
    height: u32,
    scale: ScalePolicy,
    dither: DitherMode,
) -> Result<NormalizedLabel, LabelError> {
    if width == 0 || height == 0 {
        return Err(LabelError::ImageProcessing(format!(
            "zero-size target {width}x{height}"
        )));
    }

    let x = bbox.x.min(image.width());
    let y = bbox.y.min(image.height());
    let crop_w = bbox.width.min(image.width() - x);
    let crop_h = bbox.height.min(image.height() - y);
    if crop_w == 0 || crop_h == 0 {
        return Err(LabelError::ImageProcessing(format!(
            "zero-area crop {} on a {}x{} page",
            bbox,
            image.width(),
            image.height()
        )));
    }

    let region = image.crop_imm(x, y, crop_w, crop_h);
    let mut gray = flatten_to_luma(&region);

    let scale = scale.normalized();
    let keep = placement_score(gray.width(), gray.height(), width, height, scale);
    let turn = placement_score(gray.height(), gray.width(), width, height, scale);
    let rotated = turn > keep + 1e-9;
    if rotated {
        gray = imageops::rotate270(&gray);
    }

    let factor = scale_factor(gray.width(), gray.height(), width, height, scale);

    // Only the part of the region that lands on the label is resized.
    let vis_w = ((width as f64 / factor).ceil() as u32).clamp(1, gray.width());
    let vis_h = ((height as f64 / factor).ceil() as u32).clamp(1, gray.height());
    if (vis_w, vis_h) != gray.dimensions() {
        let x0 = (gray.width() - vis_w) / 2;
        let y0 = (gray.height() - vis_h) / 2;
        gray = imageops::crop_imm(&gray, x0, y0, vis_w, vis_h).to_image();
    }

    let new_w = ((gray.width() as f64 * factor).round() as u32).max(1);
    let new_h = ((gray.height() as f64 * factor).round() as u32).max(1);
    let resized = if (new_w, new_h) == gray.dimensions() {
        gray
    } else {
        imageops::resize(&gray, new_w, new_h, FilterType::Lanczos3)
    };
    debug!(
        "Normalize: crop {}x{} → {}x{} on {}x{} ({}, rotated={})",
        crop_w, crop_h, new_w, new_h, width, height, scale, rotated
    );

    let canvas = center_on_canvas(&resized, width, height);
    let bitmap = match dither {
        DitherMode::FloydSteinberg => floyd_steinberg(&canvas),
        DitherMode::Bayer => bayer(&canvas),
        DitherMode::Threshold => threshold(&canvas),
    };

    Ok(NormalizedLabel {
        bitmap,
        rotated,
        content_width: new_w,
        content_height: new_h,
        scale,
    })
}

/// Composite onto white and convert to 8-bit luma (BT.601 weights).
fn flatten_to_luma(image: &DynamicImage) -> GrayImage {
    let rgba = image.to_rgba8();
    GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let a = a as u32;
        let over_white = |c: u8| (c as u32 * a + 255 * (255 - a)) / 255;
        let luma = (over_white(r) * 299 + over_white(g) * 587 + over_white(b) * 114) / 1000;
        Luma([luma.min(255) as u8])
    })
}

fn scale_factor(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32, scale: ScalePolicy) -> f64 {
    let sx = dst_w as f64 / src_w as f64;
    let sy = dst_h as f64 / src_h as f64;
    match scale {
        ScalePolicy::Fit => sx.min(sy),
        ScalePolicy::Fill => sx.max(sy),
        ScalePolicy::Shrink(pct) => sx.min(sy) * pct as f64 / 100.0,
    }
}

/// Fraction of the label covered times fraction of the region kept.
///
/// Fit and shrink never crop, so this compares margins; fill always covers,
/// so this compares how much is cropped away.
fn placement_score(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32, scale: ScalePolicy) -> f64 {
    let f = scale_factor(src_w, src_h, dst_w, dst_h, scale);
    let (w, h) = (src_w as f64 * f, src_h as f64 * f);
    let (dw, dh) = (dst_w as f64, dst_h as f64);
    let covered = (w.min(dw) * h.min(dh)) / (dw * dh);
    let kept = (dw / w).min(1.0) * (dh / h).min(1.0);
    covered * kept
}

/// Place `img` centered on a white `width`×`height` canvas, cropping overflow.
fn center_on_canvas(img: &GrayImage, width: u32, height: u32) -> GrayImage {
    let off_x = (width as i64 - img.width() as i64) / 2;
    let off_y = (height as i64 - img.height() as i64) / 2;
    GrayImage::from_fn(width, height, |x, y| {
        let sx = x as i64 - off_x;
        let sy = y as i64 - off_y;
        if sx >= 0 && sy >= 0 && (sx as u32) < img.width() && (sy as u32) < img.height() {
            *img.get_pixel(sx as u32, sy as u32)
        } else {
            Luma([255])
        }
    })
}

/// Hard threshold at mid-gray.
pub fn threshold(gray: &GrayImage) -> MonoBitmap {
    MonoBitmap::from_fn(gray.width(), gray.height(), |x, y| {
        gray.get_pixel(x, y)[0] < 128
    })
}

/// Bayer 8×8 ordered dithering.
pub fn bayer(gray: &GrayImage) -> MonoBitmap {
    MonoBitmap::from_fn(gray.width(), gray.height(), |x, y| {
        let intensity = (255 - gray.get_pixel(x, y)[0]) as f32 / 255.0;
        let t = (BAYER8[(y & 7) as usize][(x & 7) as usize] as f32 + 0.5) / 64.0;
        intensity > t
    })
}

/// Floyd–Steinberg error diffusion in integer arithmetic.
pub fn floyd_steinberg(gray: &GrayImage) -> MonoBitmap {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let mut buf: Vec<i32> = gray.pixels().map(|p| p[0] as i32).collect();
    let mut out = MonoBitmap::new(gray.width(), gray.height());

    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            let old = buf[i];
            let new = if old < 128 { 0 } else { 255 };
            if new == 0 {
                out.set(x as u32, y as u32, true);
            }
            let err = old - new;
            if err == 0 {
                continue;
            }
            if x + 1 < w {
                buf[i + 1] += err * 7 / 16;
            }
            if y + 1 < h {
                if x > 0 {
                    buf[i + w - 1] += err * 3 / 16;
                }
                buf[i + w] += err * 5 / 16;
                if x + 1 < w {
                    buf[i + w + 1] += err / 16;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn solid(w: u32, h: u32, v: u8) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([v, v, v, 255])))
    }

    fn run(img: &DynamicImage, w: u32, h: u32, scale: ScalePolicy) -> NormalizedLabel {
        let bbox = BoundingBox::full(img.width(), img.height());
        normalize_image(img, bbox, w, h, scale, DitherMode::FloydSteinberg).unwrap()
    }

    #[test]
    fn output_dimensions_are_exact() {
        let sources = [(1275, 1650), (1650, 1275), (400, 400), (1, 1), (3000, 20), (7, 999)];
        let policies = [
            ScalePolicy::Fit,
            ScalePolicy::Fill,
            ScalePolicy::Shrink(50),
            ScalePolicy::Shrink(85),
        ];
        for (sw, sh) in sources {
            for scale in policies {
                let label = run(&solid(sw, sh, 0), 812, 1218, scale);
                assert_eq!(
                    (label.bitmap.width(), label.bitmap.height()),
                    (812, 1218),
                    "{sw}x{sh} {scale}"
                );
            }
        }
    }

    #[test]
    fn white_stays_white_black_fills() {
        let white = run(&solid(100, 150, 255), 200, 300, ScalePolicy::Fit);
        assert_eq!(white.bitmap.black_count(), 0);

        let black = run(&solid(100, 150, 0), 200, 300, ScalePolicy::Fit);
        assert_eq!(black.bitmap.black_count(), 200 * 300);
    }

    #[test]
    fn landscape_region_is_rotated_onto_portrait_label() {
        let label = run(&solid(300, 100, 0), 100, 300, ScalePolicy::Fit);
        assert!(label.rotated);
        assert_eq!(label.bitmap.black_count(), 100 * 300);
    }

    #[test]
    fn ties_keep_original_orientation() {
        let label = run(&solid(50, 50, 0), 80, 80, ScalePolicy::Fit);
        assert!(!label.rotated);
        let label = run(&solid(200, 100, 0), 100, 100, ScalePolicy::Fill);
        assert!(!label.rotated);
        assert_eq!(label.bitmap.black_count(), 100 * 100);
    }

    #[test]
    fn fit_pads_short_axis_with_white() {
        // 2:1 region on a square label: half the rows stay white.
        let label = run(&solid(200, 100, 0), 100, 100, ScalePolicy::Fit);
        assert_eq!((label.content_width, label.content_height), (100, 50));
        assert_eq!(label.bitmap.black_count(), 100 * 50);
        assert!(!label.bitmap.get(50, 0));
        assert!(label.bitmap.get(50, 50));
    }

    #[test]
    fn shrink_leaves_margins() {
        let label = run(&solid(100, 100, 0), 100, 100, ScalePolicy::Shrink(50));
        assert_eq!((label.content_width, label.content_height), (50, 50));
        assert_eq!(label.bitmap.black_count(), 50 * 50);
        assert!(!label.bitmap.get(0, 0));
        assert!(label.bitmap.get(50, 50));
    }

    #[test]
    fn crop_uses_the_box() {
        // Black left half, white right half; crop the right half only.
        let img = DynamicImage::ImageRgba8(RgbaImage::from_fn(100, 100, |x, _| {
            if x < 50 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        }));
        let label = normalize_image(
            &img,
            BoundingBox::new(50, 0, 50, 100),
            40,
            80,
            ScalePolicy::Fit,
            DitherMode::Threshold,
        )
        .unwrap();
        assert_eq!(label.bitmap.black_count(), 0);
    }

    #[test]
    fn transparent_pixels_become_white() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(20, 20, Rgba([0, 0, 0, 0])));
        let label = run(&img, 20, 20, ScalePolicy::Fit);
        assert_eq!(label.bitmap.black_count(), 0);
    }

    #[test]
    fn zero_area_crop_is_an_error() {
        let img = solid(10, 10, 0);
        let err = normalize_image(
            &img,
            BoundingBox::new(10, 0, 5, 5),
            10,
            10,
            ScalePolicy::Fit,
            DitherMode::Threshold,
        )
        .unwrap_err();
        assert!(matches!(err, LabelError::ImageProcessing(_)));

        let err = normalize_image(
            &img,
            BoundingBox::full(10, 10),
            0,
            10,
            ScalePolicy::Fit,
            DitherMode::Threshold,
        )
        .unwrap_err();
        assert!(err.to_string().contains("zero-size"));
    }

    #[test]
    fn mid_gray_dithers_to_roughly_half() {
        let gray = GrayImage::from_pixel(64, 64, Luma([127]));
        let total = 64 * 64;
        for bmp in [floyd_steinberg(&gray), bayer(&gray)] {
            let black = bmp.black_count();
            assert!(black > total * 2 / 5 && black < total * 3 / 5, "{black}");
        }
        assert_eq!(threshold(&gray).black_count(), total);
        assert_eq!(threshold(&GrayImage::from_pixel(4, 4, Luma([128]))).black_count(), 0);
    }

    #[test]
    fn normalization_is_deterministic() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_fn(123, 77, |x, y| {
            let v = ((x * 7 + y * 13) % 256) as u8;
            Rgba([v, v / 2, 255 - v, 255])
        }));
        let a = run(&img, 203, 305, ScalePolicy::Fit);
        let b = run(&img, 203, 305, ScalePolicy::Fit);
        assert_eq!(a.bitmap, b.bitmap);
    }
}
