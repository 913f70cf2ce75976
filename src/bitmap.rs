//! 1-bit label bitmap.
//!
//! [`MonoBitmap`] is the value passed from the normalizer to the ZPL codec.
//! `true` is a black (printed) dot, `false` is white, matching the `^GF`
//! convention where a set bit burns a dot.

use image::{GrayImage, Luma};

/// A row-major 1-bit bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonoBitmap {
    width: u32,
    height: u32,
    pixels: Vec<bool>,
}

impl MonoBitmap {
    /// An all-white bitmap.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![false; width as usize * height as usize],
        }
    }

    /// Build a bitmap from a per-pixel predicate (`true` = black).
    pub fn from_fn<F>(width: u32, height: u32, mut f: F) -> Self
    where
        F: FnMut(u32, u32) -> bool,
    {
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Rebuild a bitmap from MSB-first packed rows of `ceil(width/8)` bytes.
    ///
    /// Padding bits past `width` are ignored. Returns `None` when `data` is
    /// not exactly `ceil(width/8) * height` bytes.
    pub fn from_packed(width: u32, height: u32, data: &[u8]) -> Option<Self> {
        let bytes_per_row = (width as usize).div_ceil(8);
        if data.len() != bytes_per_row * height as usize {
            return None;
        }
        Some(Self::from_fn(width, height, |x, y| {
            let byte = data[y as usize * bytes_per_row + x as usize / 8];
            byte & (0x80 >> (x % 8)) != 0
        }))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Pixel at `(x, y)`; `true` is black.
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> bool {
        self.pixels[self.index(x, y)]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, black: bool) {
        let i = self.index(x, y);
        self.pixels[i] = black;
    }

    #[inline]
    fn index(&self, x: u32, y: u32) -> usize {
        debug_assert!(x < self.width && y < self.height);
        y as usize * self.width as usize + x as usize
    }

    /// One row of pixels.
    pub fn row(&self, y: u32) -> &[bool] {
        let start = y as usize * self.width as usize;
        &self.pixels[start..start + self.width as usize]
    }

    /// Number of black dots.
    pub fn black_count(&self) -> usize {
        self.pixels.iter().filter(|&&p| p).count()
    }

    /// Bytes per packed row: `ceil(width / 8)`.
    pub fn bytes_per_row(&self) -> usize {
        (self.width as usize).div_ceil(8)
    }

    /// Pack rows MSB-first, 1 = black, each row padded with white bits.
    pub fn pack(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.bytes_per_row() * self.height as usize);
        for y in 0..self.height {
            data.extend(pack_row(self.row(y)));
        }
        data
    }

    /// Render as an 8-bit grayscale image (black = 0, white = 255).
    pub fn to_gray_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            if self.get(x, y) {
                Luma([0u8])
            } else {
                Luma([255u8])
            }
        })
    }
}

/// Pack a row of boolean pixels into bytes, MSB first.
///
/// If the row length is not a multiple of 8 the last byte is padded with
/// zeros (white) on the right.
pub fn pack_row(pixels: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; pixels.len().div_ceil(8)];
    for (i, &pixel) in pixels.iter().enumerate() {
        if pixel {
            bytes[i / 8] |= 0x80 >> (i % 8);
        }
    }
    bytes
}
