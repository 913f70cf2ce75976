//! ZPL graphic-field codec: [`MonoBitmap`] ⇄ `^GFA` command text.
//!
//! The bitmap is packed 8 dots per byte, MSB first, row-major, each row
//! padded to `ceil(W/8)` bytes, 1 = black. The packed bytes are then carried
//! in one of three data encodings:
//!
//! ```text
//! Z64            :Z64:<base64(zlib(bytes))>:<CRC-16 of the base64 text, 4 hex>
//! Hex            00FF80...                       2 chars per byte
//! CompressedHex  ZPL repeat alphabet over the hex text, row by row
//!                G..Y = 1..19   g..z = 20..400   (counts add up)
//!                ,  fill rest of row with 0      !  fill rest of row with F
//!                :  repeat previous row
//! ```
//!
//! Everything here is pure: no I/O, no clocks, no randomness. The decoder
//! exists so the codec can be checked for exact round-trips.

use crate::bitmap::MonoBitmap;
use crate::config::GraphicEncoding;
use crate::error::LabelError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// A finished ZPL label, ready to be sent verbatim to a raw print queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZplPayload {
    zpl: String,
    width_dots: u32,
    height_dots: u32,
    encoding: GraphicEncoding,
    graphic_bytes: usize,
}

impl ZplPayload {
    pub fn as_str(&self) -> &str {
        &self.zpl
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.zpl.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.zpl.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zpl.is_empty()
    }

    pub fn width_dots(&self) -> u32 {
        self.width_dots
    }

    pub fn height_dots(&self) -> u32 {
        self.height_dots
    }

    pub fn encoding(&self) -> GraphicEncoding {
        self.encoding
    }

    /// Uncompressed size of the packed bitmap.
    pub fn graphic_bytes(&self) -> usize {
        self.graphic_bytes
    }
}

/// Encode a bitmap as a complete single-label ZPL program.
///
/// ```text
/// ^XA
/// ^PW<W>
/// ^LL<H>
/// ^FO0,0^GFA,<total>,<total>,<bytes-per-row>,<data>^FS
/// ^PQ1
/// ^XZ
/// ```
pub fn encode_label(
    bitmap: &MonoBitmap,
    encoding: GraphicEncoding,
) -> Result<ZplPayload, LabelError> {
    let field = encode_graphic_field(bitmap, encoding)?;
    let graphic_bytes = bitmap.bytes_per_row() * bitmap.height() as usize;
    let zpl = format!(
        "^XA\n^PW{}\n^LL{}\n^FO0,0{}^FS\n^PQ1\n^XZ\n",
        bitmap.width(),
        bitmap.height(),
        field
    );
    Ok(ZplPayload {
        zpl,
        width_dots: bitmap.width(),
        height_dots: bitmap.height(),
        encoding,
        graphic_bytes,
    })
}

/// Encode just the `^GFA,…` graphic field (without `^FO` / `^FS`).
pub fn encode_graphic_field(
    bitmap: &MonoBitmap,
    encoding: GraphicEncoding,
) -> Result<String, LabelError> {
    if bitmap.is_empty() {
        return Err(LabelError::Encoding(format!(
            "cannot encode an empty {}x{} bitmap",
            bitmap.width(),
            bitmap.height()
        )));
    }
    let bytes_per_row = bitmap.bytes_per_row();
    let data = bitmap.pack();
    let total = data.len();
    if total != bytes_per_row * bitmap.height() as usize {
        return Err(LabelError::Encoding(format!(
            "packed {} bytes, expected {} rows of {}",
            total,
            bitmap.height(),
            bytes_per_row
        )));
    }

    let body = match encoding {
        GraphicEncoding::Z64 => z64_encode(&data)?,
        GraphicEncoding::Hex => hex_encode(&data),
        GraphicEncoding::CompressedHex => compress_hex(&data, bytes_per_row),
    };
    Ok(format!("^GFA,{total},{total},{bytes_per_row},{body}"))
}

/// Decode a `^GFA,…` field back into a bitmap `width` dots wide.
///
/// The `^GF` command does not carry the exact dot width (only whole bytes
/// per row), so the caller supplies it. A trailing `^FS` is tolerated.
pub fn decode_graphic_field(field: &str, width: u32) -> Result<MonoBitmap, LabelError> {
    let rest = field
        .trim()
        .strip_prefix("^GFA,")
        .ok_or_else(|| LabelError::Encoding("graphic field must start with ^GFA,".into()))?;
    let rest = rest.strip_suffix("^FS").unwrap_or(rest);

    let mut parts = rest.splitn(4, ',');
    let total = parse_field_number(parts.next(), "byte count")?;
    let _field_count = parse_field_number(parts.next(), "field count")?;
    let bytes_per_row = parse_field_number(parts.next(), "bytes per row")?;
    let body = parts
        .next()
        .ok_or_else(|| LabelError::Encoding("graphic field has no data".into()))?;

    if bytes_per_row == 0 || total % bytes_per_row != 0 {
        return Err(LabelError::Encoding(format!(
            "byte count {total} is not a whole number of {bytes_per_row}-byte rows"
        )));
    }
    if (width as usize).div_ceil(8) != bytes_per_row {
        return Err(LabelError::Encoding(format!(
            "width {width} does not match {bytes_per_row} bytes per row"
        )));
    }

    let data = if body.starts_with(":Z64:") {
        z64_decode(body)?
    } else {
        expand_hex(body, bytes_per_row)?
    };
    if data.len() != total {
        return Err(LabelError::Encoding(format!(
            "decoded {} bytes, header says {}",
            data.len(),
            total
        )));
    }

    let height = (total / bytes_per_row) as u32;
    MonoBitmap::from_packed(width, height, &data)
        .ok_or_else(|| LabelError::Encoding("packed data does not fill the bitmap".into()))
}

/// Decode the graphic of a label produced by [`encode_label`].
///
/// Reads the width from `^PW` and the field between `^FO0,0` and `^FS`.
pub fn decode_label(zpl: &str) -> Result<MonoBitmap, LabelError> {
    let width = zpl
        .split("^PW")
        .nth(1)
        .and_then(|s| s.split(|c: char| !c.is_ascii_digit()).next())
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| LabelError::Encoding("label has no ^PW width".into()))?;
    let start = zpl
        .find("^GFA,")
        .ok_or_else(|| LabelError::Encoding("label has no ^GFA field".into()))?;
    let end = zpl[start..]
        .find("^FS")
        .map(|i| start + i)
        .ok_or_else(|| LabelError::Encoding("graphic field is not terminated by ^FS".into()))?;
    decode_graphic_field(&zpl[start..end], width)
}

fn parse_field_number(part: Option<&str>, what: &str) -> Result<usize, LabelError> {
    part.and_then(|p| p.trim().parse::<usize>().ok())
        .ok_or_else(|| LabelError::Encoding(format!("graphic field has a bad {what}")))
}

// ── Z64 ──────────────────────────────────────────────────────────────────

fn z64_encode(data: &[u8]) -> Result<String, LabelError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(data)
        .map_err(|e| LabelError::Encoding(format!("zlib: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| LabelError::Encoding(format!("zlib: {e}")))?;
    let b64 = STANDARD.encode(compressed);
    let crc = crc16_xmodem(b64.as_bytes());
    Ok(format!(":Z64:{b64}:{crc:04X}"))
}

fn z64_decode(body: &str) -> Result<Vec<u8>, LabelError> {
    let inner = body.trim().trim_start_matches(":Z64:");
    let (b64, crc_hex) = inner
        .rsplit_once(':')
        .ok_or_else(|| LabelError::Encoding("Z64 data has no CRC".into()))?;
    let expected = u16::from_str_radix(crc_hex.trim(), 16)
        .map_err(|_| LabelError::Encoding(format!("bad Z64 CRC '{crc_hex}'")))?;
    let actual = crc16_xmodem(b64.as_bytes());
    if actual != expected {
        return Err(LabelError::Encoding(format!(
            "Z64 CRC mismatch: expected {expected:04X}, computed {actual:04X}"
        )));
    }

    let compressed = STANDARD
        .decode(b64)
        .map_err(|e| LabelError::Encoding(format!("Z64 base64: {e}")))?;
    let mut data = Vec::new();
    ZlibDecoder::new(compressed.as_slice())
        .read_to_end(&mut data)
        .map_err(|e| LabelError::Encoding(format!("Z64 inflate: {e}")))?;
    Ok(data)
}

/// CRC-16/XMODEM (poly 0x1021, init 0x0000), as used for the Z64 trailer.
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

// ── ASCII hex ────────────────────────────────────────────────────────────

fn hex_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for &b in data {
        out.push(HEX_DIGITS[(b >> 4) as usize] as char);
        out.push(HEX_DIGITS[(b & 0x0F) as usize] as char);
    }
    out
}

fn compress_hex(data: &[u8], bytes_per_row: usize) -> String {
    let mut out = String::new();
    let mut prev: Option<String> = None;
    for row in data.chunks(bytes_per_row) {
        let hex = hex_encode(row);
        if prev.as_deref() == Some(hex.as_str()) {
            out.push(':');
            continue;
        }
        compress_row(&hex, &mut out);
        prev = Some(hex);
    }
    out
}

fn compress_row(hex: &str, out: &mut String) {
    let chars = hex.as_bytes();
    let trailing = |c: u8| chars.iter().rev().take_while(|&&b| b == c).count();

    let (body_len, fill) = match chars.last() {
        Some(b'0') => (chars.len() - trailing(b'0'), Some(',')),
        Some(b'F') => (chars.len() - trailing(b'F'), Some('!')),
        _ => (chars.len(), None),
    };

    let mut i = 0;
    while i < body_len {
        let c = chars[i];
        let run = chars[i..body_len].iter().take_while(|&&b| b == c).count();
        push_run(out, run, c as char);
        i += run;
    }
    if let Some(f) = fill {
        out.push(f);
    }
}

fn push_run(out: &mut String, run: usize, c: char) {
    if run > 1 {
        let mut n = run;
        while n >= 400 {
            out.push('z');
            n -= 400;
        }
        if n >= 20 {
            out.push((b'g' + (n / 20 - 1) as u8) as char);
            n %= 20;
        }
        if n >= 1 {
            out.push((b'G' + (n - 1) as u8) as char);
        }
    }
    out.push(c);
}

/// Expand plain or run-length-compressed hex into packed bytes.
fn expand_hex(body: &str, bytes_per_row: usize) -> Result<Vec<u8>, LabelError> {
    let row_chars = bytes_per_row * 2;
    let mut hex: Vec<u8> = Vec::new();
    let mut row: Vec<u8> = Vec::with_capacity(row_chars);
    let mut prev: Option<Vec<u8>> = None;
    let mut count = 0usize;

    for ch in body.bytes() {
        match ch {
            b'G'..=b'Y' => count += (ch - b'G' + 1) as usize,
            b'g'..=b'z' => count += (ch - b'g' + 1) as usize * 20,
            b',' | b'!' => {
                let fill = if ch == b',' { b'0' } else { b'F' };
                row.resize(row_chars, fill);
                count = 0;
                finish_row(&mut hex, &mut row, &mut prev);
            }
            b':' => {
                if !row.is_empty() {
                    return Err(LabelError::Encoding("':' in the middle of a row".into()));
                }
                let previous = prev
                    .clone()
                    .ok_or_else(|| LabelError::Encoding("':' with no previous row".into()))?;
                row.extend_from_slice(&previous);
                count = 0;
                finish_row(&mut hex, &mut row, &mut prev);
            }
            b'0'..=b'9' | b'A'..=b'F' | b'a'..=b'f' => {
                let n = count.max(1);
                count = 0;
                if row.len() + n > row_chars {
                    return Err(LabelError::Encoding(format!(
                        "run of {n} overflows a {row_chars}-digit row"
                    )));
                }
                row.extend(std::iter::repeat(ch.to_ascii_uppercase()).take(n));
                if row.len() == row_chars {
                    finish_row(&mut hex, &mut row, &mut prev);
                }
            }
            b' ' | b'\r' | b'\n' | b'\t' => {}
            other => {
                return Err(LabelError::Encoding(format!(
                    "unexpected character '{}' in graphic data",
                    other as char
                )))
            }
        }
    }
    if !row.is_empty() {
        return Err(LabelError::Encoding("graphic data ends mid-row".into()));
    }

    Ok(hex
        .chunks(2)
        .map(|pair| (hex_value(pair[0]) << 4) | hex_value(pair[1]))
        .collect())
}

fn finish_row(hex: &mut Vec<u8>, row: &mut Vec<u8>, prev: &mut Option<Vec<u8>>) {
    hex.extend_from_slice(row);
    *prev = Some(std::mem::take(row));
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'A'..=b'F' => digit - b'A' + 10,
        _ => 0,
    }
}
