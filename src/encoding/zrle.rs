//! ZRLE (Zlib Run-Length Encoding): the rectangle is divided into
//! 64x64 tiles, each tile chooses Raw, Solid, or a packed-palette
//! sub-encoding, and the whole tile stream is compressed through one
//! zlib stream kept open for the connection's lifetime.
//!
//! Generalizes the teacher's `encode_zrle`/`encode_zrle_persistent`
//! (RGBA32-only, one-shot `flate2::write::ZlibEncoder` per call) into
//! the persistent [`RectEncoder`]/[`RectDecoder`] state objects the
//! rest of `encoding/` now uses. To keep the tile format tractable
//! across arbitrary [`PixelFormat`]s, CPIXELs here are always 3-byte
//! RGB (via [`PixelFormat::unpack_rgb8`]/[`PixelFormat::pack_rgb8`]),
//! which matches the wire format the real protocol uses whenever depth
//! is 24 — true-colour formats are this crate's Non-goal-free case, so
//! this covers the [`crate::pixel::PixelFormat`]s this crate issues.
//! The Plain RLE and Packed-Palette RLE sub-encodings the teacher
//! implemented are not decoded here; the encoder never emits them, so
//! the omission does not affect round-trip correctness within this
//! crate (documented in `DESIGN.md`).

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use super::{RectDecoder, RectEncoder};
use crate::error::{RfbError, Result};
use crate::pixel::PixelFormat;
use crate::protocol::ENCODING_ZRLE;

const TILE: usize = 64;

const SUB_RAW: u8 = 0;
const SUB_SOLID: u8 = 1;

fn put_cpixel(buf: &mut BytesMut, format: &PixelFormat, native: u32) {
    let (r, g, b) = format.unpack_rgb8(native);
    buf.put_u8(r);
    buf.put_u8(g);
    buf.put_u8(b);
}

fn get_cpixel(buf: &mut BytesMut, format: &PixelFormat) -> u32 {
    let r = buf.get_u8();
    let g = buf.get_u8();
    let b = buf.get_u8();
    format.pack_rgb8(r, g, b)
}

fn encode_tile(buf: &mut BytesMut, format: &PixelFormat, tile: &[u32]) {
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for &p in tile {
        *counts.entry(p).or_insert(0) += 1;
    }

    if counts.len() == 1 {
        buf.put_u8(SUB_SOLID);
        put_cpixel(buf, format, tile[0]);
        return;
    }

    if counts.len() <= 16 {
        let palette: Vec<u32> = counts.keys().copied().collect();
        let bits_per_pixel: u32 = match palette.len() {
            2 => 1,
            3..=4 => 2,
            _ => 4,
        };
        let packed_bytes_needed = (tile.len() * bits_per_pixel as usize + 7) / 8;
        let raw_bytes = tile.len() * 3;
        let palette_bytes = palette.len() * 3;
        if palette_bytes + packed_bytes_needed < raw_bytes {
            buf.put_u8(palette.len() as u8);
            for &c in &palette {
                put_cpixel(buf, format, c);
            }
            let index: HashMap<u32, u8> =
                palette.iter().enumerate().map(|(i, &c)| (c, i as u8)).collect();
            let mut packed_byte = 0u8;
            let mut bit_pos = 0u32;
            for &p in tile {
                let idx = index[&p];
                let shift = 8 - bit_pos - bits_per_pixel;
                packed_byte |= idx << shift;
                bit_pos += bits_per_pixel;
                if bit_pos >= 8 {
                    buf.put_u8(packed_byte);
                    packed_byte = 0;
                    bit_pos = 0;
                }
            }
            if bit_pos > 0 {
                buf.put_u8(packed_byte);
            }
            return;
        }
    }

    buf.put_u8(SUB_RAW);
    for &p in tile {
        put_cpixel(buf, format, p);
    }
}

fn decode_tile(buf: &mut BytesMut, format: &PixelFormat, width: usize, height: usize) -> Result<Vec<u32>> {
    if buf.is_empty() {
        return Err(RfbError::Protocol("truncated ZRLE tile subencoding".into()));
    }
    let subencoding = buf.get_u8();
    match subencoding {
        SUB_RAW => {
            if buf.len() < width * height * 3 {
                return Err(RfbError::Protocol("truncated ZRLE raw tile".into()));
            }
            Ok((0..width * height).map(|_| get_cpixel(buf, format)).collect())
        }
        SUB_SOLID => {
            if buf.len() < 3 {
                return Err(RfbError::Protocol("truncated ZRLE solid tile".into()));
            }
            let color = get_cpixel(buf, format);
            Ok(vec![color; width * height])
        }
        n @ 2..=16 => {
            if buf.len() < usize::from(n) * 3 {
                return Err(RfbError::Protocol("truncated ZRLE palette".into()));
            }
            let palette: Vec<u32> = (0..n).map(|_| get_cpixel(buf, format)).collect();
            let bits_per_pixel: u32 = match n {
                2 => 1,
                3..=4 => 2,
                _ => 4,
            };
            let packed_len = (width * height * bits_per_pixel as usize + 7) / 8;
            if buf.len() < packed_len {
                return Err(RfbError::Protocol("truncated ZRLE packed pixels".into()));
            }
            let per_byte = 8 / bits_per_pixel as usize;
            let mask = (1u8 << bits_per_pixel) - 1;
            let mut pixels = Vec::with_capacity(width * height);
            'outer: for _ in 0..packed_len {
                let byte = buf.get_u8();
                for slot in 0..per_byte {
                    if pixels.len() >= width * height {
                        break 'outer;
                    }
                    let shift = 8 - bits_per_pixel as usize * (slot + 1);
                    let idx = (byte >> shift) & mask;
                    pixels.push(palette[usize::from(idx)]);
                }
            }
            Ok(pixels)
        }
        other => Err(RfbError::Codec {
            encoding: "ZRLE",
            message: format!("unsupported tile subencoding {other}"),
        }),
    }
}

pub struct ZrleEncoder {
    compressor: Compress,
}

impl ZrleEncoder {
    #[must_use]
    pub fn new(level: u32) -> Self {
        Self { compressor: Compress::new(Compression::new(level), true) }
    }
}

impl RectEncoder for ZrleEncoder {
    fn encoding_id(&self) -> i32 {
        ENCODING_ZRLE
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode(
        &mut self,
        pixels: &[u8],
        format: &PixelFormat,
        width: u16,
        height: u16,
        out: &mut BytesMut,
    ) -> Result<()> {
        let bpp = format.bytes_per_pixel();
        let native: Vec<u32> = pixels.chunks_exact(bpp).map(|c| format.read_pixel(c)).collect();
        let w = usize::from(width);
        let h = usize::from(height);

        let mut uncompressed = BytesMut::new();
        let mut ty = 0;
        while ty < h {
            let th = TILE.min(h - ty);
            let mut tx = 0;
            while tx < w {
                let tw = TILE.min(w - tx);
                let mut tile = Vec::with_capacity(tw * th);
                for dy in 0..th {
                    for dx in 0..tw {
                        tile.push(native[(ty + dy) * w + (tx + dx)]);
                    }
                }
                encode_tile(&mut uncompressed, format, &tile);
                tx += tw;
            }
            ty += th;
        }

        let max_compressed = uncompressed.len() + uncompressed.len() / 1000 + 64;
        let mut compressed = vec![0u8; max_compressed];
        let previous_in = self.compressor.total_in();
        let previous_out = self.compressor.total_out();
        self.compressor
            .compress(&uncompressed, &mut compressed, FlushCompress::Sync)
            .map_err(|e| RfbError::Codec { encoding: "ZRLE", message: e.to_string() })?;
        let consumed = (self.compressor.total_in() - previous_in) as usize;
        let produced = (self.compressor.total_out() - previous_out) as usize;
        if consumed < uncompressed.len() {
            return Err(RfbError::Codec {
                encoding: "ZRLE",
                message: format!("incomplete compression {consumed}/{}", uncompressed.len()),
            });
        }

        out.put_u32(produced as u32);
        out.extend_from_slice(&compressed[..produced]);
        Ok(())
    }
}

pub struct ZrleDecoder {
    decompressor: Decompress,
}

impl ZrleDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self { decompressor: Decompress::new(true) }
    }
}

impl Default for ZrleDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RectDecoder for ZrleDecoder {
    fn encoding_id(&self) -> i32 {
        ENCODING_ZRLE
    }

    fn decode(
        &mut self,
        input: &mut BytesMut,
        format: &PixelFormat,
        width: u16,
        height: u16,
    ) -> Result<Vec<u8>> {
        if input.len() < 4 {
            return Err(RfbError::Protocol("truncated ZRLE length header".into()));
        }
        let len = input.get_u32() as usize;
        if input.len() < len {
            return Err(RfbError::Protocol("truncated ZRLE payload".into()));
        }
        let compressed = input.copy_to_bytes(len);

        let w = usize::from(width);
        let h = usize::from(height);
        // Worst case is every tile raw: 3 bytes/pixel plus one header byte per tile.
        let tiles = ((w + TILE - 1) / TILE) * ((h + TILE - 1) / TILE);
        let mut uncompressed = vec![0u8; w * h * 3 + tiles + 64];
        let previous_in = self.decompressor.total_in();
        let previous_out = self.decompressor.total_out();
        self.decompressor
            .decompress(&compressed, &mut uncompressed, FlushDecompress::Sync)
            .map_err(|e| RfbError::Codec { encoding: "ZRLE", message: e.to_string() })?;
        let consumed = (self.decompressor.total_in() - previous_in) as usize;
        let produced = (self.decompressor.total_out() - previous_out) as usize;
        if consumed < compressed.len() {
            return Err(RfbError::Codec {
                encoding: "ZRLE",
                message: format!("incomplete decompression {consumed}/{}", compressed.len()),
            });
        }
        uncompressed.truncate(produced);

        let mut tile_stream = BytesMut::from(&uncompressed[..]);
        let mut canvas = vec![0u32; w * h];
        let mut ty = 0;
        while ty < h {
            let th = TILE.min(h - ty);
            let mut tx = 0;
            while tx < w {
                let tw = TILE.min(w - tx);
                let tile = decode_tile(&mut tile_stream, format, tw, th)?;
                for dy in 0..th {
                    for dx in 0..tw {
                        canvas[(ty + dy) * w + (tx + dx)] = tile[dy * tw + dx];
                    }
                }
                tx += tw;
            }
            ty += th;
        }

        let bpp = format.bytes_per_pixel();
        let mut out = vec![0u8; w * h * bpp];
        for (i, &v) in canvas.iter().enumerate() {
            format.write_pixel(&mut out[i * bpp..(i + 1) * bpp], v);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_rectangle_spanning_multiple_tiles() {
        let format = PixelFormat::rgba32();
        let width = 100u16;
        let height = 70u16;
        let mut pixels = BytesMut::new();
        for y in 0..height {
            for x in 0..width {
                let v: u32 = if x < 64 { 0x112233 } else { u32::from((x as u16) ^ y) };
                crate::encoding::common::put_pixel(&mut pixels, v, &format);
            }
        }
        let mut enc = ZrleEncoder::new(6);
        let mut dec = ZrleDecoder::new();
        let mut out = BytesMut::new();
        enc.encode(&pixels, &format, width, height, &mut out).unwrap();
        let decoded = dec.decode(&mut out, &format, width, height).unwrap();
        assert_eq!(decoded, pixels.to_vec());
    }

    #[test]
    fn solid_tile_round_trips() {
        let format = PixelFormat::rgba32();
        let pixels = vec![0x7Fu8; 64 * 64 * 4];
        let mut enc = ZrleEncoder::new(6);
        let mut dec = ZrleDecoder::new();
        let mut out = BytesMut::new();
        enc.encode(&pixels, &format, 64, 64, &mut out).unwrap();
        let decoded = dec.decode(&mut out, &format, 64, 64).unwrap();
        assert_eq!(decoded, pixels);
    }
}
