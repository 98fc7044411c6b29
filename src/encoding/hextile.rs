//! Hextile encoding: the rectangle is divided into 16x16 tiles, each
//! coded as raw, solid, or a background/foreground pair plus
//! subrectangles, carrying background/foreground colour forward
//! between tiles so repeats cost nothing.
//!
//! The cross-tile `last_bg`/`last_fg` state the teacher tracked as
//! locals inside a single `encode` call is promoted here to encoder
//! state that persists across rectangles, since the wire format only
//! omits a background/foreground pixel when it matches the *previous
//! tile sent on this connection*, not just the previous tile in the
//! same rectangle.

use bytes::{Buf, BufMut, BytesMut};

use super::common::{analyze_tile_colors, extract_tile, find_subrects, put_pixel, unpack_pixels};
use super::{RectDecoder, RectEncoder};
use crate::error::{RfbError, Result};
use crate::pixel::PixelFormat;
use crate::protocol::{
    ENCODING_HEXTILE, HEXTILE_ANY_SUBRECTS, HEXTILE_BACKGROUND_SPECIFIED,
    HEXTILE_FOREGROUND_SPECIFIED, HEXTILE_RAW, HEXTILE_SUBRECTS_COLOURED,
};

const TILE: u16 = 16;

pub struct HextileEncoder {
    last_bg: Option<u32>,
    last_fg: Option<u32>,
}

impl HextileEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self { last_bg: None, last_fg: None }
    }
}

impl Default for HextileEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RectEncoder for HextileEncoder {
    fn encoding_id(&self) -> i32 {
        ENCODING_HEXTILE
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
        let native = unpack_pixels(pixels, format);

        let mut tile_y = 0u16;
        while tile_y < height {
            let tile_h = TILE.min(height - tile_y);
            let mut tile_x = 0u16;
            while tile_x < width {
                let tile_w = TILE.min(width - tile_x);

                let tile_pixels = extract_tile(
                    &native,
                    usize::from(width),
                    usize::from(tile_x),
                    usize::from(tile_y),
                    usize::from(tile_w),
                    usize::from(tile_h),
                );

                let (is_solid, is_mono, bg, fg) = analyze_tile_colors(&tile_pixels);

                let mut subencoding: u8 = 0;
                let tile_start = out.len();
                out.put_u8(0);

                if is_solid {
                    if Some(bg) != self.last_bg {
                        subencoding |= HEXTILE_BACKGROUND_SPECIFIED;
                        put_pixel(out, bg, format);
                        self.last_bg = Some(bg);
                    }
                } else {
                    let subrects =
                        find_subrects(&tile_pixels, usize::from(tile_w), usize::from(tile_h), bg);

                    let raw_size = usize::from(tile_w) * usize::from(tile_h) * bpp;
                    let bg_overhead = if Some(bg) == self.last_bg { 0 } else { bpp };
                    let fg_overhead = if is_mono && Some(fg) != self.last_fg { bpp } else { 0 };
                    let subrect_data = subrects.len() * if is_mono { 2 } else { bpp + 2 };
                    let encoded_size = bg_overhead + fg_overhead + 1 + subrect_data;

                    if subrects.is_empty() || subrects.len() > 255 || encoded_size > raw_size {
                        subencoding = HEXTILE_RAW;
                        out.truncate(tile_start);
                        out.put_u8(subencoding);
                        for &pixel in &tile_pixels {
                            put_pixel(out, pixel, format);
                        }
                        self.last_bg = None;
                        self.last_fg = None;
                        tile_x += tile_w;
                        continue;
                    }

                    if Some(bg) != self.last_bg {
                        subencoding |= HEXTILE_BACKGROUND_SPECIFIED;
                        put_pixel(out, bg, format);
                        self.last_bg = Some(bg);
                    }
                    subencoding |= HEXTILE_ANY_SUBRECTS;

                    if is_mono {
                        if Some(fg) != self.last_fg {
                            subencoding |= HEXTILE_FOREGROUND_SPECIFIED;
                            put_pixel(out, fg, format);
                            self.last_fg = Some(fg);
                        }
                        out.put_u8(subrects.len() as u8);
                        for sr in subrects {
                            out.put_u8(((sr.x as u8) << 4) | (sr.y as u8));
                            out.put_u8((((sr.w - 1) as u8) << 4) | ((sr.h - 1) as u8));
                        }
                    } else {
                        subencoding |= HEXTILE_SUBRECTS_COLOURED;
                        self.last_fg = None;
                        out.put_u8(subrects.len() as u8);
                        for sr in subrects {
                            put_pixel(out, sr.color, format);
                            out.put_u8(((sr.x as u8) << 4) | (sr.y as u8));
                            out.put_u8((((sr.w - 1) as u8) << 4) | ((sr.h - 1) as u8));
                        }
                    }
                }

                out[tile_start] = subencoding;
                tile_x += tile_w;
            }
            tile_y += tile_h;
        }

        Ok(())
    }
}

pub struct HextileDecoder {
    last_bg: u32,
    last_fg: u32,
}

impl HextileDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self { last_bg: 0, last_fg: 0 }
    }
}

impl Default for HextileDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RectDecoder for HextileDecoder {
    fn encoding_id(&self) -> i32 {
        ENCODING_HEXTILE
    }

    fn decode(
        &mut self,
        input: &mut BytesMut,
        format: &PixelFormat,
        width: u16,
        height: u16,
    ) -> Result<Vec<u8>> {
        let bpp = format.bytes_per_pixel();
        let w = usize::from(width);
        let h = usize::from(height);
        let mut canvas = vec![0u32; w * h];

        let mut tile_y = 0u16;
        while tile_y < height {
            let tile_h = TILE.min(height - tile_y);
            let mut tile_x = 0u16;
            while tile_x < width {
                let tile_w = TILE.min(width - tile_x);
                if input.is_empty() {
                    return Err(RfbError::Protocol("truncated Hextile tile header".into()));
                }
                let subencoding = input.get_u8();

                if subencoding & HEXTILE_RAW != 0 {
                    let needed = usize::from(tile_w) * usize::from(tile_h) * bpp;
                    if input.len() < needed {
                        return Err(RfbError::Protocol("truncated Hextile raw tile".into()));
                    }
                    for dy in 0..tile_h {
                        for dx in 0..tile_w {
                            let mut px = vec![0u8; bpp];
                            input.copy_to_slice(&mut px);
                            let v = format.read_pixel(&px);
                            canvas[(usize::from(tile_y + dy)) * w + usize::from(tile_x + dx)] = v;
                        }
                    }
                    tile_x += tile_w;
                    continue;
                }

                if subencoding & HEXTILE_BACKGROUND_SPECIFIED != 0 {
                    if input.len() < bpp {
                        return Err(RfbError::Protocol("truncated Hextile background".into()));
                    }
                    let mut px = vec![0u8; bpp];
                    input.copy_to_slice(&mut px);
                    self.last_bg = format.read_pixel(&px);
                }
                for dy in 0..tile_h {
                    for dx in 0..tile_w {
                        canvas[(usize::from(tile_y + dy)) * w + usize::from(tile_x + dx)] = self.last_bg;
                    }
                }

                if subencoding & HEXTILE_FOREGROUND_SPECIFIED != 0 {
                    if input.len() < bpp {
                        return Err(RfbError::Protocol("truncated Hextile foreground".into()));
                    }
                    let mut px = vec![0u8; bpp];
                    input.copy_to_slice(&mut px);
                    self.last_fg = format.read_pixel(&px);
                }

                if subencoding & HEXTILE_ANY_SUBRECTS != 0 {
                    if input.is_empty() {
                        return Err(RfbError::Protocol("truncated Hextile subrect count".into()));
                    }
                    let count = input.get_u8();
                    let coloured = subencoding & HEXTILE_SUBRECTS_COLOURED != 0;
                    for _ in 0..count {
                        let color = if coloured {
                            if input.len() < bpp {
                                return Err(RfbError::Protocol("truncated Hextile subrect colour".into()));
                            }
                            let mut px = vec![0u8; bpp];
                            input.copy_to_slice(&mut px);
                            format.read_pixel(&px)
                        } else {
                            self.last_fg
                        };
                        if input.len() < 2 {
                            return Err(RfbError::Protocol("truncated Hextile subrect geometry".into()));
                        }
                        let xy = input.get_u8();
                        let wh = input.get_u8();
                        let sx = u16::from(xy >> 4);
                        let sy = u16::from(xy & 0x0F);
                        let sw = u16::from(wh >> 4) + 1;
                        let sh = u16::from(wh & 0x0F) + 1;
                        if sx + sw > tile_w || sy + sh > tile_h {
                            return Err(RfbError::Protocol("Hextile subrect out of tile bounds".into()));
                        }
                        for dy in 0..sh {
                            for dx in 0..sw {
                                let px = usize::from(tile_x + sx + dx);
                                let py = usize::from(tile_y + sy + dy);
                                canvas[py * w + px] = color;
                            }
                        }
                    }
                }

                tile_x += tile_w;
            }
            tile_y += tile_h;
        }

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
    fn round_trips_multi_tile_rectangle() {
        let format = PixelFormat::rgba32();
        let width = 20u16;
        let height = 18u16;
        let mut pixels = BytesMut::new();
        for y in 0..height {
            for x in 0..width {
                let v = if (x / 4 + y / 4) % 2 == 0 { 0xAAu32 } else { 0x55 };
                put_pixel(&mut pixels, v, &format);
            }
        }
        let mut encoder = HextileEncoder::new();
        let mut out = BytesMut::new();
        encoder.encode(&pixels, &format, width, height, &mut out).unwrap();

        let mut decoder = HextileDecoder::new();
        let decoded = decoder.decode(&mut out, &format, width, height).unwrap();
        assert_eq!(decoded, pixels.to_vec());
    }

    #[test]
    fn background_carries_across_tiles_when_unchanged() {
        let format = PixelFormat::rgba32();
        let pixels = vec![0u8; 32 * 16 * 4]; // two solid tiles, same colour (0)
        let mut encoder = HextileEncoder::new();
        let mut out = BytesMut::new();
        encoder.encode(&pixels, &format, 32, 16, &mut out).unwrap();
        // First tile's subencoding byte specifies background; second tile's should not.
        assert_ne!(out[0] & HEXTILE_BACKGROUND_SPECIFIED, 0);
        let second_tile_offset = 1 + 4; // subencoding + bg pixel
        assert_eq!(out[second_tile_offset] & HEXTILE_BACKGROUND_SPECIFIED, 0);
    }
}
