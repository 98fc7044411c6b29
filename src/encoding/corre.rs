//! CoRRE (Compact RRE): RRE with 8-bit subrectangle coordinates,
//! restricting it to rectangles no larger than 255x255 pixels.
//!
//! The update pipeline ([`crate::update`]) is responsible for tiling
//! larger rectangles before choosing this encoder; this module only
//! enforces the size ceiling, unlike the teacher's version which
//! silently fell back to a single lossy "whole rect is background"
//! subrectangle for anything over 255 pixels on a side.

use bytes::{Buf, BufMut, BytesMut};

use super::common::{find_subrects, get_background_color, put_pixel, unpack_pixels};
use super::{RectDecoder, RectEncoder};
use crate::error::{RfbError, Result};
use crate::pixel::PixelFormat;
use crate::protocol::ENCODING_CORRE;

const MAX_SIDE: u16 = 255;

pub struct CoRreEncoder;

impl RectEncoder for CoRreEncoder {
    fn encoding_id(&self) -> i32 {
        ENCODING_CORRE
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
        if width > MAX_SIDE || height > MAX_SIDE {
            return Err(RfbError::Codec {
                encoding: "CoRRE",
                message: format!("rectangle {width}x{height} exceeds the 255x255 CoRRE limit"),
            });
        }
        let native = unpack_pixels(pixels, format);
        let bg_color = get_background_color(&native);
        let subrects = find_subrects(&native, usize::from(width), usize::from(height), bg_color);

        out.put_u32(subrects.len() as u32);
        put_pixel(out, bg_color, format);
        for subrect in subrects {
            put_pixel(out, subrect.color, format);
            out.put_u8(subrect.x as u8);
            out.put_u8(subrect.y as u8);
            out.put_u8(subrect.w as u8);
            out.put_u8(subrect.h as u8);
        }
        Ok(())
    }
}

pub struct CoRreDecoder;

impl RectDecoder for CoRreDecoder {
    fn encoding_id(&self) -> i32 {
        ENCODING_CORRE
    }

    fn decode(
        &mut self,
        input: &mut BytesMut,
        format: &PixelFormat,
        width: u16,
        height: u16,
    ) -> Result<Vec<u8>> {
        if width > MAX_SIDE || height > MAX_SIDE {
            return Err(RfbError::Protocol("CoRRE rectangle exceeds 255x255".into()));
        }
        let bpp = format.bytes_per_pixel();
        if input.len() < 4 + bpp {
            return Err(RfbError::Protocol("truncated CoRRE header".into()));
        }
        let num_subrects = input.get_u32() as usize;
        let mut bg_bytes = vec![0u8; bpp];
        input.copy_to_slice(&mut bg_bytes);
        let bg = format.read_pixel(&bg_bytes);

        let w = usize::from(width);
        let h = usize::from(height);
        let mut canvas = vec![bg; w * h];

        for _ in 0..num_subrects {
            if input.len() < bpp + 4 {
                return Err(RfbError::Protocol("truncated CoRRE subrectangle".into()));
            }
            let mut color_bytes = vec![0u8; bpp];
            input.copy_to_slice(&mut color_bytes);
            let color = format.read_pixel(&color_bytes);
            let x = usize::from(input.get_u8());
            let y = usize::from(input.get_u8());
            let sw = usize::from(input.get_u8());
            let sh = usize::from(input.get_u8());
            if x + sw > w || y + sh > h {
                return Err(RfbError::Protocol("CoRRE subrectangle out of bounds".into()));
            }
            for dy in 0..sh {
                for dx in 0..sw {
                    canvas[(y + dy) * w + (x + dx)] = color;
                }
            }
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
    fn rejects_oversized_rectangle() {
        let format = PixelFormat::rgba32();
        let pixels = vec![0u8; 256 * 256 * 4];
        let mut out = BytesMut::new();
        assert!(CoRreEncoder.encode(&pixels, &format, 256, 256, &mut out).is_err());
    }

    #[test]
    fn round_trips_small_rectangle() {
        let format = PixelFormat::rgba32();
        let mut pixels = BytesMut::new();
        for v in [1u32, 1, 1, 9] {
            put_pixel(&mut pixels, v, &format);
        }
        let mut out = BytesMut::new();
        CoRreEncoder.encode(&pixels, &format, 2, 2, &mut out).unwrap();
        let decoded = CoRreDecoder.decode(&mut out, &format, 2, 2).unwrap();
        assert_eq!(decoded, pixels.to_vec());
    }
}
