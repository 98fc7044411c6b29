//! RRE (Rise-and-Run-length Encoding): a background colour plus a list
//! of solid-colour subrectangles. Effective for large uniform regions.
//!
//! Generalized from the teacher's RGBA32-only, little-endian-pixel
//! version to pack/unpack pixel values through [`PixelFormat`].

use bytes::{Buf, BufMut, BytesMut};

use super::common::{find_subrects, get_background_color, put_pixel, unpack_pixels};
use super::{RectDecoder, RectEncoder};
use crate::error::{RfbError, Result};
use crate::pixel::PixelFormat;
use crate::protocol::ENCODING_RRE;

pub struct RreEncoder;

impl RectEncoder for RreEncoder {
    fn encoding_id(&self) -> i32 {
        ENCODING_RRE
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
        let native = unpack_pixels(pixels, format);
        let bg_color = get_background_color(&native);
        let subrects = find_subrects(&native, usize::from(width), usize::from(height), bg_color);

        out.put_u32(subrects.len() as u32);
        put_pixel(out, bg_color, format);
        for subrect in subrects {
            put_pixel(out, subrect.color, format);
            out.put_u16(subrect.x);
            out.put_u16(subrect.y);
            out.put_u16(subrect.w);
            out.put_u16(subrect.h);
        }
        Ok(())
    }
}

pub struct RreDecoder;

impl RectDecoder for RreDecoder {
    fn encoding_id(&self) -> i32 {
        ENCODING_RRE
    }

    fn decode(
        &mut self,
        input: &mut BytesMut,
        format: &PixelFormat,
        width: u16,
        height: u16,
    ) -> Result<Vec<u8>> {
        let bpp = format.bytes_per_pixel();
        if input.len() < 4 + bpp {
            return Err(RfbError::Protocol("truncated RRE header".into()));
        }
        let num_subrects = input.get_u32() as usize;
        let mut bg_bytes = vec![0u8; bpp];
        input.copy_to_slice(&mut bg_bytes);
        let bg = format.read_pixel(&bg_bytes);

        let w = usize::from(width);
        let h = usize::from(height);
        let mut canvas = vec![bg; w * h];

        for _ in 0..num_subrects {
            if input.len() < bpp + 8 {
                return Err(RfbError::Protocol("truncated RRE subrectangle".into()));
            }
            let mut color_bytes = vec![0u8; bpp];
            input.copy_to_slice(&mut color_bytes);
            let color = format.read_pixel(&color_bytes);
            let x = usize::from(input.get_u16());
            let y = usize::from(input.get_u16());
            let sw = usize::from(input.get_u16());
            let sh = usize::from(input.get_u16());
            if x + sw > w || y + sh > h {
                return Err(RfbError::Protocol("RRE subrectangle out of bounds".into()));
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
    fn round_trips_solid_rectangle_with_one_subrect() {
        let format = PixelFormat::rgba32();
        // 4x2 all background except a 2x1 block.
        let mut pixels = BytesMut::new();
        let native = [0u32, 0, 0, 0, 7, 7, 0, 0];
        for v in native {
            super::put_pixel(&mut pixels, v, &format);
        }
        let mut out = BytesMut::new();
        RreEncoder.encode(&pixels, &format, 4, 2, &mut out).unwrap();
        let decoded = RreDecoder.decode(&mut out, &format, 4, 2).unwrap();
        assert_eq!(decoded, pixels.to_vec());
    }
}
