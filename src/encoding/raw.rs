//! Raw encoding: pixel data sent uncompressed, tightly packed.
//!
//! The simplest of the teacher's encodings; generalized here to pass
//! through whatever [`PixelFormat`] the caller already translated the
//! framebuffer into, rather than assuming RGBA32 input.

use bytes::{Buf, BytesMut};

use super::{RectDecoder, RectEncoder};
use crate::error::{RfbError, Result};
use crate::pixel::PixelFormat;
use crate::protocol::ENCODING_RAW;

pub struct RawEncoder;

impl RectEncoder for RawEncoder {
    fn encoding_id(&self) -> i32 {
        ENCODING_RAW
    }

    fn encode(
        &mut self,
        pixels: &[u8],
        _format: &PixelFormat,
        _width: u16,
        _height: u16,
        out: &mut BytesMut,
    ) -> Result<()> {
        out.extend_from_slice(pixels);
        Ok(())
    }
}

pub struct RawDecoder;

impl RectDecoder for RawDecoder {
    fn encoding_id(&self) -> i32 {
        ENCODING_RAW
    }

    fn decode(
        &mut self,
        input: &mut BytesMut,
        format: &PixelFormat,
        width: u16,
        height: u16,
    ) -> Result<Vec<u8>> {
        let needed = usize::from(width) * usize::from(height) * format.bytes_per_pixel();
        if input.len() < needed {
            return Err(RfbError::Protocol("truncated Raw rectangle".into()));
        }
        let mut out = vec![0u8; needed];
        input.copy_to_slice(&mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_pixels() {
        let format = PixelFormat::rgba32();
        let pixels = vec![1u8, 2, 3, 0, 4, 5, 6, 0];
        let mut out = BytesMut::new();
        RawEncoder.encode(&pixels, &format, 2, 1, &mut out).unwrap();
        let mut input = out;
        let decoded = RawDecoder.decode(&mut input, &format, 2, 1).unwrap();
        assert_eq!(decoded, pixels);
    }

    #[test]
    fn rejects_truncated_input() {
        let format = PixelFormat::rgba32();
        let mut input = BytesMut::from(&[0u8; 4][..]);
        assert!(RawDecoder.decode(&mut input, &format, 2, 1).is_err());
    }
}
