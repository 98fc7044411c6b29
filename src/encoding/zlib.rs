//! Zlib encoding: raw pixel data compressed through a zlib stream kept
//! open for the life of the connection, so later rectangles benefit
//! from the dictionary built by earlier ones.
//!
//! Generalizes the teacher's free-function `encode_zlib_persistent`
//! (which hard-coded RGBA-to-RGBX repacking) into the [`RectEncoder`]
//! state-object shape the rest of `encoding/` now uses, and adds the
//! matching client-side [`RectDecoder`] the teacher never needed.

use bytes::{Buf, BufMut, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use super::{RectDecoder, RectEncoder};
use crate::error::{RfbError, Result};
use crate::pixel::PixelFormat;
use crate::protocol::ENCODING_ZLIB;

pub struct ZlibEncoder {
    compressor: Compress,
}

impl ZlibEncoder {
    #[must_use]
    pub fn new(level: u32) -> Self {
        Self { compressor: Compress::new(Compression::new(level), true) }
    }
}

impl RectEncoder for ZlibEncoder {
    fn encoding_id(&self) -> i32 {
        ENCODING_ZLIB
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode(
        &mut self,
        pixels: &[u8],
        _format: &PixelFormat,
        _width: u16,
        _height: u16,
        out: &mut BytesMut,
    ) -> Result<()> {
        let max_compressed = pixels.len() + pixels.len() / 1000 + 12;
        let mut compressed = vec![0u8; max_compressed];

        let previous_in = self.compressor.total_in();
        let previous_out = self.compressor.total_out();

        self.compressor
            .compress(pixels, &mut compressed, FlushCompress::Sync)
            .map_err(|e| RfbError::Codec { encoding: "Zlib", message: e.to_string() })?;

        let consumed = (self.compressor.total_in() - previous_in) as usize;
        let produced = (self.compressor.total_out() - previous_out) as usize;
        if consumed < pixels.len() {
            return Err(RfbError::Codec {
                encoding: "Zlib",
                message: format!("incomplete compression {consumed}/{}", pixels.len()),
            });
        }

        out.put_u32(produced as u32);
        out.extend_from_slice(&compressed[..produced]);
        Ok(())
    }
}

pub struct ZlibDecoder {
    decompressor: Decompress,
}

impl ZlibDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self { decompressor: Decompress::new(true) }
    }
}

impl Default for ZlibDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RectDecoder for ZlibDecoder {
    fn encoding_id(&self) -> i32 {
        ENCODING_ZLIB
    }

    fn decode(
        &mut self,
        input: &mut BytesMut,
        format: &PixelFormat,
        width: u16,
        height: u16,
    ) -> Result<Vec<u8>> {
        if input.len() < 4 {
            return Err(RfbError::Protocol("truncated Zlib length header".into()));
        }
        let len = input.get_u32() as usize;
        if input.len() < len {
            return Err(RfbError::Protocol("truncated Zlib payload".into()));
        }
        let compressed = input.copy_to_bytes(len);

        let expected = usize::from(width) * usize::from(height) * format.bytes_per_pixel();
        let mut out = vec![0u8; expected];
        let previous_out = self.decompressor.total_out();
        self.decompressor
            .decompress(&compressed, &mut out, FlushDecompress::Sync)
            .map_err(|e| RfbError::Codec { encoding: "Zlib", message: e.to_string() })?;
        let produced = (self.decompressor.total_out() - previous_out) as usize;
        if produced < expected {
            return Err(RfbError::Codec {
                encoding: "Zlib",
                message: format!("short decompression {produced}/{expected}"),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_across_multiple_rectangles() {
        let format = PixelFormat::rgba32();
        let mut enc = ZlibEncoder::new(5);
        let mut dec = ZlibDecoder::new();

        for fill in [0u8, 0xFF, 0x42] {
            let pixels = vec![fill; 16 * 16 * 4];
            let mut out = BytesMut::new();
            enc.encode(&pixels, &format, 16, 16, &mut out).unwrap();
            let decoded = dec.decode(&mut out, &format, 16, 16).unwrap();
            assert_eq!(decoded, pixels);
        }
    }
}
