//! CopyRect encoding: tells the client to copy a rectangle already
//! present in its own framebuffer instead of resending pixels.
//!
//! The teacher never implemented this encoding (its update loop only
//! ever sent Raw-derived payloads); grounded here on the same 4-byte
//! `srcX, srcY` payload format the other subrectangle encodings in
//! `encoding/` already model with [`bytes::BufMut`]/[`bytes::Buf`].

use bytes::{Buf, BufMut, BytesMut};

use super::{RectDecoder, RectEncoder};
use crate::error::{RfbError, Result};
use crate::pixel::PixelFormat;
use crate::protocol::ENCODING_COPYRECT;

/// Source rectangle's top-left corner in the client's own framebuffer;
/// stashed via [`crate::update`] alongside the destination rectangle.
#[derive(Debug, Clone, Copy)]
pub struct CopySource {
    pub src_x: u16,
    pub src_y: u16,
}

pub struct CopyRectEncoder;

impl CopyRectEncoder {
    /// Encodes the 4-byte CopyRect payload directly, since the trait's
    /// `encode` signature carries no source-coordinate parameter.
    pub fn encode_with_source(src: CopySource, out: &mut BytesMut) {
        out.put_u16(src.src_x);
        out.put_u16(src.src_y);
    }
}

impl RectEncoder for CopyRectEncoder {
    fn encoding_id(&self) -> i32 {
        ENCODING_COPYRECT
    }

    fn encode(
        &mut self,
        _pixels: &[u8],
        _format: &PixelFormat,
        _width: u16,
        _height: u16,
        _out: &mut BytesMut,
    ) -> Result<()> {
        Err(RfbError::Codec {
            encoding: "CopyRect",
            message: "use encode_with_source; CopyRect has no pixel payload".into(),
        })
    }
}

pub struct CopyRectDecoder;

impl RectDecoder for CopyRectDecoder {
    fn encoding_id(&self) -> i32 {
        ENCODING_COPYRECT
    }

    fn decode(
        &mut self,
        input: &mut BytesMut,
        _format: &PixelFormat,
        _width: u16,
        _height: u16,
    ) -> Result<Vec<u8>> {
        if input.len() < 4 {
            return Err(RfbError::Protocol("truncated CopyRect payload".into()));
        }
        // The source coordinates are consumed here but applying the
        // copy against the client's framebuffer is session-layer work;
        // we hand back the raw 4-byte payload for the caller to parse
        // with `CopySource`.
        let src_x = input.get_u16();
        let src_y = input.get_u16();
        let mut out = Vec::with_capacity(4);
        out.extend_from_slice(&src_x.to_be_bytes());
        out.extend_from_slice(&src_y.to_be_bytes());
        Ok(out)
    }
}

impl CopySource {
    #[must_use]
    pub fn from_decoded(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 {
            return None;
        }
        Some(Self {
            src_x: u16::from_be_bytes([bytes[0], bytes[1]]),
            src_y: u16::from_be_bytes([bytes[2], bytes[3]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_source_coordinates() {
        let mut out = BytesMut::new();
        CopyRectEncoder::encode_with_source(CopySource { src_x: 10, src_y: 20 }, &mut out);
        let decoded = CopyRectDecoder.decode(&mut out, &PixelFormat::rgba32(), 5, 5).unwrap();
        let src = CopySource::from_decoded(&decoded).unwrap();
        assert_eq!((src.src_x, src.src_y), (10, 20));
    }
}
