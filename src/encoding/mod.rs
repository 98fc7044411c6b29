//! Encoding codecs (component C).
//!
//! Every rectangle encoding implements [`RectEncoder`] on the server
//! side and [`RectDecoder`] on the client side. This generalizes the
//! teacher's `Encoding` trait (`encode(data, width, height, quality,
//! compression) -> BytesMut`, hard-coded to RGBA32 input) into a
//! stateful, arbitrary-pixel-format pair of traits: stateful because
//! Zlib/Tight/ZRLE/H.264 all keep a persistent compressor or encoder
//! context per connection (spec §3 "per-encoding encoder state"), and
//! a `Decoder` counterpart because the teacher never had a client.

pub mod common;
pub mod copyrect;
pub mod corre;
#[cfg(feature = "h264")]
pub mod h264;
pub mod hextile;
pub mod raw;
pub mod rre;
pub mod tight;
pub mod zlib;
pub mod zlibhex;
pub mod zrle;

use bytes::BytesMut;

use crate::error::Result;
use crate::pixel::PixelFormat;
use crate::protocol::*;

/// Server-side encoder for one rectangle encoding.
///
/// `pixels` is already translated into `format`, tightly packed
/// row-major with no inter-row padding. Implementations write the
/// encoding-specific payload (not the 12-byte rectangle header, which
/// the update pipeline writes uniformly) into `out`.
pub trait RectEncoder: Send {
    /// The wire encoding id this encoder produces.
    fn encoding_id(&self) -> i32;

    /// Encodes one rectangle's pixels into `out`.
    fn encode(
        &mut self,
        pixels: &[u8],
        format: &PixelFormat,
        width: u16,
        height: u16,
        out: &mut BytesMut,
    ) -> Result<()>;
}

/// Client-side decoder for one rectangle encoding.
pub trait RectDecoder: Send {
    /// The wire encoding id this decoder consumes.
    fn encoding_id(&self) -> i32;

    /// Decodes one rectangle's payload, returning pixels packed in
    /// `format`, row-major, with no inter-row padding.
    fn decode(
        &mut self,
        input: &mut BytesMut,
        format: &PixelFormat,
        width: u16,
        height: u16,
    ) -> Result<Vec<u8>>;
}

/// Tunables that affect encoder selection and lossy-encoding quality,
/// negotiated via the pseudo-encodings of spec §4.C.
#[derive(Debug, Clone, Copy)]
pub struct EncodingParams {
    /// JPEG quality (0-100) used by Tight's JPEG subencoding.
    pub jpeg_quality: u8,
    /// Zlib compression level (0-9) shared by Zlib/ZlibHex/Tight/ZRLE.
    pub compression_level: u32,
    /// Maximum number of distinct colours Tight will palette-encode.
    pub tight_palette_threshold: usize,
}

impl Default for EncodingParams {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            compression_level: 5,
            tight_palette_threshold: 256,
        }
    }
}

/// Builds a fresh, stateless encoder (Raw/CopyRect/RRE/CoRRE/Hextile)
/// for the given encoding id, or `None` for encodings that require
/// persistent per-connection state and must be constructed explicitly
/// (Zlib, ZlibHex, Tight, ZRLE, H.264).
#[must_use]
pub fn stateless_encoder(encoding: i32) -> Option<Box<dyn RectEncoder>> {
    match encoding {
        ENCODING_RAW => Some(Box::new(raw::RawEncoder)),
        ENCODING_COPYRECT => Some(Box::new(copyrect::CopyRectEncoder)),
        ENCODING_RRE => Some(Box::new(rre::RreEncoder)),
        ENCODING_CORRE => Some(Box::new(corre::CoRreEncoder)),
        ENCODING_HEXTILE => Some(Box::new(hextile::HextileEncoder::new())),
        _ => None,
    }
}

/// Same as [`stateless_encoder`] for the client-side decoders.
#[must_use]
pub fn stateless_decoder(encoding: i32) -> Option<Box<dyn RectDecoder>> {
    match encoding {
        ENCODING_RAW => Some(Box::new(raw::RawDecoder)),
        ENCODING_COPYRECT => Some(Box::new(copyrect::CopyRectDecoder)),
        ENCODING_RRE => Some(Box::new(rre::RreDecoder)),
        ENCODING_CORRE => Some(Box::new(corre::CoRreDecoder)),
        ENCODING_HEXTILE => Some(Box::new(hextile::HextileDecoder::new())),
        _ => None,
    }
}
