//! H.264 encoding (`rfbEncodingH264` = 50): a *stateful*, per-rectangle
//! video codec. Unlike every other encoding in this module, the same
//! rectangle geometry seen again later reuses an encoder/decoder
//! context instead of starting cold, so motion video (window drags,
//! playback) gets real inter-frame compression instead of repeated
//! intra-only Tight/ZRLE frames.
//!
//! Grounded on the pack's `sorng-rdp` H.264 decode path
//! (`h264/openh264_decoder.rs`, which wraps `openh264::decoder::Decoder`
//! and `YUVSource::write_rgba8`) and its `h264/yuv_convert.rs` fixed-
//! point colour-conversion style; the encode direction has no teacher
//! or pack counterpart (every example only decodes H.264, none emit
//! it), so the encoder side is built from the `openh264::encoder` and
//! `yuv` crate APIs directly, in the same per-context, per-rectangle
//! shape the spec describes.
//!
//! The context key is the rectangle's geometry, `(x, y, w, h)`; neither
//! [`RectEncoder::encode`] nor [`RectDecoder::decode`] carry that or the
//! `flags` word the wire format needs, so — as with
//! [`super::copyrect`] — the trait methods are stubs that redirect to
//! [`H264Encoder::encode_rect`] / [`H264Decoder::decode_rect`].

use std::collections::{HashMap, VecDeque};

use bytes::{Buf, BufMut, BytesMut};
use openh264::decoder::Decoder;
use openh264::encoder::{Bitrate, Encoder, EncoderConfig, FrameRate};
use openh264::formats::YUVSource;
use yuv::{YuvPlanarImageMut, YuvRange, YuvStandardMatrix};

use super::{RectDecoder, RectEncoder};
use crate::error::{RfbError, Result};
use crate::pixel::PixelFormat;
use crate::protocol::{ENCODING_H264, H264_FLAG_RESET_ALL_CONTEXTS, H264_FLAG_RESET_CONTEXT};

/// Upper bound on live encoder/decoder contexts per connection.
pub const MAX_CONTEXTS: usize = 64;

/// Context key: a rectangle's position and size on the framebuffer.
type RectKey = (u16, u16, u16, u16);

/// Insertion-ordered key set with LRU touch/evict, shared by the
/// encoder and decoder context caches. Kept separate from the codec
/// state itself so the eviction policy can be unit tested without
/// spinning up a real H.264 codec.
#[derive(Default)]
struct LruKeys {
    order: VecDeque<RectKey>,
}

impl LruKeys {
    fn touch(&mut self, key: RectKey) {
        if let Some(pos) = self.order.iter().position(|k| *k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key);
    }

    fn forget(&mut self, key: RectKey) {
        self.order.retain(|k| *k != key);
    }

    fn clear(&mut self) {
        self.order.clear();
    }

    /// Returns the key to evict, if touching one more entry would push
    /// the set past `MAX_CONTEXTS`.
    fn evict_candidate(&self) -> Option<RectKey> {
        if self.order.len() >= MAX_CONTEXTS { self.order.front().copied() } else { None }
    }
}

struct EncodeContext {
    encoder: Encoder,
    force_keyframe: bool,
}

impl EncodeContext {
    fn new(width: u16, height: u16, bitrate_bps: u32) -> Result<Self> {
        let _ = (width, height);
        let config = EncoderConfig::new()
            .max_frame_rate(FrameRate::from_hz(30.0))
            .bitrate(Bitrate::from_bps(bitrate_bps));
        let encoder = Encoder::with_config(config)
            .map_err(|e| RfbError::Codec { encoding: "H264", message: e.to_string() })?;
        Ok(Self { encoder, force_keyframe: true })
    }
}

/// Server-side H.264 rectangle encoder: one LRU of up to
/// [`MAX_CONTEXTS`] contexts, each a live `openh264` encoder keyed by
/// rectangle geometry.
pub struct H264Encoder {
    contexts: HashMap<RectKey, EncodeContext>,
    lru: LruKeys,
    bitrate_bps: Option<u32>,
    reset_all_pending: bool,
}

impl H264Encoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            contexts: HashMap::new(),
            lru: LruKeys::default(),
            bitrate_bps: None,
            reset_all_pending: false,
        }
    }

    /// Overrides the per-frame target bitrate (bits/sec) used for new
    /// and reset contexts. Per spec, a change here forces every live
    /// context back to a keyframe.
    pub fn set_bitrate(&mut self, bps: u32) {
        self.bitrate_bps = Some(bps);
        self.request_keyframe_all();
    }

    /// Explicit API trigger: every live context sends a keyframe and
    /// the next outgoing rectangle carries `ResetAllContexts`.
    pub fn request_keyframe_all(&mut self) {
        self.reset_all_pending = true;
    }

    /// Encodes one rectangle for geometry `(x, y, w, h)`, creating or
    /// reusing that rectangle's context as needed.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode_rect(
        &mut self,
        x: u16,
        y: u16,
        pixels: &[u8],
        format: &PixelFormat,
        width: u16,
        height: u16,
        out: &mut BytesMut,
    ) -> Result<()> {
        let key = (x, y, width, height);
        let mut flags = 0u32;

        if self.reset_all_pending {
            for ctx in self.contexts.values_mut() {
                ctx.force_keyframe = true;
            }
            flags |= H264_FLAG_RESET_ALL_CONTEXTS;
            self.reset_all_pending = false;
        }

        let is_new = !self.contexts.contains_key(&key);
        if is_new {
            if let Some(evict) = self.lru.evict_candidate() {
                self.contexts.remove(&evict);
                self.lru.forget(evict);
            }
            let bitrate = self.bitrate_bps.unwrap_or_else(|| default_bitrate_bps(width, height));
            self.contexts.insert(key, EncodeContext::new(width, height, bitrate)?);
            flags |= H264_FLAG_RESET_CONTEXT;
        }
        self.lru.touch(key);

        let ctx = self.contexts.get_mut(&key).expect("just inserted or already present");
        if ctx.force_keyframe {
            flags |= H264_FLAG_RESET_CONTEXT;
        }

        let bgra = pixels_to_bgra(pixels, format);
        let yuv = bgra_to_i420(&bgra, width, height)?;

        if ctx.force_keyframe {
            ctx.encoder.force_intra_frame();
        }
        // `openh264`'s encoder prepends SPS/PPS Annex-B NAL units to the
        // bitstream itself on every IDR frame (including this forced
        // keyframe), so there is no separate sentConfig bookkeeping to
        // do here beyond forcing the keyframe above.
        let bitstream = ctx
            .encoder
            .encode(&yuv)
            .map_err(|e| RfbError::Codec { encoding: "H264", message: e.to_string() })?;
        let nal_bytes = bitstream.to_vec();

        ctx.force_keyframe = false;

        out.put_u32(nal_bytes.len() as u32);
        out.put_u32(flags);
        out.extend_from_slice(&nal_bytes);
        Ok(())
    }
}

impl Default for H264Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RectEncoder for H264Encoder {
    fn encoding_id(&self) -> i32 {
        ENCODING_H264
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
            encoding: "H264",
            message: "use encode_rect; H264 context selection needs rectangle coordinates".into(),
        })
    }
}

struct DecodeContext {
    decoder: Decoder,
}

/// Client-side H.264 rectangle decoder, mirror-symmetric with
/// [`H264Encoder`]: same key, same LRU, same reset semantics.
pub struct H264Decoder {
    contexts: HashMap<RectKey, DecodeContext>,
    lru: LruKeys,
}

impl H264Decoder {
    #[must_use]
    pub fn new() -> Self {
        Self { contexts: HashMap::new(), lru: LruKeys::default() }
    }

    pub fn decode_rect(
        &mut self,
        x: u16,
        y: u16,
        input: &mut BytesMut,
        format: &PixelFormat,
        width: u16,
        height: u16,
    ) -> Result<Vec<u8>> {
        if input.len() < 8 {
            return Err(RfbError::Protocol("truncated H264 rectangle header".into()));
        }
        let length = input.get_u32() as usize;
        let flags = input.get_u32();
        if input.len() < length {
            return Err(RfbError::Protocol("truncated H264 payload".into()));
        }
        let nal = input.copy_to_bytes(length);

        if flags & H264_FLAG_RESET_ALL_CONTEXTS != 0 {
            self.contexts.clear();
            self.lru.clear();
        }
        let key = (x, y, width, height);
        if flags & H264_FLAG_RESET_CONTEXT != 0 {
            self.contexts.remove(&key);
            self.lru.forget(key);
        }

        if !self.contexts.contains_key(&key) {
            if let Some(evict) = self.lru.evict_candidate() {
                self.contexts.remove(&evict);
                self.lru.forget(evict);
            }
            let decoder = Decoder::new()
                .map_err(|e| RfbError::Codec { encoding: "H264", message: e.to_string() })?;
            self.contexts.insert(key, DecodeContext { decoder });
        }
        self.lru.touch(key);

        let ctx = self.contexts.get_mut(&key).expect("just inserted or already present");
        let bpp = format.bytes_per_pixel();
        let blank = vec![0u8; usize::from(width) * usize::from(height) * bpp];
        match ctx.decoder.decode(&nal) {
            Ok(Some(yuv)) => {
                let (dw, dh) = yuv.dimensions();
                let mut rgba = vec![0u8; dw * dh * 4];
                yuv.write_rgba8(&mut rgba);
                Ok(rgba_to_pixels(&rgba, dw, dh, width, height, format))
            }
            // openh264 may buffer a frame internally before emitting one;
            // the caller keeps the previous content for this rectangle.
            Ok(None) => Ok(blank),
            Err(e) => Err(RfbError::Codec { encoding: "H264", message: e.to_string() }),
        }
    }
}

impl Default for H264Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RectDecoder for H264Decoder {
    fn encoding_id(&self) -> i32 {
        ENCODING_H264
    }

    fn decode(
        &mut self,
        _input: &mut BytesMut,
        _format: &PixelFormat,
        _width: u16,
        _height: u16,
    ) -> Result<Vec<u8>> {
        Err(RfbError::Codec {
            encoding: "H264",
            message: "use decode_rect; H264 context selection needs rectangle coordinates".into(),
        })
    }
}

/// `w*h*4` bits/frame at an assumed 30 fps GOP, converted to bits/sec.
fn default_bitrate_bps(width: u16, height: u16) -> u32 {
    let bits_per_frame = u32::from(width) * u32::from(height) * 4;
    bits_per_frame.saturating_mul(30)
}

fn pixels_to_bgra(pixels: &[u8], format: &PixelFormat) -> Vec<u8> {
    let bpp = format.bytes_per_pixel();
    let count = pixels.len() / bpp;
    let mut bgra = Vec::with_capacity(count * 4);
    for chunk in pixels.chunks_exact(bpp) {
        let v = format.read_pixel(chunk);
        let (r, g, b) = format.unpack_rgb8(v);
        bgra.extend_from_slice(&[b, g, r, 0xFF]);
    }
    bgra
}

fn rgba_to_pixels(
    rgba: &[u8],
    decoded_w: usize,
    decoded_h: usize,
    want_w: u16,
    want_h: u16,
    format: &PixelFormat,
) -> Vec<u8> {
    let bpp = format.bytes_per_pixel();
    let w = usize::from(want_w).min(decoded_w);
    let h = usize::from(want_h).min(decoded_h);
    let mut out = vec![0u8; usize::from(want_w) * usize::from(want_h) * bpp];
    for y in 0..h {
        for x in 0..w {
            let src = (y * decoded_w + x) * 4;
            let (r, g, b) = (rgba[src], rgba[src + 1], rgba[src + 2]);
            let v = format.pack_rgb8(r, g, b);
            let dst = (y * usize::from(want_w) + x) * bpp;
            format.write_pixel(&mut out[dst..dst + bpp], v);
        }
    }
    out
}

/// Converts a BGRA8888 buffer to an I420 (YUV 4:2:0) frame the encoder
/// can consume, using BT.601 limited range, the same matrix
/// `yuv_convert.rs` uses for the inverse NV12-to-RGBA direction.
fn bgra_to_i420(bgra: &[u8], width: u16, height: u16) -> Result<YuvPlanarImageMut<'static, u8>> {
    let w = u32::from(width);
    let h = u32::from(height);
    let mut image = YuvPlanarImageMut::alloc(w, h);
    yuv::bgra_to_yuv420(
        &mut image,
        bgra,
        w * 4,
        YuvRange::Limited,
        YuvStandardMatrix::Bt601,
    )
    .map_err(|e| RfbError::Codec { encoding: "H264", message: e.to_string() })?;
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_touch_moves_key_to_back() {
        let mut lru = LruKeys::default();
        lru.touch((0, 0, 16, 16));
        lru.touch((16, 0, 16, 16));
        lru.touch((0, 0, 16, 16));
        assert_eq!(lru.order.front().copied(), Some((16, 0, 16, 16)));
        assert_eq!(lru.order.back().copied(), Some((0, 0, 16, 16)));
    }

    #[test]
    fn lru_evicts_oldest_once_at_capacity() {
        let mut lru = LruKeys::default();
        for i in 0..MAX_CONTEXTS as u16 {
            lru.touch((i, 0, 16, 16));
        }
        assert!(lru.evict_candidate().is_none());
        lru.touch((MAX_CONTEXTS as u16, 0, 16, 16));
        assert_eq!(lru.evict_candidate(), Some((0, 0, 16, 16)));
    }

    #[test]
    fn pixel_to_bgra_round_trips_colour_channels() {
        let format = PixelFormat::rgba32();
        let mut pixels = BytesMut::new();
        super::super::common::put_pixel(&mut pixels, format.pack_rgb8(10, 20, 30), &format);
        let bgra = pixels_to_bgra(&pixels, &format);
        assert_eq!(&bgra[..4], &[30, 20, 10, 0xFF]);
    }
}
