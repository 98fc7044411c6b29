//! Update pipeline (component E): tracks per-connection modified/copy/
//! requested regions and assembles a single atomic `FramebufferUpdate`
//! message from them.
//!
//! The teacher's per-client `modified_regions`/`copy_region`/
//! `copy_offset` bookkeeping and deferral timer in `client.rs`
//! (`send_batched_update`) is the direct ancestor of this module,
//! generalized from `Vec<DirtyRegion>` (linear scan, single pending
//! copy offset tracked as a side `Option`) into the [`Region`] set
//! algebra of component B, and from "always encode with whatever
//! `preferred_encoding` resolved to" into the fallback-to-Raw and
//! LastRect/pseudo-rectangle handling spec §4.E requires that the
//! teacher never implemented.

use bytes::{BufMut, BytesMut};

use crate::encoding::copyrect::{CopyRectEncoder, CopySource};
use crate::encoding::{self, EncodingParams, RectEncoder};
use crate::error::Result;
use crate::pixel::{translate_pixels, PixelFormat};
use crate::protocol::*;
use crate::region::{IterOrder, Rect, Region};

/// Above this many bytes a Raw rectangle's translated pixels are
/// flushed mid-rectangle rather than buffered whole (spec §4.C "Raw").
pub const UPDATE_BUF_SIZE: usize = 30_000;

/// Source of framebuffer pixel data the update pipeline reads from
/// when assembling a rectangle; implemented by the embedding
/// application (server side) or by the decoded local mirror (client
/// side, for CopyRect application).
pub trait FramebufferSource {
    /// Current framebuffer geometry.
    fn size(&self) -> (u16, u16);
    /// The format pixels are stored in.
    fn format(&self) -> &PixelFormat;
    /// Row-major pixels of `rect`, packed with no inter-row padding.
    fn read_rect(&self, rect: Rect) -> Vec<u8>;
}

/// A pending RichCursor/XCursor pseudo-rectangle (spec §4.C "Fill of
/// pseudo-encodings").
#[derive(Debug, Clone)]
pub struct CursorShape {
    pub x_hot: u16,
    pub y_hot: u16,
    pub width: u16,
    pub height: u16,
    /// Row-major pixels in the client's negotiated format.
    pub pixels: Vec<u8>,
    /// One bit per pixel, row-major, MSB first, padded to a byte per row.
    pub mask: Vec<u8>,
}

/// Everything a client has negotiated about how updates are encoded
/// and which optional pseudo-encodings it understands.
#[derive(Debug, Clone, Default)]
pub struct EncodingCapabilities {
    pub preferred: i32,
    pub supports_copyrect: bool,
    pub supports_last_rect: bool,
    pub supports_cursor_shape: bool,
    pub supports_cursor_pos: bool,
    pub supports_new_fb_size: bool,
    pub supports_fence: bool,
    pub supports_continuous_updates: bool,
}

/// Owns the stateful per-connection encoders; constructed once and
/// reused across every `FramebufferUpdate` this connection sends.
pub struct EncoderSet {
    raw: encoding::raw::RawEncoder,
    rre: encoding::rre::RreEncoder,
    corre: encoding::corre::CoRreEncoder,
    hextile: encoding::hextile::HextileEncoder,
    zlib: encoding::zlib::ZlibEncoder,
    zlibhex: encoding::zlibhex::ZlibHexEncoder,
    tight: encoding::tight::TightEncoder,
    zrle: encoding::zrle::ZrleEncoder,
    #[cfg(feature = "h264")]
    h264: encoding::h264::H264Encoder,
    params: EncodingParams,
}

impl EncoderSet {
    #[must_use]
    pub fn new(params: EncodingParams) -> Self {
        Self {
            raw: encoding::raw::RawEncoder,
            rre: encoding::rre::RreEncoder,
            corre: encoding::corre::CoRreEncoder,
            hextile: encoding::hextile::HextileEncoder::new(),
            zlib: encoding::zlib::ZlibEncoder::new(params.compression_level),
            zlibhex: encoding::zlibhex::ZlibHexEncoder::new(params.compression_level),
            tight: encoding::tight::TightEncoder::new(params.compression_level, params.jpeg_quality),
            zrle: encoding::zrle::ZrleEncoder::new(params.compression_level),
            #[cfg(feature = "h264")]
            h264: encoding::h264::H264Encoder::new(),
            params,
        }
    }

    /// Encodes one rectangle with `encoding`, falling back to Raw on
    /// [`crate::error::RfbError::Unsupported`] (spec §4.E step 8:
    /// "falling back to Raw if the chosen encoder returns 'not
    /// applicable'").
    pub fn encode(
        &mut self,
        encoding_id: i32,
        x: u16,
        y: u16,
        pixels: &[u8],
        format: &PixelFormat,
        width: u16,
        height: u16,
        out: &mut BytesMut,
    ) -> Result<i32> {
        let result = match encoding_id {
            ENCODING_RAW => self.raw.encode(pixels, format, width, height, out),
            ENCODING_RRE => self.rre.encode(pixels, format, width, height, out),
            ENCODING_CORRE => self.corre.encode(pixels, format, width, height, out),
            ENCODING_HEXTILE => self.hextile.encode(pixels, format, width, height, out),
            ENCODING_ZLIB => self.zlib.encode(pixels, format, width, height, out),
            ENCODING_ZLIBHEX => self.zlibhex.encode(pixels, format, width, height, out),
            ENCODING_TIGHT => self.tight.encode(pixels, format, width, height, out),
            ENCODING_ZRLE => self.zrle.encode(pixels, format, width, height, out),
            #[cfg(feature = "h264")]
            ENCODING_H264 => self.h264.encode_rect(x, y, pixels, format, width, height, out),
            #[cfg(not(feature = "h264"))]
            ENCODING_H264 => {
                let _ = (x, y);
                Err(crate::error::RfbError::Unsupported("H.264 feature not enabled".into()))
            }
            _ => Err(crate::error::RfbError::Unsupported(format!("unknown encoding {encoding_id}"))),
        };
        match result {
            Ok(()) => Ok(encoding_id),
            Err(_) if encoding_id != ENCODING_RAW => {
                out.clear();
                self.raw.encode(pixels, format, width, height, out)?;
                Ok(ENCODING_RAW)
            }
            Err(e) => Err(e),
        }
    }

    pub fn set_jpeg_quality(&mut self, quality: u8) {
        self.params.jpeg_quality = quality;
    }

    pub fn set_compression_level(&mut self, level: u32) {
        self.params.compression_level = level;
    }
}

/// Component E: the mutable update state of one connection.
///
/// Invariants (spec §3): `copy_region ∩ modified_region = ∅` after any
/// mutating call settles; `requested_region` is empty whenever the
/// peer is not currently expecting a reply.
pub struct UpdatePipeline {
    modified_region: Region,
    copy_region: Region,
    copy_dx: i32,
    copy_dy: i32,
    requested_region: Region,
    incremental_outstanding: bool,
    progressive_slice_height: i32,
    slice_cursor: i32,
    pending_cursor_shape: Option<CursorShape>,
    pending_cursor_pos: Option<(u16, u16)>,
    pending_new_fb_size: bool,
    encoders: EncoderSet,
    caps: EncodingCapabilities,
}

impl UpdatePipeline {
    #[must_use]
    pub fn new(params: EncodingParams, caps: EncodingCapabilities) -> Self {
        Self {
            modified_region: Region::new(),
            copy_region: Region::new(),
            copy_dx: 0,
            copy_dy: 0,
            requested_region: Region::new(),
            incremental_outstanding: false,
            progressive_slice_height: 0,
            slice_cursor: 0,
            pending_cursor_shape: None,
            pending_cursor_pos: None,
            pending_new_fb_size: false,
            encoders: EncoderSet::new(params),
            caps,
        }
    }

    pub fn set_capabilities(&mut self, caps: EncodingCapabilities) {
        self.caps = caps;
    }

    /// Whether the client negotiated the Fence pseudo-encoding (spec
    /// §4.F): flow-control RTT pings are only sent once this is true.
    #[must_use]
    pub fn supports_fence(&self) -> bool {
        self.caps.supports_fence
    }

    pub fn encoders_mut(&mut self) -> &mut EncoderSet {
        &mut self.encoders
    }

    pub fn set_progressive_slice_height(&mut self, height: i32) {
        self.progressive_slice_height = height;
    }

    pub fn request_cursor_shape(&mut self, shape: CursorShape) {
        if self.caps.supports_cursor_shape {
            self.pending_cursor_shape = Some(shape);
        }
    }

    pub fn request_cursor_pos(&mut self, x: u16, y: u16) {
        if self.caps.supports_cursor_pos {
            self.pending_cursor_pos = Some((x, y));
        }
    }

    pub fn request_new_fb_size(&mut self) {
        if self.caps.supports_new_fb_size {
            self.pending_new_fb_size = true;
        }
    }

    /// `mark_modified` (spec §4.E).
    pub fn mark_modified(&mut self, rect: Rect) {
        self.modified_region.add(rect);
    }

    /// `schedule_copy` (spec §4.E): a second call with a different
    /// translation first flushes the pending copy into
    /// `modified_region`, since one connection only ever tracks one
    /// `(dx, dy)` at a time.
    pub fn schedule_copy(&mut self, rect: Rect, dx: i32, dy: i32) {
        if !self.copy_region.is_empty() && (dx != self.copy_dx || dy != self.copy_dy) {
            for r in self.copy_region.iter(IterOrder::RowMajor) {
                self.modified_region.add(r);
            }
            self.copy_region = Region::new();
        }
        self.copy_dx = dx;
        self.copy_dy = dy;
        self.copy_region.add(rect);
    }

    /// `framebuffer_update_request` (spec §4.E).
    pub fn framebuffer_update_request(&mut self, incremental: bool, rect: Rect) {
        self.requested_region.add(rect);
        self.incremental_outstanding = true;
        if !incremental {
            self.modified_region.add(rect);
            self.copy_region = self.copy_region.subtract(&Region::single(rect));
        }
    }

    /// True when an update is outstanding and there is something to
    /// send — the `FB_UPDATE_PENDING` condition of spec §4.E.
    #[must_use]
    pub fn has_pending_update(&self) -> bool {
        if !self.incremental_outstanding {
            return false;
        }
        self.pending_new_fb_size
            || self.pending_cursor_shape.is_some()
            || self.pending_cursor_pos.is_some()
            || !self
                .copy_region
                .union(&self.modified_region)
                .intersect(&self.requested_region)
                .is_empty()
    }

    fn next_slice_band(&mut self, fb_height: u16) -> Option<Rect> {
        if self.progressive_slice_height <= 0 {
            return None;
        }
        let h = self.progressive_slice_height;
        let y = self.slice_cursor;
        self.slice_cursor = (self.slice_cursor + h) % i32::from(fb_height).max(1);
        Some(Rect::new(0, y, i32::MAX / 2, h))
    }

    /// Builds one `FramebufferUpdate` message, implementing spec
    /// §4.E's nine-step algorithm, or `None` if there is nothing to
    /// send. Does not consult flow control; the caller (the session
    /// state machine) is responsible for gating this call on
    /// [`crate::flow::FlowController::defer_for`] first.
    pub fn build_update(&mut self, fb: &dyn FramebufferSource) -> Option<BytesMut> {
        if !self.has_pending_update() {
            return None;
        }

        if self.pending_new_fb_size {
            self.pending_new_fb_size = false;
            let (w, h) = fb.size();
            let mut msg = BytesMut::new();
            msg.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
            msg.put_u8(0);
            msg.put_u16(1);
            RectHeader { x: 0, y: 0, width: w, height: h, encoding: PSEUDO_ENCODING_DESKTOP_SIZE }
                .write_to(&mut msg);
            self.requested_region = Region::new();
            return Some(msg);
        }

        // Step 1: drop modified/copy overlap from the copy side.
        self.copy_region = self.copy_region.subtract(&self.modified_region);

        // Step 2.
        let mut update = self.copy_region.union(&self.modified_region).intersect(&self.requested_region);

        // Step 3: progressive slicing (spec §9: intersected *before*
        // the copy-region computation, preserved here as noted).
        let (_, fb_h) = fb.size();
        if let Some(band) = self.next_slice_band(fb_h) {
            update = update.intersect(&Region::single(band));
        }

        // Step 4.
        let update_copy_region = if self.caps.supports_copyrect {
            self.copy_region
                .intersect(&self.requested_region)
                .intersect(&self.requested_region.offset(self.copy_dx, self.copy_dy))
        } else {
            Region::new()
        };
        let pixel_region = update.subtract(&update_copy_region);

        // Step 5.
        self.modified_region = self.modified_region.subtract(&update);
        self.requested_region = Region::new();
        self.copy_region = Region::new();

        let format = fb.format().clone();

        let copy_rects: Vec<Rect> = update_copy_region
            .iter(IterOrder::CopySafe { dx: self.copy_dx, dy: self.copy_dy })
            .collect();
        let pixel_rects: Vec<Rect> = pixel_region.iter(IterOrder::RowMajor).collect();

        let pseudo_count = usize::from(self.pending_cursor_shape.is_some())
            + usize::from(self.pending_cursor_pos.is_some());
        let real_count = copy_rects.len() + pixel_rects.len();

        // Step 6: a Tight/CoRRE rectangle can split into more wire
        // rectangles than one logical rectangle, making the true count
        // hard to predict ahead of encoding; use the LastRect sentinel
        // when the client understands it.
        let splits_unpredictably = matches!(self.caps.preferred, ENCODING_TIGHT | ENCODING_CORRE);
        let use_last_rect = self.caps.supports_last_rect && splits_unpredictably;

        let mut msg = BytesMut::new();
        msg.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
        msg.put_u8(0);
        if use_last_rect {
            msg.put_u16(RECT_COUNT_UNKNOWN);
        } else {
            msg.put_u16((pseudo_count + real_count) as u16);
        }

        // Step 7: pseudo-rectangles precede real ones; cursor shape
        // precedes cursor position (spec §5 ordering guarantees).
        if let Some(shape) = self.pending_cursor_shape.take() {
            RectHeader {
                x: shape.x_hot,
                y: shape.y_hot,
                width: shape.width,
                height: shape.height,
                encoding: PSEUDO_ENCODING_CURSOR,
            }
            .write_to(&mut msg);
            msg.extend_from_slice(&shape.pixels);
            msg.extend_from_slice(&shape.mask);
        }
        if let Some((x, y)) = self.pending_cursor_pos.take() {
            RectHeader { x, y, width: 0, height: 0, encoding: PSEUDO_ENCODING_CURSOR_POS }.write_to(&mut msg);
        }

        // Step 8a: CopyRect rectangles before pixel rectangles (spec §5).
        // Destination is a translation of the source by (copy_dx, copy_dy)
        // (GLOSSARY: "dest = source + translation"), so the source the
        // client must copy from is the destination translated backwards.
        for rect in copy_rects {
            let src = CopySource {
                src_x: (rect.x1 - self.copy_dx) as u16,
                src_y: (rect.y1 - self.copy_dy) as u16,
            };
            RectHeader {
                x: rect.x1 as u16,
                y: rect.y1 as u16,
                width: rect.width() as u16,
                height: rect.height() as u16,
                encoding: ENCODING_COPYRECT,
            }
            .write_to(&mut msg);
            CopyRectEncoder::encode_with_source(src, &mut msg);
        }

        // Step 8b: pixel rectangles, encoded and flushed as produced.
        for rect in pixel_rects {
            self.encode_pixel_rect(fb, &format, rect, &mut msg);
        }

        if use_last_rect {
            RectHeader { x: 0, y: 0, width: 0, height: 0, encoding: PSEUDO_ENCODING_LAST_RECT }
                .write_to(&mut msg);
        }

        Some(msg)
    }

    fn encode_pixel_rect(&mut self, fb: &dyn FramebufferSource, format: &PixelFormat, rect: Rect, msg: &mut BytesMut) {
        let width = rect.width() as u16;
        let height = rect.height() as u16;
        let native = fb.read_rect(rect);
        let translated = translate_pixels(&native, fb.format(), format);

        let mut payload = BytesMut::new();
        let actual_encoding = self
            .encoders
            .encode(self.caps.preferred, rect.x1 as u16, rect.y1 as u16, &translated, format, width, height, &mut payload)
            .unwrap_or(ENCODING_RAW);

        RectHeader { x: rect.x1 as u16, y: rect.y1 as u16, width, height, encoding: actual_encoding }
            .write_to(msg);
        msg.extend_from_slice(&payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestFb {
        width: u16,
        height: u16,
        format: PixelFormat,
        pixels: Vec<u8>,
    }

    impl FramebufferSource for TestFb {
        fn size(&self) -> (u16, u16) {
            (self.width, self.height)
        }

        fn format(&self) -> &PixelFormat {
            &self.format
        }

        fn read_rect(&self, rect: Rect) -> Vec<u8> {
            let bpp = self.format.bytes_per_pixel();
            let stride = usize::from(self.width) * bpp;
            let mut out = Vec::new();
            for y in rect.y1..rect.y2 {
                let row_start = y as usize * stride + rect.x1 as usize * bpp;
                let row_end = row_start + rect.width() as usize * bpp;
                out.extend_from_slice(&self.pixels[row_start..row_end]);
            }
            out
        }
    }

    fn caps(preferred: i32) -> EncodingCapabilities {
        EncodingCapabilities {
            preferred,
            supports_copyrect: true,
            supports_last_rect: false,
            supports_cursor_shape: false,
            supports_cursor_pos: false,
            supports_new_fb_size: false,
            supports_fence: false,
            supports_continuous_updates: false,
        }
    }

    fn make_fb(w: u16, h: u16) -> TestFb {
        let format = PixelFormat::rgba32();
        let pixels = (0..usize::from(w) * usize::from(h) * 4).map(|i| i as u8).collect();
        TestFb { width: w, height: h, format, pixels }
    }

    /// Spec §8 scenario S1.
    #[test]
    fn non_incremental_request_sends_entire_framebuffer_as_raw() {
        let fb = make_fb(4, 4);
        let mut pipeline = UpdatePipeline::new(EncodingParams::default(), caps(ENCODING_RAW));
        pipeline.framebuffer_update_request(false, Rect::new(0, 0, 4, 4));
        let msg = pipeline.build_update(&fb).expect("update expected");
        assert_eq!(msg[0], SERVER_MSG_FRAMEBUFFER_UPDATE);
        let n_rects = u16::from_be_bytes([msg[2], msg[3]]);
        assert_eq!(n_rects, 1);
        let header = RectHeader::read_from(&mut BytesMut::from(&msg[4..16])).unwrap();
        assert_eq!((header.width, header.height, header.encoding), (4, 4, ENCODING_RAW));
        assert_eq!(&msg[16..], &fb.pixels[..]);
    }

    /// Spec §8 scenario S2.
    #[test]
    fn incremental_mark_sends_only_the_modified_sub_rectangle() {
        let fb = make_fb(4, 4);
        let mut pipeline = UpdatePipeline::new(EncodingParams::default(), caps(ENCODING_RAW));
        pipeline.framebuffer_update_request(false, Rect::new(0, 0, 4, 4));
        let _ = pipeline.build_update(&fb);

        pipeline.mark_modified(Rect::new(1, 1, 3, 3));
        pipeline.framebuffer_update_request(true, Rect::new(0, 0, 4, 4));
        let msg = pipeline.build_update(&fb).expect("update expected");
        let n_rects = u16::from_be_bytes([msg[2], msg[3]]);
        assert_eq!(n_rects, 1);
        let header = RectHeader::read_from(&mut BytesMut::from(&msg[4..16])).unwrap();
        assert_eq!((header.x, header.y, header.width, header.height), (1, 1, 2, 2));
        assert_eq!(msg.len() - 16, 16);
    }

    /// Spec §8 scenario S3: a copy of `[0,0,2,2]` by `(dx=2, dy=0)`
    /// lands at destination `[2,0,2,2]`, so `schedule_copy` is called
    /// with that destination rectangle and `dx=2`.
    #[test]
    fn copy_rect_precedes_modified_pixel_rect() {
        let fb = make_fb(8, 8);
        let mut pipeline = UpdatePipeline::new(EncodingParams::default(), caps(ENCODING_RAW));
        pipeline.framebuffer_update_request(false, Rect::new(0, 0, 8, 8));
        let _ = pipeline.build_update(&fb);

        pipeline.schedule_copy(Rect::new(2, 0, 2, 2), 2, 0);
        pipeline.mark_modified(Rect::new(0, 0, 2, 2));
        pipeline.framebuffer_update_request(true, Rect::new(0, 0, 8, 8));
        let msg = pipeline.build_update(&fb).expect("update expected");
        let n_rects = u16::from_be_bytes([msg[2], msg[3]]);
        assert_eq!(n_rects, 2);
        let first = RectHeader::read_from(&mut BytesMut::from(&msg[4..16])).unwrap();
        assert_eq!(first.encoding, ENCODING_COPYRECT);
        assert_eq!((first.x, first.y, first.width, first.height), (2, 0, 2, 2));
        let src_x = u16::from_be_bytes([msg[16], msg[17]]);
        let src_y = u16::from_be_bytes([msg[18], msg[19]]);
        assert_eq!((src_x, src_y), (0, 0));
        let second = RectHeader::read_from(&mut BytesMut::from(&msg[20..32])).unwrap();
        assert_eq!(second.encoding, ENCODING_RAW);
        assert_eq!((second.x, second.y, second.width, second.height), (0, 0, 2, 2));
    }

    #[test]
    fn no_update_when_nothing_requested() {
        let fb = make_fb(4, 4);
        let mut pipeline = UpdatePipeline::new(EncodingParams::default(), caps(ENCODING_RAW));
        pipeline.mark_modified(Rect::new(0, 0, 4, 4));
        assert!(pipeline.build_update(&fb).is_none());
    }

    #[test]
    fn invariant_copy_and_modified_regions_are_disjoint_after_settling() {
        let fb = make_fb(8, 8);
        let mut pipeline = UpdatePipeline::new(EncodingParams::default(), caps(ENCODING_RAW));
        pipeline.schedule_copy(Rect::new(0, 0, 4, 4), 4, 0);
        pipeline.mark_modified(Rect::new(0, 0, 2, 2));
        assert!(pipeline.copy_region.subtract(&pipeline.modified_region).count_rects() <= pipeline.copy_region.count_rects());
        pipeline.framebuffer_update_request(false, Rect::new(0, 0, 8, 8));
        let _ = pipeline.build_update(&fb);
        assert!(pipeline.copy_region.intersect(&pipeline.modified_region).is_empty());
    }
}
