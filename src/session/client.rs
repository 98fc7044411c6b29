//! Client-side session: mirror-symmetric handshake and the steady-state
//! message loop that decodes server rectangles into a local
//! framebuffer mirror.
//!
//! Grounded on the teacher's `VncClient::new`/`VncClient::run` in
//! `client.rs`: same read-version/write-version/read-security-types/
//! write-choice/challenge-response/read-ServerInit sequence, same
//! "decode into a local pixel buffer, hand it to the embedder" loop
//! shape, generalized to every encoding in `encoding/` instead of the
//! teacher's Raw-only decode path and to the [`Phase`]-tracked
//! handshake instead of a constructor that simply fails partway
//! through on any wire surprise.

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use super::Phase;
use crate::auth;
use crate::encoding::copyrect::{CopyRectDecoder, CopySource};
use crate::encoding::{self, RectDecoder};
use crate::error::{RfbError, Result};
use crate::extensions::{DynStream, Handler};
use crate::io::WireIo;
use crate::pixel::PixelFormat;
use crate::protocol::*;
use crate::region::Rect;
use crate::vencrypt::X509Credentials;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Client-side security policy: what this client is willing/able to
/// present when the server asks.
#[derive(Clone, Default)]
pub struct ClientSecurity {
    pub password: Option<String>,
    pub credentials: X509Credentials,
    pub allow_vencrypt: bool,
}

/// Decoder pool mirroring [`crate::update::EncoderSet`] on the server
/// side; one persistent instance per stateful codec, reused across
/// every decoded rectangle.
struct DecoderSet {
    zlib: encoding::zlib::ZlibDecoder,
    zlibhex: encoding::zlibhex::ZlibHexDecoder,
    tight: encoding::tight::TightDecoder,
    zrle: encoding::zrle::ZrleDecoder,
    hextile: encoding::hextile::HextileDecoder,
    #[cfg(feature = "h264")]
    h264: encoding::h264::H264Decoder,
}

impl DecoderSet {
    fn new() -> Self {
        Self {
            zlib: encoding::zlib::ZlibDecoder::new(),
            zlibhex: encoding::zlibhex::ZlibHexDecoder::new(),
            tight: encoding::tight::TightDecoder::new(),
            zrle: encoding::zrle::ZrleDecoder::new(),
            hextile: encoding::hextile::HextileDecoder::new(),
            #[cfg(feature = "h264")]
            h264: encoding::h264::H264Decoder::new(),
        }
    }

    fn decode(
        &mut self,
        encoding_id: i32,
        input: &mut BytesMut,
        format: &PixelFormat,
        width: u16,
        height: u16,
    ) -> Result<Vec<u8>> {
        if let Some(mut decoder) = encoding::stateless_decoder(encoding_id) {
            return decoder.decode(input, format, width, height);
        }
        match encoding_id {
            ENCODING_ZLIB => self.zlib.decode(input, format, width, height),
            ENCODING_ZLIBHEX => self.zlibhex.decode(input, format, width, height),
            ENCODING_TIGHT => self.tight.decode(input, format, width, height),
            ENCODING_ZRLE => self.zrle.decode(input, format, width, height),
            ENCODING_HEXTILE => self.hextile.decode(input, format, width, height),
            #[cfg(feature = "h264")]
            ENCODING_H264 => self.h264.decode(input, format, width, height),
            #[cfg(not(feature = "h264"))]
            ENCODING_H264 => Err(RfbError::Unsupported("H.264 feature not enabled".into())),
            other => Err(RfbError::Unsupported(format!("unknown encoding {other}"))),
        }
    }
}

/// One connection to a VNC server: owns the decoded local framebuffer
/// mirror and the persistent decoder state.
pub struct ClientSession {
    io: WireIo<Box<dyn DynStream>>,
    phase: Phase,
    minor: ProtoMinor,
    format: PixelFormat,
    width: u16,
    height: u16,
    name: String,
    framebuffer: Vec<u8>,
    decoders: DecoderSet,
}

impl ClientSession {
    /// Drives the handshake to completion, allocating the local
    /// framebuffer mirror via `handler.allocate_framebuffer` once
    /// `ServerInit` arrives.
    pub async fn handshake(
        mut stream: Box<dyn DynStream>,
        security: ClientSecurity,
        requested_format: Option<PixelFormat>,
        handler: &mut dyn Handler,
    ) -> Result<Self> {
        let mut version_line = [0u8; 12];
        stream.read_exact(&mut version_line).await.map_err(RfbError::Io)?;
        let minor = ProtoMinor::parse(&version_line)?;
        stream.write_all(minor.wire_str().as_bytes()).await.map_err(RfbError::Io)?;

        let mut stream = Self::negotiate_security(stream, minor, &security).await?;

        // ClientInit: shared-flag always 1 (share the desktop with
        // other viewers), matching the teacher's hard-coded choice.
        stream.write_all(&[1]).await.map_err(RfbError::Io)?;

        let mut init_header = [0u8; 24];
        stream.read_exact(&mut init_header).await.map_err(RfbError::Io)?;
        let width = u16::from_be_bytes([init_header[0], init_header[1]]);
        let height = u16::from_be_bytes([init_header[2], init_header[3]]);
        let mut pf_buf = BytesMut::from(&init_header[4..20]);
        let server_format = PixelFormat::read_from(&mut pf_buf)?;
        let name_len = u32::from_be_bytes([init_header[20], init_header[21], init_header[22], init_header[23]]) as usize;
        let mut name_bytes = vec![0u8; name_len];
        stream.read_exact(&mut name_bytes).await.map_err(RfbError::Io)?;
        let name = String::from_utf8_lossy(&name_bytes).into_owned();

        let format = requested_format.unwrap_or(server_format);
        let framebuffer = handler.allocate_framebuffer(width, height, &format);

        Ok(Self {
            io: WireIo::new(stream),
            phase: Phase::Normal,
            minor,
            format,
            width,
            height,
            name,
            framebuffer,
            decoders: DecoderSet::new(),
        })
    }

    async fn negotiate_security(
        mut stream: Box<dyn DynStream>,
        minor: ProtoMinor,
        security: &ClientSecurity,
    ) -> Result<Box<dyn DynStream>> {
        let chosen = if minor == ProtoMinor::V3 {
            let mut type_bytes = [0u8; 4];
            stream.read_exact(&mut type_bytes).await.map_err(RfbError::Io)?;
            u32::from_be_bytes(type_bytes) as u8
        } else {
            let mut count = [0u8; 1];
            stream.read_exact(&mut count).await.map_err(RfbError::Io)?;
            if count[0] == 0 {
                let mut reason_len = [0u8; 4];
                stream.read_exact(&mut reason_len).await.map_err(RfbError::Io)?;
                let mut reason = vec![0u8; u32::from_be_bytes(reason_len) as usize];
                stream.read_exact(&mut reason).await.map_err(RfbError::Io)?;
                return Err(RfbError::Protocol(format!(
                    "server refused connection: {}",
                    String::from_utf8_lossy(&reason)
                )));
            }
            let mut types = vec![0u8; usize::from(count[0])];
            stream.read_exact(&mut types).await.map_err(RfbError::Io)?;

            let preferred = if security.allow_vencrypt && types.contains(&SECURITY_TYPE_VENCRYPT) {
                SECURITY_TYPE_VENCRYPT
            } else if security.password.is_some() && types.contains(&SECURITY_TYPE_VNC_AUTH) {
                SECURITY_TYPE_VNC_AUTH
            } else if types.contains(&SECURITY_TYPE_NONE) {
                SECURITY_TYPE_NONE
            } else {
                return Err(RfbError::Unsupported("no mutually acceptable security type".into()));
            };
            stream.write_all(&[preferred]).await.map_err(RfbError::Io)?;
            preferred
        };

        let mut stream = if chosen == SECURITY_TYPE_VENCRYPT {
            let sub = timeout(TLS_HANDSHAKE_TIMEOUT, crate::vencrypt::negotiate_client(&mut stream))
                .await
                .map_err(|_| RfbError::Timeout(TLS_HANDSHAKE_TIMEOUT))??;
            let tls_config = crate::vencrypt::build_client_config(&security.credentials)?;
            let tls_stream = timeout(
                TLS_HANDSHAKE_TIMEOUT,
                crate::vencrypt::connect_tls(stream, tls_config, "localhost"),
            )
            .await
            .map_err(|_| RfbError::Timeout(TLS_HANDSHAKE_TIMEOUT))??;
            let boxed: Box<dyn DynStream> = Box::new(tls_stream);

            if matches!(sub, VenCryptSubType::TlsX509Vnc) {
                Self::perform_vnc_auth(boxed, security, minor).await?
            } else {
                boxed
            }
        } else if chosen == SECURITY_TYPE_VNC_AUTH {
            Self::perform_vnc_auth(stream, security, minor).await?
        } else {
            stream
        };

        if chosen != SECURITY_TYPE_VNC_AUTH && minor == ProtoMinor::V8 {
            let mut result = [0u8; 4];
            stream.read_exact(&mut result).await.map_err(RfbError::Io)?;
            if u32::from_be_bytes(result) != SECURITY_RESULT_OK {
                return Err(RfbError::Auth("server reported SecurityResult failure".into()));
            }
        }

        Ok(stream)
    }

    async fn perform_vnc_auth(
        mut stream: Box<dyn DynStream>,
        security: &ClientSecurity,
        minor: ProtoMinor,
    ) -> Result<Box<dyn DynStream>> {
        let password = security
            .password
            .as_deref()
            .ok_or_else(|| RfbError::Auth("server requires a VNC-auth password".into()))?;

        let mut challenge = [0u8; auth::CHALLENGE_LEN];
        stream.read_exact(&mut challenge).await.map_err(RfbError::Io)?;
        let response = auth::encrypt_challenge(password.as_bytes(), &challenge);
        stream.write_all(&response).await.map_err(RfbError::Io)?;

        let mut result = [0u8; 4];
        stream.read_exact(&mut result).await.map_err(RfbError::Io)?;
        if u32::from_be_bytes(result) != SECURITY_RESULT_OK {
            if minor == ProtoMinor::V8 {
                let mut reason_len = [0u8; 4];
                stream.read_exact(&mut reason_len).await.map_err(RfbError::Io)?;
                let mut reason = vec![0u8; u32::from_be_bytes(reason_len) as usize];
                stream.read_exact(&mut reason).await.map_err(RfbError::Io)?;
                return Err(RfbError::Auth(String::from_utf8_lossy(&reason).into_owned()));
            }
            return Err(RfbError::Auth("VNC authentication failed".into()));
        }
        Ok(stream)
    }

    #[must_use]
    pub fn geometry(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn format(&self) -> &PixelFormat {
        &self.format
    }

    pub async fn send_set_pixel_format(&mut self, format: PixelFormat) -> Result<()> {
        let mut buf = BytesMut::new();
        buf.put_u8(CLIENT_MSG_SET_PIXEL_FORMAT);
        buf.put_bytes(0, 3);
        format.write_to(&mut buf);
        self.io.write_exact(&buf).await?;
        self.format = format;
        Ok(())
    }

    pub async fn send_set_encodings(&mut self, encodings: &[i32]) -> Result<()> {
        let mut buf = BytesMut::new();
        buf.put_u8(CLIENT_MSG_SET_ENCODINGS);
        buf.put_u8(0);
        buf.put_u16(encodings.len() as u16);
        for e in encodings {
            buf.put_i32(*e);
        }
        self.io.write_exact(&buf).await?;
        Ok(())
    }

    pub async fn request_update(&mut self, incremental: bool, rect: Rect) -> Result<()> {
        let mut buf = BytesMut::new();
        buf.put_u8(CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST);
        buf.put_u8(u8::from(incremental));
        buf.put_u16(rect.x1 as u16);
        buf.put_u16(rect.y1 as u16);
        buf.put_u16(rect.width() as u16);
        buf.put_u16(rect.height() as u16);
        self.io.write_exact(&buf).await?;
        Ok(())
    }

    pub async fn send_key_event(&mut self, keysym: u32, pressed: bool) -> Result<()> {
        let mut buf = BytesMut::new();
        buf.put_u8(CLIENT_MSG_KEY_EVENT);
        buf.put_u8(u8::from(pressed));
        buf.put_bytes(0, 2);
        buf.put_u32(keysym);
        self.io.write_exact(&buf).await?;
        Ok(())
    }

    pub async fn send_pointer_event(&mut self, x: u16, y: u16, button_mask: u8) -> Result<()> {
        let mut buf = BytesMut::new();
        buf.put_u8(CLIENT_MSG_POINTER_EVENT);
        buf.put_u8(button_mask);
        buf.put_u16(x);
        buf.put_u16(y);
        self.io.write_exact(&buf).await?;
        Ok(())
    }

    pub async fn send_cut_text(&mut self, text: &str) -> Result<()> {
        let mut buf = BytesMut::new();
        buf.put_u8(CLIENT_MSG_CLIENT_CUT_TEXT);
        buf.put_bytes(0, 3);
        buf.put_u32(text.len() as u32);
        buf.extend_from_slice(text.as_bytes());
        self.io.write_exact(&buf).await?;
        Ok(())
    }

    /// Reads and applies exactly one server-to-client message,
    /// delivering decoded pixels/clipboard/cursor updates to `handler`.
    pub async fn step(&mut self, handler: &mut dyn Handler) -> Result<()> {
        let type_byte = self.io.read_exact(1).await?;
        match type_byte[0] {
            SERVER_MSG_FRAMEBUFFER_UPDATE => self.read_framebuffer_update(handler).await,
            SERVER_MSG_SET_COLOUR_MAP_ENTRIES => self.read_set_colour_map_entries().await,
            SERVER_MSG_BELL => Ok(()),
            SERVER_MSG_SERVER_CUT_TEXT => self.read_server_cut_text(handler).await,
            SERVER_MSG_END_OF_CONTINUOUS_UPDATES => Ok(()),
            SERVER_MSG_FENCE => self.read_fence().await,
            _ => Ok(()),
        }
    }

    async fn read_set_colour_map_entries(&mut self) -> Result<()> {
        let header = self.io.read_exact(5).await?;
        let count = u16::from_be_bytes([header[3], header[4]]);
        let _ = self.io.read_exact(usize::from(count) * 6).await?;
        Ok(())
    }

    async fn read_server_cut_text(&mut self, handler: &mut dyn Handler) -> Result<()> {
        let header = self.io.read_exact(7).await?;
        let len = u32::from_be_bytes([header[3], header[4], header[5], header[6]]) as usize;
        let text = self.io.read_exact(len).await?;
        handler.on_clipboard(&String::from_utf8_lossy(&text));
        Ok(())
    }

    async fn read_fence(&mut self) -> Result<()> {
        let header = self.io.read_exact(7).await?;
        let flags = u32::from_be_bytes([header[3], header[4], header[5], header[6]]);
        let len_byte = self.io.read_exact(1).await?;
        let payload = self.io.read_exact(usize::from(len_byte[0])).await?;
        if flags & FENCE_FLAG_REQUEST != 0 {
            let mut buf = BytesMut::new();
            let reply = Fence { flags: flags & !FENCE_FLAG_REQUEST, payload };
            super::write_fence(&mut buf, &reply);
            self.io.write_exact(&buf).await?;
        }
        Ok(())
    }

    async fn read_framebuffer_update(&mut self, handler: &mut dyn Handler) -> Result<()> {
        let header = self.io.read_exact(3).await?;
        let declared_count = u16::from_be_bytes([header[1], header[2]]);
        let use_last_rect = declared_count == RECT_COUNT_UNKNOWN;

        let mut remaining = if use_last_rect { u32::MAX } else { u32::from(declared_count) };
        while remaining > 0 {
            let header_bytes = self.io.read_exact(12).await?;
            let mut buf = BytesMut::from(&header_bytes[..]);
            let rect = RectHeader::read_from(&mut buf)?;

            if rect.encoding == PSEUDO_ENCODING_LAST_RECT {
                break;
            }
            self.apply_rectangle(rect, handler).await?;
            remaining = remaining.saturating_sub(1);
        }
        Ok(())
    }

    async fn apply_rectangle(&mut self, rect: RectHeader, handler: &mut dyn Handler) -> Result<()> {
        match rect.encoding {
            PSEUDO_ENCODING_CURSOR => {
                let bpp = self.format.bytes_per_pixel();
                let pixel_len = usize::from(rect.width) * usize::from(rect.height) * bpp;
                let mask_len = (usize::from(rect.width) + 7) / 8 * usize::from(rect.height);
                let pixels = self.io.read_exact(pixel_len).await?;
                let mask = self.io.read_exact(mask_len).await?;
                let rgba = crate::pixel::translate_pixels(&pixels, &self.format, &PixelFormat::rgba32());
                handler.on_cursor(rect.x, rect.y, rect.width, rect.height, &rgba);
                let _ = mask;
                Ok(())
            }
            PSEUDO_ENCODING_CURSOR_POS => Ok(()),
            PSEUDO_ENCODING_DESKTOP_SIZE => {
                self.width = rect.width;
                self.height = rect.height;
                self.framebuffer = handler.allocate_framebuffer(self.width, self.height, &self.format);
                Ok(())
            }
            ENCODING_COPYRECT => {
                let payload = self.io.read_exact(4).await?;
                let src = CopySource::from_decoded(&CopyRectDecoder.decode(
                    &mut BytesMut::from(&payload[..]),
                    &self.format,
                    rect.width,
                    rect.height,
                )?)
                .ok_or_else(|| RfbError::Protocol("truncated CopyRect payload".into()))?;
                self.copy_within_framebuffer(src, rect);
                let dest = Rect::new(i32::from(rect.x), i32::from(rect.y), i32::from(rect.width), i32::from(rect.height));
                let pixels = self.read_rect_from_framebuffer(dest);
                handler.on_update(dest, &pixels, &self.format);
                Ok(())
            }
            encoding => {
                let pixels = self.decode_rect(encoding, rect.width, rect.height).await?;
                let dest = Rect::new(i32::from(rect.x), i32::from(rect.y), i32::from(rect.width), i32::from(rect.height));
                self.write_rect_into_framebuffer(dest, &pixels);
                handler.on_update(dest, &pixels, &self.format);
                Ok(())
            }
        }
    }

    /// Reads one encoded rectangle's payload off the wire and decodes
    /// it. Raw's length is derivable from the rectangle geometry;
    /// every other encoding either carries its own length prefix
    /// (Zlib/ZlibHex/ZRLE) or a self-terminating tile stream
    /// (Hextile/Tight) that only the decoder itself can parse — so for
    /// those this peeks a growing prefix of the stream and retries the
    /// decode until it succeeds, then consumes exactly the bytes the
    /// decoder used.
    async fn decode_rect(&mut self, encoding: i32, width: u16, height: u16) -> Result<Vec<u8>> {
        let bpp = self.format.bytes_per_pixel();
        if encoding == ENCODING_RAW {
            let len = usize::from(width) * usize::from(height) * bpp;
            let payload = self.io.read_exact(len).await?;
            let mut buf = BytesMut::from(&payload[..]);
            return self.decoders.decode(encoding, &mut buf, &self.format, width, height);
        }

        let ceiling = usize::from(width) * usize::from(height) * bpp.max(1) + 4096;
        let mut probe = 256usize.min(ceiling).max(4);
        loop {
            let peeked = self.io.peek_exact(probe).await?;
            let before = peeked.len();
            let mut trial = BytesMut::from(&peeked[..]);
            let format = self.format.clone();
            match self.decoders.decode(encoding, &mut trial, &format, width, height) {
                Ok(pixels) => {
                    let consumed = before - trial.len();
                    self.io.read_exact(consumed).await?;
                    return Ok(pixels);
                }
                Err(_) if probe < ceiling => {
                    probe = (probe * 2).min(ceiling);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn read_rect_from_framebuffer(&self, rect: Rect) -> Vec<u8> {
        let bpp = self.format.bytes_per_pixel();
        let stride = usize::from(self.width) * bpp;
        let mut out = Vec::with_capacity(rect.width() as usize * rect.height() as usize * bpp);
        for y in rect.y1..rect.y2 {
            let row_start = y as usize * stride + rect.x1 as usize * bpp;
            let row_end = row_start + rect.width() as usize * bpp;
            out.extend_from_slice(&self.framebuffer[row_start..row_end]);
        }
        out
    }

    fn write_rect_into_framebuffer(&mut self, rect: Rect, pixels: &[u8]) {
        let bpp = self.format.bytes_per_pixel();
        let stride = usize::from(self.width) * bpp;
        let row_bytes = rect.width() as usize * bpp;
        for (row, y) in (rect.y1..rect.y2).enumerate() {
            let row_start = y as usize * stride + rect.x1 as usize * bpp;
            let src = &pixels[row * row_bytes..(row + 1) * row_bytes];
            self.framebuffer[row_start..row_start + row_bytes].copy_from_slice(src);
        }
    }

    fn copy_within_framebuffer(&mut self, src: CopySource, dest: RectHeader) {
        let bpp = self.format.bytes_per_pixel();
        let src_rect = Rect::new(i32::from(src.src_x), i32::from(src.src_y), i32::from(dest.width), i32::from(dest.height));
        let copied = self.read_rect_from_framebuffer(src_rect);
        let dest_rect = Rect::new(i32::from(dest.x), i32::from(dest.y), i32::from(dest.width), i32::from(dest.height));
        let _ = bpp;
        self.write_rect_into_framebuffer(dest_rect, &copied);
    }

    pub fn close(&mut self) {
        self.phase = Phase::Closed;
    }
}
