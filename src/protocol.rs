//! RFB wire protocol constants and handshake/message structures.
//!
//! Carries forward the teacher's `protocol.rs` constant tables
//! (message types, encoding ids) generalized with the security-type,
//! VeNCrypt, fence and continuous-updates messages spec §4.D/§4.F/§6
//! require that the teacher never implemented.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{RfbError, Result};
use crate::pixel::PixelFormat;

/// Protocol version strings this implementation will negotiate.
pub const VERSION_3_3: &str = "RFB 003.003\n";
pub const VERSION_3_7: &str = "RFB 003.007\n";
pub const VERSION_3_8: &str = "RFB 003.008\n";

/// Negotiated protocol minor version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoMinor {
    V3 = 3,
    V7 = 7,
    V8 = 8,
}

impl ProtoMinor {
    /// Parses the 12-byte version line, e.g. `b"RFB 003.008\n"`.
    pub fn parse(line: &[u8; 12]) -> Result<Self> {
        if &line[0..4] != b"RFB " || line[7] != b'.' || line[11] != b'\n' {
            return Err(RfbError::Protocol("malformed version string".into()));
        }
        match &line[8..11] {
            b"003" => Ok(ProtoMinor::V3),
            b"007" => Ok(ProtoMinor::V7),
            b"008" => Ok(ProtoMinor::V8),
            other => Err(RfbError::Protocol(format!(
                "unsupported minor version {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    #[must_use]
    pub fn wire_str(self) -> &'static str {
        match self {
            ProtoMinor::V3 => VERSION_3_3,
            ProtoMinor::V7 => VERSION_3_7,
            ProtoMinor::V8 => VERSION_3_8,
        }
    }
}

// ---- Client-to-server message types ----
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;
pub const CLIENT_MSG_ENABLE_CONTINUOUS_UPDATES: u8 = 150;
pub const CLIENT_MSG_FENCE: u8 = 248;

// ---- Server-to-client message types ----
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;
pub const SERVER_MSG_SET_COLOUR_MAP_ENTRIES: u8 = 1;
pub const SERVER_MSG_BELL: u8 = 2;
pub const SERVER_MSG_SERVER_CUT_TEXT: u8 = 3;
pub const SERVER_MSG_END_OF_CONTINUOUS_UPDATES: u8 = 150;
pub const SERVER_MSG_FENCE: u8 = 248;

// ---- Encoding ids ----
pub const ENCODING_RAW: i32 = 0;
pub const ENCODING_COPYRECT: i32 = 1;
pub const ENCODING_RRE: i32 = 2;
pub const ENCODING_CORRE: i32 = 4;
pub const ENCODING_HEXTILE: i32 = 5;
pub const ENCODING_ZLIB: i32 = 6;
pub const ENCODING_TIGHT: i32 = 7;
pub const ENCODING_ZLIBHEX: i32 = 8;
pub const ENCODING_ZRLE: i32 = 16;
pub const ENCODING_H264: i32 = 50;

// ---- Pseudo-encodings ----
pub const PSEUDO_ENCODING_CURSOR: i32 = -239;
pub const PSEUDO_ENCODING_CURSOR_POS: i32 = -232;
pub const PSEUDO_ENCODING_DESKTOP_SIZE: i32 = -223;
pub const PSEUDO_ENCODING_LAST_RECT: i32 = -224;
pub const PSEUDO_ENCODING_CONTINUOUS_UPDATES: i32 = -313;
pub const PSEUDO_ENCODING_FENCE: i32 = -312;
pub const PSEUDO_ENCODING_QUALITY_LEVEL_0: i32 = -32;
pub const PSEUDO_ENCODING_QUALITY_LEVEL_9: i32 = -23;
pub const PSEUDO_ENCODING_COMPRESS_LEVEL_0: i32 = -256;
pub const PSEUDO_ENCODING_COMPRESS_LEVEL_9: i32 = -247;

/// Sentinel rectangle count written in place of the true count when the
/// total is not known ahead of time; terminated by a LastRect
/// pseudo-rectangle (spec §4.E step 6).
pub const RECT_COUNT_UNKNOWN: u16 = 0xFFFF;

// ---- Hextile subencoding flags ----
pub const HEXTILE_RAW: u8 = 1 << 0;
pub const HEXTILE_BACKGROUND_SPECIFIED: u8 = 1 << 1;
pub const HEXTILE_FOREGROUND_SPECIFIED: u8 = 1 << 2;
pub const HEXTILE_ANY_SUBRECTS: u8 = 1 << 3;
pub const HEXTILE_SUBRECTS_COLOURED: u8 = 1 << 4;

// ---- Tight subencoding ----
pub const TIGHT_EXPLICIT_FILTER: u8 = 0x04;
pub const TIGHT_FILTER_COPY: u8 = 0;
pub const TIGHT_FILTER_PALETTE: u8 = 1;
pub const TIGHT_FILTER_GRADIENT: u8 = 2;
pub const TIGHT_JPEG: u8 = 0x09 << 4;

// ---- H.264 rectangle flags (spec §6) ----
pub const H264_FLAG_RESET_CONTEXT: u32 = 1;
pub const H264_FLAG_RESET_ALL_CONTEXTS: u32 = 2;

// ---- Channel/VeNCrypt security types ----
pub const SECURITY_TYPE_INVALID: u8 = 0;
pub const SECURITY_TYPE_NONE: u8 = 1;
pub const SECURITY_TYPE_VNC_AUTH: u8 = 2;
pub const SECURITY_TYPE_VENCRYPT: u8 = 19;

pub const VENCRYPT_MAJOR: u8 = 0;
pub const VENCRYPT_MINOR: u8 = 2;

/// VeNCrypt sub-types (spec §6: "Anonymous-DH and X.509 sub-types").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VenCryptSubType {
    Plain = 256,
    TlsNone = 257,
    TlsVnc = 258,
    TlsX509None = 259,
    TlsX509Vnc = 260,
    X509Plain = 261,
}

impl VenCryptSubType {
    #[must_use]
    pub fn wire_id(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn is_anonymous_dh(self) -> bool {
        matches!(self, VenCryptSubType::TlsNone | VenCryptSubType::TlsVnc)
    }
}

pub const SECURITY_RESULT_OK: u32 = 0;
pub const SECURITY_RESULT_FAILED: u32 = 1;

/// `ServerInit` message (spec §4.D).
#[derive(Debug, Clone)]
pub struct ServerInit {
    pub framebuffer_width: u16,
    pub framebuffer_height: u16,
    pub pixel_format: PixelFormat,
    pub name: String,
}

impl ServerInit {
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.framebuffer_width);
        buf.put_u16(self.framebuffer_height);
        self.pixel_format.write_to(buf);
        let name = self.name.as_bytes();
        buf.put_u32(name.len() as u32);
        buf.put_slice(name);
    }
}

/// Rectangle header written before every rectangle's payload.
#[derive(Debug, Clone, Copy)]
pub struct RectHeader {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub encoding: i32,
}

impl RectHeader {
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_i32(self.encoding);
    }

    pub fn read_from(buf: &mut BytesMut) -> Result<Self> {
        if buf.len() < 12 {
            return Err(RfbError::Protocol("truncated rectangle header".into()));
        }
        Ok(Self {
            x: buf.get_u16(),
            y: buf.get_u16(),
            width: buf.get_u16(),
            height: buf.get_u16(),
            encoding: buf.get_i32(),
        })
    }
}

/// Fence message flags (spec GLOSSARY "Fence").
pub const FENCE_FLAG_BLOCK_BEFORE: u32 = 1 << 0;
pub const FENCE_FLAG_BLOCK_AFTER: u32 = 1 << 1;
pub const FENCE_FLAG_REQUEST: u32 = 1 << 31;

/// A parsed Fence message payload.
#[derive(Debug, Clone)]
pub struct Fence {
    pub flags: u32,
    pub payload: Vec<u8>,
}

impl Fence {
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(SERVER_MSG_FENCE);
        buf.put_bytes(0, 3);
        buf.put_u32(self.flags);
        buf.put_u8(self.payload.len() as u8);
        buf.put_slice(&self.payload);
    }
}
