//! Session state machine (component D): the version/security/init
//! handshake and the post-init message loop, shared plumbing used by
//! both [`server`] and [`client`].
//!
//! The teacher's handshake lives inline in `VncClient::new` as a linear
//! sequence of reads/writes with no explicit state; this module
//! generalizes it into the `Phase` enum spec §3 names, since a
//! VeNCrypt-capable peer genuinely branches (`ChannelSecurity` is
//! skipped for minor 3/plain-None connections) in a way the teacher's
//! straight-line code never had to express.

pub mod client;
pub mod server;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{RfbError, Result};
use crate::protocol::*;

/// Protocol phase (spec §3 `ClientState.phase`); transitions are
/// monotone until `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Version,
    ChannelSecurity,
    Security,
    Auth,
    Init,
    Normal,
    Closed,
}

/// Time between a mark arriving and the update pipeline being allowed
/// to flush, when nothing else forces an earlier send (spec §4.E
/// "deferUpdateTime").
pub const DEFAULT_DEFER_UPDATE_TIME: std::time::Duration = std::time::Duration::from_millis(0);

/// A parsed client-to-server message, post handshake.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    SetPixelFormat(crate::pixel::PixelFormat),
    SetEncodings(Vec<i32>),
    FramebufferUpdateRequest { incremental: bool, rect: crate::region::Rect },
    KeyEvent { pressed: bool, keysym: u32 },
    PointerEvent { button_mask: u8, x: u16, y: u16 },
    ClientCutText(String),
    EnableContinuousUpdates { enable: bool, rect: crate::region::Rect },
    Fence(Fence),
    /// A message type this session doesn't recognize; the byte is kept
    /// so an extension (`ExtensionRegistry`) gets a chance to claim it.
    Unknown(u8),
}

/// Reads and parses one client-to-server message (everything after the
/// type byte, which the caller has already consumed via `peek_exact(1)`
/// and passes in as `message_type`).
pub async fn read_client_message<S>(
    io: &mut crate::io::WireIo<S>,
    message_type: u8,
) -> Result<ClientMessage>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match message_type {
        CLIENT_MSG_SET_PIXEL_FORMAT => {
            let body = io.read_exact(19).await?;
            let mut buf = BytesMut::from(&body[3..]);
            Ok(ClientMessage::SetPixelFormat(crate::pixel::PixelFormat::read_from(&mut buf)?))
        }
        CLIENT_MSG_SET_ENCODINGS => {
            let header = io.read_exact(3).await?;
            let count = u16::from_be_bytes([header[1], header[2]]);
            let body = io.read_exact(usize::from(count) * 4).await?;
            let mut buf = BytesMut::from(&body[..]);
            let mut encodings = Vec::with_capacity(usize::from(count));
            while buf.remaining() >= 4 {
                encodings.push(buf.get_i32());
            }
            Ok(ClientMessage::SetEncodings(encodings))
        }
        CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => {
            let body = io.read_exact(9).await?;
            let mut buf = BytesMut::from(&body[..]);
            let incremental = buf.get_u8() != 0;
            let x = buf.get_u16();
            let y = buf.get_u16();
            let w = buf.get_u16();
            let h = buf.get_u16();
            Ok(ClientMessage::FramebufferUpdateRequest {
                incremental,
                rect: crate::region::Rect::new(i32::from(x), i32::from(y), i32::from(w), i32::from(h)),
            })
        }
        CLIENT_MSG_KEY_EVENT => {
            let body = io.read_exact(7).await?;
            let mut buf = BytesMut::from(&body[..]);
            let pressed = buf.get_u8() != 0;
            buf.advance(2);
            let keysym = buf.get_u32();
            Ok(ClientMessage::KeyEvent { pressed, keysym })
        }
        CLIENT_MSG_POINTER_EVENT => {
            let body = io.read_exact(5).await?;
            let mut buf = BytesMut::from(&body[..]);
            let button_mask = buf.get_u8();
            let x = buf.get_u16();
            let y = buf.get_u16();
            Ok(ClientMessage::PointerEvent { button_mask, x, y })
        }
        CLIENT_MSG_CLIENT_CUT_TEXT => {
            let header = io.read_exact(7).await?;
            let len = u32::from_be_bytes([header[3], header[4], header[5], header[6]]) as usize;
            let text = io.read_exact(len).await?;
            Ok(ClientMessage::ClientCutText(String::from_utf8_lossy(&text).into_owned()))
        }
        CLIENT_MSG_ENABLE_CONTINUOUS_UPDATES => {
            let body = io.read_exact(9).await?;
            let mut buf = BytesMut::from(&body[..]);
            let enable = buf.get_u8() != 0;
            let x = buf.get_u16();
            let y = buf.get_u16();
            let w = buf.get_u16();
            let h = buf.get_u16();
            Ok(ClientMessage::EnableContinuousUpdates {
                enable,
                rect: crate::region::Rect::new(i32::from(x), i32::from(y), i32::from(w), i32::from(h)),
            })
        }
        CLIENT_MSG_FENCE => {
            let header = io.read_exact(7).await?;
            let flags = u32::from_be_bytes([header[3], header[4], header[5], header[6]]);
            let len_byte = io.read_exact(1).await?;
            let payload = io.read_exact(usize::from(len_byte[0])).await?;
            Ok(ClientMessage::Fence(Fence { flags, payload }))
        }
        other => Ok(ClientMessage::Unknown(other)),
    }
}

/// Writes a `FramebufferUpdate`'s complement, the server-to-client
/// Fence echo (spec §4.F: "the peer echoes the fence back").
pub fn write_fence(buf: &mut BytesMut, fence: &Fence) {
    fence.write_to(buf);
}

/// Builds the server-to-client `EndOfContinuousUpdates` message.
pub fn write_end_of_continuous_updates(buf: &mut BytesMut) {
    buf.put_u8(SERVER_MSG_END_OF_CONTINUOUS_UPDATES);
}

/// Builds the `SetColourMapEntries` message (spec §3 "ColourMap").
pub fn write_set_colour_map_entries(buf: &mut BytesMut, first_colour: u16, entries: &[(u16, u16, u16)]) {
    buf.put_u8(SERVER_MSG_SET_COLOUR_MAP_ENTRIES);
    buf.put_u8(0);
    buf.put_u16(first_colour);
    buf.put_u16(entries.len() as u16);
    for (r, g, b) in entries {
        buf.put_u16(*r);
        buf.put_u16(*g);
        buf.put_u16(*b);
    }
}

/// Builds the server-to-client `ServerCutText` message.
pub fn write_server_cut_text(buf: &mut BytesMut, text: &str) {
    buf.put_u8(SERVER_MSG_SERVER_CUT_TEXT);
    buf.put_bytes(0, 3);
    buf.put_u32(text.len() as u32);
    buf.extend_from_slice(text.as_bytes());
}

/// Builds the server-to-client `Bell` message.
pub fn write_bell(buf: &mut BytesMut) {
    buf.put_u8(SERVER_MSG_BELL);
}

pub(crate) fn unsupported_minor(bytes: &[u8; 12]) -> RfbError {
    RfbError::Protocol(format!(
        "unsupported protocol version: {:?}",
        String::from_utf8_lossy(bytes)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn parses_framebuffer_update_request() {
        let (mut a, b) = duplex(64);
        let mut io = crate::io::WireIo::new(b);
        let mut wire = BytesMut::new();
        wire.put_u8(0);
        wire.put_u16(0);
        wire.put_u16(0);
        wire.put_u16(4);
        wire.put_u16(4);
        tokio::io::AsyncWriteExt::write_all(&mut a, &wire).await.unwrap();
        let msg = read_client_message(&mut io, CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST).await.unwrap();
        match msg {
            ClientMessage::FramebufferUpdateRequest { incremental, rect } => {
                assert!(!incremental);
                assert_eq!((rect.x1, rect.y1, rect.x2, rect.y2), (0, 0, 4, 4));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn parses_set_encodings() {
        let (mut a, b) = duplex(64);
        let mut io = crate::io::WireIo::new(b);
        let mut wire = BytesMut::new();
        wire.put_u8(0);
        wire.put_u16(2);
        wire.put_i32(ENCODING_RAW);
        wire.put_i32(ENCODING_HEXTILE);
        tokio::io::AsyncWriteExt::write_all(&mut a, &wire).await.unwrap();
        let msg = read_client_message(&mut io, CLIENT_MSG_SET_ENCODINGS).await.unwrap();
        match msg {
            ClientMessage::SetEncodings(list) => assert_eq!(list, vec![ENCODING_RAW, ENCODING_HEXTILE]),
            _ => panic!("wrong variant"),
        }
    }
}
