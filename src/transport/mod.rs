//! Transport adapters (spec §6.2): every listed transport eventually
//! produces a boxed [`crate::extensions::DynStream`] that the session
//! handshake negotiates RFB over, unaware of what carried the bytes.
//!
//! The teacher only ever speaks raw TCP (`TcpStream` fields throughout
//! `client.rs`); this module is new, grounded on the pack's transport
//! crates rather than on the teacher, and kept deliberately thin: each
//! adapter's job stops at "hand back something `AsyncRead + AsyncWrite`",
//! leaving the RFB-specific TLS sub-negotiation to [`crate::vencrypt`].

#[cfg(feature = "ssh-tunnel")]
pub mod ssh;
pub mod tcp;
#[cfg(feature = "tls")]
pub mod tls;
pub mod unix;
#[cfg(feature = "websocket")]
pub mod websocket;

use crate::extensions::DynStream;

/// A transport-erased, bidirectional byte stream ready for the RFB
/// handshake.
pub type BoxedStream = Box<dyn DynStream>;

/// Boxes any concrete stream into a [`BoxedStream`].
pub fn boxed<S: DynStream + 'static>(stream: S) -> BoxedStream {
    Box::new(stream)
}
