//! Error types shared by every component of the RFB toolkit.

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RfbError>;

/// Errors that can surface from any RFB component.
///
/// Recovery policy (see spec §7): only [`RfbError::Io`],
/// [`RfbError::Timeout`] and [`RfbError::Auth`] are fatal to the owning
/// session. [`RfbError::Codec`] causes the offending rectangle to fall
/// back to Raw (or, for H.264 with no fallback, closes the session).
/// [`RfbError::LocalResource`] only affects the pending accept.
#[derive(Debug, Error)]
pub enum RfbError {
    /// Transport-level failure: reset, broken pipe, unexpected EOF.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// The per-call deadline elapsed before the operation completed.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Malformed message, unsupported version, bad pixel format, etc.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication challenge/response mismatch or missing credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Encoder/decoder failure for a single rectangle.
    #[error("codec error ({encoding}): {message}")]
    Codec {
        /// Name of the encoding that failed.
        encoding: &'static str,
        /// Human-readable detail.
        message: String,
    },

    /// Local resource exhaustion (e.g. fd quota reached on accept).
    #[error("local resource exhausted: {0}")]
    LocalResource(String),

    /// Feature negotiated on the wire but not implemented by this build
    /// (e.g. anonymous-DH VeNCrypt, which `rustls` cannot perform).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The connection was closed, either by the peer or by us.
    #[error("connection closed")]
    Closed,
}

impl RfbError {
    /// True for the error kinds that must close the owning session per
    /// spec §7 ("Recovery policy").
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RfbError::Io(_) | RfbError::Timeout(_) | RfbError::Auth(_) | RfbError::Closed
        )
    }
}
