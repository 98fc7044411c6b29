//! UNIX domain socket transport (spec §6.2): no teacher counterpart,
//! the local-socket analogue of [`super::tcp`] for same-host
//! connections that don't need TCP's framing overhead.

use std::path::Path;

use tokio::net::{UnixListener, UnixStream};

use crate::error::{RfbError, Result};

/// Binds a listener at `path`, removing a stale socket file left
/// behind by a previous run first.
pub fn listen(path: impl AsRef<Path>) -> Result<UnixListener> {
    let path = path.as_ref();
    if path.exists() {
        std::fs::remove_file(path).map_err(RfbError::Io)?;
    }
    UnixListener::bind(path).map_err(RfbError::Io)
}

/// Accepts one connection.
pub async fn accept(listener: &UnixListener) -> Result<UnixStream> {
    let (stream, _addr) = listener.accept().await.map_err(RfbError::Io)?;
    Ok(stream)
}

/// Connects to a listening UNIX socket at `path`.
pub async fn connect(path: impl AsRef<Path>) -> Result<UnixStream> {
    UnixStream::connect(path).await.map_err(RfbError::Io)
}
