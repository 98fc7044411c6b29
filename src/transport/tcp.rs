//! TCP transport: the teacher's only transport, generalized to bind
//! dual-stack and to expose a `connect` side the teacher never needed
//! (it was server-only).

use std::net::SocketAddr;

use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{RfbError, Result};

/// Binds a listener on `addr`. IPv6 addresses are bound with
/// `IPV6_V6ONLY` cleared is left to the OS default *unset* per the
/// teacher's single-stack binding; dual-stack callers should bind
/// `[::]:port` explicitly and this still works since `socket2` only
/// adds `SO_REUSEADDR` here, matching the teacher's `TcpListener::bind`
/// semantics plus the ability to rebind quickly after a restart.
pub async fn listen(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None).map_err(RfbError::Io)?;
    socket.set_reuse_address(true).map_err(RfbError::Io)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true).map_err(RfbError::Io)?;
    }
    socket.set_nonblocking(true).map_err(RfbError::Io)?;
    socket.bind(&addr.into()).map_err(RfbError::Io)?;
    socket.listen(1024).map_err(RfbError::Io)?;
    TcpListener::from_std(socket.into()).map_err(RfbError::Io)
}

/// Accepts one connection, disabling Nagle's algorithm as the teacher
/// does in `VncClient::new` ("immediate frame delivery").
pub async fn accept(listener: &TcpListener) -> Result<(TcpStream, SocketAddr)> {
    let (stream, addr) = listener.accept().await.map_err(RfbError::Io)?;
    stream.set_nodelay(true).map_err(RfbError::Io)?;
    Ok((stream, addr))
}

/// Connects to `addr`, disabling Nagle's algorithm.
pub async fn connect(addr: SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).await.map_err(RfbError::Io)?;
    stream.set_nodelay(true).map_err(RfbError::Io)?;
    Ok(stream)
}
