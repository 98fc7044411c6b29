//! `VncClient`: the consumer-facing client API (spec §9).
//!
//! Grounded on the teacher's `VncClient` (`client.rs`, now removed):
//! same idea of one struct owning a connection and exposing
//! `send_*`/`run`-style methods, but the teacher only ever dialed a raw
//! `TcpStream`. This wrapper adds one `connect_*` constructor per
//! transport in [`crate::transport`] ahead of the identical
//! [`crate::session::client::ClientSession`] handshake, so the RFB
//! state machine itself stays transport-agnostic.

use std::net::SocketAddr;

use crate::error::Result;
use crate::extensions::Handler;
use crate::pixel::PixelFormat;
use crate::region::Rect;
use crate::session::client::{ClientSecurity, ClientSession};
use crate::transport;

#[cfg(feature = "tls")]
use crate::vencrypt::X509Credentials;

/// One connection to a VNC server, in any of [`crate::transport`]'s
/// carriers.
pub struct VncClient {
    session: ClientSession,
}

impl VncClient {
    /// Connects over plain TCP and completes the RFB handshake.
    pub async fn connect_tcp(
        addr: SocketAddr,
        security: ClientSecurity,
        requested_format: Option<PixelFormat>,
        handler: &mut dyn Handler,
    ) -> Result<Self> {
        let stream = transport::tcp::connect(addr).await?;
        Self::from_stream(transport::boxed(stream), security, requested_format, handler).await
    }

    /// Connects over a UNIX domain socket and completes the RFB
    /// handshake.
    pub async fn connect_unix(
        path: impl AsRef<std::path::Path>,
        security: ClientSecurity,
        requested_format: Option<PixelFormat>,
        handler: &mut dyn Handler,
    ) -> Result<Self> {
        let stream = transport::unix::connect(path).await?;
        Self::from_stream(transport::boxed(stream), security, requested_format, handler).await
    }

    /// Connects with TLS established before the RFB version handshake
    /// (`vnc+tls://`-style, as opposed to in-band VeNCrypt).
    #[cfg(feature = "tls")]
    pub async fn connect_tls(
        addr: SocketAddr,
        credentials: &X509Credentials,
        server_name: &str,
        security: ClientSecurity,
        requested_format: Option<PixelFormat>,
        handler: &mut dyn Handler,
    ) -> Result<Self> {
        let stream = transport::tcp::connect(addr).await?;
        let tls_stream = transport::tls::connect(stream, credentials, server_name).await?;
        Self::from_stream(transport::boxed(tls_stream), security, requested_format, handler).await
    }

    /// Connects through a WebSocket carrier (the noVNC/websockify
    /// style), then completes the RFB handshake over the resulting byte
    /// stream.
    #[cfg(feature = "websocket")]
    pub async fn connect_websocket(
        url: &str,
        security: ClientSecurity,
        requested_format: Option<PixelFormat>,
        handler: &mut dyn Handler,
    ) -> Result<Self> {
        let stream = transport::websocket::connect_client(url).await?;
        Self::from_stream(transport::boxed(stream), security, requested_format, handler).await
    }

    /// Connects through an SSH `direct-tcpip` tunnel to `target_host`/
    /// `target_port` as seen from the SSH server, then completes the
    /// RFB handshake over the tunneled stream.
    #[cfg(feature = "ssh-tunnel")]
    #[allow(clippy::too_many_arguments)]
    pub async fn connect_via_ssh_tunnel(
        ssh_host: &str,
        ssh_port: u16,
        ssh_username: &str,
        ssh_auth: transport::ssh::AuthMethod,
        target_host: &str,
        target_port: u16,
        security: ClientSecurity,
        requested_format: Option<PixelFormat>,
        handler: &mut dyn Handler,
    ) -> Result<Self> {
        let stream =
            transport::ssh::connect_tunnel(ssh_host, ssh_port, ssh_username, ssh_auth, target_host, target_port).await?;
        Self::from_stream(transport::boxed(stream), security, requested_format, handler).await
    }

    async fn from_stream(
        stream: transport::BoxedStream,
        security: ClientSecurity,
        requested_format: Option<PixelFormat>,
        handler: &mut dyn Handler,
    ) -> Result<Self> {
        let session = ClientSession::handshake(stream, security, requested_format, handler).await?;
        Ok(Self { session })
    }

    /// Negotiated framebuffer size.
    #[must_use]
    pub fn geometry(&self) -> (u16, u16) {
        self.session.geometry()
    }

    /// Server-advertised desktop name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.session.name()
    }

    /// Pixel format currently in effect.
    #[must_use]
    pub fn format(&self) -> &PixelFormat {
        self.session.format()
    }

    /// Sends `SetPixelFormat`.
    pub async fn set_pixel_format(&mut self, format: PixelFormat) -> Result<()> {
        self.session.send_set_pixel_format(format).await
    }

    /// Sends `SetEncodings`.
    pub async fn set_encodings(&mut self, encodings: &[i32]) -> Result<()> {
        self.session.send_set_encodings(encodings).await
    }

    /// Sends `FramebufferUpdateRequest`.
    pub async fn request_update(&mut self, incremental: bool, rect: Rect) -> Result<()> {
        self.session.request_update(incremental, rect).await
    }

    /// Sends `KeyEvent`.
    pub async fn send_key_event(&mut self, keysym: u32, pressed: bool) -> Result<()> {
        self.session.send_key_event(keysym, pressed).await
    }

    /// Sends `PointerEvent`.
    pub async fn send_pointer_event(&mut self, x: u16, y: u16, button_mask: u8) -> Result<()> {
        self.session.send_pointer_event(x, y, button_mask).await
    }

    /// Sends `ClientCutText`.
    pub async fn send_cut_text(&mut self, text: &str) -> Result<()> {
        self.session.send_cut_text(text).await
    }

    /// Reads and applies exactly one server message.
    pub async fn step(&mut self, handler: &mut dyn Handler) -> Result<()> {
        self.session.step(handler).await
    }

    /// Drives the steady-state loop until the connection errors or the
    /// server closes it.
    pub async fn run(&mut self, handler: &mut dyn Handler) -> Result<()> {
        loop {
            self.step(handler).await?;
        }
    }

    /// Marks the session closed; in-flight reads/writes still
    /// in-progress are not interrupted, matching
    /// [`crate::session::server::ServerSession::close`].
    pub fn close(&mut self) {
        self.session.close();
    }
}
