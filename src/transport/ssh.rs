//! SSH tunnel collaborator (spec §6.2: "out-of-core collaborator;
//! interface only"). Opens a `direct-tcpip` channel to the real VNC
//! endpoint over an authenticated SSH connection and bridges it to a
//! plain byte stream, the way a local port-forward would, without
//! pulling in a general-purpose tunnel manager.
//!
//! Grounded on `sortOfRemoteNG`'s `SshClientBridge`/`SshClientHandler`
//! (`ssh_bridge.rs`): `russh::client::connect` plus a minimal `Handler`
//! that accepts the server's host key, then `authenticate_password`/
//! `authenticate_publickey`. The bridging loop mirrors this module's
//! own [`super::websocket::WsStream`]: a spawned task pumps channel
//! reads/writes across a pair of byte channels so the tunnel, like a
//! WebSocket, looks like any other [`crate::extensions::DynStream`] to
//! the RFB handshake.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use russh::client::{Handle, Handler};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::error::{RfbError, Result};

/// Credential presented to the SSH server.
pub enum AuthMethod {
    Password(String),
    PublicKeyFile(String),
}

/// A tunneled connection, presented as a byte stream.
pub struct SshTunnelStream {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    leftover: Vec<u8>,
    leftover_pos: usize,
}

struct AcceptAnyHostKey;

#[async_trait::async_trait]
impl Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    /// Accepts any host key. A production deployment should verify
    /// against a known-hosts file instead.
    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Opens an SSH connection to `(ssh_host, ssh_port)`, authenticates,
/// then asks it to forward to `(target_host, target_port)` — the real
/// VNC endpoint on the far side of the tunnel.
pub async fn connect_tunnel(
    ssh_host: &str,
    ssh_port: u16,
    username: &str,
    auth: AuthMethod,
    target_host: &str,
    target_port: u16,
) -> Result<SshTunnelStream> {
    let config = Arc::new(russh::client::Config::default());
    let mut session: Handle<AcceptAnyHostKey> = russh::client::connect(config, (ssh_host, ssh_port), AcceptAnyHostKey)
        .await
        .map_err(|e| RfbError::Io(std::io::Error::other(e.to_string())))?;

    let authenticated = match auth {
        AuthMethod::Password(password) => session
            .authenticate_password(username, password)
            .await
            .map_err(|e| RfbError::Auth(e.to_string()))?,
        AuthMethod::PublicKeyFile(key_path) => {
            let key_pair = russh_keys::load_secret_key(key_path, None).map_err(|e| RfbError::Auth(e.to_string()))?;
            session
                .authenticate_publickey(username, Arc::new(key_pair))
                .await
                .map_err(|e| RfbError::Auth(e.to_string()))?
        }
    };
    if !authenticated {
        return Err(RfbError::Auth("SSH authentication rejected".into()));
    }

    let channel = session
        .channel_open_direct_tcpip(target_host, u32::from(target_port), "127.0.0.1", 0)
        .await
        .map_err(|e| RfbError::Io(std::io::Error::other(e.to_string())))?;

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        let mut channel = channel;
        let mut buf = [0u8; 8192];
        loop {
            tokio::select! {
                read = channel.read(&mut buf) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if inbound_tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
                outgoing = outbound_rx.recv() => {
                    match outgoing {
                        Some(bytes) => {
                            if channel.data(&bytes[..]).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = channel.close().await;
        // `session` is kept alive until the channel finishes, then
        // dropped here along with the SSH connection itself.
        drop(session);
    });

    Ok(SshTunnelStream { inbound: inbound_rx, outbound: outbound_tx, leftover: Vec::new(), leftover_pos: 0 })
}

impl AsyncRead for SshTunnelStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        if self.leftover_pos < self.leftover.len() {
            let remaining = &self.leftover[self.leftover_pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.leftover_pos += n;
            return Poll::Ready(Ok(()));
        }
        match self.inbound.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.leftover = data;
                    self.leftover_pos = n;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for SshTunnelStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.outbound.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "ssh tunnel closed"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
