//! Direct-TLS transport (spec §6.2): wraps a stream in TLS *before*
//! the RFB version handshake, for peers that expect `vnc+tls://`-style
//! connections rather than negotiating VeNCrypt on the plaintext
//! channel. Shares certificate loading with [`crate::vencrypt`]'s
//! VeNCrypt sub-negotiation rather than duplicating it.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::{ClientConfig, ServerConfig};

use crate::error::Result;
use crate::vencrypt::X509Credentials;

/// Builds a server TLS acceptor config from `credentials` and accepts
/// one connection.
pub async fn accept<S>(stream: S, credentials: &X509Credentials) -> Result<tokio_rustls::server::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = crate::vencrypt::build_server_config(credentials)?;
    crate::vencrypt::accept_tls(stream, config).await
}

/// Builds a client TLS connector config from `credentials` and
/// connects, verifying the peer certificate against `server_name`.
pub async fn connect<S>(
    stream: S,
    credentials: &X509Credentials,
    server_name: &str,
) -> Result<tokio_rustls::client::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = crate::vencrypt::build_client_config(credentials)?;
    crate::vencrypt::connect_tls(stream, config, server_name).await
}

/// Reuses an already-built server config for repeated accepts, saving
/// the certificate file reads [`accept`] does on every call.
pub async fn accept_with_config<S>(stream: S, config: Arc<ServerConfig>) -> Result<tokio_rustls::server::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    crate::vencrypt::accept_tls(stream, config).await
}

/// Reuses an already-built client config for repeated connects.
pub async fn connect_with_config<S>(
    stream: S,
    config: Arc<ClientConfig>,
    server_name: &str,
) -> Result<tokio_rustls::client::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    crate::vencrypt::connect_tls(stream, config, server_name).await
}
