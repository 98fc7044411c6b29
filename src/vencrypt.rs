//! VeNCrypt channel security (spec §4.D "ChannelSecurity" phase, §6
//! "Anonymous-DH and X.509 sub-types").
//!
//! The teacher never negotiates a TLS channel at all; this module has
//! no teacher counterpart and is built directly from the VeNCrypt
//! sub-negotiation described in the spec plus the `rustls`/`tokio-rustls`
//! stack already declared in `Cargo.toml` under the `tls` feature,
//! following the certificate-loading idiom in `sortOfRemoteNG`'s
//! `cert_auth.rs` (PEM parsing via `rustls-pemfile`).

use std::io::BufReader;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{RfbError, Result};
use crate::protocol::{VenCryptSubType, VENCRYPT_MAJOR, VENCRYPT_MINOR};

/// How strictly a certificate revocation list is enforced (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrlVerifyMode {
    /// Do not consult a CRL.
    None,
    /// Check only the client's own certificate.
    Client,
    /// Check the client certificate and the whole chain.
    All,
}

/// The X.509 credential bundle a [`crate::extensions::Handler`]
/// supplies via `get_credentials` (spec §6).
#[derive(Debug, Clone, Default)]
pub struct X509Credentials {
    pub ca_cert_file: Option<String>,
    pub ca_crl_file: Option<String>,
    pub client_cert_file: Option<String>,
    pub client_key_file: Option<String>,
    pub crl_verify_mode: Option<CrlVerifyMode>,
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path).map_err(RfbError::Io)?;
    let mut reader = BufReader::new(data.as_slice());
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RfbError::Unsupported(format!("invalid certificate file {path}: {e}")))
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path).map_err(RfbError::Io)?;
    let mut reader = BufReader::new(data.as_slice());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| RfbError::Unsupported(format!("invalid key file {path}: {e}")))?
        .ok_or_else(|| RfbError::Unsupported(format!("no private key found in {path}")))
}

fn root_store_from(ca_cert_file: &str) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(ca_cert_file)? {
        store
            .add(cert)
            .map_err(|e| RfbError::Unsupported(format!("bad CA certificate: {e}")))?;
    }
    Ok(store)
}

/// Builds the server-side TLS config for `TlsX509None`/`TlsX509Vnc`
/// (server certificate, optionally requiring a client certificate
/// signed by `credentials.ca_cert_file`).
pub fn build_server_config(credentials: &X509Credentials) -> Result<Arc<ServerConfig>> {
    let cert_path = credentials
        .client_cert_file
        .as_deref()
        .ok_or_else(|| RfbError::Unsupported("X509 server requires a certificate file".into()))?;
    let key_path = credentials
        .client_key_file
        .as_deref()
        .ok_or_else(|| RfbError::Unsupported("X509 server requires a private key file".into()))?;

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let builder = ServerConfig::builder();
    let config = if let Some(ca) = &credentials.ca_cert_file {
        let roots = root_store_from(ca)?;
        let verifier = tokio_rustls::rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| RfbError::Unsupported(format!("client verifier setup failed: {e}")))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let config = config
        .with_single_cert(certs, key)
        .map_err(|e| RfbError::Unsupported(format!("invalid server certificate/key: {e}")))?;
    Ok(Arc::new(config))
}

/// Builds the client-side TLS config, trusting `credentials.ca_cert_file`
/// when present and the platform root store otherwise.
pub fn build_client_config(credentials: &X509Credentials) -> Result<Arc<ClientConfig>> {
    let roots = if let Some(ca) = &credentials.ca_cert_file {
        root_store_from(ca)?
    } else {
        let mut store = RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            let _ = store.add(cert);
        }
        store
    };

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match (&credentials.client_cert_file, &credentials.client_key_file) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| RfbError::Unsupported(format!("invalid client certificate/key: {e}")))?
        }
        _ => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Server side of the VeNCrypt handshake (spec §4.D), run on the raw
/// transport *before* it is wrapped in `WireIo` so the version/sub-type
/// bytes and the TLS records that follow share one stream.
pub async fn negotiate_server<S>(
    stream: &mut S,
    offered: &[VenCryptSubType],
) -> Result<VenCryptSubType>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[VENCRYPT_MAJOR, VENCRYPT_MINOR])
        .await
        .map_err(RfbError::Io)?;

    let mut client_version = [0u8; 2];
    stream.read_exact(&mut client_version).await.map_err(RfbError::Io)?;
    if client_version[0] != VENCRYPT_MAJOR {
        stream.write_all(&[1]).await.map_err(RfbError::Io)?;
        return Err(RfbError::Protocol("unsupported VeNCrypt major version".into()));
    }
    stream.write_all(&[0]).await.map_err(RfbError::Io)?;

    stream
        .write_all(&[offered.len() as u8])
        .await
        .map_err(RfbError::Io)?;
    for sub in offered {
        stream
            .write_all(&sub.wire_id().to_be_bytes())
            .await
            .map_err(RfbError::Io)?;
    }

    let mut chosen_bytes = [0u8; 4];
    stream.read_exact(&mut chosen_bytes).await.map_err(RfbError::Io)?;
    let chosen_id = u32::from_be_bytes(chosen_bytes);
    let chosen = offered
        .iter()
        .copied()
        .find(|s| s.wire_id() == chosen_id)
        .ok_or_else(|| RfbError::Protocol("client chose an unoffered VeNCrypt sub-type".into()))?;

    if chosen.is_anonymous_dh() {
        return Err(RfbError::Unsupported(
            "anonymous-DH VeNCrypt sub-types are not supported (no anonymous cipher suite in rustls)".into(),
        ));
    }
    Ok(chosen)
}

/// Client side of the VeNCrypt handshake: reads the server's offer and
/// picks the strongest X.509 sub-type it supports.
pub async fn negotiate_client<S>(stream: &mut S) -> Result<VenCryptSubType>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut server_version = [0u8; 2];
    stream.read_exact(&mut server_version).await.map_err(RfbError::Io)?;
    stream
        .write_all(&[VENCRYPT_MAJOR, VENCRYPT_MINOR])
        .await
        .map_err(RfbError::Io)?;

    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack).await.map_err(RfbError::Io)?;
    if ack[0] != 0 {
        return Err(RfbError::Protocol("server rejected our VeNCrypt version".into()));
    }

    let mut count = [0u8; 1];
    stream.read_exact(&mut count).await.map_err(RfbError::Io)?;
    let mut offered = Vec::with_capacity(count[0] as usize);
    for _ in 0..count[0] {
        let mut id_bytes = [0u8; 4];
        stream.read_exact(&mut id_bytes).await.map_err(RfbError::Io)?;
        offered.push(u32::from_be_bytes(id_bytes));
    }

    let preference = [
        VenCryptSubType::TlsX509Vnc,
        VenCryptSubType::TlsX509None,
        VenCryptSubType::X509Plain,
    ];
    let chosen = preference
        .into_iter()
        .find(|sub| offered.contains(&sub.wire_id()))
        .ok_or_else(|| RfbError::Unsupported("server offered no supported X.509 sub-type".into()))?;

    stream
        .write_all(&chosen.wire_id().to_be_bytes())
        .await
        .map_err(RfbError::Io)?;
    Ok(chosen)
}

/// Completes the TLS handshake on the server side, wrapping `stream`.
pub async fn accept_tls<S>(
    stream: S,
    config: Arc<ServerConfig>,
) -> Result<tokio_rustls::server::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    TlsAcceptor::from(config)
        .accept(stream)
        .await
        .map_err(RfbError::Io)
}

/// Completes the TLS handshake on the client side, verifying the
/// server's certificate against `server_name`.
pub async fn connect_tls<S>(
    stream: S,
    config: Arc<ClientConfig>,
    server_name: &str,
) -> Result<tokio_rustls::client::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = tokio_rustls::rustls::pki_types::ServerName::try_from(server_name.to_string())
        .map_err(|_| RfbError::Protocol(format!("invalid TLS server name: {server_name}")))?;
    TlsConnector::from(config)
        .connect(name, stream)
        .await
        .map_err(RfbError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_dh_subtypes_are_flagged() {
        assert!(VenCryptSubType::TlsNone.is_anonymous_dh());
        assert!(VenCryptSubType::TlsVnc.is_anonymous_dh());
        assert!(!VenCryptSubType::TlsX509Vnc.is_anonymous_dh());
    }

    #[test]
    fn missing_certificate_path_is_reported_as_unsupported() {
        let credentials = X509Credentials::default();
        let err = build_server_config(&credentials).unwrap_err();
        assert!(matches!(err, RfbError::Unsupported(_)));
    }
}
