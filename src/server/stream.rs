// src/server/stream.rs

use crate::core::errors::PeerLinkError;
use sha2::{Digest, Sha256};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, client, rustls, server};

/// An enum to wrap different stream types (plain TCP, or TLS on either side of
/// the handshake) into a single type.
pub enum AnyStream {
    Tcp(TcpStream),
    /// A stream accepted by our TLS acceptor.
    Tls(Box<server::TlsStream<TcpStream>>),
    /// A stream we dialled with our TLS connector.
    TlsClient(Box<client::TlsStream<TcpStream>>),
}

impl AnyStream {
    /// The identity of the TLS peer, if one was established: the SHA-256
    /// fingerprint of the certificate a client presented.
    pub fn client_certificate_fingerprint(&self) -> Option<String> {
        match self {
            AnyStream::Tls(s) => s
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| hex::encode(Sha256::digest(cert.as_ref()))),
            _ => None,
        }
    }
}

/// Dials `server_name` over an established TCP stream, verifying the server
/// against the webpki root store.
pub async fn connect_tls(
    server_name: &str,
    tcp_stream: TcpStream,
) -> Result<client::TlsStream<TcpStream>, PeerLinkError> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let domain = rustls::pki_types::ServerName::try_from(server_name)
        .map_err(|_| PeerLinkError::Tls(format!("Invalid TLS server name '{server_name}'")))?
        .to_owned();

    connector
        .connect(domain, tcp_stream)
        .await
        .map_err(|e| PeerLinkError::Tls(format!("TLS handshake failed: {e}")))
}

impl AsyncRead for AnyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            AnyStream::TlsClient(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AnyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            AnyStream::TlsClient(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            AnyStream::TlsClient(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            AnyStream::TlsClient(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
