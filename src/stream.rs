//! Default transport: plain TCP, or TLS over TCP behind the `tls` feature.
//!
//! Grounded on the teacher's `ws_connect`: dial, then optionally hand the
//! socket to a TLS connector, picking between `tokio::select!` branches for
//! the dial itself rather than a bespoke timeout wrapper.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::cancel::CancelToken;
use crate::external::{Endpoint, StreamFactory};

#[cfg(feature = "tls")]
use std::sync::Arc;
#[cfg(feature = "tls")]
use tokio_rustls::{client::TlsStream, TlsConnector};

/// Either half of what [`TcpStreamFactory`] can hand back, depending on
/// whether TLS was configured. A single concrete type keeps `Connection`
/// from needing to be generic over "plain or TLS" on top of everything
/// else.
pub enum AnyStream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for AnyStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AnyStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AnyStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            AnyStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AnyStream::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AnyStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Dials a TCP socket, upgrading to TLS when a connector is configured.
/// With no connector, every stream is plain TCP regardless of endpoint.
pub struct TcpStreamFactory {
    #[cfg(feature = "tls")]
    tls: Option<TlsConnector>,
}

impl TcpStreamFactory {
    pub fn plain() -> Self {
        Self {
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    #[cfg(feature = "tls")]
    pub fn with_tls(connector: TlsConnector) -> Self {
        Self { tls: Some(connector) }
    }

    #[cfg(feature = "tls")]
    pub fn with_native_roots() -> io::Result<Self> {
        let mut roots = tokio_rustls::rustls::RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            let _ = roots.add(cert);
        }
        let config = tokio_rustls::rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self::with_tls(TlsConnector::from(Arc::new(config))))
    }
}

impl Default for TcpStreamFactory {
    fn default() -> Self {
        Self::plain()
    }
}

#[async_trait]
impl StreamFactory for TcpStreamFactory {
    type Stream = AnyStream;

    async fn create_stream(&self, endpoint: &Endpoint, cancel: &CancelToken) -> io::Result<AnyStream> {
        let dial = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
        let tcp = tokio::select! {
            biased;
            result = dial => result?,
            () = cancel.cancelled() => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "connection attempt was cancelled"));
            }
        };
        tcp.set_nodelay(true)?;

        #[cfg(feature = "tls")]
        if let Some(connector) = &self.tls {
            let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from(endpoint.host.clone())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let handshake = connector.connect(server_name, tcp);
            let tls = tokio::select! {
                biased;
                result = handshake => result?,
                () = cancel.cancelled() => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "TLS handshake was cancelled"));
                }
            };
            return Ok(AnyStream::Tls(Box::new(tls)));
        }

        Ok(AnyStream::Plain(tcp))
    }
}
