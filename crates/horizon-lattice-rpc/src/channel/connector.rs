//! Transport connector used when a channel needs more than plain TCP.
//!
//! Plaintext TCP dials go through tonic's own connector. Everything else
//! (TLS with a custom verifier, the in-process dialer, or both) is handled
//! here so the endpoint URI can stay `http://` while the stream underneath
//! is encrypted.

use std::io;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tonic::transport::Uri;
use tower::Service;

use crate::error::{GrpcError, Result};
use crate::in_process::InProcessDialer;

use super::TARGET;

/// A byte stream the HTTP/2 client can run over.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub(crate) type BoxedIo = Box<dyn Io>;

/// Where the raw byte stream comes from.
#[derive(Clone, Debug)]
pub(crate) enum Route {
    Tcp {
        connect_timeout: Option<Duration>,
        nodelay: bool,
    },
    InProcess(InProcessDialer),
}

#[derive(Clone)]
struct TlsConnect {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

#[derive(Clone)]
pub(crate) struct Connector {
    route: Route,
    tls: Option<TlsConnect>,
}

impl Connector {
    pub(crate) fn new(route: Route) -> Self {
        Self { route, tls: None }
    }

    /// Wrap every connection in TLS, verifying against `server_name`.
    pub(crate) fn with_tls(mut self, config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        self.tls = Some(TlsConnect { config, server_name });
        self
    }
}

/// Parse a host into a TLS server name. IPv6 brackets are stripped.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host)
        .map(|name| name.to_owned())
        .map_err(|e| GrpcError::Credential(format!("Invalid TLS server name {:?}: {}", host, e)))
}

impl Service<Uri> for Connector {
    type Response = TokioIo<BoxedIo>;
    type Error = io::Error;
    type Future = BoxFuture<'static, io::Result<Self::Response>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let route = self.route.clone();
        let tls = self.tls.clone();

        Box::pin(async move {
            let io: BoxedIo = match route {
                Route::Tcp {
                    connect_timeout,
                    nodelay,
                } => Box::new(dial_tcp(&uri, connect_timeout, nodelay).await?),
                Route::InProcess(dialer) => Box::new(dialer.dial().await?),
            };

            let io = match tls {
                Some(TlsConnect {
                    config,
                    server_name,
                }) => {
                    let stream = TlsConnector::from(config).connect(server_name, io).await?;
                    tracing::trace!(target: TARGET, %uri, "TLS handshake complete");
                    Box::new(stream) as BoxedIo
                }
                None => io,
            };

            Ok(TokioIo::new(io))
        })
    }
}

async fn dial_tcp(uri: &Uri, connect_timeout: Option<Duration>, nodelay: bool) -> io::Result<TcpStream> {
    let host = uri
        .host()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("no host in {}", uri)))?
        .trim_start_matches('[')
        .trim_end_matches(']');
    let port = uri.port_u16().unwrap_or(80);

    let connect = TcpStream::connect((host, port));
    let stream = match connect_timeout {
        Some(timeout) => tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
        None => connect.await?,
    };
    stream.set_nodelay(nodelay)?;

    tracing::trace!(target: TARGET, host, port, "TCP connection established");
    Ok(stream)
}
