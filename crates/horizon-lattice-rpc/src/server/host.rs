//! The running service host and its listener handle.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::RoutesBuilder;
use tonic::transport::server::Connected;
use tonic::transport::{Server, ServerTlsConfig};

use crate::error::{GrpcError, Result};
use crate::in_process::{InProcessDialer, InProcessPipe};
use crate::interceptor::Side;
use crate::tls;

use super::config::HostConfig;
use super::conn::SeverableConn;
use super::state::ServiceHostState;

const TARGET: &str = "horizon_lattice_rpc::server";

/// What a host is accepting connections from.
#[derive(Clone, Debug)]
enum Endpoint {
    Tcp(SocketAddr),
    InProcess(InProcessPipe),
}

/// Handle to the listener of a started [`ServiceHost`].
///
/// Closing it stops the host from accepting connections and begins a
/// graceful shutdown of the serving loop. For in-process hosts the paired
/// pipe is closed too, so pending and future dials fail.
#[derive(Clone, Debug)]
pub struct HostListener {
    endpoint: Endpoint,
    shutdown: Arc<watch::Sender<bool>>,
}

impl HostListener {
    /// The bound socket address, for TCP listeners.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.endpoint {
            Endpoint::Tcp(addr) => Some(*addr),
            Endpoint::InProcess(_) => None,
        }
    }

    /// A dialer for the paired pipe, for in-process listeners.
    pub fn dialer(&self) -> Option<InProcessDialer> {
        match &self.endpoint {
            Endpoint::Tcp(_) => None,
            Endpoint::InProcess(pipe) => Some(pipe.dialer()),
        }
    }

    /// Stop accepting connections. Idempotent.
    pub fn close(&self) {
        if !self.shutdown.send_replace(true) {
            tracing::debug!(target: TARGET, "listener closed");
        }
        if let Endpoint::InProcess(pipe) = &self.endpoint {
            pipe.close();
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// A gRPC server bound to a TCP port or an in-process pipe.
///
/// Services are attached with [`register_service`](Self::register_service)
/// before the host is started. Starting spawns the serving loop and returns
/// immediately; [`cleanup`](Self::cleanup) stops it.
///
/// Dropping a started host signals shutdown without waiting for it.
pub struct ServiceHost {
    config: HostConfig,
    tls: Option<ServerTlsConfig>,
    routes: Option<RoutesBuilder>,
    state: ServiceHostState,
    listener: Option<HostListener>,
    task: Option<JoinHandle<()>>,
    sever: Option<watch::Sender<bool>>,
}

impl ServiceHost {
    /// Create a host from `config`, resolving its TLS identity.
    pub fn new(config: HostConfig) -> Result<Self> {
        let tls = config.credentials.resolve()?;
        Ok(Self {
            config,
            tls,
            routes: Some(RoutesBuilder::default()),
            state: ServiceHostState::Idle,
            listener: None,
            task: None,
            sever: None,
        })
    }

    /// Create a new builder for configuring a service host.
    pub fn builder() -> super::ServiceHostBuilder {
        super::ServiceHostBuilder::new()
    }

    /// Attach services through the dispatch engine.
    ///
    /// May be called any number of times before the host is started.
    ///
    /// ```ignore
    /// host.register_service(|routes| {
    ///     routes.add_service(GreeterServer::new(MyGreeter));
    /// })?;
    /// ```
    pub fn register_service<F>(&mut self, register: F) -> Result<()>
    where
        F: FnOnce(&mut RoutesBuilder),
    {
        let routes = self.routes.as_mut().ok_or_else(|| {
            GrpcError::InvalidState("Services must be registered before start".to_string())
        })?;
        register(routes);
        Ok(())
    }

    /// Bind `host:port` and start serving in the background.
    ///
    /// Returns the bound address, which differs from `port` when it is 0.
    pub async fn start(&mut self, host: &str, port: u16) -> Result<SocketAddr> {
        self.ensure_idle()?;

        let addr = bind_address(host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GrpcError::Bind(format!("{}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GrpcError::Bind(format!("{}: {}", addr, e)))?;

        let nodelay = self.config.tcp_nodelay;
        let incoming = TcpListenerStream::new(listener).map(move |conn| {
            let stream = conn?;
            stream.set_nodelay(nodelay)?;
            Ok::<_, io::Error>(stream)
        });

        self.serve(incoming, Endpoint::Tcp(local_addr))?;
        tracing::info!(
            target: TARGET,
            addr = %local_addr,
            tls = self.tls.is_some(),
            "service host listening"
        );
        Ok(local_addr)
    }

    /// Start serving connections dialed through `pipe`.
    ///
    /// A pipe can back one host. Closing the pipe shuts the host down.
    pub fn start_in_process(&mut self, pipe: &InProcessPipe) -> Result<()> {
        self.ensure_idle()?;
        if pipe.is_closed() {
            return Err(GrpcError::Bind("In-process pipe is closed".to_string()));
        }
        let incoming = pipe
            .incoming()
            .ok_or_else(|| GrpcError::Bind("In-process pipe already has a listener".to_string()))?;

        self.serve(incoming, Endpoint::InProcess(pipe.clone()))?;
        tracing::info!(target: TARGET, tls = self.tls.is_some(), "service host listening in-process");
        Ok(())
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.state {
            ServiceHostState::Idle => Ok(()),
            state => Err(GrpcError::InvalidState(format!(
                "Service host cannot start while {}",
                state
            ))),
        }
    }

    fn serve<I, IO>(&mut self, incoming: I, endpoint: Endpoint) -> Result<()>
    where
        I: Stream<Item = io::Result<IO>> + Send + 'static,
        IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
        IO::ConnectInfo: Clone + Send + Sync + 'static,
    {
        let routes = self.routes.take().ok_or_else(|| {
            GrpcError::InvalidState("Service host has already been started".to_string())
        })?;

        let mut server = Server::builder();
        if let Some(tls) = self.tls.clone() {
            tls::ensure_default_provider();
            server = server
                .tls_config(tls)
                .map_err(|e| GrpcError::Credential(format!("Invalid server TLS config: {}", e)))?;
        }
        if let Some(timeout) = self.config.timeout {
            server = server.timeout(timeout);
        }
        if let Some(limit) = self.config.concurrency_limit_per_connection {
            server = server.concurrency_limit_per_connection(limit);
        }
        let mut server = server
            .max_concurrent_streams(self.config.max_concurrent_streams)
            .http2_keepalive_interval(self.config.http2_keepalive_interval)
            .layer(self.config.interceptors.layer(Side::Server));
        let router = server.add_routes(routes.routes());

        let (sever, severed) = watch::channel(false);
        let incoming =
            incoming.map(move |conn| conn.map(|io| SeverableConn::new(io, severed.clone())));

        let (shutdown, mut signal) = watch::channel(false);
        let task = tokio::spawn(async move {
            let shutdown_signal = async move {
                // A dropped sender also ends the loop.
                let _ = signal.wait_for(|closed| *closed).await;
            };
            match router.serve_with_incoming_shutdown(incoming, shutdown_signal).await {
                Ok(()) => tracing::debug!(target: TARGET, "serving loop finished"),
                Err(e) => tracing::error!(target: TARGET, error = %GrpcError::from(e), "serving loop failed"),
            }
        });

        self.listener = Some(HostListener {
            endpoint,
            shutdown: Arc::new(shutdown),
        });
        self.task = Some(task);
        self.sever = Some(sever);
        self.state = ServiceHostState::Serving;
        Ok(())
    }

    /// The active listener, if the host has been started and not cleaned up.
    pub fn listener(&self) -> Option<HostListener> {
        self.listener.clone()
    }

    /// The bound TCP address, if serving on a socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(HostListener::local_addr)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceHostState {
        match (self.state, &self.task) {
            (ServiceHostState::Serving, Some(task)) if task.is_finished() => ServiceHostState::Stopped,
            (state, _) => state,
        }
    }

    /// The configuration the host was created with.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Stop accepting connections, let in-flight calls finish, then release
    /// the listener.
    ///
    /// When the grace period elapses first, every open connection is cut off
    /// and the calls still running on it fail on the client side. A no-op if
    /// the host was never started or has already been cleaned up.
    pub async fn cleanup(&mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };
        if let Some(listener) = self.listener.take() {
            listener.close();
        }

        let grace_period = self.config.grace_period;
        match tokio::time::timeout(grace_period, &mut task).await {
            Ok(Ok(())) => tracing::debug!(target: TARGET, "service host stopped"),
            Ok(Err(e)) => tracing::warn!(target: TARGET, error = %e, "serving task ended abnormally"),
            Err(_) => {
                tracing::warn!(
                    target: TARGET,
                    grace_ms = grace_period.as_millis() as u64,
                    "grace period elapsed, severing open connections"
                );
                if let Some(sever) = &self.sever {
                    sever.send_replace(true);
                }
                task.abort();
                let _ = task.await;
            }
        }
        self.sever = None;
        self.state = ServiceHostState::Stopped;
    }
}

impl Drop for ServiceHost {
    fn drop(&mut self) {
        if let Some(listener) = &self.listener {
            listener.close();
        }
    }
}

impl std::fmt::Debug for ServiceHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHost")
            .field("state", &self.state())
            .field("listener", &self.listener)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Join host and port, bracketing bare IPv6 literals.
fn bind_address(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
