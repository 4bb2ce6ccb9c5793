//! Client channels: configuration, credentials, interceptors and dialing.
//!
//! A [`GrpcChannelBuilder`] accumulates transport security, interceptors,
//! dial options and a dial context, then produces a [`GrpcChannel`] for a
//! target address. The builder is consumed by the terminal call.
//!
//! ```ignore
//! use horizon_lattice_rpc::channel::GrpcChannel;
//! use horizon_lattice_rpc::tls::CertPool;
//!
//! let pool = CertPool::from_pem_file("ca.pem")?;
//! let channel = GrpcChannel::builder()
//!     .tls(false, Some(pool))
//!     .block()
//!     .connect("localhost:8989")
//!     .await?;
//! ```
//!
//! Channels are cheap to clone and safe to share between tasks. Any generated
//! tonic client can be constructed over one.

mod connector;
mod options;

use std::task::{Context, Poll};
use std::time::Duration;

use tonic::body::Body;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::{Layer, Service};

use crate::context::DialContext;
use crate::credentials::{ClientCredentials, ClientTransport};
use crate::error::{GrpcError, Result};
use crate::in_process::InProcessPipe;
use crate::interceptor::{BoxError, InterceptedService, Interceptor, InterceptorChain, Side};
use crate::tls::CertPool;

use connector::{Connector, Route};
pub use options::DialOption;
use options::DialSettings;

const TARGET: &str = "horizon_lattice_rpc::channel";

/// Authority used on the wire when an in-process dialer replaces the network.
const IN_PROCESS_URI: &str = "http://in-process.local";

/// Everything needed to dial a channel.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// `host:port` to dial. An `http://` or `https://` prefix is accepted and
    /// ignored; transport security comes from `credentials` only.
    pub target: String,
    /// Transport security. Dialing without it is a credential error.
    pub credentials: Option<ClientCredentials>,
    /// Transport tuning, applied in order.
    pub dial_options: Vec<DialOption>,
    /// Interceptors wrapped around every call.
    pub interceptors: InterceptorChain,
    /// Deadline and cancellation for blocking dials.
    pub context: DialContext,
    /// Wait for the connection to be established before returning.
    pub block: bool,
}

impl ConnectionConfig {
    /// A configuration for `target` with no transport security selected.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            credentials: None,
            dial_options: Vec::new(),
            interceptors: InterceptorChain::default(),
            context: DialContext::default(),
            block: false,
        }
    }
}

/// Builder for [`GrpcChannel`].
#[derive(Clone, Debug, Default)]
pub struct GrpcChannelBuilder {
    credentials: Option<ClientCredentials>,
    dial_options: Vec<DialOption>,
    interceptors: InterceptorChain,
    context: DialContext,
    block: bool,
}

impl GrpcChannelBuilder {
    /// Create a builder with no transport security selected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use plaintext transport.
    pub fn insecure(mut self) -> Self {
        self.credentials = Some(ClientCredentials::Insecure);
        self
    }

    /// Use TLS.
    ///
    /// With `skip_verify` the server's certificate is not checked and `pool`
    /// may be `None`. Otherwise the server is verified against `pool`, and a
    /// missing pool is reported when the channel is dialed.
    pub fn tls(mut self, skip_verify: bool, pool: Option<CertPool>) -> Self {
        self.credentials = Some(ClientCredentials::tls(skip_verify, pool));
        self
    }

    /// Set the credentials directly.
    pub fn credentials(mut self, credentials: ClientCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Replace the interceptor chain.
    pub fn interceptors(mut self, chain: InterceptorChain) -> Self {
        self.interceptors = chain;
        self
    }

    /// Append an interceptor to the current chain.
    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors = self.interceptors.with(interceptor);
        self
    }

    /// Append dial options.
    pub fn dial_options(mut self, options: impl IntoIterator<Item = DialOption>) -> Self {
        self.dial_options.extend(options);
        self
    }

    /// Append a single dial option.
    pub fn dial_option(mut self, option: DialOption) -> Self {
        self.dial_options.push(option);
        self
    }

    /// Dial through `pipe` instead of the network.
    pub fn in_process(self, pipe: &InProcessPipe) -> Self {
        self.dial_option(DialOption::Dialer(pipe.dialer()))
    }

    /// Set the maximum time to establish the connection.
    pub fn connect_timeout(self, timeout: Duration) -> Self {
        self.dial_option(DialOption::ConnectTimeout(timeout))
    }

    /// Set the context that bounds a blocking dial.
    pub fn context(mut self, context: DialContext) -> Self {
        self.context = context;
        self
    }

    /// Wait for the connection to be ready before returning from `connect`.
    pub fn block(mut self) -> Self {
        self.block = true;
        self
    }

    /// Freeze the builder into a configuration for `target`.
    pub fn into_config(self, target: impl Into<String>) -> ConnectionConfig {
        ConnectionConfig {
            target: target.into(),
            credentials: self.credentials,
            dial_options: self.dial_options,
            interceptors: self.interceptors,
            context: self.context,
            block: self.block,
        }
    }

    /// Dial `target` with the configured transport security.
    pub async fn connect(self, target: impl Into<String>) -> Result<GrpcChannel> {
        GrpcChannel::dial(self.into_config(target)).await
    }

    /// Dial `target`, forcing an encrypted transport.
    ///
    /// TLS settings already on the builder are kept. Otherwise TLS with
    /// verification is selected, which fails without a certificate pool.
    pub async fn connect_tls(mut self, target: impl Into<String>) -> Result<GrpcChannel> {
        if !self.credentials.as_ref().is_some_and(ClientCredentials::is_tls) {
            self.credentials = Some(ClientCredentials::tls(false, None));
        }
        self.connect(target).await
    }
}

/// A gRPC channel with its interceptor chain installed.
///
/// Implements tonic's `GrpcService`, so generated clients accept it directly.
#[derive(Clone)]
pub struct GrpcChannel {
    inner: InterceptedService<Channel>,
    target: String,
    encrypted: bool,
    in_process: bool,
}

impl GrpcChannel {
    /// Create a new builder for configuring a gRPC channel.
    pub fn builder() -> GrpcChannelBuilder {
        GrpcChannelBuilder::new()
    }

    /// Dial a channel from a finished configuration.
    ///
    /// Credentials are resolved before anything is dialed. A blocking dial
    /// waits for the connection, bounded by the configured context; a
    /// non-blocking dial returns immediately and connects on first use.
    pub async fn dial(config: ConnectionConfig) -> Result<Self> {
        let credentials = config.credentials.as_ref().ok_or_else(|| {
            GrpcError::Credential(
                "No transport security selected; use insecure() or tls()".to_string(),
            )
        })?;
        let transport = credentials.resolve()?;
        let settings = DialSettings::from_options(&config.dial_options);
        let in_process = settings.dialer.is_some();

        let uri = if in_process {
            Uri::from_static(IN_PROCESS_URI)
        } else {
            target_uri(&config.target)?
        };
        let endpoint = options::apply(Endpoint::from(uri), &config.dial_options)?;

        tracing::debug!(
            target: TARGET,
            target_addr = %config.target,
            encrypted = transport.is_encrypted(),
            in_process,
            block = config.block,
            "dialing channel"
        );

        let channel = match (&transport, settings.dialer.clone()) {
            (ClientTransport::Plaintext, None) => {
                if config.block {
                    config
                        .context
                        .run(async { endpoint.connect().await.map_err(GrpcError::from) })
                        .await?
                } else {
                    endpoint.connect_lazy()
                }
            }
            (transport, dialer) => {
                let route = match dialer {
                    Some(dialer) => Route::InProcess(dialer),
                    None => Route::Tcp {
                        connect_timeout: settings.connect_timeout,
                        nodelay: settings.nodelay,
                    },
                };
                let mut connector = Connector::new(route);
                if let ClientTransport::Tls(tls) = transport {
                    let name = tls_server_name(&config.target, settings.server_name.as_deref());
                    connector = connector.with_tls(tls.clone(), connector::server_name(&name)?);
                }

                if config.block {
                    config
                        .context
                        .run(async {
                            endpoint
                                .connect_with_connector(connector)
                                .await
                                .map_err(GrpcError::from)
                        })
                        .await?
                } else {
                    endpoint.connect_with_connector_lazy(connector)
                }
            }
        };

        if config.block {
            tracing::info!(target: TARGET, target_addr = %config.target, "channel connected");
        }

        Ok(Self {
            inner: config.interceptors.layer(Side::Client).layer(channel),
            target: config.target,
            encrypted: transport.is_encrypted(),
            in_process,
        })
    }

    /// The target the channel was dialed with.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether the transport is encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Whether the channel runs over an in-process pipe.
    pub fn is_in_process(&self) -> bool {
        self.in_process
    }

    /// Release this handle. The connection closes once every clone is gone.
    pub fn close(self) {
        tracing::debug!(target: TARGET, target_addr = %self.target, "channel handle closed");
    }
}

impl Service<http::Request<Body>> for GrpcChannel {
    type Response = http::Response<Body>;
    type Error = BoxError;
    type Future = <InterceptedService<Channel> as Service<http::Request<Body>>>::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        self.inner.call(req)
    }
}

impl std::fmt::Debug for GrpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcChannel")
            .field("target", &self.target)
            .field("encrypted", &self.encrypted)
            .field("in_process", &self.in_process)
            .finish()
    }
}

/// Strip any scheme from `target` and build the plaintext endpoint URI.
fn target_uri(target: &str) -> Result<Uri> {
    let authority = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
        .unwrap_or(target)
        .trim_end_matches('/');
    if authority.is_empty() {
        return Err(GrpcError::InvalidAddress("Empty target address".to_string()));
    }

    let uri: Uri = format!("http://{}", authority)
        .parse()
        .map_err(|e| GrpcError::InvalidAddress(format!("Invalid target {:?}: {}", target, e)))?;
    if uri.host().is_none_or(str::is_empty) {
        return Err(GrpcError::InvalidAddress(format!("No host in target {:?}", target)));
    }
    Ok(uri)
}

/// The name the server certificate is checked against.
///
/// An explicit override wins. In-process targets are logical names, so an
/// unparseable one falls back to `localhost`.
fn tls_server_name(target: &str, explicit: Option<&str>) -> String {
    if let Some(name) = explicit {
        return name.to_string();
    }
    target_uri(target)
        .ok()
        .and_then(|uri| uri.host().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string())
}
