//! Configuration and builder for service hosts.

use std::time::Duration;

use crate::credentials::ServerCredentials;
use crate::error::Result;
use crate::interceptor::{Interceptor, InterceptorChain};
use crate::tls::Identity;

use super::ServiceHost;

/// Default time `cleanup` waits for in-flight calls to finish.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Settings a [`ServiceHost`] is created from.
#[derive(Clone, Debug)]
pub struct HostConfig {
    /// Plaintext or TLS with a certificate and key.
    pub credentials: ServerCredentials,
    /// Interceptors wrapped around every incoming call.
    pub interceptors: InterceptorChain,
    /// How long shutdown waits for in-flight calls before aborting them.
    pub grace_period: Duration,
    /// Per-request timeout. `None` means no timeout.
    pub timeout: Option<Duration>,
    /// Maximum concurrent requests per connection.
    pub concurrency_limit_per_connection: Option<usize>,
    /// HTTP/2 `SETTINGS_MAX_CONCURRENT_STREAMS`.
    pub max_concurrent_streams: Option<u32>,
    /// Interval between HTTP/2 keep-alive PINGs. `None` disables them.
    pub http2_keepalive_interval: Option<Duration>,
    /// Enable TCP_NODELAY on accepted TCP connections.
    pub tcp_nodelay: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            credentials: ServerCredentials::Insecure,
            interceptors: InterceptorChain::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
            timeout: None,
            concurrency_limit_per_connection: None,
            max_concurrent_streams: None,
            http2_keepalive_interval: None,
            tcp_nodelay: true,
        }
    }
}

/// Builder for [`ServiceHost`].
#[derive(Clone, Debug, Default)]
pub struct ServiceHostBuilder {
    config: HostConfig,
}

impl ServiceHostBuilder {
    /// Create a builder for a plaintext host with the default interceptors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the interceptor chain.
    pub fn interceptors(mut self, chain: InterceptorChain) -> Self {
        self.config.interceptors = chain;
        self
    }

    /// Append an interceptor to the current chain.
    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.config.interceptors = self.config.interceptors.with(interceptor);
        self
    }

    /// Serve over TLS with this certificate chain and key.
    pub fn tls_identity(mut self, identity: Identity) -> Self {
        self.config.credentials = ServerCredentials::Tls(identity);
        self
    }

    /// Set the credentials directly.
    pub fn credentials(mut self, credentials: ServerCredentials) -> Self {
        self.config.credentials = credentials;
        self
    }

    /// Set how long `cleanup` waits for in-flight calls.
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.config.grace_period = grace_period;
        self
    }

    /// Set the per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Limit concurrent requests per connection.
    pub fn concurrency_limit_per_connection(mut self, limit: usize) -> Self {
        self.config.concurrency_limit_per_connection = Some(limit);
        self
    }

    /// Set the HTTP/2 maximum number of concurrent streams.
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.max_concurrent_streams = Some(max);
        self
    }

    /// Set the HTTP/2 keep-alive interval.
    pub fn http2_keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.http2_keepalive_interval = Some(interval);
        self
    }

    /// Enable or disable TCP_NODELAY on accepted connections.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.config.tcp_nodelay = enable;
        self
    }

    /// Freeze the builder into a configuration.
    pub fn into_config(self) -> HostConfig {
        self.config
    }

    /// Create the host. Fails if the TLS identity cannot be loaded.
    pub fn build(self) -> Result<ServiceHost> {
        ServiceHost::new(self.config)
    }
}
