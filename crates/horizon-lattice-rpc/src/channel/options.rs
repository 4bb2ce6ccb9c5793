//! Low-level dial options applied on top of the builder's configuration.

use std::time::Duration;

use tonic::transport::{Endpoint, Uri};

use crate::error::{GrpcError, Result};
use crate::in_process::InProcessDialer;

/// A single transport tuning option.
///
/// Options are applied in order, so a later option of the same kind wins.
#[derive(Clone, Debug)]
pub enum DialOption {
    /// Maximum time to establish the underlying connection.
    ConnectTimeout(Duration),
    /// Maximum time for each request.
    Timeout(Duration),
    /// Interval between HTTP/2 keep-alive PING frames.
    KeepAliveInterval(Duration),
    /// How long to wait for a keep-alive PING acknowledgement.
    KeepAliveTimeout(Duration),
    /// Keep sending PINGs while no stream is open.
    KeepAliveWhileIdle(bool),
    /// Let HTTP/2 size its flow-control windows from the bandwidth-delay product.
    Http2AdaptiveWindow(bool),
    /// Initial stream-level flow-control window.
    InitialStreamWindowSize(u32),
    /// Initial connection-level flow-control window.
    InitialConnectionWindowSize(u32),
    /// Enable or disable TCP_NODELAY.
    TcpNodelay(bool),
    /// Limit the number of in-flight requests on the channel.
    ConcurrencyLimit(usize),
    /// Override the `:authority` and scheme sent with each request.
    Origin(Uri),
    /// User agent sent with each request.
    UserAgent(String),
    /// Name checked against the server certificate instead of the target host.
    TlsServerName(String),
    /// Replace the network dial with an in-process connection.
    Dialer(InProcessDialer),
}

/// Options that shape the connector rather than the endpoint.
#[derive(Clone, Debug)]
pub(crate) struct DialSettings {
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) nodelay: bool,
    pub(crate) server_name: Option<String>,
    pub(crate) dialer: Option<InProcessDialer>,
}

impl Default for DialSettings {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            nodelay: true,
            server_name: None,
            dialer: None,
        }
    }
}

impl DialSettings {
    pub(crate) fn from_options(options: &[DialOption]) -> Self {
        let mut settings = Self::default();
        for option in options {
            match option {
                DialOption::ConnectTimeout(timeout) => settings.connect_timeout = Some(*timeout),
                DialOption::TcpNodelay(enable) => settings.nodelay = *enable,
                DialOption::TlsServerName(name) => settings.server_name = Some(name.clone()),
                DialOption::Dialer(dialer) => settings.dialer = Some(dialer.clone()),
                _ => {}
            }
        }
        settings
    }
}

/// Apply every endpoint-level option to `endpoint`.
pub(crate) fn apply(mut endpoint: Endpoint, options: &[DialOption]) -> Result<Endpoint> {
    for option in options {
        endpoint = match option {
            DialOption::ConnectTimeout(timeout) => endpoint.connect_timeout(*timeout),
            DialOption::Timeout(timeout) => endpoint.timeout(*timeout),
            DialOption::KeepAliveInterval(interval) => endpoint.http2_keep_alive_interval(*interval),
            DialOption::KeepAliveTimeout(timeout) => endpoint.keep_alive_timeout(*timeout),
            DialOption::KeepAliveWhileIdle(enable) => endpoint.keep_alive_while_idle(*enable),
            DialOption::Http2AdaptiveWindow(enable) => endpoint.http2_adaptive_window(*enable),
            DialOption::InitialStreamWindowSize(size) => endpoint.initial_stream_window_size(*size),
            DialOption::InitialConnectionWindowSize(size) => {
                endpoint.initial_connection_window_size(*size)
            }
            DialOption::TcpNodelay(enable) => endpoint.tcp_nodelay(*enable),
            DialOption::ConcurrencyLimit(limit) => endpoint.concurrency_limit(*limit),
            DialOption::Origin(origin) => endpoint.origin(origin.clone()),
            DialOption::UserAgent(user_agent) => endpoint
                .user_agent(user_agent.clone())
                .map_err(|e| GrpcError::InvalidMetadata(format!("Invalid user agent: {}", e)))?,
            DialOption::TlsServerName(_) | DialOption::Dialer(_) => endpoint,
        };
    }
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_process::InProcessPipe;

    #[test]
    fn test_settings_later_option_wins() {
        let settings = DialSettings::from_options(&[
            DialOption::TcpNodelay(false),
            DialOption::ConnectTimeout(Duration::from_secs(1)),
            DialOption::ConnectTimeout(Duration::from_secs(3)),
        ]);
        assert!(!settings.nodelay);
        assert_eq!(settings.connect_timeout, Some(Duration::from_secs(3)));
        assert!(settings.dialer.is_none());
    }

    #[test]
    fn test_settings_collects_dialer_and_server_name() {
        let pipe = InProcessPipe::new();
        let settings = DialSettings::from_options(&[
            DialOption::Dialer(pipe.dialer()),
            DialOption::TlsServerName("localhost".into()),
        ]);
        assert!(settings.dialer.is_some());
        assert_eq!(settings.server_name.as_deref(), Some("localhost"));
    }

    #[test]
    fn test_apply_endpoint_options() {
        let endpoint = Endpoint::from_static("http://localhost:50051");
        let endpoint = apply(
            endpoint,
            &[
                DialOption::Timeout(Duration::from_secs(30)),
                DialOption::KeepAliveInterval(Duration::from_secs(60)),
                DialOption::InitialStreamWindowSize(1 << 20),
                DialOption::UserAgent("lattice-test/1.0".into()),
            ],
        )
        .unwrap();
        assert_eq!(endpoint.uri().host(), Some("localhost"));
    }

    #[test]
    fn test_apply_rejects_bad_user_agent() {
        let endpoint = Endpoint::from_static("http://localhost:50051");
        let result = apply(endpoint, &[DialOption::UserAgent("bad\nagent".into())]);
        assert!(matches!(result, Err(GrpcError::InvalidMetadata(_))));
    }
}
