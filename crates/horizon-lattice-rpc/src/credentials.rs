//! Credential resolution for the client and server roles.
//!
//! A credential configuration is resolved into transport-security material
//! without performing any I/O. Resolution is where missing or malformed
//! certificate material is reported, so channel and host construction fail
//! before anything is dialed or bound.

use std::sync::Arc;

use rustls::ClientConfig;
use tonic::transport::ServerTlsConfig;

use crate::error::{GrpcError, Result};
use crate::tls::{self, CertPool, Identity, TlsVersion};

const TARGET: &str = "horizon_lattice_rpc::credentials";

/// Client-side transport security selection.
#[derive(Debug, Clone)]
pub enum ClientCredentials {
    /// Plaintext. No encryption and no identity verification.
    Insecure,
    /// Encrypted transport.
    Tls {
        /// Encrypt but do not check the server's certificate.
        skip_verify: bool,
        /// Trust anchors used to verify the server. Required unless `skip_verify`.
        pool: Option<CertPool>,
        /// Minimum protocol version.
        min_version: TlsVersion,
    },
}

impl ClientCredentials {
    /// Encrypted credentials with the default minimum version.
    pub fn tls(skip_verify: bool, pool: Option<CertPool>) -> Self {
        Self::Tls {
            skip_verify,
            pool,
            min_version: TlsVersion::default(),
        }
    }

    /// Whether this selects an encrypted transport.
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }

    /// Resolve into the material the connector needs.
    pub fn resolve(&self) -> Result<ClientTransport> {
        match self {
            Self::Insecure => Ok(ClientTransport::Plaintext),
            Self::Tls {
                skip_verify: true,
                min_version,
                ..
            } => {
                tracing::debug!(target: TARGET, "resolved TLS credentials without peer verification");
                Ok(ClientTransport::Tls(tls::skip_verify_client_config(
                    *min_version,
                )?))
            }
            Self::Tls {
                skip_verify: false,
                pool: Some(pool),
                min_version,
            } => {
                tracing::debug!(target: TARGET, anchors = pool.len(), "resolved verifying TLS credentials");
                Ok(ClientTransport::Tls(tls::verifying_client_config(
                    pool,
                    *min_version,
                )?))
            }
            Self::Tls {
                skip_verify: false,
                pool: None,
                ..
            } => Err(GrpcError::Credential(
                "TLS without skip-verify requires a certificate pool".to_string(),
            )),
        }
    }
}

/// Resolved client-side transport security.
#[derive(Clone)]
pub enum ClientTransport {
    /// Plaintext HTTP/2.
    Plaintext,
    /// HTTP/2 over TLS using this configuration.
    Tls(Arc<ClientConfig>),
}

impl ClientTransport {
    /// Whether the transport is encrypted.
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl std::fmt::Debug for ClientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plaintext => f.write_str("Plaintext"),
            Self::Tls(_) => f.write_str("Tls"),
        }
    }
}

/// Server-side transport security selection.
#[derive(Debug, Clone, Default)]
pub enum ServerCredentials {
    /// Plaintext.
    #[default]
    Insecure,
    /// TLS with the given certificate chain and key.
    Tls(Identity),
}

impl ServerCredentials {
    /// Resolve into the transport's TLS configuration, `None` for plaintext.
    ///
    /// The certificate chain and key are checked to be parseable and to match
    /// a supported key type before being handed to the transport.
    pub fn resolve(&self) -> Result<Option<ServerTlsConfig>> {
        let identity = match self {
            Self::Insecure => return Ok(None),
            Self::Tls(identity) => identity,
        };

        let (chain, key) = identity.parse()?;
        let chain_len = chain.len();
        rustls::ServerConfig::builder_with_provider(tls::crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| GrpcError::Credential(format!("Unsupported TLS versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| GrpcError::Credential(format!("Invalid server certificate: {}", e)))?;

        tracing::debug!(target: TARGET, chain_len, "resolved server TLS identity");

        let identity =
            tonic::transport::Identity::from_pem(identity.cert_pem(), identity.key_pem());
        Ok(Some(ServerTlsConfig::new().identity(identity)))
    }
}
