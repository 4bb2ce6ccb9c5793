//! Certificate material used by the credential resolver.
//!
//! # Certificate pools
//!
//! ```ignore
//! use horizon_lattice_rpc::tls::CertPool;
//!
//! // Trust a private CA only
//! let pool = CertPool::from_pem_file("/path/to/ca.pem")?;
//!
//! // Or start from the bundled public roots and add a private CA
//! let pool = CertPool::webpki_roots().add_pem(ca_pem)?;
//! ```
//!
//! # Server identity
//!
//! ```ignore
//! use horizon_lattice_rpc::tls::Identity;
//!
//! let identity = Identity::from_pem_files("/path/to/server.pem", "/path/to/server.key")?;
//! ```

use std::io::{BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::{GrpcError, Result};

const TARGET: &str = "horizon_lattice_rpc::tls";

/// ALPN identifier for HTTP/2, required by gRPC.
pub(crate) const ALPN_H2: &[u8] = b"h2";

/// Minimum TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// TLS 1.2 (default minimum).
    #[default]
    Tls1_2,
    /// TLS 1.3 only.
    Tls1_3,
}

impl TlsVersion {
    pub(crate) fn to_rustls_versions(self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        match self {
            TlsVersion::Tls1_2 => vec![&rustls::version::TLS12, &rustls::version::TLS13],
            TlsVersion::Tls1_3 => vec![&rustls::version::TLS13],
        }
    }
}

/// The crypto provider used for every TLS configuration built by this crate.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Make the ring provider the process default unless one is already set.
///
/// Server TLS is configured through tonic, which builds its rustls config
/// from the process-level provider.
pub(crate) fn ensure_default_provider() {
    if CryptoProvider::get_default().is_none()
        && rustls::crypto::ring::default_provider().install_default().is_ok()
    {
        tracing::debug!(target: TARGET, "installed ring as the default crypto provider");
    }
}

fn read_pem_file(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        GrpcError::Credential(format!(
            "Failed to read {} '{}': {}",
            what,
            path.display(),
            e
        ))
    })
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(Cursor::new(pem));
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GrpcError::Credential(format!("Failed to parse PEM certificate: {}", e)))?;

    if certs.is_empty() {
        return Err(GrpcError::Credential(
            "No certificates found in PEM data".to_string(),
        ));
    }
    Ok(certs)
}

/// A set of trusted certificates used to verify a server's identity.
#[derive(Clone, Debug)]
pub struct CertPool {
    store: RootCertStore,
}

impl Default for CertPool {
    fn default() -> Self {
        Self::new()
    }
}

impl CertPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            store: RootCertStore::empty(),
        }
    }

    /// Create a pool holding the bundled webpki root certificates.
    pub fn webpki_roots() -> Self {
        let mut store = RootCertStore::empty();
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self { store }
    }

    /// Create a pool from PEM-encoded certificates.
    pub fn from_pem(pem: impl AsRef<[u8]>) -> Result<Self> {
        Self::new().add_pem(pem)
    }

    /// Create a pool from a PEM file.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_pem(read_pem_file(path.as_ref(), "certificate pool")?)
    }

    /// Add every certificate found in the PEM data.
    pub fn add_pem(mut self, pem: impl AsRef<[u8]>) -> Result<Self> {
        for cert in parse_certs(pem.as_ref())? {
            self.store.add(cert).map_err(|e| {
                GrpcError::Credential(format!("Failed to add root certificate: {}", e))
            })?;
        }
        Ok(self)
    }

    /// Add a DER-encoded certificate.
    pub fn add_der(mut self, der: impl Into<Vec<u8>>) -> Result<Self> {
        self.store
            .add(CertificateDer::from(der.into()))
            .map_err(|e| GrpcError::Credential(format!("Failed to add root certificate: {}", e)))?;
        Ok(self)
    }

    /// Number of trust anchors in the pool.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether the pool has no trust anchors.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub(crate) fn root_store(&self) -> RootCertStore {
        self.store.clone()
    }
}

/// Certificate chain and private key presented by a TLS server.
///
/// The PEM text is kept as supplied so it can be handed to the transport
/// unchanged; it is validated when credentials are resolved.
#[derive(Clone)]
pub struct Identity {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("cert_pem_len", &self.cert_pem.len())
            .field("has_key", &!self.key_pem.is_empty())
            .finish()
    }
}

impl Identity {
    /// Create an identity from PEM-encoded certificate chain and key bytes.
    pub fn from_pem(cert_pem: impl Into<Vec<u8>>, key_pem: impl Into<Vec<u8>>) -> Self {
        Self {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    /// Create an identity from PEM files.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let cert_pem = read_pem_file(cert_path.as_ref(), "certificate file")?;
        let key_pem = read_pem_file(key_path.as_ref(), "key file")?;
        Ok(Self::from_pem(cert_pem, key_pem))
    }

    pub(crate) fn cert_pem(&self) -> &[u8] {
        &self.cert_pem
    }

    pub(crate) fn key_pem(&self) -> &[u8] {
        &self.key_pem
    }

    /// Parse the certificate chain and private key.
    pub(crate) fn parse(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        if self.cert_pem.is_empty() {
            return Err(GrpcError::Credential("Server certificate is missing".into()));
        }
        if self.key_pem.is_empty() {
            return Err(GrpcError::Credential("Server private key is missing".into()));
        }

        let chain = parse_certs(&self.cert_pem)?;
        let mut key_reader = BufReader::new(Cursor::new(self.key_pem.as_slice()));
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| GrpcError::Credential(format!("Failed to parse private key PEM: {}", e)))?
            .ok_or_else(|| GrpcError::Credential("No private key found in PEM data".into()))?;

        Ok((chain, key))
    }
}

/// Build a client config that verifies the server against `pool`.
pub(crate) fn verifying_client_config(
    pool: &CertPool,
    min_version: TlsVersion,
) -> Result<Arc<ClientConfig>> {
    if pool.is_empty() {
        return Err(GrpcError::Credential(
            "Certificate pool has no trust anchors".to_string(),
        ));
    }

    let versions = min_version.to_rustls_versions();
    let mut config = ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&versions)
        .map_err(|e| GrpcError::Credential(format!("Unsupported TLS versions: {}", e)))?
        .with_root_certificates(pool.root_store())
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_H2.to_vec()];

    Ok(Arc::new(config))
}

/// Build a client config that encrypts but does not check the peer identity.
pub(crate) fn skip_verify_client_config(min_version: TlsVersion) -> Result<Arc<ClientConfig>> {
    let provider = crypto_provider();
    let versions = min_version.to_rustls_versions();
    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&versions)
        .map_err(|e| GrpcError::Credential(format!("Unsupported TLS versions: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification { provider }))
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_H2.to_vec()];

    Ok(Arc::new(config))
}

/// Accepts any server certificate while still checking handshake signatures.
#[derive(Debug)]
struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
