//! gRPC channel and service host builders for Horizon Lattice.
//!
//! This crate is a configuration and lifecycle layer over tonic:
//!
//! - **Channels**: plaintext or TLS client channels with an interceptor chain,
//!   dialed lazily or blocking under a deadline
//! - **Service hosts**: TLS or plaintext servers with the same interceptor
//!   model, graceful cleanup and lifecycle state
//! - **In-process transport**: a paired listener and dialer over in-memory
//!   pipes, for tests that should not open a port
//!
//! # Client
//!
//! ```ignore
//! use horizon_lattice_rpc::{CertPool, DialContext, GrpcChannel};
//!
//! let pool = CertPool::from_pem_file("ca.pem")?;
//! let channel = GrpcChannel::builder()
//!     .tls(false, Some(pool))
//!     .context(DialContext::with_timeout(Duration::from_secs(5)))
//!     .block()
//!     .connect("localhost:8989")
//!     .await?;
//!
//! let mut client = GreeterClient::new(channel);
//! ```
//!
//! Transport security must be chosen explicitly with `insecure()` or
//! `tls(..)`. Skipping verification (`tls(true, None)`) encrypts without
//! checking the server's identity.
//!
//! # Server
//!
//! ```ignore
//! use horizon_lattice_rpc::{Identity, ServiceHostBuilder};
//!
//! let mut host = ServiceHostBuilder::new()
//!     .tls_identity(Identity::from_pem_files("server.pem", "server.key")?)
//!     .build()?;
//! host.register_service(|routes| {
//!     routes.add_service(GreeterServer::new(MyGreeter));
//! })?;
//! host.start("localhost", 8989).await?;
//! // ...
//! host.cleanup().await;
//! ```
//!
//! # In-Process
//!
//! ```ignore
//! use horizon_lattice_rpc::{GrpcChannel, InProcessPipe, ServiceHostBuilder};
//!
//! let pipe = InProcessPipe::new();
//! let mut host = ServiceHostBuilder::new().build()?;
//! host.register_service(|routes| {
//!     routes.add_service(GreeterServer::new(MyGreeter));
//! })?;
//! host.start_in_process(&pipe)?;
//!
//! let channel = GrpcChannel::builder()
//!     .insecure()
//!     .in_process(&pipe)
//!     .connect("bufnet")
//!     .await?;
//! ```
//!
//! # Interceptors
//!
//! Both builders carry an [`InterceptorChain`], by default a
//! [`RecoveryInterceptor`] followed by a [`LoggingInterceptor`]. Interceptors
//! run in order around every call; any of them may reject a call, in which
//! case the rejection's status is what the caller sees.

pub mod channel;
pub mod context;
pub mod credentials;
mod error;
pub mod in_process;
pub mod interceptor;
pub mod server;
pub mod tls;

pub use error::{GrpcError, Result};

// Re-export commonly used types at the crate root
pub use channel::{ConnectionConfig, DialOption, GrpcChannel, GrpcChannelBuilder};
pub use context::{CancelHandle, DialContext};
pub use credentials::{ClientCredentials, ServerCredentials};
pub use in_process::{InProcessDialer, InProcessPipe};
pub use interceptor::{
    CallContext, CallOutcome, Interceptor, InterceptorChain, LoggingInterceptor,
    MetadataInterceptor, Next, RecoveryInterceptor,
};
pub use server::{HostConfig, HostListener, ServiceHost, ServiceHostBuilder, ServiceHostState};
pub use tls::{CertPool, Identity, TlsVersion};

pub use tonic;
