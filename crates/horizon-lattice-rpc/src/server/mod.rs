//! Service hosts: credentials, interceptors, registration and lifecycle.
//!
//! A [`ServiceHostBuilder`] produces a [`ServiceHost`]. Services are attached
//! through tonic's [`RoutesBuilder`](tonic::service::RoutesBuilder), then the
//! host is started on a TCP port or an [`InProcessPipe`](crate::in_process::InProcessPipe).
//!
//! # TCP Example
//!
//! ```ignore
//! use horizon_lattice_rpc::server::ServiceHostBuilder;
//! use horizon_lattice_rpc::tls::Identity;
//!
//! let identity = Identity::from_pem_files("server.pem", "server.key")?;
//! let mut host = ServiceHostBuilder::new().tls_identity(identity).build()?;
//! host.register_service(|routes| {
//!     routes.add_service(GreeterServer::new(MyGreeter));
//! })?;
//! host.start("localhost", 8989).await?;
//!
//! // ...
//!
//! host.cleanup().await;
//! ```
//!
//! # In-Process Example
//!
//! ```ignore
//! let pipe = InProcessPipe::new();
//! let mut host = ServiceHostBuilder::new().build()?;
//! host.register_service(|routes| {
//!     routes.add_service(GreeterServer::new(MyGreeter));
//! })?;
//! host.start_in_process(&pipe)?;
//! ```

mod config;
mod conn;
mod host;
mod state;

pub use config::{HostConfig, ServiceHostBuilder, DEFAULT_GRACE_PERIOD};
pub use host::{HostListener, ServiceHost};
pub use state::ServiceHostState;
