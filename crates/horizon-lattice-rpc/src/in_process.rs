//! In-memory transport pairing a service host with channels, no socket involved.
//!
//! An [`InProcessPipe`] is an explicit handle: hand it to
//! [`ServiceHost::start_in_process`](crate::server::ServiceHost::start_in_process)
//! on the server side and install its [`InProcessDialer`] on a channel
//! builder. Each dial creates a fresh in-memory duplex stream whose server
//! half is delivered to the host's accept loop.
//!
//! ```ignore
//! let pipe = InProcessPipe::new();
//! host.start_in_process(&pipe)?;
//!
//! let channel = GrpcChannel::builder()
//!     .insecure()
//!     .in_process(&pipe)
//!     .connect("bufnet")
//!     .await?;
//! ```
//!
//! A dial completes only once the host has accepted the connection. Once the
//! pipe is closed, pending and future dials fail instead of waiting.

use std::io;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot, watch};

const TARGET: &str = "horizon_lattice_rpc::in_process";

/// Default per-direction buffer of each in-memory connection (1 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Connections queued for the host's accept loop before dialers wait for a slot.
const ACCEPT_BACKLOG: usize = 64;

/// Stream of server-side connection halves consumed by the host's accept loop.
pub(crate) type Incoming = Pin<Box<dyn Stream<Item = io::Result<DuplexStream>> + Send>>;

/// A dialed connection waiting for the host, with the dialer's acknowledgement.
struct PendingConn {
    stream: DuplexStream,
    accepted: oneshot::Sender<()>,
}

struct Shared {
    buffer_size: usize,
    tx: mpsc::Sender<PendingConn>,
    rx: Mutex<Option<mpsc::Receiver<PendingConn>>>,
    closed: watch::Sender<bool>,
}

/// A paired in-memory listener and dialer.
///
/// Cloning yields another handle to the same pipe.
#[derive(Clone)]
pub struct InProcessPipe {
    shared: Arc<Shared>,
}

impl Default for InProcessPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessPipe {
    /// Create a pipe with the default buffer size.
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// Create a pipe whose connections buffer `buffer_size` bytes per direction.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (closed, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                buffer_size,
                tx,
                rx: Mutex::new(Some(rx)),
                closed,
            }),
        }
    }

    /// The dialer half, to be installed on a channel builder.
    pub fn dialer(&self) -> InProcessDialer {
        InProcessDialer {
            shared: self.shared.clone(),
        }
    }

    /// Per-direction buffer size of each connection.
    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    /// Close the listener side. Idempotent.
    ///
    /// The host stops accepting, queued connections are dropped, and every
    /// pending or future dial fails with `ConnectionRefused`.
    pub fn close(&self) {
        // Queued connections of a host that never started listening.
        self.shared.rx.lock().take();
        if !self.shared.closed.send_replace(true) {
            tracing::debug!(target: TARGET, "in-process listener closed");
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Take the accept stream. A pipe can be listened on once.
    pub(crate) fn incoming(&self) -> Option<Incoming> {
        let rx = self.shared.rx.lock().take()?;
        let closed = self.shared.closed.subscribe();

        let stream = futures_util::stream::unfold((rx, closed), |(mut rx, mut closed)| async move {
            loop {
                if *closed.borrow() {
                    return None;
                }
                let pending = tokio::select! {
                    pending = rx.recv() => pending?,
                    _ = async { closed.wait_for(|closed| *closed).await.is_ok() } => return None,
                };
                if pending.accepted.send(()).is_ok() {
                    return Some((Ok::<_, io::Error>(pending.stream), (rx, closed)));
                }
                // The dialer gave up before the host got to it.
                tracing::trace!(target: TARGET, "skipping abandoned in-process connection");
            }
        });
        Some(Box::pin(stream))
    }
}

impl std::fmt::Debug for InProcessPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessPipe")
            .field("buffer_size", &self.shared.buffer_size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Connects to the paired listener of an [`InProcessPipe`].
#[derive(Clone)]
pub struct InProcessDialer {
    shared: Arc<Shared>,
}

impl InProcessDialer {
    /// Open a new in-memory connection to the listener.
    ///
    /// Waits until the host accepts the connection. Fails with
    /// `ConnectionRefused` if the pipe is closed first, or if the host
    /// stops listening with the connection still queued.
    pub async fn dial(&self) -> io::Result<DuplexStream> {
        let refused = || io::Error::new(io::ErrorKind::ConnectionRefused, "in-process listener is closed");

        let mut closed = self.shared.closed.subscribe();
        if *closed.borrow() {
            return Err(refused());
        }

        let (client, server) = tokio::io::duplex(self.shared.buffer_size);
        let (accepted, ack) = oneshot::channel();
        let pending = PendingConn {
            stream: server,
            accepted,
        };
        let tx = &self.shared.tx;
        let queued = async move {
            tx.send(pending).await.map_err(|_| refused())?;
            ack.await.map_err(|_| refused())
        };
        tokio::select! {
            result = queued => result?,
            _ = async { closed.wait_for(|closed| *closed).await.is_ok() } => return Err(refused()),
        }

        tracing::trace!(target: TARGET, "in-process connection accepted");
        Ok(client)
    }

    /// Whether the paired listener has been closed.
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }
}

impl std::fmt::Debug for InProcessDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessDialer")
            .field("closed", &self.is_closed())
            .finish()
    }
}
