//! Accepted connections that can be cut off when a host stops.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;
use tonic::transport::server::Connected;

/// An accepted connection that fails its IO once the host severs it.
///
/// Graceful shutdown lets calls drain on their own; severing is what ends
/// the connections still open when the grace period runs out.
pub(crate) struct SeverableConn<IO> {
    inner: IO,
    severed: Option<BoxFuture<'static, ()>>,
}

impl<IO> SeverableConn<IO> {
    pub(crate) fn new(inner: IO, mut signal: watch::Receiver<bool>) -> Self {
        let severed = async move {
            // A host dropped without cleanup leaves its connections to drain.
            let host_dropped = signal.wait_for(|severed| *severed).await.is_err();
            if host_dropped {
                std::future::pending::<()>().await;
            }
        };
        Self {
            inner,
            severed: Some(severed.boxed()),
        }
    }

    /// Poll the sever signal, registering the task's waker with it.
    fn check(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if let Some(severed) = self.severed.as_mut() {
            if severed.poll_unpin(cx).is_pending() {
                return Ok(());
            }
            self.severed = None;
        }
        Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "connection severed by host shutdown",
        ))
    }
}

impl<IO: AsyncRead + Unpin> AsyncRead for SeverableConn<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check(cx)?;
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for SeverableConn<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check(cx)?;
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check(cx)?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<IO: Connected> Connected for SeverableConn<IO> {
    type ConnectInfo = IO::ConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.inner.connect_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_passes_io_until_severed() {
        let (client, server) = tokio::io::duplex(64);
        let (sever, signal) = watch::channel(false);
        let mut conn = SeverableConn::new(server, signal);
        let mut client = client;

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        conn.write_all(b"pong").await.unwrap();

        sever.send_replace(true);
        let err = conn.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_sever_wakes_blocked_read() {
        let (_client, server) = tokio::io::duplex(64);
        let (sever, signal) = watch::channel(false);
        let mut conn = SeverableConn::new(server, signal);

        let read = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            conn.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        sever.send_replace(true);

        let result = tokio::time::timeout(Duration::from_secs(1), read)
            .await
            .expect("read should be woken by the sever signal")
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
    }
}
