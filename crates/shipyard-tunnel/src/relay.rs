//! Loopback listener in front of the tunnel
//!
//! The Docker client dials by address, so each connection accepted on
//! `127.0.0.1:<ephemeral>` is paired with a freshly dialed tunnel stream.

use crate::connection::Dialer;
use crate::error::{Result, TunnelError};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Pause after a failed accept (fd exhaustion and the like) before retrying
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct TunnelRelay {
    addr: SocketAddr,
    dialer: Arc<dyn Dialer>,
    last_error: Arc<Mutex<Option<String>>>,
    shutdown: CancellationToken,
}

impl TunnelRelay {
    /// Bind the listener and start accepting. The relay stops when `cancel`
    /// fires or the relay is dropped.
    pub async fn start(dialer: Arc<dyn Dialer>, cancel: &CancellationToken) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let shutdown = cancel.child_token();
        let last_error = Arc::new(Mutex::new(None));

        tracing::debug!("Tunnel relay listening on {}", addr);

        tokio::spawn(accept_loop(
            listener,
            dialer.clone(),
            last_error.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            addr,
            dialer,
            last_error,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address in the form the Docker client expects
    pub fn docker_host(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    /// Most recent reason the tunnel could not be opened, if any.
    /// A rejected credential is sticky; other failures are consumed.
    pub fn take_failure(&self) -> Option<TunnelError> {
        if self.dialer.credential_rejected() {
            return Some(TunnelError::Unauthorized);
        }

        self.last_error
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .map(TunnelError::Connection)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TunnelRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for TunnelRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRelay").field("addr", &self.addr).finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    dialer: Arc<dyn Dialer>,
    last_error: Arc<Mutex<Option<String>>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    tracing::debug!("Relay accepted connection from {}", peer);
                    tokio::spawn(serve(
                        socket,
                        dialer.clone(),
                        last_error.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!("Tunnel relay accept failed: {}", e);
                    if !pause_after_accept_error(&shutdown).await {
                        break;
                    }
                }
            },
        }
    }

    tracing::debug!("Tunnel relay stopped");
}

/// Wait before the next accept. False when shutdown fired meanwhile.
async fn pause_after_accept_error(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => true,
    }
}

async fn serve(
    mut socket: TcpStream,
    dialer: Arc<dyn Dialer>,
    last_error: Arc<Mutex<Option<String>>>,
    shutdown: CancellationToken,
) {
    let mut conn = match dialer.dial().await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::debug!("Tunnel dial failed: {}", e);
            if let Ok(mut guard) = last_error.lock() {
                *guard = Some(e.to_string());
            }
            return;
        }
    };

    tokio::select! {
        _ = shutdown.cancelled() => {}
        copied = tokio::io::copy_bidirectional(&mut socket, &mut conn) => match copied {
            Ok((up, down)) => tracing::debug!("Tunnel stream closed ({} bytes up, {} bytes down)", up, down),
            Err(e) => tracing::debug!("Tunnel stream ended with error: {}", e),
        },
    }

    if let Err(e) = conn.close().await {
        tracing::debug!("Error closing tunnel stream: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TunnelStream;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[async_trait]
    impl TunnelStream for DuplexStream {
        async fn close(mut self: Box<Self>) -> std::io::Result<()> {
            self.shutdown().await
        }
    }

    /// Dials an in-memory echo peer
    struct EchoDialer {
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for EchoDialer {
        async fn dial(&self) -> Result<Box<dyn TunnelStream>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (local, mut remote) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                while let Ok(n) = remote.read(&mut buf).await {
                    if n == 0 || remote.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Box::new(local))
        }
    }

    struct RejectingDialer {
        rejected: AtomicBool,
    }

    #[async_trait]
    impl Dialer for RejectingDialer {
        async fn dial(&self) -> Result<Box<dyn TunnelStream>> {
            self.rejected.store(true, Ordering::SeqCst);
            Err(TunnelError::Unauthorized)
        }

        fn credential_rejected(&self) -> bool {
            self.rejected.load(Ordering::SeqCst)
        }
    }

    struct RefusingDialer;

    #[async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self) -> Result<Box<dyn TunnelStream>> {
            Err(TunnelError::Connection("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_relay_pipes_bytes_through_dialed_stream() {
        let dialer = Arc::new(EchoDialer {
            dials: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let relay = TunnelRelay::start(dialer.clone(), &cancel).await.unwrap();
        assert!(relay.docker_host().starts_with("tcp://127.0.0.1:"));

        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        assert!(relay.take_failure().is_none());
    }

    #[tokio::test]
    async fn test_relay_reports_rejected_credential() {
        let dialer = Arc::new(RejectingDialer {
            rejected: AtomicBool::new(false),
        });
        let cancel = CancellationToken::new();
        let relay = TunnelRelay::start(dialer, &cancel).await.unwrap();

        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        // relay drops the socket after the failed dial
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        assert!(matches!(relay.take_failure(), Some(TunnelError::Unauthorized)));
        // sticky
        assert!(matches!(relay.take_failure(), Some(TunnelError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_relay_connection_failure_is_consumed() {
        let cancel = CancellationToken::new();
        let relay = TunnelRelay::start(Arc::new(RefusingDialer), &cancel)
            .await
            .unwrap();

        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        let _ = client.read(&mut buf).await;

        let failure = relay.take_failure();
        assert!(matches!(failure, Some(TunnelError::Connection(ref m)) if m.contains("refused")));
        assert!(relay.take_failure().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_errors_are_spaced_out() {
        let shutdown = CancellationToken::new();

        let started = tokio::time::Instant::now();
        assert!(pause_after_accept_error(&shutdown).await);
        assert!(started.elapsed() >= ACCEPT_RETRY_DELAY);

        shutdown.cancel();
        let started = tokio::time::Instant::now();
        assert!(!pause_after_accept_error(&shutdown).await);
        assert!(started.elapsed() < ACCEPT_RETRY_DELAY);
    }

    #[tokio::test]
    async fn test_relay_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let relay = TunnelRelay::start(Arc::new(RefusingDialer), &cancel)
            .await
            .unwrap();
        let addr = relay.local_addr();

        cancel.cancel();
        // give the accept loop a chance to observe cancellation and drop the listener
        for _ in 0..50 {
            if TcpStream::connect(addr).await.is_err() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("relay still accepting after cancellation");
    }
}
