use crate::AppEvent;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::adaptive::AdaptiveConfig;
use super::constants::{IO_TIMEOUT, SHUTDOWN_GRACE, SOCKET_BUFFER_SIZE};
use super::receiver::receive_file;
use super::utils::tune_accepted_stream;

const LISTEN_BACKLOG: u32 = 1024;

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts incoming transfers, one task per connection.
pub struct TransferServer {
    listener: TcpListener,
    download_dir: Arc<PathBuf>,
    adaptive: AdaptiveConfig,
    idle_timeout: Duration,
}

impl TransferServer {
    /// Bind and listen with address reuse. Must be called from within a tokio runtime.
    pub fn bind(
        addr: SocketAddr,
        download_dir: PathBuf,
        adaptive: AdaptiveConfig,
    ) -> std::io::Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        Ok(Self {
            listener,
            download_dir: Arc::new(download_dir),
            adaptive,
            idle_timeout: IO_TIMEOUT,
        })
    }

    /// How long a connection may stay silent before its handler gives up.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until cancelled. Each connection is handled on its
    /// own task; a failing connection never stops the loop.
    ///
    /// On cancellation the listener is closed, handlers are told to abort,
    /// and handlers still running after the grace period are left behind.
    pub async fn run(self, event_tx: mpsc::Sender<AppEvent>, cancel: CancellationToken) {
        let TransferServer {
            listener,
            download_dir,
            adaptive,
            idle_timeout,
        } = self;
        let tracker = TaskTracker::new();

        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = listener.accept() => res,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    tracing::debug!("Accepted transfer connection from {}", peer_addr);
                    tune_accepted_stream(&stream, SOCKET_BUFFER_SIZE);

                    let event_tx = event_tx.clone();
                    let download_dir = download_dir.clone();
                    let handler_cancel = cancel.child_token();
                    tracker.spawn(async move {
                        receive_file(
                            stream,
                            peer_addr,
                            &download_dir,
                            adaptive,
                            idle_timeout,
                            &event_tx,
                            handler_cancel,
                        )
                        .await;
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        drop(listener);
        tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait()).await.is_err() {
            tracing::warn!(
                "{} receive handler(s) still running after {:?}, continuing shutdown",
                tracker.len(),
                SHUTDOWN_GRACE
            );
        }
        tracing::debug!("Transfer server stopped");
    }
}
