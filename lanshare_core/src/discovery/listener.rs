use super::bind_discovery_socket;
use super::registry::PeerRegistry;
use crate::{AppEvent, emit};
use crate::protocol::decode_announcement;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Upper bound on a single wait for a datagram, so shutdown is never stuck
/// behind a quiet network.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

const MAX_DATAGRAM: usize = 2048;

pub struct DiscoveryListener {
    socket: UdpSocket,
    registry: Arc<PeerRegistry>,
}

impl DiscoveryListener {
    pub fn bind(addr: SocketAddr, registry: Arc<PeerRegistry>) -> std::io::Result<Self> {
        let socket = bind_discovery_socket(addr)?;
        Ok(Self { socket, registry })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive announcements until cancelled or the socket fails.
    /// The socket is closed when this returns.
    pub async fn run(self, event_tx: mpsc::Sender<AppEvent>, cancel: CancellationToken) {
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = tokio::time::timeout(POLL_INTERVAL, self.socket.recv_from(&mut buf)) => res,
            };

            match received {
                // Poll interval elapsed with nothing to read
                Err(_) => continue,
                Ok(Ok((len, src))) => {
                    self.handle_datagram(&buf[..len], src, &event_tx, &cancel).await;
                }
                // ICMP port-unreachable surfaces here on some platforms
                Ok(Err(e)) if e.kind() == ErrorKind::ConnectionReset => continue,
                Ok(Err(e)) => {
                    tracing::error!("Discovery socket error: {}", e);
                    emit(
                        &event_tx,
                        &cancel,
                        AppEvent::Error(format!("Discovery stopped: {}", e)),
                    )
                    .await;
                    break;
                }
            }
        }

        tracing::debug!("Discovery listener stopped");
    }

    async fn handle_datagram(
        &self,
        datagram: &[u8],
        src: SocketAddr,
        event_tx: &mpsc::Sender<AppEvent>,
        cancel: &CancellationToken,
    ) {
        let msg = match decode_announcement(datagram) {
            Ok(msg) => msg,
            // Not ours, ignore silently
            Err(_) => return,
        };

        let ip = msg
            .origin_ip
            .as_deref()
            .and_then(|s| s.parse::<IpAddr>().ok())
            .unwrap_or(src.ip());

        if let Some(peer) = self.registry.upsert(ip, msg.display_name.as_deref()).await {
            let found = AppEvent::PeerFound {
                ip: peer.address,
                display_name: peer.display_name,
            };
            emit(event_tx, cancel, found).await;
        }
    }
}
