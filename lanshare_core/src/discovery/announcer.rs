use super::announce_ip;
use crate::{AppEvent, emit};
use crate::protocol::encode_announcement;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Periodically broadcasts our presence. One recurring task, cancelled as a unit.
pub struct Announcer {
    trigger: Arc<Notify>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Announcer {
    /// Start announcing to `target` every `interval`, beginning immediately.
    pub fn start(
        target: SocketAddr,
        interval: Duration,
        display_name: Arc<RwLock<String>>,
        event_tx: mpsc::Sender<AppEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let trigger = Arc::new(Notify::new());
        let task_trigger = trigger.clone();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    // Out-of-band sends leave the ticker untouched
                    _ = task_trigger.notified() => {}
                }

                let name = display_name.read().await.clone();
                if let Err(e) = send_announcement(target, &name).await {
                    tracing::warn!("Broadcast to {} failed: {}", target, e);
                    let status = AppEvent::Status(format!("Broadcast failed: {}", e));
                    emit(&event_tx, &task_cancel, status).await;
                }
            }
            tracing::debug!("Announcer stopped");
        });

        Self {
            trigger,
            cancel,
            handle,
        }
    }

    /// Send one announcement right away.
    pub fn announce_now(&self) {
        self.trigger.notify_one();
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!("Announcer task ended abnormally: {}", e);
        }
    }
}

/// Send a single announcement datagram from a throwaway socket.
pub async fn send_announcement(target: SocketAddr, display_name: &str) -> std::io::Result<()> {
    let bind_addr = match target {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.set_broadcast(true)?;

    let packet = encode_announcement(display_name, announce_ip());
    socket.send_to(&packet, target).await?;
    tracing::trace!("Announced {:?} to {}", display_name, target);
    Ok(())
}
