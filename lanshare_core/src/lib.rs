use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod transfer;

pub use config::AppConfig;
pub use discovery::registry::{Peer, PeerRegistry};
pub use error::{ProtocolError, SubsystemError, TransferError, TransferErrorKind};
pub use transfer::session::{Direction, SessionId};
pub use transfer::sender::SendHandle;

use discovery::announcer::Announcer;
use discovery::listener::DiscoveryListener;
use transfer::server::TransferServer;

/// How a transfer session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    /// `file_name` is the name the file was saved under (receiving) or sent as.
    Completed { file_name: String },
    Failed {
        kind: TransferErrorKind,
        message: String,
    },
    Cancelled,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Completed { .. })
    }
}

//Commands from the UI to the core
#[derive(Debug, Clone)]
pub enum AppCommand {
    /// Bind sockets and start discovery and receiving
    Start,
    /// Stop everything, including transfers in flight
    Stop,
    /// Change the announced name and re-announce immediately
    SetDisplayName(String),
    /// Broadcast our presence now
    AnnounceNow,
    /// Send one file to a discovered peer
    SendFile { target_ip: String, file: PathBuf },
    /// Cancel an outgoing transfer
    CancelTransfer { session: SessionId },
}

//Reports from the core to the UI
#[derive(Debug, Clone)]
pub enum AppEvent {
    Status(String),

    PeerFound {
        ip: IpAddr,
        display_name: String,
    },

    TransferStarted {
        session: SessionId,
        direction: Direction,
        file_name: String,
        peer: IpAddr,
        total_bytes: u64,
    },

    TransferProgress {
        session: SessionId,
        direction: Direction,
        file_name: String,
        bytes_transferred: u64,
        total_bytes: u64,
        rate_bps: f64,
        speed: String,
    },

    /// Sent exactly once per session, after its connection is closed.
    TransferFinished {
        session: SessionId,
        direction: Direction,
        peer: IpAddr,
        outcome: TransferOutcome,
    },

    Error(String),
}

/// Deliver an event from a background task unless it is cancelled first.
///
/// A full channel would otherwise keep the task alive past shutdown.
pub(crate) async fn emit(
    event_tx: &mpsc::Sender<AppEvent>,
    cancel: &CancellationToken,
    event: AppEvent,
) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        _ = event_tx.send(event) => {}
    }
}

struct Running {
    announcer: Announcer,
    listener_task: JoinHandle<()>,
    server_task: JoinHandle<()>,
    discovery_addr: SocketAddr,
    transfer_addr: SocketAddr,
}

/// The networking subsystem: discovery, receiving, and outgoing transfers.
pub struct Subsystem {
    config: AppConfig,
    display_name: Arc<RwLock<String>>,
    registry: Arc<PeerRegistry>,
    event_tx: mpsc::Sender<AppEvent>,
    // Parent of every task started by this subsystem; replaced after each stop.
    cancel: CancellationToken,
    running: Option<Running>,
}

impl Subsystem {
    pub fn new(config: AppConfig, event_tx: mpsc::Sender<AppEvent>) -> Self {
        Self::with_registry(config, event_tx, Arc::new(PeerRegistry::new()))
    }

    pub fn with_registry(
        config: AppConfig,
        event_tx: mpsc::Sender<AppEvent>,
        registry: Arc<PeerRegistry>,
    ) -> Self {
        Self {
            display_name: Arc::new(RwLock::new(config.display_name.clone())),
            config,
            registry,
            event_tx,
            cancel: CancellationToken::new(),
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bind the discovery and transfer sockets and start all background tasks.
    ///
    /// A bind failure is fatal and leaves the subsystem stopped.
    pub async fn start(&mut self) -> Result<(), SubsystemError> {
        if self.running.is_some() {
            return Err(SubsystemError::AlreadyRunning);
        }

        // Peers are rebuilt from scratch on every start
        self.registry.clear().await;
        self.registry.refresh_local_address();

        let discovery_addr = SocketAddr::new(self.config.bind_ip, self.config.discovery_port);
        let listener = DiscoveryListener::bind(discovery_addr, self.registry.clone()).map_err(
            |source| SubsystemError::Bind {
                what: "discovery socket",
                addr: discovery_addr,
                source,
            },
        )?;

        let transfer_addr = SocketAddr::new(self.config.bind_ip, self.config.transfer_port);
        let server = TransferServer::bind(
            transfer_addr,
            self.config.download_dir.clone(),
            self.config.adaptive,
        )
        .map_err(|source| SubsystemError::Bind {
            what: "transfer listener",
            addr: transfer_addr,
            source,
        })?
        .with_idle_timeout(self.config.idle_timeout());

        // Report the ports actually bound (matters when configured as 0)
        let discovery_addr = listener.local_addr().unwrap_or(discovery_addr);
        let transfer_addr = server.local_addr().unwrap_or(transfer_addr);

        let listener_task = tokio::spawn(
            listener.run(self.event_tx.clone(), self.cancel.child_token()),
        );
        let server_task = tokio::spawn(server.run(self.event_tx.clone(), self.cancel.child_token()));

        let broadcast_target = SocketAddr::new(self.config.broadcast_ip, discovery_addr.port());
        let announcer = Announcer::start(
            broadcast_target,
            self.config.announce_interval(),
            self.display_name.clone(),
            self.event_tx.clone(),
            self.cancel.child_token(),
        );

        tracing::info!(
            "Subsystem started: discovery on {}, transfers on {}",
            discovery_addr,
            transfer_addr
        );
        let _ = self.event_tx.try_send(AppEvent::Status(format!(
            "Listening for peers on UDP {} and transfers on TCP {}",
            discovery_addr.port(),
            transfer_addr.port()
        )));

        self.running = Some(Running {
            announcer,
            listener_task,
            server_task,
            discovery_addr,
            transfer_addr,
        });
        Ok(())
    }

    /// Stop discovery and receiving and cancel every transfer in flight.
    ///
    /// Safe to call when already stopped.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        if let Some(running) = self.running.take() {
            running.announcer.stop().await;
            if let Err(e) = running.listener_task.await {
                tracing::warn!("Discovery listener ended abnormally: {}", e);
            }
            if let Err(e) = running.server_task.await {
                tracing::warn!("Transfer server ended abnormally: {}", e);
            }
            tracing::info!("Subsystem stopped");
            // Never wait on a collaborator that stopped draining events
            let _ = self.event_tx.try_send(AppEvent::Status("Stopped.".to_string()));
        }

        self.cancel = CancellationToken::new();
    }

    pub async fn display_name(&self) -> String {
        self.display_name.read().await.clone()
    }

    /// Takes effect on the next announcement, which is sent right away when running.
    pub async fn set_display_name(&self, name: impl Into<String>) {
        *self.display_name.write().await = name.into();
        self.announce_now();
    }

    pub fn announce_now(&self) {
        if let Some(running) = &self.running {
            running.announcer.announce_now();
        }
    }

    /// Send `file` to `peer` on the configured transfer port.
    pub fn send_file(&self, file: PathBuf, peer: IpAddr) -> SendHandle {
        self.send_file_to(file, SocketAddr::new(peer, self.config.transfer_port))
    }

    pub fn send_file_to(&self, file: PathBuf, target: SocketAddr) -> SendHandle {
        transfer::sender::spawn_send(
            file,
            target,
            self.config.adaptive,
            self.event_tx.clone(),
            self.cancel.child_token(),
        )
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.registry.snapshot().await
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.registry.clone()
    }

    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.discovery_addr)
    }

    pub fn transfer_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.transfer_addr)
    }
}

/// Drive a [`Subsystem`] from a command channel until the channel closes.
pub async fn run_backend(
    config: AppConfig,
    mut cmd_rx: mpsc::Receiver<AppCommand>,
    event_tx: mpsc::Sender<AppEvent>,
) {
    let mut subsystem = Subsystem::new(config, event_tx.clone());
    let mut outgoing: HashMap<SessionId, SendHandle> = HashMap::new();

    while let Some(cmd) = cmd_rx.recv().await {
        outgoing.retain(|_, handle| !handle.is_finished());

        match cmd {
            AppCommand::Start => {
                if let Err(e) = subsystem.start().await {
                    tracing::error!("Failed to start: {}", e);
                    let _ = event_tx.send(AppEvent::Error(e.to_string())).await;
                }
            }
            AppCommand::Stop => {
                subsystem.stop().await;
                outgoing.clear();
            }
            AppCommand::SetDisplayName(name) => {
                subsystem.set_display_name(name).await;
            }
            AppCommand::AnnounceNow => {
                subsystem.announce_now();
            }
            AppCommand::SendFile { target_ip, file } => {
                let ip: IpAddr = match target_ip.parse() {
                    Ok(ip) => ip,
                    Err(e) => {
                        let _ = event_tx
                            .send(AppEvent::Error(format!(
                                "Invalid address {}: {}",
                                target_ip, e
                            )))
                            .await;
                        continue;
                    }
                };
                tracing::info!("Sending {} to {}", file.display(), ip);
                let handle = subsystem.send_file(file, ip);
                outgoing.insert(handle.id(), handle);
            }
            AppCommand::CancelTransfer { session } => match outgoing.remove(&session) {
                Some(handle) => handle.cancel(),
                None => {
                    let _ = event_tx
                        .send(AppEvent::Error(format!(
                            "No active transfer with id {}",
                            session
                        )))
                        .await;
                }
            },
        }
    }

    subsystem.stop().await;
}
