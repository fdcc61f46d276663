use super::{UNKNOWN_PEER_NAME, outbound_ip};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// How long a detected local address is trusted before asking the OS again.
const LOCAL_ADDRESS_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub address: IpAddr,
    pub display_name: String,
    pub last_seen: Instant,
}

impl Peer {
    /// Time since the last announcement from this peer
    pub fn age(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

#[derive(Debug, Clone, Copy)]
struct Detected {
    ip: Option<IpAddr>,
    at: Instant,
}

/// How the registry recognises our own announcements.
#[derive(Debug)]
enum LocalAddress {
    /// Ask the OS through `detect`, reusing the answer for `LOCAL_ADDRESS_TTL`
    Detect {
        detect: fn() -> Option<IpAddr>,
        cached: Mutex<Option<Detected>>,
    },
    /// Fixed answer; `None` accepts everything
    Fixed(Option<IpAddr>),
}

/// Peers seen on the network, in order of first appearance.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: RwLock<Vec<Peer>>,
    local: LocalAddress,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::with_detector(outbound_ip)
    }

    /// Registry that treats `local` as our own address instead of detecting it.
    pub fn with_local_address(local: Option<IpAddr>) -> Self {
        Self {
            peers: RwLock::new(Vec::new()),
            local: LocalAddress::Fixed(local),
        }
    }

    fn with_detector(detect: fn() -> Option<IpAddr>) -> Self {
        Self {
            peers: RwLock::new(Vec::new()),
            local: LocalAddress::Detect {
                detect,
                cached: Mutex::new(None),
            },
        }
    }

    /// Detect the local address now instead of on the next check.
    /// Called on start, since the network may have changed while stopped.
    pub fn refresh_local_address(&self) {
        if let LocalAddress::Detect { detect, cached } = &self.local {
            let ip = detect();
            tracing::debug!("Local address for self filtering: {:?}", ip);
            *cached.lock().unwrap_or_else(|e| e.into_inner()) = Some(Detected {
                ip,
                at: Instant::now(),
            });
        }
    }

    fn local_address(&self) -> Option<IpAddr> {
        match &self.local {
            LocalAddress::Fixed(local) => *local,
            LocalAddress::Detect { detect, cached } => {
                let mut cached = cached.lock().unwrap_or_else(|e| e.into_inner());
                match *cached {
                    Some(found) if found.at.elapsed() < LOCAL_ADDRESS_TTL => found.ip,
                    _ => {
                        let ip = detect();
                        *cached = Some(Detected {
                            ip,
                            at: Instant::now(),
                        });
                        ip
                    }
                }
            }
        }
    }

    /// Whether `ip` is this device. Without a network route nothing counts as
    /// local, so every announcement is accepted.
    pub fn is_local_address(&self, ip: IpAddr) -> bool {
        self.local_address() == Some(ip)
    }

    /// Record an announcement. Returns the stored peer, or `None` when the
    /// announcement came from this device.
    ///
    /// A known peer keeps its name unless the new one is non-empty.
    pub async fn upsert(&self, ip: IpAddr, display_name: Option<&str>) -> Option<Peer> {
        if self.is_local_address(ip) {
            return None;
        }

        let name = display_name.map(str::trim).filter(|n| !n.is_empty());
        let now = Instant::now();
        let mut peers = self.peers.write().await;

        if let Some(peer) = peers.iter_mut().find(|p| p.address == ip) {
            if let Some(name) = name {
                if peer.display_name != name {
                    tracing::debug!("Peer {} renamed {} -> {}", ip, peer.display_name, name);
                    peer.display_name = name.to_string();
                }
            }
            peer.last_seen = now;
            return Some(peer.clone());
        }

        let peer = Peer {
            address: ip,
            display_name: name.unwrap_or(UNKNOWN_PEER_NAME).to_string(),
            last_seen: now,
        };
        tracing::info!("New peer {} ({})", peer.display_name, ip);
        peers.push(peer.clone());
        Some(peer)
    }

    pub async fn snapshot(&self) -> Vec<Peer> {
        self.peers.read().await.clone()
    }

    pub async fn get(&self, ip: IpAddr) -> Option<Peer> {
        self.peers.read().await.iter().find(|p| p.address == ip).cloned()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.peers.write().await.clear();
    }
}
