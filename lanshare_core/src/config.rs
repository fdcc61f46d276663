use crate::discovery::{ANNOUNCE_INTERVAL_SECS, DISCOVERY_PORT};
use crate::transfer::adaptive::AdaptiveConfig;
use crate::transfer::TRANSFER_PORT;
use crate::transfer::constants::IO_TIMEOUT;
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "lanshare";
const APP_NAME: &str = "lanshare";
const CONFIG_FILE: &str = "config.json";

/// Overrides the directory `config.json` is read from.
pub const CONFIG_DIR_ENV: &str = "LANSHARE_CONFIG_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Name shown to other devices
    pub display_name: String,
    /// Where received files are saved
    pub download_dir: PathBuf,
    pub discovery_port: u16,
    pub transfer_port: u16,
    pub announce_interval_secs: u64,
    /// Local address the listening sockets bind to
    pub bind_ip: IpAddr,
    /// Destination address for announcements
    pub broadcast_ip: IpAddr,
    /// Seconds an incoming connection may stay silent
    pub idle_timeout_secs: u64,
    pub adaptive: AdaptiveConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            download_dir: get_download_dir(),
            discovery_port: DISCOVERY_PORT,
            transfer_port: TRANSFER_PORT,
            announce_interval_secs: ANNOUNCE_INTERVAL_SECS,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_ip: IpAddr::V4(Ipv4Addr::BROADCAST),
            idle_timeout_secs: IO_TIMEOUT.as_secs(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

impl AppConfig {
    fn get_config_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            return Some(PathBuf::from(dir).join(CONFIG_FILE));
        }
        get_config_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    /// Load config from disk, falling back to defaults for anything missing
    pub fn load() -> Self {
        let path = match Self::get_config_path() {
            Some(p) => p,
            None => return Self::default(),
        };

        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Ignoring invalid config {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }
}

/// Config directory for this app
pub fn get_config_dir() -> Option<PathBuf> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// The user's Downloads folder, or `~/Downloads` when the platform has none
pub fn get_download_dir() -> PathBuf {
    UserDirs::new()
        .map(|dirs| {
            dirs.download_dir()
                .map(|d| d.to_path_buf())
                .unwrap_or_else(|| dirs.home_dir().join("Downloads"))
        })
        .unwrap_or_else(|| PathBuf::from("Downloads"))
}

pub fn default_display_name() -> String {
    hostname::get()
        .ok()
        .and_then(|s| s.into_string().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Unknown-PC".to_string())
}
