#![allow(dead_code)]

use lanshare_core::transfer::{AdaptiveConfig, TransferServer};
use lanshare_core::{AppEvent, Direction, TransferOutcome};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(15);

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// A receiving server on an ephemeral loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

pub fn start_server(download_dir: &Path, event_tx: mpsc::Sender<AppEvent>) -> TestServer {
    let server = bind_server(download_dir);
    spawn_server(server, event_tx)
}

/// Like [`start_server`], with a short idle timeout on incoming connections.
pub fn start_impatient_server(
    download_dir: &Path,
    event_tx: mpsc::Sender<AppEvent>,
    idle_timeout: Duration,
) -> TestServer {
    let server = bind_server(download_dir).with_idle_timeout(idle_timeout);
    spawn_server(server, event_tx)
}

fn bind_server(download_dir: &Path) -> TransferServer {
    TransferServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        download_dir.to_path_buf(),
        AdaptiveConfig::default(),
    )
    .expect("Failed to bind transfer server")
}

fn spawn_server(server: TransferServer, event_tx: mpsc::Sender<AppEvent>) -> TestServer {
    let addr = server.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(server.run(event_tx, cancel.clone()));
    TestServer { addr, cancel, task }
}

/// Wait for the first event matching `pred`, discarding others.
pub async fn wait_for<F>(rx: &mut mpsc::Receiver<AppEvent>, mut pred: F) -> AppEvent
where
    F: FnMut(&AppEvent) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            let event = rx.recv().await.expect("Event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("Timed out waiting for event")
}

/// Collect events until a `TransferFinished` for `direction` arrives.
pub async fn collect_until_finished(
    rx: &mut mpsc::Receiver<AppEvent>,
    direction: Direction,
) -> (Vec<AppEvent>, TransferOutcome) {
    let mut seen = Vec::new();
    let outcome = tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            let event = rx.recv().await.expect("Event channel closed");
            if let AppEvent::TransferFinished {
                direction: d,
                outcome,
                ..
            } = &event
            {
                if *d == direction {
                    return outcome.clone();
                }
            }
            seen.push(event);
        }
    })
    .await
    .expect("Timed out waiting for TransferFinished");
    (seen, outcome)
}

/// Progress samples reported for `direction`, in order.
pub fn progress_of(events: &[AppEvent], direction: Direction) -> Vec<(u64, u64)> {
    events
        .iter()
        .filter_map(|e| match e {
            AppEvent::TransferProgress {
                direction: d,
                bytes_transferred,
                total_bytes,
                ..
            } if *d == direction => Some((*bytes_transferred, *total_bytes)),
            _ => None,
        })
        .collect()
}

/// Deterministic, non-repeating-looking test content.
pub fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).expect("Failed to write test file");
    path
}

pub fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}
