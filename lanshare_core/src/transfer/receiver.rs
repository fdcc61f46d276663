use crate::error::TransferError;
use crate::protocol::decode_header;
use crate::{AppEvent, TransferOutcome};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::adaptive::AdaptiveConfig;
use super::session::{Direction, TransferSession};
use super::utils::{create_destination, report_progress, sanitize_file_name, unique_save_path};

/// Buffer for header parsing. Body reads of at least this size bypass it.
const HEADER_BUFFER_SIZE: usize = 64 * 1024;

/// Receive a single file from an accepted connection into `download_dir`.
///
/// Emits `TransferStarted` once the header is parsed, progress while the body
/// arrives, and exactly one `TransferFinished` after the connection is closed.
/// A partially written file is removed on failure.
pub async fn receive_file(
    stream: TcpStream,
    peer_addr: SocketAddr,
    download_dir: &Path,
    adaptive: AdaptiveConfig,
    idle_timeout: Duration,
    event_tx: &mpsc::Sender<AppEvent>,
    cancel: CancellationToken,
) -> TransferOutcome {
    let mut session = TransferSession::new(Direction::Receiving, peer_addr.ip(), adaptive);
    let mut saved_path: Option<PathBuf> = None;

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        res = receive(
            &mut session,
            stream,
            download_dir,
            idle_timeout,
            event_tx,
            &mut saved_path,
        ) => res,
    };

    let outcome = match result {
        Ok(file_name) => {
            session.complete();
            tracing::info!(
                "Received {} ({} bytes) from {}",
                file_name,
                session.transferred_bytes(),
                peer_addr
            );
            TransferOutcome::Completed { file_name }
        }
        Err(e) => {
            if let Some(path) = saved_path.take() {
                if let Err(rm) = tokio::fs::remove_file(&path).await {
                    tracing::warn!("Could not remove partial file {:?}: {}", path, rm);
                }
            }
            if matches!(e, TransferError::Cancelled) {
                session.cancel();
                tracing::info!("Reception from {} cancelled", peer_addr);
                TransferOutcome::Cancelled
            } else {
                session.fail();
                tracing::error!("Receiving from {} failed: {}", peer_addr, e);
                TransferOutcome::Failed {
                    kind: e.kind(),
                    message: format!("Error receiving file from {}: {}", peer_addr.ip(), e),
                }
            }
        }
    };

    let _ = event_tx
        .send(AppEvent::TransferFinished {
            session: session.id,
            direction: Direction::Receiving,
            peer: peer_addr.ip(),
            outcome: outcome.clone(),
        })
        .await;

    outcome
}

async fn receive(
    session: &mut TransferSession,
    stream: TcpStream,
    download_dir: &Path,
    idle_timeout: Duration,
    event_tx: &mpsc::Sender<AppEvent>,
    saved_path: &mut Option<PathBuf>,
) -> Result<String, TransferError> {
    let mut reader = BufReader::with_capacity(HEADER_BUFFER_SIZE, stream);

    let header = with_read_timeout(idle_timeout, decode_header(&mut reader)).await?;
    let file_name = sanitize_file_name(&header.file_name);

    session.activate(header.file_size);
    let _ = event_tx
        .send(AppEvent::TransferStarted {
            session: session.id,
            direction: Direction::Receiving,
            file_name: file_name.clone(),
            peer: session.peer,
            total_bytes: header.file_size,
        })
        .await;

    tokio::fs::create_dir_all(download_dir).await?;
    let path = unique_save_path(download_dir, &file_name);
    let mut file = create_destination(&path).await?;
    *saved_path = Some(path.clone());

    let saved_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.clone());
    tracing::info!(
        "Receiving {} ({} bytes) from {} into {:?}",
        file_name,
        header.file_size,
        session.peer,
        path
    );

    let mut buffer = vec![0u8; session.max_chunk()];
    while !session.is_done() {
        let len = session.next_chunk_len();
        let n = with_read_timeout(idle_timeout, async {
            reader
                .read(&mut buffer[..len])
                .await
                .map_err(TransferError::from)
        })
        .await?;
        if n == 0 {
            return Err(TransferError::PrematureClose {
                received: session.transferred_bytes(),
                expected: session.total_bytes(),
            });
        }
        file.write_all(&buffer[..n]).await?;

        if let Some(progress) = session.record(n) {
            report_progress(event_tx, session, &file_name, progress).await;
        }
    }

    file.flush().await?;
    drop(file);

    if let Some(progress) = session.final_progress() {
        report_progress(event_tx, session, &file_name, progress).await;
    }

    Ok(saved_name)
}

/// Bound a single read on the connection by the idle timeout.
async fn with_read_timeout<T, F>(idle_timeout: Duration, fut: F) -> Result<T, TransferError>
where
    F: Future<Output = Result<T, TransferError>>,
{
    match timeout(idle_timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(TransferError::ReadTimeout(idle_timeout)),
    }
}
