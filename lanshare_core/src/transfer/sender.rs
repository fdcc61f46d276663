use crate::error::TransferError;
use crate::protocol::encode_header;
use crate::{AppEvent, TransferErrorKind, TransferOutcome};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::adaptive::AdaptiveConfig;
use super::constants::{CONNECT_TIMEOUT, IO_TIMEOUT, SOCKET_BUFFER_SIZE};
use super::session::{Direction, SessionId, TransferSession};
use super::utils::{report_progress, sanitize_file_name};

/// A running outgoing transfer.
pub struct SendHandle {
    id: SessionId,
    cancel: CancellationToken,
    task: JoinHandle<TransferOutcome>,
}

impl SendHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Close the connection and stop sending.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the transfer to end.
    pub async fn wait(self) -> TransferOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => TransferOutcome::Failed {
                kind: TransferErrorKind::Io,
                message: format!("send task failed: {}", e),
            },
        }
    }
}

/// Spawn [`send_file`] on its own task.
pub fn spawn_send(
    file_path: PathBuf,
    target_addr: SocketAddr,
    adaptive: AdaptiveConfig,
    event_tx: mpsc::Sender<AppEvent>,
    cancel: CancellationToken,
) -> SendHandle {
    let session = TransferSession::new(Direction::Sending, target_addr.ip(), adaptive);
    let id = session.id;
    let task_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        send_file(session, &file_path, target_addr, &event_tx, task_cancel).await
    });
    SendHandle { id, cancel, task }
}

/// Send one file to `target_addr`.
///
/// Always ends with exactly one `TransferFinished` event, emitted after the
/// connection has been closed.
pub async fn send_file(
    mut session: TransferSession,
    file_path: &Path,
    target_addr: SocketAddr,
    event_tx: &mpsc::Sender<AppEvent>,
    cancel: CancellationToken,
) -> TransferOutcome {
    tracing::info!("Sending {} to {}", file_path.display(), target_addr);

    // The connection lives inside this future; finishing or dropping it closes the socket.
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        res = transfer(&mut session, file_path, target_addr, event_tx) => res,
    };

    let outcome = match result {
        Ok(file_name) => {
            session.complete();
            tracing::info!(
                "Sent {} ({} bytes) to {}",
                file_name,
                session.transferred_bytes(),
                target_addr
            );
            TransferOutcome::Completed { file_name }
        }
        Err(TransferError::Cancelled) => {
            session.cancel();
            tracing::info!("Transfer to {} cancelled", target_addr);
            TransferOutcome::Cancelled
        }
        Err(e) => {
            session.fail();
            tracing::error!("Sending {} to {} failed: {}", file_path.display(), target_addr, e);
            TransferOutcome::Failed {
                kind: e.kind(),
                message: format!("Sending to {} failed: {}", target_addr, e),
            }
        }
    };

    let _ = event_tx
        .send(AppEvent::TransferFinished {
            session: session.id,
            direction: Direction::Sending,
            peer: target_addr.ip(),
            outcome: outcome.clone(),
        })
        .await;

    outcome
}

async fn transfer(
    session: &mut TransferSession,
    file_path: &Path,
    target_addr: SocketAddr,
    event_tx: &mpsc::Sender<AppEvent>,
) -> Result<String, TransferError> {
    let (mut file, file_size, file_name) = open_source(file_path).await?;

    let mut stream = connect(target_addr).await?;
    let header = encode_header(file_size, &file_name)?;
    write_chunk(&mut stream, &header).await?;

    // Size is read once; growth after this point is not sent
    session.activate(file_size);
    let _ = event_tx
        .send(AppEvent::TransferStarted {
            session: session.id,
            direction: Direction::Sending,
            file_name: file_name.clone(),
            peer: target_addr.ip(),
            total_bytes: file_size,
        })
        .await;

    let mut buffer = vec![0u8; session.max_chunk()];
    while !session.is_done() {
        let len = session.next_chunk_len();
        let n = file.read(&mut buffer[..len]).await?;
        if n == 0 {
            return Err(TransferError::InvalidSource {
                path: file_path.display().to_string(),
                reason: format!(
                    "file shrank to {} bytes during transfer",
                    session.transferred_bytes()
                ),
            });
        }
        write_chunk(&mut stream, &buffer[..n]).await?;

        if let Some(progress) = session.record(n) {
            report_progress(event_tx, session, &file_name, progress).await;
        }
    }

    if let Some(progress) = session.final_progress() {
        report_progress(event_tx, session, &file_name, progress).await;
    }

    match timeout(IO_TIMEOUT, stream.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(TransferError::WriteFailure(e)),
        Err(_) => return Err(stalled()),
    }

    Ok(file_name)
}

async fn open_source(file_path: &Path) -> Result<(File, u64, String), TransferError> {
    let invalid = |reason: String| TransferError::InvalidSource {
        path: file_path.display().to_string(),
        reason,
    };

    let metadata = tokio::fs::metadata(file_path)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    if !metadata.is_file() {
        return Err(invalid("not a regular file".to_string()));
    }

    let file_name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(sanitize_file_name)
        .ok_or_else(|| invalid("file name is not valid UTF-8".to_string()))?;

    let file = File::open(file_path)
        .await
        .map_err(|e| invalid(e.to_string()))?;

    Ok((file, metadata.len(), file_name))
}

/// Connect with a bounded wait, tuned for bulk writes.
pub async fn connect(target_addr: SocketAddr) -> Result<TcpStream, TransferError> {
    let socket = if target_addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE as u32) {
        tracing::debug!("SO_SNDBUF not applied: {}", e);
    }

    let stream = match timeout(CONNECT_TIMEOUT, socket.connect(target_addr)).await {
        Ok(res) => res?,
        Err(_) => return Err(TransferError::ConnectTimeout(target_addr)),
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("TCP_NODELAY not applied: {}", e);
    }
    Ok(stream)
}

async fn write_chunk(stream: &mut TcpStream, data: &[u8]) -> Result<(), TransferError> {
    match timeout(IO_TIMEOUT, stream.write_all(data)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TransferError::WriteFailure(e)),
        Err(_) => Err(stalled()),
    }
}

fn stalled() -> TransferError {
    TransferError::WriteFailure(std::io::Error::new(
        ErrorKind::TimedOut,
        format!("peer accepted no data for {} seconds", IO_TIMEOUT.as_secs()),
    ))
}
