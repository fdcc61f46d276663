use super::session::{Progress, TransferSession};
use crate::AppEvent;
use crate::protocol::MAX_FILE_NAME_BYTES;
use socket2::SockRef;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const FALLBACK_FILE_NAME: &str = "unknown_file";

/// Reduce a file name to a bare base name that is safe to create in the
/// download directory.
pub fn sanitize_file_name(file_name: &str) -> String {
    // Split on both separators so names coming from other platforms are handled too
    let base = file_name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();

    let mut clean: String = base.chars().filter(|c| !c.is_control()).collect();

    if clean == ".." || clean == "." || clean.trim().is_empty() {
        return FALLBACK_FILE_NAME.to_string();
    }

    // Windows reserved device names
    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    if RESERVED.iter().any(|r| clean.eq_ignore_ascii_case(r)) {
        return FALLBACK_FILE_NAME.to_string();
    }

    if clean.len() > MAX_FILE_NAME_BYTES {
        let (stem, ext) = split_extension(&clean);
        let ext = if ext.len() < 20 { ext.to_string() } else { String::new() };
        let mut cutoff = MAX_FILE_NAME_BYTES - ext.len();
        while !stem.is_char_boundary(cutoff) {
            cutoff -= 1;
        }
        clean = format!("{}{}", &stem[..cutoff], ext);
    }

    clean
}

/// Split `name` into stem and extension (with its dot). Leading-dot names
/// such as `.bashrc` have no extension.
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

/// First path in `dir` for `file_name` that does not exist yet:
/// `a.txt`, then `a_1.txt`, `a_2.txt`, ...
///
/// The check is not atomic: two handlers receiving the same name at the same
/// instant can pick the same path. The loser fails when it opens the file
/// with [`create_destination`].
pub fn unique_save_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = split_extension(file_name);
    let mut counter: u64 = 1;
    loop {
        let candidate = dir.join(format!("{}_{}{}", stem, counter, ext));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Create the destination for exclusive writing. Fails if it already exists.
pub async fn create_destination(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
}

/// Human readable transfer rate
pub fn format_transfer_speed(rate_bps: f64) -> String {
    if rate_bps <= 0.0 {
        return "Starting...".to_string();
    }

    if rate_bps > 1_000_000.0 {
        format!("{:.2} MB/s", rate_bps / 1_000_000.0)
    } else if rate_bps > 1_000.0 {
        format!("{:.1} KB/s", rate_bps / 1_000.0)
    } else {
        format!("{:.0} B/s", rate_bps)
    }
}

/// Report a progress sample of `session` to the event channel
pub async fn report_progress(
    event_tx: &mpsc::Sender<AppEvent>,
    session: &TransferSession,
    file_name: &str,
    progress: Progress,
) {
    let _ = event_tx
        .send(AppEvent::TransferProgress {
            session: session.id,
            direction: session.direction,
            file_name: file_name.to_string(),
            bytes_transferred: progress.bytes_transferred,
            total_bytes: progress.total_bytes,
            rate_bps: progress.rate_bps,
            speed: format_transfer_speed(progress.rate_bps),
        })
        .await;
}

/// Disable Nagle and request a large OS receive buffer on an accepted
/// connection. Failures are logged; the transfer still works without them.
pub fn tune_accepted_stream(stream: &TcpStream, recv_buffer: usize) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("TCP_NODELAY not applied: {}", e);
    }
    let sock = SockRef::from(stream);
    if let Err(e) = sock.set_recv_buffer_size(recv_buffer) {
        tracing::debug!("SO_RCVBUF not applied: {}", e);
    }
}
