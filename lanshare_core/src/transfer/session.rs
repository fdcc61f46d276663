use super::adaptive::{AdaptiveChunkSize, AdaptiveConfig};
use super::constants::PROGRESS_STEP_BYTES;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Instant;
use uuid::Uuid;

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Sending,
    Receiving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }
}

/// A progress sample ready to be reported.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// Bytes per second since the previous sample
    pub rate_bps: f64,
}

/// Book-keeping for one transfer over one connection.
///
/// Owned by the task driving the connection; nothing here is shared.
#[derive(Debug)]
pub struct TransferSession {
    pub id: SessionId,
    pub direction: Direction,
    pub peer: IpAddr,
    total_bytes: u64,
    transferred_bytes: u64,
    started_at: Instant,
    state: SessionState,
    adaptive: AdaptiveConfig,
    chunks: AdaptiveChunkSize,
    last_report_bytes: u64,
    last_report_at: Instant,
    final_reported: bool,
}

impl TransferSession {
    pub fn new(direction: Direction, peer: IpAddr, adaptive: AdaptiveConfig) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            direction,
            peer,
            total_bytes: 0,
            transferred_bytes: 0,
            started_at: now,
            state: SessionState::Pending,
            adaptive,
            chunks: AdaptiveChunkSize::new(adaptive),
            last_report_bytes: 0,
            last_report_at: now,
            final_reported: false,
        }
    }

    /// Move to `Active` once the size of the transfer is known.
    pub fn activate(&mut self, total_bytes: u64) {
        if self.state != SessionState::Pending {
            return;
        }
        let now = Instant::now();
        self.total_bytes = total_bytes;
        self.started_at = now;
        self.last_report_at = now;
        // Rates are measured from here, not from connection setup.
        self.chunks = AdaptiveChunkSize::new(self.adaptive);
        self.state = SessionState::Active;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes
    }

    pub fn remaining(&self) -> u64 {
        self.total_bytes.saturating_sub(self.transferred_bytes)
    }

    pub fn is_done(&self) -> bool {
        self.transferred_bytes >= self.total_bytes
    }

    /// Chunk size for the next read, never more than what is left.
    pub fn next_chunk_len(&self) -> usize {
        let remaining = usize::try_from(self.remaining()).unwrap_or(usize::MAX);
        self.chunks.chunk_size().min(remaining)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunks.chunk_size()
    }

    pub fn max_chunk(&self) -> usize {
        self.chunks.max_chunk()
    }

    /// Account for transferred bytes. Returns a sample when one is due: more
    /// than the progress step since the last sample, or the transfer just
    /// reached its total.
    pub fn record(&mut self, bytes: usize) -> Option<Progress> {
        self.transferred_bytes += bytes as u64;
        self.chunks.record(bytes);

        let since_last = self.transferred_bytes - self.last_report_bytes;
        if since_last > PROGRESS_STEP_BYTES || self.is_done() {
            return self.sample();
        }
        None
    }

    /// The closing 100% sample, unless `record` already produced it.
    pub fn final_progress(&mut self) -> Option<Progress> {
        if self.final_reported {
            return None;
        }
        self.sample()
    }

    fn sample(&mut self) -> Option<Progress> {
        if self.final_reported {
            return None;
        }
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_report_at).as_secs_f64();
        let moved = self.transferred_bytes - self.last_report_bytes;
        let rate_bps = if elapsed > 0.0 {
            moved as f64 / elapsed
        } else {
            average_rate(self.transferred_bytes, self.started_at, now)
        };

        self.last_report_bytes = self.transferred_bytes;
        self.last_report_at = now;
        if self.is_done() {
            self.final_reported = true;
        }

        Some(Progress {
            bytes_transferred: self.transferred_bytes,
            total_bytes: self.total_bytes,
            rate_bps,
        })
    }

    pub fn complete(&mut self) {
        self.finish(SessionState::Completed);
    }

    pub fn fail(&mut self) {
        self.finish(SessionState::Failed);
    }

    pub fn cancel(&mut self) {
        self.finish(SessionState::Cancelled);
    }

    fn finish(&mut self, state: SessionState) {
        if !self.state.is_terminal() {
            self.state = state;
        }
    }
}

fn average_rate(bytes: u64, since: Instant, now: Instant) -> f64 {
    let elapsed = now.saturating_duration_since(since).as_secs_f64();
    if elapsed > 0.0 { bytes as f64 / elapsed } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn session(total: u64) -> TransferSession {
        let mut s = TransferSession::new(
            Direction::Receiving,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            AdaptiveConfig::default(),
        );
        s.activate(total);
        s
    }

    #[test]
    fn test_state_transitions() {
        let mut s = TransferSession::new(
            Direction::Sending,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            AdaptiveConfig::default(),
        );
        assert_eq!(s.state(), SessionState::Pending);
        s.activate(10);
        assert_eq!(s.state(), SessionState::Active);
        s.fail();
        assert_eq!(s.state(), SessionState::Failed);
        // Terminal states stick.
        s.complete();
        assert_eq!(s.state(), SessionState::Failed);
    }

    #[test]
    fn test_progress_is_throttled() {
        let mut s = session(2 * 1024 * 1024);
        assert!(s.record(256 * 1024).is_none());
        assert!(s.record(256 * 1024).is_none());
        let p = s.record(1).expect("crossed the step");
        assert_eq!(p.bytes_transferred, 512 * 1024 + 1);
    }

    #[test]
    fn test_final_progress_emitted_once() {
        let mut s = session(1000);
        let p = s.record(1000).expect("completion always reports");
        assert_eq!(p.bytes_transferred, 1000);
        assert_eq!(p.total_bytes, 1000);
        assert!(s.final_progress().is_none());
    }

    #[test]
    fn test_empty_transfer_reports_completion() {
        let mut s = session(0);
        let p = s.final_progress().expect("zero byte transfer still completes");
        assert_eq!(p.bytes_transferred, 0);
        assert!(s.final_progress().is_none());
    }

    #[test]
    fn test_next_chunk_len_clamped_to_remaining() {
        let mut s = session(3_000_000);
        assert_eq!(s.next_chunk_len(), 2 * 1024 * 1024);
        s.record(2_900_000);
        assert_eq!(s.next_chunk_len(), 100_000);
    }
}
