//! Adaptive chunk sizing.
//!
//! Each session runs its own [`AdaptiveChunkSize`]. It compares the transfer
//! rate of the last window against the running average since the session
//! started and doubles or halves the chunk size only when the window deviates
//! by more than the threshold in either direction.

use super::constants::{ADAPT_THRESHOLD, ADAPT_WINDOW, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub min_chunk: usize,
    pub max_chunk: usize,
    pub window_ms: u64,
    /// Relative deviation, e.g. 0.10 for 10%
    pub threshold: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_chunk: MIN_CHUNK_SIZE,
            max_chunk: MAX_CHUNK_SIZE,
            window_ms: ADAPT_WINDOW.as_millis() as u64,
            threshold: ADAPT_THRESHOLD,
        }
    }
}

impl AdaptiveConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn normalized(mut self) -> Self {
        self.min_chunk = self.min_chunk.max(1);
        self.max_chunk = self.max_chunk.max(self.min_chunk);
        self
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveChunkSize {
    config: AdaptiveConfig,
    current: usize,
    started_at: Instant,
    total_bytes: u64,
    window_started_at: Instant,
    window_bytes: u64,
}

impl AdaptiveChunkSize {
    /// Start at the largest chunk size.
    pub fn new(config: AdaptiveConfig) -> Self {
        let config = config.normalized();
        Self::with_initial(config, config.max_chunk, Instant::now())
    }

    pub fn with_initial(config: AdaptiveConfig, initial: usize, now: Instant) -> Self {
        let config = config.normalized();
        Self {
            config,
            current: initial.clamp(config.min_chunk, config.max_chunk),
            started_at: now,
            total_bytes: 0,
            window_started_at: now,
            window_bytes: 0,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.current
    }

    pub fn max_chunk(&self) -> usize {
        self.config.max_chunk
    }

    /// Account for `bytes` just transferred and return the chunk size to use next.
    pub fn record(&mut self, bytes: usize) -> usize {
        self.record_at(bytes, Instant::now())
    }

    pub fn record_at(&mut self, bytes: usize, now: Instant) -> usize {
        self.total_bytes += bytes as u64;
        self.window_bytes += bytes as u64;

        let window_elapsed = now.saturating_duration_since(self.window_started_at);
        if window_elapsed < self.config.window() {
            return self.current;
        }

        let total_elapsed = now.saturating_duration_since(self.started_at).as_secs_f64();
        let average_rate = if total_elapsed > 0.0 {
            self.total_bytes as f64 / total_elapsed
        } else {
            0.0
        };
        let window_rate = self.window_bytes as f64 / window_elapsed.as_secs_f64();

        self.adjust(window_rate, average_rate);

        self.window_started_at = now;
        self.window_bytes = 0;
        self.current
    }

    /// One decision step: compare a windowed rate against the running average.
    pub fn adjust(&mut self, window_rate: f64, average_rate: f64) -> usize {
        if average_rate <= 0.0 || !average_rate.is_finite() || !window_rate.is_finite() {
            return self.current;
        }

        let delta = (window_rate - average_rate) / average_rate;
        if delta > self.config.threshold && self.current < self.config.max_chunk {
            let next = self.current.saturating_mul(2).min(self.config.max_chunk);
            tracing::debug!("chunk size {} -> {} (delta {:+.2})", self.current, next, delta);
            self.current = next;
        } else if delta < -self.config.threshold && self.current > self.config.min_chunk {
            let next = (self.current / 2).max(self.config.min_chunk);
            tracing::debug!("chunk size {} -> {} (delta {:+.2})", self.current, next, delta);
            self.current = next;
        }
        self.current
    }
}
