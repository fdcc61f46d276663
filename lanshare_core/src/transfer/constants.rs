use std::time::Duration;

/// Default TCP port for file transfer
pub const TRANSFER_PORT: u16 = 8513;

/// Smallest chunk the adaptive controller will shrink to (512KB)
pub const MIN_CHUNK_SIZE: usize = 512 * 1024;

/// Largest chunk, also the starting size (2MB)
pub const MAX_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// How long the adaptive controller measures before deciding
pub const ADAPT_WINDOW: Duration = Duration::from_millis(750);

/// Relative deviation from the running average that triggers a resize
pub const ADAPT_THRESHOLD: f64 = 0.10;

/// Emit a progress event once this many bytes moved since the last one
pub const PROGRESS_STEP_BYTES: u64 = 512 * 1024;

/// OS socket buffer requested on both ends of a transfer (2MB)
pub const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Connect timeout for outgoing transfers
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle timeout for any single read or write on a transfer connection
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// How long shutdown waits for in-flight receive handlers
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
