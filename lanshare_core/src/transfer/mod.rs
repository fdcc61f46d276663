//! TCP file transfer.
//!
//! This module provides:
//! - The adaptive chunk-size controller
//! - Per-connection session state and progress throttling
//! - The sender (one outgoing connection per file)
//! - The receiving server (one task per accepted connection)

pub mod adaptive;
pub mod constants;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod session;
pub mod utils;

// Re-export public API
pub use adaptive::{AdaptiveChunkSize, AdaptiveConfig};
pub use constants::TRANSFER_PORT;
pub use receiver::receive_file;
pub use sender::{SendHandle, send_file, spawn_send};
pub use server::TransferServer;
pub use session::{Direction, SessionId, SessionState, TransferSession};
