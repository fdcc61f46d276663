use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the wire codec.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Datagram on the discovery port that is not one of ours.
    #[error("malformed discovery packet")]
    MalformedDiscoveryPacket,

    #[error("malformed transfer header: {0}")]
    MalformedHeader(String),
}

/// Coarse classification of a failed session, reported to collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferErrorKind {
    MalformedHeader,
    PrematureClose,
    ConnectTimeout,
    ReadTimeout,
    WriteFailure,
    InvalidSource,
    Io,
    Cancelled,
}

/// Errors that end a single transfer session.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("connection closed early: received {received}/{expected} bytes")]
    PrematureClose { received: u64, expected: u64 },

    #[error("connection to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("no data received for {0:?}")]
    ReadTimeout(Duration),

    #[error("write failed: {0}")]
    WriteFailure(std::io::Error),

    #[error("cannot send {path}: {reason}")]
    InvalidSource { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn kind(&self) -> TransferErrorKind {
        match self {
            TransferError::Protocol(_) => TransferErrorKind::MalformedHeader,
            TransferError::PrematureClose { .. } => TransferErrorKind::PrematureClose,
            TransferError::ConnectTimeout(_) => TransferErrorKind::ConnectTimeout,
            TransferError::ReadTimeout(_) => TransferErrorKind::ReadTimeout,
            TransferError::WriteFailure(_) => TransferErrorKind::WriteFailure,
            TransferError::InvalidSource { .. } => TransferErrorKind::InvalidSource,
            TransferError::Io(_) => TransferErrorKind::Io,
            TransferError::Cancelled => TransferErrorKind::Cancelled,
        }
    }
}

/// Fatal errors raised while starting the subsystem.
#[derive(Debug, Error)]
pub enum SubsystemError {
    #[error("cannot bind {what} on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("subsystem is already running")]
    AlreadyRunning,
}
