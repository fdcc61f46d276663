//! Wire formats shared by discovery and transfer.
//!
//! Discovery datagrams are plain text: either the bare marker
//! `discovery_announce` (older peers) or `discovery_announce:<name>|<ip>`.
//!
//! A transfer connection starts with a self-framing header:
//! a 20 byte ASCII decimal size field, left-justified and space padded,
//! followed by the UTF-8 file name and a single `\n`. Raw file bytes follow.

use crate::error::{ProtocolError, TransferError};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::IpAddr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Marker that identifies our discovery datagrams.
pub const ANNOUNCE_MARKER: &str = "discovery_announce";

/// Width of the size field at the start of every transfer header.
pub const SIZE_FIELD_LEN: usize = 20;

/// Longest file name accepted in a header, in bytes.
pub const MAX_FILE_NAME_BYTES: usize = 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryMessage {
    pub display_name: Option<String>,
    pub origin_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub file_size: u64,
    pub file_name: String,
}

/// Build an announcement datagram carrying our name and, if known, our address.
pub fn encode_announcement(display_name: &str, ip: Option<IpAddr>) -> Bytes {
    let ip = ip.map(|ip| ip.to_string()).unwrap_or_default();
    let mut buf =
        BytesMut::with_capacity(ANNOUNCE_MARKER.len() + display_name.len() + ip.len() + 2);
    buf.put_slice(ANNOUNCE_MARKER.as_bytes());
    buf.put_u8(b':');
    buf.put_slice(display_name.as_bytes());
    buf.put_u8(b'|');
    buf.put_slice(ip.as_bytes());
    buf.freeze()
}

/// Parse a discovery datagram.
///
/// Anything that is not one of the two known forms yields
/// [`ProtocolError::MalformedDiscoveryPacket`]; callers are expected to drop
/// those silently since the port is shared with arbitrary traffic.
pub fn decode_announcement(datagram: &[u8]) -> Result<DiscoveryMessage, ProtocolError> {
    let text =
        std::str::from_utf8(datagram).map_err(|_| ProtocolError::MalformedDiscoveryPacket)?;
    let text = text.trim_end_matches(|c: char| c.is_ascii_whitespace() || c == '\0');

    if text == ANNOUNCE_MARKER {
        return Ok(DiscoveryMessage::default());
    }

    let rest = text
        .strip_prefix(ANNOUNCE_MARKER)
        .and_then(|r| r.strip_prefix(':'))
        .ok_or(ProtocolError::MalformedDiscoveryPacket)?;

    // An IP never contains '|', so the last one separates name from address.
    let (name, ip) = match rest.rsplit_once('|') {
        Some((name, ip)) => (name, Some(ip)),
        None => (rest, None),
    };

    Ok(DiscoveryMessage {
        display_name: non_empty(name),
        origin_ip: ip.and_then(|ip| non_empty(ip.trim())),
    })
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Encode the transfer header for `file_name` of `file_size` bytes.
pub fn encode_header(file_size: u64, file_name: &str) -> Result<Bytes, ProtocolError> {
    if file_name.is_empty() {
        return Err(ProtocolError::MalformedHeader("empty file name".into()));
    }
    if file_name.contains('\n') {
        return Err(ProtocolError::MalformedHeader(
            "file name contains a newline".into(),
        ));
    }
    if file_name.len() > MAX_FILE_NAME_BYTES {
        return Err(ProtocolError::MalformedHeader(format!(
            "file name is {} bytes, max {}",
            file_name.len(),
            MAX_FILE_NAME_BYTES
        )));
    }

    // u64::MAX has exactly 20 digits, so the field never overflows.
    let size_field = format!("{:<width$}", file_size, width = SIZE_FIELD_LEN);
    let mut buf = BytesMut::with_capacity(SIZE_FIELD_LEN + file_name.len() + 1);
    buf.put_slice(size_field.as_bytes());
    buf.put_slice(file_name.as_bytes());
    buf.put_u8(b'\n');
    Ok(buf.freeze())
}

/// Read a transfer header from the start of a connection.
///
/// Leaves the reader positioned at the first byte of file data.
pub async fn decode_header<R>(reader: &mut R) -> Result<TransferHeader, TransferError>
where
    R: AsyncBufRead + Unpin,
{
    let mut size_field = [0u8; SIZE_FIELD_LEN];
    if let Err(e) = reader.read_exact(&mut size_field).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(malformed("connection closed before the size field was complete").into());
        }
        return Err(e.into());
    }

    let size_text = std::str::from_utf8(&size_field)
        .map_err(|_| malformed("size field is not ASCII"))?
        .trim();
    let file_size: u64 = size_text
        .parse()
        .map_err(|_| malformed(format!("invalid size field {:?}", size_text)))?;

    let limit = (MAX_FILE_NAME_BYTES + 1) as u64;
    let mut name_bytes = Vec::new();
    let n = (&mut *reader)
        .take(limit)
        .read_until(b'\n', &mut name_bytes)
        .await?;

    match name_bytes.last() {
        Some(b'\n') => {
            name_bytes.pop();
        }
        _ if n as u64 >= limit => {
            return Err(malformed("file name is not terminated").into());
        }
        _ => {
            return Err(TransferError::PrematureClose {
                received: 0,
                expected: file_size,
            });
        }
    }

    let file_name =
        String::from_utf8(name_bytes).map_err(|_| malformed("file name is not valid UTF-8"))?;

    Ok(TransferHeader {
        file_size,
        file_name,
    })
}

fn malformed(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedHeader(msg.into())
}
