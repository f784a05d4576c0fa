//! Shared nonblocking-socket plumbing used by both the per-device TCP
//! session (`device.rs`) and the UDP discovery listener (`scanner.rs`):
//! the "drain everything available" read loop and a thin error type for
//! the send half.

use std::fmt;
use std::io::{self, ErrorKind, Read, Write};

/// Size of each `read()` call into the scratch buffer; the accumulated
/// data is appended to the caller's growable buffer regardless of how
/// many chunks that took.
pub const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    NotConnected,
    SendFailed(String),
    ConnectFailed(String),
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketError::NotConnected => write!(f, "socket is not connected"),
            SocketError::SendFailed(msg) => write!(f, "send failed: {msg}"),
            SocketError::ConnectFailed(msg) => write!(f, "connect failed: {msg}"),
        }
    }
}

impl std::error::Error for SocketError {}

/// Drain everything currently available on a nonblocking `source` into
/// `buf`. Returns `Ok(true)` if the peer closed the connection (observed
/// as a zero-length read), `Ok(false)` if the read would block having
/// consumed whatever was available.
pub fn read_available(source: &mut impl Read, buf: &mut Vec<u8>) -> io::Result<bool> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match source.read(&mut chunk) {
            Ok(0) => return Ok(true),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Write a complete, already-framed buffer to a nonblocking `sink`.
///
/// Tuya frames are small (well under a socket's send buffer), so a
/// `write_all` that happens to return `WouldBlock` partway through is
/// treated as a send failure rather than queued for a later `on_writable` —
/// devices that can't keep up with single small control frames are already
/// failing in a way a reconnect should handle.
pub fn send_all_nonblocking(sink: &mut impl Write, data: &[u8]) -> Result<(), SocketError> {
    sink.write_all(data).map_err(|e| SocketError::SendFailed(e.to_string()))
}
