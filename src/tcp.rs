//! Non-blocking TCP connect: `mio::net::TcpStream::connect` already performs
//! the socket()/set_nonblocking()/connect() sequence and returns immediately
//! with the connect left in progress (`EINPROGRESS`); the caller registers
//! the returned stream for `Writable` readiness and calls `connect_result`
//! once that fires, matching the SO_ERROR-after-writable check in
//! `hdds-team-hdds`'s io thread.

use mio::net::TcpStream;
use std::io;
use std::net::SocketAddr;

use crate::socket::SocketError;

pub fn begin_connect(addr: SocketAddr) -> io::Result<TcpStream> {
    TcpStream::connect(addr)
}

/// Check whether a connect-in-progress socket has finished. Must only be
/// called after a `Writable` readiness event fires for the socket's token.
///
/// Per spec.md's non-blocking-connect step: read `SO_ERROR` *and*
/// `getpeername`; only the combination confirms the connection actually
/// completed. A lone `SO_ERROR` check can read back `None` on a socket
/// that failed to connect on some platforms/timings, so `peer_addr` (the
/// `getpeername` equivalent mio exposes) is checked too, matching
/// `examples/original_source/loop/tcpclienthandler.hpp`'s `handleWritable`.
pub fn connect_result(stream: &TcpStream) -> Result<(), SocketError> {
    match stream.take_error() {
        Ok(None) => {}
        Ok(Some(e)) => return Err(SocketError::ConnectFailed(e.to_string())),
        Err(e) => return Err(SocketError::ConnectFailed(e.to_string())),
    }
    stream
        .peer_addr()
        .map(|_| ())
        .map_err(|e| SocketError::ConnectFailed(e.to_string()))
}
