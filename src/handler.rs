//! The capability trait every reactor-attached component implements. Every
//! method defaults to a logged no-op, so a handler that only cares about
//! e.g. `on_message` doesn't have to stub out the rest — this is the
//! capability-trait redesign named in place of a virtual-inheritance
//! handler hierarchy.

use mio::Token;
use std::net::SocketAddr;

use crate::codec::Message;

pub trait Handler {
    fn on_connected(&mut self, fd: Token, addr: SocketAddr) {
        tracing::debug!(?fd, %addr, "on_connected (default no-op)");
    }

    fn on_readable(&mut self, fd: Token) {
        tracing::debug!(?fd, "on_readable (default no-op)");
    }

    fn on_writable(&mut self, fd: Token) {
        tracing::debug!(?fd, "on_writable (default no-op)");
    }

    fn on_read(&mut self, fd: Token, addr: SocketAddr, data: &[u8]) {
        tracing::debug!(?fd, %addr, len = data.len(), "on_read (default no-op)");
    }

    fn on_message(&mut self, fd: Token, addr: SocketAddr, msg: &Message) {
        tracing::debug!(?fd, %addr, cmd = msg.cmd, "on_message (default no-op)");
    }

    fn on_close(&mut self, fd: Token, addr: SocketAddr) {
        tracing::warn!(?fd, %addr, "on_close (default no-op)");
    }
}
