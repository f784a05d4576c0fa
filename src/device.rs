//! The per-device session: owns one TCP connection, tracks its
//! connect/idle/awaiting-reply state, and exposes the on/off/brightness/
//! colour-temperature convenience API on top of raw `send_command`.
//!
//! Generalizes `wilderness-interactive-hearth`'s single-device
//! `TuyaConnection` (request/response over a `tokio::sync::Mutex<TcpStream>`)
//! into a reactor-attached state machine: the mutex disappears because there
//! is exactly one thread driving the reactor, and "wait for the response"
//! becomes "register a callback and a timeout" rather than an `.await`. The
//! teacher's recurring heartbeat task has no counterpart here — spec.md's
//! command set names no heartbeat operation — so it is not ported.

use mio::net::TcpStream as MioTcpStream;
use mio::Token;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::fmt;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::codec::{self, Message, CMD_CONTROL, CMD_DP_QUERY, CMD_HEART_BEAT};
use crate::config::Config;
use crate::dps;
use crate::event::Event;
use crate::handler::Handler;
use crate::reactor::Loop;
use crate::socket;
use crate::tcp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Idle,
    Awaiting,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DeviceError {
    /// A command is already in flight; at most one may be outstanding.
    Busy,
    /// Not currently connected to the device.
    Disconnected,
    /// The in-flight command's deadline elapsed with no reply.
    Timeout,
    InvalidArgument(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Busy => write!(f, "a command is already awaiting a reply"),
            DeviceError::Disconnected => write!(f, "device is not connected"),
            DeviceError::Timeout => write!(f, "command timed out waiting for a reply"),
            DeviceError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for DeviceError {}

pub type Callback = Box<dyn FnOnce(Result<Value, DeviceError>)>;

struct CmdCtx {
    seq_no: u32,
    cmd: u32,
    callback: Option<Callback>,
}

/// One device's TCP session and the convenience API built on top of it.
///
/// Implements `Handler` directly rather than wrapping a separate socket
/// object: per the ownership rule, exactly one thing may register an fd
/// with the reactor, and that thing is the device itself.
pub struct Device {
    loop_handle: Loop,
    token: Token,
    addr: SocketAddr,
    gw_id: String,
    dev_id: String,
    key: [u8; 16],
    config: Arc<Config>,
    pub name: Option<String>,
    state: State,
    stream: Option<MioTcpStream>,
    read_buf: Vec<u8>,
    next_seq: u32,
    cmd_ctx: Option<CmdCtx>,
    dps_cache: Map<String, Value>,
    self_weak: Weak<RefCell<Device>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("addr", &self.addr)
            .field("dev_id", &self.dev_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Construct a device session and kick off its first connection attempt.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        loop_handle: Loop,
        addr: SocketAddr,
        gw_id: String,
        dev_id: String,
        key: [u8; 16],
        config: Arc<Config>,
        name: Option<String>,
    ) -> Rc<RefCell<Device>> {
        let token = loop_handle.next_token();
        let dev = Rc::new(RefCell::new(Device {
            loop_handle,
            token,
            addr,
            gw_id,
            dev_id,
            key,
            config,
            name,
            state: State::Disconnected,
            stream: None,
            read_buf: Vec::with_capacity(1024),
            next_seq: 1,
            cmd_ctx: None,
            dps_cache: Map::new(),
            self_weak: Weak::new(),
        }));
        dev.borrow_mut().self_weak = Rc::downgrade(&dev);
        Device::connect(&dev);
        dev
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn dev_id(&self) -> &str {
        &self.dev_id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Idle | State::Awaiting)
    }

    /// The last-observed switch state. `InvalidArgument` if no `STATUS`/
    /// `DP_QUERY` reply has populated a switch DP yet.
    pub fn is_on(&self) -> Result<bool, DeviceError> {
        let key = dps::switch_key(&self.dps_cache)
            .ok_or_else(|| DeviceError::InvalidArgument("no switch DP known yet".to_string()))?;
        self.dps_cache
            .get(key)
            .and_then(Value::as_bool)
            .ok_or_else(|| DeviceError::InvalidArgument(format!("dps[{key}] is not a bool")))
    }

    pub fn brightness(&self) -> Option<u32> {
        let key = dps::brightness_key(&self.dps_cache)?;
        self.dps_cache.get(key.key).and_then(Value::as_u64).map(|v| v as u32)
    }

    /// Begin (or retry) the TCP connection. Safe to call on an already
    /// `Connecting`/`Idle`/`Awaiting` device only via the reconnect path,
    /// which first tears the previous attempt down.
    pub fn connect(dev: &Rc<RefCell<Device>>) {
        let (addr, token) = {
            let d = dev.borrow();
            (d.addr, d.token)
        };

        match tcp::begin_connect(addr) {
            Ok(mut stream) => {
                let handler: Rc<RefCell<dyn Handler>> = dev.clone();
                let mut d = dev.borrow_mut();
                if let Err(e) = d.loop_handle.attach_write_once(token, handler, &mut stream) {
                    tracing::warn!(%addr, error = %e, "failed to register connecting socket");
                    d.schedule_reconnect();
                    return;
                }
                d.stream = Some(stream);
                d.state = State::Connecting;
            }
            Err(e) => {
                tracing::warn!(%addr, error = %e, "connect failed");
                dev.borrow().schedule_reconnect();
            }
        }
    }

    /// Schedule a reconnect attempt after the configured backoff. Takes
    /// `&self` rather than `&Rc<RefCell<Device>>` deliberately: every call
    /// site already holds a live borrow of this device (it's reacting to a
    /// send failure, a close, or a failed connect attempt), and re-entering
    /// through `dev.borrow()` there would panic on the already-mutable
    /// borrow.
    fn schedule_reconnect(&self) {
        let weak = self.self_weak.clone();
        let delay = self.config.reconnect_delay();
        self.loop_handle.push_work(delay, move || {
            if let Some(dev) = weak.upgrade() {
                Device::connect(&dev);
            }
        });
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Send a command; fails immediately if the session isn't `Idle`
    /// (enforces the at-most-one-in-flight invariant).
    pub fn send_command(
        dev: &Rc<RefCell<Device>>,
        cmd: u32,
        payload: Value,
        callback: impl FnOnce(Result<Value, DeviceError>) + 'static,
    ) -> Result<(), DeviceError> {
        dev.borrow_mut().send_now(cmd, payload, Box::new(callback))
    }

    fn send_now(
        &mut self,
        cmd: u32,
        payload: Value,
        callback: Callback,
    ) -> Result<(), DeviceError> {
        match self.state {
            State::Awaiting => return Err(DeviceError::Busy),
            State::Disconnected | State::Connecting => return Err(DeviceError::Disconnected),
            State::Idle => {}
        }

        let seq_no = self.next_seq();
        let msg = Message::new(seq_no, cmd, payload);
        let frame = codec::serialize(&msg, &self.key, true);

        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Err(DeviceError::Disconnected),
        };

        if let Err(e) = socket::send_all_nonblocking(stream, &frame) {
            tracing::warn!(addr = %self.addr, error = %e, "send failed");
            self.state = State::Disconnected;
            self.stream = None;
            self.schedule_reconnect();
            callback(Err(DeviceError::Disconnected));
            return Err(DeviceError::Disconnected);
        }

        self.state = State::Awaiting;
        self.cmd_ctx = Some(CmdCtx { seq_no, cmd, callback: Some(callback) });

        let weak = self.self_weak.clone();
        self.loop_handle.push_work(self.config.command_timeout(), move || {
            if let Some(dev) = weak.upgrade() {
                Device::fire_timeout(&dev, seq_no);
            }
        });

        Ok(())
    }

    /// Self-validating timeout: only fires if the awaited command is still
    /// the one that scheduled this closure (a later send reuses `cmd_ctx`
    /// with a different `seq_no`, and the stale closure becomes a no-op).
    fn fire_timeout(dev: &Rc<RefCell<Device>>, seq_no: u32) {
        let cb = {
            let mut d = dev.borrow_mut();
            match &d.cmd_ctx {
                Some(ctx) if ctx.seq_no == seq_no => {
                    let mut ctx = d.cmd_ctx.take().unwrap();
                    d.state = State::Idle;
                    ctx.callback.take()
                }
                _ => None,
            }
        };
        if let Some(cb) = cb {
            cb(Err(DeviceError::Timeout));
        }
    }

    fn send_dp_query(&mut self) {
        let payload = codec::build_dp_query_payload(&self.gw_id, &self.dev_id);
        let weak = self.self_weak.clone();
        let result = self.send_now(
            CMD_DP_QUERY,
            payload,
            Box::new(move |result| match result {
                Ok(data) => {
                    tracing::debug!("initial DP query succeeded");
                    if let Some(dev) = weak.upgrade() {
                        if let Value::Object(dps) = data.get("dps").cloned().unwrap_or(Value::Null) {
                            let mut d = dev.borrow_mut();
                            d.dps_cache = dps;
                            dps::enrich_dps(&mut d.dps_cache);
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "initial DP query failed"),
            }),
        );
        if let Err(e) = result {
            tracing::warn!(error = %e, "could not issue initial DP query");
        }
    }

    /// `Busy`/`Disconnected` (the session's own transport state) take
    /// priority over `InvalidArgument` (a DP this call needs hasn't been
    /// observed yet) — both `send_now` and every high-level setter below
    /// check transport state before resolving a DP key.
    fn check_idle(&self) -> Result<(), DeviceError> {
        match self.state {
            State::Awaiting => Err(DeviceError::Busy),
            State::Disconnected | State::Connecting => Err(DeviceError::Disconnected),
            State::Idle => Ok(()),
        }
    }

    pub fn set_on(
        dev: &Rc<RefCell<Device>>,
        on: bool,
        callback: impl FnOnce(Result<Value, DeviceError>) + 'static,
    ) -> Result<(), DeviceError> {
        let (dev_id, key) = {
            let d = dev.borrow();
            d.check_idle()?;
            let key = dps::switch_key(&d.dps_cache)
                .ok_or_else(|| DeviceError::InvalidArgument("no switch DP known yet".to_string()))?;
            (d.dev_id.clone(), key)
        };
        let payload = codec::build_control_payload(&dev_id, serde_json::json!({ (key): on }));
        Device::send_command(dev, CMD_CONTROL, payload, callback)
    }

    pub fn toggle(
        dev: &Rc<RefCell<Device>>,
        callback: impl FnOnce(Result<Value, DeviceError>) + 'static,
    ) -> Result<(), DeviceError> {
        let current = dev.borrow().is_on()?;
        Device::set_on(dev, !current, callback)
    }

    pub fn set_brightness(
        dev: &Rc<RefCell<Device>>,
        value: u32,
        callback: impl FnOnce(Result<Value, DeviceError>) + 'static,
    ) -> Result<(), DeviceError> {
        let (dev_id, scaled) = {
            let d = dev.borrow();
            d.check_idle()?;
            let scaled = dps::brightness_key(&d.dps_cache).ok_or_else(|| {
                DeviceError::InvalidArgument("no brightness DP known yet".to_string())
            })?;
            (d.dev_id.clone(), scaled)
        };
        if value > scaled.scale {
            return Err(DeviceError::InvalidArgument(format!(
                "brightness {value} exceeds scale {}",
                scaled.scale
            )));
        }
        let value = dps::clamp_brightness(scaled.key, value);
        let payload = codec::build_control_payload(&dev_id, serde_json::json!({ (scaled.key): value }));
        Device::send_command(dev, CMD_CONTROL, payload, callback)
    }

    pub fn set_colour_temp(
        dev: &Rc<RefCell<Device>>,
        value: u32,
        callback: impl FnOnce(Result<Value, DeviceError>) + 'static,
    ) -> Result<(), DeviceError> {
        let (dev_id, scaled) = {
            let d = dev.borrow();
            d.check_idle()?;
            let scaled = dps::colourtemp_key(&d.dps_cache).ok_or_else(|| {
                DeviceError::InvalidArgument("no colour-temperature DP known yet".to_string())
            })?;
            (d.dev_id.clone(), scaled)
        };
        if value > scaled.scale {
            return Err(DeviceError::InvalidArgument(format!(
                "colour temperature {value} exceeds scale {}",
                scaled.scale
            )));
        }
        let payload = codec::build_control_payload(&dev_id, serde_json::json!({ (scaled.key): value }));
        Device::send_command(dev, CMD_CONTROL, payload, callback)
    }

    fn handle_message(&mut self, fd: Token, msg: Message) {
        let completed =
            matches!(&self.cmd_ctx, Some(ctx) if ctx.seq_no == msg.seq_no && ctx.cmd == msg.cmd);

        if completed {
            let mut ctx = self.cmd_ctx.take().unwrap();
            self.state = State::Idle;
            tracing::debug!(cmd = ctx.cmd, seq_no = msg.seq_no, "command completed");
            if let Some(cb) = ctx.callback.take() {
                cb(Ok(msg.data.clone()));
            }
        } else if msg.cmd == crate::codec::CMD_STATUS {
            if let Value::Object(obj) = &msg.data {
                if let Some(Value::Object(incoming)) = obj.get("dps") {
                    for (k, v) in incoming {
                        self.dps_cache.insert(k.clone(), v.clone());
                    }
                    dps::enrich_dps(&mut self.dps_cache);
                }
            }
        } else {
            tracing::info!(cmd = msg.cmd, seq_no = msg.seq_no, "unsolicited message ignored");
        }

        self.loop_handle
            .dispatch_promiscuous(Event::Message { fd, addr: self.addr, msg });
    }

    fn handle_close(&mut self, fd: Token) {
        if let Some(mut ctx) = self.cmd_ctx.take() {
            if let Some(cb) = ctx.callback.take() {
                cb(Err(DeviceError::Disconnected));
            }
        }
        self.loop_handle.detach(fd);
        if let Some(mut stream) = self.stream.take() {
            self.loop_handle.deregister(&mut stream);
        }
        self.state = State::Disconnected;
        self.loop_handle
            .dispatch_promiscuous(Event::Close { fd, addr: self.addr });
        self.schedule_reconnect();
    }
}

impl Handler for Device {
    fn on_writable(&mut self, fd: Token) {
        let self_rc = match self.self_weak.upgrade() {
            Some(rc) => rc,
            None => return,
        };

        let result = match self.stream.as_ref() {
            Some(stream) => tcp::connect_result(stream),
            None => return,
        };

        match result {
            Ok(()) => {
                let mut stream = self.stream.take().expect("stream present on writable");
                let handler: Rc<RefCell<dyn Handler>> = self_rc.clone();
                if let Err(e) = self.loop_handle.attach_read(fd, handler, &mut stream) {
                    tracing::warn!(?fd, error = %e, "failed to register connected socket for reads");
                }
                self.stream = Some(stream);
                self.state = State::Idle;
                tracing::info!(addr = %self.addr, "device connected");
                self.loop_handle
                    .dispatch_promiscuous(Event::Connected { fd, addr: self.addr });
                self.send_dp_query();
            }
            Err(e) => {
                tracing::warn!(addr = %self.addr, error = %e, "connect failed");
                self.stream = None;
                self.state = State::Disconnected;
                self.schedule_reconnect();
            }
        }
    }

    fn on_readable(&mut self, fd: Token) {
        let closed = {
            let stream = match self.stream.as_mut() {
                Some(s) => s,
                None => return,
            };
            match socket::read_available(stream, &mut self.read_buf) {
                Ok(closed) => closed,
                Err(e) => {
                    tracing::warn!(addr = %self.addr, error = %e, "read failed");
                    true
                }
            }
        };

        let (messages, consumed, err) = codec::parse_all(&self.read_buf, &self.key, true);
        self.read_buf.drain(..consumed);
        if let Some(e) = err {
            tracing::warn!(addr = %self.addr, error = %e, "frame parse error");
        }

        for msg in messages {
            self.handle_message(fd, msg);
        }

        if closed {
            self.handle_close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn test_device(loop_handle: Loop) -> Rc<RefCell<Device>> {
        let token = loop_handle.next_token();
        Rc::new(RefCell::new(Device {
            loop_handle,
            token,
            addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6668)),
            gw_id: "gw1".to_string(),
            dev_id: "dev1".to_string(),
            key: *b"0123456789abcdef",
            config: Arc::new(Config::default()),
            name: None,
            state: State::Idle,
            stream: None,
            read_buf: Vec::new(),
            next_seq: 1,
            cmd_ctx: None,
            dps_cache: Map::new(),
            self_weak: Weak::new(),
        }))
    }

    #[test]
    fn send_command_rejects_when_not_idle() {
        let l = Loop::new().unwrap();
        let dev = test_device(l);
        dev.borrow_mut().self_weak = Rc::downgrade(&dev);
        dev.borrow_mut().state = State::Disconnected;

        let result = Device::send_command(&dev, CMD_HEART_BEAT, Value::Null, |_| {});
        assert!(matches!(result, Err(DeviceError::Disconnected)));
    }

    #[test]
    fn send_command_rejects_when_already_awaiting() {
        let l = Loop::new().unwrap();
        let dev = test_device(l);
        dev.borrow_mut().self_weak = Rc::downgrade(&dev);
        dev.borrow_mut().state = State::Awaiting;

        let result = Device::send_command(&dev, CMD_HEART_BEAT, Value::Null, |_| {});
        assert!(matches!(result, Err(DeviceError::Busy)));
    }

    #[test]
    fn is_on_reads_cached_status() {
        let l = Loop::new().unwrap();
        let dev = test_device(l);
        dev.borrow_mut().self_weak = Rc::downgrade(&dev);
        dev.borrow_mut().dps_cache.insert("1".to_string(), Value::Bool(true));
        assert_eq!(dev.borrow().is_on(), Ok(true));
    }

    #[test]
    fn is_on_is_invalid_argument_before_any_status() {
        let l = Loop::new().unwrap();
        let dev = test_device(l);
        dev.borrow_mut().self_weak = Rc::downgrade(&dev);
        assert!(matches!(dev.borrow().is_on(), Err(DeviceError::InvalidArgument(_))));
    }

    #[test]
    fn timeout_is_ignored_for_stale_seq_no() {
        let l = Loop::new().unwrap();
        let dev = test_device(l);
        dev.borrow_mut().self_weak = Rc::downgrade(&dev);
        dev.borrow_mut().cmd_ctx = Some(CmdCtx {
            seq_no: 5,
            cmd: CMD_HEART_BEAT,
            callback: Some(Box::new(|_| panic!("should not fire"))),
        });

        // A timeout closure captured for an older seq_no must not touch the
        // current in-flight command.
        Device::fire_timeout(&dev, 4);
        assert!(dev.borrow().cmd_ctx.is_some());
    }

    #[test]
    fn timeout_completes_matching_command_and_returns_to_idle() {
        let l = Loop::new().unwrap();
        let dev = test_device(l);
        dev.borrow_mut().self_weak = Rc::downgrade(&dev);
        dev.borrow_mut().state = State::Awaiting;

        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();
        dev.borrow_mut().cmd_ctx = Some(CmdCtx {
            seq_no: 7,
            cmd: CMD_HEART_BEAT,
            callback: Some(Box::new(move |result| {
                assert!(matches!(result, Err(DeviceError::Timeout)));
                *fired2.borrow_mut() = true;
            })),
        });

        Device::fire_timeout(&dev, 7);
        assert!(*fired.borrow());
        assert_eq!(dev.borrow().state, State::Idle);
        assert!(dev.borrow().cmd_ctx.is_none());
    }

    #[test]
    fn timestamp_field_builds_without_panicking() {
        let payload = codec::build_dp_query_payload("gw", "dev");
        assert_eq!(payload["gwId"], Value::String("gw".to_string()));
    }

    #[test]
    fn unsolicited_status_merges_dps_and_aliases_without_completing_any_command() {
        let l = Loop::new().unwrap();
        let dev = test_device(l);
        dev.borrow_mut().self_weak = Rc::downgrade(&dev);

        let msg = Message::new(
            0,
            crate::codec::CMD_STATUS,
            serde_json::json!({"dps": {"20": true, "22": 500}}),
        );
        dev.borrow_mut().handle_message(Token(0), msg);

        let d = dev.borrow();
        assert_eq!(d.dps_cache.get("20"), Some(&Value::Bool(true)));
        assert_eq!(d.dps_cache.get("22"), Some(&serde_json::json!(500)));
        assert_eq!(d.is_on(), Ok(true));
        assert_eq!(d.brightness(), Some(500));
    }

    #[test]
    fn message_matching_seq_no_but_different_cmd_does_not_complete() {
        let l = Loop::new().unwrap();
        let dev = test_device(l);
        dev.borrow_mut().self_weak = Rc::downgrade(&dev);
        dev.borrow_mut().state = State::Awaiting;
        dev.borrow_mut().cmd_ctx = Some(CmdCtx {
            seq_no: 3,
            cmd: CMD_CONTROL,
            callback: Some(Box::new(|_| panic!("should not fire"))),
        });

        // Same seq_no as the in-flight command but a different cmd id (as an
        // unrelated STATUS push might coincidentally carry) must not be
        // mistaken for that command's reply.
        let msg = Message::new(3, crate::codec::CMD_STATUS, serde_json::json!({"dps": {"1": true}}));
        dev.borrow_mut().handle_message(Token(0), msg);

        assert!(dev.borrow().cmd_ctx.is_some());
        assert_eq!(dev.borrow().state, State::Awaiting);
    }
}
