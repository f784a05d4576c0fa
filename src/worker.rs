//! The external-facing façade: runs the reactor on a dedicated thread and
//! translates its internal `Event`s into a small `DeviceObserver` callback
//! interface, while accepting commands from any other thread through an
//! `mpsc` channel paired with the reactor's `mio::Waker`.
//!
//! `push_work` itself stays reactor-thread-only (see `reactor.rs`) — this is
//! the channel-plus-waker boundary that satisfies the cross-thread
//! submission requirement without making the `Rc<RefCell<_>>` handler graph
//! `Send`, the same split `hdds-team-hdds`'s `IoThreadHandle`/`IoThread`
//! pair draws between the handle a caller holds and the thread that owns
//! the actual I/O state.

use mio::Token;
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::codec::Message;
use crate::config::Config;
use crate::device::{Device, DeviceError};
use crate::handler::Handler;
use crate::reactor::Loop;
use crate::scanner::{Scanner, ScannerError};

/// Notifications about devices the worker has discovered or is managing.
/// `Send` because the `Box<dyn DeviceObserver>` crosses from the caller's
/// thread into the reactor thread at `Worker::spawn`; every call happens
/// on the reactor thread afterward, never concurrently.
pub trait DeviceObserver: Send {
    fn device_connected(&mut self, addr: SocketAddr) {
        tracing::debug!(%addr, "device_connected (default no-op)");
    }
    fn device_disconnected(&mut self, addr: SocketAddr) {
        tracing::debug!(%addr, "device_disconnected (default no-op)");
    }
    fn device_discovered(&mut self, addr: SocketAddr) {
        tracing::debug!(%addr, "device_discovered (default no-op)");
    }
    fn new_device_data(&mut self, addr: SocketAddr, data: Value) {
        tracing::debug!(%addr, ?data, "new_device_data (default no-op)");
    }
}

type ReplyCallback = Box<dyn FnOnce(Result<Value, DeviceError>) + Send>;

enum Command {
    SetOn(SocketAddr, bool, Option<ReplyCallback>),
    Toggle(SocketAddr, Option<ReplyCallback>),
    SetBrightness(SocketAddr, u32, Option<ReplyCallback>),
    SetColourTemp(SocketAddr, u32, Option<ReplyCallback>),
    Shutdown,
}

#[derive(Debug)]
pub enum WorkerError {
    Reactor(String),
    Scanner(ScannerError),
    SpawnFailed(String),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Reactor(msg) => write!(f, "reactor init failed: {msg}"),
            WorkerError::Scanner(e) => write!(f, "scanner init failed: {e}"),
            WorkerError::SpawnFailed(msg) => write!(f, "failed to spawn worker thread: {msg}"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<std::io::Error> for WorkerError {
    fn from(e: std::io::Error) -> Self {
        WorkerError::Reactor(e.to_string())
    }
}

impl From<ScannerError> for WorkerError {
    fn from(e: ScannerError) -> Self {
        WorkerError::Scanner(e)
    }
}

/// The dedicated-thread façade. Dropping it signals the reactor thread to
/// stop; call `shutdown` instead to block until it has actually exited.
pub struct Worker {
    cmd_tx: mpsc::Sender<Command>,
    waker: Arc<mio::Waker>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// `Loop` and `Scanner` are built *inside* the spawned thread, not
    /// handed to it: their `Rc<RefCell<_>>` handler graph isn't `Send`, so
    /// nothing but the plain data (`Config`, the `Send` `DeviceObserver`)
    /// and the command channel crosses the thread boundary at spawn time.
    /// The one thing the calling thread needs back — the `Waker` — is
    /// itself `Send + Sync` by design, so it comes back over a one-shot
    /// channel once the reactor thread has constructed it.
    pub fn spawn(config: Config, observer: Box<dyn DeviceObserver>) -> Result<Worker, WorkerError> {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (waker_tx, waker_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("tuya-reactor".to_string())
            .spawn(move || {
                let loop_handle = match Loop::new() {
                    Ok(l) => l,
                    Err(e) => {
                        tracing::error!(error = %e, "reactor init failed");
                        return;
                    }
                };
                let _ = waker_tx.send(loop_handle.waker());

                let scanner = match Scanner::spawn(loop_handle.clone(), Arc::new(config)) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!(error = %e, "scanner init failed");
                        return;
                    }
                };

                Worker::run(loop_handle, scanner, cmd_rx, observer);
            })
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

        let waker = waker_rx
            .recv()
            .map_err(|_| WorkerError::SpawnFailed("reactor thread exited during init".to_string()))?;

        Ok(Worker { cmd_tx, waker, handle: Some(handle) })
    }

    pub fn set_on(
        &self,
        addr: SocketAddr,
        on: bool,
        callback: impl FnOnce(Result<Value, DeviceError>) + Send + 'static,
    ) {
        self.send(Command::SetOn(addr, on, Some(Box::new(callback))));
    }

    pub fn toggle(&self, addr: SocketAddr, callback: impl FnOnce(Result<Value, DeviceError>) + Send + 'static) {
        self.send(Command::Toggle(addr, Some(Box::new(callback))));
    }

    pub fn set_brightness(
        &self,
        addr: SocketAddr,
        value: u32,
        callback: impl FnOnce(Result<Value, DeviceError>) + Send + 'static,
    ) {
        self.send(Command::SetBrightness(addr, value, Some(Box::new(callback))));
    }

    pub fn set_colour_temp(
        &self,
        addr: SocketAddr,
        value: u32,
        callback: impl FnOnce(Result<Value, DeviceError>) + Send + 'static,
    ) {
        self.send(Command::SetColourTemp(addr, value, Some(Box::new(callback))));
    }

    /// Signal the reactor thread to stop and wait for it to exit.
    pub fn shutdown(mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        let _ = self.waker.wake();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn send(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).is_ok() {
            let _ = self.waker.wake();
        }
    }

    fn run(
        loop_handle: Loop,
        scanner: Rc<RefCell<Scanner>>,
        cmd_rx: mpsc::Receiver<Command>,
        observer: Box<dyn DeviceObserver>,
    ) {
        let scanner_token = scanner.borrow().token();
        let bridge: Rc<RefCell<dyn Handler>> =
            Rc::new(RefCell::new(ObserverBridge { observer, scanner_token }));
        loop_handle.attach_promiscuous(bridge);

        loop {
            let mut shutting_down = false;
            while let Ok(cmd) = cmd_rx.try_recv() {
                if matches!(cmd, Command::Shutdown) {
                    shutting_down = true;
                    break;
                }
                Self::dispatch_command(&scanner, cmd);
            }
            if shutting_down {
                break;
            }

            if let Err(e) = loop_handle.run_once(Duration::from_millis(1000)) {
                tracing::error!(error = %e, "reactor tick failed");
            }
        }
    }

    fn dispatch_command(scanner: &Rc<RefCell<Scanner>>, cmd: Command) {
        let device = match &cmd {
            Command::SetOn(addr, ..)
            | Command::Toggle(addr, ..)
            | Command::SetBrightness(addr, ..)
            | Command::SetColourTemp(addr, ..) => scanner.borrow().get_device(addr.ip()),
            Command::Shutdown => return,
        };

        let device = match device {
            Some(d) => d,
            None => {
                Self::reply(cmd, Err(DeviceError::Disconnected));
                return;
            }
        };

        let result = match cmd {
            Command::SetOn(_, on, cb) => Device::set_on(&device, on, reply_fn(cb)),
            Command::Toggle(_, cb) => Device::toggle(&device, reply_fn(cb)),
            Command::SetBrightness(_, v, cb) => Device::set_brightness(&device, v, reply_fn(cb)),
            Command::SetColourTemp(_, v, cb) => Device::set_colour_temp(&device, v, reply_fn(cb)),
            Command::Shutdown => return,
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "command rejected");
        }
    }

    fn reply(cmd: Command, result: Result<Value, DeviceError>) {
        let cb = match cmd {
            Command::SetOn(_, _, cb)
            | Command::Toggle(_, cb)
            | Command::SetBrightness(_, _, cb)
            | Command::SetColourTemp(_, _, cb) => cb,
            Command::Shutdown => None,
        };
        if let Some(cb) = cb {
            cb(result);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.cmd_tx.send(Command::Shutdown);
            let _ = self.waker.wake();
        }
    }
}

fn reply_fn(cb: Option<ReplyCallback>) -> impl FnOnce(Result<Value, DeviceError>) + 'static {
    move |result| {
        if let Some(cb) = cb {
            cb(result);
        }
    }
}

struct ObserverBridge {
    observer: Box<dyn DeviceObserver>,
    scanner_token: Token,
}

impl Handler for ObserverBridge {
    fn on_connected(&mut self, _fd: Token, addr: SocketAddr) {
        self.observer.device_connected(addr);
    }

    fn on_close(&mut self, _fd: Token, addr: SocketAddr) {
        self.observer.device_disconnected(addr);
    }

    fn on_message(&mut self, fd: Token, addr: SocketAddr, msg: &Message) {
        if fd == self.scanner_token {
            self.observer.device_discovered(addr);
        } else {
            self.observer.new_device_data(addr, msg.data.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingObserver {
        discovered: Arc<AtomicBool>,
    }

    impl DeviceObserver for RecordingObserver {
        fn device_discovered(&mut self, _addr: SocketAddr) {
            self.discovered.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn worker_spawns_and_shuts_down_cleanly() {
        let discovered = Arc::new(AtomicBool::new(false));
        let config = Config {
            discovery_port: 0,
            inventory_path: "/nonexistent/devices.json".to_string(),
            ..Config::default()
        };
        let worker = Worker::spawn(config, Box::new(RecordingObserver { discovered })).unwrap();
        worker.shutdown();
    }
}
