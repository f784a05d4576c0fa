//! A local-network client library for Tuya-protocol IoT devices: a
//! single-threaded, `mio`-backed I/O reactor, the `0x55AA` wire codec, a
//! per-device session state machine, a UDP discovery listener, and a
//! dedicated-thread `Worker` façade for driving all of it from other
//! threads.

pub mod codec;
pub mod config;
pub mod device;
pub mod dps;
pub mod event;
pub mod handler;
pub mod inventory;
pub mod reactor;
pub mod scanner;
pub mod socket;
pub mod tcp;
pub mod udp;
pub mod worker;

pub use config::{load_config, Config, ConfigError};
pub use device::{Device, DeviceError};
pub use event::Event;
pub use handler::Handler;
pub use reactor::{Loop, ReactorError};
pub use scanner::{Scanner, ScannerError};
pub use worker::{DeviceObserver, Worker, WorkerError};
