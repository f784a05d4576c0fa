//! Demonstration binary: loads configuration and the device inventory,
//! starts the discovery listener and reactor thread, and logs every
//! device notification it receives until the process is killed.

use std::net::SocketAddr;
use std::time::Duration;

use tuya_reactor::{load_config, DeviceObserver, Worker};

struct LoggingObserver;

impl DeviceObserver for LoggingObserver {
    fn device_connected(&mut self, addr: SocketAddr) {
        tracing::info!(%addr, "device connected");
    }

    fn device_disconnected(&mut self, addr: SocketAddr) {
        tracing::warn!(%addr, "device disconnected");
    }

    fn device_discovered(&mut self, addr: SocketAddr) {
        tracing::info!(%addr, "device discovered on LAN");
    }

    fn new_device_data(&mut self, addr: SocketAddr, data: serde_json::Value) {
        tracing::info!(%addr, ?data, "device reported data");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tuya_reactor=info")),
        )
        .init();

    let config = load_config("tuya-reactor.toml")?;
    tracing::info!(
        discovery_port = config.discovery_port,
        device_port = config.device_port,
        inventory_path = %config.inventory_path,
        "configuration loaded"
    );

    let _worker = Worker::spawn(config, Box::new(LoggingObserver))?;
    tracing::info!("worker running, waiting for devices");

    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
