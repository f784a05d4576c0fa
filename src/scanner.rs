//! UDP discovery listener and device registry.
//!
//! Tuya gateways broadcast plaintext-JSON `UDP_NEW` beacons every few
//! seconds containing their IP and gateway id. The scanner listens for
//! these, cross-references the IP against the local inventory file to
//! recover the `local_key` a broadcast never carries, and spawns a `Device`
//! session the first time each known IP is seen.
//!
//! Grounded on the same attach-a-single-fd-and-own-it shape as `Device`
//! (see `device.rs`), and on `hdds-team-hdds`'s discovery/SPDP listener for
//! the "broadcast announces a peer, a lookup table resolves it into a
//! session" structure.

use mio::net::UdpSocket as MioUdpSocket;
use mio::Token;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::codec;
use crate::config::Config;
use crate::device::Device;
use crate::event::Event;
use crate::handler::Handler;
use crate::inventory::{self, InventoryError, InventoryRecord};
use crate::reactor::Loop;
use crate::udp;

const RECV_SCRATCH_SIZE: usize = 2048;

#[derive(Debug)]
pub enum ScannerError {
    Io(String),
    Inventory(InventoryError),
}

impl fmt::Display for ScannerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScannerError::Io(msg) => write!(f, "discovery socket error: {msg}"),
            ScannerError::Inventory(e) => write!(f, "inventory error: {e}"),
        }
    }
}

impl std::error::Error for ScannerError {}

impl From<InventoryError> for ScannerError {
    fn from(e: InventoryError) -> Self {
        ScannerError::Inventory(e)
    }
}

pub struct Scanner {
    loop_handle: Loop,
    token: Token,
    socket: Option<MioUdpSocket>,
    config: Arc<Config>,
    inventory: HashMap<IpAddr, InventoryRecord>,
    devices: HashMap<IpAddr, Rc<RefCell<Device>>>,
    self_weak: Weak<RefCell<Scanner>>,
}

impl fmt::Debug for Scanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scanner")
            .field("known_devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}

impl Scanner {
    pub fn spawn(loop_handle: Loop, config: Arc<Config>) -> Result<Rc<RefCell<Scanner>>, ScannerError> {
        let inventory = inventory::load(&config.inventory_path)?;
        let mut socket = udp::bind_discovery(config.discovery_port)
            .map_err(|e| ScannerError::Io(e.to_string()))?;

        let token = loop_handle.next_token();
        let scanner = Rc::new(RefCell::new(Scanner {
            loop_handle: loop_handle.clone(),
            token,
            socket: None,
            config,
            inventory,
            devices: HashMap::new(),
            self_weak: Weak::new(),
        }));
        scanner.borrow_mut().self_weak = Rc::downgrade(&scanner);

        let handler: Rc<RefCell<dyn Handler>> = scanner.clone();
        loop_handle
            .attach_read(token, handler, &mut socket)
            .map_err(|e| ScannerError::Io(e.to_string()))?;
        scanner.borrow_mut().socket = Some(socket);

        tracing::info!(port = scanner.borrow().config.discovery_port, "discovery listening");
        scanner.borrow_mut().spawn_inventory_devices();
        Ok(scanner)
    }

    /// Construct a `Device` session for every inventory entry up front
    /// (spec.md §4.8: "for each inventory entry, construct a `Device`...
    /// eagerly initiates TCP connect"), so a device that never broadcasts a
    /// discovery beacon — e.g. it's behind a firewall, or the beacon is lost —
    /// still gets a session and a connection attempt.
    fn spawn_inventory_devices(&mut self) {
        let records: Vec<InventoryRecord> = self.inventory.values().cloned().collect();
        for record in records {
            let ip = record.ip;
            if self.devices.contains_key(&ip) {
                continue;
            }
            let key = match key_bytes(&record.key) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(%ip, error = %e, "inventory key invalid, using default key");
                    codec::default_key()
                }
            };
            let addr = SocketAddr::new(ip, self.config.device_port);
            let device = Device::spawn(
                self.loop_handle.clone(),
                addr,
                record.uuid.clone(),
                record.id.clone(),
                key,
                self.config.clone(),
                Some(record.name.clone()),
            );
            tracing::info!(%ip, name = %record.name, "pre-populating device from inventory");
            self.devices.insert(ip, device);
        }
    }

    pub fn get_device(&self, ip: IpAddr) -> Option<Rc<RefCell<Device>>> {
        self.devices.get(&ip).cloned()
    }

    pub fn get_devices(&self) -> Vec<Rc<RefCell<Device>>> {
        self.devices.values().cloned().collect()
    }

    pub fn known_device_count(&self) -> usize {
        self.devices.len()
    }

    /// The reactor token the discovery socket is registered under — used to
    /// tell a discovery beacon apart from a device's own traffic at the
    /// observer boundary.
    pub fn token(&self) -> Token {
        self.token
    }

    /// A broadcast from an IP not already in the registry always gets a new
    /// `Device`: the inventory record supplies identity and `local_key` when
    /// known, and `"unknown"` metadata plus the well-known default key
    /// otherwise, so the device can still be reached once a `local_key` is
    /// learned out of band.
    fn handle_discovery(&mut self, ip: IpAddr, msg: codec::Message) {
        if !self.devices.contains_key(&ip) {
            let record = self.inventory.get(&ip).cloned();
            let gw_id = msg.data.get("gwId").and_then(|v| v.as_str()).map(str::to_string);

            let (uuid, id, key, name) = match &record {
                Some(r) => match key_bytes(&r.key) {
                    Ok(key) => (r.uuid.clone(), r.id.clone(), key, r.name.clone()),
                    Err(e) => {
                        tracing::warn!(%ip, error = %e, "inventory key invalid, using default key");
                        (
                            gw_id.clone().unwrap_or_else(|| "unknown".to_string()),
                            r.id.clone(),
                            codec::default_key(),
                            r.name.clone(),
                        )
                    }
                },
                None => {
                    let unknown_id = gw_id.clone().unwrap_or_else(|| "unknown".to_string());
                    (unknown_id.clone(), unknown_id, codec::default_key(), "unknown".to_string())
                }
            };

            let addr = SocketAddr::new(ip, self.config.device_port);
            let device = Device::spawn(
                self.loop_handle.clone(),
                addr,
                uuid,
                id,
                key,
                self.config.clone(),
                Some(name.clone()),
            );
            tracing::info!(%ip, %name, "discovered device, connecting");
            self.devices.insert(ip, device);
        }

        self.loop_handle.dispatch_promiscuous(Event::Message {
            fd: self.token,
            addr: SocketAddr::new(ip, 0),
            msg,
        });
    }
}

impl Handler for Scanner {
    fn on_readable(&mut self, fd: Token) {
        let mut scratch = [0u8; RECV_SCRATCH_SIZE];
        let mut received = Vec::new();

        loop {
            let socket = match self.socket.as_ref() {
                Some(s) => s,
                None => return,
            };
            match socket.recv_from(&mut scratch) {
                Ok((n, from)) => received.push((from, scratch[..n].to_vec())),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "discovery recv failed");
                    break;
                }
            }
        }

        for (from, datagram) in received {
            match codec::parse_one(&datagram, &codec::default_key(), false) {
                Ok((msg, _)) => self.handle_discovery(from.ip(), msg),
                Err(e) => tracing::debug!(%from, error = %e, "discovery packet parse failed"),
            }
        }

        let _ = fd;
    }
}

fn key_bytes(key: &str) -> Result<[u8; 16], String> {
    if key.len() != 16 {
        return Err(format!("local_key is {} bytes, expected 16", key.len()));
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(key.as_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_bytes_rejects_wrong_length() {
        assert!(key_bytes("short").is_err());
        assert!(key_bytes("0123456789abcdef").is_ok());
    }

    #[test]
    fn scanner_starts_with_empty_registry_when_inventory_is_missing() {
        let l = Loop::new().unwrap();
        let config = Arc::new(Config {
            inventory_path: "/nonexistent/devices.json".to_string(),
            discovery_port: 0,
            ..Config::default()
        });
        let scanner = Scanner::spawn(l, config).unwrap();
        assert_eq!(scanner.borrow().known_device_count(), 0);
        assert!(scanner.borrow().get_devices().is_empty());
    }

    #[test]
    fn scanner_pre_populates_devices_from_inventory() {
        let dir = std::env::temp_dir().join(format!("tuya-reactor-scanner-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("devices.json");
        std::fs::write(
            &path,
            r#"[{"ip": "192.0.2.9", "name": "Lamp", "uuid": "gw9", "id": "dev9", "key": "0123456789abcdef"}]"#,
        )
        .unwrap();

        let l = Loop::new().unwrap();
        let config = Arc::new(Config {
            inventory_path: path.to_str().unwrap().to_string(),
            discovery_port: 0,
            ..Config::default()
        });
        let scanner = Scanner::spawn(l, config).unwrap();

        assert_eq!(scanner.borrow().known_device_count(), 1);
        let ip: IpAddr = "192.0.2.9".parse().unwrap();
        let device = scanner.borrow().get_device(ip).unwrap();
        assert_eq!(device.borrow().name.as_deref(), Some("Lamp"));
        assert_eq!(device.borrow().dev_id(), "dev9");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unknown_device_is_registered_with_unknown_metadata() {
        let l = Loop::new().unwrap();
        let config = Arc::new(Config {
            inventory_path: "/nonexistent/devices.json".to_string(),
            discovery_port: 0,
            ..Config::default()
        });
        let scanner = Scanner::spawn(l, config).unwrap();

        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        let msg = codec::Message::new(0, codec::CMD_UDP_NEW, serde_json::json!({"ip": "192.0.2.7"}));
        scanner.borrow_mut().handle_discovery(ip, msg);

        assert_eq!(scanner.borrow().known_device_count(), 1);
        let device = scanner.borrow().get_device(ip).unwrap();
        assert_eq!(device.borrow().name.as_deref(), Some("unknown"));
        assert_eq!(device.borrow().addr(), SocketAddr::new(ip, 6668));
    }
}
