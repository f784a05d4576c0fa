//! The persistent device-inventory file: a JSON array of known devices,
//! keyed by IP, that the scanner uses to pre-populate sessions and to fill
//! in metadata for devices it already knows about.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, Deserialize)]
pub struct InventoryRecord {
    pub ip: IpAddr,
    pub name: String,
    /// `gwId` — the discovered gateway identifier.
    pub uuid: String,
    /// `devId` — the controllable device identifier.
    pub id: String,
    /// 16-byte `local_key`, distributed out of band.
    pub key: String,
}

#[derive(Debug)]
pub enum InventoryError {
    ParseError(String),
    InvalidKeyLength { ip: IpAddr, len: usize },
}

impl fmt::Display for InventoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InventoryError::ParseError(msg) => write!(f, "failed to parse inventory file: {msg}"),
            InventoryError::InvalidKeyLength { ip, len } => {
                write!(f, "device {ip}: local_key is {len} bytes, expected 16")
            }
        }
    }
}

impl std::error::Error for InventoryError {}

/// Load the inventory file at `path`. A missing file is non-fatal and
/// yields an empty inventory — the scanner still works from bare UDP
/// broadcasts alone.
pub fn load(path: &str) -> Result<HashMap<IpAddr, InventoryRecord>, InventoryError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(InventoryError::ParseError(e.to_string())),
    };

    let records: Vec<InventoryRecord> =
        serde_json::from_str(&contents).map_err(|e| InventoryError::ParseError(e.to_string()))?;

    for record in &records {
        if record.key.len() != 16 {
            return Err(InventoryError::InvalidKeyLength {
                ip: record.ip,
                len: record.key.len(),
            });
        }
    }

    Ok(records.into_iter().map(|r| (r.ip, r)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty_inventory() {
        let records = load("/nonexistent/tinytuya/devices.json").unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn parses_array_keyed_by_ip() {
        let dir = std::env::temp_dir().join(format!("tuya-reactor-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("devices.json");
        std::fs::write(
            &path,
            r#"[{"ip": "192.0.2.7", "name": "Lamp", "uuid": "gw1", "id": "dev1", "key": "0123456789abcdef"}]"#,
        )
        .unwrap();

        let records = load(path.to_str().unwrap()).unwrap();
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[&ip].name, "Lamp");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rejects_wrong_length_key() {
        let dir = std::env::temp_dir().join(format!("tuya-reactor-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("devices.json");
        std::fs::write(
            &path,
            r#"[{"ip": "192.0.2.7", "name": "Lamp", "uuid": "gw1", "id": "dev1", "key": "short"}]"#,
        )
        .unwrap();

        let result = load(path.to_str().unwrap());
        assert!(matches!(result, Err(InventoryError::InvalidKeyLength { .. })));

        std::fs::remove_dir_all(&dir).ok();
    }
}
