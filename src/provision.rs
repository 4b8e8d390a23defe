//! Node provisioning: deterministic radio address assignment and device
//! directory maintenance.
//!
//! Every node derives its default radio address from its immutable hardware
//! identifier, so a re-imaged board always comes back under the same address.
//! The directory record is keyed by the board's network MAC: provisioning an
//! already-known MAC updates its record in place instead of duplicating it.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::config::{DeviceDirectory, NodeEntry, NodeRole, RadioRegisters};

/// Derive the default 16-bit radio address from a hardware identifier.
///
/// SHA-256 of the identifier reduced modulo 0x10000, i.e. the last two bytes
/// of the digest interpreted big-endian. Deterministic across runs and
/// machines.
pub fn derive_address(hardware_id: &str) -> u16 {
    let digest = Sha256::digest(hardware_id.as_bytes());
    u16::from_be_bytes([digest[30], digest[31]])
}

#[derive(Debug, Deserialize)]
struct HardwareIdFile {
    val: String,
}

/// Read the board's hardware identifier from its metadata JSON file.
pub fn read_hardware_id(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read hardware id file {}", path.display()))?;
    let parsed: HardwareIdFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse hardware id file {}", path.display()))?;
    if parsed.val.trim().is_empty() {
        bail!("Hardware id file {} contains an empty id", path.display());
    }
    Ok(parsed.val.trim().to_string())
}

/// Read the MAC address of a network interface from sysfs, uppercased.
pub fn interface_mac(interface: &str) -> Result<String> {
    let path = format!("/sys/class/net/{interface}/address");
    let mac = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read MAC address from {path}"))?;
    let mac = mac.trim().to_uppercase();
    if mac.is_empty() {
        bail!("Interface {interface} reports an empty MAC address");
    }
    Ok(mac)
}

/// Operator-supplied provisioning parameters.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub hardware_id: String,
    pub mac_address: String,
    pub role: NodeRole,
    pub channel: u8,
    pub radio_type: String,
    /// Explicit address override; the derived address is used when absent.
    pub operator_address: Option<u16>,
    /// Register slot id; auto-assigned past the current maximum when absent.
    pub unit_id: Option<u16>,
}

/// Merge one node into the directory. Returns the identifier the record
/// ended up under (an already-provisioned MAC keeps its original key).
pub fn provision(directory: &mut DeviceDirectory, request: ProvisionRequest) -> Result<String> {
    let derived = derive_address(&request.hardware_id);

    let key = match directory.find_by_mac(&request.mac_address) {
        Some(existing) => {
            log::info!(
                "MAC {} already provisioned as {existing}, updating its record",
                request.mac_address
            );
            existing.to_string()
        }
        None => request.hardware_id.clone(),
    };

    let unit_id = match request.unit_id {
        Some(explicit) => explicit,
        None => match directory.get(&key) {
            Some(existing) => existing.unit_id,
            None => next_unit_id(directory),
        },
    };

    let entry = NodeEntry {
        mac_address: request.mac_address.clone(),
        radio_type: request.radio_type,
        role: request.role,
        channel: request.channel,
        derived_address: derived,
        operator_address: request.operator_address,
        unit_id,
        registers: directory
            .get(&key)
            .map(|existing| existing.registers.clone())
            .unwrap_or_default(),
    };

    log::info!(
        "Provisioned {key}: address 0x{:04X} (derived 0x{derived:04X}), channel 0x{:02X}, unit {unit_id}",
        entry.effective_address(),
        entry.channel
    );
    directory.nodes.insert(key.clone(), entry);
    Ok(key)
}

fn next_unit_id(directory: &DeviceDirectory) -> u16 {
    directory
        .nodes
        .values()
        .map(|entry| entry.unit_id)
        .max()
        .map(|max| max + 1)
        .unwrap_or(1)
}

/// Full provisioning pass as driven by the CLI: read the hardware id, look
/// up the interface MAC, merge into the directory file and persist it. A
/// missing or malformed hardware id file fails before anything is written.
pub fn run(
    directory_path: impl AsRef<Path>,
    hardware_id_path: impl AsRef<Path>,
    interface: &str,
    role: NodeRole,
    channel: u8,
    radio_type: String,
    operator_address: Option<u16>,
    unit_id: Option<u16>,
) -> Result<()> {
    let hardware_id = read_hardware_id(hardware_id_path)?;
    let mac_address = interface_mac(interface)?;

    let directory_path = directory_path.as_ref();
    let mut directory = if directory_path.exists() {
        DeviceDirectory::from_file(directory_path)?
    } else {
        DeviceDirectory::default()
    };

    provision(
        &mut directory,
        ProvisionRequest {
            hardware_id,
            mac_address,
            role,
            channel,
            radio_type,
            operator_address,
            unit_id,
        },
    )?;
    directory.save(directory_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(hardware_id: &str, mac: &str) -> ProvisionRequest {
        ProvisionRequest {
            hardware_id: hardware_id.into(),
            mac_address: mac.into(),
            role: NodeRole::Sender,
            channel: 0x17,
            radio_type: "e220".into(),
            operator_address: None,
            unit_id: None,
        }
    }

    #[test]
    fn test_derive_address_is_deterministic() {
        let first = derive_address("492e39d7");
        let second = derive_address("492e39d7");
        assert_eq!(first, second);
        assert_ne!(derive_address("492e39d7"), derive_address("492e39d8"));
    }

    #[test]
    fn test_new_node_gets_inserted() {
        let mut directory = DeviceDirectory::default();
        let key = provision(&mut directory, request("492e39d7", "AA:BB:CC:00:00:01")).unwrap();
        assert_eq!(key, "492e39d7");

        let entry = directory.get("492e39d7").unwrap();
        assert_eq!(entry.derived_address, derive_address("492e39d7"));
        assert_eq!(entry.effective_address(), entry.derived_address);
        assert_eq!(entry.unit_id, 1);
        assert_eq!(entry.registers, RadioRegisters::default());
    }

    #[test]
    fn test_reprovision_same_mac_updates_in_place() {
        let mut directory = DeviceDirectory::default();
        provision(&mut directory, request("492e39d7", "AA:BB:CC:00:00:01")).unwrap();

        // Same board, re-imaged under a new identifier: the MAC wins.
        let mut second = request("deadbeef", "aa:bb:cc:00:00:01");
        second.operator_address = Some(0x0042);
        let key = provision(&mut directory, second).unwrap();

        assert_eq!(key, "492e39d7");
        assert_eq!(directory.len(), 1);
        let entry = directory.get("492e39d7").unwrap();
        assert_eq!(entry.effective_address(), 0x0042);
        assert_eq!(entry.unit_id, 1, "unit id survives re-provisioning");
    }

    #[test]
    fn test_unit_ids_auto_increment() {
        let mut directory = DeviceDirectory::default();
        provision(&mut directory, request("node-a", "AA:00:00:00:00:01")).unwrap();
        provision(&mut directory, request("node-b", "AA:00:00:00:00:02")).unwrap();
        provision(&mut directory, request("node-c", "AA:00:00:00:00:03")).unwrap();

        let units: Vec<u16> = directory
            .ordered()
            .iter()
            .map(|(_, entry)| entry.unit_id)
            .collect();
        assert_eq!(units, vec![1, 2, 3]);
    }

    #[test]
    fn test_missing_hardware_id_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let directory_path = dir.path().join("devices.json");
        let result = run(
            &directory_path,
            dir.path().join("absent-id.json"),
            "eth0",
            NodeRole::Sender,
            0x17,
            "e220".into(),
            None,
            None,
        );
        assert!(result.is_err());
        assert!(!directory_path.exists());
    }

    #[test]
    fn test_malformed_hardware_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let id_path = dir.path().join("id.json");
        std::fs::write(&id_path, r#"{"val": ""}"#).unwrap();
        assert!(read_hardware_id(&id_path).is_err());

        std::fs::write(&id_path, "not json").unwrap();
        assert!(read_hardware_id(&id_path).is_err());
    }
}
