//! Startup configuration: the device directory and the gateway settings file.
//!
//! The directory maps each node's immutable hardware identifier to its radio
//! provisioning record. It is written by the `provision` subcommand and read
//! once at startup; a missing or malformed directory is fatal, because the
//! Modbus register layout is derived from it and must not change while the
//! process is running.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::Path};

/// Whether a node transmits telemetry or receives the whole fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Sender,
    Receiver,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Sender => write!(f, "sender"),
            NodeRole::Receiver => write!(f, "receiver"),
        }
    }
}

/// Raw transceiver register values carried along for the configuration
/// handshake. Defaults match the E220 factory settings the fleet ships with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RadioRegisters {
    #[serde(with = "hex_u8", default = "default_reg0")]
    pub reg0: u8,
    #[serde(with = "hex_u8", default)]
    pub reg1: u8,
    #[serde(with = "hex_u8", default)]
    pub reg2: u8,
    #[serde(with = "hex_u8", default)]
    pub reg3: u8,
    #[serde(with = "hex_u8", default)]
    pub crypt_h: u8,
    #[serde(with = "hex_u8", default)]
    pub crypt_l: u8,
}

fn default_reg0() -> u8 {
    0x62
}

impl Default for RadioRegisters {
    fn default() -> Self {
        Self {
            reg0: default_reg0(),
            reg1: 0,
            reg2: 0,
            reg3: 0,
            crypt_h: 0,
            crypt_l: 0,
        }
    }
}

/// One provisioned node in the device directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEntry {
    /// Immutable network hardware address, the merge key for re-provisioning.
    pub mac_address: String,
    /// Transceiver family, e.g. "e220".
    pub radio_type: String,
    pub role: NodeRole,
    #[serde(with = "hex_u8")]
    pub channel: u8,
    /// Hash-derived radio address.
    #[serde(with = "hex_u16")]
    pub derived_address: u16,
    /// Operator-assigned override; takes precedence for channel programming.
    #[serde(with = "hex_u16_opt", default, skip_serializing_if = "Option::is_none")]
    pub operator_address: Option<u16>,
    /// Numeric id placed in cell 0 of this node's register slot.
    pub unit_id: u16,
    #[serde(default)]
    pub registers: RadioRegisters,
}

impl NodeEntry {
    /// The address actually programmed into the transceiver.
    pub fn effective_address(&self) -> u16 {
        self.operator_address.unwrap_or(self.derived_address)
    }

    /// High/low byte split of the effective address.
    pub fn address_bytes(&self) -> (u8, u8) {
        let addr = self.effective_address();
        ((addr >> 8) as u8, (addr & 0xFF) as u8)
    }
}

/// The startup-loaded map from hardware identifier to node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceDirectory {
    pub nodes: BTreeMap<String, NodeEntry>,
}

impl DeviceDirectory {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read device directory {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse device directory {}", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write device directory {}", path.display()))
    }

    pub fn get(&self, hardware_id: &str) -> Option<&NodeEntry> {
        self.nodes.get(hardware_id)
    }

    /// Look a node up by its network hardware address (re-provision path).
    pub fn find_by_mac(&self, mac: &str) -> Option<&str> {
        self.nodes
            .iter()
            .find(|(_, entry)| entry.mac_address.eq_ignore_ascii_case(mac))
            .map(|(id, _)| id.as_str())
    }

    /// Nodes in register-table order. The slot layout served over Modbus is
    /// fixed by ascending unit id, so re-provisioning a node never reshuffles
    /// the registers of the others.
    pub fn ordered(&self) -> Vec<(&str, &NodeEntry)> {
        let mut nodes: Vec<_> = self
            .nodes
            .iter()
            .map(|(id, entry)| (id.as_str(), entry))
            .collect();
        nodes.sort_by_key(|(_, entry)| entry.unit_id);
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Names of the sysfs control lines driving the transceiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PinNames {
    #[serde(default = "default_pin_base")]
    pub base_dir: String,
    #[serde(default = "default_m0")]
    pub m0: String,
    #[serde(default = "default_m1")]
    pub m1: String,
    #[serde(default = "default_radio_vcc")]
    pub radio_vcc: String,
    #[serde(default = "default_usb_enable")]
    pub usb_enable: String,
}

fn default_pin_base() -> String {
    "/sys/class/leds".into()
}
fn default_m0() -> String {
    "green_cntrl".into()
}
fn default_m1() -> String {
    "red_cntrl".into()
}
fn default_radio_vcc() -> String {
    "lazer_cntrl".into()
}
fn default_usb_enable() -> String {
    "usb2_en".into()
}

impl Default for PinNames {
    fn default() -> Self {
        Self {
            base_dir: default_pin_base(),
            m0: default_m0(),
            m1: default_m1(),
            radio_vcc: default_radio_vcc(),
            usb_enable: default_usb_enable(),
        }
    }
}

/// Root settings structure for both node roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GatewayConfig {
    /// Serial device of the LoRa transceiver.
    pub radio_port: String,
    /// Serial device served to the Modbus master; `None` runs radio-only.
    #[serde(default)]
    pub fieldbus_port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Modbus slave address the register table is served under.
    #[serde(default = "default_slave_address")]
    pub slave_address: u8,
    pub directory_path: String,
    pub hardware_id_path: String,
    #[serde(default = "default_sensor_sample_path")]
    pub sensor_sample_path: String,
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: String,
    #[serde(default = "default_audit_max_kb")]
    pub audit_max_kb: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_send_interval_secs")]
    pub send_interval_secs: u64,
    #[serde(default = "default_listen_window_secs")]
    pub listen_window_secs: u64,
    #[serde(default)]
    pub pins: PinNames,
}

fn default_baud_rate() -> u32 {
    9600
}
fn default_slave_address() -> u8 {
    2
}
fn default_sensor_sample_path() -> String {
    "/var/lib/aerobridge/sample.json".into()
}
fn default_audit_log_path() -> String {
    "/var/lib/aerobridge/receiver_log_buffer.txt".into()
}
fn default_audit_max_kb() -> u64 {
    1000
}
fn default_stale_after_secs() -> u64 {
    600
}
fn default_check_interval_secs() -> u64 {
    60
}
fn default_send_interval_secs() -> u64 {
    5
}
fn default_listen_window_secs() -> u64 {
    5
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            radio_port: "/dev/ttyUSB0".into(),
            fieldbus_port: None,
            baud_rate: default_baud_rate(),
            slave_address: default_slave_address(),
            directory_path: "/etc/aerobridge/devices.json".into(),
            hardware_id_path: "/tmp/meta_files/UNIQUE_ID/id-displayboard.json".into(),
            sensor_sample_path: default_sensor_sample_path(),
            audit_log_path: default_audit_log_path(),
            audit_max_kb: default_audit_max_kb(),
            stale_after_secs: default_stale_after_secs(),
            check_interval_secs: default_check_interval_secs(),
            send_interval_secs: default_send_interval_secs(),
            listen_window_secs: default_listen_window_secs(),
            pins: PinNames::default(),
        }
    }
}

impl GatewayConfig {
    /// Parse configuration from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }

    /// Read configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))
    }

    /// Convert to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Serde helpers for the `0x`-prefixed hex strings the directory file uses.
macro_rules! hex_field {
    ($name:ident, $ty:ty, $width:literal) => {
        pub mod $name {
            use serde::{Deserialize, Deserializer, Serializer};

            pub fn serialize<S: Serializer>(value: &$ty, ser: S) -> Result<S::Ok, S::Error> {
                ser.serialize_str(&format!(concat!("0x{:0", $width, "X}"), value))
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<$ty, D::Error> {
                let raw = String::deserialize(de)?;
                let digits = raw
                    .strip_prefix("0x")
                    .or_else(|| raw.strip_prefix("0X"))
                    .unwrap_or(&raw);
                <$ty>::from_str_radix(digits, 16).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_field!(hex_u8, u8, 2);
hex_field!(hex_u16, u16, 4);

pub mod hex_u16_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u16>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => ser.serialize_str(&format!("0x{v:04X}")),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<u16>, D::Error> {
        let raw: Option<String> = Option::deserialize(de)?;
        match raw {
            None => Ok(None),
            Some(raw) => {
                let digits = raw
                    .strip_prefix("0x")
                    .or_else(|| raw.strip_prefix("0X"))
                    .unwrap_or(&raw);
                u16::from_str_radix(digits, 16)
                    .map(Some)
                    .map_err(serde::de::Error::custom)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(unit_id: u16, role: NodeRole) -> NodeEntry {
        NodeEntry {
            mac_address: format!("AA:BB:CC:DD:EE:{unit_id:02X}"),
            radio_type: "e220".into(),
            role,
            channel: 0x17,
            derived_address: 0x1A2B,
            operator_address: None,
            unit_id,
            registers: RadioRegisters::default(),
        }
    }

    #[test]
    fn test_directory_serialization() {
        let mut directory = DeviceDirectory::default();
        directory
            .nodes
            .insert("492e39d7".into(), sample_entry(7, NodeRole::Sender));
        directory
            .nodes
            .insert("0badcafe".into(), sample_entry(1, NodeRole::Receiver));

        let json = serde_json::to_string_pretty(&directory).unwrap();
        assert!(json.contains("\"0x1A2B\""));
        assert!(json.contains("\"0x17\""));

        let parsed: DeviceDirectory = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.nodes.len(), 2);
        assert_eq!(parsed.get("492e39d7").unwrap().unit_id, 7);
        assert_eq!(parsed.get("492e39d7").unwrap().derived_address, 0x1A2B);
    }

    #[test]
    fn test_ordered_by_unit_id() {
        let mut directory = DeviceDirectory::default();
        directory
            .nodes
            .insert("zzz".into(), sample_entry(3, NodeRole::Sender));
        directory
            .nodes
            .insert("aaa".into(), sample_entry(9, NodeRole::Sender));
        directory
            .nodes
            .insert("mmm".into(), sample_entry(1, NodeRole::Receiver));

        let units: Vec<u16> = directory
            .ordered()
            .iter()
            .map(|(_, entry)| entry.unit_id)
            .collect();
        assert_eq!(units, vec![1, 3, 9]);
    }

    #[test]
    fn test_operator_address_precedence() {
        let mut entry = sample_entry(7, NodeRole::Sender);
        assert_eq!(entry.effective_address(), 0x1A2B);
        assert_eq!(entry.address_bytes(), (0x1A, 0x2B));

        entry.operator_address = Some(0x0001);
        assert_eq!(entry.effective_address(), 0x0001);
        assert_eq!(entry.address_bytes(), (0x00, 0x01));
    }

    #[test]
    fn test_find_by_mac_is_case_insensitive() {
        let mut directory = DeviceDirectory::default();
        directory
            .nodes
            .insert("492e39d7".into(), sample_entry(7, NodeRole::Sender));
        assert_eq!(
            directory.find_by_mac("aa:bb:cc:dd:ee:07"),
            Some("492e39d7")
        );
        assert_eq!(directory.find_by_mac("11:22:33:44:55:66"), None);
    }

    #[test]
    fn test_settings_defaults_roundtrip() {
        let config = GatewayConfig::default();
        let json = config.to_json().unwrap();
        let parsed = GatewayConfig::from_json(&json).unwrap();
        assert_eq!(parsed.baud_rate, 9600);
        assert_eq!(parsed.slave_address, 2);
        assert_eq!(parsed.stale_after_secs, 600);
        assert_eq!(parsed.pins.base_dir, "/sys/class/leds");
    }

    #[test]
    fn test_minimal_settings_file() {
        let json = r#"{
            "radio_port": "/dev/ttyUSB1",
            "directory_path": "/tmp/devices.json",
            "hardware_id_path": "/tmp/id.json"
        }"#;
        let parsed = GatewayConfig::from_json(json).unwrap();
        assert_eq!(parsed.radio_port, "/dev/ttyUSB1");
        assert!(parsed.fieldbus_port.is_none());
        assert_eq!(parsed.check_interval_secs, 60);
    }

    #[test]
    fn test_malformed_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(DeviceDirectory::from_file(&path).is_err());
        assert!(DeviceDirectory::from_file(dir.path().join("absent.json")).is_err());
    }
}
