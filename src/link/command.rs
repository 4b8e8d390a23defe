//! Configuration command/response pairs for the transceiver's serial
//! register protocol.
//!
//! A write command starts with `0xC0`, the echoed acknowledgement with
//! `0xC1`; the rest of the bytes (register offset, payload length, payload)
//! must match byte for byte. Anything else is treated as a failed attempt.

/// One register write plus the exact acknowledgement that proves it landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigCommand {
    pub label: &'static str,
    pub request: Vec<u8>,
    pub expected: Vec<u8>,
}

const WRITE_HEADER: u8 = 0xC0;
const ACK_HEADER: u8 = 0xC1;

const ADDRESS_REG: u8 = 0x00;
const CHANNEL_REG: u8 = 0x04;

impl ConfigCommand {
    /// Program the ADDH/ADDL address registers together with the serial
    /// parameter register (`reg0`) they share a write block with.
    pub fn set_address(address: u16, reg0: u8) -> Self {
        let high = (address >> 8) as u8;
        let low = (address & 0xFF) as u8;
        Self {
            label: "address-set",
            request: vec![WRITE_HEADER, ADDRESS_REG, 0x03, high, low, reg0],
            expected: vec![ACK_HEADER, ADDRESS_REG, 0x03, high, low, reg0],
        }
    }

    /// Program the channel register.
    pub fn set_channel(channel: u8) -> Self {
        Self {
            label: "channel-set",
            request: vec![WRITE_HEADER, CHANNEL_REG, 0x01, channel],
            expected: vec![ACK_HEADER, CHANNEL_REG, 0x01, channel],
        }
    }
}
