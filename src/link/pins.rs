//! Sysfs control lines for the transceiver.
//!
//! The carrier board exposes the radio's M0/M1 mode pins and its power rails
//! as LED-class brightness files. Driving a pin writes the level and reads
//! it back; a mismatch is logged but deliberately not fatal — if the lines
//! really are stuck, the configuration handshake fails and the caller
//! escalates to a power cycle.

use std::{
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use crate::config::PinNames;

/// One sysfs brightness file.
#[derive(Debug, Clone)]
pub struct Pin {
    name: String,
    path: PathBuf,
}

impl Pin {
    pub fn new(base_dir: impl AsRef<Path>, name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: base_dir.as_ref().join(name).join("brightness"),
        }
    }

    /// Write a level and verify it by reading the file back.
    pub fn drive(&self, level: u32) {
        let value = level.to_string();
        if let Err(err) = std::fs::write(&self.path, &value) {
            log::warn!("Failed to set pin {}: {err}", self.name);
            return;
        }
        match std::fs::read_to_string(&self.path) {
            Ok(read_back) if read_back.trim() == value => {
                log::debug!("Pin {} set to {value}", self.name);
            }
            Ok(read_back) => {
                log::warn!(
                    "Pin {} read back {:?} after writing {value}",
                    self.name,
                    read_back.trim()
                );
            }
            Err(err) => {
                log::warn!("Failed to read back pin {}: {err}", self.name);
            }
        }
    }
}

/// The M0/M1 mode lines selecting register programming vs. transparent
/// operation.
#[derive(Debug, Clone)]
pub struct ModeLines {
    m0: Pin,
    m1: Pin,
    settle: Duration,
}

/// Both lines high puts the transceiver into register-programming mode.
const MODE_LEVEL_HIGH: u32 = 255;
const MODE_LEVEL_LOW: u32 = 0;

impl ModeLines {
    pub fn new(pins: &PinNames, settle: Duration) -> Self {
        Self {
            m0: Pin::new(&pins.base_dir, &pins.m0),
            m1: Pin::new(&pins.base_dir, &pins.m1),
            settle,
        }
    }

    /// Assert both mode lines: register-programming mode.
    pub fn enter_configuring(&self) {
        log::debug!("Entering configuration mode");
        self.m0.drive(MODE_LEVEL_HIGH);
        self.m1.drive(MODE_LEVEL_HIGH);
        thread::sleep(self.settle);
    }

    /// Clear both mode lines: transparent operation.
    pub fn enter_operating(&self) {
        log::debug!("Entering normal mode");
        self.m0.drive(MODE_LEVEL_LOW);
        self.m1.drive(MODE_LEVEL_LOW);
        thread::sleep(self.settle);
    }
}

/// Power sequencing for the radio and its USB-serial adapter.
#[derive(Debug, Clone)]
pub struct RadioPower {
    vcc: Pin,
    usb_enable: Pin,
    settle: Duration,
}

const VCC_LEVEL_ON: u32 = 4095;
const USB_LEVEL_ON: u32 = 1;

impl RadioPower {
    pub fn new(pins: &PinNames, settle: Duration) -> Self {
        Self {
            vcc: Pin::new(&pins.base_dir, &pins.radio_vcc),
            usb_enable: Pin::new(&pins.base_dir, &pins.usb_enable),
            settle,
        }
    }

    pub fn power_on(&self) {
        self.vcc.drive(VCC_LEVEL_ON);
        thread::sleep(self.settle);
        self.usb_enable.drive(USB_LEVEL_ON);
        thread::sleep(self.settle);
    }

    pub fn power_off(&self) {
        self.usb_enable.drive(MODE_LEVEL_LOW);
        self.vcc.drive(MODE_LEVEL_LOW);
        thread::sleep(self.settle);
    }

    /// The field fix for an unresponsive transceiver: drop both rails,
    /// wait, bring them back up.
    pub fn power_cycle(&self) {
        log::info!("Power-cycling the radio");
        self.power_off();
        self.power_on();
    }
}
