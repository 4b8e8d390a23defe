//! In-memory register table holding the latest telemetry of every node.
//!
//! The table is a flat run of u16 cells, ten per node, in the order fixed at
//! startup from the device directory. External Modbus addressing depends on
//! that order, so slots are only ever overwritten in place — never added,
//! removed or moved while the process runs.

use std::time::{Duration, Instant};

use crate::{codec::TelemetryRecord, config::DeviceDirectory};

/// Cells per node slot: `[unit_id, temp, hum, co2, voc, nox, pm1, pm2_5, pm10, aqi]`.
pub const SLOT_WIDTH: usize = 10;

/// Value forced into a slot's AQI cell once its node went quiet for longer
/// than the monitoring interval. The other cells keep their last observed
/// values, so a master can tell "stale but last-known-good" from "never
/// received" (all zeros).
pub const STALE_AQI_SENTINEL: u16 = 0x00FF;

#[derive(Debug)]
struct NodeSlot {
    hardware_id: String,
    unit_id: u16,
    last_update: Instant,
}

/// Fixed-layout telemetry table, one slot per directory entry.
#[derive(Debug)]
pub struct DeviceRegistry {
    table: Vec<u16>,
    slots: Vec<NodeSlot>,
    stale_after: Duration,
}

impl DeviceRegistry {
    /// Build the ordered table from the directory. Every slot starts as its
    /// unit id followed by nine zeros; `now` seeds the staleness clock, so a
    /// node that never reports is flagged one interval after startup.
    pub fn new(directory: &DeviceDirectory, stale_after: Duration, now: Instant) -> Self {
        let ordered = directory.ordered();
        let mut table = Vec::with_capacity(ordered.len() * SLOT_WIDTH);
        let mut slots = Vec::with_capacity(ordered.len());
        for (hardware_id, entry) in ordered {
            table.push(entry.unit_id);
            table.extend_from_slice(&[0; SLOT_WIDTH - 1]);
            slots.push(NodeSlot {
                hardware_id: hardware_id.to_string(),
                unit_id: entry.unit_id,
                last_update: now,
            });
        }
        log::debug!(
            "Initialized registry with {} slots ({} registers)",
            slots.len(),
            table.len()
        );
        Self {
            table,
            slots,
            stale_after,
        }
    }

    /// Total number of holding registers backing the table.
    pub fn register_count(&self) -> usize {
        self.table.len()
    }

    /// Flat copy of the whole table for publishing to the Modbus bridge.
    pub fn snapshot(&self) -> Vec<u16> {
        self.table.clone()
    }

    /// Overwrite the slot belonging to `record`'s node and reset its
    /// staleness clock. Returns `false` (table untouched) when the
    /// identifier is not in the directory: the register layout is fixed at
    /// startup, so unknown nodes are never added dynamically.
    pub fn upsert(&mut self, record: &TelemetryRecord, now: Instant) -> bool {
        let slot = match self
            .slots
            .iter_mut()
            .find(|slot| slot.hardware_id == record.id)
        {
            Some(slot) => slot,
            None => {
                log::warn!("Discarding frame from unknown node {:?}", record.id);
                return false;
            }
        };
        slot.last_update = now;
        let unit_id = slot.unit_id;

        // Linear scan for the unit id; fine at fleet scale (tens of nodes).
        let base = match (0..self.table.len())
            .step_by(SLOT_WIDTH)
            .find(|&base| self.table[base] == unit_id)
        {
            Some(base) => base,
            None => {
                log::error!("Unit id {unit_id} missing from register table");
                return false;
            }
        };

        self.table[base] = unit_id;
        for (offset, value) in record.values().iter().enumerate() {
            self.table[base + 1 + offset] = (*value & 0xFFFF) as u16;
        }
        log::debug!(
            "Updated slot for {:?} at register {base}: {:?}",
            record.id,
            &self.table[base..base + SLOT_WIDTH]
        );
        true
    }

    /// Force the AQI sentinel into every slot whose node has been silent
    /// for longer than the monitoring interval. Returns how many slots are
    /// currently stale.
    pub fn check_staleness(&mut self, now: Instant) -> usize {
        let mut stale = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            if now.saturating_duration_since(slot.last_update) > self.stale_after {
                let aqi_cell = index * SLOT_WIDTH + (SLOT_WIDTH - 1);
                if self.table[aqi_cell] != STALE_AQI_SENTINEL {
                    log::warn!(
                        "Node {:?} (unit {}) is stale, flagging AQI register",
                        slot.hardware_id,
                        slot.unit_id
                    );
                }
                self.table[aqi_cell] = STALE_AQI_SENTINEL;
                stale += 1;
            }
        }
        stale
    }
}
