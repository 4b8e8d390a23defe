//! Modbus RTU slave serving the fleet's register table to a wired master.
//!
//! The bridge owns a `ModbusStorageSmall` holding-register context. The
//! telemetry pipeline publishes whole-table snapshots into it; the serve loop
//! answers read requests from the fieldbus. Writes from the master are
//! processed by the frame machinery but immediately overwritten by the next
//! publish, so the table is effectively read-only.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use rmodbus::{
    server::{context::ModbusContext, storage::ModbusStorageSmall, ModbusFrame},
    ModbusProto,
};

/// Shared holding-register context between the publish side and the serve
/// loop.
pub struct ModbusBridge {
    storage: Arc<Mutex<ModbusStorageSmall>>,
    slave_address: u8,
}

impl ModbusBridge {
    pub fn new(slave_address: u8) -> Self {
        Self {
            storage: Arc::new(Mutex::new(ModbusStorageSmall::default())),
            slave_address,
        }
    }

    /// Copy a registry snapshot into the holding registers, starting at
    /// address 0. One lock for the whole table, so a concurrent read never
    /// sees a half-written snapshot.
    pub fn publish(&self, table: &[u16]) -> Result<()> {
        let mut context = self
            .storage
            .lock()
            .map_err(|_| anyhow!("Modbus storage lock poisoned"))?;
        for (i, &value) in table.iter().enumerate() {
            context.set_holding(i as u16, value)?;
        }
        Ok(())
    }

    /// Parse one RTU request and build the response, if one is due. Frames
    /// addressed to other stations produce `None`.
    pub fn handle_request(&self, request: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut response = Vec::new();
        let mut frame = ModbusFrame::new(
            self.slave_address,
            request,
            ModbusProto::Rtu,
            &mut response,
        );
        frame.parse()?;

        if frame.processing_required {
            let mut context = self
                .storage
                .lock()
                .map_err(|_| anyhow!("Modbus storage lock poisoned"))?;
            let result = if frame.readonly {
                frame.process_read(&mut *context)
            } else {
                frame.process_write(&mut *context)
            };
            if result.is_err() {
                return Err(anyhow!("Frame processing error"));
            }
        }

        if frame.response_required {
            frame.finalize_response()?;
            log::debug!("Send Modbus response: {response:02x?}");
            return Ok(Some(response));
        }

        Ok(None)
    }

    /// Blocking serve loop over the fieldbus serial port. Read timeouts are
    /// idle cycles; other errors end the loop.
    pub fn serve(&self, mut port: Box<dyn serialport::SerialPort>) -> Result<()> {
        log::info!("Serving Modbus registers as station {}", self.slave_address);
        let mut buffer = vec![0u8; 256];
        loop {
            let bytes_read = match port.read(&mut buffer) {
                Ok(n) => n,
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(err) => return Err(err.into()),
            };
            if bytes_read == 0 {
                continue;
            }

            let request = &buffer[..bytes_read];
            log::debug!("Received Modbus request: {request:02X?}");
            match self.handle_request(request) {
                Ok(Some(response)) => {
                    port.write_all(&response)?;
                    port.flush()?;
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!("Discarding malformed Modbus request: {err}");
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}
