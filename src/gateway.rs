//! Receiver-role runtime: radio bring-up, telemetry pipeline, Modbus serve
//! loop and the staleness monitor.
//!
//! Serial I/O runs on plain threads feeding flume channels; decoding,
//! register updates and the periodic staleness check run as tokio tasks
//! around the shared registry.

use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};

use crate::{
    audit::AuditLog,
    bridge::ModbusBridge,
    codec::{parse_frame, FrameDecoder, TelemetryRecord},
    config::{DeviceDirectory, GatewayConfig, NodeEntry},
    link::{LinkConfigurator, LinkTimings, ModeLines, RadioPower},
    registry::DeviceRegistry,
};

/// Pause after driving the mode lines or power rails.
const RADIO_SETTLE: Duration = Duration::from_secs(1);
/// Pause between failed configuration rounds, after the power cycle.
const RETRY_BACKOFF: Duration = Duration::from_secs(3);

pub fn open_serial(port: &str, baud_rate: u32) -> Result<Box<dyn serialport::SerialPort>> {
    serialport::new(port, baud_rate)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| anyhow!("Failed to open port {}: {}", port, e))
}

/// Power the radio up and program its address and channel registers.
///
/// The configuration handshake itself is bounded; this outer loop is not.
/// Every failed round gets the field fix - power-cycle the radio, reopen the
/// serial device (the USB adapter re-enumerates with the rails) and try
/// again. A gateway without a configured radio is useless, so there is no
/// give-up path.
pub fn bring_up_radio(
    config: &GatewayConfig,
    entry: &NodeEntry,
) -> Result<Box<dyn serialport::SerialPort>> {
    let power = RadioPower::new(&config.pins, RADIO_SETTLE);
    let mode = ModeLines::new(&config.pins, RADIO_SETTLE);
    power.power_on();

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let mut port = match open_serial(&config.radio_port, config.baud_rate) {
            Ok(port) => port,
            Err(err) => {
                log::warn!("Radio port not ready (attempt {attempt}): {err}");
                power.power_cycle();
                thread::sleep(RETRY_BACKOFF);
                continue;
            }
        };

        let mut configurator =
            LinkConfigurator::new(&mut port, mode.clone(), LinkTimings::default());
        match configurator.program(
            entry.effective_address(),
            entry.channel,
            entry.registers.reg0,
        ) {
            Ok(()) => {
                log::info!(
                    "Radio configured after {attempt} attempt(s): address 0x{:04X}, channel 0x{:02X}",
                    entry.effective_address(),
                    entry.channel
                );
                return Ok(port);
            }
            Err(err) => {
                log::warn!("Radio configuration attempt {attempt} failed: {err}");
                drop(port);
                power.power_cycle();
                thread::sleep(RETRY_BACKOFF);
            }
        }
    }
}

/// Blocking radio read loop; chunks go to the decode task until the channel
/// closes.
fn radio_read_loop(mut port: Box<dyn serialport::SerialPort>, tx: flume::Sender<Vec<u8>>) {
    let mut buffer = [0u8; 256];
    loop {
        match port.read(&mut buffer) {
            Ok(0) => {}
            Ok(n) => {
                if tx.send(buffer[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => {
                log::error!("Radio port read failed: {err}");
                break;
            }
        }
    }
    log::debug!("Radio read loop stopped");
}

/// Open the fieldbus port if one is configured. An absent or unopenable
/// device is not fatal: Modbus serving is skipped and the radio path keeps
/// running.
fn open_fieldbus(config: &GatewayConfig) -> Option<Box<dyn serialport::SerialPort>> {
    let name = match config.fieldbus_port.as_deref() {
        Some(name) => name,
        None => {
            log::warn!("No fieldbus port configured, running radio-only");
            return None;
        }
    };
    match open_serial(name, config.baud_rate) {
        Ok(port) => Some(port),
        Err(err) => {
            log::warn!("Fieldbus port unavailable, running radio-only: {err}");
            None
        }
    }
}

/// Shared state of the receiver's tasks: the registry, the Modbus context
/// and the audit trail. Cloning is cheap, every task gets its own handle.
#[derive(Clone)]
struct GatewayContext {
    registry: Arc<Mutex<DeviceRegistry>>,
    bridge: Arc<ModbusBridge>,
    audit: Arc<AuditLog>,
}

impl GatewayContext {
    /// A panic in one task must not wedge the others: a poisoned registry
    /// lock is recovered, not propagated.
    fn lock_registry(&self) -> std::sync::MutexGuard<'_, DeviceRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Upsert one record and push the new table into the holding registers
    /// while still holding the registry lock. Publishing under the lock
    /// keeps the served table in mutation order: a staleness sweep can
    /// never overwrite a newer snapshot with an older one.
    fn apply_record(&self, record: &TelemetryRecord, now: Instant) -> bool {
        let mut registry = self.lock_registry();
        if !registry.upsert(record, now) {
            return false;
        }
        if let Err(err) = self.bridge.publish(&registry.snapshot()) {
            log::error!("Failed to publish registers: {err}");
        }
        true
    }

    /// One staleness sweep; republishes (under the registry lock, same
    /// ordering argument as `apply_record`) only when a slot is flagged.
    fn flag_stale(&self, now: Instant) -> usize {
        let mut registry = self.lock_registry();
        let stale = registry.check_staleness(now);
        if stale > 0 {
            if let Err(err) = self.bridge.publish(&registry.snapshot()) {
                log::error!("Failed to publish registers: {err}");
            }
        }
        stale
    }
}

/// Run the receiver until interrupted.
pub async fn run(config: GatewayConfig) -> Result<()> {
    let directory = DeviceDirectory::from_file(&config.directory_path)?;
    if directory.is_empty() {
        anyhow::bail!(
            "Device directory {} has no provisioned nodes",
            config.directory_path
        );
    }

    let hardware_id = crate::provision::read_hardware_id(&config.hardware_id_path)?;
    let own_entry = directory
        .get(&hardware_id)
        .with_context(|| format!("This gateway ({hardware_id}) is not in the device directory"))?
        .clone();
    log::info!(
        "Starting receiver {hardware_id} (unit {}) with {} node(s)",
        own_entry.unit_id,
        directory.len()
    );

    let radio_port = bring_up_radio(&config, &own_entry)?;

    let ctx = GatewayContext {
        registry: Arc::new(Mutex::new(DeviceRegistry::new(
            &directory,
            Duration::from_secs(config.stale_after_secs),
            Instant::now(),
        ))),
        bridge: Arc::new(ModbusBridge::new(config.slave_address)),
        audit: Arc::new(AuditLog::new(&config.audit_log_path, config.audit_max_kb)),
    };

    // Expose the initial layout (unit ids, zeroed telemetry) right away.
    ctx.bridge.publish(&ctx.lock_registry().snapshot())?;

    let (chunk_tx, chunk_rx) = flume::unbounded::<Vec<u8>>();
    thread::spawn(move || radio_read_loop(radio_port, chunk_tx));

    if let Some(port) = open_fieldbus(&config) {
        let bridge = ctx.bridge.clone();
        thread::spawn(move || {
            if let Err(err) = bridge.serve(port) {
                log::error!("Modbus serve loop failed: {err}");
            }
        });
    }

    let decode_ctx = ctx.clone();
    tokio::spawn(async move {
        let mut decoder = FrameDecoder::default();
        while let Ok(chunk) = chunk_rx.recv_async().await {
            decoder.push(&chunk);
            while let Some(frame) = decoder.next_frame() {
                let record = match parse_frame(&frame) {
                    Ok(record) => record,
                    Err(err) => {
                        log::warn!("Discarding malformed frame: {err}");
                        continue;
                    }
                };
                if decode_ctx.apply_record(&record, Instant::now()) {
                    if let Err(err) = decode_ctx
                        .audit
                        .record(&format!("{} {:?}", record.id, record.values()))
                    {
                        log::warn!("Failed to append audit log: {err}");
                    }
                }
            }
        }
    });

    let stale_ctx = ctx.clone();
    let check_interval = Duration::from_secs(config.check_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            stale_ctx.flag_stale(Instant::now());
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    Ok(())
}
