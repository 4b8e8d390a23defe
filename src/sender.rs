//! Sender-role runtime: sample, transmit, listen for commands, sleep.
//!
//! After every transmission the sender keeps the receive path open for a
//! short window; the gateway uses it to address control commands (currently
//! only reboot) to individual nodes. A reboot command or a wedged radio both
//! take the same recovery path - power-cycle and re-program.

use std::{
    io::Read,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};

use crate::{
    codec::{encode_frame, parse_control, ControlCommand, FrameDecoder},
    config::{DeviceDirectory, GatewayConfig},
    gateway::bring_up_radio,
    provision::read_hardware_id,
    sensor::{FileTelemetrySource, TelemetrySource},
};

/// Run the sender until the process is killed.
pub fn run(config: GatewayConfig) -> Result<()> {
    let directory = DeviceDirectory::from_file(&config.directory_path)?;
    let hardware_id = read_hardware_id(&config.hardware_id_path)?;
    let entry = directory
        .get(&hardware_id)
        .with_context(|| format!("This node ({hardware_id}) is not in the device directory"))?
        .clone();
    log::info!("Starting sender {hardware_id} (unit {})", entry.unit_id);

    let mut port = bring_up_radio(&config, &entry)?;
    let mut source = FileTelemetrySource::new(&config.sensor_sample_path);
    let mut decoder = FrameDecoder::new();

    let send_interval = Duration::from_secs(config.send_interval_secs);
    let listen_window = Duration::from_secs(config.listen_window_secs);

    loop {
        let round_start = Instant::now();
        let mut needs_recovery = false;

        match source.sample() {
            Ok(sample) => {
                let record = sample.into_record(&hardware_id);
                let wire = encode_frame(&record);
                match port.write_all(&wire).and_then(|()| port.flush()) {
                    Ok(()) => log::debug!("Transmitted {} bytes", wire.len()),
                    Err(err) => {
                        log::warn!("Radio transmit failed: {err}");
                        needs_recovery = true;
                    }
                }
            }
            Err(err) => log::warn!("Skipping transmission, no sensor sample: {err}"),
        }

        if !needs_recovery {
            if let Some(ControlCommand::Reboot) =
                listen_for_command(&mut port, &mut decoder, &hardware_id, listen_window)
            {
                log::info!("Reboot command received, power-cycling the radio");
                needs_recovery = true;
            }
        }

        if needs_recovery {
            drop(port);
            decoder.clear();
            port = bring_up_radio(&config, &entry)?;
        }

        let elapsed = round_start.elapsed();
        if elapsed < send_interval {
            thread::sleep(send_interval - elapsed);
        }
    }
}

/// Keep reading until the window closes; return the first command addressed
/// to this node. Commands for other nodes and malformed frames are ignored.
fn listen_for_command<P: Read>(
    port: &mut P,
    decoder: &mut FrameDecoder,
    own_id: &str,
    window: Duration,
) -> Option<ControlCommand> {
    let deadline = Instant::now() + window;
    let mut buffer = [0u8; 256];
    while Instant::now() < deadline {
        match port.read(&mut buffer) {
            Ok(0) => {}
            Ok(n) => {
                decoder.push(&buffer[..n]);
                while let Some(frame) = decoder.next_frame() {
                    match parse_control(&frame) {
                        Ok((id, command)) if id == own_id => {
                            log::info!("Received {command:?} command");
                            return Some(command);
                        }
                        Ok((id, _)) => log::debug!("Ignoring command addressed to {id}"),
                        Err(err) => log::debug!("Ignoring non-command frame: {err}"),
                    }
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::TimedOut
                    || err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                log::warn!("Radio read failed during listen window: {err}");
                return None;
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_control;
    use std::collections::VecDeque;

    struct ScriptedPort {
        chunks: VecDeque<Vec<u8>>,
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Err(std::io::Error::from(std::io::ErrorKind::TimedOut)),
            }
        }
    }

    fn window() -> Duration {
        Duration::from_millis(50)
    }

    #[test]
    fn test_reboot_for_own_id_is_picked_up() {
        let mut port = ScriptedPort {
            chunks: vec![encode_control("node-7", ControlCommand::Reboot)].into(),
        };
        let mut decoder = FrameDecoder::new();
        assert_eq!(
            listen_for_command(&mut port, &mut decoder, "node-7", window()),
            Some(ControlCommand::Reboot)
        );
    }

    #[test]
    fn test_command_for_other_node_is_ignored() {
        let mut port = ScriptedPort {
            chunks: vec![encode_control("node-9", ControlCommand::Reboot)].into(),
        };
        let mut decoder = FrameDecoder::new();
        assert_eq!(
            listen_for_command(&mut port, &mut decoder, "node-7", window()),
            None
        );
    }

    #[test]
    fn test_fragmented_command_is_reassembled() {
        let wire = encode_control("node-7", ControlCommand::Reboot);
        let (a, b) = wire.split_at(5);
        let mut port = ScriptedPort {
            chunks: vec![a.to_vec(), b.to_vec()].into(),
        };
        let mut decoder = FrameDecoder::new();
        assert_eq!(
            listen_for_command(&mut port, &mut decoder, "node-7", window()),
            Some(ControlCommand::Reboot)
        );
    }

    #[test]
    fn test_silent_window_returns_none() {
        let mut port = ScriptedPort {
            chunks: VecDeque::new(),
        };
        let mut decoder = FrameDecoder::new();
        assert_eq!(
            listen_for_command(&mut port, &mut decoder, "node-7", window()),
            None
        );
    }
}
