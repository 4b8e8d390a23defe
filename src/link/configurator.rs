//! The address/channel programming handshake.
//!
//! Two-state machine: the transceiver is either in register-programming mode
//! (both mode lines asserted) or in transparent operation. `program` drives
//! the full sequence — enter configuration mode, send the address-set and
//! channel-set commands through the bounded retry protocol, return to
//! operation.
//!
//! Retries are two-level by design: this module retries each command at most
//! [`MAX_COMMAND_RETRIES`] times and then fails hard; the calling loop
//! answers a hard failure with the power-cycle fix and a fresh `program`
//! call. The command level never retries forever.

use std::{
    io::{Read, Write},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;

use super::{command::ConfigCommand, pins::ModeLines};

/// Attempts per command before the handshake is declared failed.
pub const MAX_COMMAND_RETRIES: usize = 3;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no acknowledgement for {command} command after {attempts} attempts")]
    HandshakeFailed {
        command: &'static str,
        attempts: usize,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Delays of the handshake, injectable so tests run at full speed.
#[derive(Debug, Clone, Copy)]
pub struct LinkTimings {
    /// Pause after a mode-line transition.
    pub mode_settle: Duration,
    /// Pause between writing a command and reading its acknowledgement.
    pub post_write: Duration,
    /// How long to keep collecting acknowledgement bytes per attempt.
    pub response_wait: Duration,
}

impl Default for LinkTimings {
    fn default() -> Self {
        Self {
            mode_settle: Duration::from_secs(1),
            post_write: Duration::from_millis(100),
            response_wait: Duration::from_secs(2),
        }
    }
}

/// Drives one transceiver through mode transitions and register programming.
pub struct LinkConfigurator<'a, P: Read + Write> {
    port: &'a mut P,
    mode: ModeLines,
    timings: LinkTimings,
}

impl<'a, P: Read + Write> LinkConfigurator<'a, P> {
    pub fn new(port: &'a mut P, mode: ModeLines, timings: LinkTimings) -> Self {
        Self {
            port,
            mode,
            timings,
        }
    }

    /// Program the transceiver's address and channel registers, then return
    /// it to transparent operation.
    pub fn program(&mut self, address: u16, channel: u8, reg0: u8) -> Result<(), LinkError> {
        log::info!("Configuring radio: address 0x{address:04X}, channel 0x{channel:02X}");
        self.mode.enter_configuring();

        let result = self
            .send_command(&ConfigCommand::set_address(address, reg0))
            .and_then(|()| self.send_command(&ConfigCommand::set_channel(channel)));

        // Leave programming mode even after a failed handshake; the caller's
        // power-cycle path expects the lines released.
        self.mode.enter_operating();
        result
    }

    /// Send one command through the bounded retry protocol: write, short
    /// fixed delay, collect the acknowledgement, compare byte for byte.
    /// Mismatches resend the identical bytes up to the retry ceiling.
    fn send_command(&mut self, command: &ConfigCommand) -> Result<(), LinkError> {
        for attempt in 1..=MAX_COMMAND_RETRIES {
            log::debug!(
                "Sending {} command (attempt {attempt}): {}",
                command.label,
                hex(&command.request)
            );
            self.port.write_all(&command.request)?;
            self.port.flush()?;
            thread::sleep(self.timings.post_write);

            let response = self.read_response(command.expected.len())?;
            if response == command.expected {
                log::debug!("{} acknowledged", command.label);
                return Ok(());
            }
            log::warn!(
                "Unexpected {} response: got [{}], expected [{}], retrying",
                command.label,
                hex(&response),
                hex(&command.expected)
            );
        }
        Err(LinkError::HandshakeFailed {
            command: command.label,
            attempts: MAX_COMMAND_RETRIES,
        })
    }

    /// Accumulate response bytes until enough arrived or the per-attempt
    /// window closes. Read timeouts are idle polls, not errors.
    fn read_response(&mut self, expected_len: usize) -> Result<Vec<u8>, LinkError> {
        let deadline = Instant::now() + self.timings.response_wait;
        let mut response = Vec::with_capacity(expected_len);
        let mut buf = [0u8; 64];
        loop {
            match self.port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => response.extend_from_slice(&buf[..n]),
                Err(err)
                    if err.kind() == std::io::ErrorKind::TimedOut
                        || err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err.into()),
            }
            if response.len() >= expected_len || Instant::now() >= deadline {
                return Ok(response);
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PinNames;
    use std::collections::VecDeque;

    /// Serial double: every write queues the next scripted response.
    struct MockPort {
        responses: VecDeque<Vec<u8>>,
        pending: VecDeque<u8>,
        writes: Vec<Vec<u8>>,
    }

    impl MockPort {
        fn new(responses: Vec<Vec<u8>>) -> Self {
            Self {
                responses: responses.into(),
                pending: VecDeque::new(),
                writes: Vec::new(),
            }
        }
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pending.is_empty() {
                return Err(std::io::Error::from(std::io::ErrorKind::TimedOut));
            }
            let mut n = 0;
            while n < buf.len() {
                match self.pending.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.writes.push(buf.to_vec());
            if let Some(response) = self.responses.pop_front() {
                self.pending.extend(response);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn fast_timings() -> LinkTimings {
        LinkTimings {
            mode_settle: Duration::ZERO,
            post_write: Duration::ZERO,
            response_wait: Duration::from_millis(20),
        }
    }

    fn test_mode_lines(dir: &tempfile::TempDir) -> ModeLines {
        let names = PinNames {
            base_dir: dir.path().to_string_lossy().into_owned(),
            ..PinNames::default()
        };
        for name in [&names.m0, &names.m1] {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        ModeLines::new(&names, Duration::ZERO)
    }

    #[test]
    fn test_command_acknowledged_first_try() {
        let dir = tempfile::tempdir().unwrap();
        let command = ConfigCommand::set_address(0x0100, 0x62);
        let mut port = MockPort::new(vec![command.expected.clone()]);
        let mut configurator = LinkConfigurator::new(&mut port, test_mode_lines(&dir), fast_timings());

        configurator.send_command(&command).unwrap();
        assert_eq!(port.writes, vec![command.request]);
    }

    #[test]
    fn test_mismatch_exhausts_exactly_max_retries() {
        let dir = tempfile::tempdir().unwrap();
        let command = ConfigCommand::set_channel(0x17);
        // One byte off, every time.
        let bad = vec![0xC1, 0x04, 0x01, 0x18];
        let mut port = MockPort::new(vec![bad.clone(), bad.clone(), bad]);
        let mut configurator = LinkConfigurator::new(&mut port, test_mode_lines(&dir), fast_timings());

        let err = configurator.send_command(&command).unwrap_err();
        assert!(matches!(
            err,
            LinkError::HandshakeFailed {
                command: "channel-set",
                attempts: MAX_COMMAND_RETRIES,
            }
        ));
        assert_eq!(port.writes.len(), MAX_COMMAND_RETRIES);
        // Every resend is the verbatim command bytes.
        assert!(port.writes.iter().all(|w| *w == command.request));
    }

    #[test]
    fn test_recovers_after_one_bad_response() {
        let dir = tempfile::tempdir().unwrap();
        let command = ConfigCommand::set_channel(0x17);
        let mut port = MockPort::new(vec![vec![0xFF], command.expected.clone()]);
        let mut configurator = LinkConfigurator::new(&mut port, test_mode_lines(&dir), fast_timings());

        configurator.send_command(&command).unwrap();
        assert_eq!(port.writes.len(), 2);
    }

    #[test]
    fn test_program_sends_address_then_channel() {
        let dir = tempfile::tempdir().unwrap();
        let address = ConfigCommand::set_address(0x1A2B, 0x62);
        let channel = ConfigCommand::set_channel(0x17);
        let mut port = MockPort::new(vec![address.expected.clone(), channel.expected.clone()]);
        let mut configurator = LinkConfigurator::new(&mut port, test_mode_lines(&dir), fast_timings());

        configurator.program(0x1A2B, 0x17, 0x62).unwrap();
        assert_eq!(port.writes, vec![address.request, channel.request]);
    }

    #[test]
    fn test_silent_radio_fails_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let mut port = MockPort::new(vec![]);
        let mut configurator = LinkConfigurator::new(&mut port, test_mode_lines(&dir), fast_timings());

        let err = configurator.program(0x0001, 0x17, 0x62).unwrap_err();
        assert!(matches!(err, LinkError::HandshakeFailed { .. }));
        assert_eq!(port.writes.len(), MAX_COMMAND_RETRIES);
    }
}
