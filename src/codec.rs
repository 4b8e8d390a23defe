//! Frame codec for the radio link.
//!
//! A telemetry frame on the wire is a fixed two-byte start delimiter, a
//! semicolon-separated ASCII payload and a fixed two-byte end delimiter:
//!
//! ```text
//! CB DA | identifier;temp;hum;co2;voc;nox;pm1;pm2_5;pm10;aqi | BC 0A
//! ```
//!
//! The decoder is stream-oriented: it accumulates whatever the serial port
//! hands over (frames may arrive fragmented, several at once, or wrapped in
//! line noise) and yields complete frames in arrival order.

use thiserror::Error;

/// Start-of-frame delimiter.
pub const FRAME_START: [u8; 2] = [0xCB, 0xDA];
/// End-of-frame delimiter.
pub const FRAME_END: [u8; 2] = [0xBC, 0x0A];

/// Number of `;`-separated fields in a telemetry payload (identifier + 9).
pub const FRAME_FIELDS: usize = 10;

// Upper bound for bytes kept while waiting for an end delimiter. A frame is
// a few dozen bytes at most; anything beyond this is a stream that lost its
// end delimiter and would otherwise grow without limit.
const MAX_PENDING_LEN: usize = 512;

/// Frame-level decode failures. A bad frame is dropped and the stream
/// continues; none of these abort the receive loop.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame does not carry both delimiters")]
    MissingDelimiters,
    #[error("frame payload is not valid UTF-8")]
    NotText,
    #[error("expected {FRAME_FIELDS} fields, got {0}")]
    FieldCount(usize),
    #[error("empty node identifier")]
    EmptyIdentifier,
    #[error("field `{name}` is not numeric: {value:?}")]
    NotNumeric { name: &'static str, value: String },
}

/// One decoded telemetry record. Field order matches the wire payload and
/// the registry slot layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub id: String,
    pub temperature: i64,
    pub humidity: i64,
    pub co2: i64,
    pub voc: i64,
    pub nox: i64,
    pub pm1_0: i64,
    pub pm2_5: i64,
    pub pm10: i64,
    pub aqi: i64,
}

impl TelemetryRecord {
    /// The nine telemetry values in slot order (everything but the id).
    pub fn values(&self) -> [i64; 9] {
        [
            self.temperature,
            self.humidity,
            self.co2,
            self.voc,
            self.nox,
            self.pm1_0,
            self.pm2_5,
            self.pm10,
            self.aqi,
        ]
    }
}

/// Commands the gateway can address to a single sender during its listen
/// window after a transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Reboot,
}

/// Serialize a telemetry record into wire bytes, delimiters included.
pub fn encode_frame(record: &TelemetryRecord) -> Vec<u8> {
    let payload = format!(
        "{};{};{};{};{};{};{};{};{};{}",
        record.id,
        record.temperature,
        record.humidity,
        record.co2,
        record.voc,
        record.nox,
        record.pm1_0,
        record.pm2_5,
        record.pm10,
        record.aqi
    );
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(&FRAME_START);
    out.extend_from_slice(payload.as_bytes());
    out.extend_from_slice(&FRAME_END);
    out
}

/// Serialize a control command addressed to one node.
pub fn encode_control(id: &str, command: ControlCommand) -> Vec<u8> {
    let verb = match command {
        ControlCommand::Reboot => "reboot",
    };
    let payload = format!("{id};{verb}");
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(&FRAME_START);
    out.extend_from_slice(payload.as_bytes());
    out.extend_from_slice(&FRAME_END);
    out
}

/// Parse one complete frame (delimiters included) into a telemetry record.
pub fn parse_frame(frame: &[u8]) -> Result<TelemetryRecord, FrameError> {
    let interior = frame_interior(frame)?;
    let text = std::str::from_utf8(interior).map_err(|_| FrameError::NotText)?;

    let fields: Vec<&str> = text.split(';').collect();
    if fields.len() != FRAME_FIELDS {
        return Err(FrameError::FieldCount(fields.len()));
    }

    // Legacy senders wrapped the identifier in JSON quotes; strip them.
    let id = fields[0].trim().trim_matches('"');
    if id.is_empty() {
        return Err(FrameError::EmptyIdentifier);
    }

    const NAMES: [&str; 9] = [
        "temperature",
        "humidity",
        "co2",
        "voc",
        "nox",
        "pm1_0",
        "pm2_5",
        "pm10",
        "aqi",
    ];
    let mut values = [0i64; 9];
    for (i, slot) in values.iter_mut().enumerate() {
        let raw = fields[i + 1];
        *slot = parse_numeric(raw).ok_or_else(|| FrameError::NotNumeric {
            name: NAMES[i],
            value: raw.to_string(),
        })?;
    }

    Ok(TelemetryRecord {
        id: id.to_string(),
        temperature: values[0],
        humidity: values[1],
        co2: values[2],
        voc: values[3],
        nox: values[4],
        pm1_0: values[5],
        pm2_5: values[6],
        pm10: values[7],
        aqi: values[8],
    })
}

/// Parse one complete frame as a control message: `identifier;command`.
/// Returns the addressed identifier and the command.
pub fn parse_control(frame: &[u8]) -> Result<(String, ControlCommand), FrameError> {
    let interior = frame_interior(frame)?;
    let text = std::str::from_utf8(interior).map_err(|_| FrameError::NotText)?;

    let fields: Vec<&str> = text.split(';').collect();
    if fields.len() != 2 {
        return Err(FrameError::FieldCount(fields.len()));
    }
    let id = fields[0].trim().trim_matches('"');
    if id.is_empty() {
        return Err(FrameError::EmptyIdentifier);
    }
    match fields[1].trim() {
        "reboot" | "restart" => Ok((id.to_string(), ControlCommand::Reboot)),
        other => Err(FrameError::NotNumeric {
            name: "command",
            value: other.to_string(),
        }),
    }
}

fn frame_interior(frame: &[u8]) -> Result<&[u8], FrameError> {
    if frame.len() < FRAME_START.len() + FRAME_END.len()
        || !frame.starts_with(&FRAME_START)
        || !frame.ends_with(&FRAME_END)
    {
        return Err(FrameError::MissingDelimiters);
    }
    Ok(&frame[FRAME_START.len()..frame.len() - FRAME_END.len()])
}

// Sensor stacks occasionally report fractional particulate values; the
// register table is integer, so fractions are truncated here.
fn parse_numeric(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(v) = raw.parse::<i64>() {
        return Some(v);
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v as i64)
}

/// Accumulating decoder over a fragmented byte stream.
///
/// Feed it raw reads with [`FrameDecoder::push`], then drain complete frames
/// with [`FrameDecoder::next_frame`]. Bytes before a start delimiter are
/// discarded, so a stream of pure noise never grows the buffer beyond a
/// one-byte carry (a possible split start delimiter).
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes to the assembling buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes currently held while waiting for a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Discard any partially assembled frame (used across restarts).
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Extract the next complete frame, delimiters included, consuming it
    /// and everything before it from the buffer. Returns `None` when no
    /// complete frame is buffered yet.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let start = match find(&self.buffer, &FRAME_START) {
            Some(idx) => idx,
            None => {
                // Pure noise. Keep a trailing byte only when it could be the
                // first half of a start delimiter split across reads.
                if self.buffer.last() == Some(&FRAME_START[0]) {
                    let last = self.buffer.len() - 1;
                    self.buffer.drain(..last);
                } else {
                    self.buffer.clear();
                }
                return None;
            }
        };
        if start > 0 {
            self.buffer.drain(..start);
        }

        match find(&self.buffer[FRAME_START.len()..], &FRAME_END) {
            Some(rel) => {
                let end = FRAME_START.len() + rel + FRAME_END.len();
                let frame = self.buffer[..end].to_vec();
                self.buffer.drain(..end);
                Some(frame)
            }
            None => {
                if self.buffer.len() > MAX_PENDING_LEN {
                    log::warn!(
                        "Dropping {} bytes of unterminated frame data",
                        self.buffer.len()
                    );
                    self.buffer.clear();
                }
                None
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> TelemetryRecord {
        TelemetryRecord {
            id: "492e39d7".into(),
            temperature: 21,
            humidity: 40,
            co2: 450,
            voc: 100,
            nox: 1,
            pm1_0: 5,
            pm2_5: 8,
            pm10: 12,
            aqi: 20,
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let record = sample_record();
        let wire = encode_frame(&record);
        assert!(wire.starts_with(&FRAME_START));
        assert!(wire.ends_with(&FRAME_END));

        let parsed = parse_frame(&wire).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_fragmentation_independence() {
        let record = sample_record();
        let mut wire = encode_frame(&record);
        wire.extend_from_slice(&encode_frame(&record));
        wire.extend_from_slice(&encode_frame(&record));

        let decode_all = |chunks: &[&[u8]]| {
            let mut decoder = FrameDecoder::new();
            let mut frames = Vec::new();
            for chunk in chunks {
                decoder.push(chunk);
                while let Some(frame) = decoder.next_frame() {
                    frames.push(frame);
                }
            }
            frames
        };

        let whole = decode_all(&[&wire]);
        assert_eq!(whole.len(), 3);

        // Split at every offset, including mid-delimiter.
        for split in 1..wire.len() {
            let fragmented = decode_all(&[&wire[..split], &wire[split..]]);
            assert_eq!(fragmented, whole, "split at {split}");
        }
    }

    #[test]
    fn test_noise_does_not_grow_buffer() {
        let mut decoder = FrameDecoder::new();
        for _ in 0..1000 {
            decoder.push(&[0x00, 0x42, 0xFF, 0xBC]);
            assert!(decoder.next_frame().is_none());
            assert!(decoder.pending() <= 1);
        }
    }

    #[test]
    fn test_noise_before_frame_is_discarded() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0xDE, 0xAD, 0xBE, 0xEF]);
        decoder.push(&encode_frame(&sample_record()));
        let frame = decoder.next_frame().unwrap();
        assert_eq!(parse_frame(&frame).unwrap(), sample_record());
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_partial_frame_is_retained() {
        let wire = encode_frame(&sample_record());
        let mut decoder = FrameDecoder::new();
        decoder.push(&wire[..10]);
        assert!(decoder.next_frame().is_none());
        decoder.push(&wire[10..]);
        assert!(decoder.next_frame().is_some());
    }

    #[test]
    fn test_wrong_field_count_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&FRAME_START);
        wire.extend_from_slice(b"node;1;2;3");
        wire.extend_from_slice(&FRAME_END);
        assert_eq!(parse_frame(&wire), Err(FrameError::FieldCount(4)));
    }

    #[test]
    fn test_empty_identifier_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&FRAME_START);
        wire.extend_from_slice(b";21;40;450;100;1;5;8;12;20");
        wire.extend_from_slice(&FRAME_END);
        assert_eq!(parse_frame(&wire), Err(FrameError::EmptyIdentifier));
    }

    #[test]
    fn test_non_numeric_field_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&FRAME_START);
        wire.extend_from_slice(b"node;21;40;450;oops;1;5;8;12;20");
        wire.extend_from_slice(&FRAME_END);
        assert!(matches!(
            parse_frame(&wire),
            Err(FrameError::NotNumeric { name: "voc", .. })
        ));
    }

    #[test]
    fn test_quoted_identifier_is_stripped() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&FRAME_START);
        wire.extend_from_slice(b"\"492e39d7\";21;40;450;100;1;5;8;12;20");
        wire.extend_from_slice(&FRAME_END);
        assert_eq!(parse_frame(&wire).unwrap().id, "492e39d7");
    }

    #[test]
    fn test_fractional_values_truncate() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&FRAME_START);
        wire.extend_from_slice(b"node;21;40;450;100;1;5.7;8.2;12;20");
        wire.extend_from_slice(&FRAME_END);
        let parsed = parse_frame(&wire).unwrap();
        assert_eq!(parsed.pm1_0, 5);
        assert_eq!(parsed.pm2_5, 8);
    }

    #[test]
    fn test_control_roundtrip() {
        let wire = encode_control("492e39d7", ControlCommand::Reboot);
        let (id, cmd) = parse_control(&wire).unwrap();
        assert_eq!(id, "492e39d7");
        assert_eq!(cmd, ControlCommand::Reboot);
    }

    #[test]
    fn test_unterminated_frame_eventually_dropped() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&FRAME_START);
        for _ in 0..(MAX_PENDING_LEN / 4 + 2) {
            decoder.push(&[b'x'; 4]);
            let _ = decoder.next_frame();
        }
        assert!(decoder.pending() <= MAX_PENDING_LEN);
    }
}
