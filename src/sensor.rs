//! Telemetry acquisition for sender nodes.
//!
//! The air-quality measurement stack runs outside this process and drops its
//! latest reading as a JSON file; [`FileTelemetrySource`] re-reads that file
//! per transmission. The trait seam exists so the sender loop can be tested
//! without a filesystem fixture.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::codec::TelemetryRecord;

/// One air-quality reading as produced by the measurement stack.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorSample {
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

impl SensorSample {
    /// Attach this node's identifier for framing.
    pub fn into_record(self, id: &str) -> TelemetryRecord {
        TelemetryRecord {
            id: id.to_string(),
            temperature: self.temperature,
            humidity: self.humidity,
            co2: self.co2,
            voc: self.voc,
            nox: self.nox,
            pm1_0: self.pm1_0,
            pm2_5: self.pm2_5,
            pm10: self.pm10,
            aqi: self.aqi,
        }
    }
}

pub trait TelemetrySource {
    fn sample(&mut self) -> Result<SensorSample>;
}

/// Reads the latest sample JSON written by the measurement stack.
pub struct FileTelemetrySource {
    path: PathBuf,
}

impl FileTelemetrySource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl TelemetrySource for FileTelemetrySource {
    fn sample(&mut self) -> Result<SensorSample> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read sensor sample {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse sensor sample {}", self.path.display()))
    }
}
