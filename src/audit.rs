//! Flat-file audit trail of received telemetry.
//!
//! Every accepted frame appends one timestamped line. The file is capped:
//! once it grows past the configured size the oldest lines are evicted, so
//! the trail holds the most recent traffic without unbounded growth on the
//! gateway's small flash.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub struct AuditLog {
    path: PathBuf,
    max_bytes: u64,
}

impl AuditLog {
    pub fn new(path: impl AsRef<Path>, max_kb: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_bytes: max_kb * 1024,
        }
    }

    /// Append one timestamped line, evicting oldest lines if the file would
    /// exceed the cap.
    pub fn record(&self, message: &str) -> Result<()> {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("{timestamp} {message}\n");

        let mut content = match std::fs::read_to_string(&self.path) {
            Ok(existing) => existing,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read audit log {}", self.path.display()))
            }
        };
        content.push_str(&line);

        while content.len() as u64 > self.max_bytes {
            match content.find('\n') {
                Some(newline) => content.drain(..=newline),
                None => break,
            };
        }

        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write audit log {}", self.path.display()))
    }
}
