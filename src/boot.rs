use anyhow::Result;
use chrono::Local;
use log::LevelFilter;
use std::io::{self, Write};

use env_logger::{Builder, Target};

/// Multi-writer for logging to both file and stdout
struct DualWriter {
    file: std::fs::File,
    stdout: io::Stdout,
}

impl Write for DualWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        self.stdout.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.stdout.flush()?;
        Ok(())
    }
}

/// Initialize logging. With `AEROBRIDGE_LOG_FILE` set, log lines go to both
/// that file and stdout; otherwise stdout only.
pub fn init_logging() -> Result<()> {
    match std::env::var("AEROBRIDGE_LOG_FILE").ok() {
        Some(path) => {
            if let Err(err) = init_dual_logger(&path) {
                eprintln!("Failed to initialize file logger at '{path}': {err}");
                env_logger::Builder::from_default_env()
                    .filter_level(LevelFilter::Info)
                    .parse_default_env()
                    .init();
            }
        }
        None => {
            env_logger::Builder::from_default_env()
                .filter_level(LevelFilter::Info)
                .parse_default_env()
                .init();
        }
    }
    Ok(())
}

fn init_dual_logger(path: &str) -> io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let dual_writer = DualWriter {
        file,
        stdout: io::stdout(),
    };

    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(dual_writer)))
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    log::info!("Logger initialized - logging to file and terminal");

    Ok(())
}
