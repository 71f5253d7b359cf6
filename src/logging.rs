//! Logging setup
//!
//! Console output on stdout plus an optional log file that rotates by size,
//! keeping a bounded number of numbered backups (`speedlog.log.1`, ...).

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Guards that keep the background log writer alive.
///
/// Dropping them flushes pending file output.
pub struct LoggingGuards {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize tracing for the process
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuards> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("invalid log level {:?}", config.level))?,
    };
    let json = config.format.eq_ignore_ascii_case("json");

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    layers.push(if json {
        fmt::layer().json().with_writer(io::stdout).boxed()
    } else {
        fmt::layer().with_target(false).with_writer(io::stdout).boxed()
    });

    let mut file_guard = None;
    if let Some(path) = config.file.as_deref().filter(|p| !p.trim().is_empty()) {
        let writer = SizeRotatingWriter::open(path, config.max_bytes, config.backups)
            .with_context(|| format!("cannot open log file {}", path))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(writer);
        file_guard = Some(guard);

        layers.push(if json {
            fmt::layer().json().with_writer(non_blocking).boxed()
        } else {
            fmt::layer().with_ansi(false).with_writer(non_blocking).boxed()
        });
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("logging already initialized")?;

    Ok(LoggingGuards {
        _file_guard: file_guard,
    })
}

/// Append-only log file that rolls over when it would exceed `max_bytes`
///
/// On rollover `file.N-1` becomes `file.N` down to `file` becoming `file.1`;
/// the oldest backup beyond `backups` is overwritten. `max_bytes == 0`
/// disables rotation, `backups == 0` truncates in place.
pub struct SizeRotatingWriter {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: File,
    written: u64,
}

impl SizeRotatingWriter {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = Self::open_append(&path)?;
        let written = file.metadata()?.len();

        Ok(Self {
            path,
            max_bytes,
            backups,
            file,
            written,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn backup_path(&self, n: usize) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.backups == 0 {
            self.file = File::create(&self.path)?;
        } else {
            for n in (1..self.backups).rev() {
                let from = self.backup_path(n);
                if from.exists() {
                    fs::rename(&from, self.backup_path(n + 1))?;
                }
            }
            fs::rename(&self.path, self.backup_path(1))?;
            self.file = Self::open_append(&self.path)?;
        }

        self.written = 0;
        Ok(())
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.max_bytes > 0
            && self.written > 0
            && self.written + buf.len() as u64 > self.max_bytes
        {
            self.rotate()?;
        }

        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
