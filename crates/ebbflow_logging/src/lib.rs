//! Logging setup for Ebbflow binaries.
//!
//! Every process logs to `<log_dir>/<app>.log` and to stderr. The file gets
//! the full filter (`RUST_LOG`, or the crate defaults); stderr stays at
//! `warn` unless the caller asks for verbose output. The file is rotated by
//! size: `app.log` -> `app.log.1` -> ... -> `app.log.<keep-1>`.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "ebbflow=info,ebbflow_extract=info,ebbflow_sinks=info,ebbflow_state_store=info";

/// Logging configuration shared by Ebbflow binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    /// Override the log directory (defaults to `$EBBFLOW_HOME/logs`).
    pub log_dir: Option<PathBuf>,
}

/// How many log files to keep and how large each may grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotation {
    pub keep: usize,
    pub max_bytes: u64,
}

impl Default for Rotation {
    fn default() -> Self {
        Self {
            keep: 5,
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Install the global subscriber: rotating file plus stderr.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = config
        .log_dir
        .unwrap_or_else(ebbflow_protocol::paths::default_logs_dir);
    let log_file = RotatingLog::open(&log_dir, config.app_name, Rotation::default())
        .with_context(|| format!("Failed to open log file in {}", log_dir.display()))?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let stderr_filter = if config.verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(stderr_filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")
}

/// Size-rotated log file, shareable across threads.
#[derive(Clone)]
pub struct RotatingLog {
    inner: Arc<Mutex<LogFile>>,
}

struct LogFile {
    path: PathBuf,
    rotation: Rotation,
    file: File,
    written: u64,
}

impl RotatingLog {
    pub fn open(dir: &Path, app_name: &str, rotation: Rotation) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.log", file_stem(app_name)));
        let rotation = Rotation {
            keep: rotation.keep.max(1),
            ..rotation
        };
        let (file, written) = open_append(&path)?;
        let mut log = LogFile {
            path,
            rotation,
            file,
            written,
        };
        if log.written > log.rotation.max_bytes {
            log.rotate()?;
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(log)),
        })
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.inner.lock().ok().map(|log| log.path.clone())
    }

    fn with_log<T>(&self, op: impl FnOnce(&mut LogFile) -> io::Result<T>) -> io::Result<T> {
        let mut log = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        op(&mut log)
    }
}

impl LogFile {
    fn numbered(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let last = self.rotation.keep - 1;
        if last == 0 {
            // Keeping one file means starting it over.
            self.file = File::create(&self.path)?;
            self.written = 0;
            return Ok(());
        }

        let oldest = self.numbered(last);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..last).rev() {
            let from = self.numbered(n);
            if from.exists() {
                fs::rename(&from, self.numbered(n + 1))?;
            }
        }
        fs::rename(&self.path, self.numbered(1))?;

        let (file, written) = open_append(&self.path)?;
        self.file = file;
        self.written = written;
        Ok(())
    }

    fn append(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.rotation.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

fn open_append(path: &Path) -> io::Result<(File, u64)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let len = file.metadata()?.len();
    Ok((file, len))
}

/// App names become file names; anything unusual becomes `_`.
fn file_stem(app_name: &str) -> String {
    app_name
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
            _ => '_',
        })
        .collect()
}

impl Write for RotatingLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_log(|log| log.append(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_log(|log| log.file.flush())
    }
}

impl<'a> MakeWriter<'a> for RotatingLog {
    type Writer = RotatingLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("ebbflow run"), "ebbflow_run");
        assert_eq!(file_stem("a/b.c"), "a_b_c");
    }

    #[test]
    fn test_rotates_and_keeps_bounded_history() {
        let dir = tempdir().unwrap();
        let mut log = RotatingLog::open(
            dir.path(),
            "ebbflow",
            Rotation {
                keep: 3,
                max_bytes: 16,
            },
        )
        .unwrap();

        for _ in 0..5 {
            log.write_all(b"0123456789").unwrap();
        }
        log.flush().unwrap();

        assert_eq!(log.path(), Some(dir.path().join("ebbflow.log")));
        assert!(dir.path().join("ebbflow.log").exists());
        assert!(dir.path().join("ebbflow.log.1").exists());
        assert!(dir.path().join("ebbflow.log.2").exists());
        assert!(!dir.path().join("ebbflow.log.3").exists());
        let current = fs::read(dir.path().join("ebbflow.log")).unwrap();
        assert_eq!(current.len(), 10);
    }

    #[test]
    fn test_oversized_line_is_written_whole() {
        let dir = tempdir().unwrap();
        let mut log = RotatingLog::open(
            dir.path(),
            "big",
            Rotation {
                keep: 2,
                max_bytes: 4,
            },
        )
        .unwrap();

        log.write_all(b"a line longer than the limit").unwrap();
        log.flush().unwrap();
        let current = fs::read_to_string(dir.path().join("big.log")).unwrap();
        assert_eq!(current, "a line longer than the limit");
    }

    #[test]
    fn test_single_file_history_truncates() {
        let dir = tempdir().unwrap();
        let mut log = RotatingLog::open(
            dir.path(),
            "one",
            Rotation {
                keep: 1,
                max_bytes: 8,
            },
        )
        .unwrap();

        log.write_all(b"12345678").unwrap();
        log.write_all(b"abc").unwrap();
        log.flush().unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("one.log")).unwrap(), "abc");
        assert!(!dir.path().join("one.log.1").exists());
    }
}
