//! Tracing subscriber setup.
//!
//! The daemon logs to stderr and, when a log file is configured, appends the
//! same events to it without ANSI colors. `RUST_LOG` overrides the
//! configured level.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use usb_access_core::LogLevel;

/// Log file that could not be opened; the daemon continues on stderr.
#[derive(Debug)]
pub struct LogFileFailure {
    /// Configured path.
    pub path: PathBuf,
    /// Open error.
    pub error: io::Error,
}

/// Open `path` for appending, creating it with mode 0640 on Unix.
pub fn open_log_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o640);
    }
    options.open(path)
}

/// Install the daemon subscriber.
pub fn init_daemon(level: LogLevel, log_path: Option<&Path>) -> Option<LogFileFailure> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let (file, failure) = match log_path {
        Some(path) => match open_log_file(path) {
            Ok(file) => (Some(file), None),
            Err(error) => (
                None,
                Some(LogFileFailure {
                    path: path.to_path_buf(),
                    error,
                }),
            ),
        },
        None => (None, None),
    };

    let file_layer = file.map(|file| {
        fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(file_layer)
        .init();

    failure
}

/// Install a plain stderr subscriber for the one-shot subcommands.
pub fn init_cli(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}
