//! Configuration for the access-control daemon.
//!
//! Read once at startup and immutable afterwards. Every field can be
//! overridden from the environment; each override is range-checked on its own
//! and an invalid value falls back to the default with a warning.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::queue::DEFAULT_QUEUE_CAPACITY;

/// Longest accepted path override.
const MAX_CONFIG_PATH_LEN: usize = 255;

/// Log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages.
    Info,
    /// Debug output.
    Debug,
    /// Everything.
    Trace,
}

impl LogLevel {
    /// Equivalent `tracing` level.
    pub fn to_tracing(self) -> tracing::Level {
        match self {
            Self::Error => tracing::Level::ERROR,
            Self::Warn => tracing::Level::WARN,
            Self::Info => tracing::Level::INFO,
            Self::Debug => tracing::Level::DEBUG,
            Self::Trace => tracing::Level::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    /// Accepts level names or syslog severities 0-6.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" | "0" | "1" | "2" | "3" => Ok(Self::Error),
            "warn" | "warning" | "4" => Ok(Self::Warn),
            "info" | "5" => Ok(Self::Info),
            "debug" | "6" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        f.write_str(name)
    }
}

/// Configuration for USB access control.
#[derive(Debug, Clone, Serialize)]
pub struct AccessConfig {
    /// CA certificate that device certificates must chain to.
    pub trust_anchor_path: PathBuf,
    /// Log file, appended to in addition to stderr.
    pub log_path: Option<PathBuf>,
    /// Log verbosity.
    pub log_level: LogLevel,
    /// Event queue capacity.
    pub queue_capacity: usize,
    /// How long a device may stay marked for removal before the watchdog
    /// nudges it.
    pub device_timeout: Duration,
    /// Upper bound on a single verifier call.
    pub cert_verify_timeout: Duration,
    /// Signature partition lookups per certification.
    pub sig_retry_count: u32,
    /// Delay between signature partition lookups.
    pub sig_retry_delay: Duration,
    /// Prefixes a located signature path must start with.
    pub sig_path_prefixes: Vec<String>,
    /// Attempts for a single policy enforcement call.
    pub policy_retry_count: u32,
    /// Grace period for worker threads at shutdown.
    pub shutdown_grace: Duration,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            trust_anchor_path: PathBuf::from("/etc/usb-access-control/ca.crt"),
            log_path: Some(PathBuf::from("/var/log/usb-access-control.log")),
            log_level: LogLevel::Info,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            device_timeout: Duration::from_secs(30),
            cert_verify_timeout: Duration::from_secs(10),
            sig_retry_count: 5,
            sig_retry_delay: Duration::from_millis(1000),
            sig_path_prefixes: ["/dev/", "/etc/", "/var/", "/home/"]
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
            policy_retry_count: 3,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// A configuration plus the warnings produced while loading it.
///
/// Loading happens before logging is initialised, so warnings are returned
/// and logged by the caller once the subscriber is installed.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Effective configuration.
    pub config: AccessConfig,
    /// Rejected overrides.
    pub warnings: Vec<String>,
}

/// Environment variable names.
pub mod env {
    /// Trust anchor path.
    pub const CA_CERT_PATH: &str = "USB_ACCESS_CA_CERT_PATH";
    /// Log file path.
    pub const LOG_PATH: &str = "USB_ACCESS_LOG_PATH";
    /// Log level.
    pub const LOG_LEVEL: &str = "USB_ACCESS_LOG_LEVEL";
    /// Queue capacity.
    pub const QUEUE_SIZE: &str = "USB_ACCESS_QUEUE_SIZE";
    /// Device timeout in seconds.
    pub const DEVICE_TIMEOUT_SECS: &str = "USB_ACCESS_DEVICE_TIMEOUT_SECS";
    /// Verifier timeout in seconds.
    pub const CERT_VERIFY_TIMEOUT_SECS: &str = "USB_ACCESS_CERT_VERIFY_TIMEOUT_SECS";
    /// Signature lookup attempts.
    pub const SIG_RETRY_COUNT: &str = "USB_ACCESS_SIG_RETRY_COUNT";
    /// Delay between signature lookups in milliseconds.
    pub const SIG_RETRY_DELAY_MS: &str = "USB_ACCESS_SIG_RETRY_DELAY_MS";
    /// Colon-separated signature path prefixes.
    pub const SIG_PATH_PREFIXES: &str = "USB_ACCESS_SIG_PATH_PREFIXES";
    /// Policy call attempts.
    pub const POLICY_RETRY_COUNT: &str = "USB_ACCESS_POLICY_RETRY_COUNT";
}

impl AccessConfig {
    /// Load from the process environment.
    pub fn from_env() -> LoadedConfig {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variables.
    pub fn from_lookup<F>(lookup: F) -> LoadedConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let mut warnings = Vec::new();

        if let Some(raw) = lookup(env::CA_CERT_PATH) {
            match parse_path(&raw) {
                Ok(path) => config.trust_anchor_path = path,
                Err(reason) => warnings.push(reject(env::CA_CERT_PATH, &raw, &reason)),
            }
        }
        if let Some(raw) = lookup(env::LOG_PATH) {
            match parse_path(&raw) {
                Ok(path) => config.log_path = Some(path),
                Err(reason) => warnings.push(reject(env::LOG_PATH, &raw, &reason)),
            }
        }
        if let Some(raw) = lookup(env::LOG_LEVEL) {
            match raw.parse::<LogLevel>() {
                Ok(level) => config.log_level = level,
                Err(reason) => warnings.push(reject(env::LOG_LEVEL, &raw, &reason)),
            }
        }
        if let Some(raw) = lookup(env::QUEUE_SIZE) {
            match parse_in_range::<usize>(&raw, 1, 1000) {
                Ok(size) => config.queue_capacity = size,
                Err(reason) => warnings.push(reject(env::QUEUE_SIZE, &raw, &reason)),
            }
        }
        if let Some(raw) = lookup(env::DEVICE_TIMEOUT_SECS) {
            match parse_in_range::<u64>(&raw, 1, 3600) {
                Ok(secs) => config.device_timeout = Duration::from_secs(secs),
                Err(reason) => warnings.push(reject(env::DEVICE_TIMEOUT_SECS, &raw, &reason)),
            }
        }
        if let Some(raw) = lookup(env::CERT_VERIFY_TIMEOUT_SECS) {
            match parse_in_range::<u64>(&raw, 1, 300) {
                Ok(secs) => config.cert_verify_timeout = Duration::from_secs(secs),
                Err(reason) => {
                    warnings.push(reject(env::CERT_VERIFY_TIMEOUT_SECS, &raw, &reason));
                },
            }
        }
        if let Some(raw) = lookup(env::SIG_RETRY_COUNT) {
            match parse_in_range::<u32>(&raw, 1, 20) {
                Ok(count) => config.sig_retry_count = count,
                Err(reason) => warnings.push(reject(env::SIG_RETRY_COUNT, &raw, &reason)),
            }
        }
        if let Some(raw) = lookup(env::SIG_RETRY_DELAY_MS) {
            match parse_in_range::<u64>(&raw, 100, 10_000) {
                Ok(ms) => config.sig_retry_delay = Duration::from_millis(ms),
                Err(reason) => warnings.push(reject(env::SIG_RETRY_DELAY_MS, &raw, &reason)),
            }
        }
        if let Some(raw) = lookup(env::SIG_PATH_PREFIXES) {
            match parse_prefixes(&raw) {
                Ok(prefixes) => config.sig_path_prefixes = prefixes,
                Err(reason) => warnings.push(reject(env::SIG_PATH_PREFIXES, &raw, &reason)),
            }
        }
        if let Some(raw) = lookup(env::POLICY_RETRY_COUNT) {
            match parse_in_range::<u32>(&raw, 1, 10) {
                Ok(count) => config.policy_retry_count = count,
                Err(reason) => warnings.push(reject(env::POLICY_RETRY_COUNT, &raw, &reason)),
            }
        }

        LoadedConfig { config, warnings }
    }
}

fn reject(key: &str, raw: &str, reason: &str) -> String {
    format!("Invalid {key}={raw:?} ({reason}), using default")
}

fn parse_path(raw: &str) -> Result<PathBuf, String> {
    if raw.is_empty() {
        return Err("empty path".into());
    }
    if raw.len() > MAX_CONFIG_PATH_LEN {
        return Err(format!("longer than {MAX_CONFIG_PATH_LEN} bytes"));
    }
    Ok(PathBuf::from(raw))
}

fn parse_in_range<T>(raw: &str, min: T, max: T) -> Result<T, String>
where
    T: FromStr + PartialOrd + fmt::Display,
{
    let value: T = raw
        .trim()
        .parse()
        .map_err(|_| "not an integer".to_string())?;
    if value < min || value > max {
        return Err(format!("outside {min}..={max}"));
    }
    Ok(value)
}

fn parse_prefixes(raw: &str) -> Result<Vec<String>, String> {
    let prefixes: Vec<String> = raw
        .split(':')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if prefixes.is_empty() {
        return Err("no prefixes".into());
    }
    for prefix in &prefixes {
        if !prefix.starts_with('/') || !prefix.ends_with('/') || prefix.contains("..") {
            return Err(format!("prefix {prefix:?} must be absolute and end with '/'"));
        }
    }
    Ok(prefixes)
}
