//! Contracts for the services the engine calls out to.
//!
//! The engine owns ordering, retry and fail-closed conversion. Everything that
//! touches the OS (policy enforcement, partition discovery, certificate I/O,
//! chain verification) sits behind one of these traits so that it can be
//! swapped for an in-memory implementation in tests.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::device::{DeviceId, DeviceProperties};
use crate::error::{PolicyError, VerifierError};
use crate::validation::MAX_CERT_SIZE;

/// Disposition requested from the policy enforcer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum PolicyTarget {
    /// Authorize the device.
    Allow = 0,
    /// Keep the device attached but unauthorized.
    Block = 1,
    /// Logically remove the device.
    Reject = 2,
}

impl PolicyTarget {
    /// Wire code used by the enforcement service.
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Decides whether a device is removable storage.
pub trait DeviceClassifier: Send + Sync {
    /// Return `true` if the device must pass the certificate challenge.
    fn is_storage(&self, properties: &DeviceProperties) -> bool;
}

/// Applies an allow/block/reject decision at the OS level.
pub trait PolicyEnforcer: Send + Sync {
    /// Apply `target` to the device.
    ///
    /// Returns the rule id assigned by the service when `permanent` is set.
    fn apply_policy(
        &self,
        device: DeviceId,
        target: PolicyTarget,
        permanent: bool,
    ) -> Result<Option<u32>, PolicyError>;
}

/// Finds the signature partition of a device.
pub trait SignatureLocator: Send + Sync {
    /// Return the path of the signature source, or `None` if it is not
    /// (yet) visible. `None` is an expected, retryable outcome.
    fn locate(&self, vendor: &str, product: &str) -> Option<PathBuf>;
}

/// Reads raw certificate bytes from a validated path.
pub trait CertificateReader: Send + Sync {
    /// Read the certificate.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
}

/// Checks a certificate against the trust anchor.
pub trait CertificateVerifier: Send + Sync {
    /// Return `Ok(true)` if `certificate` chains to `trust_anchor`.
    fn verify(&self, certificate: &[u8], trust_anchor: &Path) -> Result<bool, VerifierError>;
}

/// Classifier driven by the properties USBGuard reports.
///
/// A device is storage if any of these hold:
/// - `deviceClass` is `08` (mass storage)
/// - an `interface.N.class` key is `08`
/// - `name` contains `Storage`
/// - `with-interface` names an `08:` interface
/// - `type` is `storage_device`
#[derive(Debug, Clone, Copy, Default)]
pub struct PropertyClassifier;

const MASS_STORAGE_CLASS: &str = "08";

impl DeviceClassifier for PropertyClassifier {
    fn is_storage(&self, properties: &DeviceProperties) -> bool {
        properties.iter().any(|(key, value)| match key {
            "deviceClass" => value.eq_ignore_ascii_case(MASS_STORAGE_CLASS),
            "name" => value.contains("Storage"),
            "type" => value == "storage_device",
            "with-interface" => with_interface_has_storage(value),
            _ => {
                key.starts_with("interface.")
                    && key.ends_with(".class")
                    && value.eq_ignore_ascii_case(MASS_STORAGE_CLASS)
            },
        })
    }
}

// Accepts both `08:06:50` and the rule-set form `{ 03:01:02 08:06:50 }`.
fn with_interface_has_storage(value: &str) -> bool {
    value
        .split(|c: char| c.is_whitespace() || c == '{' || c == '}')
        .any(|iface| iface.starts_with("08:"))
}

/// Reads a certificate from a file or block device.
///
/// Reads at most [`MAX_CERT_SIZE`] + 1 bytes so oversized sources are
/// detectable, then trims the trailing NUL padding a raw partition carries.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileCertificateReader;

impl CertificateReader for FileCertificateReader {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let file = File::open(path)?;
        let mut buf = Vec::new();
        file.take(MAX_CERT_SIZE as u64 + 1).read_to_end(&mut buf)?;
        while buf.last() == Some(&0) {
            buf.pop();
        }
        Ok(buf)
    }
}
