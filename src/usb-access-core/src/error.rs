//! Error types for access-control operations.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::device::DeviceId;
use crate::validation::ValidationError;

/// Errors raised by the registry, queue and engine setup.
#[derive(Debug, Error)]
pub enum AccessError {
    /// Device id is zero or outside the accepted range.
    #[error("Invalid device id {id}: {reason}")]
    InvalidDeviceId {
        /// Offending id.
        id: u32,
        /// Why it was rejected.
        reason: ValidationError,
    },

    /// A live record with this id already exists.
    #[error("Device {id} is already registered")]
    DuplicateDevice {
        /// Duplicate id.
        id: DeviceId,
    },

    /// Queue capacity must be at least one entry.
    #[error("Invalid queue capacity: {capacity}")]
    InvalidQueueCapacity {
        /// Requested capacity.
        capacity: usize,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message.
        message: String,
    },

    /// Failed to spawn a worker thread.
    #[error("Failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        /// Thread name.
        name: &'static str,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Reasons a certification attempt fails.
///
/// Every variant fails closed: the workflow converts it into a
/// `CERTIFICATE_NOT_VERIFIED` event.
#[derive(Debug, Error)]
pub enum CertifyError {
    /// Device properties did not pass validation.
    #[error("Invalid device properties: {0}")]
    InvalidProperties(#[source] ValidationError),

    /// No `id` property was advertised.
    #[error("Device does not advertise an id property")]
    MissingIdentity,

    /// The `id` property is not a `vendor:product` pair.
    #[error("Malformed id property {value:?}: {reason}")]
    MalformedIdentity {
        /// Raw property value.
        value: String,
        /// Why it was rejected.
        reason: ValidationError,
    },

    /// The signature source never appeared.
    #[error("Signature source not found after {attempts} attempts")]
    SignatureSourceNotFound {
        /// Attempts performed.
        attempts: u32,
    },

    /// The located path failed validation.
    #[error("Signature path {path:?} rejected: {reason}")]
    PathRejected {
        /// Located path.
        path: PathBuf,
        /// Why it was rejected.
        reason: ValidationError,
    },

    /// Reading the certificate failed.
    #[error("Failed to read certificate from {path:?}: {source}")]
    ReadFailed {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Certificate bytes failed the sanity checks.
    #[error("Invalid certificate data: {0}")]
    InvalidCertificateData(#[source] ValidationError),

    /// The verifier itself failed.
    #[error("Certificate verifier error: {0}")]
    Verifier(#[from] VerifierError),

    /// The verifier did not answer in time.
    #[error("Certificate verification timed out after {timeout:?}")]
    VerificationTimedOut {
        /// Configured timeout.
        timeout: Duration,
    },

    /// The certificate does not chain to the trust anchor.
    #[error("Certificate is not trusted")]
    NotTrusted,
}

impl CertifyError {
    /// Check whether the failure came from a collaborator rather than the device.
    #[must_use]
    pub fn is_collaborator_failure(&self) -> bool {
        matches!(
            self,
            Self::ReadFailed { .. } | Self::Verifier(_) | Self::VerificationTimedOut { .. }
        )
    }

    /// Check whether the failure points at device-supplied input.
    #[must_use]
    pub fn is_untrusted_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidProperties(_)
                | Self::MissingIdentity
                | Self::MalformedIdentity { .. }
                | Self::PathRejected { .. }
                | Self::InvalidCertificateData(_)
        )
    }
}

/// Error returned by a [`CertificateVerifier`](crate::collaborators::CertificateVerifier).
#[derive(Debug, Error)]
pub enum VerifierError {
    /// Trust anchor could not be loaded.
    #[error("Trust anchor {path:?} unusable: {message}")]
    TrustAnchor {
        /// Anchor path.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Certificate could not be parsed.
    #[error("Certificate parse error: {message}")]
    Parse {
        /// Error message.
        message: String,
    },

    /// Certificate checked and found not to chain to the anchor.
    #[error("Certificate rejected: {message}")]
    Rejected {
        /// Path validation failure.
        message: String,
    },

    /// Verifier backend unavailable.
    #[error("Verifier unavailable: {message}")]
    Unavailable {
        /// Error message.
        message: String,
    },
}

/// Error returned by a [`PolicyEnforcer`](crate::collaborators::PolicyEnforcer).
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Could not reach the enforcement service.
    #[error("Policy service unreachable: {message}")]
    Unreachable {
        /// Error message.
        message: String,
    },

    /// The service rejected the call.
    #[error("Policy call rejected: {message}")]
    Rejected {
        /// Error message.
        message: String,
    },

    /// The reply could not be decoded.
    #[error("Malformed policy reply: {message}")]
    MalformedReply {
        /// Error message.
        message: String,
    },
}

impl PolicyError {
    /// Check if the call may succeed when retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}
