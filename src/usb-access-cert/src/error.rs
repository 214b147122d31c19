//! Certificate handling error types.

use std::path::PathBuf;

use thiserror::Error;
use usb_access_core::VerifierError;

/// Errors that can occur while loading or checking certificates.
#[derive(Debug, Error)]
pub enum CertError {
    /// Could not read a certificate file.
    #[error("Failed to read {path:?}: {source}")]
    Io {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Input is not valid PEM.
    #[error("Invalid PEM: {reason}")]
    InvalidPem {
        /// Reason the PEM is invalid.
        reason: String,
    },

    /// Input holds no CERTIFICATE block.
    #[error("No CERTIFICATE block found")]
    NoCertificate,

    /// A certificate could not be used as a trust anchor.
    #[error("Invalid trust anchor: {reason}")]
    InvalidTrustAnchor {
        /// Reason the anchor was rejected.
        reason: String,
    },

    /// The device certificate could not be parsed.
    #[error("Invalid certificate: {reason}")]
    InvalidCertificate {
        /// Reason the certificate is invalid.
        reason: String,
    },

    /// The chain did not validate.
    #[error("Certificate chain not trusted: {reason}")]
    Untrusted {
        /// Path validation failure.
        reason: String,
    },
}

impl CertError {
    /// Check whether the error means "not trusted" rather than "could not check".
    #[must_use]
    pub fn is_untrusted(&self) -> bool {
        matches!(self, Self::Untrusted { .. })
    }
}

/// Result type for certificate operations.
pub type CertResult<T> = Result<T, CertError>;

pub(crate) fn into_verifier_error(err: CertError, anchor: PathBuf) -> VerifierError {
    match err {
        CertError::Io { .. } | CertError::InvalidTrustAnchor { .. } => VerifierError::TrustAnchor {
            path: anchor,
            message: err.to_string(),
        },
        CertError::InvalidPem { .. }
        | CertError::NoCertificate
        | CertError::InvalidCertificate { .. } => VerifierError::Parse {
            message: err.to_string(),
        },
        CertError::Untrusted { .. } => VerifierError::Rejected {
            message: err.to_string(),
        },
    }
}
