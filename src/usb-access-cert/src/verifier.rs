//! Chain verification of device certificates.
//!
//! The device presents a PEM bundle: the first CERTIFICATE block is the leaf,
//! any further blocks are intermediates. The leaf must chain to one of the
//! trust store's anchors, be inside its validity period at verification time,
//! and, if it carries an extended key usage, allow client authentication.

use std::path::Path;

use rustls_pki_types::{CertificateDer, UnixTime};
use tracing::{debug, info, warn};
use usb_access_core::{CertificateVerifier, VerifierError};
use webpki::{EndEntityCert, KeyUsage};

use crate::error::{into_verifier_error, CertError, CertResult};
use crate::fingerprint::{sha256_fingerprint, short_fingerprint};
use crate::trust::TrustStore;

/// A leaf that passed path validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCertificate {
    /// SHA-256 fingerprint of the leaf.
    pub fingerprint: String,
    /// Intermediates presented alongside the leaf.
    pub intermediates: usize,
}

/// Split a PEM bundle into leaf and intermediates.
pub fn parse_bundle(data: &[u8]) -> CertResult<(CertificateDer<'static>, Vec<CertificateDer<'static>>)> {
    let blocks = pem::parse_many(data).map_err(|e| CertError::InvalidPem {
        reason: e.to_string(),
    })?;
    let mut certs = blocks
        .into_iter()
        .filter(|b| b.tag() == "CERTIFICATE")
        .map(|b| CertificateDer::from(b.into_contents()));
    let leaf = certs.next().ok_or(CertError::NoCertificate)?;
    Ok((leaf, certs.collect()))
}

/// Verify a PEM bundle against `store` at the current time.
pub fn verify_pem_chain(data: &[u8], store: &TrustStore) -> CertResult<VerifiedCertificate> {
    verify_pem_chain_at(data, store, UnixTime::now())
}

/// Verify a PEM bundle against `store` at `time`.
pub fn verify_pem_chain_at(
    data: &[u8],
    store: &TrustStore,
    time: UnixTime,
) -> CertResult<VerifiedCertificate> {
    let (leaf_der, intermediates) = parse_bundle(data)?;
    let leaf = EndEntityCert::try_from(&leaf_der).map_err(|e| CertError::InvalidCertificate {
        reason: format!("{e:?}"),
    })?;

    leaf.verify_for_usage(
        webpki::ALL_VERIFICATION_ALGS,
        store.anchors(),
        &intermediates,
        time,
        KeyUsage::client_auth(),
        None,
        None,
    )
    .map_err(|e| CertError::Untrusted {
        reason: format!("{e:?}"),
    })?;

    Ok(VerifiedCertificate {
        fingerprint: sha256_fingerprint(leaf_der.as_ref()),
        intermediates: intermediates.len(),
    })
}

/// [`CertificateVerifier`] backed by rustls-webpki.
///
/// The trust anchor file is re-read on every call so a rotated CA takes
/// effect without a restart.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebPkiVerifier;

impl WebPkiVerifier {
    /// Create a verifier.
    pub fn new() -> Self {
        Self
    }
}

impl CertificateVerifier for WebPkiVerifier {
    fn verify(&self, certificate: &[u8], trust_anchor: &Path) -> Result<bool, VerifierError> {
        let store = TrustStore::from_pem_file(trust_anchor)
            .map_err(|e| into_verifier_error(e, trust_anchor.to_path_buf()))?;

        match verify_pem_chain(certificate, &store) {
            Ok(verified) => {
                info!(
                    fingerprint = %verified.fingerprint,
                    intermediates = verified.intermediates,
                    "Device certificate chains to trust anchor"
                );
                Ok(true)
            },
            Err(CertError::Untrusted { reason }) => {
                let leaf = parse_bundle(certificate)
                    .map(|(leaf, _)| short_fingerprint(leaf.as_ref()))
                    .unwrap_or_default();
                warn!(fingerprint = %leaf, reason = %reason, "Device certificate not trusted");
                Ok(false)
            },
            Err(e) => {
                debug!(error = %e, "Device certificate unusable");
                Err(into_verifier_error(e, trust_anchor.to_path_buf()))
            },
        }
    }
}
