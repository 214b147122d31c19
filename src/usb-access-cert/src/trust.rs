//! Trust anchors loaded from a PEM file.

use std::fs;
use std::path::{Path, PathBuf};

use rustls_pki_types::{CertificateDer, TrustAnchor};
use tracing::debug;

use crate::error::{CertError, CertResult};
use crate::fingerprint::sha256_fingerprint;

/// Every CERTIFICATE block of the anchor file, each trusted as a root.
#[derive(Debug)]
pub struct TrustStore {
    anchors: Vec<TrustAnchor<'static>>,
    fingerprints: Vec<String>,
    source: Option<PathBuf>,
}

impl TrustStore {
    /// Load anchors from a PEM file.
    pub fn from_pem_file(path: &Path) -> CertResult<Self> {
        let data = fs::read(path).map_err(|source| CertError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut store = Self::from_pem(&data)?;
        store.source = Some(path.to_path_buf());
        debug!(
            path = %path.display(),
            anchors = store.len(),
            "TrustStore: loaded anchors"
        );
        Ok(store)
    }

    /// Load anchors from PEM bytes.
    pub fn from_pem(data: &[u8]) -> CertResult<Self> {
        let blocks = pem::parse_many(data).map_err(|e| CertError::InvalidTrustAnchor {
            reason: e.to_string(),
        })?;

        let mut anchors = Vec::new();
        let mut fingerprints = Vec::new();
        for block in blocks.into_iter().filter(|b| b.tag() == "CERTIFICATE") {
            let der = CertificateDer::from(block.into_contents());
            let anchor = webpki::anchor_from_trusted_cert(&der)
                .map_err(|e| CertError::InvalidTrustAnchor {
                    reason: format!("{e:?}"),
                })?
                .to_owned();
            fingerprints.push(sha256_fingerprint(der.as_ref()));
            anchors.push(anchor);
        }

        if anchors.is_empty() {
            return Err(CertError::InvalidTrustAnchor {
                reason: "no CERTIFICATE block".into(),
            });
        }
        Ok(Self {
            anchors,
            fingerprints,
            source: None,
        })
    }

    /// The anchors.
    pub fn anchors(&self) -> &[TrustAnchor<'static>] {
        &self.anchors
    }

    /// SHA-256 fingerprints of the anchor certificates.
    pub fn fingerprints(&self) -> &[String] {
        &self.fingerprints
    }

    /// File the anchors came from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Number of anchors.
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    /// Always false for a constructed store.
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}
