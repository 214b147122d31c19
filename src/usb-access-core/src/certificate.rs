//! Certificate challenge for storage devices.
//!
//! Runs synchronously on the engine thread. Every failure fails closed:
//! [`CertificateWorkflow::run`] always yields exactly one of
//! `CERTIFICATE_VERIFIED` or `CERTIFICATE_NOT_VERIFIED`.
//!
//! Steps:
//! 1. Validate the advertised properties.
//! 2. Parse the `id` property into vendor and product.
//! 3. Ask the locator for the signature source, retrying a bounded number of
//!    times with a fixed delay.
//! 4. Check the located path against the prefix allow-list.
//! 5. Read and sanity-check the certificate bytes.
//! 6. Verify against the trust anchor, bounded by a timeout.
//!
//! A verifier that outlives its timeout keeps its helper thread. At most
//! [`MAX_PENDING_VERIFICATIONS`] helpers may be alive at once; past that the
//! challenge fails closed without calling the verifier.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::collaborators::{CertificateReader, CertificateVerifier, SignatureLocator};
use crate::config::AccessConfig;
use crate::device::{UsbDevice, UsbEvent, UsbId};
use crate::error::{CertifyError, VerifierError};
use crate::validation::{
    parse_usb_id, validate_certificate_data, validate_file_path, validate_properties,
};

/// Property carrying the `vendor:product` pair.
pub const IDENTITY_PROPERTY: &str = "id";

/// Upper bound on live `cert-verify` helper threads per workflow.
pub const MAX_PENDING_VERIFICATIONS: usize = 4;

/// Tunables for the certificate challenge.
#[derive(Debug, Clone)]
pub struct CertificationPolicy {
    /// CA certificate passed to the verifier.
    pub trust_anchor: PathBuf,
    /// Locator attempts.
    pub retry_count: u32,
    /// Delay between locator attempts.
    pub retry_delay: Duration,
    /// Allowed prefixes for the located path.
    pub allowed_prefixes: Vec<String>,
    /// Upper bound on one verifier call.
    pub verify_timeout: Duration,
}

impl From<&AccessConfig> for CertificationPolicy {
    fn from(config: &AccessConfig) -> Self {
        Self {
            trust_anchor: config.trust_anchor_path.clone(),
            retry_count: config.sig_retry_count,
            retry_delay: config.sig_retry_delay,
            allowed_prefixes: config.sig_path_prefixes.clone(),
            verify_timeout: config.cert_verify_timeout,
        }
    }
}

impl Default for CertificationPolicy {
    fn default() -> Self {
        Self::from(&AccessConfig::default())
    }
}

/// The certificate challenge with its collaborators.
#[derive(Clone)]
pub struct CertificateWorkflow {
    locator: Arc<dyn SignatureLocator>,
    reader: Arc<dyn CertificateReader>,
    verifier: Arc<dyn CertificateVerifier>,
    policy: CertificationPolicy,
    pending: Arc<AtomicUsize>,
}

impl std::fmt::Debug for CertificateWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateWorkflow")
            .field("policy", &self.policy)
            .field("pending", &self.pending_verifications())
            .finish_non_exhaustive()
    }
}

impl CertificateWorkflow {
    /// Assemble a workflow.
    pub fn new(
        locator: Arc<dyn SignatureLocator>,
        reader: Arc<dyn CertificateReader>,
        verifier: Arc<dyn CertificateVerifier>,
        policy: CertificationPolicy,
    ) -> Self {
        Self {
            locator,
            reader,
            verifier,
            policy,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The active policy.
    pub fn policy(&self) -> &CertificationPolicy {
        &self.policy
    }

    /// Verifier helper threads that have not returned yet.
    pub fn pending_verifications(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Run the challenge and return the follow-up event.
    pub fn run(&self, device: &UsbDevice) -> UsbEvent {
        match self.certify(device) {
            Ok(()) => {
                info!(device_id = %device.id(), "Certificate verified");
                UsbEvent::CertificateVerified
            },
            Err(e) => {
                warn!(
                    device_id = %device.id(),
                    error = %e,
                    collaborator = e.is_collaborator_failure(),
                    "Certification failed"
                );
                UsbEvent::CertificateNotVerified
            },
        }
    }

    /// Run the challenge, reporting why it failed.
    pub fn certify(&self, device: &UsbDevice) -> Result<(), CertifyError> {
        let properties = device.properties();
        validate_properties(properties).map_err(CertifyError::InvalidProperties)?;

        let identity = extract_identity(device)?;
        debug!(device_id = %device.id(), usb_id = %identity, "Starting certification");

        let located = self.locate_with_retry(&identity)?;
        let path = validate_file_path(&located, &self.policy.allowed_prefixes).map_err(|reason| {
            CertifyError::PathRejected {
                path: located.clone(),
                reason,
            }
        })?;

        let data = self
            .reader
            .read(&path)
            .map_err(|source| CertifyError::ReadFailed {
                path: path.clone(),
                source,
            })?;
        validate_certificate_data(&data).map_err(CertifyError::InvalidCertificateData)?;

        if self.verify_bounded(data)? {
            Ok(())
        } else {
            Err(CertifyError::NotTrusted)
        }
    }

    fn locate_with_retry(&self, identity: &UsbId) -> Result<PathBuf, CertifyError> {
        let vendor = identity.vendor_hex();
        let product = identity.product_hex();
        let attempts = self.policy.retry_count;

        for attempt in 1..=attempts {
            if let Some(path) = self.locator.locate(&vendor, &product) {
                debug!(attempt, path = %path.display(), "Signature source located");
                return Ok(path);
            }
            debug!(attempt, max = attempts, "Signature source not visible yet");
            if attempt < attempts {
                thread::sleep(self.policy.retry_delay);
            }
        }

        Err(CertifyError::SignatureSourceNotFound { attempts })
    }

    // The verifier runs on a helper thread so a hung backend cannot stall
    // the engine. On timeout the helper is left to finish on its own, holding
    // its slot until it does.
    fn verify_bounded(&self, data: Vec<u8>) -> Result<bool, CertifyError> {
        let Some(slot) = VerifySlot::acquire(&self.pending) else {
            warn!(
                pending = MAX_PENDING_VERIFICATIONS,
                "Too many verifier calls still running, refusing to start another"
            );
            return Err(VerifierError::Unavailable {
                message: format!("{MAX_PENDING_VERIFICATIONS} verifier calls still pending"),
            }
            .into());
        };

        let (tx, rx) = mpsc::sync_channel(1);
        let verifier = Arc::clone(&self.verifier);
        let anchor = self.policy.trust_anchor.clone();

        thread::Builder::new()
            .name("cert-verify".into())
            .spawn(move || {
                let _slot = slot;
                let result = verifier.verify(&data, Path::new(&anchor));
                let _ = tx.send(result);
            })
            .map_err(|e| VerifierError::Unavailable {
                message: format!("failed to spawn verifier thread: {e}"),
            })?;

        match rx.recv_timeout(self.policy.verify_timeout) {
            Ok(result) => Ok(result?),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(CertifyError::VerificationTimedOut {
                timeout: self.policy.verify_timeout,
            }),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(VerifierError::Unavailable {
                message: "verifier thread exited without a result".into(),
            }
            .into()),
        }
    }
}

/// Live helper count, released when the helper thread returns.
struct VerifySlot(Arc<AtomicUsize>);

impl VerifySlot {
    fn acquire(pending: &Arc<AtomicUsize>) -> Option<Self> {
        pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MAX_PENDING_VERIFICATIONS).then_some(n + 1)
            })
            .ok()?;
        Some(Self(Arc::clone(pending)))
    }
}

impl Drop for VerifySlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn extract_identity(device: &UsbDevice) -> Result<UsbId, CertifyError> {
    let value = device
        .properties()
        .get(IDENTITY_PROPERTY)
        .ok_or(CertifyError::MissingIdentity)?;
    parse_usb_id(value).map_err(|reason| CertifyError::MalformedIdentity {
        value: value.to_string(),
        reason,
    })
}
