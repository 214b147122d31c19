//! # usb-access-cert
//!
//! X.509 verification of the certificate a USB storage device carries on its
//! signature partition. Backed by rustls-webpki; no OpenSSL.
//!
//! ## Example
//!
//! ```rust,ignore
//! use usb_access_cert::{verify_pem_chain, TrustStore};
//!
//! let store = TrustStore::from_pem_file("/etc/usb-access-control/ca.crt".as_ref())?;
//! let verified = verify_pem_chain(&device_pem, &store)?;
//! println!("{}", verified.fingerprint);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)] // Too strict for production code
#![allow(clippy::module_name_repetitions)] // Allow Type in module::Type
#![allow(clippy::must_use_candidate)] // Not all functions need must_use

pub mod error;
pub mod fingerprint;
pub mod trust;
pub mod verifier;

pub use error::{CertError, CertResult};
pub use fingerprint::{sha256_fingerprint, short_fingerprint};
pub use trust::TrustStore;
pub use verifier::{parse_bundle, verify_pem_chain, verify_pem_chain_at, VerifiedCertificate, WebPkiVerifier};
