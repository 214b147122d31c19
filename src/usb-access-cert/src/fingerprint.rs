//! Certificate fingerprints for logs and the CLI.

use sha2::{Digest, Sha256};

/// SHA-256 over DER bytes, lower-case hex.
pub fn sha256_fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Shortened fingerprint for log lines.
pub fn short_fingerprint(der: &[u8]) -> String {
    let mut full = sha256_fingerprint(der);
    full.truncate(16);
    full
}
