//! Input validation for device-supplied data.
//!
//! Everything a device advertises (properties, identity, the location of its
//! signature partition, the certificate bytes) is untrusted. These checks run
//! before any of it is used and all of them fail closed.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::device::{DeviceProperties, UsbId};

/// Maximum number of properties kept per device.
pub const MAX_PROPERTIES: usize = 20;
/// Maximum property key length in bytes.
pub const MAX_KEY_LEN: usize = 63;
/// Maximum property value length in bytes.
pub const MAX_VALUE_LEN: usize = 127;
/// Maximum device rule length in bytes.
pub const MAX_RULE_LEN: usize = 255;
/// Largest accepted device id.
pub const MAX_DEVICE_ID: u32 = 0x7FFF_FFFF;
/// Longest accepted signature path.
pub const MAX_PATH_LEN: usize = 4096;
/// Largest accepted certificate (1 MiB).
pub const MAX_CERT_SIZE: usize = 1024 * 1024;

/// Validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Id zero is reserved for "unknown".
    #[error("device id 0 is reserved")]
    ZeroDeviceId,

    /// Id above [`MAX_DEVICE_ID`].
    #[error("device id exceeds {MAX_DEVICE_ID:#x}")]
    DeviceIdOutOfRange,

    /// Too many properties.
    #[error("{count} properties exceeds limit of {max}")]
    TooManyProperties {
        /// Property count.
        count: usize,
        /// Limit.
        max: usize,
    },

    /// Property key is empty.
    #[error("property {index} has an empty key")]
    EmptyKey {
        /// Property index.
        index: usize,
    },

    /// String longer than allowed.
    #[error("string of {len} bytes exceeds limit of {max}")]
    TooLong {
        /// Actual length.
        len: usize,
        /// Limit.
        max: usize,
    },

    /// Control character inside a string.
    #[error("string contains control character {0:#04x}")]
    ControlCharacter(u32),

    /// Identity is not `vendor:product`.
    #[error("expected vendor:product")]
    MissingSeparator,

    /// Identity component is not 1-4 hex digits.
    #[error("invalid hex component {0:?}")]
    InvalidHex(String),

    /// Path is empty after trimming.
    #[error("path is empty")]
    EmptyPath,

    /// Path is not valid UTF-8.
    #[error("path is not valid UTF-8")]
    NonUtf8Path,

    /// Path contains `..` or `//`.
    #[error("path contains a traversal sequence")]
    PathTraversal,

    /// Path is relative.
    #[error("path is not absolute")]
    RelativePath,

    /// Path is outside every allowed prefix.
    #[error("path is outside the allowed prefixes")]
    PrefixNotAllowed,

    /// Certificate is empty.
    #[error("certificate is empty")]
    EmptyCertificate,

    /// Certificate is larger than [`MAX_CERT_SIZE`].
    #[error("certificate of {len} bytes exceeds limit of {max}")]
    CertificateTooLarge {
        /// Actual length.
        len: usize,
        /// Limit.
        max: usize,
    },

    /// Certificate contains NUL bytes, i.e. it is binary rather than PEM.
    #[error("certificate contains NUL bytes")]
    BinaryCertificate,
}

/// Validate a device id.
pub fn validate_device_id(id: u32) -> Result<(), ValidationError> {
    if id == 0 {
        return Err(ValidationError::ZeroDeviceId);
    }
    if id > MAX_DEVICE_ID {
        return Err(ValidationError::DeviceIdOutOfRange);
    }
    Ok(())
}

/// Validate a string against a byte limit and reject control characters.
pub fn validate_string(value: &str, max_len: usize) -> Result<(), ValidationError> {
    if value.len() > max_len {
        return Err(ValidationError::TooLong {
            len: value.len(),
            max: max_len,
        });
    }
    if let Some(c) = value.chars().find(|c| c.is_control()) {
        return Err(ValidationError::ControlCharacter(c as u32));
    }
    Ok(())
}

/// Validate the whole property collection of a device.
pub fn validate_properties(properties: &DeviceProperties) -> Result<(), ValidationError> {
    if properties.len() > MAX_PROPERTIES {
        return Err(ValidationError::TooManyProperties {
            count: properties.len(),
            max: MAX_PROPERTIES,
        });
    }
    for (index, (key, value)) in properties.iter().enumerate() {
        if key.is_empty() {
            return Err(ValidationError::EmptyKey { index });
        }
        validate_string(key, MAX_KEY_LEN)?;
        validate_string(value, MAX_VALUE_LEN)?;
    }
    Ok(())
}

/// Parse a `VVVV:PPPP` identity, accepting an optional `0x` prefix per half.
pub fn parse_usb_id(value: &str) -> Result<UsbId, ValidationError> {
    validate_string(value, MAX_VALUE_LEN)?;
    let (vendor, product) = value
        .trim()
        .split_once(':')
        .ok_or(ValidationError::MissingSeparator)?;
    Ok(UsbId {
        vendor: parse_hex_component(vendor)?,
        product: parse_hex_component(product)?,
    })
}

fn parse_hex_component(raw: &str) -> Result<u16, ValidationError> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    if digits.is_empty() || digits.len() > 4 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::InvalidHex(raw.to_string()));
    }
    u16::from_str_radix(digits, 16).map_err(|_| ValidationError::InvalidHex(raw.to_string()))
}

/// Validate a located signature path and return its trimmed form.
///
/// The path must be absolute and start with one of `allowed_prefixes`.
pub fn validate_file_path(
    path: &Path,
    allowed_prefixes: &[String],
) -> Result<PathBuf, ValidationError> {
    let raw = path.to_str().ok_or(ValidationError::NonUtf8Path)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyPath);
    }
    if trimmed.len() > MAX_PATH_LEN {
        return Err(ValidationError::TooLong {
            len: trimmed.len(),
            max: MAX_PATH_LEN,
        });
    }
    if let Some(c) = trimmed.chars().find(|c| c.is_control()) {
        return Err(ValidationError::ControlCharacter(c as u32));
    }
    if trimmed.contains("..") || trimmed.contains("//") {
        return Err(ValidationError::PathTraversal);
    }
    if !trimmed.starts_with('/') {
        return Err(ValidationError::RelativePath);
    }
    if !allowed_prefixes
        .iter()
        .any(|prefix| trimmed.starts_with(prefix.as_str()))
    {
        return Err(ValidationError::PrefixNotAllowed);
    }
    Ok(PathBuf::from(trimmed))
}

/// Sanity-check certificate bytes before they reach the verifier.
pub fn validate_certificate_data(data: &[u8]) -> Result<(), ValidationError> {
    if data.is_empty() {
        return Err(ValidationError::EmptyCertificate);
    }
    if data.len() > MAX_CERT_SIZE {
        return Err(ValidationError::CertificateTooLarge {
            len: data.len(),
            max: MAX_CERT_SIZE,
        });
    }
    if data.contains(&0) {
        return Err(ValidationError::BinaryCertificate);
    }
    Ok(())
}
