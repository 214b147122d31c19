//! Property-based tests for input validation.
//!
//! Everything here comes from an untrusted device, so the checks must reject
//! rather than panic on arbitrary input.

use std::path::Path;

use proptest::prelude::*;

use usb_access_core::validation::{
    parse_usb_id, validate_certificate_data, validate_file_path, validate_string, MAX_CERT_SIZE,
};
use usb_access_core::ValidationError;

fn prefixes() -> Vec<String> {
    vec!["/dev/".to_string(), "/etc/".to_string()]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    /// Any formatted vendor/product pair parses back to the same numbers.
    #[test]
    fn usb_id_parses_formatted_pairs(vendor in any::<u16>(), product in any::<u16>(), prefix in any::<bool>()) {
        let raw = if prefix {
            format!("0x{vendor:04X}:0x{product:04X}")
        } else {
            format!("{vendor:04x}:{product:04x}")
        };
        let id = parse_usb_id(&raw).unwrap();
        prop_assert_eq!(id.vendor, vendor);
        prop_assert_eq!(id.product, product);
    }

    /// Arbitrary strings never panic the id parser.
    #[test]
    fn usb_id_parser_total(raw in ".{0,64}") {
        let _ = parse_usb_id(&raw);
    }

    /// Paths containing `..` are always rejected, whatever the prefix.
    #[test]
    fn traversal_always_rejected(head in "[a-z]{0,8}", tail in "[a-z/]{0,16}") {
        let raw = format!("/dev/{head}/../{tail}");
        prop_assert_eq!(
            validate_file_path(Path::new(&raw), &prefixes()),
            Err(ValidationError::PathTraversal)
        );
    }

    /// Well-formed paths under an allowed prefix are accepted unchanged.
    #[test]
    fn allowed_paths_accepted(name in "[a-z][a-z0-9]{0,15}") {
        let raw = format!("/dev/{name}");
        let path = validate_file_path(Path::new(&raw), &prefixes()).unwrap();
        prop_assert_eq!(path.to_str().unwrap(), raw.as_str());
    }

    /// Strings with a control character are rejected.
    #[test]
    fn control_characters_rejected(head in "[a-z]{0,10}", c in 0u8..0x20, tail in "[a-z]{0,10}") {
        let raw = format!("{head}{}{tail}", c as char);
        prop_assert!(validate_string(&raw, 127).is_err());
    }

    /// Certificate bytes with a NUL anywhere are treated as binary.
    #[test]
    fn nul_bytes_rejected(mut data in prop::collection::vec(1u8..=255, 1..512), pos in any::<prop::sample::Index>()) {
        let i = pos.index(data.len());
        data[i] = 0;
        prop_assert_eq!(validate_certificate_data(&data), Err(ValidationError::BinaryCertificate));
    }
}

#[test]
fn certificate_size_bound() {
    assert!(validate_certificate_data(&vec![b'A'; MAX_CERT_SIZE]).is_ok());
    assert!(matches!(
        validate_certificate_data(&vec![b'A'; MAX_CERT_SIZE + 1]),
        Err(ValidationError::CertificateTooLarge { .. })
    ));
    assert_eq!(validate_certificate_data(b""), Err(ValidationError::EmptyCertificate));
}
