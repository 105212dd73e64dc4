//! Platform metadata parsers
//!
//! A parser turns one [`RawMetadataBlob`] into [`ParsedMetadata`]. It reports
//! [`ParseError::NotThisPlatform`] when the platform's structural marker is
//! missing and [`ParseError::Malformed`] when the marker is there but the
//! content cannot be trusted.

pub mod azure;
pub mod ec2;
pub mod ovf;
pub mod smartos;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bm_error::ParseError;

use crate::record::{ParsedMetadata, RawMetadataBlob};

pub use azure::AzureParser;
pub use ec2::Ec2Parser;
pub use ovf::OvfParser;
pub use smartos::SmartOsParser;

pub trait Parser {
    fn decode(&self, blob: &RawMetadataBlob) -> Result<ParsedMetadata, ParseError>;
}

/// Decode base64 that may be wrapped over several lines
pub(crate) fn decode_base64(text: &str) -> Option<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(compact.as_bytes()).ok()
}

/// Values treated as "false" in provisioning documents
pub(crate) fn is_false(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "off" | "0" | "no" | "false")
}

/// Values treated as "true" in platform metadata
pub(crate) fn is_true(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "on" | "1" | "yes" | "true")
}

/// Authorized keys text: one key per line, comments and blanks dropped
pub(crate) fn split_public_keys(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_base64_ignores_wrapping() {
        assert_eq!(decode_base64("aGVs\n bG8=\n").as_deref(), Some(&b"hello"[..]));
        assert_eq!(decode_base64("not base64!"), None);
    }

    #[test]
    fn test_is_false() {
        for v in ["false", " FALSE ", "no", "0", "off"] {
            assert!(is_false(v), "{}", v);
        }
        assert!(!is_false("true"));
        assert!(!is_false(""));
        assert!(is_true(" True\n"));
        assert!(!is_true("false"));
    }

    #[test]
    fn test_split_public_keys() {
        let keys = split_public_keys("ssh-rsa AAA one\n\n# comment\nssh-ed25519 BBB two\n");
        assert_eq!(keys, vec!["ssh-rsa AAA one", "ssh-ed25519 BBB two"]);
    }
}
