//! Hashing and armor primitives used by the key codec.
//!
//! Provides SHA-1 digests via `sha1` (the OTRv3 fingerprint hash), standard
//! base64 armor via `base64`, and constant-time comparison for fingerprints.

use crate::KeyTrustError;
use base64::engine::general_purpose::STANDARD;
use base64::{DecodeError, Engine};
use sha1::{Digest, Sha1};

/// Length in bytes of a SHA-1 digest.
pub const SHA1_LEN: usize = 20;

/// Compute the SHA-1 digest of the concatenation of `parts`.
pub fn sha1_digest<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> [u8; SHA1_LEN] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    let mut digest = [0u8; SHA1_LEN];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// Compute the SHA-1 hash of raw bytes and return it as a lowercase hex string.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(sha1_digest([data]))
}

/// Encode bytes as padded standard base64.
pub fn base64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode padded standard base64, ignoring ASCII whitespace.
///
/// # Errors
/// Returns `KeyTrustError::Structural` with the offset (into the text with
/// whitespace removed) of the first invalid symbol.
pub fn base64_decode(text: &str) -> Result<Vec<u8>, KeyTrustError> {
    let compact: Vec<u8> = text
        .bytes()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    STANDARD.decode(&compact).map_err(|e| {
        let offset = match e {
            DecodeError::InvalidByte(at, _) | DecodeError::InvalidLastSymbol(at, _) => at,
            DecodeError::InvalidLength(at) => at,
            DecodeError::InvalidPadding => compact.len(),
        };
        KeyTrustError::structural(offset, format!("malformed base64: {}", e))
    })
}

/// Constant-time comparison of two byte slices.
///
/// Returns `true` only if both slices have the same length and identical contents.
/// The comparison time depends only on the length of the slices.
pub fn constant_time_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1() {
        let hash = sha1_hex(b"abc");
        assert_eq!(hash, "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_sha1_parts_concatenate() {
        assert_eq!(sha1_digest([&b"a"[..], &b"bc"[..]]), sha1_digest([&b"abc"[..]]));
    }

    #[test]
    fn test_base64_roundtrip_with_whitespace() {
        let encoded = base64_encode(b"hello otr");
        assert_eq!(encoded, "aGVsbG8gb3Ry");
        assert_eq!(base64_decode("aGVs\nbG8g b3Ry\n").unwrap(), b"hello otr");
    }

    #[test]
    fn test_base64_invalid() {
        let err = base64_decode("aGV*bG8g").unwrap_err();
        assert!(matches!(err, KeyTrustError::Structural { offset: 3, .. }));
    }

    #[test]
    fn test_constant_time_equal() {
        assert!(constant_time_equal(b"abc", b"abc"));
        assert!(!constant_time_equal(b"abc", b"abd"));
        assert!(!constant_time_equal(b"ab", b"abc"));
    }
}
