//! SHA-256 digests for upload deduplication and token lookup.

use sha2::{Digest, Sha256};

/// SHA-256 of a byte slice as lowercase hex
pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        // SHA-256 of "hello world"
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_ne!(sha256_hex(b"a"), sha256_hex(b"b"));
    }
}
