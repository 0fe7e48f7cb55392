//! Content fingerprints for change detection

use twox_hash::XxHash3_128;

/// 128-bit xxh3 fingerprint of file contents, as 32 lowercase hex digits
pub fn content_checksum(bytes: &[u8]) -> String {
    format!("{:032x}", XxHash3_128::oneshot(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable_and_content_sensitive() {
        let a = content_checksum(b"def foo(): pass\n");
        assert_eq!(a.len(), 32);
        assert_eq!(a, content_checksum(b"def foo(): pass\n"));
        assert_ne!(a, content_checksum(b"def foo(): return 1\n"));
    }
}
