//! Image identity keys for deduplication.
//!
//! A content digest identifies an image exactly and wins whenever it is
//! present. Without one, the image reference is hashed with SHA-256 and
//! truncated to 16 bytes, so keys stay bounded no matter how long the
//! reference string is.

use crate::core::types::ScanRequest;

use sha2::{Digest, Sha256};

/// Number of hash bytes kept for reference-derived keys.
pub const REF_HASH_BYTES: usize = 16;

/// Derives the deduplication key for a request.
///
/// # Examples
///
/// ```rust
/// use scanrelay::core::{dedup_key, ScanRequest};
///
/// let by_digest = ScanRequest::new("nginx:1.25", "hub").with_digest("sha256:abc");
/// assert_eq!(dedup_key(&by_digest), "digest:sha256:abc");
///
/// let by_ref = ScanRequest::new("nginx:1.25", "hub");
/// assert!(dedup_key(&by_ref).starts_with("ref:"));
/// ```
pub fn dedup_key(request: &ScanRequest) -> String {
    match request.digest.as_deref() {
        Some(digest) if !digest.is_empty() => format!("digest:{}", digest),
        _ => format!("ref:{}", truncated_hash(&request.image_ref)),
    }
}

/// Returns the first [`REF_HASH_BYTES`] bytes of SHA-256(`value`), hex-encoded.
fn truncated_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..REF_HASH_BYTES])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_wins_over_reference() {
        let a = ScanRequest::new("nginx:1.25", "hub").with_digest("sha256:deadbeef");
        let b = ScanRequest::new("nginx:latest", "hub").with_digest("sha256:deadbeef");
        assert_eq!(dedup_key(&a), dedup_key(&b));
    }

    #[test]
    fn test_reference_key_is_bounded() {
        let long_ref = format!("registry.example.com/{}:tag", "a".repeat(10_000));
        let key = dedup_key(&ScanRequest::new(long_ref, "hub"));
        assert_eq!(key.len(), "ref:".len() + REF_HASH_BYTES * 2);
    }

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(truncated_hash("nginx:latest"), truncated_hash("nginx:latest"));
        assert_ne!(truncated_hash("nginx:latest"), truncated_hash("nginx:1.25"));
    }

    #[test]
    fn test_known_vector() {
        // sha256("abc") = ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad
        assert_eq!(truncated_hash("abc"), "ba7816bf8f01cfea414140de5dae2223");
    }
}
