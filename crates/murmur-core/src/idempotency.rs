//! Idempotency-key derivation for note submissions.
//!
//! A job's idempotency key is a deterministic digest over the note id and
//! the checksum of its input, so re-submitting the same input for the same
//! note always maps to the same key.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Hex-encoded sha-256 checksum of raw input bytes.
pub fn input_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Derive the idempotency key for `(note_id, input_checksum)`.
pub fn idempotency_key(note_id: Uuid, input_checksum: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(note_id.as_bytes());
    hasher.update(b":");
    hasher.update(input_checksum.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_deterministic() {
        let a = input_checksum(b"some audio bytes");
        let b = input_checksum(b"some audio bytes");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_checksum_differs_on_content() {
        assert_ne!(input_checksum(b"a"), input_checksum(b"b"));
    }

    #[test]
    fn test_key_is_deterministic() {
        let note_id = Uuid::new_v4();
        let checksum = input_checksum(b"audio");
        assert_eq!(
            idempotency_key(note_id, &checksum),
            idempotency_key(note_id, &checksum)
        );
    }

    #[test]
    fn test_key_depends_on_note_and_input() {
        let checksum = input_checksum(b"audio");
        let key_a = idempotency_key(Uuid::new_v4(), &checksum);
        let key_b = idempotency_key(Uuid::new_v4(), &checksum);
        assert_ne!(key_a, key_b);

        let note_id = Uuid::new_v4();
        let key_c = idempotency_key(note_id, &input_checksum(b"audio"));
        let key_d = idempotency_key(note_id, &input_checksum(b"other"));
        assert_ne!(key_c, key_d);
    }
}
