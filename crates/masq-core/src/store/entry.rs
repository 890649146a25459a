//! Signed log entries.
//!
//! Each writer appends to its own feed. An entry is chained to its
//! predecessor by BLAKE3 hash and signed with the writer's ed25519 key, so a
//! replica can validate a feed without trusting the peer that relayed it.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{MasqError, MasqResult};

/// Raw ed25519 public key bytes
pub type WriterId = [u8; 32];

/// `prev` value for the first entry of a feed
pub const GENESIS: [u8; 32] = [0u8; 32];

/// A single path/value write. Values are JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Put {
    /// Document path, e.g. `/apps/01H...`
    pub path: String,
    /// JSON-encoded value
    pub value: String,
}

/// What an entry does to the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Puts applied together
    Batch(Vec<Put>),
    /// Grant write access to another key
    Authorize {
        /// Key being granted
        key: WriterId,
    },
}

/// Signed portion of an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryBody {
    /// Author
    pub writer: WriterId,
    /// Position in the author's feed
    pub seq: u64,
    /// Lamport clock
    pub clock: u64,
    /// Hash of the author's previous entry, or [`GENESIS`]
    pub prev: [u8; 32],
    /// Payload
    pub op: Op,
}

/// Total order used to resolve concurrent writes to the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp {
    /// Lamport clock
    pub clock: u64,
    /// Author
    pub writer: WriterId,
    /// Feed position
    pub seq: u64,
}

/// Entry plus signature, as persisted and replicated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEntry {
    /// Signed fields
    pub body: EntryBody,
    /// ed25519 signature over the encoded body
    pub signature: Vec<u8>,
}

impl SignedEntry {
    /// Sign a body with the writer's key.
    pub fn sign(body: EntryBody, key: &SigningKey) -> MasqResult<Self> {
        let bytes = postcard::to_allocvec(&body)?;
        let signature = key.sign(&bytes).to_bytes().to_vec();
        Ok(Self { body, signature })
    }

    /// Verify the signature against `body.writer`.
    pub fn verify(&self) -> MasqResult<()> {
        let key = VerifyingKey::from_bytes(&self.body.writer)
            .map_err(|e| MasqError::InvalidWriterKey(e.to_string()))?;
        let signature = Signature::from_slice(&self.signature)
            .map_err(|e| MasqError::Store(format!("Malformed signature: {}", e)))?;
        let bytes = postcard::to_allocvec(&self.body)?;
        key.verify(&bytes, &signature)
            .map_err(|_| MasqError::Store("Entry signature verification failed".to_string()))
    }

    /// Content hash of the body; the next entry's `prev`.
    pub fn hash(&self) -> [u8; 32] {
        // Encoding a plain struct into a Vec cannot fail
        let bytes = postcard::to_allocvec(&self.body).unwrap_or_default();
        *blake3::hash(&bytes).as_bytes()
    }

    /// Ordering stamp
    pub fn stamp(&self) -> Stamp {
        Stamp {
            clock: self.body.clock,
            writer: self.body.writer,
            seq: self.body.seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(key: &SigningKey, seq: u64) -> EntryBody {
        EntryBody {
            writer: key.verifying_key().to_bytes(),
            seq,
            clock: seq + 1,
            prev: GENESIS,
            op: Op::Batch(vec![Put {
                path: "/".to_string(),
                value: "{}".to_string(),
            }]),
        }
    }

    #[test]
    fn test_sign_verify() {
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let entry = SignedEntry::sign(body(&key, 0), &key).unwrap();
        entry.verify().unwrap();
    }

    #[test]
    fn test_tampered_body_fails() {
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let mut entry = SignedEntry::sign(body(&key, 0), &key).unwrap();
        entry.body.clock = 99;
        assert!(entry.verify().is_err());
    }

    #[test]
    fn test_signed_by_other_key_fails() {
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let other = SigningKey::from_bytes(&[4u8; 32]);
        let entry = SignedEntry::sign(body(&key, 0), &other).unwrap();
        assert!(entry.verify().is_err());
    }

    #[test]
    fn test_hash_changes_with_body() {
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let a = SignedEntry::sign(body(&key, 0), &key).unwrap();
        let b = SignedEntry::sign(body(&key, 1), &key).unwrap();
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_stamp_order() {
        let low = Stamp { clock: 1, writer: [9u8; 32], seq: 5 };
        let high = Stamp { clock: 2, writer: [0u8; 32], seq: 0 };
        assert!(low < high);

        let tie_a = Stamp { clock: 3, writer: [1u8; 32], seq: 0 };
        let tie_b = Stamp { clock: 3, writer: [2u8; 32], seq: 0 };
        assert!(tie_a < tie_b);
    }
}
