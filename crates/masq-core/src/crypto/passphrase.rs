//! Profile passphrase hashing (Argon2id).
//!
//! Only the derived hash is ever persisted; the raw passphrase never reaches
//! a store.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};

use super::CryptoProvider;
use crate::error::MasqError;

/// Algorithm tag written into [`SecretHash::hash_algo`]
pub const HASH_ALGO: &str = "argon2id";

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Time cost (passes)
    pub iterations: u32,
    /// Lanes
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Stored passphrase verifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretHash {
    /// Hex salt
    pub salt: String,
    /// Argon2 time cost
    pub iterations: u32,
    /// Argon2 memory cost in KiB
    pub memory_kib: u32,
    /// Argon2 lanes
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    /// Always [`HASH_ALGO`]
    pub hash_algo: String,
    /// Hex digest
    pub stored_hash: String,
}

fn default_parallelism() -> u32 {
    1
}

fn hash(passphrase: &str, salt: &[u8], params: KdfParams) -> Result<[u8; HASH_LEN], MasqError> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(HASH_LEN),
    )
    .map_err(|e| MasqError::Crypto(format!("argon2 params: {}", e)))?;

    let mut out = [0u8; HASH_LEN];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(passphrase.as_bytes(), salt, &mut out)
        .map_err(|e| MasqError::Crypto(format!("argon2 derive: {}", e)))?;
    Ok(out)
}

/// Hash a new passphrase with a fresh salt.
pub fn derive_passphrase(
    passphrase: &str,
    params: KdfParams,
    crypto: &dyn CryptoProvider,
) -> Result<SecretHash, MasqError> {
    let mut salt = [0u8; SALT_LEN];
    crypto.fill_bytes(&mut salt);

    let digest = hash(passphrase, &salt, params)?;
    Ok(SecretHash {
        salt: hex::encode(salt),
        iterations: params.iterations,
        memory_kib: params.memory_kib,
        parallelism: params.parallelism,
        hash_algo: HASH_ALGO.to_string(),
        stored_hash: hex::encode(digest),
    })
}

/// Check a passphrase against a stored verifier.
///
/// Unknown algorithms and corrupt hex are errors, a mismatch is `Ok(false)`.
pub fn check_passphrase(passphrase: &str, stored: &SecretHash) -> Result<bool, MasqError> {
    if stored.hash_algo != HASH_ALGO {
        return Err(MasqError::Crypto(format!(
            "Unsupported hash algorithm: {}",
            stored.hash_algo
        )));
    }
    let salt = hex::decode(&stored.salt)
        .map_err(|e| MasqError::Crypto(format!("Invalid salt: {}", e)))?;
    let expected: [u8; HASH_LEN] = hex::decode(&stored.stored_hash)
        .map_err(|e| MasqError::Crypto(format!("Invalid stored hash: {}", e)))?
        .try_into()
        .map_err(|_| MasqError::Crypto("Stored hash has wrong length".to_string()))?;

    let params = KdfParams {
        memory_kib: stored.memory_kib,
        iterations: stored.iterations,
        parallelism: stored.parallelism,
    };
    let actual = hash(passphrase, &salt, params)?;

    // blake3::Hash equality is constant-time
    Ok(blake3::Hash::from(actual) == blake3::Hash::from(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::OsCrypto;

    fn fast() -> KdfParams {
        KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_derive_and_check() {
        let stored = derive_passphrase("s3cret-pass", fast(), &OsCrypto).unwrap();
        assert_eq!(stored.hash_algo, HASH_ALGO);
        assert_eq!(stored.iterations, 1);
        assert_eq!(stored.salt.len(), SALT_LEN * 2);

        assert!(check_passphrase("s3cret-pass", &stored).unwrap());
        assert!(!check_passphrase("wrong-pass1", &stored).unwrap());
    }

    #[test]
    fn test_salt_differs_per_derivation() {
        let a = derive_passphrase("s3cret-pass", fast(), &OsCrypto).unwrap();
        let b = derive_passphrase("s3cret-pass", fast(), &OsCrypto).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.stored_hash, b.stored_hash);
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let mut stored = derive_passphrase("s3cret-pass", fast(), &OsCrypto).unwrap();
        stored.hash_algo = "SHA-256".to_string();
        assert!(check_passphrase("s3cret-pass", &stored).is_err());
    }

    #[test]
    fn test_serialized_field_names() {
        let stored = derive_passphrase("s3cret-pass", fast(), &OsCrypto).unwrap();
        let value = serde_json::to_value(&stored).unwrap();
        assert!(value.get("storedHash").is_some());
        assert!(value.get("hashAlgo").is_some());
        assert!(value.get("salt").is_some());
    }
}
