//! Pairing-channel encryption using ChaCha20-Poly1305 AEAD
//!
//! Every pairing message is sealed with the session's [`SharedKey`], which is
//! delivered out of band inside a pairing link. A message that fails to
//! authenticate is a protocol error and ends the session.
//!
//! Randomness (keys, nonces, salts, store keypairs) is drawn through the
//! [`CryptoProvider`] trait so tests can substitute a deterministic source.

pub mod passphrase;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{MasqError, ProtocolError};

pub use passphrase::{check_passphrase, derive_passphrase, KdfParams, SecretHash};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Symmetric key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// Source of cryptographic randomness.
pub trait CryptoProvider: Send + Sync {
    /// Fill `buf` with random bytes.
    fn fill_bytes(&self, buf: &mut [u8]);

    /// Convenience: a fresh 32-byte value.
    fn random_32(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        self.fill_bytes(&mut out);
        out
    }
}

/// Shared handle to a crypto provider
pub type SharedCrypto = Arc<dyn CryptoProvider>;

/// System CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct OsCrypto;

impl CryptoProvider for OsCrypto {
    fn fill_bytes(&self, buf: &mut [u8]) {
        rand::rng().fill_bytes(buf);
    }
}

/// Deterministic provider for tests: a BLAKE3 XOF keyed by a seed.
///
/// Never use outside tests; every instance with the same seed yields the
/// same sequence.
#[derive(Debug)]
pub struct SeededCrypto {
    seed: [u8; 32],
    counter: AtomicU64,
}

impl SeededCrypto {
    /// Create a provider from a seed
    pub fn new(seed: [u8; 32]) -> Self {
        Self {
            seed,
            counter: AtomicU64::new(0),
        }
    }
}

impl CryptoProvider for SeededCrypto {
    fn fill_bytes(&self, buf: &mut [u8]) {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut hasher = blake3::Hasher::new_keyed(&self.seed);
        hasher.update(&n.to_le_bytes());
        hasher.finalize_xof().fill(buf);
    }
}

/// Default provider used when none is injected
pub fn os_crypto() -> SharedCrypto {
    Arc::new(OsCrypto)
}

/// 32-byte pre-shared pairing key.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; KEY_SIZE]);

impl SharedKey {
    /// Generate a new random key
    pub fn generate(crypto: &dyn CryptoProvider) -> Self {
        Self(crypto.random_32())
    }

    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Base64 text form, as carried in links
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Parse the base64 text form
    pub fn from_base64(s: &str) -> Result<Self, MasqError> {
        let bytes = BASE64
            .decode(s.trim())
            .map_err(|e| MasqError::Crypto(format!("Invalid key encoding: {}", e)))?;
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|v: Vec<u8>| {
            MasqError::Crypto(format!("Key must be {} bytes (got {})", KEY_SIZE, v.len()))
        })?;
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(<redacted>)")
    }
}

/// Encrypted message as it travels over a pairing channel.
///
/// Fields are opaque until [`CryptoChannel::open`] succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Base64 nonce
    pub iv: String,
    /// Base64 ciphertext with appended Poly1305 tag
    pub ciphertext: String,
}

impl Envelope {
    /// Serialize to wire bytes (JSON)
    pub fn to_bytes(&self) -> Result<Vec<u8>, MasqError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::Malformed(format!("Invalid envelope: {}", e)))
    }
}

/// AEAD channel bound to one shared key.
///
/// # Example
///
/// ```
/// use masq_core::crypto::{CryptoChannel, OsCrypto, SharedKey};
/// use std::sync::Arc;
///
/// let key = SharedKey::generate(&OsCrypto);
/// let channel = CryptoChannel::new(&key, Arc::new(OsCrypto));
///
/// let envelope = channel.encrypt_json(&serde_json::json!({"msg": "notAuthorized"})).unwrap();
/// let value = channel.decrypt_json(&envelope).unwrap();
/// assert_eq!(value["msg"], "notAuthorized");
/// ```
pub struct CryptoChannel {
    cipher: ChaCha20Poly1305,
    crypto: SharedCrypto,
}

impl CryptoChannel {
    /// Create a channel for the given key
    pub fn new(key: &SharedKey, crypto: SharedCrypto) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
            crypto,
        }
    }

    /// Seal any serializable payload.
    pub fn seal<T: Serialize>(&self, payload: &T) -> Result<Envelope, MasqError> {
        let plaintext = serde_json::to_vec(payload)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        self.crypto.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|e| MasqError::Crypto(format!("Encryption failed: {}", e)))?;

        Ok(Envelope {
            iv: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    /// Open an envelope and parse its payload.
    pub fn open<T: DeserializeOwned>(&self, envelope: &Envelope) -> Result<T, ProtocolError> {
        let plaintext = self.open_raw(envelope)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| ProtocolError::Malformed(format!("Invalid payload: {}", e)))
    }

    /// Encrypt a JSON value
    pub fn encrypt_json(&self, value: &serde_json::Value) -> Result<Envelope, MasqError> {
        self.seal(value)
    }

    /// Decrypt to a JSON value
    pub fn decrypt_json(&self, envelope: &Envelope) -> Result<serde_json::Value, ProtocolError> {
        self.open(envelope)
    }

    fn open_raw(&self, envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
        let iv = BASE64
            .decode(&envelope.iv)
            .map_err(|e| ProtocolError::Malformed(format!("Invalid iv: {}", e)))?;
        if iv.len() != NONCE_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "Nonce must be {} bytes (got {})",
                NONCE_SIZE,
                iv.len()
            )));
        }
        let ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|e| ProtocolError::Malformed(format!("Invalid ciphertext: {}", e)))?;

        self.cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| ProtocolError::Authentication)
    }
}
