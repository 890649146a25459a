//! Error types for Masq

use thiserror::Error;

/// Failures that end a pairing session.
///
/// Every variant is terminal: the session is closed and no access is granted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A message arrived that the current state does not accept
    #[error("Unexpected message '{msg}' in state {state}")]
    UnexpectedMessage {
        /// State the machine was in
        state: String,
        /// Discriminator of the offending message
        msg: String,
    },

    /// Payload could not be parsed (bad JSON, bad base64, unknown `msg`)
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// AEAD tag did not verify (wrong key or tampered envelope)
    #[error("Message authentication failed")]
    Authentication,

    /// The peer went away before the flow completed
    #[error("Peer closed the connection in state {0}")]
    PeerClosed(String),

    /// A protocol round-trip did not complete in time
    #[error("Timed out in state {0}")]
    Timeout(String),

    /// The session was cancelled locally
    #[error("Pairing session cancelled")]
    Cancelled,
}

/// Main error type for Masq operations
#[derive(Error, Debug)]
pub enum MasqError {
    /// Input rejected before any mutation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Update attempted on a record without an id
    #[error("Missing id")]
    MissingId,

    /// Operation needs a logged-in profile
    #[error("Open a profile first")]
    NoOpenProfile,

    /// Profile id is not known locally
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// Passphrase did not match the stored hash
    #[error("Invalid passphrase")]
    InvalidPassphrase,

    /// Pairing protocol failure
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Replicated store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Writer key is not a valid ed25519 public key
    #[error("Invalid writer key: {0}")]
    InvalidWriterKey(String),

    /// The local writer has not been authorized on this store
    #[error("Store '{0}' is not writable by this device")]
    NotWritable(String),

    /// A store name is already bound to a different public key
    #[error("Store '{name}' already exists with key {existing}")]
    StoreKeyMismatch {
        /// Store name
        name: String,
        /// Key found on disk
        existing: String,
    },

    /// Rendezvous or transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Pairing link could not be decoded
    #[error("Invalid pairing link: {0}")]
    InvalidLink(String),

    /// Operation not valid for this component
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),
}

impl From<serde_json::Error> for MasqError {
    fn from(e: serde_json::Error) -> Self {
        MasqError::Serialization(e.to_string())
    }
}

impl From<postcard::Error> for MasqError {
    fn from(e: postcard::Error) -> Self {
        MasqError::Serialization(e.to_string())
    }
}

impl MasqError {
    /// True when the error came from the pairing protocol layer
    pub fn is_protocol(&self) -> bool {
        matches!(self, MasqError::Protocol(_))
    }
}

/// Result type alias using MasqError
pub type MasqResult<T> = Result<T, MasqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_messages() {
        assert_eq!(MasqError::MissingId.to_string(), "Missing id");
        assert_eq!(MasqError::NoOpenProfile.to_string(), "Open a profile first");
    }

    #[test]
    fn test_protocol_error_wraps() {
        let err: MasqError = ProtocolError::Authentication.into();
        assert!(err.is_protocol());
        assert_eq!(
            err.to_string(),
            "Protocol error: Message authentication failed"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MasqError = io_err.into();
        assert!(matches!(err, MasqError::Io(_)));
    }
}
