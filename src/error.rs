//! Error taxonomy for the secure-messaging core.
//!
//! One variant per error kind named in the design's error-handling section;
//! the display strings are diagnostic only, not a stable interface.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DedpasteError>;

/// A key-ID as reported by an OpenPGP decryption attempt, for user diagnosis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyId {
    pub key_type: String,
    pub id: String,
}

#[derive(Error, Debug)]
pub enum DedpasteError {
    #[error("key store I/O error: {0}")]
    StoreIO(#[from] std::io::Error),

    #[error("key database is corrupt: {0}")]
    StoreCorrupt(String),

    #[error("expected a {expected} key but got {actual}")]
    WrongKeyKind { expected: &'static str, actual: &'static str },

    #[error("recipient not found: {0}")]
    RecipientNotFound(String),

    #[error("no keyservers could resolve the key: {0}")]
    KeyserverUnavailable(String),

    #[error("github user has no published gpg key: {0}")]
    GithubKeyNotFound(String),

    #[error("keybase user has no verified proofs: {0}")]
    UnverifiedKeybaseUser(String),

    #[error("incorrect passphrase for private key")]
    BadPassphrase,

    #[error("private key could not decrypt the session key")]
    BadPrivateKey,

    #[error("ciphertext failed integrity verification")]
    IntegrityFailure,

    #[error("no private key matches this message (recipients: {0:?})")]
    NoMatchingKey(Vec<KeyId>),

    #[error("envelope is not a recognized OpenPGP message")]
    WrongEnvelopeFormat,

    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(u32),

    #[error("envelope was not addressed to you (recipient recorded as {0:?})")]
    NotForYou(String),

    #[error("self-encryption is not supported for the OpenPGP path")]
    SelfPgpNotSupported,

    #[error("cryptographic operation timed out")]
    CryptoTimeout,

    #[error("operation cancelled by user")]
    UserCancelled,

    #[error("host agent is not available on this system")]
    HostAgentUnavailable,

    #[error("group {0:?} may not contain itself")]
    RecursiveGroup(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("rsa error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("pkcs8 error: {0}")]
    Pkcs8(String),

    #[error("openpgp error: {0}")]
    OpenPgp(#[from] anyhow::Error),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}
