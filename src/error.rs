//! Error taxonomy for the migration.
//!
//! Errors are not recovered inside the migration core; they unwind to the
//! strategy boundary and from there to the CLI, which maps them onto exit
//! codes. The only soft condition is a missing wallet key under
//! `--allow-missing-wallet`, which the strategies handle in place.

use thiserror::Error;

use crate::crypto::CryptoError;

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("no metadata table found: not an Indy wallet database")]
    NotIndyWallet,

    #[error("failed to decrypt {0}")]
    DecryptionFailed(&'static str),

    #[error("crypto configuration error")]
    CryptoConfig(#[source] CryptoError),

    #[error("malformed key bundle: expected a positional array of 7 keys")]
    MalformedKeyBundle,

    #[error("error parsing {kind} id: {id}")]
    MalformedId { kind: &'static str, id: String },

    #[error("schema id not found for credential definition: {0}")]
    MissingSchemaId(String),

    #[error("wallet {0} not found in database")]
    WalletAlignment(String),

    #[error("no wallet key provided for wallet {0}")]
    MissingWallet(String),

    #[error("encountered multiple master secrets")]
    DuplicateMasterSecret,

    #[error("duplicate metadata row for wallet")]
    DuplicateMetadata,

    #[error("metadata row not found for wallet")]
    MissingMetadata,

    #[error("malformed record value for {0}")]
    MalformedRecord(String),

    #[error("malformed tag encoding")]
    MalformedTagEncoding,

    #[error("profile has not been initialized")]
    ProfileNotInitialized,

    #[error("profile {0} not found in store")]
    ProfileNotFound(String),

    #[error("invalid profile key encoding")]
    ProfileKeyEncoding,

    #[error("store config is missing entry {0}")]
    MissingConfig(&'static str),

    #[error("unsupported store version {0}")]
    UnsupportedVersion(String),

    #[error("invalid pass-key descriptor: {0}")]
    InvalidPassKey(String),

    #[error("invalid database URI: {0}")]
    InvalidUri(String),

    #[error("database connection is not open")]
    NotConnected,

    #[error("record value is not valid UTF-8")]
    InvalidEncoding,

    #[error("invalid base58 value")]
    Base58(#[from] bs58::decode::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Usage(String),
}

impl From<CryptoError> for UpgradeError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::DecryptionFailed => UpgradeError::DecryptionFailed("record"),
            other => UpgradeError::CryptoConfig(other),
        }
    }
}
