use crate::encryption::EncryptionError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Failure turning a value into a stored blob or back.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("encryption error: {0}")]
    Encrypt(#[source] EncryptionError),

    #[error("decryption error: {0}")]
    Decrypt(#[source] EncryptionError),

    #[error("JSON marshal error: {0}")]
    Marshal(#[source] serde_json::Error),

    #[error("JSON parse error: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("decrypted payload is empty")]
    Empty,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not find {kind}: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("error encoding {what}: {source}")]
    Encoding {
        what: String,
        #[source]
        source: CodecError,
    },

    #[error("error decoding {what}: {source}")]
    Decoding {
        what: String,
        #[source]
        source: CodecError,
    },

    #[error("encryption setup error: {0}")]
    EncryptionSetup(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}
