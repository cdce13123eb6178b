use crate::encryption::Encryptor;
use crate::error::CodecError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Database access with encryption applied to every stored blob.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
    encryptor: Arc<dyn Encryptor>,
}

impl Storage {
    pub fn new(pool: SqlitePool, encryptor: Arc<dyn Encryptor>) -> Self {
        Self { pool, encryptor }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn encode_bytes(&self, plain: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.encryptor.encrypt(plain).map_err(CodecError::Encrypt)
    }

    pub(crate) fn encode_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let raw = serde_json::to_vec(value).map_err(CodecError::Marshal)?;
        self.encode_bytes(&raw)
    }

    pub(crate) fn decode_bytes(&self, sealed: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.encryptor.decrypt(sealed).map_err(CodecError::Decrypt)
    }

    /// Decode a value that must be present. An empty payload is an error.
    pub(crate) fn decode_json<T: DeserializeOwned>(&self, sealed: &[u8]) -> Result<T, CodecError> {
        let raw = self.decode_bytes(sealed)?;
        if raw.is_empty() {
            return Err(CodecError::Empty);
        }
        serde_json::from_slice(&raw).map_err(CodecError::Parse)
    }

    /// Decode a JSON object where an empty payload means no keys.
    pub(crate) fn decode_json_object(&self, sealed: &[u8]) -> Result<Map<String, Value>, CodecError> {
        let raw = self.decode_bytes(sealed)?;
        if raw.is_empty() {
            return Ok(Map::new());
        }
        serde_json::from_slice(&raw).map_err(CodecError::Parse)
    }
}
