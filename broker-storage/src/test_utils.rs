use crate::encryption::{EncryptionError, Encryptor};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Mutex;

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("Failed to parse in-memory database URL");

    // One connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

const FAKE_PREFIX: &[u8] = b"sealed:";

/// Reversible encryptor with switchable failures.
///
/// Encrypted output is the plaintext behind a `sealed:` prefix, so tests can
/// check that data really passed through the encryptor.
#[derive(Default)]
pub struct FakeEncryptor {
    encrypt_error: Mutex<Option<String>>,
    decrypt_error: Mutex<Option<String>>,
}

impl FakeEncryptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_encrypt(&self, message: &str) {
        *self.encrypt_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.to_string());
    }

    pub fn fail_decrypt(&self, message: &str) {
        *self.decrypt_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.to_string());
    }

    pub fn seal(plain: &[u8]) -> Vec<u8> {
        let mut out = FAKE_PREFIX.to_vec();
        out.extend_from_slice(plain);
        out
    }
}

impl Encryptor for FakeEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if let Some(msg) = self.encrypt_error.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return Err(EncryptionError::new(msg.clone()));
        }
        Ok(Self::seal(plaintext))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if let Some(msg) = self.decrypt_error.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return Err(EncryptionError::new(msg.clone()));
        }
        ciphertext
            .strip_prefix(FAKE_PREFIX)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| EncryptionError::new("not sealed by the fake encryptor"))
    }
}
