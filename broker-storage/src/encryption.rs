//! Encryption at rest.

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use thiserror::Error;

/// Number of PBKDF2 iterations for key derivation
const PBKDF2_ITERATIONS: u32 = 100_000;

pub const SALT_LENGTH: usize = 32;

const NONCE_LENGTH: usize = 12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct EncryptionError {
    message: String,
}

impl EncryptionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Reversible transformation applied to every stored blob.
///
/// `decrypt(encrypt(b)) == b` must hold for every input, including empty.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError>;
}

/// Stores data as-is. Used when encryption at rest is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEncryptor;

impl Encryptor for NoopEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        Ok(ciphertext.to_vec())
    }
}

/// AES-256-GCM with a PBKDF2-derived key. Output is `nonce || ciphertext`.
#[derive(Clone)]
pub struct GcmEncryptor {
    cipher: Aes256Gcm,
}

impl GcmEncryptor {
    pub fn derive_from_password(password: &str, salt: &[u8]) -> Result<Self, EncryptionError> {
        if salt.len() != SALT_LENGTH {
            return Err(EncryptionError::new(format!(
                "salt must be {} bytes long",
                SALT_LENGTH
            )));
        }

        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| EncryptionError::new(format!("failed to create cipher: {}", e)))?;

        Ok(Self { cipher })
    }
}

impl Encryptor for GcmEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| EncryptionError::new(format!("encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(combined)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if ciphertext.len() < NONCE_LENGTH {
            return Err(EncryptionError::new("encrypted data too short"));
        }

        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LENGTH);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, sealed)
            .map_err(|e| EncryptionError::new(format!("decryption failed: {}", e)))
    }
}

pub fn generate_salt() -> [u8; SALT_LENGTH] {
    let mut salt = [0u8; SALT_LENGTH];
    OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gcm_round_trip() {
        let salt = generate_salt();
        let enc = GcmEncryptor::derive_from_password("correct horse battery staple", &salt).unwrap();

        let inputs: [&[u8]; 4] = [b"", b"x", b"{\"modules\":[]}", &[0u8, 255, 7, 0]];
        for plaintext in inputs {
            let sealed = enc.encrypt(plaintext).unwrap();
            assert_ne!(sealed.as_slice(), plaintext);
            assert_eq!(enc.decrypt(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_gcm_nonce_varies() {
        let enc = GcmEncryptor::derive_from_password("pw", &generate_salt()).unwrap();
        assert_ne!(enc.encrypt(b"same").unwrap(), enc.encrypt(b"same").unwrap());
    }

    #[test]
    fn test_gcm_wrong_key_fails() {
        let salt = generate_salt();
        let a = GcmEncryptor::derive_from_password("one", &salt).unwrap();
        let b = GcmEncryptor::derive_from_password("two", &salt).unwrap();
        let sealed = a.encrypt(b"secret").unwrap();
        assert!(b.decrypt(&sealed).is_err());
        assert!(a.decrypt(b"short").is_err());
    }

    #[test]
    fn test_bad_salt_length() {
        assert!(GcmEncryptor::derive_from_password("pw", b"short").is_err());
    }

    #[test]
    fn test_noop_is_identity() {
        let inputs: [&[u8]; 2] = [b"", b"plain"];
        for plaintext in inputs {
            assert_eq!(NoopEncryptor.encrypt(plaintext).unwrap(), plaintext);
            assert_eq!(NoopEncryptor.decrypt(plaintext).unwrap(), plaintext);
        }
    }
}
