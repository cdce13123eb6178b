//! Encryption password bookkeeping.
//!
//! Each configured password gets a random salt and a canary: a known value
//! encrypted with the derived key. On the next start the canary proves the
//! configured password is the one the data was written with.

use crate::db::now;
use crate::encryption::{generate_salt, Encryptor, GcmEncryptor, NoopEncryptor};
use crate::error::{Result, StorageError};
use crate::rotation::{count_sealed, reencrypt_all};
use serde::Deserialize;
use sqlx::{SqliteExecutor, SqlitePool};
use std::sync::Arc;
use tracing::{info, instrument, warn};

const CANARY: &[u8] = b"canary value";

/// A password as configured by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EncryptionPassword {
    pub label: String,
    #[serde(rename = "password")]
    pub secret: String,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PasswordMetadata {
    pub label: String,
    pub salt: Vec<u8>,
    pub canary: Vec<u8>,
    #[sqlx(rename = "is_primary")]
    pub primary: bool,
}

pub async fn store_password_metadata<'e, E>(executor: E, metadata: &PasswordMetadata) -> Result<()>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO password_metadata (label, salt, canary, is_primary, created_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(label) DO UPDATE SET
            salt = excluded.salt,
            canary = excluded.canary,
            is_primary = excluded.is_primary
        "#,
    )
    .bind(&metadata.label)
    .bind(&metadata.salt)
    .bind(&metadata.canary)
    .bind(metadata.primary)
    .bind(now())
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_password_metadata(pool: &SqlitePool, label: &str) -> Result<Option<PasswordMetadata>> {
    let row = sqlx::query_as::<_, PasswordMetadata>(
        "SELECT label, salt, canary, is_primary FROM password_metadata WHERE label = ?",
    )
    .bind(label)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn list_password_labels<'e, E>(executor: E) -> Result<Vec<String>>
where
    E: SqliteExecutor<'e>,
{
    let labels: Vec<String> = sqlx::query_scalar("SELECT label FROM password_metadata ORDER BY label")
        .fetch_all(executor)
        .await?;
    Ok(labels)
}

/// The metadata of the password stored data is currently sealed with.
async fn stored_primary(pool: &SqlitePool) -> Result<Option<PasswordMetadata>> {
    let row = sqlx::query_as::<_, PasswordMetadata>(
        "SELECT label, salt, canary, is_primary FROM password_metadata WHERE is_primary = 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Delete the metadata for every label in `labels` in one transaction.
#[instrument(skip(pool))]
pub async fn delete_password_metadata(pool: &SqlitePool, labels: &[String]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for label in labels {
        sqlx::query("DELETE FROM password_metadata WHERE label = ?")
            .bind(label)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

fn primary_password(passwords: &[EncryptionPassword]) -> Result<&EncryptionPassword> {
    let mut labels = std::collections::HashSet::new();
    for p in passwords {
        if p.label.trim().is_empty() || p.secret.is_empty() {
            return Err(StorageError::EncryptionSetup(
                "every password needs a label and a secret".to_string(),
            ));
        }
        if !labels.insert(p.label.as_str()) {
            return Err(StorageError::EncryptionSetup(format!(
                "duplicate password label {:?}",
                p.label
            )));
        }
    }

    let mut primaries = passwords.iter().filter(|p| p.primary);
    match (primaries.next(), primaries.next()) {
        (Some(primary), None) => Ok(primary),
        (None, _) => Err(StorageError::EncryptionSetup(
            "encryption is enabled but no primary password is set".to_string(),
        )),
        (Some(_), Some(_)) => Err(StorageError::EncryptionSetup(
            "encryption is enabled but several passwords are marked primary".to_string(),
        )),
    }
}

fn canary_mismatch(label: &str) -> StorageError {
    StorageError::EncryptionSetup(format!(
        "canary mismatch for password {label:?}: the password has changed"
    ))
}

/// Derive the key for stored metadata and check it against the canary.
fn unlock(metadata: &PasswordMetadata, secret: &str) -> Result<GcmEncryptor> {
    let encryptor = GcmEncryptor::derive_from_password(secret, &metadata.salt).map_err(|e| {
        StorageError::EncryptionSetup(format!("password {:?}: {}", metadata.label, e))
    })?;
    match encryptor.decrypt(&metadata.canary) {
        Ok(canary) if canary == CANARY => Ok(encryptor),
        _ => Err(canary_mismatch(&metadata.label)),
    }
}

fn configured_secret<'a>(passwords: &'a [EncryptionPassword], label: &str) -> Option<&'a str> {
    passwords
        .iter()
        .find(|p| p.label == label)
        .map(|p| p.secret.as_str())
}

/// The encryptor stored data is sealed with right now, if it can be opened.
///
/// Fails when data exists under a password that is no longer configured.
/// `None` means there is nothing that needs the old key.
async fn current_encryptor(
    pool: &SqlitePool,
    passwords: &[EncryptionPassword],
) -> Result<Option<Box<dyn Encryptor>>> {
    let Some(stored) = stored_primary(pool).await? else {
        if list_password_labels(pool).await?.is_empty() {
            return Ok(Some(Box::new(NoopEncryptor)));
        }
        return Err(StorageError::EncryptionSetup(
            "password metadata exists but none of it is marked primary".to_string(),
        ));
    };

    match configured_secret(passwords, &stored.label) {
        Some(secret) => Ok(Some(Box::new(unlock(&stored, secret)?))),
        None => {
            let mut conn = pool.acquire().await?;
            if count_sealed(&mut *conn).await? > 0 {
                return Err(StorageError::EncryptionSetup(format!(
                    "stored data is encrypted with password {:?}, which is not configured",
                    stored.label
                )));
            }
            Ok(None)
        }
    }
}

/// Build the encryptor for the configured passwords.
///
/// With encryption disabled this is the no-op encryptor. Otherwise the
/// primary password's key is derived, its salt and canary are created on
/// first use and checked afterwards, and metadata for passwords that are no
/// longer configured is removed.
///
/// When the key changes (a new primary, encryption switched on over plain
/// data, or switched off) every stored blob is re-encrypted with the new
/// key in the same transaction that records the new metadata. The password
/// the data was sealed with must still be configured for that.
#[instrument(skip_all, fields(enabled = enabled, passwords = passwords.len()))]
pub async fn setup_encryptor(
    pool: &SqlitePool,
    enabled: bool,
    passwords: &[EncryptionPassword],
) -> Result<Arc<dyn Encryptor>> {
    if !enabled {
        let Some(stored) = stored_primary(pool).await? else {
            info!("encryption at rest is disabled");
            return Ok(Arc::new(NoopEncryptor));
        };
        let secret = configured_secret(passwords, &stored.label).ok_or_else(|| {
            StorageError::EncryptionSetup(format!(
                "encryption is disabled but stored data is encrypted with password {:?}, which is not configured",
                stored.label
            ))
        })?;
        let previous = unlock(&stored, secret)?;

        let mut tx = pool.begin().await?;
        let rewritten = reencrypt_all(&mut *tx, &previous, &NoopEncryptor).await?;
        sqlx::query("DELETE FROM password_metadata")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        warn!(label = %stored.label, rewritten, "encryption disabled, stored data decrypted");
        return Ok(Arc::new(NoopEncryptor));
    }

    let primary = primary_password(passwords)?;
    let (encryptor, metadata) = match get_password_metadata(pool, &primary.label).await? {
        Some(existing) => (
            unlock(&existing, &primary.secret)?,
            PasswordMetadata {
                primary: true,
                ..existing
            },
        ),
        None => {
            let salt = generate_salt();
            let encryptor = GcmEncryptor::derive_from_password(&primary.secret, &salt).map_err(|e| {
                StorageError::EncryptionSetup(format!("password {:?}: {}", primary.label, e))
            })?;
            let canary = encryptor.encrypt(CANARY).map_err(|e| {
                StorageError::EncryptionSetup(format!("password {:?}: {}", primary.label, e))
            })?;
            info!(label = %primary.label, "creating metadata for new primary password");
            (
                encryptor,
                PasswordMetadata {
                    label: primary.label.clone(),
                    salt: salt.to_vec(),
                    canary,
                    primary: true,
                },
            )
        }
    };

    let rotate_from = match stored_primary(pool).await? {
        Some(stored) if stored.label == primary.label => None,
        _ => current_encryptor(pool, passwords).await?,
    };

    let mut tx = pool.begin().await?;
    if let Some(previous) = &rotate_from {
        let rewritten = reencrypt_all(&mut *tx, &**previous, &encryptor).await?;
        info!(label = %primary.label, rewritten, "re-encrypted stored data with the primary password");
    }

    store_password_metadata(&mut *tx, &metadata).await?;
    sqlx::query("UPDATE password_metadata SET is_primary = 0 WHERE label != ?")
        .bind(&primary.label)
        .execute(&mut *tx)
        .await?;

    let stale: Vec<String> = list_password_labels(&mut *tx)
        .await?
        .into_iter()
        .filter(|label| passwords.iter().all(|p| &p.label != label))
        .collect();
    if !stale.is_empty() {
        warn!(labels = ?stale, "removing metadata for passwords no longer configured");
        for label in &stale {
            sqlx::query("DELETE FROM password_metadata WHERE label = ?")
                .bind(label)
                .execute(&mut *tx)
                .await?;
        }
    }
    tx.commit().await?;

    Ok(Arc::new(encryptor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_db;

    fn password(label: &str, secret: &str, primary: bool) -> EncryptionPassword {
        EncryptionPassword {
            label: label.to_string(),
            secret: secret.to_string(),
            primary,
        }
    }

    #[tokio::test]
    async fn test_disabled_is_noop() {
        let pool = create_test_db().await;
        let enc = setup_encryptor(&pool, false, &[]).await.unwrap();
        assert_eq!(enc.encrypt(b"plain").unwrap(), b"plain");
    }

    #[tokio::test]
    async fn test_first_use_creates_metadata_then_verifies() {
        let pool = create_test_db().await;
        let passwords = vec![password("one", "a-very-secret-password", true)];

        let first = setup_encryptor(&pool, true, &passwords).await.unwrap();
        let sealed = first.encrypt(b"payload").unwrap();
        let meta = get_password_metadata(&pool, "one").await.unwrap().unwrap();
        assert!(meta.primary);
        assert_eq!(meta.salt.len(), crate::encryption::SALT_LENGTH);

        let second = setup_encryptor(&pool, true, &passwords).await.unwrap();
        assert_eq!(second.decrypt(&sealed).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_changed_password_is_rejected() {
        let pool = create_test_db().await;
        setup_encryptor(&pool, true, &[password("one", "original-secret", true)])
            .await
            .unwrap();

        let err = setup_encryptor(&pool, true, &[password("one", "different-secret", true)])
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("canary mismatch"), "{err}");
    }

    #[tokio::test]
    async fn test_primary_required() {
        let pool = create_test_db().await;
        let none = setup_encryptor(&pool, true, &[password("one", "secret", false)]).await;
        assert!(matches!(none, Err(StorageError::EncryptionSetup(_))));

        let two = setup_encryptor(
            &pool,
            true,
            &[password("one", "secret", true), password("two", "secret", true)],
        )
        .await;
        assert!(matches!(two, Err(StorageError::EncryptionSetup(_))));

        let dup = setup_encryptor(
            &pool,
            true,
            &[password("one", "secret", true), password("one", "other", false)],
        )
        .await;
        assert!(matches!(dup, Err(StorageError::EncryptionSetup(_))));
    }

    #[tokio::test]
    async fn test_unconfigured_labels_removed() {
        let pool = create_test_db().await;
        setup_encryptor(&pool, true, &[password("old", "old-secret", true)])
            .await
            .unwrap();

        setup_encryptor(&pool, true, &[password("new", "new-secret", true)])
            .await
            .unwrap();

        assert_eq!(list_password_labels(&pool).await.unwrap(), vec!["new"]);
    }

    #[tokio::test]
    async fn test_delete_password_metadata_batch() {
        let pool = create_test_db().await;
        for label in ["a", "b", "c"] {
            store_password_metadata(
                &pool,
                &PasswordMetadata {
                    label: label.to_string(),
                    salt: vec![1; 32],
                    canary: vec![2],
                    primary: false,
                },
            )
            .await
            .unwrap();
        }

        delete_password_metadata(&pool, &["a".to_string(), "c".to_string(), "missing".to_string()])
            .await
            .unwrap();

        assert_eq!(list_password_labels(&pool).await.unwrap(), vec!["b"]);
    }
}
