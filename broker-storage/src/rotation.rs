//! Re-encrypting stored blobs when the key they are sealed with changes.

use crate::encryption::Encryptor;
use crate::error::{CodecError, Result, StorageError};
use sqlx::SqliteConnection;
use tracing::debug;

/// `(table, key column, blob column)` for every encrypted column.
const SEALED_COLUMNS: &[(&str, &str, &str)] = &[
    ("terraform_deployments", "id", "workspace"),
    ("service_instance_details", "id", "outputs"),
    ("provision_request_details", "service_instance_id", "request_details"),
];

/// Number of encrypted blobs currently stored.
pub(crate) async fn count_sealed(conn: &mut SqliteConnection) -> Result<i64> {
    let mut total = 0;
    for (table, _, column) in SEALED_COLUMNS {
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE {column} IS NOT NULL"))
                .fetch_one(&mut *conn)
                .await?;
        total += count;
    }
    Ok(total)
}

/// Decrypt every stored blob with `from` and write it back sealed with `to`.
///
/// Runs on the caller's connection so the caller decides the transaction.
/// The first blob that fails to decrypt aborts the whole rewrite.
pub(crate) async fn reencrypt_all(
    conn: &mut SqliteConnection,
    from: &dyn Encryptor,
    to: &dyn Encryptor,
) -> Result<usize> {
    let mut rewritten = 0;
    for (table, key, column) in SEALED_COLUMNS {
        let rows: Vec<(String, Vec<u8>)> = sqlx::query_as(&format!(
            "SELECT {key}, {column} FROM {table} WHERE {column} IS NOT NULL"
        ))
        .fetch_all(&mut *conn)
        .await?;

        for (id, sealed) in rows {
            let what = || format!("{column} of {table} {id:?}");
            let plain = from.decrypt(&sealed).map_err(|e| StorageError::Decoding {
                what: what(),
                source: CodecError::Decrypt(e),
            })?;
            let resealed = to.encrypt(&plain).map_err(|e| StorageError::Encoding {
                what: what(),
                source: CodecError::Encrypt(e),
            })?;

            sqlx::query(&format!("UPDATE {table} SET {column} = ? WHERE {key} = ?"))
                .bind(resealed)
                .bind(&id)
                .execute(&mut *conn)
                .await?;
            rewritten += 1;
        }
        debug!(table = *table, column = *column, rewritten, "re-encrypted column");
    }
    Ok(rewritten)
}
