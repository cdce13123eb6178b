use crate::db::now;
use crate::error::{Result, StorageError};
use crate::storage::Storage;
use serde_json::{Map, Value};

impl Storage {
    /// Keep the raw provision parameters so later updates can merge against them.
    pub async fn store_provision_request_details(
        &self,
        instance_id: &str,
        params: &Map<String, Value>,
    ) -> Result<()> {
        let sealed = self
            .encode_json(params)
            .map_err(|source| StorageError::Encoding {
                what: "provision request details".to_string(),
                source,
            })?;
        let ts = now();

        sqlx::query(
            r#"
            INSERT INTO provision_request_details (service_instance_id, request_details, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(service_instance_id) DO UPDATE SET
                request_details = excluded.request_details,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(instance_id)
        .bind(sealed)
        .bind(ts)
        .bind(ts)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn get_provision_request_details(&self, instance_id: &str) -> Result<Map<String, Value>> {
        let sealed: Vec<u8> = sqlx::query_scalar(
            "SELECT request_details FROM provision_request_details WHERE service_instance_id = ?",
        )
        .bind(instance_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| StorageError::NotFound {
            kind: "provision request details",
            id: instance_id.to_string(),
        })?;

        self.decode_json_object(&sealed)
            .map_err(|source| StorageError::Decoding {
                what: format!("provision request details {:?}", instance_id),
                source,
            })
    }

    pub async fn delete_provision_request_details(&self, instance_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM provision_request_details WHERE service_instance_id = ?")
            .bind(instance_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
