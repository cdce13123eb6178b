use crate::db::now;
use crate::error::{Result, StorageError};
use crate::storage::Storage;
use serde_json::{Map, Value};
use tracing::{info, instrument};

/// Broker-side record of a service instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceInstanceDetails {
    pub id: String,
    pub name: String,
    pub service_id: String,
    pub plan_id: String,
    pub space_guid: String,
    pub organization_guid: String,
    /// Type of the last asynchronous operation, empty when none is pending.
    pub operation_type: String,
    pub operation_id: String,
    pub outputs: Map<String, Value>,
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    name: String,
    service_id: String,
    plan_id: String,
    space_guid: String,
    organization_guid: String,
    operation_type: String,
    operation_id: String,
    outputs: Option<Vec<u8>>,
}

impl Storage {
    #[instrument(skip_all, fields(id = %details.id))]
    pub async fn store_service_instance_details(&self, details: &ServiceInstanceDetails) -> Result<()> {
        let outputs = self
            .encode_json(&details.outputs)
            .map_err(|source| StorageError::Encoding {
                what: "outputs".to_string(),
                source,
            })?;
        let ts = now();

        sqlx::query(
            r#"
            INSERT INTO service_instance_details
                (id, name, service_id, plan_id, space_guid, organization_guid, operation_type, operation_id, outputs, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                service_id = excluded.service_id,
                plan_id = excluded.plan_id,
                space_guid = excluded.space_guid,
                organization_guid = excluded.organization_guid,
                operation_type = excluded.operation_type,
                operation_id = excluded.operation_id,
                outputs = excluded.outputs,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&details.id)
        .bind(&details.name)
        .bind(&details.service_id)
        .bind(&details.plan_id)
        .bind(&details.space_guid)
        .bind(&details.organization_guid)
        .bind(&details.operation_type)
        .bind(&details.operation_id)
        .bind(outputs)
        .bind(ts)
        .bind(ts)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn get_service_instance_details(&self, id: &str) -> Result<ServiceInstanceDetails> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT id, name, service_id, plan_id, space_guid, organization_guid, operation_type, operation_id, outputs
             FROM service_instance_details WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| StorageError::NotFound {
            kind: "service instance details",
            id: id.to_string(),
        })?;

        let outputs = match &row.outputs {
            Some(sealed) => {
                self.decode_json_object(sealed)
                    .map_err(|source| StorageError::Decoding {
                        what: format!("outputs {:?}", id),
                        source,
                    })?
            }
            None => Map::new(),
        };

        Ok(ServiceInstanceDetails {
            id: row.id,
            name: row.name,
            service_id: row.service_id,
            plan_id: row.plan_id,
            space_guid: row.space_guid,
            organization_guid: row.organization_guid,
            operation_type: row.operation_type,
            operation_id: row.operation_id,
            outputs,
        })
    }

    pub async fn exists_service_instance_details(&self, id: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM service_instance_details WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        Ok(found.is_some())
    }

    pub async fn delete_service_instance_details(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM service_instance_details WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Remove an instance's details and its provision request parameters together.
    #[instrument(skip(self))]
    pub async fn delete_instance_records(&self, id: &str) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM service_instance_details WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM provision_request_details WHERE service_instance_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!("removed instance records");
        Ok(())
    }
}
