use crate::db::now;
use crate::error::{Result, StorageError};
use crate::operation::{OperationState, OperationType};
use crate::storage::Storage;
use broker_workspace::TerraformWorkspace;
use tracing::{debug, instrument};

/// Persisted engine workspace for one instance or binding.
#[derive(Debug, Clone, PartialEq)]
pub struct TerraformDeployment {
    pub id: String,
    pub workspace: TerraformWorkspace,
    pub last_operation_type: OperationType,
    pub last_operation_state: OperationState,
    pub last_operation_message: String,
}

impl TerraformDeployment {
    pub fn new(id: impl Into<String>, workspace: TerraformWorkspace, operation: OperationType) -> Self {
        Self {
            id: id.into(),
            workspace,
            last_operation_type: operation,
            last_operation_state: OperationState::InProgress,
            last_operation_message: String::new(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeploymentRow {
    id: String,
    workspace: Vec<u8>,
    last_operation_type: OperationType,
    last_operation_state: OperationState,
    last_operation_message: String,
}

impl Storage {
    /// Insert or replace the deployment with `deployment.id`.
    #[instrument(skip_all, fields(id = %deployment.id))]
    pub async fn store_terraform_deployment(&self, deployment: &TerraformDeployment) -> Result<()> {
        let workspace =
            self.encode_json(&deployment.workspace)
                .map_err(|source| StorageError::Encoding {
                    what: "workspace".to_string(),
                    source,
                })?;
        let ts = now();

        sqlx::query(
            r#"
            INSERT INTO terraform_deployments
                (id, workspace, last_operation_type, last_operation_state, last_operation_message, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                workspace = excluded.workspace,
                last_operation_type = excluded.last_operation_type,
                last_operation_state = excluded.last_operation_state,
                last_operation_message = excluded.last_operation_message,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&deployment.id)
        .bind(workspace)
        .bind(deployment.last_operation_type)
        .bind(deployment.last_operation_state)
        .bind(&deployment.last_operation_message)
        .bind(ts)
        .bind(ts)
        .execute(self.pool())
        .await?;

        debug!(state = %deployment.last_operation_state, "stored terraform deployment");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_terraform_deployment(&self, id: &str) -> Result<TerraformDeployment> {
        let row = sqlx::query_as::<_, DeploymentRow>(
            "SELECT id, workspace, last_operation_type, last_operation_state, last_operation_message
             FROM terraform_deployments WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| StorageError::NotFound {
            kind: "terraform deployment",
            id: id.to_string(),
        })?;

        let workspace = self
            .decode_json(&row.workspace)
            .map_err(|source| StorageError::Decoding {
                what: format!("workspace {:?}", id),
                source,
            })?;

        Ok(TerraformDeployment {
            id: row.id,
            workspace,
            last_operation_type: row.last_operation_type,
            last_operation_state: row.last_operation_state,
            last_operation_message: row.last_operation_message,
        })
    }

    pub async fn exists_terraform_deployment(&self, id: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM terraform_deployments WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        Ok(found.is_some())
    }

    /// Deleting an absent deployment succeeds.
    #[instrument(skip(self))]
    pub async fn delete_terraform_deployment(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM terraform_deployments WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
