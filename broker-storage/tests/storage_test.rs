//! Integration tests for broker-storage
//!
//! Exercises deployment, instance and request persistence against an
//! in-memory database with a fake encryptor in between.

use broker_storage::test_utils::{create_test_db, FakeEncryptor};
use broker_storage::{
    setup_encryptor, CodecError, EncryptionPassword, NoopEncryptor, OperationState, OperationType, ServiceInstanceDetails, Storage,
    StorageError, TerraformDeployment,
};
use broker_workspace::{ModuleDefinition, TerraformWorkspace};
use serde_json::{json, Map, Value};
use std::sync::Arc;

async fn setup() -> (Storage, Arc<FakeEncryptor>) {
    let pool = create_test_db().await;
    let encryptor = Arc::new(FakeEncryptor::new());
    (Storage::new(pool, encryptor.clone()), encryptor)
}

fn workspace(module: &str) -> TerraformWorkspace {
    TerraformWorkspace {
        modules: vec![ModuleDefinition::new(module, "")],
        ..Default::default()
    }
}

fn deployment(id: &str, module: &str) -> TerraformDeployment {
    TerraformDeployment {
        id: id.to_string(),
        workspace: workspace(module),
        last_operation_type: OperationType::Provision,
        last_operation_state: OperationState::Succeeded,
        last_operation_message: "yes!!".to_string(),
    }
}

async fn raw_workspace(storage: &Storage, id: &str) -> Vec<u8> {
    sqlx::query_scalar("SELECT workspace FROM terraform_deployments WHERE id = ?")
        .bind(id)
        .fetch_one(storage.pool())
        .await
        .expect("Failed to read raw workspace")
}

async fn corrupt_workspace(storage: &Storage, id: &str, blob: &[u8]) {
    sqlx::query("UPDATE terraform_deployments SET workspace = ? WHERE id = ?")
        .bind(blob)
        .bind(id)
        .execute(storage.pool())
        .await
        .expect("Failed to overwrite workspace");
}

#[tokio::test]
async fn test_store_encrypts_workspace() {
    let (storage, _) = setup().await;
    let d = deployment("fake-id", "first");

    storage
        .store_terraform_deployment(&d)
        .await
        .expect("Failed to store deployment");

    let raw = raw_workspace(&storage, "fake-id").await;
    assert!(raw.starts_with(b"sealed:"));
    let stored: Value = serde_json::from_slice(&raw[b"sealed:".len()..]).unwrap();
    assert_eq!(stored["modules"][0]["name"], json!("first"));

    let read = storage.get_terraform_deployment("fake-id").await.unwrap();
    assert_eq!(read, d);
}

#[tokio::test]
async fn test_store_updates_existing_record() {
    let (storage, _) = setup().await;
    storage
        .store_terraform_deployment(&deployment("fake-id-2", "fake-2"))
        .await
        .unwrap();

    let mut updated = deployment("fake-id-2", "first");
    updated.last_operation_type = OperationType::Update;
    updated.last_operation_state = OperationState::Failed;
    updated.last_operation_message = "too bad".to_string();
    storage.store_terraform_deployment(&updated).await.unwrap();

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM terraform_deployments")
        .fetch_one(storage.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(
        storage.get_terraform_deployment("fake-id-2").await.unwrap(),
        updated
    );
}

#[tokio::test]
async fn test_encoding_failure() {
    let (storage, encryptor) = setup().await;
    encryptor.fail_encrypt("bang");

    let err = storage
        .store_terraform_deployment(&deployment("fake-id", "first"))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "error encoding workspace: encryption error: bang"
    );
    assert!(!storage.exists_terraform_deployment("fake-id").await.unwrap());
}

#[tokio::test]
async fn test_decoding_failure() {
    let (storage, encryptor) = setup().await;
    storage
        .store_terraform_deployment(&deployment("fake-id-1", "fake-1"))
        .await
        .unwrap();
    encryptor.fail_decrypt("bang");

    let err = storage
        .get_terraform_deployment("fake-id-1")
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        r#"error decoding workspace "fake-id-1": decryption error: bang"#
    );
}

#[tokio::test]
async fn test_not_found_is_distinct_from_corruption() {
    let (storage, _) = setup().await;
    storage
        .store_terraform_deployment(&deployment("broken", "x"))
        .await
        .unwrap();
    corrupt_workspace(&storage, "broken", b"garbage").await;

    let missing = storage.get_terraform_deployment("not-there").await.unwrap_err();
    assert!(missing.is_not_found());
    assert_eq!(
        missing.to_string(),
        "could not find terraform deployment: not-there"
    );

    let corrupt = storage.get_terraform_deployment("broken").await.unwrap_err();
    assert!(matches!(
        corrupt,
        StorageError::Decoding {
            source: CodecError::Decrypt(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_empty_workspace_payload_is_an_error() {
    let (storage, _) = setup().await;
    storage
        .store_terraform_deployment(&deployment("empty", "x"))
        .await
        .unwrap();
    corrupt_workspace(&storage, "empty", &FakeEncryptor::seal(b"")).await;

    let err = storage.get_terraform_deployment("empty").await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::Decoding {
            source: CodecError::Empty,
            ..
        }
    ));

    corrupt_workspace(&storage, "empty", &FakeEncryptor::seal(b"{not json")).await;
    let err = storage.get_terraform_deployment("empty").await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::Decoding {
            source: CodecError::Parse(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_exists_and_idempotent_delete() {
    let (storage, _) = setup().await;
    for (id, module) in [("fake-id-1", "a"), ("fake-id-2", "b"), ("fake-id-3", "c")] {
        storage
            .store_terraform_deployment(&deployment(id, module))
            .await
            .unwrap();
    }

    assert!(!storage.exists_terraform_deployment("not-there").await.unwrap());
    assert!(storage.exists_terraform_deployment("fake-id-1").await.unwrap());
    assert!(storage.exists_terraform_deployment("fake-id-3").await.unwrap());

    storage.delete_terraform_deployment("fake-id-3").await.unwrap();
    assert!(!storage.exists_terraform_deployment("fake-id-3").await.unwrap());

    storage.delete_terraform_deployment("not-there").await.unwrap();
    storage.delete_terraform_deployment("not-there").await.unwrap();
    assert!(storage.exists_terraform_deployment("fake-id-2").await.unwrap());
}

#[tokio::test]
async fn test_instance_details_round_trip() {
    let (storage, _) = setup().await;
    let details = ServiceInstanceDetails {
        id: "instance-1".to_string(),
        name: "db".to_string(),
        service_id: "svc".to_string(),
        plan_id: "plan".to_string(),
        space_guid: "space".to_string(),
        organization_guid: "org".to_string(),
        operation_type: "provision".to_string(),
        operation_id: "tf:instance-1:".to_string(),
        outputs: json!({"hostname": "db.internal"})
            .as_object()
            .cloned()
            .unwrap(),
    };

    storage.store_service_instance_details(&details).await.unwrap();
    assert!(storage.exists_service_instance_details("instance-1").await.unwrap());
    assert_eq!(
        storage.get_service_instance_details("instance-1").await.unwrap(),
        details
    );

    let raw: Vec<u8> =
        sqlx::query_scalar("SELECT outputs FROM service_instance_details WHERE id = ?")
            .bind("instance-1")
            .fetch_one(storage.pool())
            .await
            .unwrap();
    assert!(raw.starts_with(b"sealed:"));

    let err = storage
        .get_service_instance_details("nope")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_provision_request_details() {
    let (storage, _) = setup().await;
    let params = json!({"size": "large", "labels": {"env": "dev"}})
        .as_object()
        .cloned()
        .unwrap();

    storage
        .store_provision_request_details("instance-1", &params)
        .await
        .unwrap();
    assert_eq!(
        storage.get_provision_request_details("instance-1").await.unwrap(),
        params
    );

    storage
        .store_provision_request_details("instance-1", &Map::new())
        .await
        .unwrap();
    assert!(storage
        .get_provision_request_details("instance-1")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_delete_instance_records_removes_both_rows() {
    let (storage, _) = setup().await;
    storage
        .store_service_instance_details(&ServiceInstanceDetails {
            id: "gone".to_string(),
            service_id: "svc".to_string(),
            plan_id: "plan".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    storage
        .store_provision_request_details("gone", &Map::new())
        .await
        .unwrap();

    storage.delete_instance_records("gone").await.unwrap();

    assert!(!storage.exists_service_instance_details("gone").await.unwrap());
    assert!(storage
        .get_provision_request_details("gone")
        .await
        .unwrap_err()
        .is_not_found());

    // Absent rows are fine.
    storage.delete_instance_records("gone").await.unwrap();
}

#[tokio::test]
async fn test_noop_encryptor_stores_plain_json() {
    let pool = create_test_db().await;
    let storage = Storage::new(pool, Arc::new(NoopEncryptor));
    storage
        .store_terraform_deployment(&deployment("plain", "m"))
        .await
        .unwrap();

    let raw = raw_workspace(&storage, "plain").await;
    let stored: Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(stored["modules"][0]["name"], json!("m"));
}

#[tokio::test]
async fn test_file_database_with_migrations() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("nested").join("broker.db");
    assert_eq!(broker_storage::db::backup_database(&path).unwrap(), None);

    let pool = broker_storage::db::create_pool(&path).await.unwrap();
    broker_storage::db::run_migrations(&pool).await.unwrap();
    broker_storage::db::run_migrations(&pool).await.unwrap();

    let storage = Storage::new(pool, Arc::new(NoopEncryptor));
    storage
        .store_terraform_deployment(&deployment("on-disk", "m"))
        .await
        .unwrap();
    assert!(storage.exists_terraform_deployment("on-disk").await.unwrap());

    let backup = broker_storage::db::backup_database(&path)
        .unwrap()
        .expect("existing database should be backed up");
    assert!(backup.exists());
    assert_eq!(
        std::fs::metadata(&backup).unwrap().len(),
        std::fs::metadata(&path).unwrap().len()
    );
}

fn password(label: &str, primary: bool) -> EncryptionPassword {
    EncryptionPassword {
        label: label.to_string(),
        secret: format!("{label}-secret"),
        primary,
    }
}

async fn store_everything(storage: &Storage) {
    storage
        .store_terraform_deployment(&deployment("tf:a:", "m"))
        .await
        .unwrap();
    storage
        .store_service_instance_details(&ServiceInstanceDetails {
            id: "a".to_string(),
            service_id: "s".to_string(),
            plan_id: "p".to_string(),
            outputs: json!({"host": "db"}).as_object().cloned().unwrap(),
            ..Default::default()
        })
        .await
        .unwrap();
    storage
        .store_provision_request_details("a", json!({"name": "x"}).as_object().unwrap())
        .await
        .unwrap();
}

async fn assert_readable(storage: &Storage) {
    assert_eq!(
        storage.get_terraform_deployment("tf:a:").await.unwrap(),
        deployment("tf:a:", "m")
    );
    assert_eq!(
        storage.get_service_instance_details("a").await.unwrap().outputs["host"],
        json!("db")
    );
    assert_eq!(
        storage.get_provision_request_details("a").await.unwrap()["name"],
        json!("x")
    );
}

#[tokio::test]
async fn test_primary_switch_keeps_data_readable() {
    let pool = create_test_db().await;
    let old = setup_encryptor(&pool, true, &[password("old", true)]).await.unwrap();
    store_everything(&Storage::new(pool.clone(), old)).await;

    let new = setup_encryptor(&pool, true, &[password("old", false), password("new", true)])
        .await
        .unwrap();
    let storage = Storage::new(pool.clone(), new);
    assert_readable(&storage).await;

    // the old password is no longer needed once data has moved
    let only_new = setup_encryptor(&pool, true, &[password("new", true)]).await.unwrap();
    assert_readable(&Storage::new(pool, only_new)).await;
}

#[tokio::test]
async fn test_dropping_the_sealing_password_is_refused() {
    let pool = create_test_db().await;
    let old = setup_encryptor(&pool, true, &[password("old", true)]).await.unwrap();
    store_everything(&Storage::new(pool.clone(), old)).await;

    let err = setup_encryptor(&pool, true, &[password("new", true)])
        .await
        .err()
        .unwrap();
    assert!(matches!(err, StorageError::EncryptionSetup(_)), "{err}");

    let old = setup_encryptor(&pool, true, &[password("old", true)]).await.unwrap();
    assert_readable(&Storage::new(pool, old)).await;
}

#[tokio::test]
async fn test_enabling_and_disabling_encryption_rewrites_data() {
    let pool = create_test_db().await;
    let plain = setup_encryptor(&pool, false, &[]).await.unwrap();
    store_everything(&Storage::new(pool.clone(), plain)).await;

    let sealed = setup_encryptor(&pool, true, &[password("one", true)]).await.unwrap();
    let storage = Storage::new(pool.clone(), sealed);
    assert_readable(&storage).await;
    assert!(serde_json::from_slice::<Value>(&raw_workspace(&storage, "tf:a:").await).is_err());

    let plain = setup_encryptor(&pool, false, &[password("one", false)]).await.unwrap();
    let storage = Storage::new(pool, plain);
    assert_readable(&storage).await;
    let raw: Value = serde_json::from_slice(&raw_workspace(&storage, "tf:a:").await).unwrap();
    assert_eq!(raw["modules"][0]["name"], json!("m"));
}
