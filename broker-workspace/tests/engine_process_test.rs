//! Runs the workspace against a stand-in engine script through the real
//! process executor.

use broker_workspace::{
    BinaryExecutor, DefaultExecutor, EngineExecutor, EnvironmentExecutor, ExecutionContext,
    Command, Invoker, ModuleDefinition, TerraformWorkspace, WorkspaceError,
};
use serde_json::{json, Value};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

const ENGINE_SCRIPT: &str = r#"#!/bin/sh
echo "$@" >> "$ENGINE_LOG"
case "$1" in
  apply)
    printf '{"version":4,"terraform_version":"1.1.4","outputs":{"name":{"value":"db-%s","type":"string"}}}' "$(cat instance.tf.json | grep -c brokertemplate)" > terraform.tfstate
    echo "Apply complete!"
    ;;
  destroy)
    echo "destroy refused" >&2
    exit 2
    ;;
  *)
    echo "ran $1"
    ;;
esac
"#;

const SLOW_ENGINE_SCRIPT: &str = r#"#!/bin/sh
echo "$1" >> "$ENGINE_LOG"
sleep 0.4
"#;

fn install_engine(dir: &Path) -> std::path::PathBuf {
    install_script(dir, ENGINE_SCRIPT)
}

fn install_script(dir: &Path, script: &str) -> std::path::PathBuf {
    let path = dir.join("terraform");
    fs::write(&path, script).expect("Failed to write engine script");
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("Failed to make engine script executable");
    path
}

#[test]
fn test_apply_then_failing_destroy() {
    let bin_dir = tempfile::tempdir().expect("Failed to create bin dir");
    let engine = install_engine(bin_dir.path());
    let log = bin_dir.path().join("engine.log");

    let executor: Arc<dyn EngineExecutor> = Arc::new(EnvironmentExecutor::new(
        [("ENGINE_LOG", log.to_string_lossy().into_owned())],
        BinaryExecutor::new(&engine, DefaultExecutor),
    ));
    let invoker = Invoker::new(executor, "/plugins", "1.1.4".parse().unwrap());

    let mut ws = TerraformWorkspace::new(
        ModuleDefinition::new("db", "output \"name\" { value = var.name }"),
        json!({"name": "db"}).as_object().cloned().unwrap(),
    );

    let out = invoker
        .apply(&ExecutionContext::default(), &mut ws)
        .expect("Failed to apply");
    assert_eq!(out.stdout, "Apply complete!\n");
    assert_eq!(
        Value::Object(ws.outputs("instance").unwrap()),
        json!({"name": "db-1"})
    );

    let err = invoker
        .destroy(&ExecutionContext::default(), &mut ws)
        .unwrap_err();
    match err {
        WorkspaceError::StepFailed { step, stderr, .. } => {
            assert_eq!(step, "destroy");
            assert_eq!(stderr, "destroy refused\n");
        }
        other => panic!("unexpected error: {other}"),
    }

    // State from the apply survives the failed destroy.
    assert_eq!(ws.state_version().unwrap().map(|v| v.to_string()), Some("1.1.4".to_string()));

    let calls = fs::read_to_string(&log).expect("Failed to read engine log");
    let calls: Vec<&str> = calls.lines().collect();
    assert_eq!(
        calls,
        vec![
            "init -no-color -plugin-dir=/plugins",
            "apply -auto-approve -input=false -no-color",
            "init -no-color -plugin-dir=/plugins",
            "destroy -auto-approve -no-color",
        ]
    );
}

#[test]
fn test_timeout_covers_the_whole_command_sequence() {
    let bin_dir = tempfile::tempdir().expect("Failed to create bin dir");
    let engine = install_script(bin_dir.path(), SLOW_ENGINE_SCRIPT);
    let log = bin_dir.path().join("engine.log");
    let executor = EnvironmentExecutor::new(
        [("ENGINE_LOG", log.to_string_lossy().into_owned())],
        BinaryExecutor::new(&engine, DefaultExecutor),
    );

    let mut ws = TerraformWorkspace::new(
        ModuleDefinition::new("db", "output \"name\" { value = var.name }"),
        json!({"name": "db"}).as_object().cloned().unwrap(),
    );
    let commands = [
        Command::init("/plugins"),
        Command::Plan,
        Command::Apply,
        Command::Show,
    ];

    let ctx = ExecutionContext::default().with_timeout(Duration::from_millis(600));
    let start = Instant::now();
    let err = ws.execute(&ctx, &executor, &commands).unwrap_err();

    match err {
        WorkspaceError::Timeout { step, timeout } => {
            assert_eq!(step, "plan");
            assert_eq!(timeout, Duration::from_millis(600));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(start.elapsed() < Duration::from_millis(1500));

    let calls = fs::read_to_string(&log).expect("Failed to read engine log");
    assert_eq!(calls.lines().collect::<Vec<_>>(), vec!["init", "plan"]);
}
