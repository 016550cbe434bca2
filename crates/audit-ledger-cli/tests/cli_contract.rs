#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::anyhow;
use audit_ledger_core::EvidenceInput;
use audit_ledger_engine::{pipeline_fn, ExecuteRequest, ExecutionEngine};
use audit_ledger_store_sqlite::lifecycle::{insert_owner, Provenance};
use audit_ledger_store_sqlite::SqliteLedgerStore;
use jsonschema::JSONSchema;
use serde_json::{json, Value};
use ulid::Ulid;

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

fn alg_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_alg") {
        Ok(path) => PathBuf::from(path),
        Err(_) => panic!("CARGO_BIN_EXE_alg is not set; run through cargo test"),
    }
}

fn temp_db_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("audit-ledger-cli-{}-{}.sqlite3", name, Ulid::new()))
}

fn alg_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(alg_binary_path());
    command.arg("--db").arg(db_path).args(args);
    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run alg {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    match serde_json::from_slice(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "stdout was not JSON ({err}): {}",
            String::from_utf8_lossy(&output.stdout)
        ),
    }
}

fn assert_schema(schema: &Value, value: &Value) {
    let compiled = match JSONSchema::compile(schema) {
        Ok(compiled) => compiled,
        Err(err) => panic!("schema does not compile: {err}"),
    };
    let errors: Option<Vec<String>> = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|e| e.to_string()).collect());
    if let Some(errors) = errors {
        panic!("value violates schema: {:?}\n{}", errors, value);
    }
}

fn trace_schema() -> Value {
    json!({
        "type": "object",
        "required": [
            "trace_id", "request_id", "orchestrator_name", "result", "steps",
            "total_steps", "input_hash", "started_at", "completed_at", "duration_ms"
        ],
        "properties": {
            "trace_id": {"type": "string", "minLength": 26, "maxLength": 26},
            "result": {"enum": ["success", "failed"]},
            "total_steps": {"type": "integer", "minimum": 0},
            "input_hash": {"type": "string", "pattern": "^[0-9a-f]{64}$"},
            "steps": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["step", "action", "status", "started_at"],
                    "properties": {
                        "step": {"type": "integer", "minimum": 1},
                        "status": {"enum": ["in_progress", "success", "failed"]}
                    }
                }
            }
        }
    })
}

/// One completed request (`r1`) and one failed request (`r2`) under `wf`.
fn seed(db_path: &Path) {
    let store = must(SqliteLedgerStore::open(db_path));
    must(store.migrate());
    let mut engine = ExecutionEngine::new(store);

    let create = pipeline_fn(|ctx| {
        let owner = ctx.trace_step("create_owner", |ctx| {
            ctx.domain().create_owner("u1", "Ada")
        })?;
        ctx.add_evidence(EvidenceInput::new("owner", json!({"id": owner.owner_id})).source("cli-test"))?;
        ctx.set_result_resource("owner", owner.owner_id.clone());
        Ok(json!({"owner_id": owner.owner_id}))
    });
    must(engine.execute(&ExecuteRequest::new("r1", "wf", json!({"name": "Ada"})), &create));

    let broken = pipeline_fn(|ctx| {
        ctx.trace_step("load", |_| Ok(()))?;
        ctx.trace_step("validate", |_| Err(anyhow!("missing field")))
    });
    let failed = engine.execute(&ExecuteRequest::new("r2", "wf", json!({})), &broken);
    assert!(failed.is_err());
}

#[test]
fn ledger_get_reports_completed_record() {
    let db = temp_db_path("ledger-get");
    seed(&db);

    let record = stdout_json(&alg_output(
        &db,
        &["ledger", "get", "--request-id", "r1", "--orchestrator", "wf"],
    ));
    assert_eq!(record["status"], "COMPLETED");
    assert_eq!(record["response"], json!({"owner_id": "u1"}));
    assert_eq!(record["result_resource"]["resource_type"], "owner");

    let missing = alg_output(
        &db,
        &["ledger", "get", "--request-id", "nope", "--orchestrator", "wf"],
    );
    assert!(!missing.status.success());
}

#[test]
fn ledger_list_filters_by_status() {
    let db = temp_db_path("ledger-list");
    seed(&db);

    let all = stdout_json(&alg_output(&db, &["ledger", "list"]));
    assert_eq!(all.as_array().map(Vec::len), Some(2));

    let failed = stdout_json(&alg_output(&db, &["ledger", "list", "--status", "failed"]));
    let Some(failed) = failed.as_array() else {
        panic!("expected an array, got {failed}");
    };
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["request_id"], "r2");
    assert_eq!(failed[0]["error"], "missing field");
}

#[test]
fn trace_list_and_show_emit_schema_valid_traces() {
    let db = temp_db_path("trace-show");
    seed(&db);

    let traces = stdout_json(&alg_output(&db, &["trace", "list", "--result", "failed"]));
    let Some(traces) = traces.as_array() else {
        panic!("expected an array, got {traces}");
    };
    assert_eq!(traces.len(), 1);
    assert_schema(&trace_schema(), &traces[0]);
    assert_eq!(traces[0]["total_steps"], 2);
    assert_eq!(traces[0]["steps"][1]["status"], "failed");

    let listed = stdout_json(&alg_output(&db, &["trace", "list", "--request-id", "r1"]));
    let Some(trace_id) = listed[0]["trace_id"].as_str() else {
        panic!("trace id missing: {listed}");
    };

    let shown = stdout_json(&alg_output(&db, &["trace", "show", "--trace-id", trace_id]));
    assert_schema(&trace_schema(), &shown["trace"]);
    assert_eq!(shown["trace"]["result"], "success");
    assert_eq!(shown["evidence"]["trace_id"], trace_id);
    assert_eq!(shown["evidence"]["items"][0]["source"], "cli-test");
    assert_eq!(shown["evidence"]["metadata"]["total_items"], 1);

    let malformed = alg_output(&db, &["trace", "show", "--trace-id", "not-a-ulid"]);
    assert!(!malformed.status.success());
}

#[test]
fn trace_verify_passes_for_engine_written_traces() {
    let db = temp_db_path("verify");
    seed(&db);

    let report = stdout_json(&alg_output(&db, &["trace", "verify", "--strict"]));
    assert_eq!(report["checked"], 2);
    assert_eq!(report["incomplete"], json!([]));
}

#[test]
fn audit_state_changes_flags_rows_without_a_traced_request() {
    let db = temp_db_path("state-changes");
    seed(&db);

    let clean = stdout_json(&alg_output(&db, &["audit", "state-changes"]));
    assert_eq!(clean["count"], 0);

    let store = must(SqliteLedgerStore::open(&db));
    let ghost = Provenance {
        request_id: "ghost",
        orchestrator_name: "wf",
    };
    must(insert_owner(store.connection(), ghost, "u9", "Mallory"));
    drop(store);

    let flagged = stdout_json(&alg_output(&db, &["audit", "state-changes"]));
    assert_eq!(flagged["count"], 1);
    assert_eq!(flagged["rows"][0]["entity_type"], "owner");
    assert_eq!(flagged["rows"][0]["entity_id"], "u9");
}

#[test]
fn migrate_creates_an_empty_database() {
    let db = temp_db_path("migrate");
    let out = stdout_json(&alg_output(&db, &["migrate"]));
    assert_eq!(out["status"], "migrated");
    assert_eq!(out["schema_version"], 1);

    let listed = stdout_json(&alg_output(&db, &["ledger", "list"]));
    assert_eq!(listed, json!([]));
}

#[test]
fn read_commands_never_create_or_migrate_a_database() {
    let missing = temp_db_path("missing");
    let output = alg_output(&missing, &["ledger", "list"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("alg migrate"));
    assert!(!missing.exists());

    let blank = temp_db_path("blank");
    let store = must(SqliteLedgerStore::open(&blank));
    drop(store);
    let output = alg_output(&blank, &["trace", "list"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not migrated"));

    let store = must(SqliteLedgerStore::open(&blank));
    assert_eq!(must(store.schema_version()), None);
}
