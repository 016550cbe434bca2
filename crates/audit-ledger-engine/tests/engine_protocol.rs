#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use audit_ledger_core::{
    hash_json, AccessPolicy, EntityType, EvidenceInput, InvariantCheck, InvariantName,
    InvariantViolation, ReportingAccess, RequestKey, RequestStatus, StepStatus, TraceResult,
    ValidationError,
};
use audit_ledger_engine::{
    pipeline_fn, EngineError, ExecuteRequest, ExecutionEngine, ResponseSource, RetryGuidance,
};
use audit_ledger_store_sqlite::lifecycle::{count_rows, get_committed};
use audit_ledger_store_sqlite::{Claim, NewClaim, SqliteLedgerStore, TraceFilter};
use serde_json::{json, Value};
use ulid::Ulid;

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

fn temp_db_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "audit-ledger-engine-test-{}-{}.sqlite3",
        name,
        Ulid::new()
    ))
}

fn open_store(path: &Path) -> SqliteLedgerStore {
    let store = must(SqliteLedgerStore::open(path));
    must(store.migrate());
    store
}

fn fixture_engine(name: &str) -> ExecutionEngine {
    ExecutionEngine::new(open_store(&temp_db_path(name)))
}

fn key(request_id: &str) -> RequestKey {
    must(RequestKey::new(request_id, "wf"))
}

fn rows(engine: &ExecutionEngine, entity: EntityType) -> u64 {
    must(count_rows(engine.store().connection(), entity))
}

fn traces_for(engine: &ExecutionEngine, request_id: &str) -> Vec<audit_ledger_core::ExecutionTrace> {
    must(engine.store().list_traces(&TraceFilter {
        request_id: Some(request_id.to_string()),
        ..TraceFilter::default()
    }))
}

fn expect_err<T: std::fmt::Debug>(result: Result<T, EngineError>) -> EngineError {
    match result {
        Ok(value) => panic!("expected an engine error, got {value:?}"),
        Err(err) => err,
    }
}

fn violation_name(err: &EngineError) -> Option<InvariantName> {
    err.invariant_violation().map(InvariantViolation::name)
}

fn error_type_for(engine: &ExecutionEngine, request_id: &str) -> Option<String> {
    must(engine.store().lookup(&key(request_id)))
        .and_then(|record| record.error_details)
        .map(|details| details.error_type)
}

#[test]
fn repeated_request_runs_the_pipeline_once() {
    let mut engine = fixture_engine("idempotent");
    let runs = Cell::new(0);
    let pipeline = pipeline_fn(|ctx| {
        runs.set(runs.get() + 1);
        let owner = ctx.trace_step("create_owner", |ctx| {
            ctx.domain().create_owner("u1", "Ada")
        })?;
        Ok(json!({"owner_id": owner.owner_id}))
    });
    let request = ExecuteRequest::new("r1", "wf", json!({"x": 1})).user_id("u1");

    let first = must(engine.execute_with_outcome(&request, &pipeline));
    let second = must(engine.execute_with_outcome(&request, &pipeline));

    assert_eq!(runs.get(), 1);
    assert_eq!(first.source, ResponseSource::Executed);
    assert_eq!(
        second.source,
        ResponseSource::Cached {
            payload_matches: true
        }
    );
    assert!(second.trace_id.is_none());
    assert_eq!(
        must(serde_json::to_vec(&first.response)),
        must(serde_json::to_vec(&second.response))
    );
    assert_eq!(rows(&engine, EntityType::Owner), 1);

    let record = must(engine.store().lookup(&key("r1")));
    let Some(record) = record else {
        panic!("ledger record missing");
    };
    assert_eq!(record.status, RequestStatus::Completed);
    assert_eq!(record.response, Some(first.response));
    assert_eq!(record.user_id.as_deref(), Some("u1"));
    assert!(record.expires_at.is_some());

    let traces = traces_for(&engine, "r1");
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].result, TraceResult::Success);
    assert_eq!(Some(traces[0].trace_id), first.trace_id);
    assert_eq!(traces[0].input_hash, must(hash_json(&json!({"x": 1}))));
    assert!(must(engine.store().verify_traces(None)).is_clean());
    assert!(must(engine.store().state_changes_without_traces()).is_empty());
}

#[test]
fn completed_request_ignores_divergent_payload() {
    let mut engine = fixture_engine("divergent");
    let pipeline = pipeline_fn(|ctx| {
        let x = ctx.payload()["x"].clone();
        Ok(json!({"result": x}))
    });

    let r1 = must(engine.execute(&ExecuteRequest::new("r1", "wf", json!({"x": 1})), &pipeline));
    let again = must(engine.execute_with_outcome(
        &ExecuteRequest::new("r1", "wf", json!({"x": 2})),
        &pipeline,
    ));

    assert_eq!(r1, json!({"result": 1}));
    assert_eq!(again.response, r1);
    assert_eq!(
        again.source,
        ResponseSource::Cached {
            payload_matches: false
        }
    );
    assert_eq!(traces_for(&engine, "r1").len(), 1);
}

#[test]
fn failure_at_step_two_rolls_back_domain_writes_and_keeps_the_audit() {
    let mut engine = fixture_engine("failure");
    let pipeline = pipeline_fn(|ctx| {
        ctx.trace_step("create_owner", |ctx| {
            ctx.domain().create_owner("u1", "Ada")?;
            Ok(())
        })?;
        ctx.add_evidence(EvidenceInput::new("document_text", json!({"chars": 12})))?;
        ctx.trace_step("validate", |_| -> anyhow::Result<()> { Err(anyhow!("bad input")) })?;
        ctx.trace_step("draft", |_| Ok(()))?;
        ctx.trace_step("commit", |_| Ok(()))?;
        Ok(json!({}))
    });

    let err = expect_err(engine.execute(&ExecuteRequest::new("r2", "wf", json!({})), &pipeline));
    assert!(matches!(err, EngineError::Orchestration { .. }));
    assert_eq!(err.retry_guidance(), RetryGuidance::SameRequestId);
    assert_eq!(
        err.pipeline_error().map(ToString::to_string).as_deref(),
        Some("bad input")
    );

    assert_eq!(rows(&engine, EntityType::Owner), 0);
    let record = must(engine.store().lookup(&key("r2")));
    let Some(record) = record else {
        panic!("ledger record missing");
    };
    assert_eq!(record.status, RequestStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("bad input"));
    assert_eq!(
        record.error_details.map(|details| details.error_type).as_deref(),
        Some("pipeline_error")
    );
    assert!(record.response.is_none());

    let traces = traces_for(&engine, "r2");
    assert_eq!(traces.len(), 1);
    let trace = &traces[0];
    assert_eq!(Some(trace.trace_id), err.trace_id());
    assert_eq!(trace.result, TraceResult::Failed);
    assert_eq!(trace.error.as_deref(), Some("bad input"));
    assert_eq!(trace.total_steps, 2);
    assert_eq!(trace.steps[0].status, StepStatus::Success);
    assert_eq!(trace.steps[1].status, StepStatus::Failed);
    assert_eq!(trace.steps[1].action, "validate");
    assert!(trace.output_hash.is_none());

    let evidence = must(engine.store().get_evidence(&trace.trace_id.to_string()));
    assert_eq!(evidence.map(|bundle| bundle.items.len()), Some(1));
    assert!(must(engine.store().verify_traces(Some("wf"))).is_clean());
}

#[test]
fn failed_request_can_be_retried_with_the_same_id() {
    let mut engine = fixture_engine("retry");
    let fail = Cell::new(true);
    let pipeline = pipeline_fn(|ctx| {
        ctx.trace_step("create_owner", |ctx| {
            ctx.domain().create_owner("u1", "Ada")?;
            Ok(())
        })?;
        ctx.trace_step("external_call", |_| {
            if fail.get() {
                Err(anyhow!("upstream unavailable"))
            } else {
                Ok(())
            }
        })?;
        Ok(json!({"ok": true}))
    });
    let request = ExecuteRequest::new("r3", "wf", json!({"x": 1}));

    let err = expect_err(engine.execute(&request, &pipeline));
    assert_eq!(err.retry_guidance(), RetryGuidance::SameRequestId);

    fail.set(false);
    let outcome = must(engine.execute_with_outcome(&request, &pipeline));
    assert_eq!(outcome.response, json!({"ok": true}));
    assert_eq!(outcome.source, ResponseSource::Executed);
    assert_eq!(rows(&engine, EntityType::Owner), 1);

    let traces = traces_for(&engine, "r3");
    assert_eq!(traces.len(), 2);
    assert_eq!(traces[0].result, TraceResult::Failed);
    assert_eq!(traces[1].result, TraceResult::Success);
    let numbers: Vec<u32> = traces[1].steps.iter().map(|step| step.step).collect();
    assert_eq!(numbers, vec![1, 2]);

    let record = must(engine.store().lookup(&key("r3")));
    assert_eq!(record.map(|r| r.status), Some(RequestStatus::Completed));
}

#[test]
fn steps_stay_gapless_across_nested_and_logged_steps() {
    let mut engine = fixture_engine("gapless");
    let pipeline = pipeline_fn(|ctx| {
        ctx.trace_step("outer", |ctx| {
            ctx.set_step_details(json!({"phase": "outer"}));
            ctx.trace_step("inner", |_| Ok(()))?;
            ctx.log_step("checkpoint", StepStatus::Success, Some(json!({"n": 1})))?;
            Ok(())
        })?;
        ctx.trace_step("last", |_| Ok(()))?;
        ctx.set_result_resource("plan", "p1");
        Ok(json!({"done": true}))
    });

    must(engine.execute(&ExecuteRequest::new("r4", "wf", json!({})), &pipeline));

    let traces = traces_for(&engine, "r4");
    assert_eq!(traces.len(), 1);
    let numbers: Vec<u32> = traces[0].steps.iter().map(|step| step.step).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert_eq!(traces[0].steps[0].details, Some(json!({"phase": "outer"})));
    assert!(traces[0]
        .steps
        .iter()
        .all(|step| step.status == StepStatus::Success && step.duration_ms.is_some()));
    assert!(must(engine.store().get_evidence(&traces[0].trace_id.to_string())).is_none());

    let record = must(engine.store().lookup(&key("r4")));
    let resource = record.and_then(|r| r.result_resource);
    assert_eq!(resource.map(|r| r.resource_id).as_deref(), Some("p1"));
}

#[test]
fn invalid_key_is_rejected_before_any_write() {
    let mut engine = fixture_engine("validation");
    let runs = Cell::new(0);
    let pipeline = pipeline_fn(|_| {
        runs.set(runs.get() + 1);
        Ok(Value::Null)
    });

    let long_id = "x".repeat(256);
    for (request_id, orchestrator_name) in [
        ("", "wf"),
        ("r1", ""),
        ("r1", "bad-name!"),
        (long_id.as_str(), "wf"),
    ] {
        let err = expect_err(engine.execute(
            &ExecuteRequest::new(request_id, orchestrator_name, json!({})),
            &pipeline,
        ));
        assert!(matches!(err, EngineError::Validation(_)), "{err}");
    }

    assert_eq!(runs.get(), 0);
    assert!(must(engine.store().list_ledger(None)).is_empty());
    assert!(must(engine.store().list_traces(&TraceFilter::default())).is_empty());
}

#[test]
fn in_flight_request_is_reported_as_duplicate() {
    let path = temp_db_path("in-flight");
    let mut other = open_store(&path);
    let mut engine = ExecutionEngine::new(open_store(&path));

    let held = key("r5");
    let payload = json!({});
    let hash = must(hash_json(&payload));
    let claim = must(other.claim(&NewClaim {
        key: &held,
        payload: &payload,
        payload_hash: &hash,
        user_id: None,
        ttl_hours: 24,
    }));
    assert!(matches!(claim, Claim::Claimed(_)));

    let runs = Cell::new(0);
    let pipeline = pipeline_fn(|_| {
        runs.set(runs.get() + 1);
        Ok(Value::Null)
    });
    let err = expect_err(engine.execute(&ExecuteRequest::new("r5", "wf", payload.clone()), &pipeline));
    assert!(matches!(err, EngineError::DuplicateRequest { .. }));
    assert_eq!(err.retry_guidance(), RetryGuidance::NewRequestId);
    assert_eq!(runs.get(), 0);
    assert!(traces_for(&engine, "r5").is_empty());
}

#[test]
fn pending_record_is_an_inconsistent_state() {
    let mut engine = fixture_engine("pending");
    must(engine.store().connection().execute(
        "INSERT INTO ledger_records(request_id, orchestrator_name, status, payload_json, payload_hash, created_at)
         VALUES ('r6', 'wf', 'PENDING', '{}', 'h', '2026-01-01T00:00:00Z')",
        [],
    ));

    let pipeline = pipeline_fn(|_| Ok(Value::Null));
    let err = expect_err(engine.execute(&ExecuteRequest::new("r6", "wf", json!({})), &pipeline));
    assert!(matches!(err, EngineError::InconsistentState { .. }));
    assert_eq!(err.retry_guidance(), RetryGuidance::Never);
}

#[test]
fn tracking_a_draft_milestone_fails_without_writing_progress() {
    let mut engine = fixture_engine("tracking");
    let setup = pipeline_fn(|ctx| {
        let domain = ctx.domain();
        domain.create_owner("u1", "Ada")?;
        let draft = domain.create_draft("u1", None, "plan")?;
        let milestone = domain.add_milestone(&draft.draft_id, "first")?;
        Ok(json!({"milestone_id": milestone.milestone_id}))
    });
    let created = must(engine.execute(&ExecuteRequest::new("setup", "wf", json!({})), &setup));
    let milestone_id = created["milestone_id"].as_str().unwrap_or_default().to_string();

    let track = pipeline_fn(|ctx| {
        let event = ctx.trace_step("record_progress", |ctx| {
            ctx.domain()
                .record_progress("u1", &milestone_id, "completed", None)
        })?;
        Ok(json!({"event_id": event.event_id}))
    });
    let err = expect_err(engine.execute(&ExecuteRequest::new("track", "wf", json!({})), &track));

    assert_eq!(violation_name(&err), Some(InvariantName::TrackingTargetIsCommitted));
    assert_eq!(rows(&engine, EntityType::ProgressEvent), 0);
    let record = must(engine.store().lookup(&key("track")));
    let error_type = record
        .and_then(|r| r.error_details)
        .map(|details| details.error_type);
    assert_eq!(error_type.as_deref(), Some("tracking_target_is_committed"));
}

#[test]
fn second_commit_of_a_draft_fails_and_leaves_the_first_untouched() {
    let mut engine = fixture_engine("double-commit");
    let setup = pipeline_fn(|ctx| {
        let domain = ctx.domain();
        domain.create_owner("u1", "Ada")?;
        let draft = domain.create_draft("u1", None, "plan")?;
        domain.add_milestone(&draft.draft_id, "first")?;
        Ok(json!({"draft_id": draft.draft_id}))
    });
    let created = must(engine.execute(&ExecuteRequest::new("setup", "wf", json!({})), &setup));
    let draft_id = created["draft_id"].as_str().unwrap_or_default().to_string();

    let commit = pipeline_fn(|ctx| {
        let committed = ctx.trace_step("commit", |ctx| {
            ctx.domain().commit_draft("u1", Some(&draft_id), None)
        })?;
        ctx.set_result_resource("committed", committed.committed_id.clone());
        Ok(json!({"committed_id": committed.committed_id}))
    });
    let first = must(engine.execute(&ExecuteRequest::new("commit-1", "wf", json!({})), &commit));
    let committed_id = first["committed_id"].as_str().unwrap_or_default().to_string();
    let before = must(get_committed(engine.store().connection(), &committed_id));
    assert!(before.is_some());

    let err = expect_err(engine.execute(&ExecuteRequest::new("commit-2", "wf", json!({})), &commit));
    assert_eq!(violation_name(&err), Some(InvariantName::CommittedHasPredecessor));

    let after = must(get_committed(engine.store().connection(), &committed_id));
    assert_eq!(before, after);
    assert_eq!(rows(&engine, EntityType::Committed), 1);
}

#[test]
fn reporting_pipeline_is_confined_to_its_allow_list() {
    let mut engine = fixture_engine("reporting");
    let setup = pipeline_fn(|ctx| {
        let domain = ctx.domain();
        domain.create_owner("u1", "Ada")?;
        domain.record_raw_input("u1", &json!({"text": "notes"}))?;
        let draft = domain.create_draft("u1", None, "plan")?;
        domain.add_milestone(&draft.draft_id, "first")?;
        domain.commit_draft("u1", Some(&draft.draft_id), None)?;
        Ok(Value::Null)
    });
    must(engine.execute(&ExecuteRequest::new("setup", "wf", json!({})), &setup));

    let report = pipeline_fn(|ctx| {
        let committed = ctx.trace_step("load_committed", |ctx| {
            ctx.domain().committed_predecessor("u1", None)
        })?;
        let summary = json!({"milestones": committed.milestones.len()});
        let snapshot = ctx.trace_step("snapshot", |ctx| {
            ctx.domain()
                .write_snapshot("u1", &committed.committed_id, &summary)
        })?;
        Ok(json!({"snapshot_id": snapshot.snapshot_id, "summary": summary}))
    })
    .with_policy(AccessPolicy::Reporting(ReportingAccess::analytics("weekly_report")));
    let out = must(engine.execute(&ExecuteRequest::new("report-1", "reports", json!({})), &report));
    assert_eq!(out["summary"]["milestones"], json!(1));
    assert_eq!(rows(&engine, EntityType::Snapshot), 1);

    let snooping = pipeline_fn(|ctx| {
        let inputs = ctx.domain().raw_inputs("u1")?;
        Ok(json!({"inputs": inputs.len()}))
    })
    .with_policy(AccessPolicy::Reporting(ReportingAccess::analytics("weekly_report")));
    let err = expect_err(engine.execute(&ExecuteRequest::new("report-2", "reports", json!({})), &snooping));
    assert_eq!(violation_name(&err), Some(InvariantName::ReportingIsReadOnly));

    let writing = pipeline_fn(|ctx| {
        ctx.domain().create_owner("u9", "Mallory")?;
        Ok(Value::Null)
    })
    .with_policy(AccessPolicy::Reporting(ReportingAccess::analytics("weekly_report")));
    let err = expect_err(engine.execute(&ExecuteRequest::new("report-3", "reports", json!({})), &writing));
    assert_eq!(violation_name(&err), Some(InvariantName::ReportingIsReadOnly));
    assert_eq!(rows(&engine, EntityType::Owner), 1);

    assert!(must(engine.store().state_changes_without_traces()).is_empty());
}

#[test]
fn workflow_write_gate_rejects_unlisted_entity_types() {
    let mut engine = fixture_engine("write-gate");
    let pipeline = pipeline_fn(|ctx| {
        ctx.domain().create_owner("u1", "Ada")?;
        ctx.domain().create_draft("u1", None, "plan")?;
        Ok(Value::Null)
    })
    .with_policy(AccessPolicy::workflow([EntityType::Owner]));

    let err = expect_err(engine.execute(&ExecuteRequest::new("r7", "wf", json!({})), &pipeline));
    assert_eq!(violation_name(&err), Some(InvariantName::WriteNotPermitted));
    assert_eq!(rows(&engine, EntityType::Owner), 0);
    assert_eq!(rows(&engine, EntityType::Draft), 0);
}

#[test]
fn concurrent_callers_share_one_execution() {
    let path = temp_db_path("race");
    drop(open_store(&path));
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut engine = ExecutionEngine::new(open_store(&path));
                let pipeline = pipeline_fn(|ctx| {
                    let owner = ctx.trace_step("create_owner", |ctx| {
                        ctx.domain().create_owner("u1", "Ada")
                    })?;
                    thread::sleep(Duration::from_millis(50));
                    Ok(json!({"owner_id": owner.owner_id}))
                });
                barrier.wait();
                engine
                    .execute_with_outcome(&ExecuteRequest::new("race", "wf", json!({})), &pipeline)
                    .map_err(|err| err.to_string())
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        match handle.join() {
            Ok(outcome) => outcomes.push(outcome),
            Err(_) => panic!("engine thread panicked"),
        }
    }

    let succeeded: Vec<_> = outcomes.iter().filter_map(|o| o.as_ref().ok()).collect();
    assert!(!succeeded.is_empty(), "{outcomes:?}");
    assert_eq!(
        succeeded
            .iter()
            .filter(|o| o.source == ResponseSource::Executed)
            .count(),
        1
    );
    for outcome in &succeeded {
        assert_eq!(outcome.response, json!({"owner_id": "u1"}));
    }
    for failure in outcomes.iter().filter_map(|o| o.as_ref().err()) {
        assert!(failure.contains("already being processed"), "{failure}");
    }

    let engine = ExecutionEngine::new(open_store(&path));
    assert_eq!(rows(&engine, EntityType::Owner), 1);
    assert_eq!(traces_for(&engine, "race").len(), 1);
}

#[test]
fn oversized_ttl_is_rejected_before_any_write() {
    let mut engine = fixture_engine("ttl");
    let runs = Cell::new(0);
    let pipeline = pipeline_fn(|_| {
        runs.set(runs.get() + 1);
        Ok(Value::Null)
    });

    let request = ExecuteRequest::new("r1", "wf", json!({})).ttl_hours(u32::MAX);
    let err = expect_err(engine.execute(&request, &pipeline));

    assert!(matches!(
        err,
        EngineError::Validation(ValidationError::TtlOutOfRange { .. })
    ));
    assert_eq!(runs.get(), 0);
    assert!(must(engine.store().lookup(&key("r1"))).is_none());
    assert!(traces_for(&engine, "r1").is_empty());

    let accepted = ExecuteRequest::new("r1", "wf", json!({})).ttl_hours(48);
    must(engine.execute(&accepted, &pipeline));
    assert_eq!(runs.get(), 1);
}

#[test]
fn violations_raised_through_the_checker_keep_their_names() {
    let mut engine = fixture_engine("checker");
    let single = pipeline_fn(|ctx| {
        ctx.trace_step("check_target", |ctx| {
            ctx.invariants()
                .check(&InvariantCheck::TrackingTargetIsCommitted {
                    milestone_id: "m404",
                    owner_id: "u1",
                })
                .map_err(anyhow::Error::from)
        })?;
        Ok(Value::Null)
    });
    let err = expect_err(engine.execute(&ExecuteRequest::new("c1", "wf", json!({})), &single));
    assert_eq!(violation_name(&err), Some(InvariantName::TrackingTargetIsCommitted));
    assert_eq!(
        error_type_for(&engine, "c1").as_deref(),
        Some("tracking_target_is_committed")
    );

    let batch = pipeline_fn(|ctx| {
        ctx.trace_step("check_submission", |ctx| {
            ctx.invariants().check_all(&[InvariantCheck::ScoringRequiresSubmission {
                owner_id: "u1",
                item_count: 5,
                explicit: false,
            }])?;
            Ok(())
        })?;
        Ok(Value::Null)
    });
    let err = expect_err(engine.execute(&ExecuteRequest::new("c2", "wf", json!({})), &batch));
    assert_eq!(
        violation_name(&err),
        Some(InvariantName::ScoringRequiresExplicitSubmission)
    );
    assert_eq!(
        error_type_for(&engine, "c2").as_deref(),
        Some("scoring_requires_explicit_submission")
    );
    assert!(must(engine.store().verify_traces(None)).is_clean());
}

#[test]
fn logged_step_left_in_progress_fails_the_attempt() {
    let mut engine = fixture_engine("logged-in-progress");
    let pipeline = pipeline_fn(|ctx| {
        ctx.trace_step("load", |_| Ok(()))?;
        ctx.log_step("waiting", StepStatus::InProgress, None)?;
        Ok(json!({}))
    });

    let err = expect_err(engine.execute(&ExecuteRequest::new("r1", "wf", json!({})), &pipeline));
    assert!(matches!(err, EngineError::Orchestration { .. }));
    assert_eq!(error_type_for(&engine, "r1").as_deref(), Some("validation_error"));

    let traces = traces_for(&engine, "r1");
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].result, TraceResult::Failed);
    assert_eq!(traces[0].steps.len(), 1);
    assert!(traces[0]
        .steps
        .iter()
        .all(|step| step.status != StepStatus::InProgress));
}

#[test]
fn success_that_cannot_be_committed_is_recorded_as_a_failure() {
    let mut engine = fixture_engine("commit-failure");
    let pipeline = pipeline_fn(|ctx| {
        ctx.trace_step("create_owner", |ctx| {
            ctx.domain().create_owner("u1", "Ada")
        })?;
        // A swallowed step failure makes the success trace incomplete, so
        // the success commit is refused.
        let enriched = ctx
            .trace_step("enrich", |_| -> anyhow::Result<()> {
                Err(anyhow!("enrichment service down"))
            })
            .is_ok();
        Ok(json!({"owner_id": "u1", "enriched": enriched}))
    });

    let err = expect_err(engine.execute(&ExecuteRequest::new("r1", "wf", json!({})), &pipeline));
    assert!(matches!(err, EngineError::Orchestration { .. }));
    assert_eq!(err.retry_guidance(), RetryGuidance::SameRequestId);
    assert!(err.to_string().contains("incomplete"), "{err}");

    assert_eq!(rows(&engine, EntityType::Owner), 0);
    let record = must(engine.store().lookup(&key("r1")));
    assert_eq!(record.map(|r| r.status), Some(RequestStatus::Failed));

    let traces = traces_for(&engine, "r1");
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].result, TraceResult::Failed);
    assert_eq!(Some(traces[0].trace_id), err.trace_id());
    let statuses: Vec<StepStatus> = traces[0].steps.iter().map(|step| step.status).collect();
    assert_eq!(statuses, vec![StepStatus::Success, StepStatus::Failed]);
    assert!(must(engine.store().verify_traces(None)).is_clean());
    assert!(must(engine.store().state_changes_without_traces()).is_empty());
}

#[test]
fn unknown_ledger_status_is_an_inconsistent_state() {
    let mut engine = fixture_engine("unknown-status");
    must(engine.store().connection().execute_batch(
        "PRAGMA ignore_check_constraints = ON;
         INSERT INTO ledger_records(request_id, orchestrator_name, status, payload_json, payload_hash, created_at)
         VALUES ('r7', 'wf', 'ARCHIVED', '{}', 'h', '2026-01-01T00:00:00Z');
         PRAGMA ignore_check_constraints = OFF;",
    ));

    let pipeline = pipeline_fn(|_| Ok(Value::Null));
    let err = expect_err(engine.execute(&ExecuteRequest::new("r7", "wf", json!({})), &pipeline));
    assert!(matches!(err, EngineError::InconsistentState { .. }), "{err}");
    assert_eq!(err.retry_guidance(), RetryGuidance::Never);
}
