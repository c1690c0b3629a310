// End-to-end sync engine behavior over in-memory endpoints.

use provsync::model::{
    Direction, OperationType, Record, ResolutionStrategy, SessionStatus, SyncConfig,
};
use provsync::store::memory::MemoryStore;
use provsync::store::RecordStore;
use provsync::sync::session::SessionDb;
use provsync::sync::{SyncEndpoint, SyncEngine};
use provsync::tracker::{ChangeTracker, FieldDiff};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    central_store: Arc<MemoryStore>,
    client_store: Arc<MemoryStore>,
    central_tracker: Arc<ChangeTracker>,
    client_tracker: Arc<ChangeTracker>,
    engine: Arc<SyncEngine>,
}

fn harness_with(client_store: MemoryStore, max_duration: Duration) -> Harness {
    let central_store = Arc::new(MemoryStore::new());
    let client_store = Arc::new(client_store);
    let central_tracker = Arc::new(ChangeTracker::open_in_memory().unwrap());
    let client_tracker = Arc::new(ChangeTracker::open_in_memory().unwrap());
    let engine = Arc::new(SyncEngine::new(
        SyncEndpoint::new(central_store.clone(), central_tracker.clone()),
        SyncEndpoint::new(client_store.clone(), client_tracker.clone()),
        Arc::new(SessionDb::open_in_memory().unwrap()),
        max_duration,
    ));
    Harness {
        central_store,
        client_store,
        central_tracker,
        client_tracker,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(MemoryStore::new(), Duration::from_secs(60))
}

/// Write a field on one side and log the change, the way the CRUD layer
/// would.
fn mutate(
    store: &MemoryStore,
    tracker: &ChangeTracker,
    tenant: &str,
    table: &str,
    id: &str,
    field: &str,
    value: Value,
    version: u64,
) {
    let mut record = store
        .get(tenant, table, id)
        .unwrap()
        .unwrap_or_else(|| Record::new(id, version));
    record.fields.insert(field.to_string(), value.clone());
    record.version = version;
    record.updated_at = chrono::Utc::now();
    store.put(tenant, table, record).unwrap();
    tracker
        .record_change(tenant, table, id, &[FieldDiff::new(field, value)], version)
        .unwrap();
}

fn config(
    operation_type: OperationType,
    strategy: ResolutionStrategy,
) -> SyncConfig {
    SyncConfig {
        operation_type,
        direction: Direction::Bidirectional,
        conflict_resolution_strategy: strategy,
    }
}

#[test]
fn test_insert_flows_to_client() {
    let h = harness();
    mutate(
        &h.central_store,
        &h.central_tracker,
        "acme",
        "personas",
        "p1",
        "email",
        json!("ana@acme.com"),
        1,
    );

    let session = h
        .engine
        .run_sync(
            "acme",
            config(OperationType::Incremental, ResolutionStrategy::ManualReview),
        )
        .unwrap();
    assert_eq!(session.status, SessionStatus::Completed);

    let replicated = h
        .client_store
        .get("acme", "personas", "p1")
        .unwrap()
        .unwrap();
    assert_eq!(replicated.fields["email"], json!("ana@acme.com"));
}

// The concrete scenario: one record changed on both sides on `email`
// since the checkpoint, client change later, timestamp strategy. Exactly
// one conflict record, resolved with the timestamp strategy, and both
// sides converge on the client's value.
#[test]
fn test_timestamp_conflict_client_later_wins() {
    let h = harness();
    mutate(
        &h.central_store,
        &h.central_tracker,
        "acme",
        "personas",
        "p1",
        "email",
        json!("central@acme.com"),
        2,
    );
    // Ensure the client's change carries the later timestamp
    std::thread::sleep(Duration::from_millis(10));
    mutate(
        &h.client_store,
        &h.client_tracker,
        "acme",
        "personas",
        "p1",
        "email",
        json!("client@acme.com"),
        2,
    );

    let session = h
        .engine
        .run_sync(
            "acme",
            config(OperationType::Incremental, ResolutionStrategy::Timestamp),
        )
        .unwrap();
    assert_eq!(session.status, SessionStatus::Completed);

    let status = h.engine.get_sync_status("acme").unwrap();
    assert_eq!(status.conflicts.len(), 1);
    let conflict = &status.conflicts[0];
    assert!(conflict.resolved);
    assert_eq!(conflict.strategy_applied, Some(ResolutionStrategy::Timestamp));
    assert_eq!(conflict.field_name, "email");

    for store in [&h.central_store, &h.client_store] {
        let record = store.get("acme", "personas", "p1").unwrap().unwrap();
        assert_eq!(record.fields["email"], json!("client@acme.com"));
    }
}

// Idempotence: a second full sync with no intervening mutations produces
// zero new conflicts and leaves checkpoints unchanged.
#[test]
fn test_full_sync_is_idempotent() {
    let h = harness();
    mutate(
        &h.central_store,
        &h.central_tracker,
        "acme",
        "personas",
        "p1",
        "name",
        json!("Ana"),
        1,
    );
    mutate(
        &h.central_store,
        &h.central_tracker,
        "acme",
        "workflows",
        "w1",
        "name",
        json!("onboarding"),
        2,
    );

    let first = h
        .engine
        .run_sync(
            "acme",
            config(OperationType::Full, ResolutionStrategy::CentralWins),
        )
        .unwrap();
    assert_eq!(first.status, SessionStatus::Completed);

    let personas_cp = h
        .central_tracker
        .checkpoint_version("acme", "personas")
        .unwrap();
    let workflows_cp = h
        .central_tracker
        .checkpoint_version("acme", "workflows")
        .unwrap();
    assert!(personas_cp > 0);

    let second = h
        .engine
        .run_sync(
            "acme",
            config(OperationType::Full, ResolutionStrategy::CentralWins),
        )
        .unwrap();
    assert_eq!(second.status, SessionStatus::Completed);

    let status = h.engine.get_sync_status("acme").unwrap();
    assert!(status.conflicts.is_empty());
    assert_eq!(
        h.central_tracker
            .checkpoint_version("acme", "personas")
            .unwrap(),
        personas_cp
    );
    assert_eq!(
        h.central_tracker
            .checkpoint_version("acme", "workflows")
            .unwrap(),
        workflows_cp
    );
}

// Partial failure accounting: 100 inserts where 5 fail validation yields
// success_count=95, error_count=5, and the session still completes.
#[test]
fn test_partial_failure_accounting() {
    let client = MemoryStore::new().with_validator(|record| {
        if record.fields.get("valid") == Some(&json!(false)) {
            Err("failed validation".to_string())
        } else {
            Ok(())
        }
    });
    let h = harness_with(client, Duration::from_secs(60));

    for i in 0..100u64 {
        let valid = i % 20 != 0; // 5 of 100 invalid
        mutate(
            &h.central_store,
            &h.central_tracker,
            "acme",
            "personas",
            &format!("p{:03}", i),
            "valid",
            json!(valid),
            i + 1,
        );
    }

    let session = h
        .engine
        .run_sync(
            "acme",
            config(OperationType::Incremental, ResolutionStrategy::ManualReview),
        )
        .unwrap();
    assert_eq!(session.status, SessionStatus::Completed);

    let status = h.engine.get_sync_status("acme").unwrap();
    let insert_item = status
        .sync_items
        .iter()
        .find(|i| i.table_name == "personas")
        .unwrap();
    assert_eq!(insert_item.records_count, 100);
    assert_eq!(insert_item.success_count, 95);
    assert_eq!(insert_item.error_count, 5);
}

// Serialization: while a session is active, a second start for the same
// tenant is rejected with AlreadyRunning; other tenants are unaffected.
#[test]
fn test_concurrent_start_yields_one_running_session() {
    // Slow client writes keep the first session active long enough
    let client = MemoryStore::new().with_validator(|_| {
        std::thread::sleep(Duration::from_millis(5));
        Ok(())
    });
    let h = harness_with(client, Duration::from_secs(60));

    for i in 0..60u64 {
        mutate(
            &h.central_store,
            &h.central_tracker,
            "acme",
            "personas",
            &format!("p{}", i),
            "n",
            json!(i),
            i + 1,
        );
    }

    let cfg = config(OperationType::Incremental, ResolutionStrategy::ManualReview);
    let first = h.engine.clone().start_sync("acme", cfg).unwrap();
    assert_eq!(first.status, SessionStatus::Running);

    let err = h.engine.clone().start_sync("acme", cfg).unwrap_err();
    assert!(matches!(
        err,
        provsync::EngineError::AlreadyRunning { .. }
    ));

    // A different tenant is not serialized behind acme
    h.engine.run_sync("globex", cfg).unwrap();

    // Wait for the first session to finish; exactly one acme session ran
    loop {
        let status = h.engine.get_sync_status("acme").unwrap();
        if status.status.is_terminal() {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(h.engine.sync_history("acme").unwrap().len(), 1);
}

// Manual review: the conflict stays unresolved, the checkpoint is held
// back, rerunning does not duplicate the queue, and operator resolution
// unblocks the table.
#[test]
fn test_manual_review_holds_checkpoint_until_resolved() {
    let h = harness();
    mutate(
        &h.central_store,
        &h.central_tracker,
        "acme",
        "personas",
        "p1",
        "email",
        json!("central@acme.com"),
        3,
    );
    mutate(
        &h.client_store,
        &h.client_tracker,
        "acme",
        "personas",
        "p1",
        "email",
        json!("client@acme.com"),
        3,
    );

    let cfg = config(OperationType::Incremental, ResolutionStrategy::ManualReview);
    h.engine.run_sync("acme", cfg).unwrap();

    let conflicts = h.engine.pending_conflicts("acme").unwrap();
    assert_eq!(conflicts.len(), 1);
    assert!(!conflicts[0].resolved);
    assert_eq!(
        h.central_tracker
            .checkpoint_version("acme", "personas")
            .unwrap(),
        0,
        "checkpoint must be held back while a conflict awaits review"
    );

    // Re-running surfaces the same divergence without duplicating it
    h.engine.run_sync("acme", cfg).unwrap();
    assert_eq!(h.engine.pending_conflicts("acme").unwrap().len(), 1);

    // Operator picks a value; both sides converge
    let resolved = h
        .engine
        .resolve_conflict(conflicts[0].id, json!("ana@acme.com"))
        .unwrap();
    assert!(resolved.resolved);
    for store in [&h.central_store, &h.client_store] {
        let record = store.get("acme", "personas", "p1").unwrap().unwrap();
        assert_eq!(record.fields["email"], json!("ana@acme.com"));
    }

    // With the conflict resolved and values converged, the next run
    // advances the checkpoint.
    h.engine.run_sync("acme", cfg).unwrap();
    assert!(
        h.central_tracker
            .checkpoint_version("acme", "personas")
            .unwrap()
            > 0
    );
    assert!(h.engine.pending_conflicts("acme").unwrap().is_empty());
}

// Infrastructure failure aborts the session with checkpoints untouched;
// the retry succeeds once storage is back.
#[test]
fn test_infra_failure_aborts_and_is_retryable() {
    let h = harness();
    mutate(
        &h.central_store,
        &h.central_tracker,
        "acme",
        "personas",
        "p1",
        "name",
        json!("Ana"),
        1,
    );

    h.client_store.set_unreachable(true);
    let session = h
        .engine
        .run_sync(
            "acme",
            config(OperationType::Incremental, ResolutionStrategy::ManualReview),
        )
        .unwrap();
    assert_eq!(session.status, SessionStatus::Error);
    assert!(session.error_message.is_some());
    assert_eq!(
        h.central_tracker
            .checkpoint_version("acme", "personas")
            .unwrap(),
        0
    );

    h.client_store.set_unreachable(false);
    let retry = h
        .engine
        .run_sync(
            "acme",
            config(OperationType::Incremental, ResolutionStrategy::ManualReview),
        )
        .unwrap();
    assert_eq!(retry.status, SessionStatus::Completed);
    assert!(h
        .client_store
        .get("acme", "personas", "p1")
        .unwrap()
        .is_some());
}

// A session exceeding the configured limit is forced to error, leaving
// checkpoints at their last committed values.
#[test]
fn test_timeout_forces_error_and_keeps_checkpoints() {
    let client = MemoryStore::new().with_validator(|_| {
        std::thread::sleep(Duration::from_millis(20));
        Ok(())
    });
    let h = harness_with(client, Duration::from_millis(80));

    for i in 0..50u64 {
        mutate(
            &h.central_store,
            &h.central_tracker,
            "acme",
            "personas",
            &format!("p{}", i),
            "n",
            json!(i),
            i + 1,
        );
    }

    let session = h
        .engine
        .run_sync(
            "acme",
            config(OperationType::Incremental, ResolutionStrategy::ManualReview),
        )
        .unwrap();
    assert_eq!(session.status, SessionStatus::Error);
    assert_eq!(
        h.central_tracker
            .checkpoint_version("acme", "personas")
            .unwrap(),
        0
    );
}

// stop_sync pauses a running session, retaining partial counts; terminal
// state is sticky for pollers.
#[test]
fn test_stop_pauses_with_partial_counts() {
    let client = MemoryStore::new().with_validator(|_| {
        std::thread::sleep(Duration::from_millis(10));
        Ok(())
    });
    let h = harness_with(client, Duration::from_secs(60));

    for i in 0..80u64 {
        mutate(
            &h.central_store,
            &h.central_tracker,
            "acme",
            "personas",
            &format!("p{}", i),
            "n",
            json!(i),
            i + 1,
        );
    }

    let cfg = config(OperationType::Incremental, ResolutionStrategy::ManualReview);
    h.engine.clone().start_sync("acme", cfg).unwrap();
    std::thread::sleep(Duration::from_millis(60));
    h.engine.stop_sync("acme").unwrap();

    loop {
        let status = h.engine.get_sync_status("acme").unwrap();
        if status.status == SessionStatus::Paused {
            // Partial item counts are retained, not rolled back
            if let Some(item) = status.sync_items.first() {
                assert!(item.records_count < 80);
                assert!(item.success_count <= item.records_count);
            }
            break;
        }
        assert_ne!(status.status, SessionStatus::Completed);
        std::thread::sleep(Duration::from_millis(20));
    }
}

// force_sync replaces a paused/active session with a fresh full sync.
#[test]
fn test_force_sync_replaces_active_session() {
    let client = MemoryStore::new().with_validator(|_| {
        std::thread::sleep(Duration::from_millis(10));
        Ok(())
    });
    let h = harness_with(client, Duration::from_secs(60));

    for i in 0..60u64 {
        mutate(
            &h.central_store,
            &h.central_tracker,
            "acme",
            "personas",
            &format!("p{}", i),
            "n",
            json!(i),
            i + 1,
        );
    }

    let cfg = config(OperationType::Incremental, ResolutionStrategy::ManualReview);
    h.engine.clone().start_sync("acme", cfg).unwrap();
    std::thread::sleep(Duration::from_millis(30));

    let forced = h.engine.clone().force_sync("acme").unwrap();
    assert_eq!(forced.operation_type, OperationType::Full);

    loop {
        let status = h.engine.get_sync_status("acme").unwrap();
        if status.status.is_terminal() {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    let history = h.engine.sync_history("acme").unwrap();
    assert_eq!(history.len(), 2);
    // Newest first: the forced full sync, then the paused original
    assert_eq!(history[0].id, forced.id);
    assert_eq!(history[1].status, SessionStatus::Paused);
}

// One-way directions ignore changes from the non-pushing side.
#[test]
fn test_central_to_client_ignores_client_changes() {
    let h = harness();
    mutate(
        &h.client_store,
        &h.client_tracker,
        "acme",
        "personas",
        "p1",
        "name",
        json!("client only"),
        1,
    );

    let session = h
        .engine
        .run_sync(
            "acme",
            SyncConfig {
                operation_type: OperationType::Incremental,
                direction: Direction::CentralToClient,
                conflict_resolution_strategy: ResolutionStrategy::ManualReview,
            },
        )
        .unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(h
        .central_store
        .get("acme", "personas", "p1")
        .unwrap()
        .is_none());
}
