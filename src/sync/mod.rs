// Sync engine: orchestrates per-tenant sync sessions.
//
// Tables fan out across the rayon pool; records within a table apply
// sequentially so item accounting stays race-free. All session state is
// durable in the session database and read back by pollers.

pub mod conflict;
pub mod diff;
pub mod session;

use crate::error::{EngineError, Result};
use crate::model::{
    ConflictRecord, Direction, OperationType, RecordOperation, SessionStatus, SyncConfig,
    SyncSession, SyncStatus,
};
use crate::store::RecordStore;
use crate::tracker::ChangeTracker;
use chrono::Utc;
use diff::{ChangeIndex, PlannedAction, Side, TablePlan};
use rayon::prelude::*;
use serde_json::Value;
use session::SessionDb;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub use conflict::resolve;

/// One side of a sync: a record store plus its change log.
#[derive(Clone)]
pub struct SyncEndpoint {
    pub store: Arc<dyn RecordStore>,
    pub tracker: Arc<ChangeTracker>,
}

impl SyncEndpoint {
    pub fn new(store: Arc<dyn RecordStore>, tracker: Arc<ChangeTracker>) -> Self {
        Self { store, tracker }
    }
}

struct ActiveHandle {
    session_id: Uuid,
    cancel: Arc<AtomicBool>,
}

/// Per-tenant sync orchestrator over a central and a client endpoint.
pub struct SyncEngine {
    central: SyncEndpoint,
    client: SyncEndpoint,
    sessions: Arc<SessionDb>,
    active: Mutex<HashMap<String, ActiveHandle>>,
    max_duration: Duration,
}

/// Per-operation accounting for one table.
#[derive(Default, Clone, Copy)]
struct Counts {
    records: u64,
    success: u64,
    error: u64,
}

struct TableOutcome {
    table: String,
    unresolved_conflicts: usize,
    central_target_version: u64,
    client_target_version: u64,
}

impl SyncEngine {
    pub fn new(
        central: SyncEndpoint,
        client: SyncEndpoint,
        sessions: Arc<SessionDb>,
        max_duration: Duration,
    ) -> Self {
        Self {
            central,
            client,
            sessions,
            active: Mutex::new(HashMap::new()),
            max_duration,
        }
    }

    /// Start a sync session in the background.
    ///
    /// Exactly one session per tenant may be active; a second start for
    /// the same tenant fails with `AlreadyRunning` while other tenants
    /// are unaffected.
    pub fn start_sync(self: Arc<Self>, tenant: &str, config: SyncConfig) -> Result<SyncSession> {
        let (session, cancel) = self.claim(tenant, config)?;
        let background = session.clone();
        std::thread::spawn(move || {
            self.run_claimed(background, config, cancel);
        });
        Ok(session)
    }

    /// Run a sync session to completion on the calling thread.
    ///
    /// Same claim semantics as [`start_sync`](Self::start_sync); returns
    /// the final session state.
    pub fn run_sync(&self, tenant: &str, config: SyncConfig) -> Result<SyncSession> {
        let (session, cancel) = self.claim(tenant, config)?;
        let id = session.id;
        self.run_claimed(session, config, cancel);
        self.sessions
            .get_session(id)?
            .ok_or_else(|| EngineError::SessionNotFound {
                tenant: tenant.to_string(),
            })
    }

    /// Current status surface for the dashboard. Idle when the tenant has
    /// never synced; otherwise the latest session with its items and
    /// conflicts, terminal states included.
    pub fn get_sync_status(&self, tenant: &str) -> Result<SyncStatus> {
        let session = match self.sessions.latest_session(tenant)? {
            Some(session) => session,
            None => return Ok(SyncStatus::idle()),
        };
        Ok(SyncStatus {
            status: session.status,
            progress: session.progress,
            sync_items: self.sessions.items_for_session(session.id)?,
            conflicts: self.sessions.conflicts_for_session(session.id)?,
        })
    }

    /// Past sessions for a tenant, newest first.
    pub fn sync_history(&self, tenant: &str) -> Result<Vec<SyncSession>> {
        self.sessions.sessions_for_tenant(tenant)
    }

    /// Unresolved conflicts awaiting operator action, oldest first.
    pub fn pending_conflicts(&self, tenant: &str) -> Result<Vec<ConflictRecord>> {
        self.sessions.unresolved_conflicts(tenant)
    }

    /// Request a running session to pause. Partially-applied item counts
    /// are retained, not rolled back. No-op when nothing is running.
    pub fn stop_sync(&self, tenant: &str) -> Result<()> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = active.get(tenant) {
            tracing::info!("Stopping sync session {} for {}", handle.session_id, tenant);
            handle.cancel.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Stop any active session, then start a fresh full sync, bypassing
    /// the already-running guard.
    pub fn force_sync(self: Arc<Self>, tenant: &str) -> Result<SyncSession> {
        self.stop_sync(tenant)?;
        // Wait for the cancelled session to release the tenant slot.
        let wait_deadline = std::time::Instant::now() + self.max_duration;
        loop {
            {
                let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
                if !active.contains_key(tenant) {
                    break;
                }
            }
            if std::time::Instant::now() > wait_deadline {
                return Err(EngineError::AlreadyRunning {
                    tenant: tenant.to_string(),
                });
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        let config = SyncConfig {
            operation_type: OperationType::Full,
            ..SyncConfig::default()
        };
        self.start_sync(tenant, config)
    }

    /// Explicit operator resolution of a `manual_review` conflict: write
    /// the chosen value to both sides and mark the record resolved.
    pub fn resolve_conflict(&self, conflict_id: Uuid, chosen_value: Value) -> Result<ConflictRecord> {
        let conflict = self
            .sessions
            .get_conflict(conflict_id)?
            .ok_or_else(|| EngineError::ConflictNotFound {
                id: conflict_id.to_string(),
            })?;
        if conflict.resolved {
            return Err(EngineError::ConflictAlreadyResolved {
                id: conflict_id.to_string(),
            });
        }
        let session = self
            .sessions
            .get_session(conflict.session_id)?
            .ok_or_else(|| EngineError::SessionNotFound {
                tenant: "unknown".to_string(),
            })?;

        self.apply_field(
            Side::Central,
            &session.tenant_id,
            &conflict.table_name,
            &conflict.record_id,
            &conflict.field_name,
            chosen_value.clone(),
        )?;
        self.apply_field(
            Side::Client,
            &session.tenant_id,
            &conflict.table_name,
            &conflict.record_id,
            &conflict.field_name,
            chosen_value,
        )?;

        self.sessions
            .mark_conflict_resolved(conflict_id, crate::model::ResolutionStrategy::ManualReview)?;
        self.sessions
            .get_conflict(conflict_id)?
            .ok_or_else(|| EngineError::ConflictNotFound {
                id: conflict_id.to_string(),
            })
    }

    /// Drop finished sessions older than `older_than`; conflict rows are
    /// kept as the audit trail.
    pub fn purge_finished_sessions(&self, older_than: chrono::Duration) -> Result<usize> {
        self.sessions.purge_finished_before(Utc::now() - older_than)
    }

    fn claim(&self, tenant: &str, config: SyncConfig) -> Result<(SyncSession, Arc<AtomicBool>)> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.contains_key(tenant) {
            return Err(EngineError::AlreadyRunning {
                tenant: tenant.to_string(),
            });
        }

        let session = SyncSession {
            id: Uuid::new_v4(),
            tenant_id: tenant.to_string(),
            operation_type: config.operation_type,
            direction: config.direction,
            status: SessionStatus::Running,
            progress: 0,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        };
        self.sessions.insert_session(&session)?;

        let cancel = Arc::new(AtomicBool::new(false));
        active.insert(
            tenant.to_string(),
            ActiveHandle {
                session_id: session.id,
                cancel: Arc::clone(&cancel),
            },
        );
        tracing::info!(
            "Started {} {} sync session {} for tenant {}",
            config.operation_type.as_str(),
            config.direction.as_str(),
            session.id,
            tenant
        );
        Ok((session, cancel))
    }

    fn release(&self, tenant: &str) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(tenant);
    }

    fn run_claimed(&self, session: SyncSession, config: SyncConfig, cancel: Arc<AtomicBool>) {
        let outcome = self.execute(&session, config, &cancel);

        let finalize = match outcome {
            Ok(table_outcomes) => {
                if cancel.load(Ordering::SeqCst) {
                    tracing::info!("Sync session {} paused", session.id);
                    self.sessions
                        .set_status(session.id, SessionStatus::Paused, None, None)
                } else {
                    // Checkpoints advance only now, after every table has
                    // completed, and only for tables without unresolved
                    // conflicts; held-back tables re-surface the same
                    // divergence on the next run instead of skipping it.
                    let result = self.advance_checkpoints(
                        &session.tenant_id,
                        config.direction,
                        &table_outcomes,
                    );
                    match result {
                        Ok(()) => {
                            tracing::info!("Sync session {} completed", session.id);
                            self.sessions.set_status(
                                session.id,
                                SessionStatus::Completed,
                                Some(100),
                                None,
                            )
                        }
                        Err(e) => self.sessions.set_status(
                            session.id,
                            SessionStatus::Error,
                            None,
                            Some(&e.to_string()),
                        ),
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Sync session {} aborted: {}", session.id, e);
                self.sessions
                    .set_status(session.id, SessionStatus::Error, None, Some(&e.to_string()))
            }
        };
        if let Err(e) = finalize {
            tracing::error!("Failed to persist final session state: {}", e);
        }
        self.release(&session.tenant_id);
    }

    fn advance_checkpoints(
        &self,
        tenant: &str,
        direction: Direction,
        outcomes: &[TableOutcome],
    ) -> Result<()> {
        for outcome in outcomes {
            if outcome.unresolved_conflicts > 0 {
                tracing::debug!(
                    "Holding checkpoint for {}/{} ({} unresolved conflict(s))",
                    tenant,
                    outcome.table,
                    outcome.unresolved_conflicts
                );
                continue;
            }
            // Only the sides whose changes actually flowed are consumed; a
            // one-way sync leaves the ignored side's pending changes for a
            // later bidirectional run.
            if direction.pushes_central() && outcome.central_target_version > 0 {
                self.central.tracker.advance_checkpoint(
                    tenant,
                    &outcome.table,
                    outcome.central_target_version,
                )?;
            }
            if direction.pushes_client() && outcome.client_target_version > 0 {
                self.client.tracker.advance_checkpoint(
                    tenant,
                    &outcome.table,
                    outcome.client_target_version,
                )?;
            }
        }
        Ok(())
    }

    fn execute(
        &self,
        session: &SyncSession,
        config: SyncConfig,
        cancel: &Arc<AtomicBool>,
    ) -> Result<Vec<TableOutcome>> {
        let tenant = &session.tenant_id;
        let full = config.operation_type == OperationType::Full;

        let mut tables: BTreeSet<String> = BTreeSet::new();
        if full {
            tables.extend(self.central.store.tables(tenant)?);
            tables.extend(self.client.store.tables(tenant)?);
        }
        tables.extend(self.central.tracker.changed_tables(tenant)?);
        tables.extend(self.client.tracker.changed_tables(tenant)?);
        let tables: Vec<String> = tables.into_iter().collect();

        if tables.is_empty() {
            return Ok(Vec::new());
        }

        let deadline = std::time::Instant::now() + self.max_duration;
        let total = tables.len();
        let done = AtomicUsize::new(0);

        // No cross-table ordering dependency; fan out and collect.
        let results: Vec<Result<TableOutcome>> = tables
            .par_iter()
            .map(|table| {
                let outcome =
                    self.process_table(session, config, table, cancel, deadline)?;
                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                let progress = ((finished * 100 / total) as u8).min(99);
                self.sessions.set_progress(session.id, progress)?;
                Ok(outcome)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(results.len());
        for result in results {
            outcomes.push(result?);
        }
        Ok(outcomes)
    }

    fn process_table(
        &self,
        session: &SyncSession,
        config: SyncConfig,
        table: &str,
        cancel: &Arc<AtomicBool>,
        deadline: std::time::Instant,
    ) -> Result<TableOutcome> {
        let tenant = &session.tenant_id;
        let full = config.operation_type == OperationType::Full;

        let central_cp = self.central.tracker.checkpoint_version(tenant, table)?;
        let client_cp = self.client.tracker.checkpoint_version(tenant, table)?;
        let central_pending =
            ChangeIndex::build(self.central.tracker.pending_since(tenant, table, central_cp)?);
        let client_pending =
            ChangeIndex::build(self.client.tracker.pending_since(tenant, table, client_cp)?);

        if !full && central_pending.is_empty() && client_pending.is_empty() {
            return Ok(TableOutcome {
                table: table.to_string(),
                unresolved_conflicts: 0,
                central_target_version: 0,
                client_target_version: 0,
            });
        }

        let central_records: BTreeMap<String, crate::model::Record> = self
            .central
            .store
            .list(tenant, table, None)?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let client_records: BTreeMap<String, crate::model::Record> = self
            .client
            .store
            .list(tenant, table, None)?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let plan: TablePlan = diff::classify_table(
            config.direction,
            full,
            &central_records,
            &client_records,
            &central_pending,
            &client_pending,
        );

        tracing::debug!(
            "Table {}/{}: {} action(s), {} conflict(s)",
            tenant,
            table,
            plan.actions.len(),
            plan.conflicts.len()
        );

        let mut counts: HashMap<RecordOperation, Counts> = HashMap::new();

        for action in &plan.actions {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            if std::time::Instant::now() > deadline {
                return Err(EngineError::SessionTimeout {
                    tenant: tenant.to_string(),
                    limit_secs: self.max_duration.as_secs(),
                });
            }
            let entry = counts.entry(action.operation).or_default();
            entry.records += 1;
            match self.apply_action(tenant, table, action) {
                Ok(()) => entry.success += 1,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        "Record {}/{}/{} failed: {}",
                        tenant,
                        table,
                        action.record_id,
                        e
                    );
                    entry.error += 1;
                }
            }
        }

        let mut unresolved = 0usize;
        for field_conflict in &plan.conflicts {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            if std::time::Instant::now() > deadline {
                return Err(EngineError::SessionTimeout {
                    tenant: tenant.to_string(),
                    limit_secs: self.max_duration.as_secs(),
                });
            }

            let entry = counts.entry(RecordOperation::Update).or_default();
            entry.records += 1;

            // A divergence already queued for manual review stays a single
            // conflict row; re-detecting it must not duplicate the queue.
            if self.sessions.has_unresolved_conflict(
                tenant,
                table,
                &field_conflict.record_id,
                &field_conflict.field_name,
            )? {
                unresolved += 1;
                continue;
            }

            let mut record = ConflictRecord {
                id: Uuid::new_v4(),
                session_id: session.id,
                table_name: table.to_string(),
                record_id: field_conflict.record_id.clone(),
                field_name: field_conflict.field_name.clone(),
                local_value: field_conflict.local_value.clone(),
                remote_value: field_conflict.remote_value.clone(),
                local_modified_at: field_conflict.local_modified_at,
                remote_modified_at: field_conflict.remote_modified_at,
                resolved: false,
                strategy_applied: None,
                resolved_at: None,
            };

            let resolution: conflict::Resolution =
                conflict::resolve(&record, config.conflict_resolution_strategy);
            if resolution.resolved {
                let value = resolution.resolved_value.clone().unwrap_or(Value::Null);
                match self.apply_resolved(config, tenant, table, &record, value) {
                    Ok(()) => {
                        entry.success += 1;
                        record.resolved = true;
                        record.strategy_applied = Some(resolution.strategy_applied);
                        record.resolved_at = Some(Utc::now());
                    }
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => {
                        tracing::warn!(
                            "Applying resolved conflict on {}/{}/{} failed: {}",
                            tenant,
                            table,
                            record.record_id,
                            e
                        );
                        entry.error += 1;
                        unresolved += 1;
                    }
                }
            } else {
                unresolved += 1;
            }
            self.sessions.insert_conflict(&record)?;
        }

        for (operation, c) in counts {
            if c.records == 0 {
                continue;
            }
            self.sessions.insert_item(&crate::model::SyncItem {
                session_id: session.id,
                table_name: table.to_string(),
                operation,
                records_count: c.records,
                success_count: c.success,
                error_count: c.error,
            })?;
        }

        Ok(TableOutcome {
            table: table.to_string(),
            unresolved_conflicts: unresolved,
            central_target_version: central_pending.max_version(),
            client_target_version: client_pending.max_version(),
        })
    }

    fn apply_action(&self, tenant: &str, table: &str, action: &PlannedAction) -> Result<()> {
        let store = match action.target {
            Side::Central => &self.central.store,
            Side::Client => &self.client.store,
        };
        match (&action.operation, &action.record) {
            (RecordOperation::Delete, _) => store.delete(tenant, table, &action.record_id),
            (_, Some(record)) => store.put(tenant, table, record.clone()),
            // An insert/update without a record is a classifier bug; skip.
            (_, None) => Ok(()),
        }
    }

    fn apply_resolved(
        &self,
        config: SyncConfig,
        tenant: &str,
        table: &str,
        record: &ConflictRecord,
        value: Value,
    ) -> Result<()> {
        if config.direction.pushes_central() {
            self.apply_field(
                Side::Client,
                tenant,
                table,
                &record.record_id,
                &record.field_name,
                value.clone(),
            )?;
        }
        if config.direction.pushes_client() {
            self.apply_field(
                Side::Central,
                tenant,
                table,
                &record.record_id,
                &record.field_name,
                value,
            )?;
        }
        Ok(())
    }

    fn apply_field(
        &self,
        side: Side,
        tenant: &str,
        table: &str,
        record_id: &str,
        field: &str,
        value: Value,
    ) -> Result<()> {
        let store = match side {
            Side::Central => &self.central.store,
            Side::Client => &self.client.store,
        };
        let mut record = store
            .get(tenant, table, record_id)?
            .unwrap_or_else(|| crate::model::Record::new(record_id, 1));
        if record.fields.get(field) == Some(&value) {
            return Ok(());
        }
        record.fields.insert(field.to_string(), value);
        record.updated_at = Utc::now();
        store.put(tenant, table, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn engine() -> Arc<SyncEngine> {
        let central = SyncEndpoint::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ChangeTracker::open_in_memory().unwrap()),
        );
        let client = SyncEndpoint::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ChangeTracker::open_in_memory().unwrap()),
        );
        Arc::new(SyncEngine::new(
            central,
            client,
            Arc::new(SessionDb::open_in_memory().unwrap()),
            Duration::from_secs(60),
        ))
    }

    #[test]
    fn test_status_idle_before_first_sync() {
        let engine = engine();
        let status = engine.get_sync_status("acme").unwrap();
        assert_eq!(status.status, SessionStatus::Idle);
        assert_eq!(status.progress, 0);
        assert!(status.sync_items.is_empty());
    }

    #[test]
    fn test_empty_sync_completes() {
        let engine = engine();
        let session = engine.run_sync("acme", SyncConfig::default()).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.progress, 100);
        assert!(session.completed_at.is_some());
    }

    #[test]
    fn test_slot_released_after_completion() {
        let engine = engine();
        engine.run_sync("acme", SyncConfig::default()).unwrap();
        // A fresh start must succeed once the previous session finished.
        engine.run_sync("acme", SyncConfig::default()).unwrap();
    }

    #[test]
    fn test_stop_without_active_session_is_noop() {
        let engine = engine();
        engine.stop_sync("acme").unwrap();
    }
}
