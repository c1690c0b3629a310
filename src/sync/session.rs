// Durable session state.
//
// Sessions, per-table item summaries, and conflict records live in
// SQLite so every state transition survives a restart and pollers can
// read terminal states until they are explicitly purged. Conflict rows
// are never deleted, only marked resolved.

use crate::error::{EngineError, Result};
use crate::model::{
    ConflictRecord, ResolutionStrategy, SessionStatus, SyncItem, SyncSession,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

pub struct SessionDb {
    conn: Mutex<Connection>,
}

impl SessionDb {
    /// Database schema version
    const SCHEMA_VERSION: i32 = 1;

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                operation_type TEXT NOT NULL,
                direction TEXT NOT NULL,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                completed_at INTEGER,
                error_message TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_tenant
             ON sessions(tenant_id, started_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_items (
                session_id TEXT NOT NULL,
                table_name TEXT NOT NULL,
                operation TEXT NOT NULL,
                records_count INTEGER NOT NULL,
                success_count INTEGER NOT NULL,
                error_count INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_items_session ON sync_items(session_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS conflicts (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                table_name TEXT NOT NULL,
                record_id TEXT NOT NULL,
                field_name TEXT NOT NULL,
                local_value TEXT NOT NULL,
                remote_value TEXT NOT NULL,
                local_modified_at INTEGER NOT NULL,
                remote_modified_at INTEGER NOT NULL,
                resolved INTEGER NOT NULL,
                strategy_applied TEXT,
                resolved_at INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_conflicts_session ON conflicts(session_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
            params![Self::SCHEMA_VERSION],
        )?;

        Ok(())
    }

    pub fn insert_session(&self, session: &SyncSession) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO sessions
             (id, tenant_id, operation_type, direction, status, progress, started_at, completed_at, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session.id.to_string(),
                session.tenant_id,
                session.operation_type.as_str(),
                session.direction.as_str(),
                session.status.as_str(),
                session.progress as i64,
                session.started_at.timestamp_millis(),
                session.completed_at.map(|t| t.timestamp_millis()),
                session.error_message,
            ],
        )?;
        Ok(())
    }

    pub fn set_progress(&self, session_id: Uuid, progress: u8) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE sessions SET progress = ?1 WHERE id = ?2",
            params![progress as i64, session_id.to_string()],
        )?;
        Ok(())
    }

    pub fn set_status(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        progress: Option<u8>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let completed_at = if status.is_terminal() {
            Some(Utc::now().timestamp_millis())
        } else {
            None
        };
        conn.execute(
            "UPDATE sessions SET
                status = ?1,
                progress = COALESCE(?2, progress),
                completed_at = COALESCE(?3, completed_at),
                error_message = COALESCE(?4, error_message)
             WHERE id = ?5",
            params![
                status.as_str(),
                progress.map(|p| p as i64),
                completed_at,
                error_message,
                session_id.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, session_id: Uuid) -> Result<Option<SyncSession>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = conn
            .query_row(
                "SELECT id, tenant_id, operation_type, direction, status, progress,
                        started_at, completed_at, error_message
                 FROM sessions WHERE id = ?1",
                params![session_id.to_string()],
                Self::row_to_session,
            )
            .optional()?;
        row.transpose()
    }

    /// Most recently started session for a tenant.
    pub fn latest_session(&self, tenant: &str) -> Result<Option<SyncSession>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = conn
            .query_row(
                "SELECT id, tenant_id, operation_type, direction, status, progress,
                        started_at, completed_at, error_message
                 FROM sessions WHERE tenant_id = ?1
                 ORDER BY started_at DESC, id DESC LIMIT 1",
                params![tenant],
                Self::row_to_session,
            )
            .optional()?;
        row.transpose()
    }

    /// All sessions for a tenant, newest first.
    pub fn sessions_for_tenant(&self, tenant: &str) -> Result<Vec<SyncSession>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, operation_type, direction, status, progress,
                    started_at, completed_at, error_message
             FROM sessions WHERE tenant_id = ?1
             ORDER BY started_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![tenant], Self::row_to_session)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row??);
        }
        Ok(sessions)
    }

    #[allow(clippy::type_complexity)]
    fn row_to_session(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<Result<SyncSession>> {
        let id: String = row.get(0)?;
        let tenant_id: String = row.get(1)?;
        let operation_type: String = row.get(2)?;
        let direction: String = row.get(3)?;
        let status: String = row.get(4)?;
        let progress: i64 = row.get(5)?;
        let started_at: i64 = row.get(6)?;
        let completed_at: Option<i64> = row.get(7)?;
        let error_message: Option<String> = row.get(8)?;

        Ok((|| {
            Ok(SyncSession {
                id: Uuid::parse_str(&id)
                    .map_err(|e| EngineError::Config(format!("corrupt session id: {}", e)))?,
                tenant_id,
                operation_type: operation_type
                    .parse()
                    .map_err(EngineError::Config)?,
                direction: direction.parse().map_err(EngineError::Config)?,
                status: status.parse().map_err(EngineError::Config)?,
                progress: progress.clamp(0, 100) as u8,
                started_at: millis_to_datetime(started_at),
                completed_at: completed_at.map(millis_to_datetime),
                error_message,
            })
        })())
    }

    pub fn insert_item(&self, item: &SyncItem) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO sync_items
             (session_id, table_name, operation, records_count, success_count, error_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                item.session_id.to_string(),
                item.table_name,
                item.operation.as_str(),
                item.records_count as i64,
                item.success_count as i64,
                item.error_count as i64,
            ],
        )?;
        Ok(())
    }

    pub fn items_for_session(&self, session_id: Uuid) -> Result<Vec<SyncItem>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT table_name, operation, records_count, success_count, error_count
             FROM sync_items WHERE session_id = ?1
             ORDER BY table_name, operation",
        )?;
        let rows = stmt.query_map(params![session_id.to_string()], |row| {
            let table_name: String = row.get(0)?;
            let operation: String = row.get(1)?;
            let records_count: i64 = row.get(2)?;
            let success_count: i64 = row.get(3)?;
            let error_count: i64 = row.get(4)?;
            Ok((table_name, operation, records_count, success_count, error_count))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (table_name, operation, records_count, success_count, error_count) = row?;
            items.push(SyncItem {
                session_id,
                table_name,
                operation: operation.parse().map_err(EngineError::Config)?,
                records_count: records_count as u64,
                success_count: success_count as u64,
                error_count: error_count as u64,
            });
        }
        Ok(items)
    }

    pub fn insert_conflict(&self, conflict: &ConflictRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO conflicts
             (id, session_id, table_name, record_id, field_name, local_value, remote_value,
              local_modified_at, remote_modified_at, resolved, strategy_applied, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                conflict.id.to_string(),
                conflict.session_id.to_string(),
                conflict.table_name,
                conflict.record_id,
                conflict.field_name,
                conflict.local_value.to_string(),
                conflict.remote_value.to_string(),
                conflict.local_modified_at.timestamp_millis(),
                conflict.remote_modified_at.timestamp_millis(),
                conflict.resolved as i64,
                conflict.strategy_applied.map(|s| s.as_str()),
                conflict.resolved_at.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    pub fn get_conflict(&self, conflict_id: Uuid) -> Result<Option<ConflictRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = conn
            .query_row(
                "SELECT id, session_id, table_name, record_id, field_name, local_value,
                        remote_value, local_modified_at, remote_modified_at, resolved,
                        strategy_applied, resolved_at
                 FROM conflicts WHERE id = ?1",
                params![conflict_id.to_string()],
                Self::row_to_conflict,
            )
            .optional()?;
        row.transpose()
    }

    pub fn conflicts_for_session(&self, session_id: Uuid) -> Result<Vec<ConflictRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, session_id, table_name, record_id, field_name, local_value,
                    remote_value, local_modified_at, remote_modified_at, resolved,
                    strategy_applied, resolved_at
             FROM conflicts WHERE session_id = ?1
             ORDER BY table_name, record_id, field_name",
        )?;
        let rows = stmt.query_map(params![session_id.to_string()], Self::row_to_conflict)?;
        let mut conflicts = Vec::new();
        for row in rows {
            conflicts.push(row??);
        }
        Ok(conflicts)
    }

    /// Unresolved conflicts for a tenant across all sessions, oldest first.
    pub fn unresolved_conflicts(&self, tenant: &str) -> Result<Vec<ConflictRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT c.id, c.session_id, c.table_name, c.record_id, c.field_name,
                    c.local_value, c.remote_value, c.local_modified_at,
                    c.remote_modified_at, c.resolved, c.strategy_applied, c.resolved_at
             FROM conflicts c
             JOIN sessions s ON s.id = c.session_id
             WHERE s.tenant_id = ?1 AND c.resolved = 0
             ORDER BY s.started_at, c.table_name, c.record_id, c.field_name",
        )?;
        let rows = stmt.query_map(params![tenant], Self::row_to_conflict)?;
        let mut conflicts = Vec::new();
        for row in rows {
            conflicts.push(row??);
        }
        Ok(conflicts)
    }

    #[allow(clippy::type_complexity)]
    fn row_to_conflict(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<Result<ConflictRecord>> {
        let id: String = row.get(0)?;
        let session_id: String = row.get(1)?;
        let table_name: String = row.get(2)?;
        let record_id: String = row.get(3)?;
        let field_name: String = row.get(4)?;
        let local_value: String = row.get(5)?;
        let remote_value: String = row.get(6)?;
        let local_modified_at: i64 = row.get(7)?;
        let remote_modified_at: i64 = row.get(8)?;
        let resolved: i64 = row.get(9)?;
        let strategy_applied: Option<String> = row.get(10)?;
        let resolved_at: Option<i64> = row.get(11)?;

        Ok((|| {
            Ok(ConflictRecord {
                id: Uuid::parse_str(&id)
                    .map_err(|e| EngineError::Config(format!("corrupt conflict id: {}", e)))?,
                session_id: Uuid::parse_str(&session_id)
                    .map_err(|e| EngineError::Config(format!("corrupt session id: {}", e)))?,
                table_name,
                record_id,
                field_name,
                local_value: serde_json::from_str(&local_value)?,
                remote_value: serde_json::from_str(&remote_value)?,
                local_modified_at: millis_to_datetime(local_modified_at),
                remote_modified_at: millis_to_datetime(remote_modified_at),
                resolved: resolved != 0,
                strategy_applied: strategy_applied
                    .map(|s| s.parse::<ResolutionStrategy>().map_err(EngineError::Config))
                    .transpose()?,
                resolved_at: resolved_at.map(millis_to_datetime),
            })
        })())
    }

    /// Whether the tenant already has an unresolved conflict queued for
    /// this (table, record, field); used to keep the manual-review queue
    /// free of duplicates across repeated sync runs.
    pub fn has_unresolved_conflict(
        &self,
        tenant: &str,
        table: &str,
        record_id: &str,
        field_name: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count: i64 = conn.query_row(
            "SELECT COUNT(*)
             FROM conflicts c
             JOIN sessions s ON s.id = c.session_id
             WHERE s.tenant_id = ?1 AND c.table_name = ?2
               AND c.record_id = ?3 AND c.field_name = ?4 AND c.resolved = 0",
            params![tenant, table, record_id, field_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Mark a conflict resolved exactly once.
    pub fn mark_conflict_resolved(
        &self,
        conflict_id: Uuid,
        strategy: ResolutionStrategy,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let updated = conn.execute(
            "UPDATE conflicts SET resolved = 1, strategy_applied = ?1, resolved_at = ?2
             WHERE id = ?3 AND resolved = 0",
            params![
                strategy.as_str(),
                Utc::now().timestamp_millis(),
                conflict_id.to_string(),
            ],
        )?;
        if updated == 0 {
            return Err(EngineError::ConflictAlreadyResolved {
                id: conflict_id.to_string(),
            });
        }
        Ok(())
    }

    /// Remove finished sessions (and their item rows) older than the
    /// cutoff. Conflict rows are kept as the audit trail.
    pub fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff_millis = cutoff.timestamp_millis();
        conn.execute(
            "DELETE FROM sync_items WHERE session_id IN (
                SELECT id FROM sessions
                WHERE status IN ('completed', 'error') AND started_at < ?1
             )",
            params![cutoff_millis],
        )?;
        let purged = conn.execute(
            "DELETE FROM sessions
             WHERE status IN ('completed', 'error') AND started_at < ?1",
            params![cutoff_millis],
        )?;
        if purged > 0 {
            tracing::info!("Purged {} finished sync session(s)", purged);
        }
        Ok(purged)
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}
