// Change tracking for tenant tables.
//
// Records per-field mutation history and owns the per-(tenant, table)
// sync checkpoints. Uses SQLite for persistent storage; the tracker only
// appends to its own log and never touches business data.

use crate::error::{EngineError, Result};
use crate::model::{RecordOperation, SyncCheckpoint};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// One field-level change submitted by the CRUD layer.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDiff {
    pub field: String,
    pub new_value: Value,
}

impl FieldDiff {
    pub fn new(field: impl Into<String>, new_value: Value) -> Self {
        Self {
            field: field.into(),
            new_value,
        }
    }
}

/// A pending change as returned by [`ChangeTracker::pending_since`].
///
/// `field_name`/`new_value` are `None` for record deletions.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    pub record_id: String,
    pub operation: RecordOperation,
    pub field_name: Option<String>,
    pub new_value: Option<Value>,
    pub version: u64,
    pub changed_at: DateTime<Utc>,
}

/// Append-only mutation log plus checkpoint table for one sync side.
pub struct ChangeTracker {
    conn: Mutex<Connection>,
}

impl ChangeTracker {
    /// Database schema version
    const SCHEMA_VERSION: i32 = 1;

    /// Open or create the tracker database at `path`.
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

    /// Open an in-memory tracker (tests, ephemeral client replicas).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS change_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                table_name TEXT NOT NULL,
                record_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                field_name TEXT,
                new_value TEXT,
                version INTEGER NOT NULL,
                changed_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_change_scope
             ON change_log(tenant_id, table_name, version)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                tenant_id TEXT NOT NULL,
                table_name TEXT NOT NULL,
                last_version_seen INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (tenant_id, table_name)
            )",
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

    /// Append field-level changes for a record at `version`.
    pub fn record_change(
        &self,
        tenant: &str,
        table: &str,
        record_id: &str,
        field_diffs: &[FieldDiff],
        version: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now().timestamp_millis();
        for diff in field_diffs {
            conn.execute(
                "INSERT INTO change_log
                 (tenant_id, table_name, record_id, operation, field_name, new_value, version, changed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    tenant,
                    table,
                    record_id,
                    RecordOperation::Update.as_str(),
                    diff.field,
                    diff.new_value.to_string(),
                    version as i64,
                    now,
                ],
            )?;
        }
        tracing::trace!(
            "Recorded {} field change(s) for {}/{}/{} at version {}",
            field_diffs.len(),
            tenant,
            table,
            record_id,
            version
        );
        Ok(())
    }

    /// Append a record deletion at `version`.
    pub fn record_delete(
        &self,
        tenant: &str,
        table: &str,
        record_id: &str,
        version: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO change_log
             (tenant_id, table_name, record_id, operation, field_name, new_value, version, changed_at)
             VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5, ?6)",
            params![
                tenant,
                table,
                record_id,
                RecordOperation::Delete.as_str(),
                version as i64,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Changes newer than `checkpoint_version`, in version order,
    /// deduplicated to the latest entry per record per field.
    pub fn pending_since(
        &self,
        tenant: &str,
        table: &str,
        checkpoint_version: u64,
    ) -> Result<Vec<ChangeEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT record_id, operation, field_name, new_value, version, changed_at
             FROM change_log
             WHERE tenant_id = ?1 AND table_name = ?2 AND version > ?3
             ORDER BY version, id",
        )?;

        let rows = stmt.query_map(
            params![tenant, table, checkpoint_version as i64],
            |row| {
                let operation: String = row.get(1)?;
                let new_value: Option<String> = row.get(3)?;
                let version: i64 = row.get(4)?;
                let changed_at: i64 = row.get(5)?;
                Ok((
                    row.get::<_, String>(0)?,
                    operation,
                    row.get::<_, Option<String>>(2)?,
                    new_value,
                    version,
                    changed_at,
                ))
            },
        )?;

        // Latest entry wins per (record, field); deletes key on field None.
        let mut latest: HashMap<(String, Option<String>), ChangeEntry> = HashMap::new();
        for row in rows {
            let (record_id, operation, field_name, new_value, version, changed_at) = row?;
            let operation = operation.parse::<RecordOperation>().map_err(|e| {
                EngineError::Config(format!("corrupt change log entry: {}", e))
            })?;
            let new_value = match new_value {
                Some(raw) => Some(serde_json::from_str(&raw)?),
                None => None,
            };
            let changed_at = DateTime::from_timestamp_millis(changed_at)
                .unwrap_or_else(Utc::now);
            let entry = ChangeEntry {
                record_id: record_id.clone(),
                operation,
                field_name: field_name.clone(),
                new_value,
                version: version as u64,
                changed_at,
            };
            latest.insert((record_id, field_name), entry);
        }

        let mut entries: Vec<ChangeEntry> = latest.into_values().collect();
        entries.sort_by(|a, b| {
            a.version
                .cmp(&b.version)
                .then_with(|| a.record_id.cmp(&b.record_id))
                .then_with(|| a.field_name.cmp(&b.field_name))
        });
        Ok(entries)
    }

    /// Current checkpoint for a (tenant, table), if one has been committed.
    pub fn checkpoint(&self, tenant: &str, table: &str) -> Result<Option<SyncCheckpoint>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = conn
            .query_row(
                "SELECT last_version_seen, updated_at FROM checkpoints
                 WHERE tenant_id = ?1 AND table_name = ?2",
                params![tenant, table],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        Ok(row.map(|(version, updated_at)| SyncCheckpoint {
            tenant_id: tenant.to_string(),
            table_name: table.to_string(),
            last_version_seen: version as u64,
            updated_at: DateTime::from_timestamp_millis(updated_at).unwrap_or_else(Utc::now),
        }))
    }

    /// Checkpoint version, defaulting to 0 when none has been committed.
    pub fn checkpoint_version(&self, tenant: &str, table: &str) -> Result<u64> {
        Ok(self
            .checkpoint(tenant, table)?
            .map(|cp| cp.last_version_seen)
            .unwrap_or(0))
    }

    /// Advance the checkpoint. Monotonic: a lower or equal version is
    /// ignored, so a concurrent late writer cannot roll a table back.
    pub fn advance_checkpoint(&self, tenant: &str, table: &str, version: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let updated = conn.execute(
            "INSERT INTO checkpoints (tenant_id, table_name, last_version_seen, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(tenant_id, table_name) DO UPDATE SET
                last_version_seen = excluded.last_version_seen,
                updated_at = excluded.updated_at
             WHERE excluded.last_version_seen > checkpoints.last_version_seen",
            params![
                tenant,
                table,
                version as i64,
                Utc::now().timestamp_millis()
            ],
        )?;
        if updated > 0 {
            tracing::debug!(
                "Checkpoint for {}/{} advanced to version {}",
                tenant,
                table,
                version
            );
        }
        Ok(())
    }

    /// Highest version recorded in the log for a (tenant, table).
    pub fn max_version(&self, tenant: &str, table: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(version) FROM change_log
             WHERE tenant_id = ?1 AND table_name = ?2",
            params![tenant, table],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) as u64)
    }

    /// Tables with at least one logged change for the tenant.
    pub fn changed_tables(&self, tenant: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT DISTINCT table_name FROM change_log
             WHERE tenant_id = ?1 ORDER BY table_name",
        )?;
        let tables = stmt
            .query_map(params![tenant], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(tables)
    }
}
