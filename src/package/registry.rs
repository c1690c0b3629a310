// Package registry.
//
// Explicit, SQLite-backed history of deployment packages per tenant: the
// single source of truth for build status, artifact locations, delta
// chains, and restore-in-progress marks. No process-global state.

use crate::compress::CompressionLevel;
use crate::error::{EngineError, Result};
use crate::model::{DeploymentPackage, PackageComponents, PackageFormat, PackageStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

pub struct PackageRegistry {
    conn: Mutex<Connection>,
}

impl PackageRegistry {
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
            "CREATE TABLE IF NOT EXISTS packages (
                id TEXT PRIMARY KEY,
                nome TEXT NOT NULL,
                versao TEXT NOT NULL,
                descricao TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                size_bytes INTEGER NOT NULL,
                format TEXT NOT NULL,
                comp_schema INTEGER NOT NULL,
                comp_data INTEGER NOT NULL,
                comp_images INTEGER NOT NULL,
                comp_workflows INTEGER NOT NULL,
                comp_docs INTEGER NOT NULL,
                compression TEXT NOT NULL,
                encrypted INTEGER NOT NULL,
                baseline_package_id TEXT,
                package_code TEXT NOT NULL,
                artifact_path TEXT,
                error_message TEXT,
                restore_in_progress INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_packages_tenant
             ON packages(tenant_id, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_packages_baseline
             ON packages(baseline_package_id)",
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

    pub fn insert(&self, package: &DeploymentPackage) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO packages
             (id, nome, versao, descricao, tenant_id, status, created_at, size_bytes, format,
              comp_schema, comp_data, comp_images, comp_workflows, comp_docs,
              compression, encrypted, baseline_package_id, package_code, artifact_path, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                package.id.to_string(),
                package.nome,
                package.versao,
                package.descricao,
                package.tenant_id,
                package.status.as_str(),
                package.created_at.timestamp_millis(),
                package.size_bytes as i64,
                package.format.as_str(),
                package.components.schema as i64,
                package.components.data as i64,
                package.components.images as i64,
                package.components.workflows as i64,
                package.components.docs as i64,
                package.compression.as_str(),
                package.encrypted as i64,
                package.baseline_package_id.map(|id| id.to_string()),
                package.package_code,
                package.artifact_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                package.error_message,
            ],
        )?;
        Ok(())
    }

    /// Move a package through its build lifecycle. Completion also
    /// records the artifact handle and final size; failure records the
    /// error message. Completed packages are immutable.
    pub fn set_status(
        &self,
        id: Uuid,
        status: PackageStatus,
        size_bytes: Option<u64>,
        artifact_path: Option<&Path>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let updated = conn.execute(
            "UPDATE packages SET
                status = ?1,
                size_bytes = COALESCE(?2, size_bytes),
                artifact_path = COALESCE(?3, artifact_path),
                error_message = COALESCE(?4, error_message)
             WHERE id = ?5 AND status != 'completed'",
            params![
                status.as_str(),
                size_bytes.map(|s| s as i64),
                artifact_path.map(|p| p.to_string_lossy().to_string()),
                error_message,
                id.to_string(),
            ],
        )?;
        if updated == 0 {
            return Err(EngineError::PackageNotFound { id: id.to_string() });
        }
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Option<DeploymentPackage>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = conn
            .query_row(
                &format!("{} WHERE id = ?1", Self::SELECT),
                params![id.to_string()],
                Self::row_to_package,
            )
            .optional()?;
        row.transpose()
    }

    /// All packages for a tenant, newest first.
    pub fn list(&self, tenant: &str) -> Result<Vec<DeploymentPackage>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "{} WHERE tenant_id = ?1 ORDER BY created_at DESC, id DESC",
            Self::SELECT
        ))?;
        let rows = stmt.query_map(params![tenant], Self::row_to_package)?;
        let mut packages = Vec::new();
        for row in rows {
            packages.push(row??);
        }
        Ok(packages)
    }

    /// Most recent completed package for a tenant; the delta baseline.
    pub fn latest_completed(&self, tenant: &str) -> Result<Option<DeploymentPackage>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = conn
            .query_row(
                &format!(
                    "{} WHERE tenant_id = ?1 AND status = 'completed'
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    Self::SELECT
                ),
                params![tenant],
                Self::row_to_package,
            )
            .optional()?;
        row.transpose()
    }

    /// Ids of packages that reference `id` as their baseline.
    pub fn dependents_of(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt =
            conn.prepare("SELECT id FROM packages WHERE baseline_package_id = ?1")?;
        let rows = stmt.query_map(params![id.to_string()], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            let raw = row?;
            ids.push(
                Uuid::parse_str(&raw)
                    .map_err(|e| EngineError::Config(format!("corrupt package id: {}", e)))?,
            );
        }
        Ok(ids)
    }

    pub fn set_restore_in_progress(&self, id: Uuid, in_progress: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE packages SET restore_in_progress = ?1 WHERE id = ?2",
            params![in_progress as i64, id.to_string()],
        )?;
        Ok(())
    }

    pub fn restore_in_progress(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let flag: Option<i64> = conn
            .query_row(
                "SELECT restore_in_progress FROM packages WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(0) != 0)
    }

    /// Remove a registry row (after its artifact has been deleted).
    pub fn remove(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "DELETE FROM packages WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    const SELECT: &'static str = "SELECT id, nome, versao, descricao, tenant_id, status, created_at,
            size_bytes, format, comp_schema, comp_data, comp_images, comp_workflows,
            comp_docs, compression, encrypted, baseline_package_id, package_code,
            artifact_path, error_message
     FROM packages";

    fn row_to_package(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<DeploymentPackage>> {
        let id: String = row.get(0)?;
        let nome: String = row.get(1)?;
        let versao: String = row.get(2)?;
        let descricao: String = row.get(3)?;
        let tenant_id: String = row.get(4)?;
        let status: String = row.get(5)?;
        let created_at: i64 = row.get(6)?;
        let size_bytes: i64 = row.get(7)?;
        let format: String = row.get(8)?;
        let comp_schema: i64 = row.get(9)?;
        let comp_data: i64 = row.get(10)?;
        let comp_images: i64 = row.get(11)?;
        let comp_workflows: i64 = row.get(12)?;
        let comp_docs: i64 = row.get(13)?;
        let compression: String = row.get(14)?;
        let encrypted: i64 = row.get(15)?;
        let baseline: Option<String> = row.get(16)?;
        let package_code: String = row.get(17)?;
        let artifact_path: Option<String> = row.get(18)?;
        let error_message: Option<String> = row.get(19)?;

        Ok((|| {
            Ok(DeploymentPackage {
                id: Uuid::parse_str(&id)
                    .map_err(|e| EngineError::Config(format!("corrupt package id: {}", e)))?,
                nome,
                versao,
                descricao,
                tenant_id,
                status: status.parse::<PackageStatus>().map_err(EngineError::Config)?,
                created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
                size_bytes: size_bytes as u64,
                format: format.parse::<PackageFormat>().map_err(EngineError::Config)?,
                components: PackageComponents {
                    schema: comp_schema != 0,
                    data: comp_data != 0,
                    images: comp_images != 0,
                    workflows: comp_workflows != 0,
                    docs: comp_docs != 0,
                },
                compression: compression
                    .parse::<CompressionLevel>()
                    .map_err(EngineError::Config)?,
                encrypted: encrypted != 0,
                baseline_package_id: baseline
                    .map(|b| {
                        Uuid::parse_str(&b).map_err(|e| {
                            EngineError::Config(format!("corrupt baseline id: {}", e))
                        })
                    })
                    .transpose()?,
                package_code,
                artifact_path: artifact_path.map(PathBuf::from),
                error_message,
            })
        })())
    }
}
