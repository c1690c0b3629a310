pub mod json;
pub mod memory;

use crate::error::Result;
use crate::model::Record;
use chrono::{DateTime, Utc};

/// Tenant-scoped record store consumed by the sync and packaging engines.
///
/// This is the narrow interface over whatever actually holds the business
/// data (central database, client replica). Implementations must be
/// thread-safe; the engine fans out across tables from a thread pool.
pub trait RecordStore: Send + Sync {
    /// Table names present for the tenant.
    fn tables(&self, tenant: &str) -> Result<Vec<String>>;

    /// List records in a table, optionally only those updated after `since`.
    fn list(&self, tenant: &str, table: &str, since: Option<DateTime<Utc>>)
        -> Result<Vec<Record>>;

    /// Fetch a single record.
    fn get(&self, tenant: &str, table: &str, id: &str) -> Result<Option<Record>>;

    /// Upsert a record. Returns a `Validation` error for records the
    /// store rejects; such failures are localized to the record.
    fn put(&self, tenant: &str, table: &str, record: Record) -> Result<()>;

    /// Remove a record. Removing a missing record is a no-op.
    fn delete(&self, tenant: &str, table: &str, id: &str) -> Result<()>;

    /// DDL text for the tenant's dataset, if the store tracks one.
    fn schema(&self, tenant: &str) -> Result<Option<String>>;

    /// Replace the tenant's DDL text (used when provisioning/restoring).
    fn put_schema(&self, tenant: &str, ddl: &str) -> Result<()>;
}

/// Tenant-scoped blob store for assets (images, workflow definitions) and
/// package artifacts.
pub trait BlobStore: Send + Sync {
    /// Blob names under a prefix, sorted.
    fn list(&self, tenant: &str, prefix: &str) -> Result<Vec<String>>;

    fn get(&self, tenant: &str, name: &str) -> Result<Vec<u8>>;

    fn put(&self, tenant: &str, name: &str, data: &[u8]) -> Result<()>;

    fn delete(&self, tenant: &str, name: &str) -> Result<()>;
}
