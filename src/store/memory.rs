// In-memory record and blob stores.
//
// Used as the client-replica stand-in for local runs and as the fixture
// store in tests. Supports fault injection (unreachable storage, record
// validators) so failure semantics can be exercised deterministically.

use crate::error::{EngineError, Result};
use crate::model::Record;
use crate::store::{BlobStore, RecordStore};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

type Validator = dyn Fn(&Record) -> std::result::Result<(), String> + Send + Sync;

#[derive(Default)]
struct TenantData {
    tables: HashMap<String, BTreeMap<String, Record>>,
    schema: Option<String>,
}

/// Thread-safe in-memory [`RecordStore`].
#[derive(Default)]
pub struct MemoryStore {
    tenants: Mutex<HashMap<String, TenantData>>,
    unreachable: AtomicBool,
    validator: Option<Box<Validator>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a per-record validator; `put` maps its rejections to
    /// localized `Validation` errors.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Record) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Simulate the store becoming unreachable; every call fails with a
    /// transient `Storage` error until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_schema(&self, tenant: &str, ddl: &str) {
        let mut tenants = self.tenants.lock().unwrap_or_else(|e| e.into_inner());
        tenants.entry(tenant.to_string()).or_default().schema = Some(ddl.to_string());
    }

    pub fn record_count(&self, tenant: &str, table: &str) -> usize {
        let tenants = self.tenants.lock().unwrap_or_else(|e| e.into_inner());
        tenants
            .get(tenant)
            .and_then(|t| t.tables.get(table))
            .map(|records| records.len())
            .unwrap_or(0)
    }

    fn check_reachable(&self, context: &str) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(EngineError::Storage {
                context: context.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "record store unreachable",
                ),
            });
        }
        Ok(())
    }
}

impl RecordStore for MemoryStore {
    fn tables(&self, tenant: &str) -> Result<Vec<String>> {
        self.check_reachable("listing tables")?;
        let tenants = self.tenants.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = tenants
            .get(tenant)
            .map(|t| t.tables.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    fn list(
        &self,
        tenant: &str,
        table: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Record>> {
        self.check_reachable("listing records")?;
        let tenants = self.tenants.lock().unwrap_or_else(|e| e.into_inner());
        let records = tenants
            .get(tenant)
            .and_then(|t| t.tables.get(table))
            .map(|records| {
                records
                    .values()
                    .filter(|r| since.map_or(true, |cutoff| r.updated_at > cutoff))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(records)
    }

    fn get(&self, tenant: &str, table: &str, id: &str) -> Result<Option<Record>> {
        self.check_reachable("fetching record")?;
        let tenants = self.tenants.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tenants
            .get(tenant)
            .and_then(|t| t.tables.get(table))
            .and_then(|records| records.get(id))
            .cloned())
    }

    fn put(&self, tenant: &str, table: &str, record: Record) -> Result<()> {
        self.check_reachable("writing record")?;
        if let Some(validator) = &self.validator {
            if let Err(reason) = validator(&record) {
                return Err(EngineError::Validation {
                    table: table.to_string(),
                    record_id: record.id.clone(),
                    reason,
                });
            }
        }
        let mut tenants = self.tenants.lock().unwrap_or_else(|e| e.into_inner());
        tenants
            .entry(tenant.to_string())
            .or_default()
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(record.id.clone(), record);
        Ok(())
    }

    fn delete(&self, tenant: &str, table: &str, id: &str) -> Result<()> {
        self.check_reachable("deleting record")?;
        let mut tenants = self.tenants.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(records) = tenants
            .get_mut(tenant)
            .and_then(|t| t.tables.get_mut(table))
        {
            records.remove(id);
        }
        Ok(())
    }

    fn schema(&self, tenant: &str) -> Result<Option<String>> {
        self.check_reachable("reading schema")?;
        let tenants = self.tenants.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tenants.get(tenant).and_then(|t| t.schema.clone()))
    }

    fn put_schema(&self, tenant: &str, ddl: &str) -> Result<()> {
        self.check_reachable("writing schema")?;
        self.set_schema(tenant, ddl);
        Ok(())
    }
}

/// Thread-safe in-memory [`BlobStore`].
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn list(&self, tenant: &str, prefix: &str) -> Result<Vec<String>> {
        let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(blobs
            .get(tenant)
            .map(|b| {
                b.keys()
                    .filter(|name| name.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get(&self, tenant: &str, name: &str) -> Result<Vec<u8>> {
        let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        blobs
            .get(tenant)
            .and_then(|b| b.get(name))
            .cloned()
            .ok_or_else(|| {
                EngineError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("blob '{}' not found for tenant '{}'", name, tenant),
                ))
            })
    }

    fn put(&self, tenant: &str, name: &str, data: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        blobs
            .entry(tenant.to_string())
            .or_default()
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, tenant: &str, name: &str) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(b) = blobs.get_mut(tenant) {
            b.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_get_roundtrip() {
        let store = MemoryStore::new();
        let record = Record::new("p1", 1).with_field("name", json!("Ana"));

        store.put("acme", "personas", record.clone()).unwrap();

        let fetched = store.get("acme", "personas", "p1").unwrap().unwrap();
        assert_eq!(fetched, record);
        assert_eq!(store.tables("acme").unwrap(), vec!["personas"]);
    }

    #[test]
    fn test_list_since_filters() {
        let store = MemoryStore::new();
        let old = Record {
            updated_at: Utc::now() - chrono::Duration::hours(2),
            ..Record::new("old", 1)
        };
        let fresh = Record::new("fresh", 2);
        store.put("acme", "personas", old).unwrap();
        store.put("acme", "personas", fresh).unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let listed = store.list("acme", "personas", Some(cutoff)).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "fresh");
    }

    #[test]
    fn test_validator_rejects_localized() {
        let store = MemoryStore::new().with_validator(|record| {
            if record.fields.contains_key("email") {
                Ok(())
            } else {
                Err("missing email".to_string())
            }
        });

        let ok = Record::new("p1", 1).with_field("email", json!("a@x.com"));
        let bad = Record::new("p2", 1).with_field("name", json!("no email"));

        assert!(store.put("acme", "personas", ok).is_ok());
        let err = store.put("acme", "personas", bad).unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn test_unreachable_is_transient() {
        let store = MemoryStore::new();
        store.set_unreachable(true);
        let err = store.tables("acme").unwrap_err();
        assert!(err.is_transient());

        store.set_unreachable(false);
        assert!(store.tables("acme").is_ok());
    }

    #[test]
    fn test_blob_prefix_listing() {
        let store = MemoryBlobStore::new();
        store.put("acme", "images/a.png", b"png-a").unwrap();
        store.put("acme", "images/b.png", b"png-b").unwrap();
        store.put("acme", "workflows/w1.json", b"{}").unwrap();

        let images = store.list("acme", "images/").unwrap();
        assert_eq!(images, vec!["images/a.png", "images/b.png"]);
        assert_eq!(store.get("acme", "images/a.png").unwrap(), b"png-a");
    }
}
