// Directory-backed record and blob stores.
//
// Layout under the root:
//   <root>/<tenant>/tables/<table>.json   (JSON array of records)
//   <root>/<tenant>/schema.sql
//   <root>/<tenant>/blobs/<name>
//
// Table writes go through a temp file + atomic rename so a crash never
// leaves a half-written table behind.

use crate::error::{EngineError, Result};
use crate::model::Record;
use crate::store::{BlobStore, RecordStore};
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Filesystem [`RecordStore`] holding each table as a JSON document.
pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tables_dir(&self, tenant: &str) -> PathBuf {
        self.root.join(tenant).join("tables")
    }

    fn table_path(&self, tenant: &str, table: &str) -> PathBuf {
        self.tables_dir(tenant).join(format!("{}.json", table))
    }

    fn schema_path(&self, tenant: &str) -> PathBuf {
        self.root.join(tenant).join("schema.sql")
    }

    fn load_table(&self, tenant: &str, table: &str) -> Result<Vec<Record>> {
        let path = self.table_path(tenant, table);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).map_err(|e| EngineError::Storage {
            context: format!("opening table '{}'", table),
            source: e,
        })?;
        let records = serde_json::from_reader(BufReader::new(file))?;
        Ok(records)
    }

    fn save_table(&self, tenant: &str, table: &str, records: &[Record]) -> Result<()> {
        let path = self.table_path(tenant, table);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = path.with_extension("json.tmp");
        let file = File::create(&temp).map_err(|e| EngineError::Storage {
            context: format!("writing table '{}'", table),
            source: e,
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), records)?;
        fs::rename(&temp, &path)?;
        Ok(())
    }
}

impl RecordStore for JsonStore {
    fn tables(&self, tenant: &str) -> Result<Vec<String>> {
        let dir = self.tables_dir(tenant);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn list(
        &self,
        tenant: &str,
        table: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Record>> {
        let records = self.load_table(tenant, table)?;
        Ok(records
            .into_iter()
            .filter(|r| since.map_or(true, |cutoff| r.updated_at > cutoff))
            .collect())
    }

    fn get(&self, tenant: &str, table: &str, id: &str) -> Result<Option<Record>> {
        let records = self.load_table(tenant, table)?;
        Ok(records.into_iter().find(|r| r.id == id))
    }

    fn put(&self, tenant: &str, table: &str, record: Record) -> Result<()> {
        let mut records = self.load_table(tenant, table)?;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        self.save_table(tenant, table, &records)
    }

    fn delete(&self, tenant: &str, table: &str, id: &str) -> Result<()> {
        let mut records = self.load_table(tenant, table)?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() != before {
            self.save_table(tenant, table, &records)?;
        }
        Ok(())
    }

    fn schema(&self, tenant: &str) -> Result<Option<String>> {
        let path = self.schema_path(tenant);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&path)?))
    }

    fn put_schema(&self, tenant: &str, ddl: &str) -> Result<()> {
        let path = self.schema_path(tenant);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, ddl)?;
        Ok(())
    }
}

/// Filesystem [`BlobStore`] with one file per blob.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn blob_path(&self, tenant: &str, name: &str) -> PathBuf {
        self.root.join(tenant).join("blobs").join(name)
    }
}

impl BlobStore for FsBlobStore {
    fn list(&self, tenant: &str, prefix: &str) -> Result<Vec<String>> {
        let base = self.root.join(tenant).join("blobs");
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in WalkDir::new(&base).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&base) {
                    let name = rel.to_string_lossy().replace('\\', "/");
                    if name.starts_with(prefix) {
                        names.push(name);
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn get(&self, tenant: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(tenant, name);
        fs::read(&path).map_err(|e| EngineError::Storage {
            context: format!("reading blob '{}'", name),
            source: e,
        })
    }

    fn put(&self, tenant: &str, name: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(tenant, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        Ok(())
    }

    fn delete(&self, tenant: &str, name: &str) -> Result<()> {
        let path = self.blob_path(tenant, name);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_table_roundtrip() {
        let dir = tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();

        let record = Record::new("p1", 1).with_field("name", json!("Ana"));
        store.put("acme", "personas", record.clone()).unwrap();

        let fetched = store.get("acme", "personas", "p1").unwrap().unwrap();
        assert_eq!(fetched, record);
        assert_eq!(store.tables("acme").unwrap(), vec!["personas"]);
    }

    #[test]
    fn test_put_replaces_existing() {
        let dir = tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();

        store
            .put("acme", "personas", Record::new("p1", 1))
            .unwrap();
        store
            .put(
                "acme",
                "personas",
                Record::new("p1", 2).with_field("name", json!("Bruna")),
            )
            .unwrap();

        let all = store.list("acme", "personas", None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].version, 2);
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let dir = tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        store.delete("acme", "personas", "ghost").unwrap();
    }

    #[test]
    fn test_schema_roundtrip() {
        let dir = tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();

        assert!(store.schema("acme").unwrap().is_none());
        store
            .put_schema("acme", "CREATE TABLE personas (id uuid);")
            .unwrap();
        assert_eq!(
            store.schema("acme").unwrap().unwrap(),
            "CREATE TABLE personas (id uuid);"
        );
    }

    #[test]
    fn test_blob_store_nested_names() {
        let dir = tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();

        store.put("acme", "images/avatars/a.png", b"png").unwrap();
        store.put("acme", "workflows/w1.json", b"{}").unwrap();

        let images = store.list("acme", "images/").unwrap();
        assert_eq!(images, vec!["images/avatars/a.png"]);
        assert_eq!(store.get("acme", "images/avatars/a.png").unwrap(), b"png");

        store.delete("acme", "images/avatars/a.png").unwrap();
        assert!(store.list("acme", "images/").unwrap().is_empty());
    }
}
