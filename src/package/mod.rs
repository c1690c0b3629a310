// Deployment package assembly.
//
// A package is an archive (zip, tar, or plain folder) holding an
// unencrypted manifest plus per-component payload entries. Payloads are
// compressed, then optionally encrypted, then stored. Builds stage into
// a temp directory and publish with a single rename; a failed build
// never leaves a partial artifact behind.

pub mod archive;
pub mod crypto;
pub mod manifest;
pub mod registry;
pub mod restore;

use crate::compress;
use crate::error::{EngineError, Result};
use crate::model::{
    DeploymentPackage, PackageComponents, PackageConfig, PackageFormat, PackageStatus,
};
use crate::store::{BlobStore, RecordStore};
use archive::ArchiveWriter;
use chrono::{DateTime, Utc};
use manifest::{Manifest, ManifestEntry, MANIFEST_NAME, MANIFEST_VERSION};
use registry::PackageRegistry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use walkdir::WalkDir;

pub use restore::{restore_into, verify_package, RestoreReport};

pub struct PackageBuilder {
    store: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    registry: Arc<PackageRegistry>,
    output_dir: PathBuf,
    active: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl PackageBuilder {
    pub fn new(
        store: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        registry: Arc<PackageRegistry>,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;
        Ok(Self {
            store,
            blobs,
            registry,
            output_dir,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<PackageRegistry> {
        &self.registry
    }

    /// Build a package on the calling thread. The registry row moves
    /// pending -> building -> completed; on failure it ends at `error`
    /// and no artifact is published.
    pub fn build(&self, config: &PackageConfig) -> Result<DeploymentPackage> {
        Self::validate(config)?;
        let record = self.create_record(config)?;
        let cancel = self.register(record.id);
        let result = self.run_build(&record, config, &cancel);
        self.unregister(record.id);
        self.finalize(record.id, result)
    }

    /// Start a build in the background and return the pending record;
    /// poll the registry for progress, cancel with
    /// [`cancel_build`](Self::cancel_build).
    pub fn start_build(self: Arc<Self>, config: &PackageConfig) -> Result<DeploymentPackage> {
        Self::validate(config)?;
        let record = self.create_record(config)?;
        let cancel = self.register(record.id);
        let background = record.clone();
        let config = config.clone();
        std::thread::spawn(move || {
            let result = self.run_build(&background, &config, &cancel);
            self.unregister(background.id);
            if let Err(e) = self.finalize(background.id, result) {
                tracing::warn!("Package build {} failed: {}", background.id, e);
            }
        });
        Ok(record)
    }

    /// Request cancellation of an in-flight build. Returns whether a
    /// build was active for the id.
    pub fn cancel_build(&self, id: Uuid) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get(&id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Restore a completed package (and its baseline chain, for deltas)
    /// into the given target stores.
    pub fn restore_into(
        &self,
        package_id: Uuid,
        target_store: &dyn RecordStore,
        target_blobs: &dyn BlobStore,
        passphrase: Option<&str>,
    ) -> Result<RestoreReport> {
        restore::restore_into(
            &self.registry,
            package_id,
            target_store,
            target_blobs,
            passphrase,
        )
    }

    /// Recompute payload checksums against the manifest.
    pub fn verify(&self, package_id: Uuid, passphrase: Option<&str>) -> Result<()> {
        restore::verify_package(&self.registry, package_id, passphrase)
    }

    fn validate(config: &PackageConfig) -> Result<()> {
        if config.nome.trim().is_empty() {
            return Err(EngineError::InvalidPackageConfig(
                "package name must not be empty".to_string(),
            ));
        }
        let parts: Vec<&str> = config.versao.split('.').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty() || p.parse::<u64>().is_err()) {
            return Err(EngineError::InvalidPackageConfig(format!(
                "version '{}' is not of the form MAJOR.MINOR.PATCH",
                config.versao
            )));
        }
        if !config.components().any() {
            return Err(EngineError::InvalidPackageConfig(
                "at least one component must be included".to_string(),
            ));
        }
        if config.encriptacao
            && config
                .senha_encriptacao
                .as_deref()
                .map_or(true, |s| s.is_empty())
        {
            return Err(EngineError::InvalidPackageConfig(
                "encryption requested but no passphrase supplied".to_string(),
            ));
        }
        Ok(())
    }

    fn create_record(&self, config: &PackageConfig) -> Result<DeploymentPackage> {
        let created_at = Utc::now();
        let record = DeploymentPackage {
            id: Uuid::new_v4(),
            nome: config.nome.clone(),
            versao: config.versao.clone(),
            descricao: config.descricao.clone(),
            tenant_id: config.tenant_id.clone(),
            status: PackageStatus::Pending,
            created_at,
            size_bytes: 0,
            format: config.formato_saida,
            components: config.components(),
            compression: config.compressao,
            encrypted: config.encriptacao,
            baseline_package_id: None,
            package_code: format!("PKG_{}_{}", config.tenant_id, created_at.timestamp_millis()),
            artifact_path: None,
            error_message: None,
        };
        self.registry.insert(&record)?;
        Ok(record)
    }

    fn register(&self, id: Uuid) -> Arc<AtomicBool> {
        let cancel = Arc::new(AtomicBool::new(false));
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.insert(id, Arc::clone(&cancel));
        cancel
    }

    fn unregister(&self, id: Uuid) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&id);
    }

    fn finalize(&self, id: Uuid, result: Result<BuildOutput>) -> Result<DeploymentPackage> {
        match result {
            Ok(output) => {
                self.registry.set_status(
                    id,
                    PackageStatus::Completed,
                    Some(output.size_bytes),
                    Some(&output.artifact_path),
                    None,
                )?;
                if let Some(baseline) = output.baseline_package_id {
                    tracing::info!("Package {} built as delta against {}", id, baseline);
                }
                self.registry
                    .get(id)?
                    .ok_or_else(|| EngineError::PackageNotFound { id: id.to_string() })
            }
            Err(e) => {
                self.registry.set_status(
                    id,
                    PackageStatus::Error,
                    None,
                    None,
                    Some(&e.to_string()),
                )?;
                Err(e)
            }
        }
    }

    fn run_build(
        &self,
        record: &DeploymentPackage,
        config: &PackageConfig,
        cancel: &Arc<AtomicBool>,
    ) -> Result<BuildOutput> {
        let tenant = &config.tenant_id;
        self.registry
            .set_status(record.id, PackageStatus::Building, None, None, None)?;
        tracing::info!("Building package {} for tenant {}", record.package_code, tenant);

        // Missing optional components are omitted, not an error.
        let components = self.available_components(tenant, config.components())?;
        if !components.any() {
            return Err(EngineError::Build(
                "no requested component has data available for this tenant".to_string(),
            ));
        }

        let (baseline_id, since) = if config.backup_incremental {
            match self.registry.latest_completed(tenant)? {
                Some(baseline) => (Some(baseline.id), Some(baseline.created_at)),
                None => (None, None),
            }
        } else {
            (None, None)
        };

        let entries = self.collect_entries(record, &components, since)?;

        let (kdf, key) = if config.encriptacao {
            let params = crypto::KdfParams::new();
            // Validation guarantees the passphrase is present here.
            let passphrase = config.senha_encriptacao.as_deref().unwrap_or_default();
            let key = crypto::derive_key(passphrase, &params)?;
            (Some(params), Some(key))
        } else {
            (None, None)
        };

        let artifact_name = match record.format.extension() {
            Some(ext) => format!("{}.{}", record.package_code, ext),
            None => record.package_code.clone(),
        };

        // Stage next to the output dir so the final rename is atomic.
        let staging = tempfile::tempdir_in(&self.output_dir)?;
        let staging_path = staging.path().join(&artifact_name);
        let mut writer = ArchiveWriter::create(&staging_path, record.format)?;

        let mut manifest_entries = Vec::with_capacity(entries.len());
        for entry in &entries {
            if cancel.load(Ordering::SeqCst) {
                return Err(EngineError::Build("build cancelled".to_string()));
            }
            let compressed = compress::compress(&entry.raw, config.compressao)?;
            let stored = match &key {
                Some(key) => crypto::encrypt(key, &compressed)?,
                None => compressed,
            };
            writer.add_file(&entry.path, &stored)?;
            manifest_entries.push(ManifestEntry {
                path: entry.path.clone(),
                component: entry.component.to_string(),
                size_bytes: entry.raw.len() as u64,
                stored_bytes: stored.len() as u64,
                checksum: manifest::checksum(&entry.raw),
            });
        }

        let manifest = Manifest {
            manifest_version: MANIFEST_VERSION,
            package_id: record.id,
            package_code: record.package_code.clone(),
            nome: record.nome.clone(),
            versao: record.versao.clone(),
            descricao: record.descricao.clone(),
            tenant_id: tenant.clone(),
            created_at: record.created_at,
            format: record.format,
            compression: config.compressao,
            encrypted: config.encriptacao,
            kdf,
            baseline_package_id: baseline_id,
            components,
            entries: manifest_entries,
        };
        writer.add_file(MANIFEST_NAME, &manifest.to_bytes()?)?;
        writer.finish()?;

        let final_path = self.output_dir.join(&artifact_name);
        std::fs::rename(&staging_path, &final_path)?;
        let size_bytes = artifact_size(&final_path)?;

        tracing::info!(
            "Package {} published at {} ({} bytes)",
            record.package_code,
            final_path.display(),
            size_bytes
        );

        Ok(BuildOutput {
            artifact_path: final_path,
            size_bytes,
            baseline_package_id: baseline_id,
        })
    }

    fn available_components(
        &self,
        tenant: &str,
        requested: PackageComponents,
    ) -> Result<PackageComponents> {
        Ok(PackageComponents {
            schema: requested.schema && self.store.schema(tenant)?.is_some(),
            data: requested.data && !self.store.tables(tenant)?.is_empty(),
            images: requested.images && !self.blobs.list(tenant, "images/")?.is_empty(),
            workflows: requested.workflows && !self.blobs.list(tenant, "workflows/")?.is_empty(),
            docs: requested.docs,
        })
    }

    fn collect_entries(
        &self,
        record: &DeploymentPackage,
        components: &PackageComponents,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawEntry>> {
        let tenant = &record.tenant_id;
        let mut entries = Vec::new();

        if components.schema {
            if let Some(ddl) = self.store.schema(tenant)? {
                entries.push(RawEntry {
                    path: "payload/schema.sql".to_string(),
                    component: "schema",
                    raw: ddl.into_bytes(),
                });
            }
        }

        if components.data {
            for table in self.store.tables(tenant)? {
                let records = self.store.list(tenant, &table, since)?;
                // Delta packages carry only tables with changed records.
                if since.is_some() && records.is_empty() {
                    continue;
                }
                entries.push(RawEntry {
                    path: format!("payload/data/{}.json", table),
                    component: "data",
                    raw: serde_json::to_vec_pretty(&records)?,
                });
            }
        }

        if components.images {
            for name in self.blobs.list(tenant, "images/")? {
                let raw = self.blobs.get(tenant, &name)?;
                entries.push(RawEntry {
                    path: format!("payload/{}", name),
                    component: "images",
                    raw,
                });
            }
        }

        if components.workflows {
            for name in self.blobs.list(tenant, "workflows/")? {
                let raw = self.blobs.get(tenant, &name)?;
                entries.push(RawEntry {
                    path: format!("payload/{}", name),
                    component: "workflows",
                    raw,
                });
            }
        }

        if components.docs {
            entries.push(RawEntry {
                path: "payload/docs/README.md".to_string(),
                component: "docs",
                raw: render_readme(record, components).into_bytes(),
            });
        }

        Ok(entries)
    }
}

struct RawEntry {
    path: String,
    component: &'static str,
    raw: Vec<u8>,
}

struct BuildOutput {
    artifact_path: PathBuf,
    size_bytes: u64,
    baseline_package_id: Option<Uuid>,
}

fn artifact_size(path: &Path) -> Result<u64> {
    let metadata = std::fs::metadata(path)?;
    if metadata.is_file() {
        return Ok(metadata.len());
    }
    let mut total = 0;
    for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            total += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(total)
}

/// Operator-facing README shipped with the `docs` component.
fn render_readme(record: &DeploymentPackage, components: &PackageComponents) -> String {
    let mut doc = String::new();
    doc.push_str(&format!("# Deployment package: {}\n\n", record.nome));
    doc.push_str(&format!("- Code: {}\n", record.package_code));
    doc.push_str(&format!("- Version: {}\n", record.versao));
    doc.push_str(&format!("- Tenant: {}\n", record.tenant_id));
    doc.push_str(&format!(
        "- Created: {}\n",
        record.created_at.to_rfc3339()
    ));
    if !record.descricao.is_empty() {
        doc.push_str(&format!("\n{}\n", record.descricao));
    }
    doc.push_str("\n## Components\n\n");
    for name in components.names() {
        doc.push_str(&format!("- {}\n", name));
    }
    doc.push_str("\nRestore with the provsync CLI: `provsync package restore <id> --target <dir>`.\n");
    doc
}
