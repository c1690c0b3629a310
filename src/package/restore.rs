// Package restore and verification.
//
// A restore replays a package's payload into target stores. Delta
// packages apply their baseline chain first, oldest package first, so
// the target converges on the state the delta was cut against. Every
// entry is checksum-verified after decryption and decompression.

use crate::compress;
use crate::error::{EngineError, Result};
use crate::model::{DeploymentPackage, PackageStatus, Record};
use crate::package::{archive, crypto, manifest::Manifest, manifest::MANIFEST_NAME};
use crate::package::registry::PackageRegistry;
use crate::store::{BlobStore, RecordStore};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RestoreReport {
    /// Packages applied, oldest first (baseline chain, then the target).
    pub packages_applied: Vec<Uuid>,
    pub tables_restored: usize,
    pub records_restored: u64,
    pub blobs_restored: u64,
    pub schema_restored: bool,
}

/// Restore `package_id` into the target stores.
///
/// The whole chain is marked restore-in-progress for the duration so the
/// retention manager cannot prune any of it mid-restore.
pub fn restore_into(
    registry: &PackageRegistry,
    package_id: Uuid,
    target_store: &dyn RecordStore,
    target_blobs: &dyn BlobStore,
    passphrase: Option<&str>,
) -> Result<RestoreReport> {
    let chain = baseline_chain(registry, package_id)?;

    for package in &chain {
        registry.set_restore_in_progress(package.id, true)?;
    }
    let result = apply_chain(&chain, target_store, target_blobs, passphrase);
    for package in &chain {
        if let Err(e) = registry.set_restore_in_progress(package.id, false) {
            tracing::warn!("Failed to clear restore mark on {}: {}", package.id, e);
        }
    }
    result
}

/// Recompute every payload checksum of a completed package against its
/// manifest.
pub fn verify_package(
    registry: &PackageRegistry,
    package_id: Uuid,
    passphrase: Option<&str>,
) -> Result<()> {
    let package = completed_package(registry, package_id)?;
    let (manifest, entries, key) = open_package(&package, passphrase)?;

    for entry in &manifest.entries {
        let raw = decode_entry(&package, &manifest, &entries, &entry.path, &key)?;
        let actual = crate::package::manifest::checksum(&raw);
        if actual != entry.checksum {
            return Err(EngineError::Verification {
                id: package_id.to_string(),
                detail: format!(
                    "checksum mismatch for {} (expected {}, got {})",
                    entry.path, entry.checksum, actual
                ),
            });
        }
    }
    tracing::info!(
        "Package {} verified: {} entries intact",
        package.package_code,
        manifest.entries.len()
    );
    Ok(())
}

fn apply_chain(
    chain: &[DeploymentPackage],
    target_store: &dyn RecordStore,
    target_blobs: &dyn BlobStore,
    passphrase: Option<&str>,
) -> Result<RestoreReport> {
    let mut report = RestoreReport::default();
    for package in chain {
        apply_package(package, target_store, target_blobs, passphrase, &mut report)?;
        report.packages_applied.push(package.id);
    }
    Ok(report)
}

fn apply_package(
    package: &DeploymentPackage,
    target_store: &dyn RecordStore,
    target_blobs: &dyn BlobStore,
    passphrase: Option<&str>,
    report: &mut RestoreReport,
) -> Result<()> {
    let (manifest, entries, key) = open_package(package, passphrase)?;
    let tenant = &manifest.tenant_id;

    for entry in &manifest.entries {
        let raw = decode_entry(package, &manifest, &entries, &entry.path, &key)?;
        let actual = crate::package::manifest::checksum(&raw);
        if actual != entry.checksum {
            return Err(EngineError::Verification {
                id: package.id.to_string(),
                detail: format!("checksum mismatch for {}", entry.path),
            });
        }

        match entry.component.as_str() {
            "schema" => {
                let ddl = String::from_utf8(raw).map_err(|_| EngineError::Verification {
                    id: package.id.to_string(),
                    detail: "schema payload is not valid UTF-8".to_string(),
                })?;
                target_store.put_schema(tenant, &ddl)?;
                report.schema_restored = true;
            }
            "data" => {
                let table = entry
                    .path
                    .strip_prefix("payload/data/")
                    .and_then(|p| p.strip_suffix(".json"))
                    .ok_or_else(|| EngineError::Verification {
                        id: package.id.to_string(),
                        detail: format!("unexpected data entry path {}", entry.path),
                    })?;
                let records: Vec<Record> = serde_json::from_slice(&raw)?;
                report.tables_restored += 1;
                for record in records {
                    target_store.put(tenant, table, record)?;
                    report.records_restored += 1;
                }
            }
            "images" | "workflows" | "docs" => {
                let name = entry
                    .path
                    .strip_prefix("payload/")
                    .unwrap_or(&entry.path);
                target_blobs.put(tenant, name, &raw)?;
                report.blobs_restored += 1;
            }
            other => {
                tracing::warn!("Skipping unknown component '{}' in {}", other, entry.path);
            }
        }
    }
    Ok(())
}

/// The baseline chain for a package: root baseline first, requested
/// package last. Every member must be completed with an artifact.
fn baseline_chain(
    registry: &PackageRegistry,
    package_id: Uuid,
) -> Result<Vec<DeploymentPackage>> {
    let mut chain = Vec::new();
    let mut cursor = Some(package_id);
    while let Some(id) = cursor {
        // A cycle in baseline references would be registry corruption.
        if chain.iter().any(|p: &DeploymentPackage| p.id == id) {
            return Err(EngineError::Verification {
                id: package_id.to_string(),
                detail: "baseline chain contains a cycle".to_string(),
            });
        }
        let package = completed_package(registry, id)?;
        cursor = package.baseline_package_id;
        chain.push(package);
    }
    chain.reverse();
    Ok(chain)
}

fn completed_package(registry: &PackageRegistry, id: Uuid) -> Result<DeploymentPackage> {
    let package = registry
        .get(id)?
        .ok_or_else(|| EngineError::PackageNotFound { id: id.to_string() })?;
    if package.status != PackageStatus::Completed || package.artifact_path.is_none() {
        return Err(EngineError::Verification {
            id: id.to_string(),
            detail: format!(
                "package is {} and has no restorable artifact",
                package.status.as_str()
            ),
        });
    }
    Ok(package)
}

/// Open an archive, parse the manifest, and derive the package key once
/// when the payload is encrypted.
fn open_package(
    package: &DeploymentPackage,
    passphrase: Option<&str>,
) -> Result<(Manifest, BTreeMap<String, Vec<u8>>, Option<crypto::PackageKey>)> {
    let artifact = package
        .artifact_path
        .as_ref()
        .ok_or_else(|| EngineError::PackageNotFound {
            id: package.id.to_string(),
        })?;
    let entries = archive::read_all(artifact, package.format)?;
    let manifest_bytes = entries
        .get(MANIFEST_NAME)
        .ok_or_else(|| EngineError::Verification {
            id: package.id.to_string(),
            detail: "archive is missing its manifest".to_string(),
        })?;
    let manifest = Manifest::from_bytes(manifest_bytes)?;

    let key = if manifest.encrypted {
        let passphrase = passphrase.ok_or_else(|| {
            EngineError::Crypto("package is encrypted; a passphrase is required".to_string())
        })?;
        let params = manifest.kdf.as_ref().ok_or_else(|| {
            EngineError::Crypto("encrypted manifest lacks KDF parameters".to_string())
        })?;
        Some(crypto::derive_key(passphrase, params)?)
    } else {
        None
    };

    Ok((manifest, entries, key))
}

fn decode_entry(
    package: &DeploymentPackage,
    manifest: &Manifest,
    entries: &BTreeMap<String, Vec<u8>>,
    path: &str,
    key: &Option<crypto::PackageKey>,
) -> Result<Vec<u8>> {
    let stored = entries.get(path).ok_or_else(|| EngineError::Verification {
        id: package.id.to_string(),
        detail: format!("manifest entry {} missing from archive", path),
    })?;

    let compressed = match key {
        Some(key) => crypto::decrypt(key, stored)?,
        None => stored.clone(),
    };

    Ok(compress::decompress(&compressed, manifest.compression)?)
}
