// Package manifest: metadata, component list, and payload checksums.
//
// The manifest is stored unencrypted and uncompressed at the archive root
// so tooling can inspect provenance without the passphrase. It carries no
// tenant data, only metadata and checksums.

use crate::compress::CompressionLevel;
use crate::error::{EngineError, Result};
use crate::model::{PackageComponents, PackageFormat};
use crate::package::crypto::KdfParams;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MANIFEST_NAME: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

/// One payload entry. `checksum` covers the raw bytes, before
/// compression and encryption, so a restore can verify end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Archive-relative path, e.g. `payload/data/personas.json`
    pub path: String,
    /// Component this entry belongs to: schema, data, images, workflows, docs
    pub component: String,
    pub size_bytes: u64,
    pub stored_bytes: u64,
    /// `blake3:<hex>` over the raw bytes
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub manifest_version: u32,
    pub package_id: Uuid,
    pub package_code: String,
    pub nome: String,
    pub versao: String,
    pub descricao: String,
    pub tenant_id: String,
    pub created_at: DateTime<Utc>,
    pub format: PackageFormat,
    pub compression: CompressionLevel,
    pub encrypted: bool,
    /// Present when `encrypted`; parameters to re-derive the key.
    pub kdf: Option<KdfParams>,
    pub baseline_package_id: Option<Uuid>,
    pub components: PackageComponents,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)?;
        if manifest.manifest_version != MANIFEST_VERSION {
            return Err(EngineError::Build(format!(
                "unsupported manifest version {} (expected {})",
                manifest.manifest_version, MANIFEST_VERSION
            )));
        }
        Ok(manifest)
    }

    pub fn total_payload_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.stored_bytes).sum()
    }
}

/// Checksum of raw payload bytes, `blake3:<hex>`.
pub fn checksum(bytes: &[u8]) -> String {
    format!("blake3:{}", hex::encode(blake3::hash(bytes).as_bytes()))
}
