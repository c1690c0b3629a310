// End-to-end package build, restore, verify, and retention behavior.

use chrono::Utc;
use provsync::compress::CompressionLevel;
use provsync::model::{
    PackageConfig, PackageFormat, PackageStatus, Record, ResolutionStrategy, RetentionPolicy,
};
use provsync::package::registry::PackageRegistry;
use provsync::store::memory::{MemoryBlobStore, MemoryStore};
use provsync::store::{BlobStore, RecordStore};
use provsync::{PackageBuilder, RetentionManager};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

const TENANT: &str = "acme";

fn base_config() -> PackageConfig {
    PackageConfig {
        nome: "acme provisioning".to_string(),
        versao: "1.0.0".to_string(),
        descricao: "fixture package".to_string(),
        tenant_id: TENANT.to_string(),
        incluir_esquema: true,
        incluir_dados: true,
        incluir_imagens: false,
        incluir_workflows: false,
        incluir_documentacao: false,
        formato_saida: PackageFormat::Zip,
        compressao: CompressionLevel::Standard,
        encriptacao: false,
        senha_encriptacao: None,
        backup_incremental: false,
        retention_policy: RetentionPolicy::Days30,
        conflict_resolution: ResolutionStrategy::ManualReview,
    }
}

/// Fixture dataset: 3 tables with 10 records each, plus a schema.
fn seed_fixture(store: &MemoryStore) {
    store.set_schema(
        TENANT,
        "CREATE TABLE personas (id uuid);\nCREATE TABLE workflows (id uuid);\nCREATE TABLE metas (id uuid);",
    );
    for table in ["personas", "workflows", "metas"] {
        for i in 0..10u64 {
            let record = Record::new(format!("{}-{}", table, i), i + 1)
                .with_field("name", json!(format!("{} item {}", table, i)))
                .with_field("index", json!(i));
            store.put(TENANT, table, record).unwrap();
        }
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    blobs: Arc<MemoryBlobStore>,
    builder: Arc<PackageBuilder>,
    registry: Arc<PackageRegistry>,
    _dir: TempDir,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    seed_fixture(&store);
    let blobs = Arc::new(MemoryBlobStore::new());
    let registry = Arc::new(PackageRegistry::open_in_memory().unwrap());
    let dir = TempDir::new().unwrap();
    let builder = Arc::new(
        PackageBuilder::new(
            store.clone(),
            blobs.clone(),
            registry.clone(),
            dir.path().join("packages"),
        )
        .unwrap(),
    );
    Fixture {
        store,
        blobs,
        builder,
        registry,
        _dir: dir,
    }
}

fn assert_dataset_matches(source: &MemoryStore, restored: &MemoryStore) {
    assert_eq!(
        source.schema(TENANT).unwrap(),
        restored.schema(TENANT).unwrap()
    );
    for table in source.tables(TENANT).unwrap() {
        let mut original = source.list(TENANT, &table, None).unwrap();
        let mut recovered = restored.list(TENANT, &table, None).unwrap();
        original.sort_by(|a, b| a.id.cmp(&b.id));
        recovered.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(original, recovered, "table {} diverged after restore", table);
    }
}

// Round trip: schema + data for 3 tables x 10 records restore to the
// exact same 30 records with identical field values.
#[test]
fn test_package_round_trip() {
    let f = fixture();
    let package = f.builder.build(&base_config()).unwrap();
    assert_eq!(package.status, PackageStatus::Completed);

    let target = MemoryStore::new();
    let target_blobs = MemoryBlobStore::new();
    let report = f
        .builder
        .restore_into(package.id, &target, &target_blobs, None)
        .unwrap();

    assert_eq!(report.packages_applied, vec![package.id]);
    assert_eq!(report.tables_restored, 3);
    assert_eq!(report.records_restored, 30);
    assert!(report.schema_restored);
    assert_dataset_matches(&f.store, &target);
}

// Every output format and compression level round-trips identically.
#[test]
fn test_all_formats_and_levels_round_trip() {
    for format in [PackageFormat::Zip, PackageFormat::Tar, PackageFormat::Folder] {
        for level in [
            CompressionLevel::None,
            CompressionLevel::Standard,
            CompressionLevel::Maximum,
        ] {
            let f = fixture();
            let mut cfg = base_config();
            cfg.formato_saida = format;
            cfg.compressao = level;

            let package = f.builder.build(&cfg).unwrap();
            let target = MemoryStore::new();
            f.builder
                .restore_into(package.id, &target, &MemoryBlobStore::new(), None)
                .unwrap();
            assert_dataset_matches(&f.store, &target);
        }
    }
}

#[test]
fn test_encrypted_round_trip_and_wrong_passphrase() {
    let f = fixture();
    f.blobs.put(TENANT, "images/logo.png", b"fake-png").unwrap();
    f.blobs
        .put(TENANT, "workflows/onboarding.json", b"{\"nodes\":[]}")
        .unwrap();

    let mut cfg = base_config();
    cfg.incluir_imagens = true;
    cfg.incluir_workflows = true;
    cfg.encriptacao = true;
    cfg.senha_encriptacao = Some("correct horse".to_string());
    cfg.compressao = CompressionLevel::Maximum;

    let package = f.builder.build(&cfg).unwrap();
    assert!(package.encrypted);

    // Without the passphrase the payload is inaccessible
    let target = MemoryStore::new();
    let target_blobs = MemoryBlobStore::new();
    assert!(f
        .builder
        .restore_into(package.id, &target, &target_blobs, None)
        .is_err());
    assert!(f
        .builder
        .restore_into(package.id, &target, &target_blobs, Some("wrong"))
        .is_err());

    // With it, the full dataset and assets come back
    let report = f
        .builder
        .restore_into(package.id, &target, &target_blobs, Some("correct horse"))
        .unwrap();
    assert_dataset_matches(&f.store, &target);
    assert_eq!(report.blobs_restored, 2);
    assert_eq!(
        target_blobs.get(TENANT, "images/logo.png").unwrap(),
        b"fake-png"
    );
    assert_eq!(
        target_blobs.get(TENANT, "workflows/onboarding.json").unwrap(),
        b"{\"nodes\":[]}"
    );
}

// Delta packages carry only records changed since the baseline and
// restore on top of their chain.
#[test]
fn test_delta_build_and_chain_restore() {
    let f = fixture();
    let baseline = f.builder.build(&base_config()).unwrap();

    // Mutate one record and add another after the baseline
    std::thread::sleep(std::time::Duration::from_millis(10));
    let mut changed = f
        .store
        .get(TENANT, "personas", "personas-0")
        .unwrap()
        .unwrap();
    changed
        .fields
        .insert("name".to_string(), json!("renamed after baseline"));
    changed.version += 1;
    changed.updated_at = Utc::now();
    f.store.put(TENANT, "personas", changed).unwrap();
    f.store
        .put(
            TENANT,
            "personas",
            Record::new("personas-10", 12).with_field("name", json!("new hire")),
        )
        .unwrap();

    let mut cfg = base_config();
    cfg.backup_incremental = true;
    cfg.versao = "1.0.1".to_string();
    let delta = f.builder.build(&cfg).unwrap();
    assert_eq!(delta.baseline_package_id, Some(baseline.id));

    // The delta's data payload carries only the changed table/records
    let entries = provsync::package::archive::read_all(
        delta.artifact_path.as_ref().unwrap(),
        delta.format,
    )
    .unwrap();
    let data_entries: Vec<&str> = entries
        .keys()
        .map(|k| k.as_str())
        .filter(|k| k.starts_with("payload/data/"))
        .collect();
    assert_eq!(data_entries, vec!["payload/data/personas.json"]);

    // Chain restore: baseline first, then the delta on top
    let target = MemoryStore::new();
    let report = f
        .builder
        .restore_into(delta.id, &target, &MemoryBlobStore::new(), None)
        .unwrap();
    assert_eq!(report.packages_applied, vec![baseline.id, delta.id]);
    assert_dataset_matches(&f.store, &target);
    assert_eq!(target.record_count(TENANT, "personas"), 11);
}

#[test]
fn test_verify_detects_tampering() {
    let f = fixture();
    let mut cfg = base_config();
    cfg.formato_saida = PackageFormat::Folder;
    let package = f.builder.build(&cfg).unwrap();

    f.builder.verify(package.id, None).unwrap();

    // Flip bytes in one payload file
    let artifact = package.artifact_path.as_ref().unwrap();
    let payload = artifact.join("payload/data/personas.json");
    let mut bytes = std::fs::read(&payload).unwrap();
    bytes[0] ^= 0xFF;
    std::fs::write(&payload, bytes).unwrap();

    let err = f.builder.verify(package.id, None).unwrap_err();
    assert!(matches!(err, provsync::EngineError::Verification { .. }));
}

// Retention with real artifacts: an expired package's artifact is
// removed, but a baseline referenced by a retained delta survives.
#[test]
fn test_retention_prunes_artifacts_and_keeps_chains() {
    let f = fixture();
    let retention = RetentionManager::new(f.registry.clone());

    let baseline = f.builder.build(&base_config()).unwrap();
    let mut cfg = base_config();
    cfg.backup_incremental = true;
    let delta = f.builder.build(&cfg).unwrap();

    // An unrelated expired package with a real artifact on disk
    let mut cfg = base_config();
    cfg.nome = "stale".to_string();
    let stale = f.builder.build(&cfg).unwrap();
    let stale_artifact = stale.artifact_path.clone().unwrap();
    assert!(stale_artifact.exists());

    // Age the baseline and the stale package past the horizon. The
    // registry clock is what retention sees, so rewrite created_at there.
    age_package(&f.registry, baseline.id, 45);
    age_package(&f.registry, stale.id, 45);

    let report = retention.prune(TENANT, RetentionPolicy::Days30).unwrap();
    assert_eq!(report.pruned, vec![stale.id]);
    assert!(report.kept_as_baseline.contains(&baseline.id));
    assert!(!stale_artifact.exists());

    // The chain is still restorable
    let target = MemoryStore::new();
    f.builder
        .restore_into(delta.id, &target, &MemoryBlobStore::new(), None)
        .unwrap();
}

/// Shift a package's created_at into the past, bypassing immutability
/// the way a long-lived deployment would have aged naturally.
fn age_package(registry: &PackageRegistry, id: uuid::Uuid, days: i64) {
    let package = registry.get(id).unwrap().unwrap();
    registry.remove(id).unwrap();
    let aged = provsync::DeploymentPackage {
        created_at: Utc::now() - chrono::Duration::days(days),
        ..package
    };
    registry.insert(&aged).unwrap();
}

#[test]
fn test_background_build_is_pollable() {
    let f = fixture();
    let pending = f.builder.clone().start_build(&base_config()).unwrap();
    assert!(matches!(
        pending.status,
        PackageStatus::Pending | PackageStatus::Building
    ));

    // Poll the registry until the terminal state appears
    let package = loop {
        let current = f.registry.get(pending.id).unwrap().unwrap();
        if matches!(current.status, PackageStatus::Completed | PackageStatus::Error) {
            break current;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    };
    assert_eq!(package.status, PackageStatus::Completed);
    assert!(package.artifact_path.unwrap().exists());
}
