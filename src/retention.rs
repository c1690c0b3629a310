// Retention pruning for completed packages.
//
// Deletes completed packages older than the policy horizon, with two
// carve-outs: a baseline referenced by any still-retained delta stays
// (chains are kept whole), and a package marked by an in-progress
// restore is never touched.

use crate::error::Result;
use crate::model::{PackageStatus, PruneReport, RetentionPolicy};
use crate::package::registry::PackageRegistry;
use chrono::Utc;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

pub struct RetentionManager {
    registry: Arc<PackageRegistry>,
}

impl RetentionManager {
    pub fn new(registry: Arc<PackageRegistry>) -> Self {
        Self { registry }
    }

    /// Apply a retention policy to one tenant's completed packages.
    pub fn prune(&self, tenant: &str, policy: RetentionPolicy) -> Result<PruneReport> {
        let cutoff = Utc::now() - policy.horizon();
        let packages = self.registry.list(tenant)?;

        let completed: Vec<_> = packages
            .into_iter()
            .filter(|p| p.status == PackageStatus::Completed)
            .collect();

        let mut report = PruneReport {
            examined: completed.len(),
            ..PruneReport::default()
        };

        // Keep everything inside the horizon, then grow the keep set along
        // baseline edges until stable: a retained delta keeps its whole
        // ancestry alive.
        let mut keep: HashSet<Uuid> = completed
            .iter()
            .filter(|p| p.created_at >= cutoff)
            .map(|p| p.id)
            .collect();
        loop {
            let mut grew = false;
            for package in &completed {
                if keep.contains(&package.id) {
                    if let Some(baseline) = package.baseline_package_id {
                        if keep.insert(baseline) {
                            grew = true;
                        }
                    }
                }
            }
            if !grew {
                break;
            }
        }

        for package in &completed {
            if package.created_at >= cutoff {
                continue;
            }
            if keep.contains(&package.id) {
                report.kept_as_baseline.push(package.id);
                continue;
            }
            if self.registry.restore_in_progress(package.id)? {
                report.kept_in_restore.push(package.id);
                continue;
            }

            if let Some(artifact) = &package.artifact_path {
                remove_artifact(artifact)?;
            }
            self.registry.remove(package.id)?;
            report.bytes_freed += package.size_bytes;
            report.pruned.push(package.id);
            tracing::info!(
                "Pruned package {} for tenant {} ({} freed)",
                package.package_code,
                tenant,
                crate::error::format_bytes(package.size_bytes)
            );
        }

        Ok(report)
    }
}

fn remove_artifact(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if path.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::CompressionLevel;
    use crate::model::{DeploymentPackage, PackageComponents, PackageFormat};
    use chrono::Duration;

    fn package(tenant: &str, age_days: i64, baseline: Option<Uuid>) -> DeploymentPackage {
        DeploymentPackage {
            id: Uuid::new_v4(),
            nome: "pkg".to_string(),
            versao: "1.0.0".to_string(),
            descricao: String::new(),
            tenant_id: tenant.to_string(),
            status: PackageStatus::Completed,
            created_at: Utc::now() - Duration::days(age_days),
            size_bytes: 1024,
            format: PackageFormat::Zip,
            components: PackageComponents {
                data: true,
                ..PackageComponents::default()
            },
            compression: CompressionLevel::Standard,
            encrypted: false,
            baseline_package_id: baseline,
            package_code: format!("PKG_{}_{}", tenant, Uuid::new_v4().simple()),
            artifact_path: None,
            error_message: None,
        }
    }

    fn manager() -> (RetentionManager, Arc<PackageRegistry>) {
        let registry = Arc::new(PackageRegistry::open_in_memory().unwrap());
        (RetentionManager::new(Arc::clone(&registry)), registry)
    }

    #[test]
    fn test_prunes_expired_packages() {
        let (manager, registry) = manager();
        let old = package("acme", 45, None);
        let fresh = package("acme", 2, None);
        registry.insert(&old).unwrap();
        registry.insert(&fresh).unwrap();

        let report = manager.prune("acme", RetentionPolicy::Days30).unwrap();
        assert_eq!(report.pruned, vec![old.id]);
        assert_eq!(report.bytes_freed, 1024);
        assert!(registry.get(old.id).unwrap().is_none());
        assert!(registry.get(fresh.id).unwrap().is_some());
    }

    #[test]
    fn test_baseline_of_retained_delta_survives() {
        let (manager, registry) = manager();
        // P1 is past the horizon; P2 is a retained delta built on P1
        let baseline = package("acme", 45, None);
        let delta = package("acme", 2, Some(baseline.id));
        registry.insert(&baseline).unwrap();
        registry.insert(&delta).unwrap();

        let report = manager.prune("acme", RetentionPolicy::Days30).unwrap();
        assert!(report.pruned.is_empty());
        assert_eq!(report.kept_as_baseline, vec![baseline.id]);
        assert!(registry.get(baseline.id).unwrap().is_some());
    }

    #[test]
    fn test_whole_chain_kept_transitively() {
        let (manager, registry) = manager();
        // Root <- mid-delta <- fresh delta; root and mid are both expired
        let root = package("acme", 120, None);
        let mid = package("acme", 60, Some(root.id));
        let tip = package("acme", 1, Some(mid.id));
        registry.insert(&root).unwrap();
        registry.insert(&mid).unwrap();
        registry.insert(&tip).unwrap();

        let report = manager.prune("acme", RetentionPolicy::Days30).unwrap();
        assert!(report.pruned.is_empty());
        assert!(registry.get(root.id).unwrap().is_some());
        assert!(registry.get(mid.id).unwrap().is_some());
    }

    #[test]
    fn test_expired_chain_pruned_together() {
        let (manager, registry) = manager();
        let root = package("acme", 120, None);
        let delta = package("acme", 90, Some(root.id));
        registry.insert(&root).unwrap();
        registry.insert(&delta).unwrap();

        let report = manager.prune("acme", RetentionPolicy::Days30).unwrap();
        assert_eq!(report.pruned.len(), 2);
        assert!(registry.get(root.id).unwrap().is_none());
        assert!(registry.get(delta.id).unwrap().is_none());
    }

    #[test]
    fn test_restore_in_progress_is_spared() {
        let (manager, registry) = manager();
        let old = package("acme", 45, None);
        registry.insert(&old).unwrap();
        registry.set_restore_in_progress(old.id, true).unwrap();

        let report = manager.prune("acme", RetentionPolicy::Days30).unwrap();
        assert!(report.pruned.is_empty());
        assert_eq!(report.kept_in_restore, vec![old.id]);
        assert!(registry.get(old.id).unwrap().is_some());

        registry.set_restore_in_progress(old.id, false).unwrap();
        let report = manager.prune("acme", RetentionPolicy::Days30).unwrap();
        assert_eq!(report.pruned, vec![old.id]);
    }

    #[test]
    fn test_non_completed_packages_untouched() {
        let (manager, registry) = manager();
        let mut failed = package("acme", 400, None);
        failed.status = PackageStatus::Error;
        registry.insert(&failed).unwrap();

        let report = manager.prune("acme", RetentionPolicy::Days7).unwrap();
        assert_eq!(report.examined, 0);
        assert!(registry.get(failed.id).unwrap().is_some());
    }

    #[test]
    fn test_policies_scope_the_horizon() {
        let (manager, registry) = manager();
        let pkg = package("acme", 10, None);
        registry.insert(&pkg).unwrap();

        assert!(manager
            .prune("acme", RetentionPolicy::Days30)
            .unwrap()
            .pruned
            .is_empty());
        assert_eq!(
            manager.prune("acme", RetentionPolicy::Days7).unwrap().pruned,
            vec![pkg.id]
        );
    }
}
