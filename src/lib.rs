//! Tenant data synchronization and deployment packaging engine.
//!
//! The engine reconciles a central dataset with distributed client copies
//! under concurrent mutation (change tracking, field-level diffing,
//! policy-driven conflict resolution) and assembles verifiable, versioned,
//! optionally compressed/encrypted deployment packages, including
//! incremental deltas, with policy-based retention.
//!
//! The dashboard consumes the strongly-typed API re-exported here and
//! polls durable status records; nothing is pushed.

pub mod compress;
pub mod config;
pub mod error;
pub mod model;
pub mod package;
pub mod retention;
pub mod store;
pub mod sync;
pub mod tracker;

pub use config::Config;
pub use error::{EngineError, Result};
pub use model::{
    ConflictRecord, DeploymentPackage, Direction, OperationType, PackageConfig, PackageFormat,
    PackageStatus, PruneReport, Record, ResolutionStrategy, RetentionPolicy, SessionStatus,
    SyncCheckpoint, SyncConfig, SyncItem, SyncSession, SyncStatus,
};
pub use package::registry::PackageRegistry;
pub use package::{PackageBuilder, RestoreReport};
pub use retention::RetentionManager;
pub use sync::session::SessionDb;
pub use sync::{SyncEndpoint, SyncEngine};
pub use tracker::{ChangeTracker, FieldDiff};
