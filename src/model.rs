// Core data model shared by the sync and packaging subsystems.
//
// Request/response field names (`nome`, `incluir_*`, `formato_saida`, ...)
// are part of the dashboard contract and kept verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// A single record as seen by the tenant-scoped record store.
///
/// `version` is a per-record monotonic counter maintained by the store;
/// `updated_at` is the record-level last-modified time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub fields: BTreeMap<String, Value>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub fn new(id: impl Into<String>, version: u64) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
            version,
            updated_at: Utc::now(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Cheap fingerprint used to skip field-by-field comparison when two
    /// copies are identical.
    pub fn fingerprint(&self) -> u64 {
        let mut buf = Vec::new();
        for (name, value) in &self.fields {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
            buf.extend_from_slice(value.to_string().as_bytes());
            buf.push(0);
        }
        xxhash_rust::xxh3::xxh3_64(&buf)
    }
}

/// Sync operation scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Full,
    Incremental,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            _ => Err(format!("Unknown operation type: {}", s)),
        }
    }
}

/// Which way records flow during a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Bidirectional,
    CentralToClient,
    ClientToCentral,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bidirectional => "bidirectional",
            Self::CentralToClient => "central_to_client",
            Self::ClientToCentral => "client_to_central",
        }
    }

    /// Whether changes originating on the central side may be applied.
    pub fn pushes_central(&self) -> bool {
        matches!(self, Self::Bidirectional | Self::CentralToClient)
    }

    /// Whether changes originating on the client side may be applied.
    pub fn pushes_client(&self) -> bool {
        matches!(self, Self::Bidirectional | Self::ClientToCentral)
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bidirectional" => Ok(Self::Bidirectional),
            "central_to_client" => Ok(Self::CentralToClient),
            "client_to_central" => Ok(Self::ClientToCentral),
            _ => Err(format!("Unknown sync direction: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Completed,
    Error,
    Paused,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Paused => "paused",
        }
    }

    /// Terminal states are sticky: pollers may observe them at any later
    /// time until the session record is explicitly purged.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

/// Conflict resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    CentralWins,
    ClientWins,
    Timestamp,
    ManualReview,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CentralWins => "central_wins",
            Self::ClientWins => "client_wins",
            Self::Timestamp => "timestamp",
            Self::ManualReview => "manual_review",
        }
    }
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "central_wins" => Ok(Self::CentralWins),
            "client_wins" => Ok(Self::ClientWins),
            "timestamp" => Ok(Self::Timestamp),
            "manual_review" => Ok(Self::ManualReview),
            _ => Err(format!("Unknown resolution strategy: {}", s)),
        }
    }
}

/// Per-record operation classified during diffing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOperation {
    Insert,
    Update,
    Delete,
}

impl RecordOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for RecordOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(format!("Unknown record operation: {}", s)),
        }
    }
}

/// Request shape for starting a sync session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub operation_type: OperationType,
    pub direction: Direction,
    pub conflict_resolution_strategy: ResolutionStrategy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            operation_type: OperationType::Incremental,
            direction: Direction::Bidirectional,
            conflict_resolution_strategy: ResolutionStrategy::ManualReview,
        }
    }
}

/// Last synchronized version marker, one per (tenant, table).
///
/// Owned exclusively by the change tracker and advanced only after a sync
/// session commits; advancement is monotonic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub tenant_id: String,
    pub table_name: String,
    pub last_version_seen: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: Uuid,
    pub tenant_id: String,
    pub operation_type: OperationType,
    pub direction: Direction,
    pub status: SessionStatus,
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Append-only per-table summary row for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
    pub session_id: Uuid,
    pub table_name: String,
    pub operation: RecordOperation,
    pub records_count: u64,
    pub success_count: u64,
    pub error_count: u64,
}

/// A field changed on both sides since the last checkpoint.
///
/// Never deleted; resolution marks it resolved and records the strategy,
/// preserving the audit trail. The modification timestamps are copied from
/// the change logs so the `timestamp` strategy has explicit comparison
/// fields and no wall-clock dependence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub table_name: String,
    pub record_id: String,
    pub field_name: String,
    pub local_value: Value,
    pub remote_value: Value,
    pub local_modified_at: DateTime<Utc>,
    pub remote_modified_at: DateTime<Utc>,
    pub resolved: bool,
    pub strategy_applied: Option<ResolutionStrategy>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Aggregate status surface polled by the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub status: SessionStatus,
    pub progress: u8,
    pub sync_items: Vec<SyncItem>,
    pub conflicts: Vec<ConflictRecord>,
}

impl SyncStatus {
    pub fn idle() -> Self {
        Self {
            status: SessionStatus::Idle,
            progress: 0,
            sync_items: Vec::new(),
            conflicts: Vec::new(),
        }
    }
}

/// Package output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageFormat {
    Zip,
    Tar,
    Folder,
}

impl PackageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Tar => "tar",
            Self::Folder => "folder",
        }
    }

    /// File extension for archive formats; folders have none.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Self::Zip => Some("zip"),
            Self::Tar => Some("tar"),
            Self::Folder => None,
        }
    }
}

impl FromStr for PackageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "zip" => Ok(Self::Zip),
            "tar" => Ok(Self::Tar),
            "folder" => Ok(Self::Folder),
            _ => Err(format!("Unknown package format: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Pending,
    Building,
    Completed,
    Error,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl FromStr for PackageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "building" => Ok(Self::Building),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown package status: {}", s)),
        }
    }
}

/// Data domains a package may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PackageComponents {
    pub schema: bool,
    pub data: bool,
    pub images: bool,
    pub workflows: bool,
    pub docs: bool,
}

impl PackageComponents {
    pub fn any(&self) -> bool {
        self.schema || self.data || self.images || self.workflows || self.docs
    }

    /// Component names in manifest order.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.schema {
            names.push("schema");
        }
        if self.data {
            names.push("data");
        }
        if self.images {
            names.push("images");
        }
        if self.workflows {
            names.push("workflows");
        }
        if self.docs {
            names.push("docs");
        }
        names
    }
}

/// Pruning horizon for completed packages, applied per tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicy {
    #[serde(rename = "7d")]
    Days7,
    #[serde(rename = "30d")]
    Days30,
    #[serde(rename = "90d")]
    Days90,
    #[serde(rename = "365d")]
    Days365,
}

impl RetentionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Days7 => "7d",
            Self::Days30 => "30d",
            Self::Days90 => "90d",
            Self::Days365 => "365d",
        }
    }

    pub fn horizon(&self) -> chrono::Duration {
        let days = match self {
            Self::Days7 => 7,
            Self::Days30 => 30,
            Self::Days90 => 90,
            Self::Days365 => 365,
        };
        chrono::Duration::days(days)
    }
}

impl FromStr for RetentionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "7d" => Ok(Self::Days7),
            "30d" => Ok(Self::Days30),
            "90d" => Ok(Self::Days90),
            "365d" => Ok(Self::Days365),
            _ => Err(format!(
                "Unknown retention policy '{}'. Use 7d, 30d, 90d, or 365d",
                s
            )),
        }
    }
}

/// Package build request as submitted by the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageConfig {
    pub nome: String,
    pub versao: String,
    pub descricao: String,
    pub tenant_id: String,
    pub incluir_esquema: bool,
    pub incluir_dados: bool,
    pub incluir_imagens: bool,
    pub incluir_workflows: bool,
    pub incluir_documentacao: bool,
    pub formato_saida: PackageFormat,
    pub compressao: crate::compress::CompressionLevel,
    pub encriptacao: bool,
    pub senha_encriptacao: Option<String>,
    pub backup_incremental: bool,
    pub retention_policy: RetentionPolicy,
    pub conflict_resolution: ResolutionStrategy,
}

impl PackageConfig {
    pub fn components(&self) -> PackageComponents {
        PackageComponents {
            schema: self.incluir_esquema,
            data: self.incluir_dados,
            images: self.incluir_imagens,
            workflows: self.incluir_workflows,
            docs: self.incluir_documentacao,
        }
    }
}

/// A built (or in-flight) deployment package. Immutable once `completed`;
/// superseded packages are only ever pruned, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPackage {
    pub id: Uuid,
    pub nome: String,
    pub versao: String,
    pub descricao: String,
    pub tenant_id: String,
    pub status: PackageStatus,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub format: PackageFormat,
    pub components: PackageComponents,
    pub compression: crate::compress::CompressionLevel,
    pub encrypted: bool,
    pub baseline_package_id: Option<Uuid>,
    /// Operator-facing handle, `PKG_<tenant>_<timestamp>`.
    pub package_code: String,
    /// Downloadable artifact handle once the build completes.
    pub artifact_path: Option<PathBuf>,
    pub error_message: Option<String>,
}

impl DeploymentPackage {
    pub fn is_delta(&self) -> bool {
        self.baseline_package_id.is_some()
    }
}

/// Outcome of a retention pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PruneReport {
    pub examined: usize,
    pub pruned: Vec<Uuid>,
    pub kept_as_baseline: Vec<Uuid>,
    pub kept_in_restore: Vec<Uuid>,
    pub bytes_freed: u64,
}
