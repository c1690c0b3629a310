use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("A sync session is already running for tenant '{tenant}'\nWait for it to finish and poll its status, or use force sync to replace it.")]
    AlreadyRunning { tenant: String },

    #[error("No sync session found for tenant '{tenant}'")]
    SessionNotFound { tenant: String },

    #[error("Conflict {id} not found")]
    ConflictNotFound { id: String },

    #[error("Conflict {id} was already resolved")]
    ConflictAlreadyResolved { id: String },

    #[error("Sync session for tenant '{tenant}' exceeded the {limit_secs}s limit and was aborted\nCheckpoints were left at their last committed values; the session is safe to retry.")]
    SessionTimeout { tenant: String, limit_secs: u64 },

    #[error("Storage unreachable during {context}\nCause: {source}\nThe operation was aborted with checkpoints untouched; retry once storage is reachable.")]
    Storage {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record '{record_id}' in table '{table}' failed validation: {reason}")]
    Validation {
        table: String,
        record_id: String,
        reason: String,
    },

    #[error("Invalid package configuration: {0}")]
    InvalidPackageConfig(String),

    #[error("Package {id} not found")]
    PackageNotFound { id: String },

    #[error("Package build failed: {0}\nNo artifact was published.")]
    Build(String),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Package {id} failed verification: {detail}")]
    Verification { id: String, detail: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Transient infrastructure failures are safe to retry after the
    /// environment recovers; everything else needs an input change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Storage { .. } | EngineError::Io(_) | EngineError::Db(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Format bytes for human-readable display
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let already = EngineError::AlreadyRunning {
            tenant: "acme".to_string(),
        };
        assert!(!already.is_transient());

        let storage = EngineError::Storage {
            context: "listing table personas".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "unreachable"),
        };
        assert!(storage.is_transient());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }
}
