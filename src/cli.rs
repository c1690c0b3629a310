use clap::{Args, Parser, Subcommand};
use provsync::compress::CompressionLevel;
use provsync::model::{Direction, PackageFormat, ResolutionStrategy, RetentionPolicy};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "provsync")]
#[command(about = "Tenant data synchronization and deployment packaging", long_about = None)]
#[command(version)]
#[command(after_help = "EXAMPLES:
    # Incremental bidirectional sync, wait for completion
    provsync sync start --tenant acme --wait

    # Full sync with timestamp conflict resolution
    provsync sync start --tenant acme --full --strategy timestamp

    # Poll current status / history
    provsync sync status --tenant acme
    provsync sync history --tenant acme

    # Manual conflict review
    provsync conflicts list --tenant acme
    provsync conflicts resolve 6e4d... --value '\"ana@acme.com\"'

    # Build an encrypted zip package
    provsync package build --tenant acme --nome \"acme full\" --versao 1.0.0 \\
        --encriptacao --senha s3cret

    # Incremental (delta) package against the latest completed one
    provsync package build --tenant acme --nome \"acme delta\" --versao 1.0.1 --incremental

    # Restore and verify
    provsync package restore 6e4d... --target /tmp/restored
    provsync package verify 6e4d...

    # Apply the 30-day retention policy
    provsync prune --tenant acme --policy 30d")]
pub struct Cli {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Data directory (databases, stores, package artifacts)
    #[arg(long, env = "PROVSYNC_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Config file (default: ~/.config/provsync/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sync sessions between the central and client datasets
    Sync {
        #[command(subcommand)]
        command: SyncCommand,
    },
    /// Inspect and resolve manual-review conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictsCommand,
    },
    /// Build, list, verify, and restore deployment packages
    Package {
        #[command(subcommand)]
        command: PackageCommand,
    },
    /// Prune expired packages under a retention policy
    Prune {
        #[arg(long)]
        tenant: String,

        /// 7d, 30d, 90d, or 365d
        #[arg(long)]
        policy: RetentionPolicy,
    },
}

#[derive(Subcommand, Debug)]
pub enum SyncCommand {
    /// Start a sync session
    Start {
        #[arg(long)]
        tenant: String,

        /// Full sync instead of incremental
        #[arg(long)]
        full: bool,

        /// bidirectional, central_to_client, or client_to_central
        #[arg(long, default_value = "bidirectional")]
        direction: Direction,

        /// central_wins, client_wins, timestamp, or manual_review
        #[arg(long, default_value = "manual_review")]
        strategy: ResolutionStrategy,

        /// Block and show progress until the session finishes
        #[arg(long)]
        wait: bool,

        /// Re-run the sync every N seconds until interrupted
        #[arg(long, value_name = "SECONDS")]
        interval: Option<u64>,
    },
    /// Show the current status surface for a tenant
    Status {
        #[arg(long)]
        tenant: String,
    },
    /// Pause the running session (partial counts are kept)
    Stop {
        #[arg(long)]
        tenant: String,
    },
    /// Stop any active session, then run a fresh full sync
    Force {
        #[arg(long)]
        tenant: String,
    },
    /// List past sessions, newest first
    History {
        #[arg(long)]
        tenant: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConflictsCommand {
    /// Unresolved conflicts awaiting operator review
    List {
        #[arg(long)]
        tenant: String,
    },
    /// Resolve a conflict with an explicit chosen value (JSON)
    Resolve {
        /// Conflict id
        id: Uuid,

        /// Winning value as JSON, e.g. '"ana@acme.com"' or '42'
        #[arg(long)]
        value: String,
    },
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[arg(long)]
    pub tenant: String,

    #[arg(long)]
    pub nome: String,

    /// Semantic version, MAJOR.MINOR.PATCH
    #[arg(long)]
    pub versao: String,

    #[arg(long, default_value = "")]
    pub descricao: String,

    /// Leave the schema out of the package
    #[arg(long)]
    pub no_schema: bool,

    /// Leave table data out of the package
    #[arg(long)]
    pub no_data: bool,

    /// Leave image assets out of the package
    #[arg(long)]
    pub no_images: bool,

    /// Leave workflow definitions out of the package
    #[arg(long)]
    pub no_workflows: bool,

    /// Leave generated documentation out of the package
    #[arg(long)]
    pub no_docs: bool,

    /// zip, tar, or folder
    #[arg(long, default_value = "zip")]
    pub formato: PackageFormat,

    /// none, standard, or maximum
    #[arg(long, default_value = "standard")]
    pub compressao: CompressionLevel,

    /// Encrypt the payload (requires --senha)
    #[arg(long)]
    pub encriptacao: bool,

    /// Encryption passphrase
    #[arg(long)]
    pub senha: Option<String>,

    /// Build a delta against the latest completed package
    #[arg(long)]
    pub incremental: bool,

    /// Retention policy recorded with the request: 7d, 30d, 90d, 365d
    #[arg(long, default_value = "30d")]
    pub retention: RetentionPolicy,
}

#[derive(Subcommand, Debug)]
pub enum PackageCommand {
    /// Assemble a deployment package
    Build(BuildArgs),
    /// List packages for a tenant, newest first
    List {
        #[arg(long)]
        tenant: String,
    },
    /// Recompute payload checksums against the manifest
    Verify {
        /// Package id
        id: Uuid,

        /// Passphrase for encrypted packages
        #[arg(long)]
        senha: Option<String>,
    },
    /// Restore a package (and its baseline chain) into a directory store
    Restore {
        /// Package id
        id: Uuid,

        /// Target directory for the restored dataset
        #[arg(long)]
        target: PathBuf,

        /// Passphrase for encrypted packages
        #[arg(long)]
        senha: Option<String>,
    },
}
