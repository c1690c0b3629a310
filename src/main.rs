mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command, ConflictsCommand, PackageCommand, SyncCommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use provsync::error::format_bytes;
use provsync::model::{OperationType, SessionStatus, SyncConfig, SyncStatus};
use provsync::package::registry::PackageRegistry;
use provsync::store::json::{FsBlobStore, JsonStore};
use provsync::{
    ChangeTracker, Config, PackageBuilder, PackageConfig, RetentionManager, SessionDb,
    SyncEndpoint, SyncEngine,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

/// Everything a command needs, wired from the data directory layout:
/// central/ and client/ record stores, their change logs, the session
/// database, and the package registry + artifact directory.
struct Environment {
    engine: Arc<SyncEngine>,
    builder: Arc<PackageBuilder>,
    retention: RetentionManager,
    registry: Arc<PackageRegistry>,
}

impl Environment {
    fn open(data_dir: &Path, config: &Config) -> Result<Self> {
        let central_store = Arc::new(JsonStore::open(data_dir.join("central"))?);
        let client_store = Arc::new(JsonStore::open(data_dir.join("client"))?);
        let central_tracker = Arc::new(ChangeTracker::open(&data_dir.join("central_changes.db"))?);
        let client_tracker = Arc::new(ChangeTracker::open(&data_dir.join("client_changes.db"))?);
        let sessions = Arc::new(SessionDb::open(&data_dir.join("sessions.db"))?);

        let engine = Arc::new(SyncEngine::new(
            SyncEndpoint::new(central_store.clone(), central_tracker),
            SyncEndpoint::new(client_store.clone(), client_tracker),
            Arc::clone(&sessions),
            Duration::from_secs(config.max_sync_duration_secs),
        ));

        let registry = Arc::new(PackageRegistry::open(&data_dir.join("packages.db"))?);
        let blobs = Arc::new(FsBlobStore::open(data_dir.join("central"))?);
        let builder = Arc::new(PackageBuilder::new(
            central_store,
            blobs,
            Arc::clone(&registry),
            data_dir.join("packages"),
        )?);
        let retention = RetentionManager::new(Arc::clone(&registry));

        Ok(Self {
            engine,
            builder,
            retention,
            registry,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    let config = Config::load(cli.config.as_deref())?;
    let data_dir = config.resolve_data_dir(cli.data_dir.as_deref())?;
    tracing::debug!("Using data dir {}", data_dir.display());
    let env = Environment::open(&data_dir, &config)?;
    let quiet = cli.quiet;

    match cli.command {
        Command::Sync { command } => run_sync_command(&env, command, quiet).await?,
        Command::Conflicts { command } => run_conflicts_command(&env, command)?,
        Command::Package { command } => run_package_command(&env, command).await?,
        Command::Prune { tenant, policy } => {
            let report = env.retention.prune(&tenant, policy)?;
            println!(
                "Examined {} package(s): pruned {}, freed {}",
                report.examined,
                report.pruned.len(),
                format_bytes(report.bytes_freed).green()
            );
            for id in &report.kept_as_baseline {
                println!("  kept {} (baseline of a retained delta)", id);
            }
            for id in &report.kept_in_restore {
                println!("  kept {} (restore in progress)", id);
            }
        }
    }

    Ok(())
}

async fn run_sync_command(env: &Environment, command: SyncCommand, quiet: bool) -> Result<()> {
    match command {
        SyncCommand::Start {
            tenant,
            full,
            direction,
            strategy,
            wait,
            interval,
        } => {
            let config = SyncConfig {
                operation_type: if full {
                    OperationType::Full
                } else {
                    OperationType::Incremental
                },
                direction,
                conflict_resolution_strategy: strategy,
            };

            if let Some(secs) = interval {
                run_periodic(env, &tenant, config, secs, quiet).await?;
                return Ok(());
            }

            let session = env.engine.clone().start_sync(&tenant, config)?;
            if !quiet {
                println!("Started sync session {}", session.id);
            }
            if wait {
                let status = wait_for_completion(env, &tenant, quiet)?;
                print_status(&tenant, &status);
            } else if !quiet {
                println!("Poll with: provsync sync status --tenant {}", tenant);
            }
        }
        SyncCommand::Status { tenant } => {
            let status = env.engine.get_sync_status(&tenant)?;
            print_status(&tenant, &status);
        }
        SyncCommand::Stop { tenant } => {
            env.engine.stop_sync(&tenant)?;
            if !quiet {
                println!("Requested stop for tenant {}", tenant);
            }
        }
        SyncCommand::Force { tenant } => {
            let session = env.engine.clone().force_sync(&tenant)?;
            if !quiet {
                println!("Forced full sync session {}", session.id);
            }
        }
        SyncCommand::History { tenant } => {
            let sessions = env.engine.sync_history(&tenant)?;
            if sessions.is_empty() {
                println!("No sync sessions for tenant {}", tenant);
            }
            for session in sessions {
                println!(
                    "{}  {:11}  {:>4}%  {}  {}",
                    session.started_at.format("%Y-%m-%d %H:%M:%S"),
                    colored_status(session.status),
                    session.progress,
                    session.operation_type.as_str(),
                    session.id,
                );
            }
        }
    }
    Ok(())
}

/// Re-run an incremental sync on a fixed interval until interrupted.
async fn run_periodic(
    env: &Environment,
    tenant: &str,
    config: SyncConfig,
    secs: u64,
    quiet: bool,
) -> Result<()> {
    if !quiet {
        println!(
            "Syncing tenant {} every {}s; Ctrl-C to stop",
            tenant, secs
        );
    }
    loop {
        let engine = Arc::clone(&env.engine);
        let tenant_owned = tenant.to_string();
        let result =
            tokio::task::spawn_blocking(move || engine.run_sync(&tenant_owned, config)).await?;
        match result {
            Ok(session) => {
                if !quiet {
                    println!(
                        "{} sync {} finished: {}",
                        chrono::Utc::now().format("%H:%M:%S"),
                        session.id,
                        colored_status(session.status)
                    );
                }
            }
            Err(e) => eprintln!("{} {}", "sync failed:".red(), e),
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
        }
    }
    Ok(())
}

fn wait_for_completion(env: &Environment, tenant: &str, quiet: bool) -> Result<SyncStatus> {
    let pb = if quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(100);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb
    };

    loop {
        let status = env.engine.get_sync_status(tenant)?;
        pb.set_position(status.progress as u64);
        pb.set_message(status.status.as_str().to_string());
        if status.status.is_terminal() || status.status == SessionStatus::Paused {
            pb.finish_and_clear();
            return Ok(status);
        }
        std::thread::sleep(Duration::from_millis(250));
    }
}

fn run_conflicts_command(env: &Environment, command: ConflictsCommand) -> Result<()> {
    match command {
        ConflictsCommand::List { tenant } => {
            let conflicts = env.engine.pending_conflicts(&tenant)?;
            if conflicts.is_empty() {
                println!("No unresolved conflicts for tenant {}", tenant);
            }
            for conflict in conflicts {
                println!(
                    "{}  {}.{}.{}\n    client: {}  (modified {})\n    central: {} (modified {})",
                    conflict.id,
                    conflict.table_name,
                    conflict.record_id,
                    conflict.field_name.bold(),
                    conflict.local_value,
                    conflict.local_modified_at.format("%Y-%m-%d %H:%M:%S"),
                    conflict.remote_value,
                    conflict.remote_modified_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        ConflictsCommand::Resolve { id, value } => {
            let chosen: serde_json::Value = serde_json::from_str(&value)
                .map_err(|e| anyhow::anyhow!("--value must be valid JSON: {}", e))?;
            let resolved = env.engine.resolve_conflict(id, chosen)?;
            println!(
                "{} conflict {} on {}.{}.{}",
                "Resolved".green(),
                resolved.id,
                resolved.table_name,
                resolved.record_id,
                resolved.field_name,
            );
        }
    }
    Ok(())
}

async fn run_package_command(env: &Environment, command: PackageCommand) -> Result<()> {
    match command {
        PackageCommand::Build(args) => {
            let config = PackageConfig {
                nome: args.nome,
                versao: args.versao,
                descricao: args.descricao,
                tenant_id: args.tenant,
                incluir_esquema: !args.no_schema,
                incluir_dados: !args.no_data,
                incluir_imagens: !args.no_images,
                incluir_workflows: !args.no_workflows,
                incluir_documentacao: !args.no_docs,
                formato_saida: args.formato,
                compressao: args.compressao,
                encriptacao: args.encriptacao,
                senha_encriptacao: args.senha,
                backup_incremental: args.incremental,
                retention_policy: args.retention,
                conflict_resolution: provsync::ResolutionStrategy::ManualReview,
            };

            let pb = ProgressBar::new_spinner();
            pb.set_message("building package...");
            pb.enable_steady_tick(Duration::from_millis(120));

            let builder = Arc::clone(&env.builder);
            let package =
                tokio::task::spawn_blocking(move || builder.build(&config)).await??;
            pb.finish_and_clear();

            println!(
                "{} {} ({}) -> {} [{}]",
                "Built".green(),
                package.package_code,
                package.versao,
                package
                    .artifact_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                format_bytes(package.size_bytes),
            );
            if let Some(baseline) = package.baseline_package_id {
                println!("  delta against {}", baseline);
            }
        }
        PackageCommand::List { tenant } => {
            let packages = env.registry.list(&tenant)?;
            if packages.is_empty() {
                println!("No packages for tenant {}", tenant);
            }
            for package in packages {
                println!(
                    "{}  {:10}  {:>10}  {}  {} {}",
                    package.created_at.format("%Y-%m-%d %H:%M:%S"),
                    package.status.as_str(),
                    format_bytes(package.size_bytes),
                    package.id,
                    package.nome,
                    if package.is_delta() { "(delta)" } else { "" },
                );
            }
        }
        PackageCommand::Verify { id, senha } => {
            env.builder.verify(id, senha.as_deref())?;
            println!("{} package {}", "Verified".green(), id);
        }
        PackageCommand::Restore { id, target, senha } => {
            let store = JsonStore::open(&target)?;
            let blobs = FsBlobStore::open(&target)?;
            let report = env
                .builder
                .restore_into(id, &store, &blobs, senha.as_deref())?;
            println!(
                "{} {} package(s): {} table(s), {} record(s), {} blob(s) into {}",
                "Restored".green(),
                report.packages_applied.len(),
                report.tables_restored,
                report.records_restored,
                report.blobs_restored,
                target.display(),
            );
        }
    }
    Ok(())
}

fn print_status(tenant: &str, status: &SyncStatus) {
    println!(
        "Tenant {}: {} ({}%)",
        tenant,
        colored_status(status.status),
        status.progress
    );
    for item in &status.sync_items {
        println!(
            "  {:20} {:7} {:>6} ok {:>4} failed of {}",
            item.table_name,
            item.operation.as_str(),
            item.success_count,
            item.error_count,
            item.records_count,
        );
    }
    let unresolved = status.conflicts.iter().filter(|c| !c.resolved).count();
    if !status.conflicts.is_empty() {
        println!(
            "  {} conflict(s), {} awaiting manual review",
            status.conflicts.len(),
            unresolved
        );
    }
}

fn colored_status(status: SessionStatus) -> colored::ColoredString {
    match status {
        SessionStatus::Completed => status.as_str().green(),
        SessionStatus::Error => status.as_str().red(),
        SessionStatus::Running => status.as_str().cyan(),
        SessionStatus::Paused => status.as_str().yellow(),
        SessionStatus::Idle => status.as_str().normal(),
    }
}
