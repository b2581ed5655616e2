//! fluent-migrate - applies generated migration files to PostgreSQL
//!
//! Commands:
//! - `up` (default): apply every pending migration, one transaction each
//! - `status`: list applied and pending migrations
//! - `down` / `rollback`: undo the most recently applied migration

use clap::{Parser, ValueEnum};
use fluent_migrate::config::{Settings, ENV_VARS};
use fluent_migrate::migration::{
    MigrateReport, MigrationRunner, PostgresBackend, RollbackOutcome, StatusReport,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fluent-migrate", version, about = "Apply and roll back tracked SQL migrations")]
struct Cli {
    /// Command to run
    #[arg(value_enum, default_value_t = Command::Up)]
    command: Command,

    /// Directory holding <timestamp>_<name>.sql files
    #[arg(short = 'd', long, default_value = "migrations")]
    migrations_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Command {
    /// Apply pending migrations
    Up,
    /// Show applied and pending migrations
    Status,
    /// Roll back the latest migration
    #[value(alias = "rollback")]
    Down,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            print_connection_help();
            return Ok(ExitCode::FAILURE);
        }
    };

    let backend = match fluent_migrate::db::connect(&settings.database).await {
        Ok(backend) => backend,
        Err(e) => {
            error!(
                "Cannot connect to {}: {}",
                settings.database.display_target(),
                e
            );
            print_connection_help();
            return Ok(ExitCode::FAILURE);
        }
    };

    let mut runner = MigrationRunner::new(backend, &cli.migrations_dir);
    info!("Using migrations from {}", cli.migrations_dir.display());

    let success = match cli.command {
        Command::Up => report_migrate(&runner.migrate().await?),
        Command::Status => report_status(&mut runner).await?,
        Command::Down => report_rollback(runner.rollback().await?),
    };

    Ok(if success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fluent_migrate=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true)
                .compact(),
        )
        .init();
}

fn print_connection_help() {
    eprintln!();
    eprintln!("Set the database connection through these environment variables:");
    for (name, default) in ENV_VARS {
        eprintln!("  {:<22} default: {}", name, default);
    }
}

/// Prints the run summary; `false` when any migration failed
fn report_migrate(report: &MigrateReport) -> bool {
    for name in &report.applied {
        println!("applied  {}", name);
    }
    for failure in &report.failures {
        println!("FAILED   {}: {}", failure.name, failure.error);
    }
    println!(
        "\n{} applied, {} skipped, {} errors",
        report.applied.len(),
        report.skipped,
        report.errors
    );

    report.errors == 0
}

async fn report_status(runner: &mut MigrationRunner<PostgresBackend>) -> anyhow::Result<bool> {
    let StatusReport {
        applied,
        pending,
        modified,
        missing,
    } = runner.status().await?;

    println!("Applied ({}):", applied.len());
    for row in &applied {
        let note = if modified.contains(&row.name) {
            "  [modified on disk]"
        } else if missing.contains(&row.name) {
            "  [file missing]"
        } else {
            ""
        };
        println!("  {}  {}{}", row.applied_at.format("%Y-%m-%d %H:%M:%S"), row.name, note);
    }

    println!("Pending ({}):", pending.len());
    for migration in &pending {
        println!("  {}", migration.name);
    }

    Ok(true)
}

fn report_rollback(outcome: RollbackOutcome) -> bool {
    match outcome {
        RollbackOutcome::RolledBack { name } => {
            println!("rolled back  {}", name);
            true
        }
        RollbackOutcome::NothingToRollBack => {
            println!("nothing to roll back");
            true
        }
        RollbackOutcome::Failed { name, reason } => {
            println!("rollback of {} failed: {}", name, reason);
            println!("no rollback occurred; the migration is still recorded as applied");
            false
        }
    }
}
