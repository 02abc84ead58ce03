use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chado_pheno_migrate::config::{ConfigLoader, ResolvedConfig};
use chado_pheno_migrate::driver::{MigrationDriver, RunOptions};
use chado_pheno_migrate::error::MigrateError;
use chado_pheno_migrate::executor::ExecutionMode;
use chado_pheno_migrate::memory::MemoryTargetStore;
use chado_pheno_migrate::output::JsonOutput;
use chado_pheno_migrate::snapshot;

#[derive(Parser)]
#[command(name = "chado-migrate")]
#[command(about = "Migrate wide phenotyping summary tables into a Chado warehouse")]
#[command(version, author)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Migrate source tables into the target snapshot")]
    Run(RunArgs),
    #[command(about = "Validate the translation config against the source")]
    Check(CheckArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Source dump (JSON, optionally .gz).
    #[arg(long)]
    source: Utf8PathBuf,

    /// Target snapshot, created when absent.
    #[arg(long)]
    target: Utf8PathBuf,

    #[arg(long)]
    config: Option<String>,

    /// Migrate only this table instead of every configured one.
    #[arg(long)]
    table: Option<String>,

    #[arg(long)]
    page_size: Option<usize>,

    #[arg(long)]
    limit: Option<usize>,

    #[arg(long)]
    sequential: bool,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct CheckArgs {
    #[arg(long)]
    source: Utf8PathBuf,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    table: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<MigrateError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &MigrateError) -> u8 {
    if error.is_configuration() {
        return 2;
    }
    match error {
        MigrateError::Store(_)
        | MigrateError::Constraint { .. }
        | MigrateError::BatchFailed { .. }
        | MigrateError::PageFailed { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => run_migration(args),
        Commands::Check(args) => run_check(args),
    }
}

fn load_config(path: Option<&str>) -> Result<ResolvedConfig, MigrateError> {
    ConfigLoader::resolve(path.map(Path::new))
}

fn run_migration(args: RunArgs) -> miette::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let options = RunOptions {
        page_size: args.page_size.unwrap_or(config.page_size),
        limit: args.limit,
        mode: if args.sequential {
            ExecutionMode::Sequential
        } else {
            ExecutionMode::Concurrent
        },
        dry_run: args.dry_run,
    };

    let source = Arc::new(snapshot::load_source(&args.source)?);
    let target = MemoryTargetStore::from_tables(snapshot::load_target(&args.target)?);
    let driver = MigrationDriver::open(source, Arc::new(target.clone()), config)?;

    let summary = match args.table.as_deref() {
        Some(table) => driver.run(table, &options)?,
        None => driver.run_all(&options)?,
    };

    if !options.dry_run {
        snapshot::save_target(&args.target, &target.snapshot()?)?;
        info!(path = %args.target, "target snapshot updated");
    }
    JsonOutput::print_summary(&summary).into_diagnostic()?;
    Ok(())
}

fn run_check(args: CheckArgs) -> miette::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let source = Arc::new(snapshot::load_source(&args.source)?);
    let driver = MigrationDriver::open(source, Arc::new(MemoryTargetStore::new()), config)?;
    let report = driver.check(args.table.as_deref())?;
    JsonOutput::print_check(&report).into_diagnostic()?;
    Ok(())
}
