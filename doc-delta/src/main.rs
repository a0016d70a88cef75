use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use doc_delta::commands::{self, AddRequest};
use doc_delta::error::DeltaError;
use doc_delta::lock::{DEFAULT_LOCK_POLL_INTERVAL_MS, DEFAULT_LOCK_TIMEOUT_SECONDS, LockSettings};
use doc_delta::storage::FsDocumentStore;
use tracing_subscriber::EnvFilter;

const DEFAULT_DOC_DELTA_PATH: &str = "DOC_DELTA.md";

#[derive(Debug, Parser)]
#[command(
    name = "doc-delta",
    about = "Append to, check, and normalize a shared DOC_DELTA changelog",
    version
)]
struct Cli {
    /// Enable debug logging on stderr.
    #[arg(long, global = true)]
    verbose: bool,
    /// DOC_DELTA file to operate on. Relative paths resolve against the working directory.
    #[arg(long, env = "DOC_DELTA_PATH", default_value = DEFAULT_DOC_DELTA_PATH)]
    doc_delta: PathBuf,
    /// Seconds to wait for the lock before giving up. 0 means a single attempt.
    #[arg(
        long,
        env = "DOC_DELTA_LOCK_TIMEOUT_SECONDS",
        default_value_t = DEFAULT_LOCK_TIMEOUT_SECONDS,
        allow_negative_numbers = true
    )]
    lock_timeout_seconds: f64,
    /// Milliseconds between lock attempts.
    #[arg(
        long,
        env = "DOC_DELTA_LOCK_POLL_INTERVAL_MS",
        default_value_t = DEFAULT_LOCK_POLL_INTERVAL_MS,
        allow_negative_numbers = true
    )]
    lock_poll_interval_ms: i64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Append a new entry and rewrite the file in canonical order.
    Add(AddArgs),

    /// Verify entries are in canonical order without modifying the file.
    Check,

    /// Rewrite the file in canonical order.
    Fix,
}

#[derive(Debug, Args)]
struct AddArgs {
    /// Entry title.
    #[arg(long)]
    title: String,
    /// Entry timestamp (YYYY-MM-DD HH:MM:SSZ). Defaults to now, UTC.
    #[arg(long)]
    timestamp: Option<String>,
    /// Change bullet; repeatable.
    #[arg(long = "change")]
    changes: Vec<String>,
    /// Verification bullet; repeatable.
    #[arg(long = "verification")]
    verifications: Vec<String>,
    /// File whose contents become the entry body.
    #[arg(long)]
    body_file: Option<PathBuf>,
}

impl From<AddArgs> for AddRequest {
    fn from(args: AddArgs) -> Self {
        AddRequest {
            title: args.title,
            timestamp: args.timestamp,
            changes: args.changes,
            verifications: args.verifications,
            body_file: args.body_file,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(cli.verbose) {
        eprintln!("{err:#}");
        return ExitCode::from(1);
    }
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let settings = LockSettings::new(cli.lock_timeout_seconds, cli.lock_poll_interval_ms)?;
    let document = resolve_document_path(&cli.doc_delta)?;
    tracing::debug!(
        document = %document.display(),
        timeout_s = settings.timeout().as_secs_f64(),
        poll_ms = settings.poll_interval().as_millis() as u64,
        "resolved settings"
    );

    let store = FsDocumentStore;
    match cli.command {
        Commands::Add(args) => handle_add(&store, &document, &settings, args),
        Commands::Check => handle_check(&store, &document, &settings),
        Commands::Fix => handle_fix(&store, &document, &settings),
    }
}

fn handle_add(
    store: &FsDocumentStore,
    document: &Path,
    settings: &LockSettings,
    args: AddArgs,
) -> Result<ExitCode> {
    let report = commands::run_add(store, document, settings, &AddRequest::from(args))?;
    println!("{report}");
    Ok(ExitCode::SUCCESS)
}

fn handle_check(
    store: &FsDocumentStore,
    document: &Path,
    settings: &LockSettings,
) -> Result<ExitCode> {
    let report = commands::run_check(store, document, settings)?;
    if report.passed() {
        println!("{report}");
        return Ok(ExitCode::SUCCESS);
    }
    eprintln!("{report}");
    eprintln!(
        "Run `doc-delta --doc-delta {} fix` to normalize.",
        document.display()
    );
    Ok(ExitCode::from(1))
}

fn handle_fix(store: &FsDocumentStore, document: &Path, settings: &LockSettings) -> Result<ExitCode> {
    let report = commands::run_fix(store, document, settings)?;
    println!("{report}");
    Ok(ExitCode::SUCCESS)
}

fn resolve_document_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("resolving current directory")?;
    Ok(cwd.join(path))
}

fn init_tracing(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<DeltaError>()
        .map_or(1, DeltaError::exit_code)
}
