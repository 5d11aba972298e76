//! RemitLens - de-identified payer statistics from remittance uploads
//!
//! A CLI tool that parses 835/EDI remittance files and CSV denial exports
//! into aggregate counters and generates payer statistics reports.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (config, store, authentication, etc.)
//!   2 - At least one upload was rejected

mod analysis;
mod auth;
mod cli;
mod config;
mod deid;
mod error;
mod ingest;
mod models;
mod recoverability;
mod report;
mod scanner;
mod store;

use anyhow::{Context, Result};
use auth::{AttemptLedger, AuthOutcome, HashedCredentials};
use chrono::Utc;
use cli::Args;
use config::{Config, StoreBackend, DEFAULT_CONFIG_FILE};
use error::IngestError;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use ingest::IngestOptions;
use models::AggregationResult;
use report::{ReportMetadata, StatsReport};
use scanner::{FileScanner, ScannedFile};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use store::{apply_aggregation, ApplyOutcome, BucketStore, MemoryStore, SqliteStore};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Standalone utilities (no logging needed)
    if args.init_config {
        return handle_init_config();
    }
    if args.hash_password {
        return handle_hash_password(&args);
    }

    // Load configuration
    let (mut config, config_source) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    // Initialize logging
    init_logging(&args, &config);

    info!("RemitLens v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration: {}", config_source);
    debug!(
        inputs = args.inputs.len(),
        dry_run = args.dry_run,
        report_only = args.report_only,
        "Starting run"
    );

    match run(args, config).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .remitlens.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to set the store path, contractual codes, users, and more.");
    Ok(())
}

/// Handle --hash-password: print a users-table entry for the config file.
fn handle_hash_password(args: &Args) -> Result<()> {
    let password = args
        .password
        .as_deref()
        .context("No password given (--password or REMITLENS_PASSWORD)")?;

    let encoded = auth::hash_secret(password);
    println!("[[auth.users]]");
    println!(
        "username = \"{}\"",
        args.user.as_deref().unwrap_or("CHANGE_ME")
    );
    println!("password_hash = \"{}\"", encoded);
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args, config: &Config) {
    let level = args.log_level(config.general.verbose);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Load configuration from file or use defaults.
///
/// Runs before logging is set up, so it returns where the settings came
/// from instead of logging it.
fn load_config(args: &Args) -> Result<(Config, String)> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        let config = Config::load(config_path)?;
        return Ok((config, config_path.display().to_string()));
    }

    // Try default location
    match Config::load_default()? {
        Some(config) => Ok((config, DEFAULT_CONFIG_FILE.to_string())),
        None => Ok((Config::default(), "built-in defaults".to_string())),
    }
}

/// Check credentials when [auth] is enabled.
///
/// Attempts are counted in the store, so the per-minute limit holds across
/// separate runs.
async fn authenticate<L: AttemptLedger>(args: &Args, config: &Config, ledger: &L) -> Result<()> {
    if !config.auth.enabled {
        return Ok(());
    }

    let verifier =
        HashedCredentials::from_config(&config.auth).context("Invalid [auth] configuration")?;
    let user = args
        .user
        .as_deref()
        .context("Authentication is enabled; pass --user and REMITLENS_PASSWORD")?;
    let password = args.password.as_deref().unwrap_or("");

    let outcome = auth::check_login(
        &verifier,
        ledger,
        user,
        password,
        config.auth.max_attempts_per_minute,
        Utc::now(),
    )
    .await
    .context("Failed to record login attempt")?;

    match outcome {
        AuthOutcome::Granted => {
            info!(user, "Authenticated");
            Ok(())
        }
        AuthOutcome::Denied => anyhow::bail!("Invalid credentials for user '{}'", user),
        AuthOutcome::RateLimited => {
            anyhow::bail!("Too many login attempts for '{}'; try again later", user)
        }
    }
}

/// Run the complete workflow. Returns exit code (0 or 2).
async fn run(args: Args, config: Config) -> Result<i32> {
    let start_time = Instant::now();

    // Handle --dry-run: parse and summarize, store untouched
    if args.dry_run && !config.auth.enabled {
        return handle_dry_run(&args, &config).await;
    }

    match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory store; nothing will be persisted");
            let store = MemoryStore::new();
            run_with_store(&args, &config, &store, "memory", start_time).await
        }
        StoreBackend::Sqlite => {
            let path = PathBuf::from(&config.general.store);
            let store = SqliteStore::open(&path, &config.store)
                .await
                .with_context(|| format!("Failed to open store: {}", path.display()))?;
            let exit_code =
                run_with_store(&args, &config, &store, &config.general.store, start_time).await;
            store.close().await;
            exit_code
        }
    }
}

/// Ingest uploads into a store, then report from its snapshot.
async fn run_with_store<S: BucketStore + AttemptLedger>(
    args: &Args,
    config: &Config,
    store: &S,
    store_label: &str,
    start_time: Instant,
) -> Result<i32> {
    store.init().await.context("Failed to initialize store schema")?;
    authenticate(args, config, store).await?;

    // With auth enabled a dry run opens the store for the attempt count only
    if args.dry_run {
        return handle_dry_run(args, config).await;
    }

    if args.init_store {
        println!("✅ Store ready: {}", store_label);
        return Ok(0);
    }

    let summary = if args.report_only {
        RunSummary::default()
    } else {
        println!("📥 Ingesting {} input path(s)...", args.inputs.len());
        ingest_uploads(&args.inputs, config, Some(store), args.quiet).await?
    };

    // Build the report from the store snapshot
    println!("\n📝 Generating report...");

    let buckets = store.buckets().await.context("Failed to read buckets")?;
    let trends = store.trends().await.context("Failed to read trends")?;
    let uploads_in_store = store
        .upload_count()
        .await
        .context("Failed to read upload ledger")?;

    let statistics = analysis::compute_statistics(&buckets, &trends, config.report.top_n);
    let report = StatsReport {
        metadata: ReportMetadata {
            generated_at: Utc::now(),
            store: store_label.to_string(),
            uploads_in_store,
            uploads_this_run: summary.applied,
            uploads_rejected: summary.rejected,
            lines_processed: summary.lines_processed,
            lines_skipped: summary.lines_skipped,
            duration_seconds: start_time.elapsed().as_secs_f64(),
        },
        statistics,
    };

    let output = PathBuf::from(&config.general.output);
    report::write_report(&report, &output, args.format, config.report.include_trends)
        .with_context(|| format!("Failed to write report to {}", output.display()))?;

    // Print summary
    println!("\n📊 Statistics Summary:");
    for line in analysis::generate_summary_text(&report.statistics).lines() {
        println!("   {}", line);
    }
    print_run_summary(&summary, start_time);
    println!("\n✅ Report saved to: {}", output.display());

    Ok(summary.exit_code())
}

/// Handle --dry-run: parse uploads and print what would be applied.
async fn handle_dry_run(args: &Args, config: &Config) -> Result<i32> {
    let start_time = Instant::now();
    println!("\n🔍 Dry run: parsing uploads without touching the store...\n");

    let summary = ingest_uploads(&args.inputs, config, None::<&MemoryStore>, args.quiet).await?;
    print_run_summary(&summary, start_time);

    println!("\n✅ Dry run complete. Nothing was applied.");
    Ok(summary.exit_code())
}

/// Counters for one run.
#[derive(Debug, Default)]
struct RunSummary {
    uploads: usize,
    applied: usize,
    duplicates: usize,
    rejected: usize,
    lines_processed: u64,
    lines_skipped: u64,
}

impl RunSummary {
    fn exit_code(&self) -> i32 {
        if self.rejected > 0 {
            2
        } else {
            0
        }
    }
}

fn print_run_summary(summary: &RunSummary, start_time: Instant) {
    println!("\n📦 Uploads:");
    println!(
        "   Seen: {} | Applied: {} | Duplicates: {} | Rejected: {}",
        summary.uploads, summary.applied, summary.duplicates, summary.rejected
    );
    println!(
        "   Lines processed: {} | skipped: {}",
        summary.lines_processed, summary.lines_skipped
    );
    println!("   Duration: {:.1}s", start_time.elapsed().as_secs_f64());
    if summary.rejected > 0 {
        eprintln!(
            "\n⛔ {} upload(s) rejected. Failing (exit code 2).",
            summary.rejected
        );
    }
}

fn progress_bar(len: usize, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb
}

/// Parse uploads concurrently and apply each result as it completes.
///
/// With no store, results are only summarized.
async fn ingest_uploads<S: BucketStore>(
    inputs: &[PathBuf],
    config: &Config,
    store: Option<&S>,
    quiet: bool,
) -> Result<RunSummary> {
    let mut scanner = FileScanner::new();
    if let Some(depth) = config.ingest.max_scan_depth {
        scanner = scanner.with_max_depth(depth);
    }
    let files = scanner.scan(inputs)?;
    let mut summary = RunSummary {
        uploads: files.len(),
        ..RunSummary::default()
    };

    if files.is_empty() {
        println!("   No uploads found.");
        return Ok(summary);
    }

    let options = Arc::new(IngestOptions::from(&config.ingest));
    let pb = progress_bar(files.len(), quiet);

    let mut parsed = stream::iter(files.into_iter().map(|file| {
        let options = Arc::clone(&options);
        async move {
            let outcome = parse_upload(&file, options).await;
            (file, outcome)
        }
    }))
    .buffer_unordered(config.general.concurrency.max(1));

    while let Some((file, outcome)) = parsed.next().await {
        pb.inc(1);
        let name = display_name(&file.path);

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(rejection)) => {
                summary.rejected += 1;
                warn!("Rejected {}: {}", name, rejection);
                pb.println(format!("   ❌ {}: {}", name, rejection));
                continue;
            }
            Err(e) => {
                summary.rejected += 1;
                warn!("Failed to read {}: {:#}", name, e);
                pb.println(format!("   ❌ {}: {:#}", name, e));
                continue;
            }
        };

        summary.lines_processed += result.lines_processed;
        summary.lines_skipped += result.lines_skipped;
        for warning in &result.warnings {
            pb.println(format!("   ⚠️  {}: {}", name, warning));
        }
        let totals = result.totals();
        let line = format!(
            "   📄 {}: {} lines ({} denied, {} partial, {} skipped, {})",
            name,
            result.lines_processed,
            totals.denied,
            totals.partial,
            result.lines_skipped,
            result.format
        );

        let Some(store) = store else {
            pb.println(line);
            continue;
        };

        match apply_aggregation(result, store).await {
            Ok(ApplyOutcome::Applied { .. }) => {
                summary.applied += 1;
                pb.println(line);
            }
            Ok(ApplyOutcome::DuplicateUpload) => {
                summary.duplicates += 1;
                pb.println(format!("   ↩️  {}: already applied, skipped", name));
            }
            Err(e) => {
                summary.rejected += 1;
                error!("Failed to apply {}: {}", name, e);
                pb.println(format!("   ❌ {}: {}", name, e));
            }
        }
    }

    pb.finish_and_clear();
    Ok(summary)
}

/// Read and parse one upload.
///
/// The outer error is an I/O failure; the inner one rejects the upload.
async fn parse_upload(
    file: &ScannedFile,
    options: Arc<IngestOptions>,
) -> Result<std::result::Result<AggregationResult, IngestError>> {
    // Reject without reading when the name or size already rules it out
    if let Err(e) = ingest::detect_format(&file.extension) {
        return Ok(Err(e));
    }
    if file.size > options.max_upload_bytes {
        return Ok(Err(IngestError::UploadTooLarge {
            size: file.size,
            limit: options.max_upload_bytes,
        }));
    }

    // A file that grew since the scan still trips the size check in the parser
    let bytes = read_bounded(&file.path, options.max_upload_bytes.saturating_add(1)).await?;
    let extension = file.extension.clone();

    tokio::task::spawn_blocking(move || {
        ingest::parse_and_aggregate_with(&bytes, &extension, &options)
    })
    .await
    .context("Parser task failed")
}

/// Read at most `limit` bytes of a file.
async fn read_bounded(path: &Path, limit: u64) -> Result<Vec<u8>> {
    let handle = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut bytes = Vec::new();
    handle
        .take(limit)
        .read_to_end(&mut bytes)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(bytes)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
