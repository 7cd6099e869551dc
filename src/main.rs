use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use wikiref::config::{self, FilterMode, ImportConfig, PipelineConfig};
use wikiref::fetch::DirFetcher;
use wikiref::import::{ImportSummary, Importer};
use wikiref::store::{MemoryStore, PgStore, Store};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "wikiref")]
#[command(about = "Import Wikipedia dumps into Postgres with resolved article references")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "LOGFILE", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import every dump of a folder
    Import(ImportArgs),
    /// Create the tables and indexes if they do not exist
    InitSchema(SchemaArgs),
}

#[derive(Args)]
struct ImportArgs {
    /// Folder containing the dumps (.xml or .xml.bz2)
    #[arg(short, long, env = "DUMP_FOLDER")]
    dump_folder: PathBuf,

    /// Postgres / CockroachDB connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Only import these dumps (file name without extension); repeatable
    #[arg(long = "select")]
    select: Vec<String>,

    /// Concurrent insertion workers (default: 2 per CPU)
    #[arg(long, env = "WORKERS")]
    workers: Option<usize>,

    /// Retries per article before it is reported as failed
    #[arg(long, default_value_t = config::DEFAULT_RETRY_LIMIT)]
    retry_limit: u32,

    /// Articles buffered ahead of the workers
    #[arg(long, default_value_t = config::DEFAULT_QUEUE_DEPTH)]
    queue_depth: usize,

    /// Store the raw article text in page_content
    #[arg(long, env = "WITH_PAGE_CONTENT")]
    with_page_content: bool,

    /// Resolve and store article references
    #[arg(long, env = "WITH_PAGE_REFERENCES")]
    with_page_references: bool,

    /// Namespace prefix whose pages are skipped; repeatable, replaces the defaults
    #[arg(long = "ignored-prefix")]
    ignored_prefixes: Vec<String>,

    /// Also drop links pointing into an ignored namespace
    #[arg(long)]
    filter_namespace_links: bool,

    /// Abort and retry a write taking longer than this
    #[arg(long)]
    transaction_timeout_secs: Option<u64>,

    /// Limit number of articles per dump (for testing)
    #[arg(long)]
    limit: Option<u64>,

    /// Delete each dump once imported
    #[arg(long, env = "TIGHT")]
    tight: bool,

    /// Import into memory; nothing is written to the database
    #[arg(long)]
    dry_run: bool,

    /// Create missing tables before importing
    #[arg(long)]
    ensure_schema: bool,

    /// Maximum database connections (default: 2 per worker)
    #[arg(long, env = "DB_MAX_CONN")]
    db_max_conn: Option<u32>,

    /// Show a live progress line
    #[arg(long)]
    progress: bool,

    /// Write the run summary as JSON
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Args)]
struct SchemaArgs {
    /// Postgres / CockroachDB connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("wikiref-import-worker")
        .enable_io()
        .enable_time()
        .build()?;
    Ok(rt)
}

fn run_import(args: ImportArgs) -> Result<()> {
    let workers = args.workers.unwrap_or_else(config::default_worker_count).max(1);
    let ignored_prefixes = if args.ignored_prefixes.is_empty() {
        config::default_ignored_prefixes()
    } else {
        args.ignored_prefixes.clone()
    };

    let config = ImportConfig {
        pipeline: PipelineConfig {
            workers,
            retry_limit: args.retry_limit,
            queue_depth: args.queue_depth,
            insert_content: args.with_page_content,
            insert_references: args.with_page_references,
            ignored_prefixes,
            filter_mode: if args.filter_namespace_links {
                FilterMode::Exclude
            } else {
                FilterMode::Legacy
            },
            transaction_timeout: args.transaction_timeout_secs.map(Duration::from_secs),
            ..PipelineConfig::default()
        },
        tight: args.tight,
        limit: args.limit,
        show_progress: args.progress,
        ..ImportConfig::default()
    };

    let mut fetcher = DirFetcher::new(&args.dump_folder)?.with_selection(&args.select);
    if fetcher.is_empty() {
        bail!("No dumps to import in {}", args.dump_folder.display());
    }
    info!(dumps = ?fetcher.names(), workers, "Starting import");

    let rt = build_runtime()?;
    let summary = rt.block_on(async {
        let store: Arc<dyn Store> = if args.dry_run {
            info!("Dry run, writing to memory");
            Arc::new(MemoryStore::new())
        } else {
            let url = args
                .database_url
                .as_deref()
                .context("--database-url (or DATABASE_URL) is required unless --dry-run")?;
            let max_conn = args
                .db_max_conn
                .unwrap_or((workers * 2).try_into().unwrap_or(u32::MAX));
            let store = PgStore::connect(url, max_conn)
                .await
                .context("Cannot connect to database")?;
            if args.ensure_schema {
                store.ensure_schema().await.context("Cannot create schema")?;
            }
            Arc::new(store)
        };

        Importer::new(store, config).run(&mut fetcher).await
    })?;

    print_summary(&summary);
    if let Some(path) = &args.report {
        write_report(path, &summary)?;
    }

    let failed_opens = summary.failed_opens();
    if failed_opens > 0 {
        bail!("{failed_opens} of {} dumps could not be opened", summary.dumps.len());
    }
    Ok(())
}

fn run_init_schema(args: SchemaArgs) -> Result<()> {
    let rt = build_runtime()?;
    rt.block_on(async {
        let store = PgStore::connect(&args.database_url, 1)
            .await
            .context("Cannot connect to database")?;
        store.ensure_schema().await.context("Cannot create schema")?;
        info!("Schema ready");
        Ok(())
    })
}

fn print_summary(summary: &ImportSummary) {
    let totals = summary.totals();

    println!();
    println!("=== Summary ===");
    for dump in &summary.dumps {
        match (&dump.open_error, &dump.pipeline) {
            (Some(e), _) => println!("{:<24} not opened: {e}", dump.name),
            (None, Some(report)) => println!(
                "{:<24} {} written, {} skipped, {} failed in {:.2}s ({:.1} articles/s)",
                dump.name,
                report.stats.written,
                report.stats.skipped,
                report.stats.failed,
                report.elapsed.as_secs_f64(),
                report.average_velocity()
            ),
            (None, None) => println!("{:<24} nothing imported", dump.name),
        }
    }
    println!();
    println!("Total time:         {:.2}s", summary.elapsed.as_secs_f64());
    println!("Articles processed: {}", totals.processed);
    println!("Pages written:      {}", totals.written);
    println!("Pages skipped:      {}", totals.skipped);
    println!("Failed articles:    {}", totals.failed);
    println!("Retries:            {}", totals.retries);
    println!("Contents written:   {}", totals.contents_written);
    println!("References written: {}", totals.references_written);
    println!("Unresolved links:   {}", totals.references_unresolved);
    println!(
        "Page cache:         {} entries, {} hits, {} misses",
        summary.cache_entries, summary.cache_hits, summary.cache_misses
    );

    for dump in &summary.dumps {
        let Some(report) = &dump.pipeline else {
            continue;
        };
        if report.velocity.is_empty() {
            continue;
        }
        println!();
        println!("Velocity by worker load ({}):", dump.name);
        for (percentile, velocity) in &report.velocity {
            println!("  {percentile:>3}%  {velocity:>10.1} articles/s");
        }
    }
}

fn write_report(path: &Path, summary: &ImportSummary) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create report {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), summary)
        .with_context(|| format!("Failed to write report {}", path.display()))?;
    info!(path = %path.display(), "Wrote report");
    Ok(())
}

fn init_tracing(verbose: u8, log_file: Option<&Path>) -> Result<()> {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.verbose, cli.log_file.as_deref()) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Commands::Import(args) => run_import(args),
        Commands::InitSchema(args) => run_init_schema(args),
    };

    match result {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
