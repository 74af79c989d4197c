use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use catalog_mirror::config::Config;
use catalog_mirror::feed::{FeedClient, OrderBy};
use catalog_mirror::storage::{CacheFilter, Database, DatabaseError, SqlitePrimaryCatalog};
use catalog_mirror::sync::{
    ImportStatusReconciler, ProgressReporter, SyncEngine, SyncEvent, SyncMode, SyncRequest,
};

/// Get the config directory path (~/.config/catalog-mirror/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("catalog-mirror"))
}

#[derive(Parser, Debug)]
#[command(
    name = "catalog-mirror",
    about = "Mirror a paginated game-catalog feed into a local cache"
)]
struct Args {
    /// Reset cache database (delete and recreate)
    #[arg(long, global = true)]
    reset_db: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pull feed pages into the cache
    Sync(SyncArgs),
    /// Show cache size, categories and recent sync runs
    Status {
        /// Number of ledger entries to show
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// List cached items
    Browse(BrowseArgs),
}

#[derive(ClapArgs, Debug)]
struct SyncArgs {
    #[arg(long, default_value = "full")]
    mode: SyncMode,

    /// Site identifier (defaults to `site_id` from config)
    #[arg(long)]
    site: Option<String>,

    #[arg(long, default_value = "quality")]
    order_by: OrderBy,

    /// First page of the window (1-based)
    #[arg(long, default_value_t = 1)]
    start_page: u32,

    /// Page budget for this invocation
    #[arg(long)]
    max_pages: Option<u32>,

    /// Print progress events as JSON lines
    #[arg(long, conflicts_with = "all")]
    stream: bool,

    /// Keep running windows until the job is done
    #[arg(long)]
    all: bool,
}

#[derive(ClapArgs, Debug)]
struct BrowseArgs {
    #[arg(long)]
    category: Option<String>,

    /// Only items already in the primary catalog
    #[arg(long, conflicts_with = "not_imported")]
    imported: bool,

    /// Only items not yet in the primary catalog
    #[arg(long)]
    not_imported: bool,

    /// Substring match on title
    #[arg(long)]
    search: Option<String>,

    #[arg(long, default_value_t = 50)]
    limit: i64,

    #[arg(long, default_value_t = 0)]
    offset: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        eprintln!("Created config directory: {}", config_dir.display());
    }

    // User-only access on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    let config = Config::load_with_env(&config_dir.join("config.toml"))
        .context("Failed to load configuration")?;
    let db_path = config_dir.join("cache.db");

    if args.reset_db && db_path.exists() {
        std::fs::remove_file(&db_path).context("Failed to delete database")?;
        eprintln!("Database reset.");
    }

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: Another catalog-mirror process holds the cache database. Try again once it finishes.");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    match args.command {
        Command::Sync(sync_args) => run_sync(&config, db, sync_args).await,
        Command::Status { limit } => show_status(&db, limit).await,
        Command::Browse(browse_args) => browse(&db, browse_args).await,
    }
}

async fn run_sync(config: &Config, db: Database, args: SyncArgs) -> Result<()> {
    let site_id = args
        .site
        .clone()
        .unwrap_or_else(|| config.site_id.clone());
    if site_id.trim().is_empty() {
        anyhow::bail!("No site id: pass --site or set site_id in config.toml");
    }
    if config.feed_base_url.trim().is_empty() {
        anyhow::bail!("No feed URL: set feed_base_url in config.toml or CATALOG_MIRROR_FEED_URL");
    }

    let http = reqwest::Client::builder()
        .user_agent(concat!("catalog-mirror/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;
    let client = FeedClient::new(http, &config.feed_base_url, &site_id, config.page_size)
        .context("Invalid feed configuration")?
        .with_timeout(Duration::from_secs(config.request_timeout_secs));

    let mut engine = SyncEngine::new(db, client);
    if let Some(primary_path) = &config.primary_db_path {
        let path = primary_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in primary_db_path"))?;
        let primary = SqlitePrimaryCatalog::open(path)
            .await
            .with_context(|| format!("Failed to open primary catalog at {path}"))?;
        engine = engine.with_reconciler(ImportStatusReconciler::new(
            Arc::new(primary),
            config.platform_tag.clone(),
        ));
    } else {
        tracing::debug!("No primary_db_path configured, import reconciliation disabled");
    }

    let request = SyncRequest::new(args.mode, site_id)
        .order_by(args.order_by)
        .window(args.start_page, args.max_pages);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping after the current page");
            ctrl_c.cancel();
        }
    });

    if args.stream {
        let (mut rx, handle) = engine.sync_stream(request, config.progress_buffer, cancel);
        while let Some(event) = rx.recv().await {
            println!("{}", serde_json::to_string(&event)?);
            if let SyncEvent::Failed { .. } = event {
                break;
            }
        }
        handle.await.context("Sync task panicked")??;
        return Ok(());
    }

    let summary = if args.all {
        engine
            .sync_all(&request, &ProgressReporter::silent(), &cancel)
            .await?
    } else {
        engine
            .run(&request, &ProgressReporter::silent(), &cancel)
            .await?
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn show_status(db: &Database, limit: i64) -> Result<()> {
    let cached = db.count_cached().await.context("Failed to count cache")?;
    println!("Cached items: {cached}");

    match db.last_successful_sync().await? {
        Some(run) => println!(
            "Last successful sync: {} ({} mode, site {}, {} new, {} updated)",
            format_timestamp(run.created_at),
            run.mode,
            run.site_id,
            run.new_count,
            run.updated_count
        ),
        None => println!("Last successful sync: never"),
    }

    let categories = db.cache_categories().await?;
    if !categories.is_empty() {
        println!();
        println!("Categories:");
        for c in categories {
            println!("  {:<24} {}", c.category, c.count);
        }
    }

    let runs = db.recent_sync_runs(limit).await?;
    if !runs.is_empty() {
        println!();
        println!("Recent runs:");
        for run in runs {
            println!(
                "  {}  {:<7} {:<11} pages {}+{}  seen {} new {} updated {} skipped {}  {} ms{}",
                format_timestamp(run.created_at),
                run.status.as_str(),
                run.mode,
                run.start_page,
                run.max_pages.map_or_else(|| "all".to_string(), |m| m.to_string()),
                run.items_seen,
                run.new_count,
                run.updated_count,
                run.skipped_count,
                run.duration_ms,
                run.error_message
                    .map(|e| format!("  error: {e}"))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}

async fn browse(db: &Database, args: BrowseArgs) -> Result<()> {
    let imported = match (args.imported, args.not_imported) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    };
    let filter = CacheFilter {
        category: args.category,
        imported,
        search: args.search,
        orientation: None,
        limit: Some(args.limit),
        offset: Some(args.offset),
    };

    let records = db.list_cached(&filter).await?;
    for record in &records {
        println!("{}", serde_json::to_string(record)?);
    }
    tracing::debug!(count = records.len(), "Browse complete");
    Ok(())
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}
