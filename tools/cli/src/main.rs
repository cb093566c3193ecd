//! offsync CLI - inspect and reset the local state of an offline sync root.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use offsync_common::ResourceAddress;
use offsync_storage::create_default_registry;
use offsync_sync::{EntryState, LinkOracle, LocalCache, PendingWriteQueue, SyncConfig};

#[derive(Parser)]
#[command(name = "offsync")]
#[command(about = "offsync - inspect offline sync state")]
#[command(version)]
struct Cli {
    /// Directory holding the sync state (overrides the config file).
    #[arg(long)]
    root: Option<PathBuf>,

    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the client path to server path links.
    Links,

    /// List writes waiting to be replayed.
    Pending,

    /// Print a cached resource.
    Show {
        /// Client path, e.g. dbs/Foo/colls/Bar.
        client_path: String,
    },

    /// Reset local state. Resets everything when no flag is given.
    Purge {
        /// Drop cached resources.
        #[arg(long)]
        cache: bool,

        /// Drop pending writes.
        #[arg(long)]
        queue: bool,

        /// Drop links.
        #[arg(long)]
        links: bool,
    },

    /// Print the effective configuration.
    Config,
}

/// Local state opened from a sync root.
struct State {
    oracle: Arc<LinkOracle>,
    cache: Arc<LocalCache>,
    queue: PendingWriteQueue,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => SyncConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if let Some(root) = cli.root {
        config = config.with_root(root);
    }

    match cli.command {
        Commands::Links => cmd_links(&config).await,
        Commands::Pending => cmd_pending(&config).await,
        Commands::Show { client_path } => cmd_show(&config, &client_path).await,
        Commands::Purge {
            cache,
            queue,
            links,
        } => {
            let all = !(cache || queue || links);
            cmd_purge(&config, all || cache, all || queue, all || links).await
        }
        Commands::Config => {
            println!("{}", config.to_json()?);
            Ok(())
        }
    }
}

async fn open_state(config: &SyncConfig) -> Result<State> {
    let registry = create_default_registry();
    let store = config
        .open_store(&registry)
        .with_context(|| format!("Failed to open store at {}", config.root.display()))?;

    let oracle = Arc::new(LinkOracle::new(store.clone()));
    oracle.restore().await.context("Failed to restore links")?;
    let cache = Arc::new(LocalCache::new(store.clone(), oracle.clone()));
    let queue = PendingWriteQueue::load(store, oracle.clone(), cache.clone())
        .await
        .context("Failed to load pending writes")?;

    Ok(State {
        oracle,
        cache,
        queue,
    })
}

async fn cmd_links(config: &SyncConfig) -> Result<()> {
    let state = open_state(config).await?;
    let pairs = state.oracle.pairs().await;

    if pairs.is_empty() {
        println!("No links.");
        return Ok(());
    }
    println!("{} links:", pairs.len());
    for pair in pairs {
        println!("  {} -> {}", pair.client_path, pair.server_path);
    }
    Ok(())
}

async fn cmd_pending(config: &SyncConfig) -> Result<()> {
    let state = open_state(config).await?;
    let entries = state.queue.entries().await;

    if entries.is_empty() {
        println!("No pending writes.");
        return Ok(());
    }
    println!("{} pending writes:", entries.len());
    for (entry_state, write) in entries {
        let marker = match entry_state {
            EntryState::Pending => "",
            EntryState::Replaying => " (replaying)",
        };
        println!(
            "  {:<7} {}{}",
            write.kind.to_string(),
            write.address,
            marker
        );
        println!("          at {}", write.local_cache_path);
        println!(
            "          queued {}",
            write.enqueued_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}

async fn cmd_show(config: &SyncConfig, client_path: &str) -> Result<()> {
    let address = ResourceAddress::from_client_path(client_path)
        .filter(|a| !a.is_feed())
        .with_context(|| format!("'{}' is not a resource path", client_path))?;

    let state = open_state(config).await?;
    let body = state
        .cache
        .get(&address)
        .await
        .context("Failed to read cache")?
        .with_context(|| format!("{} is not cached", client_path))?;

    let value: serde_json::Value =
        serde_json::from_slice(&body).context("Cached resource is not valid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn cmd_purge(config: &SyncConfig, cache: bool, queue: bool, links: bool) -> Result<()> {
    let state = open_state(config).await?;

    if queue {
        state.queue.purge().await.context("Failed to purge pending writes")?;
        info!("Pending writes purged");
    }
    if cache {
        state.cache.purge_all().await.context("Failed to purge cache")?;
        info!("Cache purged");
    }
    if links {
        state.oracle.purge_all().await.context("Failed to purge links")?;
        info!("Links purged");
    }
    Ok(())
}
