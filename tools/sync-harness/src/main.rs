//! CLI harness for exercising a live lightwalletd
//!
//! This tool allows testing:
//! - Server info and chain tip over direct or Tor transports
//! - Block downloads into the SQLite cache, with Ctrl-C cancellation
//! - Cache rewind and inspection

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use lightsync_net::TorConfig;
use lightsync_processor::{
    init_logging, BlockSource, CancelToken, CompactBlockRange, CompactBlockRepository, Downloader,
    LightClient, LightClientConfig, ServiceMode, SqliteBlockRepository, SyncMarkers,
    DEFAULT_LIGHTD_URL,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sync-harness")]
#[command(about = "Lightwalletd sync testing harness", long_about = None)]
struct Cli {
    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct Connection {
    /// Lightwalletd endpoint
    #[arg(short, long, default_value = DEFAULT_LIGHTD_URL)]
    endpoint: String,

    /// Route calls over the shared Tor circuit
    #[arg(long)]
    tor: bool,

    /// Route calls over the named Tor circuit group
    #[arg(long, conflicts_with = "tor")]
    tor_group: Option<String>,

    /// Tor state directory (defaults to the user data dir)
    #[arg(long)]
    tor_dir: Option<PathBuf>,
}

impl Connection {
    fn mode(&self) -> ServiceMode {
        match (&self.tor_group, self.tor) {
            (Some(group), _) => ServiceMode::TorInGroup(group.clone()),
            (None, true) => ServiceMode::DefaultTor,
            (None, false) => ServiceMode::Direct,
        }
    }

    fn client(&self) -> LightClient {
        let mut config = LightClientConfig::direct(&self.endpoint);
        if let Some(dir) = &self.tor_dir {
            config.tor = TorConfig {
                state_dir: dir.join("state"),
                cache_dir: dir.join("cache"),
            };
        }
        LightClient::with_config(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print server information
    Info {
        #[command(flatten)]
        connection: Connection,
    },

    /// Print the chain tip height
    Latest {
        #[command(flatten)]
        connection: Connection,
    },

    /// Download blocks into the block cache
    Download {
        #[command(flatten)]
        connection: Connection,

        /// First height (defaults to the block after the cache tip)
        #[arg(short, long)]
        start: Option<u64>,

        /// Number of blocks
        #[arg(short, long, default_value = "1000")]
        count: u64,

        /// Blocks per atomic write
        #[arg(short, long, default_value = "100")]
        batch: u64,

        /// Cache file (defaults to the per-endpoint cache)
        #[arg(long)]
        cache: Option<PathBuf>,
    },

    /// Remove cached blocks at or above a height
    Rewind {
        /// Lightwalletd endpoint the cache belongs to
        #[arg(short, long, default_value = DEFAULT_LIGHTD_URL)]
        endpoint: String,

        /// Cache file (defaults to the per-endpoint cache)
        #[arg(long)]
        cache: Option<PathBuf>,

        /// First height to remove
        height: u64,
    },

    /// Print the highest cached height
    CacheHeight {
        /// Lightwalletd endpoint the cache belongs to
        #[arg(short, long, default_value = DEFAULT_LIGHTD_URL)]
        endpoint: String,

        /// Cache file (defaults to the per-endpoint cache)
        #[arg(long)]
        cache: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    match cli.command {
        Commands::Info { connection } => run_info(connection).await?,
        Commands::Latest { connection } => run_latest(connection).await?,
        Commands::Download {
            connection,
            start,
            count,
            batch,
            cache,
        } => run_download(connection, start, count, batch, cache).await?,
        Commands::Rewind {
            endpoint,
            cache,
            height,
        } => run_rewind(&endpoint, cache, height).await?,
        Commands::CacheHeight { endpoint, cache } => run_cache_height(&endpoint, cache).await?,
    }

    Ok(())
}

fn open_cache(endpoint: &str, cache: Option<PathBuf>) -> anyhow::Result<SqliteBlockRepository> {
    let repo = match cache {
        Some(path) => SqliteBlockRepository::open(path)?,
        None => SqliteBlockRepository::for_endpoint(endpoint)?,
    };
    info!("Block cache: {}", repo.path().display());
    Ok(repo)
}

async fn run_info(connection: Connection) -> anyhow::Result<()> {
    let client = connection.client();
    let info = client
        .server_info(&connection.mode())
        .await
        .context("server info request failed")?;

    println!("Server:        {} {}", info.vendor, info.version);
    println!("Chain:         {}", info.chain_name);
    println!("Block height:  {}", info.block_height);
    println!("Estimated:     {}", info.estimated_height);
    println!("Sapling from:  {}", info.sapling_activation_height);
    println!("Branch id:     {}", info.consensus_branch_id);
    println!("Transparent:   {}", info.taddr_support);

    client.close_connection().await;
    Ok(())
}

async fn run_latest(connection: Connection) -> anyhow::Result<()> {
    let client = connection.client();
    let started = Instant::now();
    let height = client.latest_height(&connection.mode()).await?;
    println!("{}", height);
    info!("Latest height {} in {:?}", height, started.elapsed());
    client.close_connection().await;
    Ok(())
}

async fn run_download(
    connection: Connection,
    start: Option<u64>,
    count: u64,
    batch: u64,
    cache: Option<PathBuf>,
) -> anyhow::Result<()> {
    if count == 0 || batch == 0 {
        return Err(anyhow!("--count and --batch must be positive"));
    }

    let repo = Arc::new(open_cache(&connection.endpoint, cache)?);
    let cached_tip = repo.latest_height().await?;
    let start = match (start, cached_tip) {
        (Some(start), _) => start,
        (None, Some(tip)) => tip + 1,
        (None, None) => return Err(anyhow!("--start is required for an empty cache")),
    };
    let range = CompactBlockRange::new(start, start + count - 1)?;

    let client = Arc::new(connection.client());
    let downloader = Downloader::new(
        client.clone(),
        repo.clone(),
        SyncMarkers::new(),
        connection.mode(),
    );

    let cancel = CancelToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling download");
            ctrl_c.cancel();
        }
    });

    let pb = ProgressBar::new(range.count());
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("=>-"),
    );

    info!("Downloading {} ({} blocks per write)", range, batch);
    let started = Instant::now();
    for sub_range in range.batches(batch) {
        if let Err(e) = downloader.download_range(sub_range, &cancel).await {
            pb.abandon_with_message(format!("stopped before {}", sub_range.lower()));
            client.close_connection().await;
            return Err(e.into());
        }
        pb.inc(sub_range.count());
        pb.set_message(format!("height {}", sub_range.upper()));
    }
    pb.finish_with_message("done");

    let elapsed = started.elapsed();
    info!(
        "Downloaded {} blocks in {:.2}s ({:.1} blocks/s)",
        range.count(),
        elapsed.as_secs_f64(),
        range.count() as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    client.close_connection().await;
    Ok(())
}

async fn run_rewind(endpoint: &str, cache: Option<PathBuf>, height: u64) -> anyhow::Result<()> {
    let repo = open_cache(endpoint, cache)?;
    let before = repo.latest_height().await?;
    repo.rewind(height).await?;
    let after = repo.latest_height().await?;
    println!("Cache tip: {:?} -> {:?}", before, after);
    Ok(())
}

async fn run_cache_height(endpoint: &str, cache: Option<PathBuf>) -> anyhow::Result<()> {
    let repo = open_cache(endpoint, cache)?;
    match repo.latest_height().await? {
        Some(height) => println!("{}", height),
        None => println!("empty"),
    }
    Ok(())
}
