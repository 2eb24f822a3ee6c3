use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use glowcache::api::ApiClient;
use glowcache::cache::{PersistentCache, StorageAdapter};
use glowcache::config::Config;
use glowcache::logging;
use glowcache::snapshot::{Manifest, SnapshotFetcher};

#[derive(Parser, Debug)]
#[command(name = "glowcache")]
#[command(about = "Pre-fetch API responses and manage the local response cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./glowcache.yaml, then $XDG_CONFIG_HOME/glowcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Log at debug level unless RUST_LOG is set
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch every configured endpoint and write the manifest
  Snapshot {
    /// Override api.base_url
    #[arg(long)]
    base_url: Option<String>,

    /// Where to write the manifest
    #[arg(long)]
    cache_path: Option<PathBuf>,

    /// Where to publish a copy of the manifest
    #[arg(long)]
    public_path: Option<PathBuf>,
  },
  /// Load a manifest into the durable cache
  Seed {
    /// Manifest to read (default: snapshot.cache_path)
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// SQLite database to seed (default: cache.database)
    #[arg(long)]
    database: Option<PathBuf>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  let _guard = logging::init_tracing(args.verbose, config.log_dir.as_deref());

  match args.command {
    Command::Snapshot {
      base_url,
      cache_path,
      public_path,
    } => {
      if let Some(url) = base_url {
        config.api.base_url = url;
      }
      let cache_path = cache_path.unwrap_or_else(|| config.snapshot.cache_path.clone());
      let public_path = public_path.unwrap_or_else(|| config.snapshot.public_path.clone());
      snapshot(&config, &cache_path, &public_path).await
    }
    Command::Seed { manifest, database } => {
      let manifest = manifest.unwrap_or_else(|| config.snapshot.cache_path.clone());
      let database = match database {
        Some(path) => path,
        None => config.cache.database_path()?,
      };
      seed(&config, &manifest, &database)
    }
  }
}

async fn snapshot(config: &Config, cache_path: &Path, public_path: &Path) -> Result<()> {
  let client = ApiClient::new(&config.api)?;
  let endpoints = config.snapshot.endpoints();
  info!(endpoints = endpoints.len(), base_url = %client.base_url(), "fetching snapshot");

  let report = SnapshotFetcher::new(client, endpoints).run().await;
  report.manifest.publish(cache_path, public_path)?;

  info!(
    entries = report.manifest.len(),
    fingerprint = %report.manifest.fingerprint(),
    "snapshot complete"
  );
  if !report.failed.is_empty() {
    warn!(
      failed = report.failed.len(),
      keys = %report.failed.join(", "),
      "some endpoints failed; those sections will be fetched live at runtime"
    );
  }

  Ok(())
}

fn seed(config: &Config, manifest_path: &Path, database: &Path) -> Result<()> {
  let manifest = Manifest::load(manifest_path)?;
  let storage = StorageAdapter::open_sqlite(database, &config.cache.storage_prefix);
  if !storage.is_available() {
    return Err(eyre!("Cache database {} is unavailable", database.display()));
  }

  let written = PersistentCache::new(storage).seed_from_manifest(&manifest);
  info!(
    written,
    skipped = manifest.len() - written,
    database = %database.display(),
    "seed complete"
  );

  Ok(())
}
