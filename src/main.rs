//! FlowSentry
//!
//! Imports network-flow and security-threat CSV exports, enriches them
//! with geolocation, and stores them for dashboarding.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod geo;
mod import;
mod models;
mod normalize;
mod storage;

use geo::cache::GeoCache;
use geo::rate_limit::{Clock, SystemClock};
use geo::GeoLookupService;
use import::ImportPipeline;
use models::RecordType;
use storage::document::DocumentStore;
use storage::timeseries::{InfluxConfig, TimeSeriesStore};
use storage::{StorageBackend, StorageMode, StorageRouter};

/// FlowSentry
#[derive(Parser, Debug)]
#[command(name = "flowsentry")]
#[command(about = "Import, enrich, and store network flow and threat data")]
struct Args {
    /// CSV file to import
    #[arg(long)]
    file: Option<PathBuf>,

    /// Directory of CSV files to import when no --file is given
    #[arg(long, env = "DOWNLOAD_DIR", default_value = "downloads")]
    dir: PathBuf,

    /// Record type for --file imports (directory imports infer it from
    /// file names)
    #[arg(long, default_value = "flows")]
    record_type: RecordType,

    /// Storage backend: document or timeseries
    #[arg(long, env = "STORAGE_MODE", default_value = "document")]
    storage_mode: StorageMode,

    /// SQLite database path for document mode
    #[arg(long, env = "DB_PATH", default_value = "data/flows.db")]
    db_path: PathBuf,

    /// InfluxDB URL
    #[arg(long, env = "INFLUXDB_URL", default_value = "http://localhost:8086")]
    influxdb_url: String,

    /// InfluxDB API token, required in timeseries mode
    #[arg(long, env = "INFLUXDB_TOKEN")]
    influxdb_token: Option<String>,

    /// InfluxDB organization
    #[arg(long, env = "INFLUXDB_ORG", default_value = "flowsentry")]
    influxdb_org: String,

    /// InfluxDB bucket
    #[arg(long, env = "INFLUXDB_BUCKET", default_value = "network-data")]
    influxdb_bucket: String,

    /// Enable geolocation enrichment
    #[arg(long, env = "GEOIP_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    geoip_enabled: bool,

    /// Geolocation cache directory
    #[arg(long, env = "GEOIP_CACHE_DIR", default_value = "geoip/cache")]
    geoip_cache_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowsentry=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    tracing::info!("Starting FlowSentry");

    // Storage backend, fixed for the process lifetime
    let backend: Box<dyn StorageBackend> = match args.storage_mode {
        StorageMode::Document => {
            if let Some(parent) = args.db_path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .context("Failed to create database directory")?;
                }
            }
            let url = format!("sqlite:{}?mode=rwc", args.db_path.display());
            let store = DocumentStore::connect(&url)
                .await
                .context("Failed to open document store")?;
            tracing::info!(path = %args.db_path.display(), "document store ready");
            Box::new(store)
        }
        StorageMode::Timeseries => {
            let token = args
                .influxdb_token
                .clone()
                .context("INFLUXDB_TOKEN is required when STORAGE_MODE is timeseries")?;
            let store = TimeSeriesStore::new(InfluxConfig {
                url: args.influxdb_url.clone(),
                token,
                org: args.influxdb_org.clone(),
                bucket: args.influxdb_bucket.clone(),
            })?;
            tracing::info!(
                url = args.influxdb_url,
                bucket = args.influxdb_bucket,
                "time-series store ready"
            );
            Box::new(store)
        }
    };

    // Geolocation enrichment, shared across imports
    let geo = if args.geoip_enabled {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = GeoCache::open(&args.geoip_cache_dir, clock.clone())
            .await
            .context("Failed to open geo cache")?;
        tracing::info!(
            cache_dir = %args.geoip_cache_dir.display(),
            "geolocation enrichment enabled (ipapi.co, ip-api.com)"
        );
        Some(Arc::new(GeoLookupService::with_default_chain(cache, clock)))
    } else {
        None
    };

    let router = StorageRouter::new(args.storage_mode, backend);
    let pipeline = ImportPipeline::new(router, geo);

    if let Some(file) = &args.file {
        let result = pipeline.import_file(file, args.record_type).await?;
        tracing::info!(
            total = result.total,
            imported = result.imported,
            errors = result.errors,
            "import finished"
        );
    } else {
        let results = pipeline.import_directory(&args.dir).await?;
        let (imported, errors) = results
            .iter()
            .fold((0u64, 0u64), |(i, e), r| (i + r.imported, e + r.errors));
        tracing::info!(
            files = results.len(),
            imported,
            errors,
            "directory import finished"
        );
    }

    Ok(())
}
