//! Two-tier geolocation cache
//!
//! An in-memory map is the fast tier; per-address JSON files under the
//! cache directory are the durable tier. File-tier hits are promoted into
//! memory explicitly. Entries older than the TTL are treated as absent and
//! their backing file is removed on the read that discovers them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::geo::rate_limit::Clock;
use crate::models::GeoResult;

/// Cache entries expire after 30 days
const CACHE_TTL_DAYS: i64 = 30;

/// On-disk entry shape: `{ "timestamp": epoch_millis, "data": GeoResult }`
#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    timestamp: i64,
    data: GeoResult,
}

pub struct GeoCache {
    dir: PathBuf,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    memory: RwLock<HashMap<String, GeoResult>>,
}

impl GeoCache {
    /// Open the cache, creating the backing directory if needed
    pub async fn open(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create geo cache directory {}", dir.display()))?;

        Ok(Self {
            dir,
            ttl: Duration::days(CACHE_TTL_DAYS),
            clock,
            memory: RwLock::new(HashMap::new()),
        })
    }

    fn file_path(&self, ip: &str) -> PathBuf {
        self.dir.join(format!("{ip}.json"))
    }

    /// Look up an address. Memory tier first, then the file tier with
    /// promotion on hit. Expired file entries are deleted lazily.
    pub async fn get(&self, ip: &str) -> Option<GeoResult> {
        if let Some(hit) = self.memory.read().await.get(ip).cloned() {
            return Some(hit);
        }

        let path = self.file_path(ip);
        let entry = match read_entry(&path).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(ip, error = %e, "failed to read geo cache file");
                return None;
            }
        };

        let age_millis = self.clock.now().timestamp_millis() - entry.timestamp;
        if age_millis >= self.ttl.num_milliseconds() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(ip, error = %e, "failed to remove expired geo cache file");
            }
            return None;
        }

        // Promote into the fast tier
        self.memory
            .write()
            .await
            .insert(ip.to_string(), entry.data.clone());
        Some(entry.data)
    }

    /// Write both tiers unconditionally; last write wins. File-tier I/O
    /// failures are logged and absorbed, never surfaced.
    pub async fn put(&self, ip: &str, result: &GeoResult) {
        self.memory
            .write()
            .await
            .insert(ip.to_string(), result.clone());

        let entry = CacheFile {
            timestamp: self.clock.now().timestamp_millis(),
            data: result.clone(),
        };
        match serde_json::to_vec_pretty(&entry) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(self.file_path(ip), bytes).await {
                    tracing::warn!(ip, error = %e, "failed to write geo cache file");
                }
            }
            Err(e) => {
                tracing::warn!(ip, error = %e, "failed to serialize geo cache entry");
            }
        }
    }
}

async fn read_entry(path: &Path) -> Result<Option<CacheFile>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let entry = serde_json::from_slice(&bytes).context("malformed geo cache entry")?;
    Ok(Some(entry))
}
