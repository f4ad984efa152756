//! Storage layer for imported records
//!
//! One backend trait with two implementations: an embedded SQLite document
//! store and an InfluxDB time-series writer. The router holds exactly one
//! backend, selected at construction time, and converts per-record write
//! failures into counted outcomes instead of propagating them.

pub mod document;
pub mod timeseries;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{CanonicalRecord, RecordGeo};

/// Which backend an import writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Document,
    Timeseries,
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageMode::Document => write!(f, "document"),
            StorageMode::Timeseries => write!(f, "timeseries"),
        }
    }
}

impl std::str::FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "document" => Ok(StorageMode::Document),
            "timeseries" | "influxdb" => Ok(StorageMode::Timeseries),
            other => Err(format!("unknown storage mode: {other}")),
        }
    }
}

/// A storage backend that accepts records and flushes buffered writes.
///
/// `write` may buffer internally; records accepted by `write` can still be
/// lost to a failed buffered drain, which `flush` reports as a lost-row
/// count so import totals stay consistent.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Accept one record. `Err` means this record failed.
    async fn write(&self, record: &CanonicalRecord, geo: &RecordGeo) -> Result<()>;

    /// Drain all buffers. Returns the number of previously accepted
    /// records lost to batch or flush failures. Never fails the import.
    async fn flush(&self) -> u64;
}

/// Backends shared across owners (e.g. a store that outlives the router)
/// delegate through the Arc
#[async_trait]
impl<B: StorageBackend + ?Sized> StorageBackend for Arc<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn write(&self, record: &CanonicalRecord, geo: &RecordGeo) -> Result<()> {
        (**self).write(record, geo).await
    }

    async fn flush(&self) -> u64 {
        (**self).flush().await
    }
}

/// Routes records to the single backend chosen at startup
pub struct StorageRouter {
    mode: StorageMode,
    backend: Box<dyn StorageBackend>,
}

impl StorageRouter {
    pub fn new(mode: StorageMode, backend: Box<dyn StorageBackend>) -> Self {
        Self { mode, backend }
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Write one record. Failures are logged and reported as `false`;
    /// they never abort the surrounding stream.
    pub async fn write(&self, record: &CanonicalRecord, geo: &RecordGeo) -> bool {
        match self.backend.write(record, geo).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    backend = self.backend.name(),
                    record_id = record.id(),
                    error = %e,
                    "record write failed"
                );
                false
            }
        }
    }

    /// Terminal flush for an import; returns accepted records lost to
    /// buffered-write failures.
    pub async fn flush(&self) -> u64 {
        self.backend.flush().await
    }
}
