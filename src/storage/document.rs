//! Embedded document store backed by SQLite
//!
//! Records accumulate in an in-process batch and are drained in one
//! transaction per 1,000 records, with a final drain on `flush`. Indexed
//! columns cover the dashboard's common filters; the full canonical record
//! rides along as a JSON column.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::models::{CanonicalRecord, RecordGeo};
use crate::storage::StorageBackend;

const BATCH_SIZE: usize = 1000;

pub struct DocumentStore {
    pool: SqlitePool,
    batch_size: usize,
    buffer: Mutex<Vec<CanonicalRecord>>,
    /// Accepted records lost to failed batch drains, reported at flush
    lost: AtomicU64,
}

impl DocumentStore {
    /// Connect and initialize the schema. `url` is a sqlx SQLite URL,
    /// e.g. `sqlite:data/flows.db?mode=rwc` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        // Single writer connection; the document backend serializes writes
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .with_context(|| format!("failed to open document store at {url}"))?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await
            .context("failed to enable WAL mode")?;

        let store = Self {
            pool,
            batch_size: BATCH_SIZE,
            buffer: Mutex::new(Vec::new()),
            lost: AtomicU64::new(0),
        };
        store.create_tables().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub(crate) fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size;
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                source_ip TEXT NOT NULL,
                destination_ip TEXT NOT NULL,
                source_port INTEGER NOT NULL,
                destination_port INTEGER NOT NULL,
                protocol TEXT NOT NULL,
                application TEXT NOT NULL,
                bytes INTEGER NOT NULL,
                packets INTEGER NOT NULL,
                record TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("failed to create flows table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS threats (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                source_ip TEXT NOT NULL,
                destination_ip TEXT NOT NULL,
                protocol TEXT NOT NULL,
                threat_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                record TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("failed to create threats table")?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_flows_timestamp ON flows (timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_flows_source_ip ON flows (source_ip)",
            "CREATE INDEX IF NOT EXISTS idx_flows_destination_ip ON flows (destination_ip)",
            "CREATE INDEX IF NOT EXISTS idx_flows_application ON flows (application)",
            "CREATE INDEX IF NOT EXISTS idx_threats_timestamp ON threats (timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_threats_source_ip ON threats (source_ip)",
            "CREATE INDEX IF NOT EXISTS idx_threats_threat_type ON threats (threat_type)",
        ] {
            sqlx::query(index)
                .execute(&self.pool)
                .await
                .context("failed to create index")?;
        }

        Ok(())
    }

    /// Insert one batch inside a single transaction
    async fn insert_batch(&self, batch: &[CanonicalRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to begin batch")?;

        for record in batch {
            let json = serde_json::to_string(record).context("failed to serialize record")?;
            match record {
                CanonicalRecord::Flow(f) => {
                    sqlx::query(
                        "INSERT OR REPLACE INTO flows (
                            id, timestamp, source_ip, destination_ip,
                            source_port, destination_port, protocol,
                            application, bytes, packets, record
                        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(&f.id)
                    .bind(f.timestamp.timestamp_millis())
                    .bind(&f.source_ip)
                    .bind(&f.destination_ip)
                    .bind(f.source_port as i64)
                    .bind(f.destination_port as i64)
                    .bind(&f.protocol)
                    .bind(&f.application)
                    .bind(f.bytes)
                    .bind(f.packets)
                    .bind(&json)
                    .execute(&mut *tx)
                    .await?;
                }
                CanonicalRecord::Threat(t) => {
                    sqlx::query(
                        "INSERT OR REPLACE INTO threats (
                            id, timestamp, source_ip, destination_ip,
                            protocol, threat_type, severity, record
                        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(&t.id)
                    .bind(t.timestamp.timestamp_millis())
                    .bind(&t.source_ip)
                    .bind(&t.destination_ip)
                    .bind(&t.protocol)
                    .bind(&t.threat_type)
                    .bind(&t.severity)
                    .bind(&json)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await.context("failed to commit batch")?;
        Ok(())
    }

    /// Drain the given records; a failed batch is logged and counted, not
    /// propagated
    async fn drain(&self, batch: Vec<CanonicalRecord>) {
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.insert_batch(&batch).await {
            tracing::warn!(rows = batch.len(), error = %e, "document batch insert failed");
            self.lost.fetch_add(batch.len() as u64, Ordering::SeqCst);
        }
    }

    pub async fn flow_count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM flows")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn threat_count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM threats")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

#[async_trait]
impl StorageBackend for DocumentStore {
    fn name(&self) -> &'static str {
        "document"
    }

    /// Geo enrichment is a time-series concern; the document store ignores
    /// it
    async fn write(&self, record: &CanonicalRecord, _geo: &RecordGeo) -> Result<()> {
        let full = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(record.clone());
            if buffer.len() >= self.batch_size {
                Some(std::mem::take(&mut *buffer))
            } else {
                None
            }
        };

        if let Some(batch) = full {
            self.drain(batch).await;
        }
        Ok(())
    }

    async fn flush(&self) -> u64 {
        let remaining = std::mem::take(&mut *self.buffer.lock().await);
        self.drain(remaining).await;
        self.lost.swap(0, Ordering::SeqCst)
    }
}
