//! CSV import pipeline
//!
//! Streams rows through normalization, optional geolocation enrichment,
//! and the storage router. Row-level problems are counted and never abort
//! the stream; only a stream-level read error fails the import.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use csv_async::{AsyncReaderBuilder, StringRecord};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::RwLock;

use crate::geo::GeoLookupService;
use crate::models::{CanonicalRecord, ImportResult, LastImport, RecordGeo, RecordType};
use crate::normalize::{normalize, RawRow};
use crate::storage::{StorageMode, StorageRouter};

/// Fatal import failures. Everything row-level is absorbed into counters.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("failed to read import stream: {0}")]
    Stream(#[from] csv_async::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Process-wide "last import" record, queryable by the API layer
#[derive(Clone, Default)]
pub struct ImportStatus {
    inner: Arc<RwLock<Option<LastImport>>>,
}

impl ImportStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, last: LastImport) {
        *self.inner.write().await = Some(last);
    }

    pub async fn last(&self) -> Option<LastImport> {
        self.inner.read().await.clone()
    }
}

pub struct ImportPipeline {
    router: StorageRouter,
    geo: Option<Arc<GeoLookupService>>,
    status: ImportStatus,
}

impl ImportPipeline {
    pub fn new(router: StorageRouter, geo: Option<Arc<GeoLookupService>>) -> Self {
        Self {
            router,
            geo,
            status: ImportStatus::new(),
        }
    }

    /// Handle for querying the last completed import
    pub fn status(&self) -> ImportStatus {
        self.status.clone()
    }

    /// Import a CSV stream with a header row. Completes with counters
    /// unless the stream itself is unreadable.
    pub async fn import_reader<R>(
        &self,
        reader: R,
        record_type: RecordType,
        file_label: &str,
    ) -> Result<ImportResult, ImportError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut csv = AsyncReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .create_reader(reader);

        let headers = csv.headers().await?.clone();
        let mut result = ImportResult::new(record_type);
        let mut record = StringRecord::new();

        while csv.read_record(&mut record).await? {
            result.total += 1;

            let row: RawRow = headers
                .iter()
                .zip(record.iter())
                .map(|(header, value)| (header.to_string(), value.to_string()))
                .collect();
            let canonical = normalize(&row, record_type);
            let geo = self.enrich(&canonical).await;

            if self.router.write(&canonical, &geo).await {
                result.imported += 1;
            } else {
                result.errors += 1;
            }
        }

        // Records accepted into a backend buffer can still be lost when
        // the buffered drain fails; move those from imported to errors so
        // total == imported + errors holds.
        let lost = self.router.flush().await;
        result.imported = result.imported.saturating_sub(lost);
        result.errors += lost;

        self.status
            .record(LastImport {
                file: file_label.to_string(),
                timestamp: Utc::now(),
                result: result.clone(),
            })
            .await;

        tracing::info!(
            file = file_label,
            record_type = %record_type,
            total = result.total,
            imported = result.imported,
            errors = result.errors,
            "import completed"
        );
        Ok(result)
    }

    /// Import one CSV file
    pub async fn import_file(
        &self,
        path: &Path,
        record_type: RecordType,
    ) -> Result<ImportResult, ImportError> {
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ImportError::FileNotFound(path.to_path_buf())
            } else {
                ImportError::Io(e)
            }
        })?;

        let label = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.import_reader(file, record_type, &label).await
    }

    /// Import every `.csv` file in a directory. The record type is
    /// inferred from the file name: anything containing `threat` is a
    /// threats export, the rest are flows. A failing file is logged and
    /// skipped so one bad export does not block the rest.
    pub async fn import_directory(&self, dir: &Path) -> Result<Vec<ImportResult>, ImportError> {
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ImportError::FileNotFound(dir.to_path_buf())
            } else {
                ImportError::Io(e)
            }
        })?;

        let mut results = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if !name.ends_with(".csv") {
                continue;
            }

            let record_type = if name.contains("threat") {
                RecordType::Threats
            } else {
                RecordType::Flows
            };

            match self.import_file(&path, record_type).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "skipping file after import error");
                }
            }
        }

        tracing::info!(dir = %dir.display(), files = results.len(), "directory import completed");
        Ok(results)
    }

    /// Geo enrichment only feeds the time-series point shape; both address
    /// roles are looked up independently and either may be absent.
    async fn enrich(&self, record: &CanonicalRecord) -> RecordGeo {
        if self.router.mode() != StorageMode::Timeseries {
            return RecordGeo::default();
        }
        let Some(geo) = &self.geo else {
            return RecordGeo::default();
        };

        RecordGeo {
            source: geo.lookup(record.source_ip()).await,
            destination: geo.lookup(record.destination_ip()).await,
        }
    }
}
