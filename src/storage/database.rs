//! SQLite repository
//!
//! Schema:
//! - detection_results: id -> result JSON, plus document/page columns for lookup
//! - result_cache: (document_hash, page_number, settings_hash) -> result JSON with expiry
//! - job_status: job_id -> status, error detail, last update

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;
use uuid::Uuid;

use crate::jobs::cache::CacheKey;
use crate::jobs::JobStatus;
use crate::storage::DetectionRepository;
use crate::types::SymbolDetectionResult;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS detection_results (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL,
    page_number INTEGER NOT NULL,
    overall_confidence REAL NOT NULL,
    processing_time_ms INTEGER NOT NULL,
    result_json TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS result_cache (
    document_hash TEXT NOT NULL,
    page_number INTEGER NOT NULL,
    settings_hash TEXT NOT NULL,
    result_json TEXT NOT NULL,
    expires_at INTEGER NOT NULL,
    PRIMARY KEY (document_hash, page_number, settings_hash)
);

CREATE TABLE IF NOT EXISTS job_status (
    job_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    detail TEXT,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_results_document ON detection_results(document_id, page_number);
";

/// Repository backed by one SQLite connection
#[derive(Clone)]
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open or create database at path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::init(conn)
    }

    /// Open in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .context("database task panicked")?
    }

    /// Latest persisted status of a job
    pub async fn job_status(&self, job_id: Uuid) -> Result<Option<(JobStatus, Option<String>)>> {
        self.with_conn(move |conn| {
            let row: Option<(String, Option<String>)> = conn
                .query_row(
                    "SELECT status, detail FROM job_status WHERE job_id = ?",
                    params![job_id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match row {
                Some((status, detail)) => {
                    let status: JobStatus = status.parse()?;
                    Ok(Some((status, detail)))
                }
                None => Ok(None),
            }
        })
        .await
    }

    /// Remove expired cache rows, returning how many were deleted
    pub async fn purge_expired_cache(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM result_cache WHERE expires_at <= ?", params![now_millis()])?;
            Ok(deleted)
        })
        .await
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[async_trait]
impl DetectionRepository for SqliteRepository {
    async fn save_result(&self, result: &SymbolDetectionResult) -> Result<()> {
        let json = serde_json::to_string(result)?;
        let id = result.id.to_string();
        let document_id = result.document_id.clone();
        let page = result.page_number as i64;
        let confidence = result.overall_confidence;
        let time = result.processing_time_ms as i64;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO detection_results
                 (id, document_id, page_number, overall_confidence, processing_time_ms, result_json, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![id, document_id, page, confidence, time, json, now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<SymbolDetectionResult>> {
        let json: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT result_json FROM detection_results WHERE id = ?",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .context("Failed to get result")
            })
            .await?;
        json.map(|j| serde_json::from_str(&j).context("Corrupt result JSON"))
            .transpose()
    }

    async fn get_cached_result(&self, key: &CacheKey) -> Result<Option<SymbolDetectionResult>> {
        let key = key.clone();
        let json: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT result_json FROM result_cache
                     WHERE document_hash = ? AND page_number = ? AND settings_hash = ? AND expires_at > ?",
                    params![key.document_hash, key.page_number as i64, key.settings_hash, now_millis()],
                    |row| row.get(0),
                )
                .optional()
                .context("Failed to read result cache")
            })
            .await?;
        json.map(|j| serde_json::from_str(&j).context("Corrupt cached result JSON"))
            .transpose()
    }

    async fn cache_result(&self, key: &CacheKey, result: &SymbolDetectionResult, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(result)?;
        let key = key.clone();
        let expires_at = now_millis() + ttl.as_millis() as i64;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO result_cache
                 (document_hash, page_number, settings_hash, result_json, expires_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![key.document_hash, key.page_number as i64, key.settings_hash, json, expires_at],
            )?;
            debug!("Cached result under {}", key);
            Ok(())
        })
        .await
    }

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus, detail: Option<&str>) -> Result<()> {
        let detail = detail.map(str::to_string);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO job_status (job_id, status, detail, updated_at) VALUES (?, ?, ?, ?)",
                params![job_id.to_string(), status.as_str(), detail, now_millis()],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        BoundingBox, DetectedSymbol, DetectionMetadata, DetectionMethod, DetectionSettings, SymbolType,
    };
    use tempfile::tempdir;

    fn sample_result() -> SymbolDetectionResult {
        let symbol = DetectedSymbol::new(
            SymbolType::Capacitor,
            0.8,
            BoundingBox::new(10.0, 10.0, 30.0, 20.0),
            DetectionMethod::Consensus,
        );
        SymbolDetectionResult::new("doc-7", 3, vec![symbol], 120, DetectionMetadata::default())
    }

    #[tokio::test]
    async fn test_result_roundtrip() {
        let repo = SqliteRepository::in_memory().unwrap();
        let result = sample_result();
        repo.save_result(&result).await.unwrap();

        let loaded = repo.get_result(result.id).await.unwrap().unwrap();
        assert_eq!(loaded, result);
        assert!(repo.get_result(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_respects_expiry() {
        let repo = SqliteRepository::in_memory().unwrap();
        let key = CacheKey::new(b"png", 3, &DetectionSettings::default());
        let result = sample_result();

        repo.cache_result(&key, &result, Duration::from_secs(60)).await.unwrap();
        assert_eq!(repo.get_cached_result(&key).await.unwrap(), Some(result.clone()));

        let other_page = CacheKey::new(b"png", 4, &DetectionSettings::default());
        assert!(repo.get_cached_result(&other_page).await.unwrap().is_none());

        repo.cache_result(&key, &result, Duration::ZERO).await.unwrap();
        assert!(repo.get_cached_result(&key).await.unwrap().is_none());
        assert_eq!(repo.purge_expired_cache().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_job_status_upsert() {
        let repo = SqliteRepository::in_memory().unwrap();
        let id = Uuid::new_v4();
        repo.update_job_status(id, JobStatus::Processing, None).await.unwrap();
        repo.update_job_status(id, JobStatus::Failed, Some("timeout")).await.unwrap();
        assert_eq!(
            repo.job_status(id).await.unwrap(),
            Some((JobStatus::Failed, Some("timeout".to_string())))
        );
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("symbols.db");
        let result = sample_result();
        {
            let repo = SqliteRepository::open(&path).unwrap();
            repo.save_result(&result).await.unwrap();
        }
        let reopened = SqliteRepository::open(&path).unwrap();
        assert_eq!(reopened.get_result(result.id).await.unwrap(), Some(result));
    }
}
