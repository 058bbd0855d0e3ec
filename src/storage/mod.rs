//! Storage Layer
//!
//! Persistence of detection results, the cross-process result cache and job
//! status, behind the [`DetectionRepository`] trait. SQLite backs the
//! deployed binary, the in-memory repository backs tests and one-shot runs.

pub mod database;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::jobs::cache::CacheKey;
use crate::jobs::JobStatus;
use crate::types::SymbolDetectionResult;

pub use database::SqliteRepository;

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "schematic-symbols", "SchematicSymbols")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;

    let data_dir = proj_dirs.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;

    Ok(data_dir)
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "schematic-symbols", "SchematicSymbols")
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

    let config_dir = proj_dirs.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}

/// Fallible persistence used by the orchestrator
#[async_trait]
pub trait DetectionRepository: Send + Sync {
    async fn save_result(&self, result: &SymbolDetectionResult) -> Result<()>;

    async fn get_result(&self, id: Uuid) -> Result<Option<SymbolDetectionResult>>;

    /// Cached result for the key, `None` when absent or expired
    async fn get_cached_result(&self, key: &CacheKey) -> Result<Option<SymbolDetectionResult>>;

    async fn cache_result(&self, key: &CacheKey, result: &SymbolDetectionResult, ttl: Duration) -> Result<()>;

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus, detail: Option<&str>) -> Result<()>;
}

/// Process-local repository
#[derive(Default)]
pub struct MemoryRepository {
    results: Mutex<HashMap<Uuid, SymbolDetectionResult>>,
    cached: Mutex<HashMap<CacheKey, (Instant, SymbolDetectionResult)>>,
    statuses: Mutex<HashMap<Uuid, (JobStatus, Option<String>)>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_status(&self, job_id: Uuid) -> Option<(JobStatus, Option<String>)> {
        self.statuses.lock().get(&job_id).cloned()
    }

    pub fn result_count(&self) -> usize {
        self.results.lock().len()
    }
}

#[async_trait]
impl DetectionRepository for MemoryRepository {
    async fn save_result(&self, result: &SymbolDetectionResult) -> Result<()> {
        self.results.lock().insert(result.id, result.clone());
        Ok(())
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<SymbolDetectionResult>> {
        Ok(self.results.lock().get(&id).cloned())
    }

    async fn get_cached_result(&self, key: &CacheKey) -> Result<Option<SymbolDetectionResult>> {
        let mut cached = self.cached.lock();
        match cached.get(key) {
            Some((expires, result)) if Instant::now() < *expires => Ok(Some(result.clone())),
            Some(_) => {
                cached.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn cache_result(&self, key: &CacheKey, result: &SymbolDetectionResult, ttl: Duration) -> Result<()> {
        self.cached
            .lock()
            .insert(key.clone(), (Instant::now() + ttl, result.clone()));
        Ok(())
    }

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus, detail: Option<&str>) -> Result<()> {
        self.statuses
            .lock()
            .insert(job_id, (status, detail.map(str::to_string)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DetectionMetadata, DetectionSettings};

    #[tokio::test]
    async fn test_memory_repository_roundtrip() {
        let repo = MemoryRepository::new();
        let result = SymbolDetectionResult::new("doc", 2, Vec::new(), 7, DetectionMetadata::default());
        repo.save_result(&result).await.unwrap();
        assert_eq!(repo.get_result(result.id).await.unwrap(), Some(result.clone()));
        assert!(repo.get_result(Uuid::new_v4()).await.unwrap().is_none());
        assert_eq!(repo.result_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_cache_expiry() {
        let repo = MemoryRepository::new();
        let key = CacheKey::new(b"bytes", 1, &DetectionSettings::default());
        let result = SymbolDetectionResult::new("doc", 1, Vec::new(), 7, DetectionMetadata::default());

        repo.cache_result(&key, &result, Duration::from_secs(60)).await.unwrap();
        assert!(repo.get_cached_result(&key).await.unwrap().is_some());

        repo.cache_result(&key, &result, Duration::ZERO).await.unwrap();
        assert!(repo.get_cached_result(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_job_status() {
        let repo = MemoryRepository::new();
        let id = Uuid::new_v4();
        repo.update_job_status(id, JobStatus::Failed, Some("boom")).await.unwrap();
        assert_eq!(repo.job_status(id), Some((JobStatus::Failed, Some("boom".to_string()))));
    }
}
