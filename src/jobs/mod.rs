//! Detection jobs
//!
//! A job is one page's unit of detection work. The orchestrator owns the job
//! lifecycle, consults the result cache before processing, persists results
//! through the repository and reports progress on the event stream.
//!
//! ```text
//! pending -> processing -> completed | failed | cancelled
//! pending -> completed  (cache hit)
//! pending -> cancelled
//! ```

pub mod cache;
pub mod events;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{AppConfig, CacheConfig, JobConfig};
use crate::error::{DetectionError, Result};
use crate::pipeline::{StageProgress, SymbolDetectionPipeline};
use crate::storage::DetectionRepository;
use crate::types::{DetectionSettings, SymbolDetectionResult};

use cache::{CacheKey, ResultCache, TtlCache};
use events::{DetectionEvent, EventSink};

/// Lifecycle state of a detection job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the state machine allows moving from `self` to `to`
    pub fn can_transition(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, Completed)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(anyhow::anyhow!("Unknown job status: {}", other)),
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One page of one document awaiting detection
#[derive(Debug, Clone, Serialize)]
pub struct DetectionJob {
    pub id: Uuid,
    pub document_id: String,
    pub session_id: Option<String>,
    pub page_number: u32,
    /// Encoded page, released once the job reaches a terminal state
    #[serde(skip)]
    pub image_buffer: Arc<Vec<u8>>,
    pub settings: DetectionSettings,
    pub status: JobStatus,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
    /// Error detail for failed jobs
    pub error: Option<String>,
}

impl DetectionJob {
    pub fn new(
        document_id: impl Into<String>,
        session_id: Option<String>,
        page_number: u32,
        image_buffer: Vec<u8>,
        settings: DetectionSettings,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id: document_id.into(),
            session_id,
            page_number,
            image_buffer: Arc::new(image_buffer),
            settings,
            status: JobStatus::Pending,
            created_at_ms: now_millis(),
            started_at_ms: None,
            finished_at_ms: None,
            error: None,
        }
    }

    /// Apply a status change, recording timestamps
    pub fn transition(&mut self, to: JobStatus) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(DetectionError::InvalidTransition { from: self.status, to });
        }
        self.status = to;
        match to {
            JobStatus::Processing => self.started_at_ms = Some(now_millis()),
            s if s.is_terminal() => self.finished_at_ms = Some(now_millis()),
            _ => {}
        }
        Ok(())
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.image_buffer, self.page_number, &self.settings)
    }
}

struct JobEntry {
    job: DetectionJob,
    cancel: CancellationToken,
}

/// Live jobs plus the finished ones still answering status queries
#[derive(Default)]
struct JobTable {
    entries: HashMap<Uuid, JobEntry>,
    /// Terminal jobs, oldest first
    finished: VecDeque<Uuid>,
}

impl JobTable {
    /// Drop the page buffer of a job that just finished and forget the
    /// oldest finished jobs beyond `max_retained`
    fn retire(&mut self, id: Uuid, max_retained: usize) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.job.image_buffer = Arc::new(Vec::new());
        }
        self.finished.push_back(id);
        while self.finished.len() > max_retained {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
            debug!("Forgot finished job {}", oldest);
        }
    }
}

/// Runs jobs through the pipeline and owns their lifecycle
pub struct DetectionOrchestrator {
    pipeline: Arc<SymbolDetectionPipeline>,
    repository: Arc<dyn DetectionRepository>,
    cache: Arc<dyn ResultCache>,
    events: Arc<dyn EventSink>,
    job_config: JobConfig,
    cache_config: CacheConfig,
    jobs: Mutex<JobTable>,
    cache_hits: AtomicU64,
}

impl DetectionOrchestrator {
    pub fn new(
        pipeline: Arc<SymbolDetectionPipeline>,
        repository: Arc<dyn DetectionRepository>,
        events: Arc<dyn EventSink>,
        config: &AppConfig,
    ) -> Self {
        Self {
            pipeline,
            repository,
            cache: Arc::new(TtlCache::from_config(&config.cache)),
            events,
            job_config: config.jobs.clone(),
            cache_config: config.cache.clone(),
            jobs: Mutex::new(JobTable::default()),
            cache_hits: AtomicU64::new(0),
        }
    }

    /// Replace the in-process result cache
    pub fn with_cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Register a pending job
    pub fn submit(
        &self,
        document_id: impl Into<String>,
        session_id: Option<String>,
        page_number: u32,
        image_buffer: Vec<u8>,
        settings: DetectionSettings,
    ) -> Uuid {
        let job = DetectionJob::new(document_id, session_id, page_number, image_buffer, settings);
        let id = job.id;
        debug!("Submitted job {} for page {} of {}", id, job.page_number, job.document_id);
        self.jobs.lock().entries.insert(
            id,
            JobEntry {
                job,
                cancel: CancellationToken::new(),
            },
        );
        id
    }

    /// Submit and run a job in one call
    pub async fn detect(
        &self,
        document_id: impl Into<String>,
        session_id: Option<String>,
        page_number: u32,
        image_buffer: Vec<u8>,
        settings: DetectionSettings,
    ) -> Result<SymbolDetectionResult> {
        let id = self.submit(document_id, session_id, page_number, image_buffer, settings);
        self.run_job(id).await
    }

    /// Snapshot of a job
    pub fn job(&self, id: Uuid) -> Option<DetectionJob> {
        self.jobs.lock().entries.get(&id).map(|e| e.job.clone())
    }

    pub fn status(&self, id: Uuid) -> Option<JobStatus> {
        self.jobs.lock().entries.get(&id).map(|e| e.job.status)
    }

    /// Jobs currently known to the orchestrator, finished ones included
    pub fn retained_jobs(&self) -> usize {
        self.jobs.lock().entries.len()
    }

    /// Jobs belonging to a session, oldest first
    pub fn session_jobs(&self, session_id: &str) -> Vec<DetectionJob> {
        let mut jobs: Vec<DetectionJob> = self
            .jobs
            .lock()
            .entries
            .values()
            .filter(|e| e.job.session_id.as_deref() == Some(session_id))
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at_ms);
        jobs
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Request cancellation. Returns false when the job is unknown or
    /// already terminal.
    pub async fn cancel(&self, id: Uuid) -> bool {
        {
            let mut jobs = self.jobs.lock();
            let Some(entry) = jobs.entries.get_mut(&id) else {
                return false;
            };
            if entry.job.transition(JobStatus::Cancelled).is_err() {
                return false;
            }
            entry.cancel.cancel();
            jobs.retire(id, self.job_config.max_retained_jobs);
        }
        info!("Cancelled job {}", id);
        self.persist_status(id, JobStatus::Cancelled, None).await;
        true
    }

    /// Run a submitted job to a terminal state
    #[instrument(skip(self, id), fields(job_id = %id))]
    pub async fn run_job(&self, id: Uuid) -> Result<SymbolDetectionResult> {
        let (job, cancel) = {
            let jobs = self.jobs.lock();
            let entry = jobs
                .entries
                .get(&id)
                .ok_or_else(|| DetectionError::DetectionJob(format!("unknown job {}", id)))?;
            (entry.job.clone(), entry.cancel.clone())
        };
        match job.status {
            JobStatus::Pending => {}
            JobStatus::Cancelled => return Err(DetectionError::Cancelled),
            other => {
                return Err(DetectionError::DetectionJob(format!(
                    "job {} is already {}",
                    id, other
                )))
            }
        }

        let key = job.cache_key();
        if let Some(result) = self.cached_result(&key).await {
            return self.complete_from_cache(&job, result).await;
        }

        self.set_status(id, JobStatus::Processing, None).await?;
        self.events.emit(DetectionEvent::Started {
            job_id: id,
            document_id: job.document_id.clone(),
            page_number: job.page_number,
        });

        let events = self.events.clone();
        let progress = move |p: StageProgress| {
            events.emit(DetectionEvent::Progress {
                job_id: id,
                stage: p.stage,
                percent: p.percent,
                elapsed_ms: p.elapsed_ms,
            })
        };

        let hard_deadline_ms = job.settings.processing_timeout_ms + self.job_config.hard_deadline_grace_ms;
        let run = self.pipeline.run(
            &job.image_buffer,
            &job.settings,
            &job.document_id,
            job.page_number,
            &cancel,
            &progress,
        );

        match tokio::time::timeout(Duration::from_millis(hard_deadline_ms), run).await {
            Ok(Ok(result)) => self.complete(&job, &key, result).await,
            Ok(Err(DetectionError::Cancelled)) => {
                // cancel() already moved the job when it was requested externally
                if self.status(id) != Some(JobStatus::Cancelled) {
                    if let Err(e) = self.set_status(id, JobStatus::Cancelled, None).await {
                        debug!("Could not mark job {} cancelled: {}", id, e);
                    }
                }
                Err(DetectionError::Cancelled)
            }
            Ok(Err(e)) => {
                self.fail(id, &e).await;
                Err(e)
            }
            Err(_) => {
                cancel.cancel();
                let e = DetectionError::Timeout(hard_deadline_ms);
                warn!("Job {} exceeded its hard deadline of {}ms", id, hard_deadline_ms);
                self.fail(id, &e).await;
                Err(e)
            }
        }
    }

    async fn cached_result(&self, key: &CacheKey) -> Option<SymbolDetectionResult> {
        if !self.cache_config.enabled {
            return None;
        }
        if let Some(result) = self.cache.get(key) {
            return Some(result);
        }
        match self.repository.get_cached_result(key).await {
            Ok(Some(result)) => {
                self.cache.put(key.clone(), result.clone());
                Some(result)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Repository cache lookup for {} failed: {}", key, e);
                None
            }
        }
    }

    async fn complete_from_cache(
        &self,
        job: &DetectionJob,
        mut result: SymbolDetectionResult,
    ) -> Result<SymbolDetectionResult> {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.set_status(job.id, JobStatus::Completed, None).await?;
        result.detection_metadata.cache_hit = true;
        info!(
            "Cache hit for page {} of {}, reusing result {}",
            job.page_number, job.document_id, result.id
        );
        self.events.emit(DetectionEvent::Completed {
            job_id: job.id,
            result_id: result.id,
            symbol_count: result.detected_symbols.len(),
            processing_time_ms: result.processing_time_ms,
            cache_hit: true,
        });
        Ok(result)
    }

    async fn complete(
        &self,
        job: &DetectionJob,
        key: &CacheKey,
        result: SymbolDetectionResult,
    ) -> Result<SymbolDetectionResult> {
        if let Err(e) = self.set_status(job.id, JobStatus::Completed, None).await {
            // a job cancelled mid-run may already have been forgotten
            if matches!(self.status(job.id), Some(JobStatus::Cancelled) | None) {
                return Err(DetectionError::Cancelled);
            }
            return Err(e);
        }

        for symbol in &result.detected_symbols {
            self.events.emit(DetectionEvent::SymbolDetected {
                job_id: job.id,
                symbol: Box::new(symbol.clone()),
            });
        }

        let cacheable = self.cache_config.enabled && result.detection_metadata.is_cacheable();
        if cacheable {
            self.cache.put(key.clone(), result.clone());
        } else if self.cache_config.enabled {
            debug!("Not caching result {}, it depends on this run's load", result.id);
        }
        if let Err(e) = self.repository.save_result(&result).await {
            warn!("Failed to persist result {}: {}", result.id, e);
        }
        if cacheable {
            let ttl = Duration::from_secs(self.cache_config.ttl_secs);
            if let Err(e) = self.repository.cache_result(key, &result, ttl).await {
                warn!("Failed to cache result {}: {}", result.id, e);
            }
        }

        self.events.emit(DetectionEvent::Completed {
            job_id: job.id,
            result_id: result.id,
            symbol_count: result.detected_symbols.len(),
            processing_time_ms: result.processing_time_ms,
            cache_hit: false,
        });
        Ok(result)
    }

    async fn fail(&self, id: Uuid, error: &DetectionError) {
        let detail = error.to_string();
        warn!("Job {} failed: {}", id, detail);
        {
            let mut jobs = self.jobs.lock();
            if let Some(entry) = jobs.entries.get_mut(&id) {
                entry.job.error = Some(detail.clone());
            }
        }
        if let Err(e) = self.set_status(id, JobStatus::Failed, Some(&detail)).await {
            debug!("Could not mark job {} failed: {}", id, e);
        }
        self.events.emit(DetectionEvent::Error {
            job_id: id,
            kind: error.kind().to_string(),
            message: detail,
        });
    }

    /// Apply a transition in memory, then persist it
    async fn set_status(&self, id: Uuid, to: JobStatus, detail: Option<&str>) -> Result<()> {
        {
            let mut jobs = self.jobs.lock();
            let entry = jobs
                .entries
                .get_mut(&id)
                .ok_or_else(|| DetectionError::DetectionJob(format!("unknown job {}", id)))?;
            if entry.job.status == JobStatus::Cancelled && to != JobStatus::Cancelled {
                return Err(DetectionError::Cancelled);
            }
            entry.job.transition(to)?;
            if to.is_terminal() {
                jobs.retire(id, self.job_config.max_retained_jobs);
            }
        }
        self.persist_status(id, to, detail).await;
        Ok(())
    }

    async fn persist_status(&self, id: Uuid, status: JobStatus, detail: Option<&str>) {
        if let Err(e) = self.repository.update_job_status(id, status, detail).await {
            warn!("Failed to persist status {} for job {}: {}", status, id, e);
        }
    }
}
