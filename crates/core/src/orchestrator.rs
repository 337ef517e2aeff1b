use crate::config::ServiceConfig;
use crate::error::{ExtractionError, JobFailure};
use crate::models::{DocumentReference, ExtractionResult, JobStage};
use crate::normalize::normalize;
use crate::traits::FigureEngine;
use crate::workspace::WorkspaceManager;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bookkeeping for one request. Lives only as long as `JobOrchestrator::run`.
#[derive(Debug)]
pub struct ExtractionJob {
    pub id: String,
    pub stage: JobStage,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Display form of the failure, set once the job is `Failed`.
    pub error: Option<String>,
    pub workspace_path: Option<PathBuf>,
    pub input_path: Option<PathBuf>,
    clock: Instant,
}

impl ExtractionJob {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            stage: JobStage::Pending,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            workspace_path: None,
            input_path: None,
            clock: Instant::now(),
        }
    }

    fn advance(&mut self, next: JobStage) {
        debug!(job_id = %self.id, from = %self.stage, to = %next, "job stage");
        self.stage = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.clock.elapsed().as_millis() as u64
    }

    /// Moves the job to `Failed`, logging the cause exactly once.
    fn fail(&mut self, cause: ExtractionError) -> JobFailure {
        let stage = self.stage;
        self.stage = JobStage::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(cause.to_string());

        if let ExtractionError::Engine { exit_code, diagnostics } = &cause {
            warn!(job_id = %self.id, ?exit_code, diagnostics = %diagnostics, "engine diagnostics");
        }
        error!(
            job_id = %self.id,
            stage = %stage,
            kind = ?cause.kind(),
            elapsed_ms = self.elapsed_ms(),
            error = %cause,
            "job failed"
        );

        JobFailure {
            job_id: self.id.clone(),
            stage,
            error: cause,
        }
    }
}

/// Runs the resolve, extract, normalize, publish pipeline for each request.
///
/// Jobs share only the configuration and the slot semaphore that caps how many
/// run at once.
pub struct JobOrchestrator<E>
where
    E: FigureEngine,
{
    config: Arc<ServiceConfig>,
    workspaces: WorkspaceManager,
    engine: E,
    slots: Arc<Semaphore>,
}

impl<E> JobOrchestrator<E>
where
    E: FigureEngine,
{
    pub fn new(config: Arc<ServiceConfig>, engine: E) -> Result<Self, ExtractionError> {
        let workspaces = WorkspaceManager::new(config.clone())?;
        let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs));

        Ok(Self {
            config,
            workspaces,
            engine,
            slots,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn active_jobs(&self) -> usize {
        self.config
            .max_concurrent_jobs
            .saturating_sub(self.slots.available_permits())
    }

    pub async fn run(&self, reference: DocumentReference) -> Result<ExtractionResult, JobFailure> {
        let mut job = ExtractionJob::new();
        info!(job_id = %job.id, engine = self.engine.name(), document = ?reference, "job accepted");

        let _slot = self.admit().await.map_err(|cause| job.fail(cause))?;

        job.advance(JobStage::Resolving);
        let workspace = self
            .workspaces
            .resolve(&job.id, reference)
            .await
            .map_err(|cause| job.fail(cause))?;
        job.workspace_path = Some(workspace.path().to_path_buf());
        job.input_path = Some(workspace.input_path().to_path_buf());

        job.advance(JobStage::Extracting);
        let raw = self
            .engine
            .invoke(workspace.input_path(), workspace.engine_dir())
            .await
            .map_err(|cause| job.fail(cause))?;
        let engine_ms = raw.elapsed_ms;

        job.advance(JobStage::Normalizing);
        let public_base_url = self.config.public_base_url.clone();
        let artifact_root = self.config.artifact_root();
        let published = tokio::task::spawn_blocking(move || {
            normalize(raw, &public_base_url).publish(&artifact_root)
        })
        .await
        .map_err(|cause| job.fail(ExtractionError::Storage(format!("normalization task failed: {cause}"))))?
        .map_err(|cause| job.fail(cause))?;

        let document = workspace.document().clone();
        if let Err(cause) = workspace.close() {
            warn!(
                job_id = %job.id,
                path = ?job.workspace_path,
                error = %cause,
                "workspace cleanup failed"
            );
        }

        job.advance(JobStage::Done);
        let elapsed_ms = job.elapsed_ms();
        info!(
            job_id = %job.id,
            elapsed_ms,
            engine_ms,
            regions = published.stats.total_regions,
            figures = published.stats.figures,
            tables = published.stats.tables,
            missing_artifacts = published.stats.missing_artifacts,
            "job finished"
        );

        Ok(ExtractionResult {
            job_id: job.id,
            document,
            regions: published.regions,
            stats: published.stats,
            started_at: job.started_at,
            finished_at: job.finished_at.unwrap_or_else(Utc::now),
            elapsed_ms,
        })
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit, ExtractionError> {
        let limit = self.config.max_concurrent_jobs;
        let wait = self.config.admission_timeout;

        if wait.is_zero() {
            return self
                .slots
                .clone()
                .try_acquire_owned()
                .map_err(|_| ExtractionError::Backpressure { limit });
        }

        match tokio::time::timeout(wait, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            _ => Err(ExtractionError::Backpressure { limit }),
        }
    }
}
