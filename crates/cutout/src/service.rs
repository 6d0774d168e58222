//! The long-lived object a host application holds on to.
//!
//! [`CutoutService`] wires the job store, the worker pool, the archive
//! builder and the retention sweeper together and owns their lifetimes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};

use crate::archive::ArchiveBuilder;
use crate::config::{validate_config, Config};
use crate::error::{JobError, Result};
use crate::jobs::{ImageRecord, JobRecord, JobStore, UploadedFile};
use crate::pipeline::{ProcessingPipeline, Transform};
use crate::resolver::PathResolver;
use crate::retention::{RetentionSweeper, SweepReport, SweeperHandle};
use crate::storage;
use crate::worker::WorkerPool;

pub struct CutoutService {
    config: Config,
    store: Arc<JobStore>,
    resolver: PathResolver,
    archive: ArchiveBuilder,
    sweeper: Arc<RetentionSweeper>,
    sweeper_handle: SweeperHandle,
    pool: WorkerPool,
}

impl CutoutService {
    /// Starts the service.
    ///
    /// Creates both roots, loads persisted jobs, clears stale temp files,
    /// starts the workers and the sweeper, and queues every job left
    /// unfinished by a previous run.
    pub fn start(config: Config, transform: Arc<dyn Transform>) -> Result<Self> {
        validate_config(&config)?;

        storage::filesystem::ensure_directory(&config.temp_root)?;
        let store = Arc::new(JobStore::open(&config.jobs_root)?);
        store.load_all()?;

        let sweeper = Arc::new(RetentionSweeper::new(
            Arc::clone(&store),
            &config.temp_root,
            config.retention_policy(),
        ));
        let cleared = sweeper.sweep_temp_dir();
        if cleared > 0 {
            info!("Removed {} stale temp entries at startup", cleared);
        }

        let pipeline = Arc::new(ProcessingPipeline::new(Arc::clone(&store), transform));
        let pool = WorkerPool::new(pipeline, config.worker_count)?;
        let sweeper_handle = Arc::clone(&sweeper).start()?;

        let unfinished = store.unfinished_jobs();
        if !unfinished.is_empty() {
            info!("Resuming {} unfinished jobs", unfinished.len());
        }
        for job_id in unfinished {
            pool.submit(job_id)?;
        }

        let resolver = PathResolver::new(&config.jobs_root);
        let archive = ArchiveBuilder::new(Arc::clone(&store), &config.temp_root);

        info!(
            "Cutout service started (jobs: {:?}, temp: {:?}, workers: {})",
            config.jobs_root,
            config.temp_root,
            pool.worker_count()
        );

        Ok(Self {
            config,
            store,
            resolver,
            archive,
            sweeper,
            sweeper_handle,
            pool,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Creates a job and queues it for processing.
    ///
    /// The job is durable once this returns. If the pool has been shut down
    /// the job stays pending and is picked up on the next start.
    pub fn submit(&self, files: Vec<UploadedFile>) -> Result<JobRecord> {
        let job = self.store.create_job(files)?;
        if let Err(e) = self.pool.submit(job.job_id.clone()) {
            warn!("Job {} stored but not queued: {}", job.job_id, e);
        }
        Ok(job)
    }

    pub fn snapshot(&self, job_id: &str) -> Result<JobRecord> {
        self.store.snapshot(job_id)
    }

    /// All jobs, newest first.
    pub fn list_jobs(&self) -> Vec<JobRecord> {
        self.store.list()
    }

    pub fn resolve_original(&self, job_id: &str, image_id: &str) -> Result<PathBuf> {
        let job = self.store.snapshot(job_id)?;
        let image = find_image(&job, image_id)?;
        self.resolver.resolve_original(&job, image)
    }

    pub fn resolve_processed(&self, job_id: &str, image_id: &str) -> Result<Option<PathBuf>> {
        let job = self.store.snapshot(job_id)?;
        let image = find_image(&job, image_id)?;
        self.resolver.resolve_processed(&job, image)
    }

    pub fn build_archive(&self, job_id: &str) -> Result<PathBuf> {
        let job = self.store.snapshot(job_id)?;
        self.archive.build_archive(&job)
    }

    pub fn discard_archive(&self, path: &Path) {
        self.archive.discard_archive(path);
    }

    /// Runs one retention pass immediately, outside the schedule.
    pub fn sweep_now(&self) -> SweepReport {
        self.sweeper.sweep_once()
    }

    /// Stops the sweeper, lets the workers finish everything queued, then
    /// clears stale temp files one last time.
    pub fn shutdown(self) {
        info!("Shutting down cutout service...");
        self.sweeper_handle.stop();

        self.pool.shutdown();
        self.pool.wait();

        let cleared = self.sweeper.sweep_temp_dir();
        if cleared > 0 {
            info!("Removed {} stale temp entries at shutdown", cleared);
        }
        let left = self.store.unfinished_jobs().len();
        if left > 0 {
            warn!("{} jobs left unprocessed, they resume on next start", left);
        }
        info!("Cutout service stopped");
    }
}

fn find_image<'a>(job: &'a JobRecord, image_id: &str) -> Result<&'a ImageRecord> {
    job.image(image_id).ok_or_else(|| {
        JobError::ImageNotFound {
            job_id: job.job_id.clone(),
            image_id: image_id.to_string(),
        }
        .into()
    })
}
