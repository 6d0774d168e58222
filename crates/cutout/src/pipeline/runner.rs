use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use tracing::info_span;

use crate::error::Result;
use crate::jobs::{ImageRecord, JobRecord, JobStore};
use crate::resolver::PathResolver;
use crate::sanitize;
use crate::storage;

use super::transform::{detect_media_type, Transform};

/// Drives one job through the per-image state machine.
///
/// Images run sequentially in submission order. Every transition is committed
/// to the [`JobStore`] (and so to the manifest) before the next step starts;
/// the store lock is never held while a transform runs.
pub struct ProcessingPipeline {
    store: Arc<JobStore>,
    resolver: PathResolver,
    transform: Arc<dyn Transform>,
}

/// What the caller should do after a store update.
enum Flow {
    Continue,
    Abort,
}

impl ProcessingPipeline {
    pub fn new(store: Arc<JobStore>, transform: Arc<dyn Transform>) -> Self {
        let resolver = PathResolver::new(store.jobs_root());
        Self {
            store,
            resolver,
            transform,
        }
    }

    /// Processes every non-terminal image of `job_id`.
    ///
    /// Returns without doing anything if the job does not exist, has already
    /// finished, or is being processed by another worker. Per-image failures
    /// are recorded on the image; nothing is returned to the caller.
    pub fn process_job(&self, job_id: &str) {
        let job = match self.claim(job_id) {
            Some(job) => job,
            None => return,
        };

        let _job_span =
            info_span!("process_job", job_id = %job_id, images = job.total()).entered();
        info!("Processing job {} ({} images)", job_id, job.total());

        for image in job.images.iter().filter(|i| !i.status().is_terminal()) {
            if let Flow::Abort = self.process_image(&job, image) {
                warn!("Job {} disappeared while processing, stopping", job_id);
                return;
            }
        }

        match self.store.finish_processing(job_id) {
            Ok(status) => info!("Job {} finished with status {}", job_id, status),
            Err(e) if e.is_not_found() => {
                warn!("Job {} disappeared before it could finish", job_id)
            }
            Err(e) => error!("Failed to persist final state of job {}: {}", job_id, e),
        }
    }

    fn claim(&self, job_id: &str) -> Option<JobRecord> {
        match self.store.begin_processing(job_id) {
            Ok(Some(job)) => Some(job),
            Ok(None) => {
                debug!("Job {} is missing, finished or already running", job_id);
                None
            }
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                // The claim is held in memory even though the manifest write failed
                error!("Failed to persist claim of job {}: {}", job_id, e);
                self.store.snapshot(job_id).ok()
            }
        }
    }

    fn process_image(&self, job: &JobRecord, image: &ImageRecord) -> Flow {
        let filename = sanitize::redact_path(&image.original_path);
        let _span = info_span!("process_image",
            image_id = %image.image_id,
            filename = %filename,
        )
        .entered();

        // Step 1: mark processing
        let started_at = Utc::now();
        let flow = self.commit(
            &job.job_id,
            self.store
                .update_image(&job.job_id, &image.image_id, |img| img.start(started_at)),
        );
        if let Flow::Abort = flow {
            return flow;
        }

        // Step 2: read, transform, write
        let outcome = {
            let _step = info_span!("transform").entered();
            self.run_transform(job, image)
        };

        // Step 3: record outcome
        let completed_at = Utc::now();
        let update = match outcome {
            Ok((processed_path, media_type)) => {
                debug!("Image {} of job {} completed", image.image_id, job.job_id);
                self.store.update_image(&job.job_id, &image.image_id, |img| {
                    img.complete(processed_path, media_type, completed_at)
                })
            }
            Err(message) => {
                warn!(
                    "Image {} of job {} failed: {}",
                    image.image_id, job.job_id, message
                );
                self.store.update(&job.job_id, |record| {
                    if let Some(img) = record.image_mut(&image.image_id) {
                        img.fail(message, completed_at);
                    }
                    record.mark_failed();
                })
            }
        };
        self.commit(&job.job_id, update)
    }

    fn commit(&self, job_id: &str, result: Result<()>) -> Flow {
        match result {
            Ok(()) => Flow::Continue,
            Err(e) if e.is_not_found() => Flow::Abort,
            Err(e) => {
                error!("Failed to persist job {}: {}", job_id, e);
                Flow::Continue
            }
        }
    }

    /// Returns the relative processed path and the detected media type of the
    /// output on success, or the message to record on the image.
    fn run_transform(
        &self,
        job: &JobRecord,
        image: &ImageRecord,
    ) -> std::result::Result<(PathBuf, String), String> {
        self.transform
            .supports(&image.stored_filename)
            .map_err(|e| e.to_string())?;

        let original = self
            .resolver
            .resolve_original(job, image)
            .map_err(|e| e.to_string())?;
        let relative_target = image.processed_target();
        let target = self
            .resolver
            .resolve_within(&job.job_id, &relative_target)
            .map_err(|e| e.to_string())?;

        let input = storage::read_file(&original).map_err(|e| e.to_string())?;

        let transform = &self.transform;
        let output = panic::catch_unwind(AssertUnwindSafe(|| transform.transform(&input)))
            .map_err(|payload| format!("Transform panicked: {}", panic_message(&*payload)))?
            .map_err(|e| e.to_string())?;

        if let Some(parent) = target.parent() {
            storage::filesystem::ensure_directory(parent).map_err(|e| e.to_string())?;
        }
        storage::write_atomic(&target, &output).map_err(|e| e.to_string())?;

        Ok((relative_target, detect_media_type(&output, &image.stored_filename)))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
