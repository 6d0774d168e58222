//! In-memory job and image records.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subdirectory of a job holding the uploaded files.
pub const ORIGINALS_DIR: &str = "originals";
/// Subdirectory of a job holding transform output.
pub const PROCESSED_DIR: &str = "processed";
/// Batch-level error attached when any image fails.
pub const BATCH_FAILURE_MESSAGE: &str = "One or more images failed to process";

/// Status of a job or of a single image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }

    /// Returns true for `completed` and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing state of a single image.
///
/// The processed path only exists on `Completed` and the error only on
/// `Failed`, so neither can drift out of sync with the status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageState {
    Pending,
    Processing {
        started_at: DateTime<Utc>,
    },
    Completed {
        processed_path: PathBuf,
        /// Detected from the written output, not from the file name.
        media_type: String,
        started_at: Option<DateTime<Utc>>,
        completed_at: DateTime<Utc>,
    },
    Failed {
        error: String,
        started_at: Option<DateTime<Utc>>,
        completed_at: DateTime<Utc>,
    },
}

impl ImageState {
    pub fn status(&self) -> Status {
        match self {
            ImageState::Pending => Status::Pending,
            ImageState::Processing { .. } => Status::Processing,
            ImageState::Completed { .. } => Status::Completed,
            ImageState::Failed { .. } => Status::Failed,
        }
    }
}

/// One uploaded file and its processing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub image_id: String,
    /// Name as supplied by the client. Untrusted, never used on disk.
    pub original_filename: String,
    /// Sanitized, job-unique name used for both originals and output.
    pub stored_filename: String,
    /// Relative to the job directory.
    pub original_path: PathBuf,
    pub state: ImageState,
}

impl ImageRecord {
    /// Creates a pending record for a file stored under `originals/`.
    pub fn new(original_filename: &str, stored_filename: &str) -> Self {
        Self {
            image_id: uuid::Uuid::new_v4().simple().to_string(),
            original_filename: original_filename.to_string(),
            stored_filename: stored_filename.to_string(),
            original_path: Path::new(ORIGINALS_DIR).join(stored_filename),
            state: ImageState::Pending,
        }
    }

    pub fn status(&self) -> Status {
        self.state.status()
    }

    pub fn processed_path(&self) -> Option<&Path> {
        match &self.state {
            ImageState::Completed { processed_path, .. } => Some(processed_path),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            ImageState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            ImageState::Pending => None,
            ImageState::Processing { started_at } => Some(*started_at),
            ImageState::Completed { started_at, .. } | ImageState::Failed { started_at, .. } => {
                *started_at
            }
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            ImageState::Completed { completed_at, .. } | ImageState::Failed { completed_at, .. } => {
                Some(*completed_at)
            }
            _ => None,
        }
    }

    /// Relative path the transform output is written to.
    pub fn processed_target(&self) -> PathBuf {
        Path::new(PROCESSED_DIR).join(&self.stored_filename)
    }

    /// MIME type for serving the original under its client-supplied name.
    pub fn media_type(&self) -> String {
        guess_media_type(&self.original_filename)
    }

    /// MIME type for serving the processed output.
    ///
    /// Completed images report the type detected when the output was written.
    /// Anything else falls back to a guess from the stored name.
    pub fn processed_media_type(&self) -> String {
        match &self.state {
            ImageState::Completed { media_type, .. } => media_type.clone(),
            _ => guess_media_type(&self.stored_filename),
        }
    }

    pub(crate) fn start(&mut self, now: DateTime<Utc>) {
        self.state = ImageState::Processing { started_at: now };
    }

    pub(crate) fn complete(
        &mut self,
        processed_path: PathBuf,
        media_type: String,
        now: DateTime<Utc>,
    ) {
        self.state = ImageState::Completed {
            processed_path,
            media_type,
            started_at: self.started_at(),
            completed_at: now,
        };
    }

    pub(crate) fn fail(&mut self, error: String, now: DateTime<Utc>) {
        self.state = ImageState::Failed {
            error,
            started_at: self.started_at(),
            completed_at: now,
        };
    }
}

pub(crate) fn guess_media_type(name: &str) -> String {
    mime_guess::from_path(name)
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

/// One submitted batch of images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub status: Status,
    /// Submission order.
    pub images: Vec<ImageRecord>,
    /// Batch-level failure note.
    pub error: Option<String>,
    /// Set when an archive of this job was produced.
    pub downloaded_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(job_id: String, created_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            created_at,
            status: Status::Pending,
            images: Vec::new(),
            error: None,
            downloaded_at: None,
        }
    }

    pub fn total(&self) -> usize {
        self.images.len()
    }

    pub fn processed_count(&self) -> usize {
        self.count_where(|s| s == Status::Completed)
    }

    pub fn failed_count(&self) -> usize {
        self.count_where(|s| s == Status::Failed)
    }

    /// Images that are pending or currently processing.
    pub fn pending_count(&self) -> usize {
        self.count_where(|s| !s.is_terminal())
    }

    /// Fraction of images completed, `0.0` for an empty job.
    pub fn progress(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.processed_count() as f64 / total as f64
    }

    /// True once the job has a terminal status and no image is left to run.
    ///
    /// A job marked `failed` by an early image still has work while later
    /// images are pending.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal() && self.pending_count() == 0
    }

    pub fn image(&self, image_id: &str) -> Option<&ImageRecord> {
        self.images.iter().find(|i| i.image_id == image_id)
    }

    pub(crate) fn image_mut(&mut self, image_id: &str) -> Option<&mut ImageRecord> {
        self.images.iter_mut().find(|i| i.image_id == image_id)
    }

    /// Records an image failure on the job itself.
    pub(crate) fn mark_failed(&mut self) {
        self.status = Status::Failed;
        self.error = Some(BATCH_FAILURE_MESSAGE.to_string());
    }

    /// Final status once the processing loop has ended.
    pub(crate) fn finish(&mut self) {
        if self.status != Status::Failed {
            self.status = Status::Completed;
        }
    }

    fn count_where(&self, pred: impl Fn(Status) -> bool) -> usize {
        self.images.iter().filter(|i| pred(i.status())).count()
    }
}
