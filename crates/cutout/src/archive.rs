//! Zip archives of a job's processed images.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{JobError, Result, StorageError};
use crate::jobs::{JobRecord, JobStore};
use crate::resolver::PathResolver;
use crate::storage;

pub struct ArchiveBuilder {
    store: Arc<JobStore>,
    resolver: PathResolver,
    temp_root: PathBuf,
}

impl ArchiveBuilder {
    pub fn new<P: AsRef<Path>>(store: Arc<JobStore>, temp_root: P) -> Self {
        let resolver = PathResolver::new(store.jobs_root());
        Self {
            store,
            resolver,
            temp_root: temp_root.as_ref().to_path_buf(),
        }
    }

    /// Writes every processed image of `job` that exists on disk into a new
    /// `<job_id>_*.zip` under the temp root and marks the job downloaded.
    ///
    /// Entries are named by `stored_filename`. Fails with
    /// [`JobError::NoContent`] if no image has a processed file. The caller
    /// owns the returned file and should pass it to
    /// [`ArchiveBuilder::discard_archive`] once sent.
    pub fn build_archive(&self, job: &JobRecord) -> Result<PathBuf> {
        let mut entries = Vec::new();
        for image in &job.images {
            if let Some(path) = self.resolver.resolve_processed(job, image)? {
                if path.is_file() {
                    entries.push((path, image.stored_filename.as_str()));
                }
            }
        }
        if entries.is_empty() {
            return Err(JobError::NoContent(job.job_id.clone()).into());
        }

        storage::filesystem::ensure_directory(&self.temp_root)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!("{}_", job.job_id))
            .suffix(".zip")
            .tempfile_in(&self.temp_root)
            .map_err(|e| StorageError::WriteFile {
                path: self.temp_root.clone(),
                source: e,
            })?;

        {
            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            let mut writer = ZipWriter::new(&mut tmp);
            for (path, name) in &entries {
                writer
                    .start_file(*name, options)
                    .map_err(StorageError::Archive)?;
                let mut source = File::open(path).map_err(|e| StorageError::ReadFile {
                    path: path.clone(),
                    source: e,
                })?;
                std::io::copy(&mut source, &mut writer).map_err(|e| StorageError::WriteFile {
                    path: tmp_path_hint(&self.temp_root, &job.job_id),
                    source: e,
                })?;
            }
            writer.finish().map_err(StorageError::Archive)?;
        }

        // An unkept temp file is deleted on drop if this fails
        self.store.mark_downloaded(&job.job_id)?;

        let (_, path) = tmp.keep().map_err(|e| StorageError::WriteFile {
            path: tmp_path_hint(&self.temp_root, &job.job_id),
            source: e.error,
        })?;

        info!(
            "Built archive for job {} with {} files",
            job.job_id,
            entries.len()
        );
        Ok(path)
    }

    /// Deletes an archive produced by [`ArchiveBuilder::build_archive`].
    /// Failures are logged, never returned.
    pub fn discard_archive(&self, path: &Path) {
        if let Err(e) = storage::remove_path(path) {
            warn!("Failed to remove archive: {}", e);
        }
    }
}

fn tmp_path_hint(temp_root: &Path, job_id: &str) -> PathBuf {
    temp_root.join(format!("{}_*.zip", job_id))
}
