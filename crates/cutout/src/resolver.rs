//! Turns relative record paths into absolute paths that are guaranteed to sit
//! inside their job directory.

use std::path::{Path, PathBuf};

use log::warn;
use path_clean::PathClean;

use crate::error::{JobError, Result};
use crate::jobs::{ImageRecord, JobRecord};

#[derive(Debug, Clone)]
pub struct PathResolver {
    jobs_root: PathBuf,
}

impl PathResolver {
    pub fn new<P: AsRef<Path>>(jobs_root: P) -> Self {
        Self {
            jobs_root: jobs_root.as_ref().to_path_buf(),
        }
    }

    pub fn resolve_original(&self, job: &JobRecord, image: &ImageRecord) -> Result<PathBuf> {
        self.resolve_within(&job.job_id, &image.original_path)
    }

    /// `None` if the image has not been processed successfully.
    pub fn resolve_processed(
        &self,
        job: &JobRecord,
        image: &ImageRecord,
    ) -> Result<Option<PathBuf>> {
        match image.processed_path() {
            Some(path) => self.resolve_within(&job.job_id, path).map(Some),
            None => Ok(None),
        }
    }

    /// Resolves `relative` against the directory of `job_id`.
    ///
    /// Symlinks are followed on the longest existing prefix of the path and
    /// the missing remainder is normalized lexically. The result must lie
    /// strictly below the job directory, compared component by component, or
    /// [`JobError::Traversal`] is returned. Absolute inputs go through the
    /// same check.
    pub fn resolve_within(&self, job_id: &str, relative: &Path) -> Result<PathBuf> {
        let base = canonical_or_clean(&self.jobs_root.join(job_id));
        let resolved = canonical_or_clean(&base.join(relative));

        if resolved.starts_with(&base) && resolved != base {
            Ok(resolved)
        } else {
            warn!(
                "Rejected path outside job {}: {}",
                job_id,
                crate::sanitize::redact_path(relative)
            );
            Err(JobError::Traversal {
                job_id: job_id.to_string(),
                path: relative.to_path_buf(),
            }
            .into())
        }
    }
}

pub(crate) fn canonical_or_clean(path: &Path) -> PathBuf {
    if let Ok(p) = path.canonicalize() {
        return p;
    }

    let cleaned = absolute(path).clean();
    canonical_prefix(&cleaned).unwrap_or(cleaned)
}

/// Canonicalizes the deepest existing ancestor of `path` and appends the
/// components below it unchanged.
fn canonical_prefix(path: &Path) -> Option<PathBuf> {
    let mut missing = Vec::new();
    let mut existing = path;
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return Some(missing.iter().rev().fold(canonical, |acc, name| acc.join(name)));
        }
        missing.push(existing.file_name()?);
        existing = existing.parent()?;
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}
