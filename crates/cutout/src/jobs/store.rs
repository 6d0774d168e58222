//! Job store with durable per-job manifests.
//!
//! One mutex guards the job table, the set of jobs currently claimed by a
//! worker, and every manifest write. Each mutation is applied and persisted
//! while the lock is held, so the manifest on disk always reflects the most
//! recent committed transition. The lock is never held across a transform.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{JobError, Result, StorageError};
use crate::jobs::manifest;
use crate::jobs::record::{ImageRecord, ImageState, JobRecord, Status};
use crate::jobs::{ORIGINALS_DIR, PROCESSED_DIR};
use crate::sanitize::{dedupe_filename, sanitize_filename};
use crate::storage::{self, JobLayout};

/// An uploaded file as handed over by the ingestion layer.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content: Vec<u8>,
}

impl UploadedFile {
    pub fn new(filename: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, JobRecord>,
    /// Jobs a worker is currently processing.
    active: HashSet<String>,
}

pub struct JobStore {
    jobs_root: PathBuf,
    table: Mutex<JobTable>,
}

impl JobStore {
    /// Opens a store rooted at `jobs_root`, creating the directory if needed.
    ///
    /// The table starts empty; call [`JobStore::load_all`] to pick up jobs
    /// persisted by a previous run.
    pub fn open<P: AsRef<Path>>(jobs_root: P) -> Result<Self> {
        let jobs_root = jobs_root.as_ref().to_path_buf();
        storage::filesystem::ensure_directory(&jobs_root)?;
        Ok(Self {
            jobs_root,
            table: Mutex::new(JobTable::default()),
        })
    }

    pub fn jobs_root(&self) -> &Path {
        &self.jobs_root
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.jobs_root.join(job_id)
    }

    fn lock(&self) -> MutexGuard<'_, JobTable> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Job table lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Writes the job's manifest. Callers hold the table lock, or own the only
    /// reference to a record no reader can see yet.
    fn persist(&self, job: &JobRecord) -> std::result::Result<(), StorageError> {
        let layout = JobLayout::new(&self.jobs_root, &job.job_id);
        let path = layout.manifest();
        let bytes = manifest::encode(job).map_err(|e| StorageError::Manifest {
            path: path.clone(),
            source: e,
        })?;
        storage::write_atomic(&path, &bytes)
    }

    /// Loads every job manifest found under the jobs root into the table.
    ///
    /// A manifest that cannot be read or parsed is logged and skipped; its
    /// directory stays on disk untouched. Returns the number of jobs loaded.
    pub fn load_all(&self) -> Result<usize> {
        let mut loaded = Vec::new();

        for entry in WalkDir::new(&self.jobs_root).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Skipping unreadable entry under jobs root: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }

            let dir_name = entry.file_name().to_string_lossy().to_string();
            let manifest_path = entry.path().join(manifest::MANIFEST_FILE);
            if !manifest_path.exists() {
                continue;
            }

            match self.read_manifest(&manifest_path) {
                Ok(mut job) if job.job_id == dir_name => {
                    reconcile_paths(&self.job_dir(&job.job_id), &mut job);
                    loaded.push(job);
                }
                Ok(job) => warn!(
                    "Skipping manifest in '{}': job id '{}' does not match its directory",
                    dir_name, job.job_id
                ),
                Err(e) => warn!("Skipping job '{}': {}", dir_name, e),
            }
        }

        let count = loaded.len();
        let mut table = self.lock();
        for job in loaded {
            table.jobs.insert(job.job_id.clone(), job);
        }
        drop(table);

        info!("Loaded {} jobs from {:?}", count, self.jobs_root);
        Ok(count)
    }

    fn read_manifest(&self, path: &Path) -> std::result::Result<JobRecord, StorageError> {
        let bytes = storage::read_file(path)?;
        manifest::decode(&bytes).map_err(|e| StorageError::Manifest {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Creates a job from uploaded files and persists it.
    ///
    /// The returned record is already durable on disk. Fails with
    /// [`JobError::InvalidInput`] before touching the filesystem if `files`
    /// is empty.
    pub fn create_job(&self, files: Vec<UploadedFile>) -> Result<JobRecord> {
        if files.is_empty() {
            return Err(JobError::InvalidInput("No files provided".to_string()).into());
        }

        let job_id = uuid::Uuid::new_v4().simple().to_string();
        let layout = JobLayout::new(&self.jobs_root, &job_id);
        layout.create()?;

        let mut job = JobRecord::new(job_id, Utc::now());
        if let Err(e) = self.store_originals(&layout, &mut job, files) {
            if let Err(cleanup) = storage::remove_path(layout.root()) {
                warn!("Failed to clean up partial job {}: {}", job.job_id, cleanup);
            }
            return Err(e.into());
        }

        let mut table = self.lock();
        table.jobs.insert(job.job_id.clone(), job.clone());
        if let Err(e) = self.persist(&job) {
            table.jobs.remove(&job.job_id);
            drop(table);
            if let Err(cleanup) = storage::remove_path(layout.root()) {
                warn!("Failed to clean up partial job {}: {}", job.job_id, cleanup);
            }
            return Err(e.into());
        }
        drop(table);

        info!("Created job {} with {} images", job.job_id, job.total());
        Ok(job)
    }

    fn store_originals(
        &self,
        layout: &JobLayout,
        job: &mut JobRecord,
        files: Vec<UploadedFile>,
    ) -> std::result::Result<(), StorageError> {
        let originals = layout.originals();
        let mut stored_names: HashSet<String> = HashSet::with_capacity(files.len());

        for file in files {
            let safe_name = dedupe_filename(&stored_names, &sanitize_filename(&file.filename));
            storage::write_new(&originals.join(&safe_name), &file.content)?;
            job.images.push(ImageRecord::new(&file.filename, &safe_name));
            stored_names.insert(safe_name);
        }
        Ok(())
    }

    /// Returns a deep copy of the job with its paths reconciled.
    pub fn snapshot(&self, job_id: &str) -> Result<JobRecord> {
        let mut job = self
            .lock()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        reconcile_paths(&self.job_dir(job_id), &mut job);
        Ok(job)
    }

    /// Snapshots of every job, newest first.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.lock().jobs.values().cloned().collect();
        for job in &mut jobs {
            let dir = self.job_dir(&job.job_id);
            reconcile_paths(&dir, job);
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.lock().jobs.contains_key(job_id)
    }

    pub fn mark_downloaded(&self, job_id: &str) -> Result<()> {
        self.update(job_id, |job| job.downloaded_at = Some(Utc::now()))
    }

    /// Applies `mutation` to the job and persists it, all under the lock.
    ///
    /// The in-memory change is kept even if the manifest write fails; the
    /// write error is returned so the caller can log it.
    pub(crate) fn update<F>(&self, job_id: &str, mutation: F) -> Result<()>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut table = self.lock();
        let job = table
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        mutation(job);
        self.persist(job)?;
        Ok(())
    }

    /// Applies `mutation` to one image of the job and persists.
    ///
    /// Only the image changes; the job status is left for the caller.
    pub(crate) fn update_image<F>(&self, job_id: &str, image_id: &str, mutation: F) -> Result<()>
    where
        F: FnOnce(&mut ImageRecord),
    {
        self.update(job_id, |job| match job.image_mut(image_id) {
            Some(image) => mutation(image),
            None => warn!("Image {} vanished from job {}", image_id, job_id),
        })
    }

    /// Claims a job for processing.
    ///
    /// Returns `None` if the job does not exist, has already finished, or is
    /// being processed by another worker. Otherwise marks it `processing`
    /// (a `failed` job stays `failed` while its remaining images run),
    /// persists, and returns a snapshot of the claimed record.
    pub(crate) fn begin_processing(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let mut guard = self.lock();
        let table = &mut *guard;

        if table.active.contains(job_id) {
            debug!("Job {} is already being processed", job_id);
            return Ok(None);
        }
        let job = match table.jobs.get_mut(job_id) {
            Some(job) if !job.is_finished() => job,
            _ => return Ok(None),
        };

        if job.status != Status::Failed {
            job.status = Status::Processing;
        }
        table.active.insert(job_id.to_string());
        let snapshot = job.clone();
        self.persist(job)?;
        Ok(Some(snapshot))
    }

    /// Derives the final job status, persists it, and releases the claim.
    pub(crate) fn finish_processing(&self, job_id: &str) -> Result<Status> {
        let mut guard = self.lock();
        let table = &mut *guard;
        table.active.remove(job_id);

        let job = table
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        job.finish();
        let status = job.status;
        self.persist(job)?;
        Ok(status)
    }

    /// Jobs with images still pending or mid-processing, e.g. when the
    /// previous run stopped before finishing them. Includes jobs already
    /// marked `failed` by an earlier image.
    pub fn unfinished_jobs(&self) -> Vec<String> {
        let table = self.lock();
        let mut jobs: Vec<&JobRecord> = table
            .jobs
            .values()
            .filter(|j| !j.is_finished() && !table.active.contains(&j.job_id))
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs.into_iter().map(|j| j.job_id.clone()).collect()
    }

    /// Jobs downloaded before `cutoff` that no worker is processing.
    pub fn expired_downloads(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let table = self.lock();
        table
            .jobs
            .values()
            .filter(|j| matches!(j.downloaded_at, Some(at) if at < cutoff))
            .filter(|j| !table.active.contains(&j.job_id))
            .map(|j| j.job_id.clone())
            .collect()
    }

    /// Drops a job from the table and deletes its directory tree.
    ///
    /// Returns `false` if the job was not in the table. The directory is
    /// removed even then, so half-deleted leftovers are cleaned up.
    pub fn remove_job(&self, job_id: &str) -> Result<bool> {
        let existed = self.lock().jobs.remove(job_id).is_some();
        storage::remove_path(&self.job_dir(job_id))?;
        Ok(existed)
    }
}

/// Rewrites absolute image paths to be relative to `job_dir`.
///
/// Paths under `job_dir` keep their relative remainder; any other absolute
/// path is reduced to its file name under the expected subdirectory. This
/// lets manifests written under a different jobs root keep working.
pub fn reconcile_paths(job_dir: &Path, job: &mut JobRecord) {
    for image in &mut job.images {
        if let Some(fixed) = reconcile_one(job_dir, &image.original_path, ORIGINALS_DIR) {
            image.original_path = fixed;
        }
        if let ImageState::Completed { processed_path, .. } = &mut image.state {
            if let Some(fixed) = reconcile_one(job_dir, processed_path, PROCESSED_DIR) {
                *processed_path = fixed;
            }
        }
    }
}

fn reconcile_one(job_dir: &Path, path: &Path, subdir: &str) -> Option<PathBuf> {
    if !path.is_absolute() {
        return None;
    }
    match path.strip_prefix(job_dir) {
        Ok(relative) => Some(relative.to_path_buf()),
        Err(_) => {
            let name = path.file_name()?;
            Some(Path::new(subdir).join(name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CutoutError;
    use tempfile::TempDir;

    fn files(names: &[&str]) -> Vec<UploadedFile> {
        names
            .iter()
            .map(|n| UploadedFile::new(*n, format!("bytes of {}", n)))
            .collect()
    }

    fn open_store(temp_dir: &TempDir) -> JobStore {
        JobStore::open(temp_dir.path().join("jobs")).unwrap()
    }

    #[test]
    fn test_create_job_rejects_empty_submission() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let err = store.create_job(vec![]).unwrap_err();
        assert!(matches!(err, CutoutError::Job(JobError::InvalidInput(_))));

        let entries: Vec<_> = std::fs::read_dir(store.jobs_root()).unwrap().collect();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_create_job_writes_originals_and_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let job = store.create_job(files(&["cat.png", "dog.jpg"])).unwrap();
        let layout = JobLayout::new(store.jobs_root(), &job.job_id);

        assert_eq!(job.status, Status::Pending);
        assert_eq!(job.total(), 2);
        assert!(layout.manifest().is_file());
        assert!(layout.processed().is_dir());
        assert_eq!(
            std::fs::read(layout.originals().join("cat.png")).unwrap(),
            b"bytes of cat.png"
        );

        let on_disk = manifest::decode(&std::fs::read(layout.manifest()).unwrap()).unwrap();
        assert_eq!(on_disk, job);
    }

    #[test]
    fn test_create_job_dedupes_and_sanitizes() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let job = store
            .create_job(files(&["a.jpg", "a.jpg", "../evil/a.jpg", "my pic.png"]))
            .unwrap();
        let stored: Vec<&str> = job.images.iter().map(|i| i.stored_filename.as_str()).collect();
        assert_eq!(stored, vec!["a.jpg", "a_1.jpg", "a_2.jpg", "my_pic.png"]);
        assert_eq!(job.images[2].original_filename, "../evil/a.jpg");
    }

    #[test]
    fn test_snapshot_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let err = store.snapshot("missing").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let job = store.create_job(files(&["a.png"])).unwrap();

        let before = store.snapshot(&job.job_id).unwrap();
        store.mark_downloaded(&job.job_id).unwrap();
        let after = store.snapshot(&job.job_id).unwrap();

        assert!(before.downloaded_at.is_none());
        assert!(after.downloaded_at.is_some());
    }

    #[test]
    fn test_mark_downloaded_persists() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let job = store.create_job(files(&["a.png"])).unwrap();

        store.mark_downloaded(&job.job_id).unwrap();

        let layout = JobLayout::new(store.jobs_root(), &job.job_id);
        let on_disk = manifest::decode(&std::fs::read(layout.manifest()).unwrap()).unwrap();
        assert!(on_disk.downloaded_at.is_some());

        assert!(store.mark_downloaded("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_load_all_restores_jobs() {
        let temp_dir = TempDir::new().unwrap();
        let job = {
            let store = open_store(&temp_dir);
            store.create_job(files(&["a.png", "b.png"])).unwrap()
        };

        let reopened = open_store(&temp_dir);
        assert_eq!(reopened.load_all().unwrap(), 1);
        assert_eq!(reopened.snapshot(&job.job_id).unwrap(), job);
    }

    #[test]
    fn test_load_all_skips_corrupt_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let good = store.create_job(files(&["a.png"])).unwrap();

        let bad_dir = store.jobs_root().join("broken");
        std::fs::create_dir_all(&bad_dir).unwrap();
        std::fs::write(bad_dir.join(manifest::MANIFEST_FILE), b"{ truncated").unwrap();
        std::fs::create_dir_all(store.jobs_root().join("no-manifest")).unwrap();
        std::fs::write(store.jobs_root().join("stray.txt"), b"x").unwrap();

        let reopened = open_store(&temp_dir);
        assert_eq!(reopened.load_all().unwrap(), 1);
        assert!(reopened.contains(&good.job_id));
        assert!(!reopened.contains("broken"));
        // Skipped, not deleted
        assert!(bad_dir.join(manifest::MANIFEST_FILE).exists());
    }

    #[test]
    fn test_load_all_skips_mismatched_job_id() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let job = store.create_job(files(&["a.png"])).unwrap();

        let moved = store.jobs_root().join("renamed");
        std::fs::rename(store.job_dir(&job.job_id), &moved).unwrap();

        let reopened = open_store(&temp_dir);
        assert_eq!(reopened.load_all().unwrap(), 0);
    }

    #[test]
    fn test_load_all_reconciles_absolute_paths() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let mut job = store.create_job(files(&["a.png", "b.png"])).unwrap();

        let job_dir = store.job_dir(&job.job_id);
        job.images[0].original_path = job_dir.join("originals/a.png");
        job.images[1].original_path = PathBuf::from("/other/deployment/jobs/x/originals/b.png");
        let now = Utc::now();
        job.images[1].state = ImageState::Completed {
            processed_path: PathBuf::from("/other/deployment/jobs/x/processed/b.png"),
            media_type: "image/png".to_string(),
            started_at: Some(now),
            completed_at: now,
        };
        let layout = JobLayout::new(store.jobs_root(), &job.job_id);
        storage::write_atomic(&layout.manifest(), &manifest::encode(&job).unwrap()).unwrap();

        let reopened = open_store(&temp_dir);
        reopened.load_all().unwrap();
        let loaded = reopened.snapshot(&job.job_id).unwrap();
        assert_eq!(loaded.images[0].original_path, PathBuf::from("originals/a.png"));
        assert_eq!(loaded.images[1].original_path, PathBuf::from("originals/b.png"));
        assert_eq!(
            loaded.images[1].processed_path(),
            Some(Path::new("processed/b.png"))
        );
    }

    #[test]
    fn test_begin_processing_claims_once() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let job = store.create_job(files(&["a.png"])).unwrap();

        let claimed = store.begin_processing(&job.job_id).unwrap();
        assert_eq!(claimed.map(|j| j.status), Some(Status::Processing));
        assert!(store.begin_processing(&job.job_id).unwrap().is_none());
        assert!(store.begin_processing("missing").unwrap().is_none());
        assert!(store.unfinished_jobs().is_empty());

        let image_id = job.images[0].image_id.clone();
        store
            .update_image(&job.job_id, &image_id, |img| {
                let target = img.processed_target();
                img.complete(target, "image/png".to_string(), Utc::now())
            })
            .unwrap();
        assert_eq!(store.finish_processing(&job.job_id).unwrap(), Status::Completed);
        // Finished jobs are never claimed again
        assert!(store.begin_processing(&job.job_id).unwrap().is_none());
    }

    #[test]
    fn test_failed_job_with_pending_images_is_claimed_and_stays_failed() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let job = store.create_job(files(&["a.png", "b.png"])).unwrap();
        let first_id = job.images[0].image_id.clone();
        store
            .update(&job.job_id, |record| {
                if let Some(img) = record.image_mut(&first_id) {
                    img.fail("bad".to_string(), Utc::now());
                }
                record.mark_failed();
            })
            .unwrap();

        assert_eq!(store.unfinished_jobs(), vec![job.job_id.clone()]);
        let claimed = store.begin_processing(&job.job_id).unwrap().unwrap();
        assert_eq!(claimed.status, Status::Failed);
        assert_eq!(claimed.pending_count(), 1);
        assert_eq!(store.finish_processing(&job.job_id).unwrap(), Status::Failed);
    }

    #[test]
    fn test_unfinished_jobs_oldest_first() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let first = store.create_job(files(&["a.png"])).unwrap();
        let second = store.create_job(files(&["b.png"])).unwrap();
        store
            .update(&second.job_id, |j| {
                j.created_at = first.created_at + chrono::Duration::seconds(1)
            })
            .unwrap();

        assert_eq!(
            store.unfinished_jobs(),
            vec![first.job_id.clone(), second.job_id.clone()]
        );
    }

    #[test]
    fn test_expired_downloads_and_remove() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let old = store.create_job(files(&["a.png"])).unwrap();
        let fresh = store.create_job(files(&["b.png"])).unwrap();
        let never = store.create_job(files(&["c.png"])).unwrap();

        let now = Utc::now();
        store
            .update(&old.job_id, |j| j.downloaded_at = Some(now - chrono::Duration::hours(13)))
            .unwrap();
        store.mark_downloaded(&fresh.job_id).unwrap();

        let cutoff = now - chrono::Duration::hours(12);
        assert_eq!(store.expired_downloads(cutoff), vec![old.job_id.clone()]);

        assert!(store.remove_job(&old.job_id).unwrap());
        assert!(!store.job_dir(&old.job_id).exists());
        assert!(!store.contains(&old.job_id));
        assert!(store.contains(&fresh.job_id));
        assert!(store.contains(&never.job_id));
        assert!(!store.remove_job(&old.job_id).unwrap());
    }

    #[test]
    fn test_list_newest_first() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let a = store.create_job(files(&["a.png"])).unwrap();
        let b = store.create_job(files(&["b.png"])).unwrap();
        store
            .update(&b.job_id, |j| j.created_at = a.created_at + chrono::Duration::seconds(5))
            .unwrap();

        let ids: Vec<String> = store.list().into_iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec![b.job_id, a.job_id]);
    }

    #[test]
    fn test_reconcile_leaves_relative_paths_alone() {
        let mut job = JobRecord::new("j".to_string(), Utc::now());
        job.images.push(ImageRecord::new("a.png", "a.png"));
        reconcile_paths(Path::new("/srv/jobs/j"), &mut job);
        assert_eq!(job.images[0].original_path, PathBuf::from("originals/a.png"));
    }
}
