use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::StorageError;

pub(crate) fn ensure_directory(path: &Path) -> Result<(), StorageError> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

/// Writes `content` to `path`, failing if the file already exists.
///
/// Uses `create_new` (O_CREAT | O_EXCL) so two uploads can never silently
/// overwrite each other.
pub fn write_new(path: &Path, content: &[u8]) -> Result<(), StorageError> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| StorageError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })?;

    file.write_all(content).map_err(|e| StorageError::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Replaces `path` with `content` atomically.
///
/// The bytes go to a temporary file in the same directory which is synced and
/// then renamed over the target, so readers (and a restart after a crash)
/// see either the previous content or the new content, never a torn write.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StorageError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let write_err = |source: std::io::Error| StorageError::WriteFile {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .map_err(write_err)?;
    tmp.write_all(content).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

pub fn read_file(path: &Path) -> Result<Vec<u8>, StorageError> {
    std::fs::read(path).map_err(|e| StorageError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Removes a file or a whole directory tree. A missing path is not an error.
pub fn remove_path(path: &Path) -> Result<(), StorageError> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(StorageError::RemovePath {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let result = if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::RemovePath {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Directory layout of a single job under the jobs root.
#[derive(Debug, Clone)]
pub struct JobLayout {
    root: PathBuf,
}

impl JobLayout {
    pub fn new(jobs_root: &Path, job_id: &str) -> Self {
        Self {
            root: jobs_root.join(job_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn originals(&self) -> PathBuf {
        self.root.join(crate::jobs::ORIGINALS_DIR)
    }

    pub fn processed(&self) -> PathBuf {
        self.root.join(crate::jobs::PROCESSED_DIR)
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join(crate::jobs::MANIFEST_FILE)
    }

    /// Creates the job directory with its `originals/` and `processed/`
    /// subdirectories.
    pub fn create(&self) -> Result<(), StorageError> {
        ensure_directory(&self.originals())?;
        ensure_directory(&self.processed())?;
        Ok(())
    }
}
