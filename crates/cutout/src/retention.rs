//! Periodic reclamation of temp files and downloaded jobs.
//!
//! The sweeper runs on its own thread, driving a current-thread tokio runtime
//! with `tokio::time::interval`. A `watch` channel carries the stop signal so
//! a sleeping sweeper wakes up immediately when asked to stop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::sync::watch;
use walkdir::WalkDir;

use crate::error::WorkerError;
use crate::jobs::JobStore;
use crate::sanitize::redact_path;
use crate::storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Time between sweeps.
    pub interval: Duration,
    /// Entries directly under the temp root older than this are deleted.
    pub temp_file_max_age: Duration,
    /// Jobs downloaded longer ago than this are deleted.
    pub downloaded_job_retention: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1800),
            temp_file_max_age: Duration::from_secs(3600),
            downloaded_job_retention: Duration::from_secs(43200),
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub temp_entries_removed: usize,
    pub jobs_removed: usize,
}

pub struct RetentionSweeper {
    store: Arc<JobStore>,
    temp_root: PathBuf,
    policy: RetentionPolicy,
}

impl RetentionSweeper {
    pub fn new<P: AsRef<Path>>(
        store: Arc<JobStore>,
        temp_root: P,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            store,
            temp_root: temp_root.as_ref().to_path_buf(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Deletes files and directories directly under the temp root whose
    /// modification time is older than the configured maximum age.
    pub fn sweep_temp_dir(&self) -> usize {
        if !self.temp_root.exists() {
            return 0;
        }

        let now = SystemTime::now();
        let mut removed = 0;

        for entry in WalkDir::new(&self.temp_root).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable temp entry");
                    continue;
                }
            };

            let modified = match entry.metadata().map(|m| m.modified()) {
                Ok(Ok(t)) => t,
                // Vanished or unsupported, nothing to do
                _ => continue,
            };
            // A modification time in the future counts as fresh
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= self.policy.temp_file_max_age {
                continue;
            }

            match storage::remove_path(entry.path()) {
                Ok(()) => {
                    tracing::debug!(
                        entry = %redact_path(entry.path()),
                        "Removed stale temp entry"
                    );
                    removed += 1;
                }
                Err(e) => tracing::warn!(error = %e, "Failed to remove temp entry"),
            }
        }

        removed
    }

    /// Deletes jobs downloaded longer ago than the retention period.
    pub fn sweep_downloaded_jobs(&self) -> usize {
        let cutoff = match chrono::Duration::from_std(self.policy.downloaded_job_retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        {
            Some(cutoff) => cutoff,
            None => return 0,
        };

        let mut removed = 0;
        for job_id in self.store.expired_downloads(cutoff) {
            match self.store.remove_job(&job_id) {
                Ok(_) => {
                    tracing::info!(job_id = %job_id, "Removed downloaded job");
                    removed += 1;
                }
                Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to remove job"),
            }
        }
        removed
    }

    pub fn sweep_once(&self) -> SweepReport {
        let report = SweepReport {
            temp_entries_removed: self.sweep_temp_dir(),
            jobs_removed: self.sweep_downloaded_jobs(),
        };
        if report != SweepReport::default() {
            tracing::info!(
                temp_entries_removed = report.temp_entries_removed,
                jobs_removed = report.jobs_removed,
                "Retention sweep finished"
            );
        } else {
            tracing::debug!("Retention sweep: nothing to remove");
        }
        report
    }

    /// Starts sweeping every `policy.interval` on a background thread.
    ///
    /// The first sweep happens one interval after start.
    pub fn start(self: Arc<Self>) -> Result<SweeperHandle, WorkerError> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.policy.interval.max(Duration::from_millis(1));

        let thread = std::thread::Builder::new()
            .name("cutout-retention".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to build retention runtime");
                        return;
                    }
                };

                rt.block_on(async move {
                    tracing::info!(
                        interval_secs = interval.as_secs(),
                        "Retention sweeper started"
                    );

                    let mut ticker = tokio::time::interval(interval);
                    ticker.tick().await; // skip immediate first tick

                    loop {
                        tokio::select! {
                            changed = shutdown_rx.changed() => {
                                if changed.is_err() || *shutdown_rx.borrow() {
                                    break;
                                }
                            }
                            _ = ticker.tick() => {
                                self.sweep_once();
                            }
                        }
                    }

                    tracing::info!("Retention sweeper stopping");
                });
            })
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

        Ok(SweeperHandle {
            shutdown: shutdown_tx,
            thread: Some(thread),
        })
    }
}

/// Stops the background sweeper when told to, or when dropped.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Signals the sweeper and waits for its thread to exit.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        // Err only means the loop already exited
        let _ = self.shutdown.send(true);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Retention sweeper thread panicked");
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
