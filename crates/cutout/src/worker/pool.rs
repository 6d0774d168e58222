use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::pipeline::ProcessingPipeline;

/// Fixed set of threads running [`ProcessingPipeline::process_job`] for
/// queued job ids.
///
/// Submission never blocks. After [`WorkerPool::shutdown`] new submissions
/// are refused, but everything already queued is still processed before
/// [`WorkerPool::wait`] returns.
pub struct WorkerPool {
    job_sender: Sender<String>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(
        pipeline: Arc<ProcessingPipeline>,
        worker_count: usize,
    ) -> Result<Self, WorkerError> {
        let worker_count = if worker_count == 0 {
            warn!("worker_count was 0, starting a single worker");
            1
        } else {
            worker_count
        };

        let (job_sender, job_receiver) = unbounded::<String>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let job_rx = job_receiver.clone();
            let worker_pipeline = Arc::clone(&pipeline);

            let spawned = thread::Builder::new()
                .name(format!("cutout-worker-{}", worker_id))
                .spawn(move || run_worker(worker_id, job_rx, worker_pipeline));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Let the threads that did start exit before reporting
                    drop(job_sender);
                    join_all(workers);
                    return Err(WorkerError::SpawnFailed(e.to_string()));
                }
            }
        }

        info!("Started {} workers", worker_count);

        Ok(Self {
            job_sender,
            workers,
            shutdown,
        })
    }

    /// Queues a job id for processing.
    pub fn submit(&self, job_id: impl Into<String>) -> Result<(), WorkerError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(WorkerError::ChannelClosed);
        }

        self.job_sender
            .send(job_id.into())
            .map_err(|_| WorkerError::ChannelClosed)
    }

    /// Number of job ids waiting for a free worker.
    pub fn queued(&self) -> usize {
        self.job_sender.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stops accepting new jobs.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Drains the queue and joins every worker.
    pub fn wait(self) {
        // Drop sender so workers exit once the queue is empty
        drop(self.job_sender);
        join_all(self.workers);
        info!("All workers have stopped");
    }
}

fn join_all(workers: Vec<JoinHandle<()>>) {
    for (i, worker) in workers.into_iter().enumerate() {
        if let Err(e) = worker.join() {
            error!("Worker {} panicked: {:?}", i, e);
        } else {
            debug!("Worker {} finished", i);
        }
    }
}

fn run_worker(
    worker_id: usize,
    job_receiver: Receiver<String>,
    pipeline: Arc<ProcessingPipeline>,
) {
    debug!("Worker {} started", worker_id);

    while let Ok(job_id) = job_receiver.recv() {
        debug!("Worker {} processing job {}", worker_id, job_id);
        pipeline.process_job(&job_id);
    }

    debug!("Worker {} job channel disconnected", worker_id);
}
