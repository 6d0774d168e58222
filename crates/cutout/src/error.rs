use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CutoutError {
    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

impl CutoutError {
    /// Returns true if this error means the requested job (or an image of
    /// it) does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CutoutError::Job(JobError::NotFound(_) | JobError::ImageNotFound { .. })
        )
    }
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Image {image_id} not found in job {job_id}")]
    ImageNotFound { job_id: String, image_id: String },

    #[error("Path '{path}' escapes the directory of job {job_id}")]
    Traversal { job_id: String, path: PathBuf },

    #[error("No processed images available for job {0}")]
    NoContent(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove '{path}': {source}")]
    RemovePath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid manifest '{path}': {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write archive: {0}")]
    Archive(#[from] zip::result::ZipError),
}

/// Failure of the external transform capability for a single image.
///
/// Never propagated out of the pipeline: it is recorded on the image as
/// [`crate::jobs::ImageState::Failed`].
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Unsupported image type '{extension}'. Allowed extensions: {allowed}")]
    UnsupportedFormat { extension: String, allowed: String },

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Failed to encode image: {0}")]
    Encode(String),

    #[error("Background removal failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid value '{value}' for environment variable {name}")]
    InvalidEnv { name: String, value: String },
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("A global tracing subscriber is already installed: {0}")]
    SubscriberAlreadySet(String),

    #[error("A global logger is already installed: {0}")]
    LoggerAlreadySet(String),
}

pub type Result<T> = std::result::Result<T, CutoutError>;
