pub mod archive;
pub mod config;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod resolver;
pub mod retention;
pub mod sanitize;
pub mod service;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use archive::ArchiveBuilder;
pub use config::{load_config, load_config_with_env, Config};
pub use error::{
    ConfigError, CutoutError, JobError, Result, StorageError, TelemetryError, TransformError,
    WorkerError,
};
pub use jobs::{ImageRecord, ImageState, JobRecord, JobStore, Status, UploadedFile};
pub use pipeline::{
    FnTransform, PassthroughTransform, ProcessingPipeline, RgbaPngTransform, Transform,
};
pub use resolver::PathResolver;
pub use retention::{RetentionPolicy, RetentionSweeper, SweepReport, SweeperHandle};
pub use service::CutoutService;
pub use telemetry::{init_tracing, LogFormat};
pub use worker::WorkerPool;
