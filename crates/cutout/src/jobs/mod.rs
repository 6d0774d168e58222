pub mod manifest;
pub mod record;
pub mod store;

pub use manifest::MANIFEST_FILE;
pub use record::{
    ImageRecord, ImageState, JobRecord, Status, BATCH_FAILURE_MESSAGE, ORIGINALS_DIR,
    PROCESSED_DIR,
};
pub use store::{reconcile_paths, JobStore, UploadedFile};
