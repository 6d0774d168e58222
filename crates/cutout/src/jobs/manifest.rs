//! On-disk `job.json` format.
//!
//! The manifest keeps a flat layout (status plus nullable fields per image) so
//! it stays readable by other tooling. Conversion to the tagged in-memory
//! [`ImageState`] happens here and nowhere else.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::{
    guess_media_type, ImageRecord, ImageState, JobRecord, Status, PROCESSED_DIR,
};

/// File name of the manifest inside each job directory.
pub const MANIFEST_FILE: &str = "job.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEntry {
    pub image_id: String,
    pub original_filename: String,
    pub stored_filename: String,
    pub original_path: PathBuf,
    #[serde(default)]
    pub processed_path: Option<PathBuf>,
    #[serde(default)]
    pub processed_media_type: Option<String>,
    #[serde(default = "default_status")]
    pub status: Status,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManifest {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_status")]
    pub status: Status,
    #[serde(default)]
    pub images: Vec<ImageEntry>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub downloaded_at: Option<DateTime<Utc>>,
}

fn default_status() -> Status {
    Status::Pending
}

impl From<&ImageRecord> for ImageEntry {
    fn from(image: &ImageRecord) -> Self {
        Self {
            image_id: image.image_id.clone(),
            original_filename: image.original_filename.clone(),
            stored_filename: image.stored_filename.clone(),
            original_path: image.original_path.clone(),
            processed_path: image.processed_path().map(|p| p.to_path_buf()),
            processed_media_type: match &image.state {
                ImageState::Completed { media_type, .. } => Some(media_type.clone()),
                _ => None,
            },
            status: image.status(),
            error: image.error().map(|e| e.to_string()),
            started_at: image.started_at(),
            completed_at: image.completed_at(),
        }
    }
}

impl ImageEntry {
    /// Rebuilds the tagged state from flat fields.
    ///
    /// Hand-edited or older manifests may be inconsistent; missing data is
    /// filled in rather than rejected: a completed entry without a processed
    /// path points at `processed/<stored_filename>`, a failed entry without an
    /// error gets a generic message, and missing timestamps become the nearest
    /// known one, or `job_created_at` when the entry has none.
    fn into_record(self, job_created_at: DateTime<Utc>) -> ImageRecord {
        let fallback_time = self
            .completed_at
            .or(self.started_at)
            .unwrap_or(job_created_at);
        let state = match self.status {
            Status::Pending => ImageState::Pending,
            Status::Processing => match self.started_at {
                Some(started_at) => ImageState::Processing { started_at },
                None => ImageState::Pending,
            },
            Status::Completed => ImageState::Completed {
                processed_path: self
                    .processed_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(PROCESSED_DIR).join(&self.stored_filename)),
                media_type: self
                    .processed_media_type
                    .clone()
                    .unwrap_or_else(|| guess_media_type(&self.stored_filename)),
                started_at: self.started_at,
                completed_at: fallback_time,
            },
            Status::Failed => ImageState::Failed {
                error: self
                    .error
                    .clone()
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| "Unknown processing error".to_string()),
                started_at: self.started_at,
                completed_at: fallback_time,
            },
        };

        ImageRecord {
            image_id: self.image_id,
            original_filename: self.original_filename,
            stored_filename: self.stored_filename,
            original_path: self.original_path,
            state,
        }
    }
}

impl From<&JobRecord> for JobManifest {
    fn from(job: &JobRecord) -> Self {
        Self {
            job_id: job.job_id.clone(),
            created_at: job.created_at,
            status: job.status,
            images: job.images.iter().map(ImageEntry::from).collect(),
            error: job.error.clone(),
            downloaded_at: job.downloaded_at,
        }
    }
}

impl From<JobManifest> for JobRecord {
    fn from(manifest: JobManifest) -> Self {
        let created_at = manifest.created_at;
        Self {
            job_id: manifest.job_id,
            created_at,
            status: manifest.status,
            images: manifest
                .images
                .into_iter()
                .map(|entry| entry.into_record(created_at))
                .collect(),
            error: manifest.error,
            downloaded_at: manifest.downloaded_at,
        }
    }
}

/// Serializes a job to pretty-printed manifest JSON.
pub fn encode(job: &JobRecord) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(&JobManifest::from(job))
}

/// Parses manifest JSON into a job record.
pub fn decode(bytes: &[u8]) -> Result<JobRecord, serde_json::Error> {
    let manifest: JobManifest = serde_json::from_slice(bytes)?;
    Ok(manifest.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> JobRecord {
        let now = Utc::now();
        let mut job = JobRecord::new("0123abcd".to_string(), now);
        job.status = Status::Failed;
        job.error = Some(super::super::record::BATCH_FAILURE_MESSAGE.to_string());
        job.downloaded_at = Some(now);

        let pending = ImageRecord::new("p.png", "p.png");

        let mut done = ImageRecord::new("d.png", "d.png");
        done.start(now);
        done.complete(done.processed_target(), "image/png".to_string(), now);

        let mut failed = ImageRecord::new("f.png", "f.png");
        failed.start(now);
        failed.fail("decoder exploded".to_string(), now);

        let mut running = ImageRecord::new("r.png", "r.png");
        running.start(now);

        job.images = vec![pending, done, failed, running];
        job
    }

    #[test]
    fn test_round_trip_reproduces_record() {
        let job = sample_job();
        let bytes = encode(&job).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn test_flat_layout_uses_nulls_and_relative_paths() {
        let job = sample_job();
        let value: serde_json::Value = serde_json::from_slice(&encode(&job).unwrap()).unwrap();

        let pending = &value["images"][0];
        assert_eq!(pending["status"], "pending");
        assert!(pending["processed_path"].is_null());
        assert!(pending["error"].is_null());
        assert!(pending["started_at"].is_null());
        assert_eq!(pending["original_path"], "originals/p.png");

        let done = &value["images"][1];
        assert_eq!(done["status"], "completed");
        assert_eq!(done["processed_path"], "processed/d.png");
        assert_eq!(done["processed_media_type"], "image/png");
        assert!(pending["processed_media_type"].is_null());

        assert_eq!(value["images"][2]["error"], "decoder exploded");
        assert_eq!(value["status"], "failed");
    }

    #[test]
    fn test_decode_tolerates_missing_optional_fields() {
        let json = r#"{
            "job_id": "abc",
            "created_at": "2026-01-15T10:30:00+00:00",
            "images": [{
                "image_id": "i1",
                "original_filename": "a.jpg",
                "stored_filename": "a.jpg",
                "original_path": "originals/a.jpg"
            }]
        }"#;
        let job = decode(json.as_bytes()).unwrap();
        assert_eq!(job.status, Status::Pending);
        assert_eq!(job.images[0].state, ImageState::Pending);
        assert!(job.downloaded_at.is_none());
    }

    #[test]
    fn test_decode_repairs_inconsistent_entries() {
        let json = r#"{
            "job_id": "abc",
            "created_at": "2026-01-15T10:30:00Z",
            "status": "completed",
            "images": [
                {"image_id": "i1", "original_filename": "a.jpg", "stored_filename": "a.jpg",
                 "original_path": "originals/a.jpg", "status": "completed",
                 "completed_at": "2026-01-15T10:31:00Z"},
                {"image_id": "i2", "original_filename": "b.jpg", "stored_filename": "b.jpg",
                 "original_path": "originals/b.jpg", "status": "failed", "error": ""},
                {"image_id": "i3", "original_filename": "c.jpg", "stored_filename": "c.jpg",
                 "original_path": "originals/c.jpg", "status": "processing"}
            ]
        }"#;
        let job = decode(json.as_bytes()).unwrap();
        assert_eq!(
            job.images[0].processed_path(),
            Some(std::path::Path::new("processed/a.jpg"))
        );
        assert_eq!(job.images[1].error(), Some("Unknown processing error"));
        assert_eq!(job.images[2].status(), Status::Pending);
        // No stored media type, guessed from the name
        assert_eq!(job.images[0].processed_media_type(), "image/jpeg");
    }

    #[test]
    fn test_decode_without_timestamps_is_deterministic() {
        let json = r#"{
            "job_id": "abc",
            "created_at": "2026-01-15T10:30:00Z",
            "status": "failed",
            "images": [
                {"image_id": "i1", "original_filename": "a.jpg", "stored_filename": "a.jpg",
                 "original_path": "originals/a.jpg", "status": "completed"},
                {"image_id": "i2", "original_filename": "b.jpg", "stored_filename": "b.jpg",
                 "original_path": "originals/b.jpg", "status": "failed", "error": "bad"}
            ]
        }"#;
        let first = decode(json.as_bytes()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = decode(json.as_bytes()).unwrap();

        assert_eq!(first, second);
        let created: DateTime<Utc> = "2026-01-15T10:30:00Z".parse().unwrap();
        assert_eq!(first.images[0].completed_at(), Some(created));
        assert_eq!(first.images[1].completed_at(), Some(created));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"{ not json").is_err());
        assert!(decode(br#"{"job_id": "x"}"#).is_err());
    }
}
