//! Isolated jobs/temp roots plus helpers for driving a running service.

#![allow(dead_code)]

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use cutout::{Config, CutoutService, JobRecord, PassthroughTransform, Transform, UploadedFile};

pub struct TestHarness {
    temp_dir: TempDir,
    pub jobs_root: PathBuf,
    pub temp_root: PathBuf,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let jobs_root = temp_dir.path().join("jobs");
        let temp_root = temp_dir.path().join("temp");
        Self {
            temp_dir,
            jobs_root,
            temp_root,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn config(&self) -> Config {
        Config {
            jobs_root: self.jobs_root.clone(),
            temp_root: self.temp_root.clone(),
            worker_count: 2,
            ..Config::default()
        }
    }

    pub fn start(&self, transform: Arc<dyn Transform>) -> CutoutService {
        CutoutService::start(self.config(), transform).expect("Failed to start service")
    }

    pub fn start_passthrough(&self) -> CutoutService {
        self.start(Arc::new(PassthroughTransform))
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.jobs_root.join(job_id)
    }

    /// Polls until the job reaches a terminal status.
    pub fn wait_for_finish(&self, service: &CutoutService, job_id: &str) -> JobRecord {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let job = service.snapshot(job_id).expect("job should exist");
            if job.is_finished() {
                return job;
            }
            assert!(
                Instant::now() < deadline,
                "job {} did not finish: {:?}",
                job_id,
                job.status
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Uploads whose content is the file name, which makes outputs easy to check.
pub fn uploads(names: &[&str]) -> Vec<UploadedFile> {
    names
        .iter()
        .map(|n| UploadedFile::new(*n, n.as_bytes().to_vec()))
        .collect()
}

/// A small opaque RGB PNG.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    encode_rgb(width, height, image::ImageFormat::Png)
}

/// A small RGB JPEG.
pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    encode_rgb(width, height, image::ImageFormat::Jpeg)
}

fn encode_rgb(width: u32, height: u32, format: image::ImageFormat) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([10, 120, 200]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, format)
        .expect("Failed to encode test image");
    out.into_inner()
}
