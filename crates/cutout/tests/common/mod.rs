//! Shared test utilities for cutout integration tests.

pub mod harness;

pub use harness::{jpeg_bytes, png_bytes, uploads, TestHarness};
