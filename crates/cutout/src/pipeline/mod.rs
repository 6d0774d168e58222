pub mod runner;
pub mod transform;

pub use runner::ProcessingPipeline;
pub use transform::{FnTransform, PassthroughTransform, RgbaPngTransform, Transform};
