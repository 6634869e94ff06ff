//! Dataset streaming and synthetic depth rendering.

pub mod dataset;
pub mod synthetic;

pub use dataset::{DataStreamer, DatasetType, FrameRecord, StreamError};
