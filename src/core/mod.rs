//! Core geometry types shared by the whole pipeline.

pub mod camera;
pub mod frame;
pub mod pose;

pub use camera::Intrinsics;
pub use frame::RgbdFrame;
pub use pose::SE3;
