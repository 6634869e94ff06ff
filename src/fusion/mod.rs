//! Sparse TSDF fusion.
//!
//! Architecture:
//! - `block.rs`: block/voxel index math and the voxel block storage
//! - `raycast.rs`: Bresenham walk enumerating the blocks a segment crosses
//! - `volume.rs`: block registry, mesh cache, PLY export, persistence
//! - `gradient.rs`: padded central-difference gradient pass
//! - `engine.rs`: per-frame allocation and weighted TSDF integration

pub mod block;
pub mod engine;
pub mod gradient;
pub mod raycast;
pub mod volume;


pub use block::{BlockId, Index3, VoxelBlock, VoxelId, BLOCK_SIZE, BLOCK_VOLUME, INVALID_TSDF};
pub use engine::{Fusion, DEPTH_SCALE};
pub use gradient::{update_all_gradients, update_gradients};
pub use raycast::raycast_blocks;
pub use volume::{BlockInsert, Volume, VolumeError};
