//! Central-difference TSDF gradients.
//!
//! Each block is padded to `(BLOCK_SIZE + 2)^3` with the facing voxel
//! layer of its six axis neighbours before differencing, so gradients
//! stay continuous across block boundaries. Unobserved samples and
//! absent neighbours read as zero in the padded buffer.

use glam::Vec3;
use rayon::prelude::*;

use crate::fusion::block::{grid_offset, BlockId, Index3, INVALID_TSDF, BLOCK_SIZE};
use crate::fusion::volume::Volume;

const PADDED: usize = BLOCK_SIZE + 2;
const PADDED_VOLUME: usize = PADDED * PADDED * PADDED;

fn padded_offset(i: usize, j: usize, k: usize) -> usize {
    i + PADDED * j + PADDED * PADDED * k
}

fn observed(tsdf: f32) -> f32 {
    if tsdf == INVALID_TSDF {
        0.0
    } else {
        tsdf
    }
}

/// Refresh the gradients of the given blocks. Ids without a block are
/// skipped.
pub fn update_gradients(volume: &Volume, ids: &[BlockId]) {
    ids.par_iter().for_each_init(
        || vec![0.0f32; PADDED_VOLUME],
        |padded, &id| {
            if volume.contains(id) {
                pack_tsdf(volume, id, padded);
                store_gradients(volume, id, padded);
            }
        },
    );
}

/// Refresh the gradients of every block, used before a full re-mesh.
pub fn update_all_gradients(volume: &Volume) {
    let ids = volume.all_ids();
    update_gradients(volume, &ids);
}

/// Copy a block's TSDF into the centre of `padded` and wrap it with the
/// facing layers of its six axis neighbours.
fn pack_tsdf(volume: &Volume, id: BlockId, padded: &mut [f32]) {
    let b = BLOCK_SIZE;
    {
        let block = match volume.block(id) {
            Some(block) => block,
            None => return,
        };
        let tsdf = block.tsdf();
        for k in 0..b {
            for j in 0..b {
                for i in 0..b {
                    padded[padded_offset(i + 1, j + 1, k + 1)] =
                        observed(tsdf[grid_offset(i, j, k)]);
                }
            }
        }
    }

    // Six face slabs: the neighbour's facing layer, or zero when absent.
    let faces: [(Index3, usize, usize); 6] = [
        (Index3::new(-1, 0, 0), 0, b - 1),
        (Index3::new(1, 0, 0), b + 1, 0),
        (Index3::new(0, -1, 0), 0, b - 1),
        (Index3::new(0, 1, 0), b + 1, 0),
        (Index3::new(0, 0, -1), 0, b - 1),
        (Index3::new(0, 0, 1), b + 1, 0),
    ];
    for (offset, padded_layer, source_layer) in faces {
        let neighbour = volume.block(id + offset);
        let tsdf = neighbour.as_ref().map(|block| block.tsdf());
        for a in 0..b {
            for c in 0..b {
                // (a, c) walks the two in-plane axes of the slab.
                let (dst, src) = if offset.x != 0 {
                    (
                        padded_offset(padded_layer, c + 1, a + 1),
                        grid_offset(source_layer, c, a),
                    )
                } else if offset.y != 0 {
                    (
                        padded_offset(c + 1, padded_layer, a + 1),
                        grid_offset(c, source_layer, a),
                    )
                } else {
                    (
                        padded_offset(c + 1, a + 1, padded_layer),
                        grid_offset(c, a, source_layer),
                    )
                };
                padded[dst] = tsdf.map_or(0.0, |t| observed(t[src]));
            }
        }
    }
}

/// Central differences over the padded buffer, written back to the block.
fn store_gradients(volume: &Volume, id: BlockId, padded: &[f32]) {
    let b = BLOCK_SIZE;
    let inv_res = 1.0 / volume.voxel_res();
    let mut block = match volume.block_mut(id) {
        Some(block) => block,
        None => return,
    };
    let gradients = block.gradients_mut();
    for k in 1..=b {
        for j in 1..=b {
            for i in 1..=b {
                let dx = padded[padded_offset(i + 1, j, k)] - padded[padded_offset(i - 1, j, k)];
                let dy = padded[padded_offset(i, j + 1, k)] - padded[padded_offset(i, j - 1, k)];
                let dz = padded[padded_offset(i, j, k + 1)] - padded[padded_offset(i, j, k - 1)];
                gradients[grid_offset(i - 1, j - 1, k - 1)] = Vec3::new(dx, dy, dz) * inv_res;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::block::VoxelId;
    use approx::assert_relative_eq;

    fn linear_x_volume() -> Volume {
        let mut volume = Volume::new(0.01);
        volume.add_block(BlockId::new(0, 0, 0));
        let mut block = volume.block_mut(BlockId::new(0, 0, 0)).unwrap();
        for k in 0..BLOCK_SIZE {
            for j in 0..BLOCK_SIZE {
                for i in 0..BLOCK_SIZE {
                    block.tsdf_mut()[grid_offset(i, j, k)] = i as f32 * 0.01;
                }
            }
        }
        drop(block);
        volume
    }

    #[test]
    fn test_interior_gradient_matches_central_difference() {
        let volume = linear_x_volume();
        update_all_gradients(&volume);
        let block = volume.block(BlockId::new(0, 0, 0)).unwrap();
        // tsdf = i * 0.01, so (t[i+1] - t[i-1]) / res = 0.02 / 0.01 = 2.
        let g = block.gradient_at(VoxelId::new(8, 8, 8));
        assert_relative_eq!(g.x, 2.0, epsilon = 1e-4);
        assert_relative_eq!(g.y, 0.0, epsilon = 1e-6);
        assert_relative_eq!(g.z, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_missing_neighbour_reads_zero() {
        let volume = linear_x_volume();
        update_all_gradients(&volume);
        let block = volume.block(BlockId::new(0, 0, 0)).unwrap();
        // At i = 15 the +X neighbour is absent: (0 - t[14]) / res.
        let g = block.gradient_at(VoxelId::new(15, 8, 8));
        assert_relative_eq!(g.x, (0.0 - 0.14) / 0.01, epsilon = 1e-3);
    }

    #[test]
    fn test_neighbour_face_is_used() {
        let mut volume = Volume::new(0.01);
        volume.add_block(BlockId::new(0, 0, 0));
        volume.add_block(BlockId::new(1, 0, 0));
        for (id, base) in [
            (BlockId::new(0, 0, 0), 0.0f32),
            (BlockId::new(1, 0, 0), BLOCK_SIZE as f32),
        ] {
            let mut block = volume.block_mut(id).unwrap();
            for k in 0..BLOCK_SIZE {
                for j in 0..BLOCK_SIZE {
                    for i in 0..BLOCK_SIZE {
                        block.tsdf_mut()[grid_offset(i, j, k)] = (base + i as f32) * 0.01;
                    }
                }
            }
        }
        update_all_gradients(&volume);
        let block = volume.block(BlockId::new(0, 0, 0)).unwrap();
        // The +X neighbour continues the ramp, so the face voxel sees the
        // same central difference as the interior.
        let g = block.gradient_at(VoxelId::new(15, 8, 8));
        assert_relative_eq!(g.x, 2.0, epsilon = 1e-4);
    }

    #[test]
    fn test_invalid_samples_read_zero() {
        let mut volume = Volume::new(0.01);
        volume.add_block(BlockId::new(0, 0, 0));
        {
            let mut block = volume.block_mut(BlockId::new(0, 0, 0)).unwrap();
            block.tsdf_mut()[grid_offset(7, 8, 8)] = 0.5;
            // Neighbours of (8, 8, 8) on the other axes stay INVALID.
        }
        update_all_gradients(&volume);
        let block = volume.block(BlockId::new(0, 0, 0)).unwrap();
        let g = block.gradient_at(VoxelId::new(8, 8, 8));
        assert_relative_eq!(g.x, (0.0 - 0.5) / 0.01, epsilon = 1e-3);
        assert_relative_eq!(g.y, 0.0, epsilon = 1e-6);
    }
}
