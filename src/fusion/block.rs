//! Block and voxel index math, plus the voxel block storage itself.
//!
//! The volume is a sparse grid of cubic blocks of `BLOCK_SIZE` voxels per
//! side. World points map to a block id (which block) and a voxel id
//! (which cell inside the block); both use arithmetic floor so negative
//! coordinates land on the cell toward negative infinity, and a point
//! exactly on a cell plane belongs to the positive side.

use std::hash::{BuildHasherDefault, Hash, Hasher};

use glam::Vec3;

/// Voxels per block side. Must stay a power of two for the shift mapping.
pub const BLOCK_SIZE: usize = 16;
/// log2(BLOCK_SIZE).
pub const BLOCK_SHIFT: u32 = BLOCK_SIZE.trailing_zeros();
/// Voxels per block.
pub const BLOCK_VOLUME: usize = BLOCK_SIZE * BLOCK_SIZE * BLOCK_SIZE;
/// TSDF value of a voxel that has never been observed.
pub const INVALID_TSDF: f32 = f32::MAX;

const HASH_P1: u64 = 73_856_093;
const HASH_P2: u64 = 19_349_663;
const HASH_P3: u64 = 83_492_791;

/// Integer 3-vector indexing blocks and voxels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Index3 {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

/// Index of a block in the sparse grid.
pub type BlockId = Index3;
/// Index of a voxel inside a block, each component in `[0, BLOCK_SIZE)`.
pub type VoxelId = Index3;

impl Index3 {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub const fn splat(v: i32) -> Self {
        Self { x: v, y: v, z: v }
    }

    /// Spatial hash of the id, the multiply-XOR scheme commonly used for
    /// voxel block maps.
    pub fn spatial_hash(&self) -> u64 {
        (self.x as i64 as u64).wrapping_mul(HASH_P1)
            ^ (self.y as i64 as u64).wrapping_mul(HASH_P2)
            ^ (self.z as i64 as u64).wrapping_mul(HASH_P3)
    }

    pub fn as_vec3(&self) -> Vec3 {
        Vec3::new(self.x as f32, self.y as f32, self.z as f32)
    }
}

impl Hash for Index3 {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.spatial_hash());
    }
}

impl std::ops::Add for Index3 {
    type Output = Index3;
    fn add(self, other: Index3) -> Index3 {
        Index3::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl std::ops::Sub for Index3 {
    type Output = Index3;
    fn sub(self, other: Index3) -> Index3 {
        Index3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl std::ops::Mul<Index3> for i32 {
    type Output = Index3;
    fn mul(self, id: Index3) -> Index3 {
        Index3::new(self * id.x, self * id.y, self * id.z)
    }
}

/// Hasher that passes the spatial hash through untouched, so the map
/// bucket really is the multiply-XOR value.
#[derive(Default)]
pub struct SpatialHasher(u64);

impl Hasher for SpatialHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        // Only u64 spatial hashes are ever fed in.
        let mut buf = [0u8; 8];
        let len = bytes.len().min(8);
        buf[..len].copy_from_slice(&bytes[..len]);
        self.0 = u64::from_ne_bytes(buf);
    }

    fn write_u64(&mut self, value: u64) {
        self.0 = value;
    }
}

pub type SpatialHashState = BuildHasherDefault<SpatialHasher>;

/// Block containing a world point.
pub fn block_of(p: Vec3, voxel_res: f32) -> BlockId {
    BlockId::new(
        ((p.x / voxel_res).floor() as i32) >> BLOCK_SHIFT,
        ((p.y / voxel_res).floor() as i32) >> BLOCK_SHIFT,
        ((p.z / voxel_res).floor() as i32) >> BLOCK_SHIFT,
    )
}

/// Voxel containing a world point, local to its block.
pub fn voxel_of(p: Vec3, voxel_res: f32) -> VoxelId {
    let b = BLOCK_SIZE as i32;
    VoxelId::new(
        ((p.x / voxel_res).floor() as i32).rem_euclid(b),
        ((p.y / voxel_res).floor() as i32).rem_euclid(b),
        ((p.z / voxel_res).floor() as i32).rem_euclid(b),
    )
}

/// Absolute voxel index of a (block, voxel) pair.
pub fn absolute_voxel(block: BlockId, voxel: VoxelId) -> Index3 {
    BLOCK_SIZE as i32 * block + voxel
}

/// World position of the origin corner of an absolute voxel.
pub fn voxel_pos(id: Index3, voxel_res: f32) -> Vec3 {
    voxel_res * id.as_vec3()
}

/// Linear offset of a voxel inside a block's arrays.
pub fn voxel_offset(voxel: VoxelId) -> usize {
    voxel.x as usize + BLOCK_SIZE * voxel.y as usize + BLOCK_SIZE * BLOCK_SIZE * voxel.z as usize
}

/// Same, for raw `(i, j, k)` coordinates.
pub fn grid_offset(i: usize, j: usize, k: usize) -> usize {
    i + BLOCK_SIZE * j + BLOCK_SIZE * BLOCK_SIZE * k
}

/// World position of a block's origin corner.
pub fn block_origin(id: BlockId, voxel_res: f32) -> Vec3 {
    BLOCK_SIZE as f32 * voxel_res * id.as_vec3()
}

/// One cubic chunk of the volume: parallel arrays of TSDF, weight,
/// gradient and (optionally) colour, one slot per voxel.
#[derive(Debug, Clone)]
pub struct VoxelBlock {
    use_color: bool,
    tsdf: Vec<f32>,
    weights: Vec<f32>,
    gradients: Vec<Vec3>,
    colors: Vec<Vec3>,
}

impl VoxelBlock {
    pub fn new(use_color: bool) -> Self {
        Self {
            use_color,
            tsdf: vec![INVALID_TSDF; BLOCK_VOLUME],
            weights: vec![0.0; BLOCK_VOLUME],
            gradients: vec![Vec3::ZERO; BLOCK_VOLUME],
            colors: if use_color {
                vec![Vec3::ZERO; BLOCK_VOLUME]
            } else {
                Vec::new()
            },
        }
    }

    pub fn use_color(&self) -> bool {
        self.use_color
    }

    pub fn tsdf_at(&self, voxel: VoxelId) -> f32 {
        self.tsdf[voxel_offset(voxel)]
    }

    pub fn weight_at(&self, voxel: VoxelId) -> f32 {
        self.weights[voxel_offset(voxel)]
    }

    pub fn gradient_at(&self, voxel: VoxelId) -> Vec3 {
        self.gradients[voxel_offset(voxel)]
    }

    pub fn color_at(&self, voxel: VoxelId) -> Vec3 {
        self.colors
            .get(voxel_offset(voxel))
            .copied()
            .unwrap_or(Vec3::ZERO)
    }

    pub fn tsdf(&self) -> &[f32] {
        &self.tsdf
    }

    pub fn tsdf_mut(&mut self) -> &mut [f32] {
        &mut self.tsdf
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }

    pub fn gradients(&self) -> &[Vec3] {
        &self.gradients
    }

    pub fn gradients_mut(&mut self) -> &mut [Vec3] {
        &mut self.gradients
    }

    /// Colour slots; empty when colour storage is disabled.
    pub fn colors(&self) -> &[Vec3] {
        &self.colors
    }

    pub fn colors_mut(&mut self) -> &mut [Vec3] {
        &mut self.colors
    }

    /// Reset to construction state.
    pub fn clear(&mut self) {
        self.tsdf.fill(INVALID_TSDF);
        self.weights.fill(0.0);
        self.gradients.fill(Vec3::ZERO);
        self.colors.fill(Vec3::ZERO);
    }

    /// Fold one weighted sample into a voxel, the running-average update
    /// shared by both integration variants.
    pub fn integrate_sample(&mut self, offset: usize, tsdf: f32, weight: f32, color: Vec3) {
        let old_weight = self.weights[offset];
        let sum = old_weight + weight;
        let old_tsdf = if old_weight > 0.0 { self.tsdf[offset] } else { 0.0 };
        self.tsdf[offset] = (old_weight * old_tsdf + weight * tsdf) / sum;
        if self.use_color {
            self.colors[offset] = (old_weight * self.colors[offset] + weight * color) / sum;
        }
        self.weights[offset] = sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_block_of_positive() {
        // 0.165 m / 0.01 = voxel 16 -> second block along x.
        let id = block_of(Vec3::new(0.165, 0.0, 0.0), 0.01);
        assert_eq!(id, BlockId::new(1, 0, 0));
    }

    #[test]
    fn test_block_of_negative_rounds_down() {
        let id = block_of(Vec3::new(-0.001, 0.0, 0.0), 0.01);
        assert_eq!(id, BlockId::new(-1, 0, 0));
    }

    #[test]
    fn test_voxel_of_is_always_in_range() {
        for &x in &[-0.31f32, -0.005, 0.0, 0.004, 0.27] {
            let v = voxel_of(Vec3::new(x, x, x), 0.01);
            assert!(v.x >= 0 && v.x < BLOCK_SIZE as i32);
        }
    }

    #[test]
    fn test_boundary_point_belongs_to_positive_side() {
        // Exactly on the plane between voxels 15 and 16 (exact floats).
        let p = Vec3::new(4.0, 0.0, 0.0);
        assert_eq!(block_of(p, 0.25), BlockId::new(1, 0, 0));
        assert_eq!(voxel_of(p, 0.25).x, 0);
    }

    #[test]
    fn test_absolute_voxel_roundtrip() {
        let p = Vec3::new(-0.123, 0.456, 0.789);
        let block = block_of(p, 0.01);
        let voxel = voxel_of(p, 0.01);
        let abs = absolute_voxel(block, voxel);
        let origin = voxel_pos(abs, 0.01);
        // The voxel origin is at most one cell away from the point.
        assert!((origin.x - p.x).abs() < 0.01 + 1e-6);
        assert!((origin.y - p.y).abs() < 0.01 + 1e-6);
        assert!((origin.z - p.z).abs() < 0.01 + 1e-6);
    }

    #[test]
    fn test_spatial_hash_constants() {
        assert_eq!(Index3::new(1, 0, 0).spatial_hash(), 73_856_093);
        assert_eq!(Index3::new(0, 1, 0).spatial_hash(), 19_349_663);
        assert_eq!(Index3::new(0, 0, 1).spatial_hash(), 83_492_791);
    }

    #[test]
    fn test_voxel_offset_linearisation() {
        assert_eq!(voxel_offset(VoxelId::new(0, 0, 0)), 0);
        assert_eq!(voxel_offset(VoxelId::new(1, 0, 0)), 1);
        assert_eq!(voxel_offset(VoxelId::new(0, 1, 0)), BLOCK_SIZE);
        assert_eq!(voxel_offset(VoxelId::new(0, 0, 1)), BLOCK_SIZE * BLOCK_SIZE);
        assert_eq!(
            voxel_offset(VoxelId::new(15, 15, 15)),
            BLOCK_VOLUME - 1
        );
    }

    #[test]
    fn test_new_block_is_unobserved() {
        let block = VoxelBlock::new(true);
        assert_eq!(block.tsdf_at(VoxelId::new(3, 4, 5)), INVALID_TSDF);
        assert_eq!(block.weight_at(VoxelId::new(3, 4, 5)), 0.0);
        assert_eq!(block.color_at(VoxelId::new(3, 4, 5)), Vec3::ZERO);
    }

    #[test]
    fn test_integrate_sample_running_average() {
        let mut block = VoxelBlock::new(true);
        block.integrate_sample(0, 0.02, 1.0, Vec3::ONE);
        block.integrate_sample(0, -0.02, 1.0, Vec3::ZERO);
        assert_relative_eq!(block.tsdf()[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(block.weights()[0], 2.0, epsilon = 1e-6);
        assert_relative_eq!(block.colors()[0].x, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_weight_is_sum_and_tsdf_is_convex() {
        let mut block = VoxelBlock::new(true);
        let samples = [(0.01f32, 0.9f32), (0.004, 0.3), (-0.002, 1.2), (0.015, 0.05)];
        for &(t, w) in &samples {
            block.integrate_sample(7, t, w, Vec3::ZERO);
        }
        let total: f32 = samples.iter().map(|&(_, w)| w).sum();
        assert_relative_eq!(block.weights()[7], total, epsilon = 1e-5);
        let min = samples.iter().map(|&(t, _)| t).fold(f32::MAX, f32::min);
        let max = samples.iter().map(|&(t, _)| t).fold(f32::MIN, f32::max);
        assert!(block.tsdf()[7] >= min - 1e-6 && block.tsdf()[7] <= max + 1e-6);
    }

    #[test]
    fn test_clear_resets() {
        let mut block = VoxelBlock::new(true);
        block.integrate_sample(11, 0.01, 1.0, Vec3::ONE);
        block.clear();
        assert_eq!(block.tsdf()[11], INVALID_TSDF);
        assert_eq!(block.weights()[11], 0.0);
    }
}
