//! Block-wise Marching Cubes with seam stitching.
//!
//! A block is triangulated in up to seven passes: the inner cubes, three
//! face strips against the +X/+Y/+Z neighbours, three edge strips against
//! the diagonal neighbours, and the single corner cube whose eight
//! corners live in eight different blocks. Every pass feeds the same cube
//! kernel with eight corner references, so the seam logic is only about
//! picking which block and offset each corner reads from.
//!
//! Corner numbering follows the ring `(i,j) -> (i,j+1) -> (i+1,j+1) ->
//! (i+1,j)` on the `k` layer, then the same ring on `k+1`.

use glam::Vec3;
use thiserror::Error;

use crate::cloud::Mesh;
use crate::fusion::block::{grid_offset, BLOCK_SIZE, BLOCK_VOLUME, INVALID_TSDF};

pub mod tables;

use self::tables::{EDGE_TABLE, TRI_TABLE};

/// Hard cap on triangles emitted per block.
pub const MAX_BLOCK_TRIANGLES: usize = 2 * BLOCK_VOLUME;

/// Interpolation clamp threshold for degenerate edges.
const EPS: f32 = 1e-5;

/// Which two corners each of the 12 cube edges connects.
const EDGE_CORNERS: [[usize; 2]; 12] = [
    [0, 1],
    [1, 2],
    [2, 3],
    [3, 0],
    [4, 5],
    [5, 6],
    [6, 7],
    [7, 4],
    [0, 4],
    [1, 5],
    [2, 6],
    [3, 7],
];

/// A block emitted more triangles than the per-block budget allows.
#[derive(Error, Debug)]
#[error("marching cubes exceeded the per-block triangle budget")]
pub struct CapacityError;

/// Read-only view of one block's voxel attributes plus its world origin.
#[derive(Clone, Copy)]
pub struct BlockArrays<'a> {
    pub tsdf: &'a [f32],
    pub colors: &'a [Vec3],
    pub gradients: &'a [Vec3],
    pub origin: Vec3,
}

/// One cube corner: where to read attributes and where it sits in space.
#[derive(Clone, Copy)]
struct Corner<'a> {
    arrays: BlockArrays<'a>,
    offset: usize,
    pos: Vec3,
}

impl<'a> Corner<'a> {
    fn tsdf(&self) -> f32 {
        self.arrays.tsdf[self.offset]
    }

    fn color(&self) -> Vec3 {
        self.arrays.colors.get(self.offset).copied().unwrap_or(Vec3::ZERO)
    }

    fn gradient(&self) -> Vec3 {
        self.arrays.gradients[self.offset]
    }
}

fn corner<'a>(arrays: BlockArrays<'a>, i: usize, j: usize, k: usize, voxel_res: f32) -> Corner<'a> {
    Corner {
        arrays,
        offset: grid_offset(i, j, k),
        pos: arrays.origin + voxel_res * Vec3::new(i as f32, j as f32, k as f32),
    }
}

/// Linear interpolation toward the isovalue, clamped to a corner when the
/// edge is numerically degenerate.
fn interpolate(iso: f32, a: Vec3, b: Vec3, tsdf_a: f32, tsdf_b: f32) -> Vec3 {
    if (iso - tsdf_a).abs() < EPS {
        return a;
    }
    if (iso - tsdf_b).abs() < EPS {
        return b;
    }
    if (tsdf_a - tsdf_b).abs() < EPS {
        return a;
    }
    let mu = (iso - tsdf_a) / (tsdf_b - tsdf_a);
    a + mu * (b - a)
}

fn normalize_gradient(g: Vec3) -> Vec3 {
    g / (EPS + g.length())
}

/// Triangulate one cube. Corners with unobserved TSDF disqualify it.
fn emit_cube(corners: &[Corner; 8], iso: f32, mesh: &mut Mesh) -> Result<(), CapacityError> {
    let mut tsdf = [0.0f32; 8];
    for (t, c) in tsdf.iter_mut().zip(corners) {
        *t = c.tsdf();
        if *t == INVALID_TSDF {
            return Ok(());
        }
    }

    let mut cube_index = 0usize;
    for (n, t) in tsdf.iter().enumerate() {
        if *t < iso {
            cube_index |= 1 << n;
        }
    }
    let edges = EDGE_TABLE[cube_index];
    if edges == 0 {
        return Ok(());
    }

    let mut positions = [Vec3::ZERO; 12];
    let mut colors = [Vec3::ZERO; 12];
    let mut normals = [Vec3::ZERO; 12];
    for (edge, [a, b]) in EDGE_CORNERS.iter().enumerate() {
        if edges & (1u16 << edge) != 0 {
            let (ca, cb) = (&corners[*a], &corners[*b]);
            positions[edge] = interpolate(iso, ca.pos, cb.pos, tsdf[*a], tsdf[*b]);
            colors[edge] = interpolate(iso, ca.color(), cb.color(), tsdf[*a], tsdf[*b]);
            normals[edge] = normalize_gradient(interpolate(
                iso,
                ca.gradient(),
                cb.gradient(),
                tsdf[*a],
                tsdf[*b],
            ));
        }
    }

    let tri = &TRI_TABLE[cube_index];
    let mut t = 0;
    while tri[t] >= 0 {
        if mesh.num_triangles() >= MAX_BLOCK_TRIANGLES {
            return Err(CapacityError);
        }
        for v in 0..3 {
            let edge = tri[t + v] as usize;
            mesh.push_vertex(positions[edge], colors[edge], normals[edge]);
        }
        t += 3;
    }
    Ok(())
}

/// Run all applicable passes for one block and return the number of
/// triangles appended to `mesh`.
///
/// `inner` is the block being triangulated; the seven optional views are
/// its +X/+Y/+Z/+XY/+XZ/+YZ/+XYZ neighbours. A boundary pass only runs
/// when every block it touches is present.
#[allow(clippy::too_many_arguments)]
pub fn extract_block_mesh(
    inner: BlockArrays,
    xx: Option<BlockArrays>,
    yy: Option<BlockArrays>,
    zz: Option<BlockArrays>,
    xy: Option<BlockArrays>,
    xz: Option<BlockArrays>,
    yz: Option<BlockArrays>,
    xyz: Option<BlockArrays>,
    voxel_res: f32,
    mesh: &mut Mesh,
) -> Result<usize, CapacityError> {
    let iso = 0.0f32;
    let b = BLOCK_SIZE;
    mesh.clear();

    // Inner cubes.
    for k in 0..b - 1 {
        for j in 0..b - 1 {
            for i in 0..b - 1 {
                let corners = [
                    corner(inner, i, j, k, voxel_res),
                    corner(inner, i, j + 1, k, voxel_res),
                    corner(inner, i + 1, j + 1, k, voxel_res),
                    corner(inner, i + 1, j, k, voxel_res),
                    corner(inner, i, j, k + 1, voxel_res),
                    corner(inner, i, j + 1, k + 1, voxel_res),
                    corner(inner, i + 1, j + 1, k + 1, voxel_res),
                    corner(inner, i + 1, j, k + 1, voxel_res),
                ];
                emit_cube(&corners, iso, mesh)?;
            }
        }
    }

    // +X face strip.
    if let Some(xx) = xx {
        for k in 0..b - 1 {
            for j in 0..b - 1 {
                let corners = [
                    corner(inner, b - 1, j, k, voxel_res),
                    corner(inner, b - 1, j + 1, k, voxel_res),
                    corner(xx, 0, j + 1, k, voxel_res),
                    corner(xx, 0, j, k, voxel_res),
                    corner(inner, b - 1, j, k + 1, voxel_res),
                    corner(inner, b - 1, j + 1, k + 1, voxel_res),
                    corner(xx, 0, j + 1, k + 1, voxel_res),
                    corner(xx, 0, j, k + 1, voxel_res),
                ];
                emit_cube(&corners, iso, mesh)?;
            }
        }
    }

    // +Y face strip.
    if let Some(yy) = yy {
        for k in 0..b - 1 {
            for i in 0..b - 1 {
                let corners = [
                    corner(inner, i, b - 1, k, voxel_res),
                    corner(yy, i, 0, k, voxel_res),
                    corner(yy, i + 1, 0, k, voxel_res),
                    corner(inner, i + 1, b - 1, k, voxel_res),
                    corner(inner, i, b - 1, k + 1, voxel_res),
                    corner(yy, i, 0, k + 1, voxel_res),
                    corner(yy, i + 1, 0, k + 1, voxel_res),
                    corner(inner, i + 1, b - 1, k + 1, voxel_res),
                ];
                emit_cube(&corners, iso, mesh)?;
            }
        }
    }

    // +Z face strip.
    if let Some(zz) = zz {
        for j in 0..b - 1 {
            for i in 0..b - 1 {
                let corners = [
                    corner(inner, i, j, b - 1, voxel_res),
                    corner(inner, i, j + 1, b - 1, voxel_res),
                    corner(inner, i + 1, j + 1, b - 1, voxel_res),
                    corner(inner, i + 1, j, b - 1, voxel_res),
                    corner(zz, i, j, 0, voxel_res),
                    corner(zz, i, j + 1, 0, voxel_res),
                    corner(zz, i + 1, j + 1, 0, voxel_res),
                    corner(zz, i + 1, j, 0, voxel_res),
                ];
                emit_cube(&corners, iso, mesh)?;
            }
        }
    }

    // +XY edge strip along Z.
    if let (Some(xx), Some(yy), Some(xy)) = (xx, yy, xy) {
        for k in 0..b - 1 {
            let corners = [
                corner(inner, b - 1, b - 1, k, voxel_res),
                corner(yy, b - 1, 0, k, voxel_res),
                corner(xy, 0, 0, k, voxel_res),
                corner(xx, 0, b - 1, k, voxel_res),
                corner(inner, b - 1, b - 1, k + 1, voxel_res),
                corner(yy, b - 1, 0, k + 1, voxel_res),
                corner(xy, 0, 0, k + 1, voxel_res),
                corner(xx, 0, b - 1, k + 1, voxel_res),
            ];
            emit_cube(&corners, iso, mesh)?;
        }
    }

    // +XZ edge strip along Y.
    if let (Some(xx), Some(zz), Some(xz)) = (xx, zz, xz) {
        for j in 0..b - 1 {
            let corners = [
                corner(inner, b - 1, j, b - 1, voxel_res),
                corner(inner, b - 1, j + 1, b - 1, voxel_res),
                corner(xx, 0, j + 1, b - 1, voxel_res),
                corner(xx, 0, j, b - 1, voxel_res),
                corner(zz, b - 1, j, 0, voxel_res),
                corner(zz, b - 1, j + 1, 0, voxel_res),
                corner(xz, 0, j + 1, 0, voxel_res),
                corner(xz, 0, j, 0, voxel_res),
            ];
            emit_cube(&corners, iso, mesh)?;
        }
    }

    // +YZ edge strip along X.
    if let (Some(yy), Some(zz), Some(yz)) = (yy, zz, yz) {
        for i in 0..b - 1 {
            let corners = [
                corner(inner, i, b - 1, b - 1, voxel_res),
                corner(yy, i, 0, b - 1, voxel_res),
                corner(yy, i + 1, 0, b - 1, voxel_res),
                corner(inner, i + 1, b - 1, b - 1, voxel_res),
                corner(zz, i, b - 1, 0, voxel_res),
                corner(yz, i, 0, 0, voxel_res),
                corner(yz, i + 1, 0, 0, voxel_res),
                corner(zz, i + 1, b - 1, 0, voxel_res),
            ];
            emit_cube(&corners, iso, mesh)?;
        }
    }

    // The single +XYZ corner cube.
    if let (Some(xx), Some(yy), Some(zz), Some(xy), Some(xz), Some(yz), Some(xyz)) =
        (xx, yy, zz, xy, xz, yz, xyz)
    {
        let corners = [
            corner(inner, b - 1, b - 1, b - 1, voxel_res),
            corner(yy, b - 1, 0, b - 1, voxel_res),
            corner(xy, 0, 0, b - 1, voxel_res),
            corner(xx, 0, b - 1, b - 1, voxel_res),
            corner(zz, b - 1, b - 1, 0, voxel_res),
            corner(yz, b - 1, 0, 0, voxel_res),
            corner(xyz, 0, 0, 0, voxel_res),
            corner(xz, 0, b - 1, 0, voxel_res),
        ];
        emit_cube(&corners, iso, mesh)?;
    }

    Ok(mesh.num_triangles())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::block::VoxelBlock;

    fn arrays<'a>(block: &'a VoxelBlock, origin: Vec3) -> BlockArrays<'a> {
        BlockArrays {
            tsdf: block.tsdf(),
            colors: block.colors(),
            gradients: block.gradients(),
            origin,
        }
    }

    fn extract_single(block: &VoxelBlock, voxel_res: f32, mesh: &mut Mesh) -> usize {
        extract_block_mesh(
            arrays(block, Vec3::ZERO),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            voxel_res,
            mesh,
        )
        .unwrap()
    }

    #[test]
    fn test_unobserved_block_yields_no_triangles() {
        let block = VoxelBlock::new(true);
        let mut mesh = Mesh::default();
        assert_eq!(extract_single(&block, 0.01, &mut mesh), 0);
        assert!(mesh.is_empty());
    }

    #[test]
    fn test_plane_inside_block() {
        // Signed distance to the plane x = 0.05 (between voxels 4 and 6).
        let mut block = VoxelBlock::new(true);
        for k in 0..BLOCK_SIZE {
            for j in 0..BLOCK_SIZE {
                for i in 0..BLOCK_SIZE {
                    block.tsdf_mut()[grid_offset(i, j, k)] = i as f32 * 0.01 - 0.05;
                    block.gradients_mut()[grid_offset(i, j, k)] = Vec3::X;
                }
            }
        }
        let mut mesh = Mesh::default();
        let triangles = extract_single(&block, 0.01, &mut mesh);
        assert!(triangles > 0);
        for p in mesh.positions() {
            assert!((p.x - 0.05).abs() < 1e-5);
        }
        for n in mesh.normals() {
            assert!((n.x - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_interpolation_clamps_degenerate_edges() {
        let a = Vec3::ZERO;
        let b = Vec3::X;
        assert_eq!(interpolate(0.0, a, b, 0.0, 1.0), a);
        assert_eq!(interpolate(0.0, a, b, 1.0, 0.0), b);
        assert_eq!(interpolate(0.0, a, b, 0.5, 0.5), a);
        let mid = interpolate(0.0, a, b, -1.0, 1.0);
        assert!((mid.x - 0.5).abs() < 1e-6);
    }
}
