//! Sparse voxel-block volume.
//!
//! Blocks are registered in an insertion-ordered indirection table: the
//! hash map assigns each block id a dense index into two parallel arrays,
//! one holding the voxel blocks and one holding the per-block mesh cache.
//! Dense indices are never reused; there is no block deletion.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use glam::Vec3;
use log::{debug, info};
use rayon::prelude::*;
use thiserror::Error;

use crate::cloud::Mesh;
use crate::fusion::block::{
    block_origin, BlockId, SpatialHashState, VoxelBlock, BLOCK_VOLUME,
};
use crate::mc::{self, BlockArrays, CapacityError, MAX_BLOCK_TRIANGLES};

/// Errors surfaced by volume I/O and meshing.
#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("corrupt block file {path}: {reason}")]
    CorruptBlock { path: PathBuf, reason: String },
    #[error(transparent)]
    Capacity(#[from] CapacityError),
}

/// Outcome of a single block insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockInsert {
    Inserted,
    Existed,
}

/// The sparse TSDF volume: block registry plus per-block mesh cache.
#[derive(Debug)]
pub struct Volume {
    voxel_res: f32,
    use_color: bool,
    block_ids: HashMap<BlockId, usize, SpatialHashState>,
    blocks: Vec<RwLock<VoxelBlock>>,
    meshes: Vec<Option<Mesh>>,
}

impl Volume {
    pub fn new(voxel_res: f32) -> Self {
        Self::with_color(voxel_res, true)
    }

    pub fn with_color(voxel_res: f32, use_color: bool) -> Self {
        Self {
            voxel_res,
            use_color,
            block_ids: HashMap::default(),
            blocks: Vec::new(),
            meshes: Vec::new(),
        }
    }

    pub fn voxel_res(&self) -> f32 {
        self.voxel_res
    }

    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.block_ids.contains_key(&id)
    }

    fn insert(&mut self, id: BlockId, use_color: bool) -> BlockInsert {
        if self.block_ids.contains_key(&id) {
            return BlockInsert::Existed;
        }
        self.block_ids.insert(id, self.blocks.len());
        self.blocks.push(RwLock::new(VoxelBlock::new(use_color)));
        self.meshes.push(None);
        BlockInsert::Inserted
    }

    /// Register a block, allocating fresh storage on first sight.
    pub fn add_block(&mut self, id: BlockId) -> BlockInsert {
        self.insert(id, self.use_color)
    }

    /// Bulk insertion; returns how many blocks were actually new.
    pub fn add_blocks<I>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = BlockId>,
    {
        ids.into_iter()
            .filter(|&id| self.add_block(id) == BlockInsert::Inserted)
            .count()
    }

    /// Shared borrow of a block's contents.
    pub fn block(&self, id: BlockId) -> Option<RwLockReadGuard<'_, VoxelBlock>> {
        self.block_ids
            .get(&id)
            .map(|&index| read_lock(&self.blocks[index]))
    }

    /// Exclusive borrow of a block's contents.
    pub fn block_mut(&self, id: BlockId) -> Option<RwLockWriteGuard<'_, VoxelBlock>> {
        self.block_ids
            .get(&id)
            .map(|&index| write_lock(&self.blocks[index]))
    }

    /// Cached mesh of a block; `None` when absent or empty.
    pub fn mesh(&self, id: BlockId) -> Option<&Mesh> {
        self.block_ids
            .get(&id)
            .and_then(|&index| self.meshes[index].as_ref())
    }

    /// Snapshot of every registered block id.
    pub fn all_ids(&self) -> Vec<BlockId> {
        self.block_ids.keys().copied().collect()
    }

    /// Triangulate the given blocks in parallel and swap in their new
    /// mesh caches. Unknown ids are skipped.
    pub fn recompute_meshes(&mut self, ids: &[BlockId]) -> Result<(), VolumeError> {
        let updates = ids
            .par_iter()
            .map_init(
                || Mesh::with_capacity(3 * MAX_BLOCK_TRIANGLES),
                |scratch, &id| -> Result<Option<(usize, Option<Mesh>)>, CapacityError> {
                    let Some(&index) = self.block_ids.get(&id) else {
                        return Ok(None);
                    };
                    let triangles = self.triangulate_block(id, scratch)?;
                    let mesh = (triangles > 0).then(|| scratch.clone());
                    Ok(Some((index, mesh)))
                },
            )
            .collect::<Result<Vec<_>, _>>()?;

        for (index, mesh) in updates.into_iter().flatten() {
            self.meshes[index] = mesh;
        }
        Ok(())
    }

    /// Triangulate every registered block.
    pub fn recompute_all_meshes(&mut self) -> Result<(), VolumeError> {
        let ids = self.all_ids();
        self.recompute_meshes(&ids)
    }

    fn triangulate_block(&self, id: BlockId, scratch: &mut Mesh) -> Result<usize, CapacityError> {
        let inner = match self.block(id) {
            Some(guard) => guard,
            None => return Ok(0),
        };

        let neighbours = [
            BlockId::new(1, 0, 0),
            BlockId::new(0, 1, 0),
            BlockId::new(0, 0, 1),
            BlockId::new(1, 1, 0),
            BlockId::new(1, 0, 1),
            BlockId::new(0, 1, 1),
            BlockId::new(1, 1, 1),
        ];
        let guards: Vec<_> = neighbours
            .iter()
            .map(|&offset| self.block(id + offset).map(|g| (id + offset, g)))
            .collect();

        let views: Vec<_> = guards
            .iter()
            .map(|entry| {
                entry
                    .as_ref()
                    .map(|(block_id, g)| block_view(g, *block_id, self.voxel_res))
            })
            .collect();

        mc::extract_block_mesh(
            block_view(&inner, id, self.voxel_res),
            views[0],
            views[1],
            views[2],
            views[3],
            views[4],
            views[5],
            views[6],
            self.voxel_res,
            scratch,
        )
    }

    /// Concatenate every cached mesh into an ASCII PLY file.
    pub fn export_ply(&self, path: &Path) -> Result<(), VolumeError> {
        let io_err = |source| VolumeError::Io {
            path: path.to_path_buf(),
            source,
        };

        let num_triangles: usize = self
            .meshes
            .iter()
            .flatten()
            .map(|mesh| mesh.num_triangles())
            .sum();
        info!(
            "exporting {} triangles from {} blocks to {}",
            num_triangles,
            self.num_blocks(),
            path.display()
        );

        let file = File::create(path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "ply").map_err(io_err)?;
        writeln!(writer, "format ascii 1.0").map_err(io_err)?;
        writeln!(writer, "element vertex {}", 3 * num_triangles).map_err(io_err)?;
        for axis in ["x", "y", "z", "nx", "ny", "nz"] {
            writeln!(writer, "property float {axis}").map_err(io_err)?;
        }
        for channel in ["blue", "green", "red", "alpha"] {
            writeln!(writer, "property uchar {channel}").map_err(io_err)?;
        }
        writeln!(writer, "element face {num_triangles}").map_err(io_err)?;
        writeln!(writer, "property list uchar int vertex_index").map_err(io_err)?;
        writeln!(writer, "end_header").map_err(io_err)?;

        for mesh in self.meshes.iter().flatten() {
            for ((p, n), c) in mesh
                .positions()
                .iter()
                .zip(mesh.normals())
                .zip(mesh.colors())
            {
                writeln!(
                    writer,
                    "{} {} {} {} {} {} {} {} {} 255",
                    p.x,
                    p.y,
                    p.z,
                    n.x,
                    n.y,
                    n.z,
                    channel_byte(c.x),
                    channel_byte(c.y),
                    channel_byte(c.z),
                )
                .map_err(io_err)?;
            }
        }

        for face in 0..num_triangles {
            writeln!(writer, "3 {} {} {}", 3 * face, 3 * face + 1, 3 * face + 2)
                .map_err(io_err)?;
        }
        writer.flush().map_err(io_err)?;
        Ok(())
    }

    /// Write every block to `dir` as `<X>_<Y>_<Z>.gz`: a `use_color`
    /// byte, then the TSDF, weight and gradient arrays, then (when
    /// colour is enabled) the colour array, all little-endian f32 behind
    /// DEFLATE.
    pub fn dump_all(&self, dir: &Path) -> Result<(), VolumeError> {
        for (id, &index) in &self.block_ids {
            let path = dir.join(format!("{}_{}_{}.gz", id.x, id.y, id.z));
            let io_err = |source| VolumeError::Io {
                path: path.clone(),
                source,
            };
            let block = read_lock(&self.blocks[index]);

            let file = File::create(&path).map_err(io_err)?;
            let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::new(6));

            encoder.write_u8(block.use_color() as u8).map_err(io_err)?;
            for &t in block.tsdf() {
                encoder.write_f32::<LittleEndian>(t).map_err(io_err)?;
            }
            for &w in block.weights() {
                encoder.write_f32::<LittleEndian>(w).map_err(io_err)?;
            }
            for g in block.gradients() {
                write_vec3(&mut encoder, *g).map_err(io_err)?;
            }
            if block.use_color() {
                for c in block.colors() {
                    write_vec3(&mut encoder, *c).map_err(io_err)?;
                }
            }
            encoder.finish().map_err(io_err)?.flush().map_err(io_err)?;
        }
        Ok(())
    }

    /// Load every `.gz` block file from `dir`. Entries with other
    /// extensions are ignored; a malformed file name or a short read is
    /// fatal.
    pub fn preload(&mut self, dir: &Path) -> Result<(), VolumeError> {
        let dir_err = |source| VolumeError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let entries = fs::read_dir(dir).map_err(dir_err)?;
        for entry in entries {
            let path = entry.map_err(dir_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("gz") {
                continue;
            }
            self.preload_block(&path)?;
        }
        Ok(())
    }

    fn preload_block(&mut self, path: &Path) -> Result<(), VolumeError> {
        let id = parse_block_stem(path)?;
        debug!("reading block {} {} {}", id.x, id.y, id.z);

        let io_err = |source| VolumeError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let mut decoder = GzDecoder::new(BufReader::new(file));

        let use_color = decoder.read_u8().map_err(io_err)? != 0;
        self.insert(id, use_color);
        let index = self.block_ids[&id];
        let mut block = write_lock(&self.blocks[index]);
        if block.use_color() != use_color {
            // A preexisting block keeps the on-disk colour layout.
            *block = VoxelBlock::new(use_color);
        }

        for t in block.tsdf_mut() {
            *t = decoder.read_f32::<LittleEndian>().map_err(io_err)?;
        }
        for w in block.weights_mut() {
            *w = decoder.read_f32::<LittleEndian>().map_err(io_err)?;
        }
        for g in block.gradients_mut() {
            *g = read_vec3(&mut decoder).map_err(io_err)?;
        }
        if use_color {
            debug_assert_eq!(block.colors().len(), BLOCK_VOLUME);
            for c in block.colors_mut() {
                *c = read_vec3(&mut decoder).map_err(io_err)?;
            }
        }
        Ok(())
    }
}

fn block_view<'a>(block: &'a VoxelBlock, id: BlockId, voxel_res: f32) -> BlockArrays<'a> {
    BlockArrays {
        tsdf: block.tsdf(),
        colors: block.colors(),
        gradients: block.gradients(),
        origin: block_origin(id, voxel_res),
    }
}

fn channel_byte(c: f32) -> u8 {
    (255.0 * c.clamp(0.0, 1.0)).round() as u8
}

fn write_vec3<W: std::io::Write>(writer: &mut W, v: Vec3) -> std::io::Result<()> {
    writer.write_f32::<LittleEndian>(v.x)?;
    writer.write_f32::<LittleEndian>(v.y)?;
    writer.write_f32::<LittleEndian>(v.z)
}

fn read_vec3<R: std::io::Read>(reader: &mut R) -> std::io::Result<Vec3> {
    Ok(Vec3::new(
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
    ))
}

fn parse_block_stem(path: &Path) -> Result<BlockId, VolumeError> {
    let corrupt = |reason: &str| VolumeError::CorruptBlock {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| corrupt("file name is not valid UTF-8"))?;
    let mut parts = stem.split('_');
    let mut next = |axis: &str| -> Result<i32, VolumeError> {
        parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| corrupt(&format!("missing or non-integer {axis} coordinate")))
    };
    let x = next("x")?;
    let y = next("y")?;
    let z = next("z")?;
    if parts.next().is_some() {
        return Err(corrupt("trailing tokens after block coordinates"));
    }
    Ok(BlockId::new(x, y, z))
}

fn read_lock(lock: &RwLock<VoxelBlock>) -> RwLockReadGuard<'_, VoxelBlock> {
    lock.read().unwrap_or_else(|poison| poison.into_inner())
}

fn write_lock(lock: &RwLock<VoxelBlock>) -> RwLockWriteGuard<'_, VoxelBlock> {
    lock.write().unwrap_or_else(|poison| poison.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::block::{grid_offset, BLOCK_SIZE};

    #[test]
    fn test_insertion_is_idempotent() {
        let mut volume = Volume::new(0.01);
        let ids = [
            BlockId::new(0, 0, 0),
            BlockId::new(1, 0, 0),
            BlockId::new(0, 0, 0),
            BlockId::new(-3, 2, 9),
            BlockId::new(1, 0, 0),
        ];
        assert_eq!(volume.add_blocks(ids), 3);
        assert_eq!(volume.num_blocks(), 3);
        assert_eq!(volume.add_block(BlockId::new(0, 0, 0)), BlockInsert::Existed);
    }

    #[test]
    fn test_dense_index_matches_insertion_order() {
        let mut volume = Volume::new(0.01);
        let ids = [
            BlockId::new(5, 5, 5),
            BlockId::new(-1, 0, 3),
            BlockId::new(2, 2, 2),
        ];
        for &id in &ids {
            volume.add_block(id);
        }
        for (position, id) in ids.iter().enumerate() {
            assert_eq!(volume.block_ids[id], position);
        }
        assert_eq!(volume.blocks.len(), volume.meshes.len());
        assert_eq!(volume.blocks.len(), volume.block_ids.len());
    }

    #[test]
    fn test_missing_block_lookups() {
        let volume = Volume::new(0.01);
        assert!(volume.block(BlockId::new(4, 4, 4)).is_none());
        assert!(volume.mesh(BlockId::new(4, 4, 4)).is_none());
    }

    #[test]
    fn test_unobserved_block_meshes_to_none() {
        let mut volume = Volume::new(0.01);
        let id = BlockId::new(0, 0, 0);
        volume.add_block(id);
        volume.recompute_all_meshes().unwrap();
        assert!(volume.mesh(id).is_none());
    }

    fn fill_pattern(block: &mut VoxelBlock, seed: f32) {
        for k in 0..BLOCK_SIZE {
            for j in 0..BLOCK_SIZE {
                for i in 0..BLOCK_SIZE {
                    let offset = grid_offset(i, j, k);
                    block.tsdf_mut()[offset] = seed + i as f32 * 0.001 - k as f32 * 0.002;
                    block.weights_mut()[offset] = j as f32 + seed;
                    block.gradients_mut()[offset] =
                        Vec3::new(i as f32, j as f32, k as f32) * seed;
                    if block.use_color() {
                        block.colors_mut()[offset] =
                            Vec3::new(0.1, 0.5, 0.9) * (seed + k as f32 * 0.01);
                    }
                }
            }
        }
    }

    #[test]
    fn test_dump_preload_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut volume = Volume::new(0.01);
        let ids = [BlockId::new(0, 0, 0), BlockId::new(-2, 1, 7)];
        for (n, &id) in ids.iter().enumerate() {
            volume.add_block(id);
            fill_pattern(&mut volume.block_mut(id).unwrap(), 0.3 + n as f32);
        }
        volume.dump_all(dir.path()).unwrap();

        let mut restored = Volume::new(0.01);
        restored.preload(dir.path()).unwrap();
        assert_eq!(restored.num_blocks(), ids.len());
        for &id in &ids {
            let a = volume.block(id).unwrap();
            let b = restored.block(id).unwrap();
            assert_eq!(a.use_color(), b.use_color());
            assert!(a
                .tsdf()
                .iter()
                .zip(b.tsdf())
                .all(|(x, y)| x.to_bits() == y.to_bits()));
            assert!(a
                .weights()
                .iter()
                .zip(b.weights())
                .all(|(x, y)| x.to_bits() == y.to_bits()));
            assert!(a
                .gradients()
                .iter()
                .zip(b.gradients())
                .all(|(x, y)| x == y));
            assert!(a.colors().iter().zip(b.colors()).all(|(x, y)| x == y));
        }
    }

    #[test]
    fn test_preload_ignores_other_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"not a block").unwrap();
        let mut volume = Volume::new(0.01);
        volume.preload(dir.path()).unwrap();
        assert_eq!(volume.num_blocks(), 0);
    }

    #[test]
    fn test_preload_rejects_bad_stem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("whoops.gz"), b"junk").unwrap();
        let mut volume = Volume::new(0.01);
        assert!(matches!(
            volume.preload(dir.path()),
            Err(VolumeError::CorruptBlock { .. })
        ));
    }

    #[test]
    fn test_export_ply_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut volume = Volume::new(0.01);
        let id = BlockId::new(0, 0, 0);
        volume.add_block(id);
        {
            let mut block = volume.block_mut(id).unwrap();
            for k in 0..BLOCK_SIZE {
                for j in 0..BLOCK_SIZE {
                    for i in 0..BLOCK_SIZE {
                        block.tsdf_mut()[grid_offset(i, j, k)] = i as f32 * 0.01 - 0.05;
                        block.gradients_mut()[grid_offset(i, j, k)] = Vec3::X;
                    }
                }
            }
        }
        volume.recompute_all_meshes().unwrap();
        let triangles = volume.mesh(id).unwrap().num_triangles();
        assert!(triangles > 0);

        let path = dir.path().join("out.ply");
        volume.export_ply(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains(&format!("element vertex {}", 3 * triangles)));
        assert!(text.contains(&format!("element face {triangles}")));
        let face_lines: Vec<_> = text
            .lines()
            .filter(|line| line.starts_with("3 "))
            .collect();
        assert_eq!(face_lines.len(), triangles);
        for line in face_lines {
            for index in line.split_whitespace().skip(1) {
                assert!(index.parse::<usize>().unwrap() < 3 * triangles);
            }
        }
    }
}
