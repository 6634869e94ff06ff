//! The fusion engine: per-frame allocation and TSDF integration.
//!
//! Every frame runs three bulk phases in order: raycast allocation of the
//! blocks the truncation band touches, parallel weighted integration of
//! the samples, and (on demand) gradient + mesh refresh of the touched
//! blocks. Phases never overlap, so the block map only mutates between
//! parallel sections.

use std::collections::BTreeSet;
use std::path::Path;

use glam::{Mat4, Vec3};
use log::info;
use rayon::prelude::*;

use crate::cloud::{OrderedPointCloud, PointCloud};
use crate::config::FusionConfig;
use crate::core::{Intrinsics, RgbdFrame};
use crate::fusion::block::{absolute_voxel, block_of, voxel_of, voxel_offset, voxel_pos, BlockId};
use crate::fusion::gradient;
use crate::fusion::raycast::raycast_blocks;
use crate::fusion::volume::{Volume, VolumeError};

/// Depth scale of the supported datasets: raw units are 1/5000 m.
pub const DEPTH_SCALE: f32 = 5000.0;

/// TSDF fusion engine driving a sparse [`Volume`].
pub struct Fusion {
    config: FusionConfig,
    volume: Volume,
    /// Blocks touched by the most recent frame.
    touched: Vec<BlockId>,
    cloud: PointCloud,
    opc: OrderedPointCloud,
}

impl Fusion {
    pub fn new(config: FusionConfig) -> Self {
        let capacity = config.max_frame_width * config.max_frame_height;
        Self {
            config,
            volume: Volume::new(config.voxel_res),
            touched: Vec::new(),
            cloud: PointCloud::with_capacity(capacity),
            opc: OrderedPointCloud::new(0, 0),
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn volume_mut(&mut self) -> &mut Volume {
        &mut self.volume
    }

    /// Blocks integrated by the most recent frame.
    pub fn touched_blocks(&self) -> &[BlockId] {
        &self.touched
    }

    /// Fuse a depth frame along the camera rays of an unordered cloud.
    pub fn integrate_depth_map(
        &mut self,
        frame: &RgbdFrame,
        intrinsics: &Intrinsics,
        transform: &Mat4,
    ) {
        info!("integrating point cloud");
        let mut cloud = std::mem::take(&mut self.cloud);
        frame.extract_points(
            &mut cloud,
            intrinsics,
            self.config.min_dist,
            self.config.max_dist,
            DEPTH_SCALE,
        );
        cloud.transform(transform);
        let camera_center = transform.transform_point3(Vec3::ZERO);

        let rays: Vec<(Vec3, Vec3, Vec3)> = cloud
            .points()
            .iter()
            .zip(cloud.colors())
            .map(|(&p, &rgb)| ((p - camera_center).normalize(), p, rgb))
            .collect();
        self.cloud = cloud;

        self.allocate_and_integrate(&rays);
    }

    /// Fuse a depth frame along estimated surface normals of an ordered
    /// cloud.
    pub fn integrate_depth_map_ordered(
        &mut self,
        frame: &RgbdFrame,
        intrinsics: &Intrinsics,
        transform: &Mat4,
    ) {
        info!("integrating ordered point cloud");
        let mut opc = std::mem::take(&mut self.opc);
        frame.extract_opc(
            &mut opc,
            intrinsics,
            self.config.min_dist,
            self.config.max_dist,
            DEPTH_SCALE,
        );
        opc.transform(transform);
        opc.estimate_normals(5.0 * self.config.voxel_res);

        let mut rays: Vec<(Vec3, Vec3, Vec3)> = Vec::with_capacity(opc.points().len());
        for ((p, n), rgb) in opc.points().iter().zip(opc.normals()).zip(opc.colors()) {
            let (p, n, rgb) = (*p, *n, *rgb);
            if p == OrderedPointCloud::INVALID || n == Vec3::ZERO {
                continue;
            }
            if n.x == f32::MAX || n.y == f32::MAX || n.z == f32::MAX || !n.is_finite() {
                continue;
            }
            rays.push((n, p, rgb));
        }
        self.opc = opc;

        self.allocate_and_integrate(&rays);
    }

    /// Shared tail of both variants: `rays` pairs each surface sample
    /// with the unit direction to march along.
    fn allocate_and_integrate(&mut self, rays: &[(Vec3, Vec3, Vec3)]) {
        let intersecting = self.blocks_intersecting(rays);
        self.touched = intersecting.into_iter().collect();
        let allocated = self.volume.add_blocks(self.touched.iter().copied());
        info!("{} blocks intersecting", self.touched.len());
        info!("allocated {} new blocks", allocated);
        info!("total blocks stored: {}", self.volume.num_blocks());

        self.integrate_samples(rays);
    }

    /// Raycast every sample's truncation segment and union the crossed
    /// block ids, one thread-local set per worker.
    fn blocks_intersecting(&self, rays: &[(Vec3, Vec3, Vec3)]) -> BTreeSet<BlockId> {
        let tau = self.config.tau;
        let voxel_res = self.config.voxel_res;
        rays.par_iter()
            .fold(BTreeSet::new, |mut found, &(u, p, _)| {
                let first = p - tau * u;
                let last = p + tau * u;
                raycast_blocks(
                    block_of(first, voxel_res),
                    block_of(last, voxel_res),
                    &mut found,
                );
                found
            })
            .reduce(BTreeSet::new, |mut merged, found| {
                merged.extend(found);
                merged
            })
    }

    /// March every sample through the truncation band and fold the
    /// Gaussian-weighted TSDF and colour contributions into the volume.
    fn integrate_samples(&self, rays: &[(Vec3, Vec3, Vec3)]) {
        let voxel_res = self.config.voxel_res;
        let tau = self.config.tau;
        let step = 0.5 * voxel_res;
        let sigma = tau;
        let tsdf_fact = 1.0 / (2.0 * sigma * sigma);
        let coeff = 1.0 / (sigma * (2.0 * std::f32::consts::PI).sqrt());

        rays.par_iter().for_each(|&(u, p, rgb)| {
            let mut dist = tau;
            while dist > -tau {
                let pos = p - dist * u;
                let id = block_of(pos, voxel_res);
                let voxel = voxel_of(pos, voxel_res);
                let centre = voxel_pos(absolute_voxel(id, voxel), voxel_res);
                let tsdf = if u.dot(p - centre) >= 0.0 {
                    centre.distance(p)
                } else {
                    -centre.distance(p)
                };

                // Block-level allocation leaves the outer shells sparse.
                if let Some(mut block) = self.volume.block_mut(id) {
                    let weight = coeff * (-(tsdf * tsdf) * tsdf_fact).exp();
                    block.integrate_sample(voxel_offset(voxel), tsdf, weight, rgb);
                }
                dist -= step;
            }
        });
    }

    /// Refresh gradients and mesh caches for the blocks the last frame
    /// touched.
    pub fn update_meshes(&mut self) -> Result<(), VolumeError> {
        gradient::update_gradients(&self.volume, &self.touched);
        let touched = std::mem::take(&mut self.touched);
        let result = self.volume.recompute_meshes(&touched);
        self.touched = touched;
        result
    }

    /// Rebuild gradients and meshes for every block, used before export.
    pub fn recompute_meshes(&mut self) -> Result<(), VolumeError> {
        gradient::update_all_gradients(&self.volume);
        self.volume.recompute_all_meshes()
    }

    pub fn export_mesh(&self, path: &Path) -> Result<(), VolumeError> {
        self.volume.export_ply(path)
    }

    pub fn dump_all_blocks(&self, dir: &Path) -> Result<(), VolumeError> {
        self.volume.dump_all(dir)
    }

    pub fn preload_blocks(&mut self, dir: &Path) -> Result<(), VolumeError> {
        self.volume.preload(dir)
    }
}
