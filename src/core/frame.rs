//! RGB-D frame buffer and depth preprocessing.
//!
//! Depth is stored as raw `u16` samples in 1/scale meter units (5000 by
//! default for the datasets this pipeline consumes), colour as interleaved
//! BGR bytes. Depth maps are smoothed with a bilateral filter and eroded
//! around zero-depth holes before extraction.

use glam::Vec3;
use rayon::prelude::*;

use crate::cloud::{OrderedPointCloud, PointCloud};
use crate::core::Intrinsics;

/// Diameter of the bilateral filter window.
const BILATERAL_DIAMETER: usize = 13;
/// Spatial standard deviation of the bilateral filter, in pixels.
const BILATERAL_SIGMA_SPACE: f32 = 4.5;
/// Range standard deviation of the bilateral filter, in depth units.
const BILATERAL_SIGMA_DEPTH: f32 = 300.0;
/// Depth threshold under which a neighbourhood counts as a hole.
const EROSION_THRESHOLD: u16 = 8;
/// Half-kernel of the erosion pass.
const EROSION_RADIUS: usize = 4;

/// A single RGB-D frame.
#[derive(Debug, Clone)]
pub struct RgbdFrame {
    width: usize,
    height: usize,
    depth: Vec<u16>,
    filtered: Vec<u16>,
    color: Vec<u8>,
}

impl RgbdFrame {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            depth: vec![0; width * height],
            filtered: vec![0; width * height],
            color: vec![0; 3 * width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn depth(&self) -> &[u16] {
        &self.depth
    }

    pub fn depth_mut(&mut self) -> &mut [u16] {
        &mut self.depth
    }

    /// Interleaved BGR bytes, 3 per pixel.
    pub fn color(&self) -> &[u8] {
        &self.color
    }

    pub fn color_mut(&mut self) -> &mut [u8] {
        &mut self.color
    }

    pub fn clear(&mut self) {
        self.depth.fill(0);
        self.color.fill(0);
    }

    pub fn resize(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        self.depth.clear();
        self.depth.resize(width * height, 0);
        self.filtered.clear();
        self.filtered.resize(width * height, 0);
        self.color.clear();
        self.color.resize(3 * width * height, 0);
    }

    /// Fill the frame from raw buffers. A missing colour stream becomes a
    /// mid-grey filler.
    pub fn load(&mut self, depth: &[u16], color: Option<&[u8]>, width: usize, height: usize) {
        if width != self.width || height != self.height {
            self.resize(width, height);
        }
        self.depth.copy_from_slice(depth);
        match color {
            Some(data) => self.color.copy_from_slice(data),
            None => self.color.fill(127),
        }
    }

    /// Smooth the depth map and knock out pixels adjacent to depth holes.
    ///
    /// Bilateral smoothing first, then an erosion pass that zeroes any
    /// pixel whose neighbourhood contains a sample below the hole
    /// threshold. Border pixels end up zero and are skipped downstream.
    pub fn filter_depth(&mut self) {
        self.filtered.fill(0);
        bilateral_filter(
            &self.depth,
            &mut self.filtered,
            self.width,
            self.height,
            BILATERAL_SIGMA_SPACE,
            BILATERAL_SIGMA_DEPTH,
        );
        self.depth.fill(0);
        erosion_filter(
            &self.filtered,
            &mut self.depth,
            self.width,
            self.height,
            EROSION_THRESHOLD,
        );
    }

    /// Back-project all valid pixels into an unordered point cloud.
    ///
    /// A pixel is valid when its depth is non-zero and `z` lies in
    /// `(near, far]`. Colours are normalised to `[0, 1]`, keeping the
    /// frame's channel order.
    pub fn extract_points(
        &self,
        cloud: &mut PointCloud,
        intrinsics: &Intrinsics,
        near: f32,
        far: f32,
        scale: f32,
    ) {
        cloud.clear();
        for v in 0..self.height {
            for u in 0..self.width {
                let index = v * self.width + u;
                if let Some(pos) = self.pixel_position(u, v, index, intrinsics, near, far, scale) {
                    cloud.push(pos, self.pixel_color(index));
                }
            }
        }
    }

    /// Back-project the frame into an ordered point cloud, preserving the
    /// image grid. Rejected pixels get the invalid marker.
    pub fn extract_opc(
        &self,
        cloud: &mut OrderedPointCloud,
        intrinsics: &Intrinsics,
        near: f32,
        far: f32,
        scale: f32,
    ) {
        cloud.reset(self.width, self.height);
        for v in 0..self.height {
            for u in 0..self.width {
                let index = v * self.width + u;
                let pos = self
                    .pixel_position(u, v, index, intrinsics, near, far, scale)
                    .unwrap_or(OrderedPointCloud::INVALID);
                cloud.set_point(v, u, pos, self.pixel_color(index));
            }
        }
    }

    fn pixel_position(
        &self,
        u: usize,
        v: usize,
        index: usize,
        intrinsics: &Intrinsics,
        near: f32,
        far: f32,
        scale: f32,
    ) -> Option<Vec3> {
        let depth = self.depth[index];
        if depth == 0 {
            return None;
        }
        let z = f32::from(depth) / scale;
        if z <= near || z > far {
            return None;
        }
        Some(intrinsics.unproject(u as f32, v as f32, z))
    }

    fn pixel_color(&self, index: usize) -> Vec3 {
        Vec3::new(
            f32::from(self.color[3 * index]),
            f32::from(self.color[3 * index + 1]),
            f32::from(self.color[3 * index + 2]),
        ) / 255.0
    }
}

fn bilateral_filter(
    src: &[u16],
    dst: &mut [u16],
    width: usize,
    height: usize,
    sigma_space: f32,
    sigma_depth: f32,
) {
    let radius = BILATERAL_DIAMETER / 2;
    if height <= 2 * radius || width <= 2 * radius {
        return;
    }
    let space_fact = 0.5 / (sigma_space * sigma_space);
    let depth_fact = 0.5 / (sigma_depth * sigma_depth);

    dst.par_chunks_mut(width)
        .enumerate()
        .skip(radius)
        .take(height - 2 * radius)
        .for_each(|(i, row)| {
            for j in radius..width - radius {
                let value = f32::from(src[i * width + j]);
                let mut sum = 0.0f32;
                let mut norm = 0.0f32;
                for ii in 0..BILATERAL_DIAMETER {
                    for jj in 0..BILATERAL_DIAMETER {
                        let sample =
                            f32::from(src[(i + ii - radius) * width + (j + jj - radius)]);
                        let dc = value - sample;
                        let dx = jj as f32 - radius as f32;
                        let dy = ii as f32 - radius as f32;
                        let weight = (-((dx * dx + dy * dy) * space_fact
                            + dc * dc * depth_fact))
                            .exp();
                        sum += sample * weight;
                        norm += weight;
                    }
                }
                row[j] = (sum / norm) as u16;
            }
        });
}

fn erosion_filter(src: &[u16], dst: &mut [u16], width: usize, height: usize, threshold: u16) {
    let radius = EROSION_RADIUS;
    if height <= 2 * radius || width <= 2 * radius {
        return;
    }
    dst.par_chunks_mut(width)
        .enumerate()
        .skip(radius)
        .take(height - 2 * radius)
        .for_each(|(i, row)| {
            for j in radius..width - radius {
                let mut keep = true;
                'window: for ii in 0..=radius {
                    for jj in 0..=radius {
                        if src[(i + ii - radius) * width + (j + jj - radius)] < threshold {
                            keep = false;
                            break 'window;
                        }
                    }
                }
                row[j] = if keep { src[i * width + j] } else { 0 };
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plateau_frame(width: usize, height: usize, value: u16) -> RgbdFrame {
        let mut frame = RgbdFrame::new(width, height);
        frame.depth_mut().fill(value);
        frame
    }

    #[test]
    fn test_filter_keeps_plateau() {
        let mut frame = plateau_frame(48, 48, 2500);
        frame.filter_depth();
        // Far from borders and holes the plateau value survives both passes.
        let center = frame.depth()[24 * 48 + 24];
        assert!((i32::from(center) - 2500).abs() <= 1);
    }

    #[test]
    fn test_filter_erodes_around_holes() {
        let mut frame = plateau_frame(48, 48, 2500);
        frame.depth_mut()[24 * 48 + 24] = 0;
        frame.filter_depth();
        // The erosion window is the 5x5 up-left neighbourhood, so pixels
        // down-right of the hole get knocked out.
        assert_eq!(frame.depth()[24 * 48 + 24], 0);
        assert_eq!(frame.depth()[26 * 48 + 26], 0);
        // Pixels outside the window keep the plateau.
        assert!(frame.depth()[24 * 48 + 19] > 0);
    }

    #[test]
    fn test_extract_points_skips_invalid_depth() {
        let mut frame = RgbdFrame::new(4, 4);
        frame.depth_mut()[5] = 5000;
        let mut cloud = PointCloud::with_capacity(16);
        frame.extract_points(&mut cloud, &Intrinsics::default(), 0.0, 5.0, 5000.0);
        assert_eq!(cloud.len(), 1);
    }

    #[test]
    fn test_extract_points_respects_range() {
        let mut frame = RgbdFrame::new(2, 2);
        frame.depth_mut()[0] = 5000; // z = 1.0
        frame.depth_mut()[1] = 30000; // z = 6.0, beyond far
        let mut cloud = PointCloud::with_capacity(4);
        frame.extract_points(&mut cloud, &Intrinsics::default(), 0.0, 5.0, 5000.0);
        assert_eq!(cloud.len(), 1);
    }

    #[test]
    fn test_extract_opc_marks_invalid() {
        let mut frame = RgbdFrame::new(3, 3);
        frame.depth_mut()[4] = 5000;
        let mut cloud = OrderedPointCloud::new(0, 0);
        frame.extract_opc(&mut cloud, &Intrinsics::default(), 0.0, 5.0, 5000.0);
        assert!(cloud.point(1, 1).x < f32::MAX);
        assert_eq!(cloud.point(0, 0), OrderedPointCloud::INVALID);
    }

    #[test]
    fn test_missing_color_becomes_grey() {
        let mut frame = RgbdFrame::new(2, 2);
        let depth = [5000u16; 4];
        frame.load(&depth, None, 2, 2);
        assert!(frame.color().iter().all(|&c| c == 127));
    }
}
