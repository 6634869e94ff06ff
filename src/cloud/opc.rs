//! Ordered point cloud on an image grid.
//!
//! Keeping the image layout lets normals be estimated from pixel
//! neighbours instead of a spatial search. Invalid pixels carry the
//! `INVALID` marker position and a zero normal.

use glam::{Mat4, Vec3};

/// A point cloud laid out on a `width x height` grid.
#[derive(Debug, Clone)]
pub struct OrderedPointCloud {
    width: usize,
    height: usize,
    points: Vec<Vec3>,
    colors: Vec<Vec3>,
    normals: Vec<Vec3>,
    /// Sensor origin, dragged along by `transform` so normal orientation
    /// stays meaningful in any frame.
    origin: Vec3,
}

impl Default for OrderedPointCloud {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl OrderedPointCloud {
    /// Marker position for pixels with no usable depth.
    pub const INVALID: Vec3 = Vec3::splat(f32::MAX);

    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            points: vec![Self::INVALID; width * height],
            colors: vec![Vec3::ZERO; width * height],
            normals: vec![Vec3::ZERO; width * height],
            origin: Vec3::ZERO,
        }
    }

    /// Resize to the given grid and reset every pixel to invalid.
    pub fn reset(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        let res = width * height;
        self.points.clear();
        self.points.resize(res, Self::INVALID);
        self.colors.clear();
        self.colors.resize(res, Vec3::ZERO);
        self.normals.clear();
        self.normals.resize(res, Vec3::ZERO);
        self.origin = Vec3::ZERO;
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn set_point(&mut self, row: usize, col: usize, point: Vec3, color: Vec3) {
        let index = row * self.width + col;
        self.points[index] = point;
        self.colors[index] = color;
    }

    pub fn point(&self, row: usize, col: usize) -> Vec3 {
        self.points[row * self.width + col]
    }

    pub fn normal(&self, row: usize, col: usize) -> Vec3 {
        self.normals[row * self.width + col]
    }

    pub fn color(&self, row: usize, col: usize) -> Vec3 {
        self.colors[row * self.width + col]
    }

    pub fn points(&self) -> &[Vec3] {
        &self.points
    }

    pub fn colors(&self) -> &[Vec3] {
        &self.colors
    }

    pub fn normals(&self) -> &[Vec3] {
        &self.normals
    }

    fn is_valid(p: Vec3) -> bool {
        p != Self::INVALID
    }

    /// Apply an affine transform: points by the full map, normals by its
    /// rotation, and the sensor origin alongside.
    pub fn transform(&mut self, m: &Mat4) {
        for p in &mut self.points {
            if Self::is_valid(*p) {
                *p = m.transform_point3(*p);
            }
        }
        for n in &mut self.normals {
            if *n != Vec3::ZERO {
                *n = m.transform_vector3(*n);
            }
        }
        self.origin = m.transform_point3(self.origin);
    }

    /// Mean of the valid points, `None` when every pixel is invalid.
    pub fn centroid(&self) -> Option<Vec3> {
        let mut sum = Vec3::ZERO;
        let mut n = 0usize;
        for p in &self.points {
            if Self::is_valid(*p) {
                sum += *p;
                n += 1;
            }
        }
        (n > 0).then(|| sum / n as f32)
    }

    /// Estimate per-pixel normals from the four grid neighbours.
    ///
    /// Each pair of adjacent neighbours within `dist_thr` of the centre
    /// point contributes a cross product, oriented away from the sensor
    /// origin. Pixels that end up with a zero normal are invalidated so
    /// integration never sees a point without a direction.
    pub fn estimate_normals(&mut self, dist_thr: f32) {
        if self.width < 3 || self.height < 3 {
            self.points.fill(Self::INVALID);
            return;
        }

        let origin = self.origin;
        for i in 1..self.height - 1 {
            for j in 1..self.width - 1 {
                let p = self.point(i, j);
                if !Self::is_valid(p) {
                    self.normals[i * self.width + j] = Vec3::ZERO;
                    continue;
                }

                let up = self.point(i - 1, j);
                let down = self.point(i + 1, j);
                let left = self.point(i, j - 1);
                let right = self.point(i, j + 1);

                let valid_up = Self::is_valid(up) && up.distance(p) <= dist_thr;
                let valid_down = Self::is_valid(down) && down.distance(p) <= dist_thr;
                let valid_left = Self::is_valid(left) && left.distance(p) <= dist_thr;
                let valid_right = Self::is_valid(right) && right.distance(p) <= dist_thr;

                let orient = |n: Vec3| if n.dot(p - origin) < 0.0 { -n } else { n };

                let mut normal = Vec3::ZERO;
                let mut contributions = 0;
                if valid_right && valid_down {
                    normal += orient((right - p).cross(down - p));
                    contributions += 1;
                }
                if valid_down && valid_left {
                    normal += orient((down - p).cross(left - p));
                    contributions += 1;
                }
                if valid_left && valid_up {
                    normal += orient((left - p).cross(up - p));
                    contributions += 1;
                }
                if valid_up && valid_right {
                    normal += orient((up - p).cross(right - p));
                    contributions += 1;
                }

                self.normals[i * self.width + j] = if contributions == 0 {
                    Vec3::ZERO
                } else {
                    normal.normalize()
                };
            }
        }

        // Points that gathered no normal are unusable for integration.
        for (p, n) in self.points.iter_mut().zip(&self.normals) {
            if *n == Vec3::ZERO {
                *p = Self::INVALID;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn plane_cloud(width: usize, height: usize, z: f32) -> OrderedPointCloud {
        let mut cloud = OrderedPointCloud::new(width, height);
        for i in 0..height {
            for j in 0..width {
                let p = Vec3::new(j as f32 * 0.01, i as f32 * 0.01, z);
                cloud.set_point(i, j, p, Vec3::ONE);
            }
        }
        cloud
    }

    #[test]
    fn test_centroid_of_valid_points() {
        let mut cloud = OrderedPointCloud::new(2, 2);
        cloud.set_point(0, 0, Vec3::new(1.0, 0.0, 0.0), Vec3::ZERO);
        cloud.set_point(0, 1, Vec3::new(3.0, 0.0, 0.0), Vec3::ZERO);
        let c = cloud.centroid().unwrap();
        assert_relative_eq!(c.x, 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_centroid_empty() {
        let cloud = OrderedPointCloud::new(2, 2);
        assert!(cloud.centroid().is_none());
    }

    #[test]
    fn test_plane_normals_point_away_from_origin() {
        let mut cloud = plane_cloud(8, 8, 0.5);
        cloud.estimate_normals(0.05);
        let n = cloud.normal(4, 4);
        assert_relative_eq!(n.z, 1.0, epsilon = 1e-4);
        assert!(n.x.abs() < 1e-4 && n.y.abs() < 1e-4);
    }

    #[test]
    fn test_border_points_invalidated() {
        let mut cloud = plane_cloud(8, 8, 0.5);
        cloud.estimate_normals(0.05);
        // No normal can be estimated on the border rows.
        assert_eq!(cloud.point(0, 0), OrderedPointCloud::INVALID);
    }

    #[test]
    fn test_isolated_point_invalidated() {
        let mut cloud = OrderedPointCloud::new(8, 8);
        cloud.set_point(4, 4, Vec3::new(0.0, 0.0, 1.0), Vec3::ZERO);
        cloud.estimate_normals(0.05);
        assert_eq!(cloud.point(4, 4), OrderedPointCloud::INVALID);
    }

    #[test]
    fn test_transform_rotates_normals() {
        let mut cloud = plane_cloud(8, 8, 0.5);
        cloud.estimate_normals(0.05);
        let m = Mat4::from_rotation_x(std::f32::consts::FRAC_PI_2);
        cloud.transform(&m);
        let n = cloud.normal(4, 4);
        assert_relative_eq!(n.y, -1.0, epsilon = 1e-4);
    }
}
