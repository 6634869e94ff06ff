//! Unordered coloured point cloud.

use glam::{Mat4, Vec3};

/// A flat cloud of coloured points.
#[derive(Debug, Clone, Default)]
pub struct PointCloud {
    points: Vec<Vec3>,
    colors: Vec<Vec3>,
}

impl PointCloud {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
            colors: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, point: Vec3, color: Vec3) {
        self.points.push(point);
        self.colors.push(color);
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.colors.clear();
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Vec3] {
        &self.points
    }

    pub fn colors(&self) -> &[Vec3] {
        &self.colors
    }

    /// Apply an affine transform to every point.
    pub fn transform(&mut self, m: &Mat4) {
        for p in &mut self.points {
            *p = m.transform_point3(*p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_clear() {
        let mut cloud = PointCloud::with_capacity(4);
        cloud.push(Vec3::ONE, Vec3::ZERO);
        cloud.push(Vec3::ZERO, Vec3::ONE);
        assert_eq!(cloud.len(), 2);
        cloud.clear();
        assert!(cloud.is_empty());
    }

    #[test]
    fn test_transform_translates() {
        let mut cloud = PointCloud::with_capacity(1);
        cloud.push(Vec3::new(1.0, 0.0, 0.0), Vec3::ZERO);
        cloud.transform(&Mat4::from_translation(Vec3::new(0.0, 0.0, 2.0)));
        assert!(cloud.points()[0].distance(Vec3::new(1.0, 0.0, 2.0)) < 1e-6);
    }
}
