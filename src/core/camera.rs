//! Pinhole camera intrinsics.

use glam::Vec3;

/// Camera intrinsic parameters.
#[derive(Debug, Clone, Copy)]
pub struct Intrinsics {
    /// Focal lengths in pixels.
    pub fx: f32,
    pub fy: f32,
    /// Principal point.
    pub cx: f32,
    pub cy: f32,
}

impl Intrinsics {
    pub fn new(fx: f32, fy: f32, cx: f32, cy: f32) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Back-project pixel `(u, v)` at depth `z` to a camera-frame point.
    pub fn unproject(&self, u: f32, v: f32, z: f32) -> Vec3 {
        Vec3::new(
            (u - self.cx) * (z / self.fx),
            (v - self.cy) * (z / self.fy),
            z,
        )
    }
}

/// Default Kinect-style camera (640x480).
impl Default for Intrinsics {
    fn default() -> Self {
        Self::new(525.0, 525.0, 319.5, 239.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unproject_principal_point() {
        let intr = Intrinsics::default();
        let p = intr.unproject(319.5, 239.5, 1.5);
        assert!(p.distance(Vec3::new(0.0, 0.0, 1.5)) < 1e-6);
    }

    #[test]
    fn test_unproject_scales_with_depth() {
        let intr = Intrinsics::new(500.0, 500.0, 320.0, 240.0);
        let near = intr.unproject(420.0, 240.0, 1.0);
        let far = intr.unproject(420.0, 240.0, 2.0);
        assert!((far.x - 2.0 * near.x).abs() < 1e-6);
    }
}
