//! SE3 pose representation using glam
//!
//! Rigid transforms are stored as a unit quaternion plus a translation
//! vector. All operations run in f32 to match the rest of the pipeline.

use glam::{Mat4, Quat, Vec3};

/// SE3 pose: rotation + translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    rotation: Quat,
    translation: Vec3,
}

impl SE3 {
    /// Create a new SE3 from a quaternion and a translation.
    pub fn new(rotation: Quat, translation: Vec3) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Create from the `(tx, ty, tz, qx, qy, qz, qw)` layout used by
    /// trajectory files.
    pub fn from_xyzw(translation: [f32; 3], quaternion: [f32; 4]) -> Self {
        Self {
            rotation: Quat::from_xyzw(
                quaternion[0],
                quaternion[1],
                quaternion[2],
                quaternion[3],
            ),
            translation: Vec3::from_array(translation),
        }
    }

    /// Identity pose.
    pub fn identity() -> Self {
        Self {
            rotation: Quat::IDENTITY,
            translation: Vec3::ZERO,
        }
    }

    /// Compose two poses: `self * other`.
    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.translation + self.rotation * other.translation,
        }
    }

    /// Inverse of the pose.
    pub fn inverse(&self) -> SE3 {
        let rotation = self.rotation.inverse();
        SE3 {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// Transform a 3D point.
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.rotation * point + self.translation
    }

    /// Transform a 3D direction (no translation).
    pub fn transform_vector(&self, vec: Vec3) -> Vec3 {
        self.rotation * vec
    }

    /// The affine 4x4 matrix of this pose.
    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.translation)
    }

    pub fn rotation(&self) -> Quat {
        self.rotation
    }

    pub fn translation(&self) -> Vec3 {
        self.translation
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let pose = SE3::identity();
        let p = Vec3::new(1.0, 2.0, 3.0);
        assert!(pose.transform_point(p).distance(p) < 1e-6);
    }

    #[test]
    fn test_compose_translations() {
        let a = SE3::new(Quat::IDENTITY, Vec3::new(1.0, 0.0, 0.0));
        let b = SE3::new(Quat::IDENTITY, Vec3::new(0.0, 2.0, 0.0));
        let c = a.compose(&b);
        assert!(c.translation().distance(Vec3::new(1.0, 2.0, 0.0)) < 1e-6);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let pose = SE3::new(
            Quat::from_axis_angle(Vec3::Y, 0.7),
            Vec3::new(1.0, 2.0, 3.0),
        );
        let composed = pose.compose(&pose.inverse());
        let p = Vec3::new(-0.5, 0.25, 4.0);
        assert!(composed.transform_point(p).distance(p) < 1e-5);
    }

    #[test]
    fn test_matches_mat4() {
        let pose = SE3::new(
            Quat::from_axis_angle(Vec3::Z, -1.2),
            Vec3::new(0.3, -0.1, 0.8),
        );
        let m = pose.to_mat4();
        let p = Vec3::new(0.4, 0.5, -0.6);
        assert!(pose.transform_point(p).distance(m.transform_point3(p)) < 1e-6);
    }
}
