//! Synthetic depth rendering.
//!
//! A minimal ray tracer producing the same depth maps the synthetic
//! dataset generator writes: `u16` samples in 1/5000 m units for a
//! pinhole camera at the origin looking down `-z`. Used by the scenario
//! tests and anywhere a controlled surface is handy.

use glam::{Mat3, Quat, Vec3};

use crate::core::{Intrinsics, SE3};
use crate::fusion::DEPTH_SCALE;

/// Render the depth map of a sphere given in camera coordinates.
///
/// The camera sits at the origin and looks down `-z`; pixels that miss
/// the sphere or fall outside `(near, far)` read zero.
pub fn render_sphere_depth(
    center: Vec3,
    radius: f32,
    width: usize,
    height: usize,
    intrinsics: &Intrinsics,
    near: f32,
    far: f32,
) -> Vec<u16> {
    let mut depth = vec![0u16; width * height];
    for v in 0..height {
        for u in 0..width {
            let dir = Vec3::new(
                (u as f32 - intrinsics.cx) / intrinsics.fx,
                (v as f32 - intrinsics.cy) / intrinsics.fy,
                -1.0,
            )
            .normalize();

            // Nearest intersection of the unit ray with the sphere.
            let along = dir.dot(center);
            let discriminant = along * along - (center.length_squared() - radius * radius);
            if discriminant < 0.0 {
                continue;
            }
            let t = along - discriminant.sqrt();
            if t <= 0.0 {
                continue;
            }
            let z = -(t * dir.z);
            if z <= near || z >= far {
                continue;
            }
            depth[v * width + u] = (z * DEPTH_SCALE).round() as u16;
        }
    }
    depth
}

/// Camera-to-world pose of a `-z`-forward camera at `eye` aimed at
/// `target`.
pub fn look_at_pose(eye: Vec3, target: Vec3, up: Vec3) -> SE3 {
    let z_axis = (eye - target).normalize();
    let x_axis = up.cross(z_axis).normalize();
    let y_axis = z_axis.cross(x_axis);
    let rotation = Quat::from_mat3(&Mat3::from_cols(x_axis, y_axis, z_axis));
    SE3::new(rotation, eye)
}

/// Camera-to-world poses on a circle of `radius` around `target`, all
/// aimed at it.
pub fn circle_trajectory(target: Vec3, radius: f32, viewpoints: usize) -> Vec<SE3> {
    (0..viewpoints)
        .map(|n| {
            let angle = 2.0 * std::f32::consts::PI * n as f32 / viewpoints as f32;
            let eye = target + radius * Vec3::new(angle.sin(), 0.0, angle.cos());
            look_at_pose(eye, target, Vec3::Y)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::dataset::synthetic_intrinsics;
    use approx::assert_relative_eq;

    #[test]
    fn test_center_pixel_hits_sphere_front() {
        let intr = synthetic_intrinsics(64, 64);
        let depth = render_sphere_depth(
            Vec3::new(0.0, 0.0, -1.0),
            0.2,
            64,
            64,
            &intr,
            0.1,
            50.0,
        );
        let center = depth[32 * 64 + 32];
        assert_relative_eq!(f32::from(center) / DEPTH_SCALE, 0.8, epsilon = 1e-3);
    }

    #[test]
    fn test_rays_outside_sphere_miss() {
        let intr = synthetic_intrinsics(64, 64);
        let depth = render_sphere_depth(
            Vec3::new(0.0, 0.0, -1.0),
            0.05,
            64,
            64,
            &intr,
            0.1,
            50.0,
        );
        assert_eq!(depth[0], 0);
        assert!(depth[32 * 64 + 32] > 0);
    }

    #[test]
    fn test_look_at_faces_target() {
        let pose = look_at_pose(Vec3::new(0.0, 0.0, 2.0), Vec3::ZERO, Vec3::Y);
        // The camera's -z axis must point from eye to target.
        let forward = pose.transform_vector(Vec3::NEG_Z);
        assert_relative_eq!(forward.z, -1.0, epsilon = 1e-5);
        assert_relative_eq!(pose.translation().z, 2.0);
    }

    #[test]
    fn test_circle_trajectory_distances() {
        let poses = circle_trajectory(Vec3::new(0.0, 0.0, 0.6), 1.0, 8);
        assert_eq!(poses.len(), 8);
        for pose in &poses {
            let d = pose.translation().distance(Vec3::new(0.0, 0.0, 0.6));
            assert_relative_eq!(d, 1.0, epsilon = 1e-5);
        }
    }
}
