//! RGB-D dataset streaming.
//!
//! A dataset directory holds an `output.txt` association file plus one
//! 16-bit PNG depth map (and optionally a colour image) per frame. Each
//! line associates the file names with a camera pose:
//!
//! ```text
//! depth.png rgb.png tx ty tz qx qy qz qw     (real datasets)
//! depth.png tx ty tz qx qy qz qw             (synthetic datasets)
//! ```
//!
//! Every dataset tag also fixes the camera intrinsics, the axis
//! permutation between camera and world, the quaternion sign convention
//! of its trajectory files, and on which side of the permutation the
//! pose applies.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use glam::{Mat4, Vec4};
use log::debug;
use thiserror::Error;

use crate::config::ConfigError;
use crate::core::{Intrinsics, RgbdFrame, SE3};

/// Errors raised while reading a dataset from disk.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot decode image {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("malformed association line {line} in {path}")]
    Parse { path: PathBuf, line: usize },
}

/// Supported dataset flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetType {
    /// TUM freiburg1-style RGB-D sequences.
    Fr1,
    /// ICL-NUIM living room sequences.
    Icl1,
    /// Depth maps rendered by the synthetic generator.
    Synthetic0,
}

impl FromStr for DatasetType {
    type Err = ConfigError;

    fn from_str(tag: &str) -> Result<Self, ConfigError> {
        match tag {
            "fr1" => Ok(Self::Fr1),
            "icl1" => Ok(Self::Icl1),
            "synthetic0" => Ok(Self::Synthetic0),
            other => Err(ConfigError::UnknownDataset(other.to_string())),
        }
    }
}

impl DatasetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fr1 => "fr1",
            Self::Icl1 => "icl1",
            Self::Synthetic0 => "synthetic0",
        }
    }

    /// Depth camera intrinsics of this dataset flavour.
    pub fn intrinsics(&self) -> Intrinsics {
        match self {
            Self::Fr1 => Intrinsics::new(525.0, 525.0, 319.5, 239.5),
            Self::Icl1 => Intrinsics::new(481.20, -480.0, 319.5, 239.5),
            Self::Synthetic0 => synthetic_intrinsics(640, 480),
        }
    }

    /// Axis permutation between the depth camera frame and the world.
    pub fn axis_permut(&self) -> Mat4 {
        match self {
            Self::Fr1 => Mat4::from_diagonal(Vec4::new(1.0, -1.0, -1.0, 1.0)),
            Self::Icl1 | Self::Synthetic0 => {
                Mat4::from_diagonal(Vec4::new(1.0, 1.0, -1.0, 1.0))
            }
        }
    }

    /// Whether trajectory lines carry a colour image name.
    pub fn has_color(&self) -> bool {
        !matches!(self, Self::Synthetic0)
    }

    /// The real trajectories store `qw` with the opposite sign
    /// convention; the synthetic generator writes ours.
    fn flip_qw(&self) -> bool {
        !matches!(self, Self::Synthetic0)
    }

    /// Build the camera-to-world transform applied to extracted points.
    pub fn frame_transform(&self, pose: &SE3) -> Mat4 {
        match self {
            Self::Synthetic0 => pose.to_mat4().inverse() * self.axis_permut(),
            _ => self.axis_permut() * pose.to_mat4(),
        }
    }
}

/// Field-of-view derived pinhole model of the synthetic renderer.
pub fn synthetic_intrinsics(width: u32, height: u32) -> Intrinsics {
    let tan_fov = (50.0f32.to_radians()).tan();
    Intrinsics::new(
        (width / 2) as f32 * tan_fov,
        (height / 2) as f32 * tan_fov,
        (width / 2) as f32,
        (height / 2) as f32,
    )
}

/// One association-file entry.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub depth_file: String,
    pub color_file: Option<String>,
    pub pose: SE3,
}

/// Parse one association line according to the dataset flavour.
pub fn parse_record(line: &str, dataset_type: DatasetType) -> Option<FrameRecord> {
    let mut fields = line.split_whitespace();
    let depth_file = fields.next()?.to_string();
    let color_file = if dataset_type.has_color() {
        Some(fields.next()?.to_string())
    } else {
        None
    };
    let mut values = [0.0f32; 7];
    for value in &mut values {
        *value = fields.next()?.parse().ok()?;
    }
    if fields.next().is_some() {
        return None;
    }
    let [tx, ty, tz, qx, qy, qz, mut qw] = values;
    if dataset_type.flip_qw() {
        qw = -qw;
    }
    Some(FrameRecord {
        depth_file,
        color_file,
        pose: SE3::from_xyzw([tx, ty, tz], [qx, qy, qz, qw]),
    })
}

/// Streams dataset frames in file order.
#[derive(Debug)]
pub struct DataStreamer {
    dir: PathBuf,
    frames: VecDeque<FrameRecord>,
}

impl DataStreamer {
    /// Read the association file of `dir` and queue every frame.
    pub fn new(dir: &Path, dataset_type: DatasetType) -> Result<Self, StreamError> {
        let index = dir.join("output.txt");
        let content = fs::read_to_string(&index).map_err(|source| StreamError::Io {
            path: index.clone(),
            source,
        })?;

        let mut frames = VecDeque::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record =
                parse_record(line, dataset_type).ok_or_else(|| StreamError::Parse {
                    path: index.clone(),
                    line: number + 1,
                })?;
            frames.push_back(record);
        }
        debug!("queued {} frames from {}", frames.len(), index.display());

        Ok(Self {
            dir: dir.to_path_buf(),
            frames,
        })
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }

    /// Load the next frame into `frame` and return its pose, or `None`
    /// when the stream is exhausted.
    pub fn next_frame(&mut self, frame: &mut RgbdFrame) -> Result<Option<SE3>, StreamError> {
        let Some(record) = self.frames.pop_front() else {
            return Ok(None);
        };

        let depth_path = self.dir.join(&record.depth_file);
        let depth_image = open_image(&depth_path)?.to_luma16();
        let (width, height) = (depth_image.width() as usize, depth_image.height() as usize);
        let depth = depth_image.into_raw();

        let color = match &record.color_file {
            Some(name) => {
                let color_path = self.dir.join(name);
                let rgb = open_image(&color_path)?.to_rgb8();
                Some(rgb_to_bgr(rgb.as_raw()))
            }
            None => None,
        };

        frame.load(&depth, color.as_deref(), width, height);
        Ok(Some(record.pose))
    }
}

fn open_image(path: &Path) -> Result<image::DynamicImage, StreamError> {
    image::open(path).map_err(|source| StreamError::Image {
        path: path.to_path_buf(),
        source,
    })
}

/// The fusion core stores colour in the blue-first order its PLY output
/// uses.
fn rgb_to_bgr(rgb: &[u8]) -> Vec<u8> {
    let mut bgr = Vec::with_capacity(rgb.len());
    for px in rgb.chunks_exact(3) {
        bgr.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    bgr
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_unknown_tag_is_rejected() {
        assert!(matches!(
            "kitti".parse::<DatasetType>(),
            Err(ConfigError::UnknownDataset(_))
        ));
        assert_eq!("fr1".parse::<DatasetType>().unwrap(), DatasetType::Fr1);
    }

    #[test]
    fn test_parse_real_record() {
        let line = "depth/1.png rgb/1.png 1.0 2.0 3.0 0.0 0.0 0.0 1.0";
        let record = parse_record(line, DatasetType::Fr1).unwrap();
        assert_eq!(record.depth_file, "depth/1.png");
        assert_eq!(record.color_file.as_deref(), Some("rgb/1.png"));
        assert_relative_eq!(record.pose.translation().x, 1.0);
        // Real trajectories flip the scalar part.
        assert_relative_eq!(record.pose.rotation().w, -1.0);
    }

    #[test]
    fn test_parse_synthetic_record() {
        let line = "depth0.png 0.0 0.0 1.0 0.0 0.0 0.0 1.0";
        let record = parse_record(line, DatasetType::Synthetic0).unwrap();
        assert!(record.color_file.is_none());
        assert_relative_eq!(record.pose.rotation().w, 1.0);
    }

    #[test]
    fn test_parse_rejects_short_lines() {
        assert!(parse_record("depth.png 1.0 2.0", DatasetType::Fr1).is_none());
        assert!(parse_record("", DatasetType::Synthetic0).is_none());
    }

    #[test]
    fn test_parse_rejects_trailing_fields() {
        let line = "depth0.png 0.0 0.0 1.0 0.0 0.0 0.0 1.0 extra";
        assert!(parse_record(line, DatasetType::Synthetic0).is_none());
    }

    #[test]
    fn test_synthetic_transform_inverts_pose() {
        let pose = SE3::from_xyzw([0.0, 0.0, -1.6], [0.0, 0.0, 0.0, 1.0]);
        let m = DatasetType::Synthetic0.frame_transform(&pose);
        // A camera-frame point 1 m in front of the sensor (z = +1 before
        // the permutation) lands at world z = pose-corrected depth.
        let p = m.transform_point3(glam::Vec3::new(0.0, 0.0, 1.0));
        assert_relative_eq!(p.z, 0.6, epsilon = 1e-5);
    }

    #[test]
    fn test_real_transform_applies_permutation_last() {
        let pose = SE3::identity();
        let m = DatasetType::Fr1.frame_transform(&pose);
        let p = m.transform_point3(glam::Vec3::new(0.5, 0.5, 1.0));
        assert_relative_eq!(p.x, 0.5, epsilon = 1e-6);
        assert_relative_eq!(p.y, -0.5, epsilon = 1e-6);
        assert_relative_eq!(p.z, -1.0, epsilon = 1e-6);
    }
}
