//! Triangle soup mesh.
//!
//! Vertices come in groups of three, one group per triangle; the triangle
//! index list is implicit (`3t, 3t+1, 3t+2`). Position, colour and normal
//! are kept in parallel arrays.

use glam::Vec3;

#[derive(Debug, Clone, Default)]
pub struct Mesh {
    positions: Vec<Vec3>,
    colors: Vec<Vec3>,
    normals: Vec<Vec3>,
}

impl Mesh {
    pub fn with_capacity(vertices: usize) -> Self {
        Self {
            positions: Vec::with_capacity(vertices),
            colors: Vec::with_capacity(vertices),
            normals: Vec::with_capacity(vertices),
        }
    }

    pub fn push_vertex(&mut self, position: Vec3, color: Vec3, normal: Vec3) {
        self.positions.push(position);
        self.colors.push(color);
        self.normals.push(normal);
    }

    pub fn clear(&mut self) {
        self.positions.clear();
        self.colors.clear();
        self.normals.clear();
    }

    pub fn num_vertices(&self) -> usize {
        self.positions.len()
    }

    pub fn num_triangles(&self) -> usize {
        self.positions.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn colors(&self) -> &[Vec3] {
        &self.colors
    }

    pub fn normals(&self) -> &[Vec3] {
        &self.normals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triangle_count() {
        let mut mesh = Mesh::default();
        for _ in 0..2 {
            mesh.push_vertex(Vec3::ZERO, Vec3::ONE, Vec3::Z);
            mesh.push_vertex(Vec3::X, Vec3::ONE, Vec3::Z);
            mesh.push_vertex(Vec3::Y, Vec3::ONE, Vec3::Z);
        }
        assert_eq!(mesh.num_triangles(), 2);
        assert_eq!(mesh.num_vertices(), 6);
        mesh.clear();
        assert!(mesh.is_empty());
    }
}
