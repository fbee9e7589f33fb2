use bevy::prelude::*;

use crate::types::{Value, Vector};

/// Finished mesh data for one metaball pass, ready for upload.
///
/// Vertices come straight from [`polygonize`](crate::march::polygonize) —
/// every group of three consecutive vertices is one triangle, so indices are
/// sequential and normals are flat per-face, replicated once per vertex.
#[derive(Component, Clone)]
pub struct GeneratedMesh {
    /// Flat vertex positions: `[[x, y, z], ...]`
    pub vertices: Vec<[f32; 3]>,
    /// Sequential triangle indices, `0..vertices.len()`.
    pub indices: Vec<u32>,
    /// Per-vertex face normals.
    pub normals: Vec<[f32; 3]>,
}

impl GeneratedMesh {
    /// Builds indices and flat normals for a triangle-soup vertex buffer.
    ///
    /// `vertices.len()` should be a multiple of 3; a trailing partial
    /// triangle is dropped, keeping the three buffers the same length.
    pub fn build(mut vertices: Vec<[f32; 3]>) -> Self {
        vertices.truncate(vertices.len() / 3 * 3);

        let mut normals = Vec::with_capacity(vertices.len());
        for triangle in vertices.chunks_exact(3) {
            let normal = face_normal(triangle[0], triangle[1], triangle[2]);
            // Push the face normal once per vertex of the triangle.
            normals.push(normal);
            normals.push(normal);
            normals.push(normal);
        }

        let indices = (0..vertices.len() as u32).collect();

        Self {
            vertices,
            indices,
            normals,
        }
    }
}

/// Unit face normal of the triangle `(a, b, c)`, following its winding.
///
/// Returns the zero vector if the triangle is degenerate.
pub fn face_normal(a: [Value; 3], b: [Value; 3], c: [Value; 3]) -> [Value; 3] {
    let a = Vector::from(a);
    let b = Vector::from(b);
    let c = Vector::from(c);

    let cross = (b - a).cross(&(c - b));
    let norm = cross.norm();
    if norm == 0.0 {
        [0.0, 0.0, 0.0]
    } else {
        (cross / norm).into()
    }
}
