use crate::error::{RenderError, RenderResult};
use crate::math::Aabb;
use crate::renderer::vertex::{LitVertex, MeshVertex, SimpleVertex};

/// Largest vertex count addressable by 16 bit indices.
pub const MAX_MESH_VERTICES: usize = 0xFFFF;

/// Immutable mesh geometry: a triangle list with 16 bit indices.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshData<V> {
    indices: Vec<u16>,
    vertices: Vec<V>,
    bounds: Aabb,
}

pub type SimpleMeshData = MeshData<SimpleVertex>;
pub type LitMeshData = MeshData<LitVertex>;

impl<V: MeshVertex> MeshData<V> {
    pub fn new(indices: Vec<u16>, vertices: Vec<V>) -> RenderResult<Self> {
        let invalid = || RenderError::InvalidMeshSize {
            vertices: vertices.len(),
            indices: indices.len(),
        };
        if vertices.is_empty() || vertices.len() > MAX_MESH_VERTICES {
            return Err(invalid());
        }
        if indices.is_empty() || indices.len() % 3 != 0 {
            return Err(invalid());
        }
        if indices.iter().any(|&i| i as usize >= vertices.len()) {
            return Err(invalid());
        }
        let bounds = Aabb::from_points(vertices.iter().map(MeshVertex::position));
        Ok(Self {
            indices,
            vertices,
            bounds,
        })
    }

    pub fn indices(&self) -> &[u16] {
        &self.indices
    }

    pub fn vertices(&self) -> &[V] {
        &self.vertices
    }

    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(x: f32, y: f32) -> SimpleVertex {
        SimpleVertex {
            position: [x, y, 0.0],
            ..SimpleVertex::default()
        }
    }

    #[test]
    fn triangle_computes_bounds() {
        let mesh = MeshData::new(
            vec![0, 1, 2],
            vec![vertex(-1.0, 0.0), vertex(1.0, 0.0), vertex(0.0, 2.0)],
        )
        .expect("valid triangle");
        assert_eq!(mesh.bounds().min(), glam::Vec3::new(-1.0, 0.0, 0.0));
        assert_eq!(mesh.bounds().max(), glam::Vec3::new(1.0, 2.0, 0.0));
        assert_eq!(mesh.vertex_bytes().len(), 3 * 36);
    }

    #[test]
    fn rejects_partial_triangles_and_bad_indices() {
        let verts = vec![vertex(0.0, 0.0), vertex(1.0, 0.0), vertex(0.0, 1.0)];
        assert!(MeshData::new(vec![0, 1], verts.clone()).is_err());
        assert!(MeshData::new(vec![0, 1, 3], verts).is_err());
    }

    #[test]
    fn rejects_more_than_16_bit_vertices() {
        let verts = vec![vertex(0.0, 0.0); MAX_MESH_VERTICES + 1];
        let err = MeshData::new(vec![0, 1, 2], verts).unwrap_err();
        assert!(matches!(err, RenderError::InvalidMeshSize { vertices, .. } if vertices == 65536));
    }
}
