// renderer/mesh.rs (GPU side of one mesh)

use crate::error::{RenderError, RenderResult};
use crate::renderer::backend::{
    DynamicIndexBufferHandle, DynamicVertexBufferHandle, Encoder, GraphicsBackend, IndexBinding,
    IndexBufferHandle, VertexBinding, VertexBufferHandle,
};
use crate::renderer::vertex::{MeshVertex, VertexLayoutKind};

/// Largest vertex capacity of a dynamic mesh.
pub const MAX_DYNAMIC_VERTICES: usize = 0x10000;
/// Largest index capacity of a dynamic mesh.
pub const MAX_DYNAMIC_INDICES: usize = 0xF0000;
/// Largest vertex count of a static mesh, the range of 16 bit indices.
pub const MAX_STATIC_VERTICES: usize = 0xFFFF;

/// Buffers backing a mesh. Static and dynamic only convert through `Absent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuBuffers {
    Absent,
    Static {
        index: IndexBufferHandle,
        vertex: VertexBufferHandle,
    },
    Dynamic {
        index: DynamicIndexBufferHandle,
        vertex: DynamicVertexBufferHandle,
    },
}

/// GPU buffers of one mesh entity, owned by the mesh manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuMesh {
    buffers: GpuBuffers,
    layout: VertexLayoutKind,
    index_count: usize,
    vertex_count: usize,
    max_index_count: usize,
    max_vertex_count: usize,
}

impl GpuMesh {
    pub fn empty(layout: VertexLayoutKind) -> Self {
        Self {
            buffers: GpuBuffers::Absent,
            layout,
            index_count: 0,
            vertex_count: 0,
            max_index_count: 0,
            max_vertex_count: 0,
        }
    }

    pub fn create_static<V: MeshVertex>(
        backend: &mut dyn GraphicsBackend,
        indices: &[u16],
        vertices: &[V],
    ) -> RenderResult<Self> {
        if indices.is_empty() || vertices.is_empty() || vertices.len() > MAX_STATIC_VERTICES {
            return Err(RenderError::InvalidMeshSize {
                vertices: vertices.len(),
                indices: indices.len(),
            });
        }
        let index = backend.create_index_buffer(indices)?;
        let vertex = match backend.create_vertex_buffer(bytemuck::cast_slice(vertices), V::LAYOUT) {
            Ok(vertex) => vertex,
            Err(err) => {
                backend.destroy_index_buffer(index);
                return Err(err);
            }
        };
        Ok(Self {
            buffers: GpuBuffers::Static { index, vertex },
            layout: V::LAYOUT,
            index_count: indices.len(),
            vertex_count: vertices.len(),
            max_index_count: indices.len(),
            max_vertex_count: vertices.len(),
        })
    }

    pub fn create_dynamic(
        backend: &mut dyn GraphicsBackend,
        layout: VertexLayoutKind,
        max_vertices: usize,
        max_indices: usize,
    ) -> RenderResult<Self> {
        let vertices_ok = max_vertices > 0 && max_vertices <= MAX_DYNAMIC_VERTICES;
        let indices_ok = max_indices > 0 && max_indices <= MAX_DYNAMIC_INDICES;
        if !vertices_ok || !indices_ok {
            return Err(RenderError::InvalidMeshSize {
                vertices: max_vertices,
                indices: max_indices,
            });
        }
        let vertex = backend.create_dynamic_vertex_buffer(max_vertices as u32, layout)?;
        let index = match backend.create_dynamic_index_buffer(max_indices as u32) {
            Ok(index) => index,
            Err(err) => {
                backend.destroy_dynamic_vertex_buffer(vertex);
                return Err(err);
            }
        };
        Ok(Self {
            buffers: GpuBuffers::Dynamic { index, vertex },
            layout,
            index_count: 0,
            vertex_count: 0,
            max_index_count: max_indices,
            max_vertex_count: max_vertices,
        })
    }

    /// Writes new contents from the start of the dynamic buffers.
    pub fn update_dynamic<V: MeshVertex>(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        indices: &[u16],
        vertices: &[V],
    ) -> RenderResult<()> {
        let GpuBuffers::Dynamic { index, vertex } = self.buffers else {
            return Err(RenderError::InvalidDynamicMode);
        };
        if V::LAYOUT != self.layout {
            return Err(RenderError::Backend(format!(
                "vertex layout {:?} does not match mesh layout {:?}",
                V::LAYOUT,
                self.layout
            )));
        }
        if vertices.len() > self.max_vertex_count {
            return Err(RenderError::VertexCapacityExceeded {
                requested: vertices.len(),
                capacity: self.max_vertex_count,
            });
        }
        if indices.len() > self.max_index_count {
            return Err(RenderError::IndexCapacityExceeded {
                requested: indices.len(),
                capacity: self.max_index_count,
            });
        }
        backend.update_dynamic_index_buffer(index, 0, indices)?;
        self.index_count = indices.len();
        backend.update_dynamic_vertex_buffer(vertex, 0, bytemuck::cast_slice(vertices))?;
        self.vertex_count = vertices.len();
        Ok(())
    }

    /// Releases the buffers. The mesh stays usable as an empty mesh.
    pub fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        match self.buffers {
            GpuBuffers::Absent => {}
            GpuBuffers::Static { index, vertex } => {
                backend.destroy_index_buffer(index);
                backend.destroy_vertex_buffer(vertex);
            }
            GpuBuffers::Dynamic { index, vertex } => {
                backend.destroy_dynamic_index_buffer(index);
                backend.destroy_dynamic_vertex_buffer(vertex);
            }
        }
        *self = Self::empty(self.layout);
    }

    /// Binds the index range `start..start + count` and all vertices.
    /// `None` draws every index.
    pub fn set_for_submit(
        &self,
        encoder: &mut Encoder,
        start: u32,
        count: Option<u32>,
    ) -> RenderResult<()> {
        let index_count = self.index_count as u32;
        let count = count.unwrap_or(index_count);
        if start.checked_add(count).map_or(true, |end| end > index_count) {
            return Err(RenderError::SubmitRangeOutOfBounds {
                start,
                count,
                index_count,
            });
        }
        let vertex_count = self.vertex_count as u32;
        match self.buffers {
            GpuBuffers::Absent => return Err(RenderError::InvalidDynamicMode),
            GpuBuffers::Static { index, vertex } => {
                encoder.set_index_buffer(IndexBinding::Static(index), start, count);
                encoder.set_vertex_buffer(VertexBinding::Static(vertex), 0, vertex_count);
            }
            GpuBuffers::Dynamic { index, vertex } => {
                encoder.set_index_buffer(IndexBinding::Dynamic(index), start, count);
                encoder.set_vertex_buffer(VertexBinding::Dynamic(vertex), 0, vertex_count);
            }
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self.buffers, GpuBuffers::Absent)
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.buffers, GpuBuffers::Dynamic { .. })
    }

    pub fn buffers(&self) -> GpuBuffers {
        self.buffers
    }

    pub fn layout(&self) -> VertexLayoutKind {
        self.layout
    }

    pub fn index_count(&self) -> usize {
        self.index_count
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    pub fn max_index_count(&self) -> usize {
        self.max_index_count
    }

    pub fn max_vertex_count(&self) -> usize {
        self.max_vertex_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::RecordingBackend;
    use crate::renderer::vertex::{LitVertex, SimpleVertex};

    #[test]
    fn static_mesh_counts_match_source() {
        let mut backend = RecordingBackend::new();
        let verts = vec![SimpleVertex::default(); 4];
        let mesh = GpuMesh::create_static(&mut backend, &[0, 1, 2, 2, 3, 0], &verts).expect("mesh");
        assert!(mesh.is_valid());
        assert!(!mesh.is_dynamic());
        assert_eq!(mesh.index_count(), 6);
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.max_vertex_count(), 4);
        assert_eq!(backend.live_buffers(), 2);
    }

    #[test]
    fn dynamic_capacity_is_checked() {
        let mut backend = RecordingBackend::new();
        assert!(GpuMesh::create_dynamic(&mut backend, VertexLayoutKind::Lit, 0, 3).is_err());
        assert!(
            GpuMesh::create_dynamic(&mut backend, VertexLayoutKind::Lit, MAX_DYNAMIC_VERTICES + 1, 3)
                .is_err()
        );
        let mut mesh =
            GpuMesh::create_dynamic(&mut backend, VertexLayoutKind::Lit, 3, 3).expect("dynamic");
        mesh.update_dynamic(&mut backend, &[0, 1, 2], &[LitVertex::default(); 3])
            .expect("fits");
        assert_eq!(mesh.index_count(), 3);
        let err = mesh
            .update_dynamic(&mut backend, &[0, 1, 2], &[LitVertex::default(); 4])
            .unwrap_err();
        assert_eq!(
            err,
            RenderError::VertexCapacityExceeded {
                requested: 4,
                capacity: 3
            }
        );
    }

    #[test]
    fn static_mesh_rejects_dynamic_update() {
        let mut backend = RecordingBackend::new();
        let mut mesh =
            GpuMesh::create_static(&mut backend, &[0, 1, 2], &[SimpleVertex::default(); 3])
                .expect("mesh");
        let err = mesh
            .update_dynamic(&mut backend, &[0, 1, 2], &[SimpleVertex::default(); 3])
            .unwrap_err();
        assert_eq!(err, RenderError::InvalidDynamicMode);
    }

    #[test]
    fn destroy_releases_buffers() {
        let mut backend = RecordingBackend::new();
        let mut mesh =
            GpuMesh::create_dynamic(&mut backend, VertexLayoutKind::Simple, 8, 12).expect("mesh");
        assert_eq!(backend.live_buffers(), 2);
        mesh.destroy(&mut backend);
        assert_eq!(backend.live_buffers(), 0);
        assert!(!mesh.is_valid());
        assert_eq!(mesh.max_index_count(), 0);
    }

    #[test]
    fn submit_range_is_bounded() {
        let mut backend = RecordingBackend::new();
        let mesh = GpuMesh::create_static(&mut backend, &[0, 1, 2, 2, 1, 0], &[SimpleVertex::default(); 3])
            .expect("mesh");
        let mut encoder = Encoder::new(0);
        mesh.set_for_submit(&mut encoder, 3, Some(3)).expect("in range");
        mesh.set_for_submit(&mut encoder, 0, None).expect("whole mesh");
        let err = mesh.set_for_submit(&mut encoder, 4, Some(3)).unwrap_err();
        assert!(matches!(err, RenderError::SubmitRangeOutOfBounds { index_count: 6, .. }));
    }
}
