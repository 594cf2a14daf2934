//! Creates, re-uploads and releases the GPU buffers of mesh entities.

use hecs::{CommandBuffer, Entity, World};

use crate::error::{RenderError, RenderResult};
use crate::renderer::backend::GraphicsBackend;
use crate::renderer::mesh::GpuMesh;
use crate::renderer::vertex::{LitVertex, MeshVertex, SimpleVertex};
use crate::scene::components::{
    DynamicIndices, DynamicMeshData, DynamicVertices, LitMeshRenderData, SimpleMeshRenderData,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeshUploadStats {
    pub created: usize,
    /// Destroyed and recreated because of a mode change or a static re-upload.
    pub recreated: usize,
    pub updated: usize,
    pub released: usize,
}

/// Runs once per frame on the main thread, before any submission.
pub fn upload_meshes(
    world: &mut World,
    backend: &mut dyn GraphicsBackend,
) -> RenderResult<MeshUploadStats> {
    let mut stats = MeshUploadStats::default();
    let mut cmd = CommandBuffer::new();

    // immutable sources are always static
    for (entity, (data, gpu)) in world
        .query::<(&SimpleMeshRenderData, Option<&GpuMesh>)>()
        .iter()
    {
        if gpu.is_none() {
            let mesh = GpuMesh::create_static(backend, data.0.indices(), data.0.vertices())?;
            cmd.insert_one(entity, mesh);
            stats.created += 1;
        }
    }
    for (entity, (data, gpu)) in world.query::<(&LitMeshRenderData, Option<&GpuMesh>)>().iter() {
        if gpu.is_none() {
            let mesh = GpuMesh::create_static(backend, data.0.indices(), data.0.vertices())?;
            cmd.insert_one(entity, mesh);
            stats.created += 1;
        }
    }

    create_dynamic::<SimpleVertex>(world, backend, &mut cmd, &mut stats)?;
    create_dynamic::<LitVertex>(world, backend, &mut cmd, &mut stats)?;
    cmd.run_on(world);

    // every mesh source now has a GpuMesh
    switch_modes(world, backend, &mut stats)?;
    upload_dirty::<SimpleVertex>(world, backend, &mut stats)?;
    upload_dirty::<LitVertex>(world, backend, &mut stats)?;

    release_orphans(world, backend, &mut stats);
    Ok(stats)
}

fn create_dynamic<V: MeshVertex>(
    world: &World,
    backend: &mut dyn GraphicsBackend,
    cmd: &mut CommandBuffer,
    stats: &mut MeshUploadStats,
) -> RenderResult<()> {
    for (entity, (dynamic, _, gpu)) in world
        .query::<(&DynamicMeshData, &DynamicVertices<V>, Option<&GpuMesh>)>()
        .iter()
    {
        if gpu.is_some() {
            continue;
        }
        let mesh = if dynamic.use_dynamic_gpu_buffer {
            GpuMesh::create_dynamic(backend, V::LAYOUT, dynamic.vertex_capacity, dynamic.index_capacity)?
        } else {
            // dynamic source, static target: created on the first dirty upload
            GpuMesh::empty(V::LAYOUT)
        };
        cmd.insert_one(entity, mesh);
        stats.created += 1;
    }
    Ok(())
}

fn switch_modes(
    world: &mut World,
    backend: &mut dyn GraphicsBackend,
    stats: &mut MeshUploadStats,
) -> RenderResult<()> {
    for (_, (gpu, dynamic)) in world.query_mut::<(&mut GpuMesh, &DynamicMeshData)>() {
        if dynamic.use_dynamic_gpu_buffer && !gpu.is_dynamic() {
            let layout = gpu.layout();
            gpu.destroy(backend);
            *gpu = GpuMesh::create_dynamic(
                backend,
                layout,
                dynamic.vertex_capacity,
                dynamic.index_capacity,
            )?;
            stats.recreated += 1;
        } else if !dynamic.use_dynamic_gpu_buffer && gpu.is_dynamic() {
            gpu.destroy(backend);
            stats.recreated += 1;
        }
    }
    Ok(())
}

fn upload_dirty<V: MeshVertex>(
    world: &mut World,
    backend: &mut dyn GraphicsBackend,
    stats: &mut MeshUploadStats,
) -> RenderResult<()> {
    for (_, (gpu, dynamic, vertices, indices)) in world.query_mut::<(
        &mut GpuMesh,
        &mut DynamicMeshData,
        &DynamicVertices<V>,
        &DynamicIndices,
    )>() {
        if !dynamic.dirty {
            continue;
        }
        if dynamic.num_vertices > vertices.0.len() {
            return Err(RenderError::VertexCapacityExceeded {
                requested: dynamic.num_vertices,
                capacity: vertices.0.len(),
            });
        }
        if dynamic.num_indices > indices.0.len() {
            return Err(RenderError::IndexCapacityExceeded {
                requested: dynamic.num_indices,
                capacity: indices.0.len(),
            });
        }
        let vertex_src = &vertices.0[..dynamic.num_vertices];
        let index_src = &indices.0[..dynamic.num_indices];
        if dynamic.use_dynamic_gpu_buffer {
            if dynamic.num_vertices > dynamic.vertex_capacity {
                return Err(RenderError::VertexCapacityExceeded {
                    requested: dynamic.num_vertices,
                    capacity: dynamic.vertex_capacity,
                });
            }
            if dynamic.num_indices > dynamic.index_capacity {
                return Err(RenderError::IndexCapacityExceeded {
                    requested: dynamic.num_indices,
                    capacity: dynamic.index_capacity,
                });
            }
            gpu.update_dynamic(backend, index_src, vertex_src)?;
            stats.updated += 1;
        } else {
            if gpu.is_dynamic() {
                return Err(RenderError::InvalidDynamicMode);
            }
            gpu.destroy(backend);
            // an emptied mesh keeps no buffers and draws nothing
            if !index_src.is_empty() && !vertex_src.is_empty() {
                *gpu = GpuMesh::create_static(backend, index_src, vertex_src)?;
            }
            stats.recreated += 1;
        }
        dynamic.dirty = false;
    }
    Ok(())
}

/// GPU meshes whose source data was removed go back to absent.
fn release_orphans(world: &mut World, backend: &mut dyn GraphicsBackend, stats: &mut MeshUploadStats) {
    let mut orphans: Vec<Entity> = Vec::new();
    for (entity, (gpu, simple, lit, dynamic)) in world
        .query::<(
            &GpuMesh,
            Option<&SimpleMeshRenderData>,
            Option<&LitMeshRenderData>,
            Option<&DynamicMeshData>,
        )>()
        .iter()
    {
        if simple.is_none() && lit.is_none() && dynamic.is_none() {
            let mut gpu = *gpu;
            gpu.destroy(backend);
            orphans.push(entity);
        }
    }
    for entity in orphans {
        if world.remove_one::<GpuMesh>(entity).is_ok() {
            stats.released += 1;
        }
    }
}

/// Destroys every GPU mesh. Used on shutdown.
pub fn release_all(world: &mut World, backend: &mut dyn GraphicsBackend) {
    let entities: Vec<Entity> = world
        .query_mut::<&mut GpuMesh>()
        .into_iter()
        .map(|(entity, gpu)| {
            gpu.destroy(backend);
            entity
        })
        .collect();
    for entity in entities {
        let _ = world.remove_one::<GpuMesh>(entity);
    }
}
