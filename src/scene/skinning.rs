// scene/skinning.rs
// CPU skinning into dynamic mesh copies of skinned meshes

use glam::{Mat4, Vec3};
use hecs::{Entity, World};
use rayon::prelude::*;

use crate::renderer::backend::GraphicsBackend;
use crate::renderer::mesh::GpuMesh;
use crate::renderer::vertex::LitVertex;
use crate::scene::components::{
    DynamicIndices, DynamicMeshData, DynamicVertices, LitMeshRenderData, LocalToWorld, MeshBounds,
    OriginalVertex, OriginalVertices, SkinQuality, SkinnedMeshBoneInfo, SkinnedMeshBoneRef,
    SkinnedMeshRenderer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SkinningStats {
    pub created: usize,
    pub destroyed: usize,
    pub skinned: usize,
}

/// Creates or destroys the dynamic mesh copies, refreshes bone matrices and
/// skins every CPU skinned renderer.
pub fn update_skinning(
    world: &mut World,
    backend: &mut dyn GraphicsBackend,
    gpu_skinning: bool,
) -> SkinningStats {
    let mut stats = SkinningStats::default();
    sync_dynamic_meshes(world, backend, gpu_skinning, &mut stats);
    update_bone_matrices(world);
    if !gpu_skinning {
        stats.skinned = skin_meshes(world);
    }
    stats
}

fn sync_dynamic_meshes(
    world: &mut World,
    backend: &mut dyn GraphicsBackend,
    gpu_skinning: bool,
    stats: &mut SkinningStats,
) {
    let mut create: Vec<(Entity, Entity)> = Vec::new();
    let mut destroy: Vec<(Entity, Entity)> = Vec::new();
    for (entity, smr) in world.query::<&SkinnedMeshRenderer>().iter() {
        let wants_copy = !gpu_skinning && smr.can_use_cpu_skinning;
        let drops_copy = if gpu_skinning {
            smr.can_use_cpu_skinning
        } else {
            smr.can_use_gpu_skinning
        };
        match smr.dynamic_mesh {
            None if wants_copy => create.push((entity, smr.shared_mesh)),
            Some(mesh) if drops_copy => destroy.push((entity, mesh)),
            _ => {}
        }
    }

    for (entity, mesh) in destroy {
        if let Ok(mut gpu) = world.get::<&mut GpuMesh>(mesh) {
            gpu.destroy(backend);
        }
        let _ = world.despawn(mesh);
        if let Ok(mut smr) = world.get::<&mut SkinnedMeshRenderer>(entity) {
            smr.dynamic_mesh = None;
        }
        stats.destroyed += 1;
    }

    for (entity, shared_mesh) in create {
        let data = match world.get::<&LitMeshRenderData>(shared_mesh) {
            Ok(data) => data.0.clone(),
            Err(_) => {
                log::warn!("Skinned mesh renderer {:?} has no lit mesh to skin", entity);
                continue;
            }
        };
        let vertices = data.vertices().to_vec();
        let indices = data.indices().to_vec();
        let originals = vertices
            .iter()
            .map(|v| OriginalVertex {
                position: Vec3::from(v.position),
                normal: Vec3::from(v.normal),
                tangent: Vec3::from(v.tangent),
            })
            .collect();
        let mesh = world.spawn((
            DynamicMeshData {
                dirty: true,
                use_dynamic_gpu_buffer: true,
                vertex_capacity: vertices.len(),
                index_capacity: indices.len(),
                num_vertices: vertices.len(),
                num_indices: indices.len(),
            },
            DynamicVertices(vertices),
            DynamicIndices(indices),
            OriginalVertices(originals),
            MeshBounds(data.bounds()),
        ));
        if let Ok(mut smr) = world.get::<&mut SkinnedMeshRenderer>(entity) {
            smr.dynamic_mesh = Some(mesh);
        }
        stats.created += 1;
    }
}

/// Bone matrix in the skin space of its renderer:
/// `world_to_local(renderer) * bone_local_to_world * bindpose`.
fn update_bone_matrices(world: &mut World) {
    let bones: Vec<(Entity, Entity, Mat4, Mat4)> = world
        .query::<(&SkinnedMeshBoneInfo, &LocalToWorld)>()
        .iter()
        .map(|(e, (info, ltw))| (e, info.smr_entity, ltw.0, info.bindpose))
        .collect();
    for (bone, smr, bone_to_world, bindpose) in bones {
        let smr_to_world = world
            .get::<&LocalToWorld>(smr)
            .map_or(Mat4::IDENTITY, |t| t.0);
        if let Ok(mut info) = world.get::<&mut SkinnedMeshBoneInfo>(bone) {
            info.bone_matrix = smr_to_world.inverse() * bone_to_world * bindpose;
        }
    }
}

fn blend_matrix(vertex: &LitVertex, quality: SkinQuality, bones: &[Mat4]) -> Mat4 {
    let bone = |slot: usize| {
        bones
            .get(vertex.bone_index[slot] as usize)
            .copied()
            .unwrap_or(Mat4::IDENTITY)
    };
    let w = vertex.bone_weight;
    match quality {
        SkinQuality::Bone1 => bone(0),
        SkinQuality::Bone2 => {
            let sum = w[0] + w[1];
            let inv_sum = if sum > 0.0 { 1.0 / sum } else { 0.0 };
            bone(0) * (w[0] * inv_sum) + bone(1) * (w[1] * inv_sum)
        }
        SkinQuality::Bone4 => {
            bone(0) * w[0] + bone(1) * w[1] + bone(2) * w[2] + bone(3) * w[3]
        }
    }
}

fn skin_meshes(world: &mut World) -> usize {
    let jobs: Vec<(Entity, SkinQuality, Vec<Mat4>)> = world
        .query::<(&SkinnedMeshRenderer, &SkinnedMeshBoneRef)>()
        .iter()
        .filter(|(_, (smr, _))| smr.can_use_cpu_skinning)
        .filter_map(|(_, (smr, bone_ref))| {
            let mesh = smr.dynamic_mesh?;
            let bones = bone_ref
                .0
                .iter()
                .map(|&b| {
                    world
                        .get::<&SkinnedMeshBoneInfo>(b)
                        .map_or(Mat4::IDENTITY, |info| info.bone_matrix)
                })
                .collect();
            Some((mesh, smr.skin_quality, bones))
        })
        .collect();

    let mut skinned = 0;
    for (mesh, quality, bones) in jobs {
        let Ok((vertices, originals, data)) = world.query_one_mut::<(
            &mut DynamicVertices<LitVertex>,
            &OriginalVertices,
            &mut DynamicMeshData,
        )>(mesh) else {
            continue;
        };
        vertices
            .0
            .par_iter_mut()
            .zip(originals.0.par_iter())
            .for_each(|(vertex, original)| {
                let m = blend_matrix(vertex, quality, &bones);
                vertex.position = m.transform_point3(original.position).into();
                // direction, translation does not apply
                vertex.normal = m.transform_vector3(original.normal).into();
            });
        data.dirty = true;
        skinned += 1;
    }
    skinned
}
