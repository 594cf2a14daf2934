use glam::Mat4;
use hecs::{CommandBuffer, Entity, World};

use crate::math::{Aabb, BoundingSphere};
use crate::scene::components::{
    LitMeshRenderData, LocalToWorld, MeshBounds, MeshRenderer, SimpleMeshRenderData,
    SkinnedMeshRenderer, WorldBoundingSphere, WorldBounds,
};

/// Object space bounds of a mesh entity: `MeshBounds` when present, else the
/// bounds of its geometry.
fn mesh_bounds(world: &World, mesh: Entity) -> Option<Aabb> {
    if let Ok(bounds) = world.get::<&MeshBounds>(mesh) {
        return Some(bounds.0);
    }
    if let Ok(data) = world.get::<&LitMeshRenderData>(mesh) {
        return Some(data.0.bounds());
    }
    world.get::<&SimpleMeshRenderData>(mesh).ok().map(|d| d.0.bounds())
}

/// Writes `WorldBounds` and `WorldBoundingSphere` of every mesh renderer and
/// skinned mesh renderer. Renderers whose mesh has no bounds are skipped.
pub fn update_world_bounds(world: &mut World) -> usize {
    let mut updates: Vec<(Entity, Aabb)> = Vec::new();
    for (entity, (renderer, ltw)) in world
        .query::<(&MeshRenderer, Option<&LocalToWorld>)>()
        .iter()
    {
        if let Some(local) = mesh_bounds(world, renderer.mesh) {
            updates.push((entity, local.transform(&ltw.map_or(Mat4::IDENTITY, |t| t.0))));
        }
    }
    for (entity, (skinned, ltw)) in world
        .query::<(&SkinnedMeshRenderer, Option<&LocalToWorld>)>()
        .without::<&MeshRenderer>()
        .iter()
    {
        if let Some(local) = mesh_bounds(world, skinned.shared_mesh) {
            updates.push((entity, local.transform(&ltw.map_or(Mat4::IDENTITY, |t| t.0))));
        }
    }

    let count = updates.len();
    let mut cmd = CommandBuffer::new();
    for (entity, bounds) in updates {
        cmd.insert(
            entity,
            (
                WorldBounds(bounds),
                WorldBoundingSphere(BoundingSphere::from_aabb(&bounds)),
            ),
        );
    }
    cmd.run_on(world);
    count
}
