use std::sync::Arc;

use glam::{Mat4, Vec3};
use hecs::World;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use wgpu_render_graph::asset::LitMeshData;
use wgpu_render_graph::math::{Aabb, BoundingSphere, CullingResult, Frustum};
use wgpu_render_graph::renderer::graph::RenderPassType;
use wgpu_render_graph::renderer::{
    LitMaterial, LitVertex, RecordingBackend, Renderer, ShaderRegistry,
};
use wgpu_render_graph::scene::components::{
    Camera, LitMeshRenderData, LitMeshRenderer, LocalToWorld, MeshRenderer,
};
use wgpu_render_graph::settings::DisplaySettings;

fn camera_frustum() -> Frustum {
    let projection = Mat4::perspective_rh_gl(60f32.to_radians(), 4.0 / 3.0, 0.1, 100.0);
    let view = Mat4::look_at_rh(Vec3::new(0.0, 2.0, 5.0), Vec3::ZERO, Vec3::Y);
    Frustum::from_view_projection(&(projection * view))
}

fn random_vec(rng: &mut SmallRng, range: f32) -> Vec3 {
    Vec3::new(
        rng.gen_range(-range..range),
        rng.gen_range(-range..range),
        rng.gen_range(-range..range),
    )
}

/// Samples points of the volume; any sample inside the frustum means the
/// volume must not be rejected.
fn any_sample_visible(frustum: &Frustum, samples: impl Iterator<Item = Vec3>) -> bool {
    samples.into_iter().any(|p| frustum.contains_point(p))
}

#[test]
fn sphere_culling_never_rejects_visible_spheres() {
    let frustum = camera_frustum();
    let mut rng = SmallRng::seed_from_u64(0x5eed);
    let mut rejected = 0;
    for _ in 0..2000 {
        let sphere = BoundingSphere::new(random_vec(&mut rng, 60.0), rng.gen_range(0.1..5.0));
        let result = frustum.cull_sphere(&sphere);
        let samples: Vec<Vec3> = (0..64)
            .map(|_| {
                let dir = random_vec(&mut rng, 1.0).normalize_or_zero();
                sphere.position + dir * sphere.radius * rng.gen_range(0.0f32..1.0)
            })
            .chain(std::iter::once(sphere.position))
            .collect();
        if result == CullingResult::Outside {
            rejected += 1;
            assert!(
                !any_sample_visible(&frustum, samples.into_iter()),
                "visible sphere {sphere:?} was culled"
            );
        }
    }
    assert!(rejected > 0);
}

#[test]
fn box_culling_never_rejects_visible_boxes() {
    let frustum = camera_frustum();
    let mut rng = SmallRng::seed_from_u64(42);
    let mut rejected = 0;
    for _ in 0..2000 {
        let extents = Vec3::new(
            rng.gen_range(0.05..4.0),
            rng.gen_range(0.05..4.0),
            rng.gen_range(0.05..4.0),
        );
        let aabb = Aabb::new(random_vec(&mut rng, 60.0), extents);
        if !frustum.is_culled(&aabb) {
            continue;
        }
        rejected += 1;
        let samples = (0..64).map(|_| {
            let t = Vec3::new(
                rng.gen_range(-1.0..=1.0),
                rng.gen_range(-1.0..=1.0),
                rng.gen_range(-1.0..=1.0),
            );
            aabb.center + t * aabb.extents
        });
        let corners = (0..8).map(|i| {
            let sign = Vec3::new(
                if i & 1 == 0 { -1.0 } else { 1.0 },
                if i & 2 == 0 { -1.0 } else { 1.0 },
                if i & 4 == 0 { -1.0 } else { 1.0 },
            );
            aabb.center + sign * aabb.extents
        });
        assert!(
            !any_sample_visible(&frustum, samples.chain(corners).collect::<Vec<_>>().into_iter()),
            "visible box {aabb:?} was culled"
        );
    }
    assert!(rejected > 0);
}

#[test]
fn everything_frustum_culls_nothing() {
    let frustum = Frustum::EVERYTHING;
    let far = Aabb::new(Vec3::splat(1.0e6), Vec3::ONE);
    assert!(!frustum.is_culled(&far));
    assert_ne!(
        frustum.cull_sphere(&BoundingSphere::new(Vec3::splat(-1.0e6), 1.0)),
        CullingResult::Outside
    );
}

fn cube() -> LitMeshData {
    let mut vertices = Vec::new();
    for i in 0..8 {
        let p = [
            if i & 1 == 0 { -0.5 } else { 0.5 },
            if i & 2 == 0 { -0.5 } else { 0.5 },
            if i & 4 == 0 { -0.5 } else { 0.5 },
        ];
        vertices.push(LitVertex {
            position: p,
            normal: p,
            ..LitVertex::default()
        });
    }
    let indices = vec![
        0, 2, 1, 1, 2, 3, 4, 5, 6, 5, 7, 6, 0, 1, 4, 1, 5, 4, 2, 6, 3, 3, 6, 7, 0, 4, 2, 2, 4, 6, 1,
        3, 5, 3, 7, 5,
    ];
    LitMeshData::new(indices, vertices).expect("cube")
}

#[test]
fn meshes_behind_the_camera_are_not_drawn() {
    let mut renderer = Renderer::new(
        RecordingBackend::new(),
        &ShaderRegistry::placeholder(),
        DisplaySettings::default(),
    )
    .expect("renderer");
    let mut world = World::new();
    world.spawn((Camera::default(),));
    let mesh = world.spawn((LitMeshRenderData(Arc::new(cube())),));
    let material = world.spawn((LitMaterial::default(),));
    let spawn_at = |world: &mut World, z: f32| {
        world.spawn((
            MeshRenderer {
                mesh,
                material,
                start_index: 0,
                index_count: 36,
            },
            LitMeshRenderer,
            LocalToWorld(Mat4::from_translation(Vec3::new(0.0, 0.0, z))),
        ))
    };
    let front = spawn_at(&mut world, -10.0);
    spawn_at(&mut world, 10.0);

    let stats = renderer.render_frame(&mut world).expect("frame");
    // both renderers share a chunk whose sphere reaches into view
    assert_eq!(stats.draws_for(RenderPassType::OPAQUE), 1);
    assert_eq!(stats.culled_instances, 1);
    assert_eq!(stats.culled_chunks, 0);

    // with both behind the camera the whole chunk goes
    world.get::<&mut LocalToWorld>(front).expect("transform").0 =
        Mat4::from_translation(Vec3::new(0.0, 0.0, 12.0));
    let stats = renderer.render_frame(&mut world).expect("frame");
    assert_eq!(stats.draws_for(RenderPassType::OPAQUE), 0);
    assert_eq!(stats.culled_chunks, 1);
    assert_eq!(stats.culled_instances, 0);
}
