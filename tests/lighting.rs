use glam::{Mat4, Vec3, Vec4};
use hecs::{Entity, World};

use wgpu_render_graph::error::{LightSlot, RenderError};
use wgpu_render_graph::renderer::backend::TextureHandle;
use wgpu_render_graph::renderer::graph::RenderGraph;
use wgpu_render_graph::renderer::lighting::{
    update_lighting, Lighting, MAX_CSM_LIGHTS, MAX_MAPPED_LIGHTS, MAX_POINT_OR_DIR_LIGHTS,
};
use wgpu_render_graph::scene::components::{
    AmbientLight, Camera, CascadeShadowmappedLight, DirectionalLight, Fog, FogMode, Light,
    LightToLightingSetup, LocalToWorld, ShadowmappedLight, SpotLight,
};
use wgpu_render_graph::scene::update_light_matrices;

const EPSILON: f32 = 1e-5;

fn no_shadow() -> TextureHandle {
    TextureHandle::new(99)
}

fn setup(world: &mut World) -> Entity {
    world.spawn((Lighting::default(),))
}

fn point_light(world: &mut World, setup: Entity, position: Vec3) -> Entity {
    world.spawn((
        Light::default(),
        LocalToWorld(Mat4::from_translation(position)),
        LightToLightingSetup(vec![setup]),
    ))
}

fn mapped_spot(world: &mut World, setup: Entity) -> Entity {
    world.spawn((
        Light::default(),
        SpotLight {
            fov: 45.0,
            inner_radius: 0.5,
            ratio: 0.5,
        },
        ShadowmappedLight {
            shadow_map_resolution: 256,
        },
        LightToLightingSetup(vec![setup]),
    ))
}

fn cascaded_sun(world: &mut World, setup: Entity) -> Entity {
    let camera = world.spawn((Camera::default(),));
    world.spawn((
        Light::default(),
        DirectionalLight { size: 20.0 },
        ShadowmappedLight {
            shadow_map_resolution: 1024,
        },
        CascadeShadowmappedLight {
            cascade_scale: Vec3::new(0.1, 0.3, 0.6),
            camera,
        },
        LightToLightingSetup(vec![setup]),
    ))
}

fn lighting(world: &World, setup: Entity) -> Lighting {
    *world.get::<&Lighting>(setup).expect("lighting setup")
}

fn update(world: &mut World) -> Result<(), RenderError> {
    update_light_matrices(world);
    update_lighting(world, &RenderGraph::new(), no_shadow(), false)
}

#[test]
fn lights_fill_their_setups() {
    let mut world = World::new();
    let a = setup(&mut world);
    let b = setup(&mut world);
    world.spawn((
        Light {
            color: Vec3::new(0.2, 0.2, 0.2),
            ..Light::default()
        },
        AmbientLight,
        LightToLightingSetup(vec![a, b]),
    ));
    point_light(&mut world, a, Vec3::new(1.0, 2.0, 3.0));
    mapped_spot(&mut world, b);
    update(&mut world).expect("lighting");

    let la = lighting(&world, a);
    assert_eq!(la.num_point_or_dir(), 1);
    assert_eq!(la.num_mapped(), 0);
    let (pos, _) = la.point_or_dir(0).expect("point light");
    assert!((pos - Vec4::new(1.0, 2.0, 3.0, 1.0)).abs().max_element() < EPSILON);

    let lb = lighting(&world, b);
    assert_eq!(lb.num_point_or_dir(), 0);
    assert_eq!(lb.num_mapped(), 1);
    // no shadow node in an empty graph
    assert_eq!(lb.mapped(0).expect("mapped").shadow_map, no_shadow());
    assert!((lb.ambient - la.ambient).abs().max_element() < EPSILON);
}

#[test]
fn lighting_is_rebuilt_every_frame() {
    let mut world = World::new();
    let s = setup(&mut world);
    let light = point_light(&mut world, s, Vec3::ZERO);
    update(&mut world).expect("lighting");
    update(&mut world).expect("lighting");
    assert_eq!(lighting(&world, s).num_point_or_dir(), 1);

    world.despawn(light).expect("light");
    update(&mut world).expect("lighting");
    assert_eq!(lighting(&world, s).num_point_or_dir(), 0);
}

#[test]
fn ninth_simple_light_is_rejected() {
    let mut world = World::new();
    let s = setup(&mut world);
    for i in 0..MAX_POINT_OR_DIR_LIGHTS {
        point_light(&mut world, s, Vec3::new(i as f32, 0.0, 0.0));
    }
    update(&mut world).expect("eight lights fit");

    point_light(&mut world, s, Vec3::new(0.0, 5.0, 0.0));
    let err = update(&mut world).unwrap_err();
    assert_eq!(
        err,
        RenderError::TooManyLights {
            kind: LightSlot::PointOrDirectional,
            capacity: MAX_POINT_OR_DIR_LIGHTS,
        }
    );
}

#[test]
fn third_mapped_light_is_rejected() {
    let mut world = World::new();
    let s = setup(&mut world);
    for _ in 0..MAX_MAPPED_LIGHTS {
        mapped_spot(&mut world, s);
    }
    update(&mut world).expect("two mapped lights fit");

    mapped_spot(&mut world, s);
    let err = update(&mut world).unwrap_err();
    assert_eq!(
        err,
        RenderError::TooManyLights {
            kind: LightSlot::Mapped,
            capacity: MAX_MAPPED_LIGHTS,
        }
    );
}

#[test]
fn second_cascaded_light_is_rejected() {
    let mut world = World::new();
    let s = setup(&mut world);
    cascaded_sun(&mut world, s);
    update(&mut world).expect("one cascaded light fits");
    assert_eq!(lighting(&world, s).num_csm(), MAX_CSM_LIGHTS);

    cascaded_sun(&mut world, s);
    let err = update(&mut world).unwrap_err();
    assert_eq!(
        err,
        RenderError::TooManyLights {
            kind: LightSlot::Cascaded,
            capacity: MAX_CSM_LIGHTS,
        }
    );
}

#[test]
fn fog_with_empty_range_fails() {
    let mut world = World::new();
    let s = setup(&mut world);
    world.spawn((
        Fog {
            mode: FogMode::Linear,
            color: Vec4::new(0.5, 0.5, 0.5, 1.0),
            density: 0.0,
            start_distance: 10.0,
            end_distance: 10.0,
        },
        LightToLightingSetup(vec![s]),
    ));
    let err = update(&mut world).unwrap_err();
    assert_eq!(err, RenderError::InvalidFogRange { start: 10.0, end: 10.0 });
}

#[test]
fn light_targeting_a_missing_setup_is_skipped() {
    let mut world = World::new();
    let s = setup(&mut world);
    let not_a_setup = world.spawn(());
    world.spawn((
        Light::default(),
        LocalToWorld(Mat4::IDENTITY),
        LightToLightingSetup(vec![not_a_setup, s]),
    ));
    update(&mut world).expect("lighting");
    assert_eq!(lighting(&world, s).num_point_or_dir(), 1);
}
