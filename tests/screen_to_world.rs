use glam::{Mat4, Vec2, Vec3};
use hecs::World;

use wgpu_render_graph::renderer::{
    RecordingBackend, Renderer, ScreenToWorldId, ShaderRegistry,
};
use wgpu_render_graph::scene::components::{Camera, LocalToWorld};
use wgpu_render_graph::settings::{DisplaySettings, RenderGraphMode};

const EPSILON: f32 = 1e-2;

fn settings(mode: RenderGraphMode) -> DisplaySettings {
    let mut settings = DisplaySettings {
        width: 800,
        height: 600,
        framebuffer_width: 1600,
        framebuffer_height: 1200,
        ..DisplaySettings::default()
    };
    settings.render_graph.mode = mode;
    settings
}

/// Renders one frame with a camera at (0, 0, 10) looking down -z.
fn rendered(mode: RenderGraphMode) -> (Renderer<RecordingBackend>, World) {
    let mut renderer = Renderer::new(
        RecordingBackend::new(),
        &ShaderRegistry::placeholder(),
        settings(mode),
    )
    .expect("renderer");
    let mut world = World::new();
    world.spawn((
        Camera::default(),
        LocalToWorld(Mat4::from_translation(Vec3::new(0.0, 0.0, 10.0))),
    ));
    renderer.render_frame(&mut world).expect("frame");
    (renderer, world)
}

fn check_round_trip(mode: RenderGraphMode) {
    let (renderer, world) = rendered(mode);
    let query = renderer.screen_to_world(&world);

    let center = query
        .world_to_screen(Vec3::ZERO, ScreenToWorldId::MainCamera)
        .expect("main camera root");
    assert!((center.truncate() - Vec2::new(800.0, 600.0)).length() < EPSILON);

    for point in [
        Vec3::new(1.0, 0.5, 0.0),
        Vec3::new(-2.0, 1.5, -3.0),
        Vec3::new(0.25, -1.0, 4.0),
    ] {
        let screen = query
            .world_to_screen(point, ScreenToWorldId::MainCamera)
            .expect("to screen");
        let back = query
            .screen_to_world(screen.truncate(), screen.z, ScreenToWorldId::MainCamera)
            .expect("to world");
        assert!(
            (back - point).length() < EPSILON,
            "{point:?} came back as {back:?} in {mode:?}"
        );
    }
}

#[test]
fn round_trip_through_the_blit() {
    check_round_trip(RenderGraphMode::AutoScaledRenderBuffer);
}

#[test]
fn round_trip_direct_to_front_buffer() {
    check_round_trip(RenderGraphMode::DirectToFrontBuffer);
}

#[test]
fn center_ray_follows_the_view_axis() {
    let (renderer, world) = rendered(RenderGraphMode::DirectToFrontBuffer);
    let query = renderer.screen_to_world(&world);
    let (_, direction) = query
        .screen_to_world_ray(Vec2::new(800.0, 600.0), ScreenToWorldId::MainCamera)
        .expect("ray");
    // from mid depth toward the near plane
    assert!((direction - Vec3::Z).length() < EPSILON);

    let hit = query
        .input_pos_to_world_pos(Vec2::new(400.0, 300.0), 10.0, ScreenToWorldId::MainCamera)
        .expect("plane hit");
    assert!(hit.length() < EPSILON);
    assert_eq!(
        query.find_camera(ScreenToWorldId::MainCamera).expect("root"),
        world.query::<&Camera>().iter().next().map(|(e, _)| e)
    );
}

#[test]
fn ui_layer_has_its_own_root() {
    let (renderer, world) = rendered(RenderGraphMode::AutoScaledRenderBuffer);
    let query = renderer.screen_to_world(&world);
    assert!(query.world_to_screen(Vec3::ZERO, ScreenToWorldId::UILayer).is_ok());
    assert!(query.world_to_screen(Vec3::ZERO, ScreenToWorldId::Sprites).is_ok());
}
