use hecs::{Entity, World};

use wgpu_render_graph::renderer::backend::{Rect, RecordingBackend};
use wgpu_render_graph::renderer::graph::{
    prepare_passes, NodeId, PassBinding, RenderGraph, RenderGraphBuilder, RenderPassType,
};
use wgpu_render_graph::scene::components::{
    Camera, CascadeShadowmappedLight, DirectionalLight, Light, ShadowmappedLight,
};
use wgpu_render_graph::settings::{DisplaySettings, RenderGraphConfig, RenderGraphMode};

fn fixed_settings(w: u32, h: u32) -> DisplaySettings {
    DisplaySettings {
        render_graph: RenderGraphConfig {
            mode: RenderGraphMode::FixedRenderBuffer,
            render_buffer_width: w,
            render_buffer_height: h,
            ..RenderGraphConfig::default()
        },
        ..DisplaySettings::default()
    }
}

struct Harness {
    world: World,
    graph: RenderGraph,
    builder: RenderGraphBuilder,
    backend: RecordingBackend,
}

impl Harness {
    fn new() -> Self {
        Self {
            world: World::new(),
            graph: RenderGraph::new(),
            builder: RenderGraphBuilder::new(),
            backend: RecordingBackend::new(),
        }
    }

    fn update(&mut self, settings: &DisplaySettings) -> bool {
        self.builder
            .update(&mut self.world, &mut self.graph, &mut self.backend, settings, false)
            .expect("graph update")
    }

    fn camera_passes(&self, node: NodeId, camera: Entity) -> Vec<RenderPassType> {
        self.graph
            .node(node)
            .passes
            .iter()
            .map(|&p| self.graph.pass(p))
            .filter(|p| matches!(p.binding, PassBinding::Camera { camera: c, .. } if c == camera))
            .map(|p| p.pass_type)
            .collect()
    }
}

#[test]
fn fixed_buffer_with_one_camera() {
    let mut h = Harness::new();
    let camera = h.world.spawn((Camera::default(),));
    let settings = fixed_settings(640, 480);
    assert!(h.update(&settings));

    let main = h.builder.main_node().expect("main node");
    let front = h.builder.front_node().expect("front node");
    assert_ne!(main, front);
    assert_eq!(h.graph.node_count(), 2);
    let target = h.graph.node(main).target.expect("offscreen main node");
    assert_eq!(target.rect, Rect::new(0, 0, 640, 480));
    assert!(h.graph.node(front).primary_surface);

    assert_eq!(
        h.camera_passes(main, camera),
        vec![
            RenderPassType::CLEAR,
            RenderPassType::OPAQUE,
            RenderPassType::TRANSPARENT,
            RenderPassType::SPRITES,
            RenderPassType::UI,
        ]
    );

    prepare_passes(&mut h.graph, &h.world, &mut h.backend, &settings).expect("prepare");
    for &pass in &h.graph.node(main).passes {
        assert_eq!(h.graph.pass(pass).viewport, Rect::new(0, 0, 640, 480));
    }
}

#[test]
fn cameras_are_appended_in_depth_order() {
    let mut h = Harness::new();
    let late = h.world.spawn((Camera {
        depth: 1.0,
        ..Camera::default()
    },));
    let early = h.world.spawn((Camera {
        depth: 0.5,
        ..Camera::default()
    },));
    h.update(&fixed_settings(640, 480));

    let main = h.builder.main_node().expect("main node");
    let passes = &h.graph.node(main).passes;
    assert_eq!(passes.len(), 10);
    let owner = |index: usize| match h.graph.pass(passes[index]).binding {
        PassBinding::Camera { camera, .. } => camera,
        other => panic!("unexpected binding {other:?}"),
    };
    assert!((0..5).all(|i| owner(i) == early));
    assert!((5..10).all(|i| owner(i) == late));
}

#[test]
fn rebuild_is_idempotent_for_an_unchanged_config() {
    let mut h = Harness::new();
    h.world.spawn((Camera::default(),));
    let settings = fixed_settings(320, 240);
    assert!(h.update(&settings));
    let (nodes, passes) = (h.graph.node_count(), h.graph.pass_count());
    let textures = h.backend.live_textures();

    assert!(!h.update(&settings));
    assert_eq!((h.graph.node_count(), h.graph.pass_count()), (nodes, passes));
    assert_eq!(h.backend.live_textures(), textures);

    // a different config is a full rebuild that releases the old targets
    assert!(h.update(&fixed_settings(400, 300)));
    assert_eq!((h.graph.node_count(), h.graph.pass_count()), (nodes, passes));
    assert_eq!(h.backend.live_textures(), textures);
}

#[test]
fn cascaded_light_gets_four_quadrant_passes() {
    let mut h = Harness::new();
    let camera = h.world.spawn((Camera::default(),));
    let light = h.world.spawn((
        Light::default(),
        DirectionalLight { size: 10.0 },
        ShadowmappedLight {
            shadow_map_resolution: 1024,
        },
        CascadeShadowmappedLight {
            cascade_scale: glam::Vec3::new(0.1, 0.3, 0.6),
            camera,
        },
    ));
    h.update(&fixed_settings(640, 480));

    let node = h.graph.shadow_node(light).expect("shadow node");
    let scissors: Vec<Rect> = h
        .graph
        .node(node)
        .passes
        .iter()
        .map(|&p| h.graph.pass(p))
        .inspect(|p| assert_eq!(p.pass_type, RenderPassType::SHADOW_MAP))
        .map(|p| p.scissor)
        .collect();
    let half = 512;
    assert_eq!(
        scissors,
        vec![
            Rect::new(0, 0, half, half),
            Rect::new(0, half, half, half),
            Rect::new(half, 0, half, half),
            Rect::new(half, half, half, half),
        ]
    );

    // already built shadow nodes are left alone
    let nodes = h.graph.node_count();
    h.update(&fixed_settings(640, 480));
    assert_eq!(h.graph.node_count(), nodes);
}

#[test]
fn dependencies_get_lower_view_ids() {
    let mut h = Harness::new();
    h.world.spawn((Camera::default(),));
    h.world.spawn((
        Light::default(),
        DirectionalLight { size: 10.0 },
        ShadowmappedLight {
            shadow_map_resolution: 256,
        },
    ));
    let settings = fixed_settings(640, 480);
    h.update(&settings);
    prepare_passes(&mut h.graph, &h.world, &mut h.backend, &settings).expect("prepare");

    for (_, node) in h.graph.nodes() {
        let own_min = node
            .passes
            .iter()
            .map(|&p| h.graph.pass(p).view_id)
            .min();
        for &dependency in &node.dependencies {
            let dep_max = h
                .graph
                .node(dependency)
                .passes
                .iter()
                .map(|&p| h.graph.pass(p).view_id)
                .max();
            if let (Some(own), Some(dep)) = (own_min, dep_max) {
                assert!(dep < own, "dependency view {dep} not before {own}");
            }
        }
    }

    // every pass reached the backend
    for (_, pass) in h.graph.passes() {
        let view = h.backend.view(pass.view_id).expect("view state");
        assert!(view.touched);
    }
}

#[test]
fn direct_mode_renders_into_the_primary_surface() {
    let mut h = Harness::new();
    h.world.spawn((Camera::default(),));
    let mut settings = DisplaySettings::default();
    settings.render_graph.mode = RenderGraphMode::DirectToFrontBuffer;
    h.update(&settings);

    assert_eq!(h.builder.main_node(), h.builder.front_node());
    assert!(h.builder.blitter().is_none());
    let main = h.builder.main_node().expect("main node");
    assert!(h.graph.node(main).target.is_none());
}

#[test]
fn destroy_survives_a_blitter_despawned_by_the_app() {
    let mut h = Harness::new();
    h.world.spawn((Camera::default(),));
    assert!(h.update(&fixed_settings(320, 240)));
    let blitter = h.builder.blitter().expect("blitter");
    h.world.despawn(blitter).expect("blitter entity");

    h.builder.destroy(&mut h.world, &mut h.graph, &mut h.backend);
    assert!(h.builder.blitter().is_none());
    assert!(h.builder.main_node().is_none());
    assert_eq!(h.backend.live_textures(), 0);
}
