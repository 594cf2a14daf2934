// renderer/graph/builder.rs (default graph for the configured render mode)

use glam::Vec4;
use hecs::{Entity, World};

use super::screen_to_world::{ScreenToWorldId, ScreenToWorldRoot};
use super::{
    NodeId, NodeTarget, PassBinding, PassMask, PassSort, RenderGraph, RenderNode, RenderPass,
    RenderPassType,
};
use crate::error::RenderResult;
use crate::renderer::backend::{ClearFlags, GraphicsBackend, Rect};
use crate::renderer::texture::{RenderTargetFormat, TextureFlags};
use crate::settings::{ColorSpace, DisplaySettings, RenderGraphConfig, RenderGraphMode};
use crate::scene::components::{
    BlitRenderer, Camera, CameraMask, CascadeShadowmappedLight, Light, RenderToPasses,
    ShadowMask, ShadowmappedLight,
};

/// Clear color of passes whose real color is filled in later.
pub const WARNING_CLEAR_COLOR: u32 = 0xff00ffff;

/// Clear colors of the four cascades, matching the cascade select in the shader.
const CASCADE_CLEAR_COLORS: [u32; 4] = [0xff0000ff, 0xff7f00ff, 0xffff00ff, 0x00ff00ff];
const SHADOW_CLEAR_COLOR: u32 = 0x0000ffff;

fn to_u16(x: u32) -> u16 {
    u16::try_from(x).unwrap_or(u16::MAX)
}

/// Offscreen buffer size that keeps the target aspect and fits in `max_size`.
pub fn compute_auto_scale_size(target_w: u32, target_h: u32, max_size: u32) -> (u32, u32) {
    let (target_w, target_h, max_size) = (target_w.max(1), target_h.max(1), max_size.max(1));
    if target_w <= max_size && target_h <= max_size {
        return (target_w, target_h);
    }
    let scale = max_size as f32 / target_w.max(target_h) as f32;
    let w = ((target_w as f32 * scale) as u32).clamp(1, max_size);
    let h = ((target_h as f32 * scale) as u32).clamp(1, max_size);
    (w, h)
}

/// Builds and maintains the default render graph.
#[derive(Debug, Default)]
pub struct RenderGraphBuilder {
    current_config: Option<RenderGraphConfig>,
    main_node: Option<NodeId>,
    front_node: Option<NodeId>,
    blitter: Option<Entity>,
    /// Framebuffer size an auto scaled main node was sized for.
    scaled_for: Option<(u32, u32)>,
}

impl RenderGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn main_node(&self) -> Option<NodeId> {
        self.main_node
    }

    pub fn front_node(&self) -> Option<NodeId> {
        self.front_node
    }

    pub fn blitter(&self) -> Option<Entity> {
        self.blitter
    }

    pub fn current_config(&self) -> Option<RenderGraphConfig> {
        self.current_config
    }

    /// Rebuilds the graph if the configuration changed and adds shadow nodes
    /// for new shadow mapped lights. Returns whether a rebuild happened.
    pub fn update(
        &mut self,
        world: &mut World,
        graph: &mut RenderGraph,
        backend: &mut dyn GraphicsBackend,
        settings: &DisplaySettings,
        allow_srgb: bool,
    ) -> RenderResult<bool> {
        let config = settings.render_graph;
        let framebuffer = (settings.framebuffer_width, settings.framebuffer_height);
        let resized = self.scaled_for.is_some_and(|size| size != framebuffer);
        let rebuild = self.current_config != Some(config) || self.main_node.is_none() || resized;
        if rebuild {
            log::info!("render graph config changed, building a new render graph");
            self.rebuild(world, graph, backend, settings, allow_srgb)?;
        }
        let added = self.build_light_nodes(world, graph, backend, allow_srgb)?;
        if added > 0 {
            let (groups, passes) = graph.groups_and_passes();
            groups.refresh(passes);
        }
        Ok(rebuild)
    }

    /// Tears down and rebuilds the graph regardless of configuration changes.
    pub fn rebuild(
        &mut self,
        world: &mut World,
        graph: &mut RenderGraph,
        backend: &mut dyn GraphicsBackend,
        settings: &DisplaySettings,
        allow_srgb: bool,
    ) -> RenderResult<()> {
        self.destroy(world, graph, backend);
        self.current_config = Some(settings.render_graph);
        self.build(world, graph, backend, settings, allow_srgb)?;
        self.create_screen_to_world_chain(graph, RenderPassType::OPAQUE, ScreenToWorldId::MainCamera);
        self.create_screen_to_world_chain(graph, RenderPassType::SPRITES, ScreenToWorldId::Sprites);
        self.create_screen_to_world_chain(graph, RenderPassType::UI, ScreenToWorldId::UILayer);
        Ok(())
    }

    /// Releases the graph and every render group assignment.
    pub fn destroy(
        &mut self,
        world: &mut World,
        graph: &mut RenderGraph,
        backend: &mut dyn GraphicsBackend,
    ) {
        graph.teardown(backend);
        let assigned: Vec<Entity> = world
            .query::<&RenderToPasses>()
            .iter()
            .map(|(e, _)| e)
            .collect();
        for entity in assigned {
            if let Err(err) = world.remove_one::<RenderToPasses>(entity) {
                log::warn!("Could not clear render groups of {:?}: {}", entity, err);
            }
        }
        if let Some(blitter) = self.blitter.take() {
            if world.despawn(blitter).is_err() {
                log::warn!("Blitter entity {:?} was already despawned", blitter);
            }
        }
        self.main_node = None;
        self.front_node = None;
        self.scaled_for = None;
    }

    fn build(
        &mut self,
        world: &mut World,
        graph: &mut RenderGraph,
        backend: &mut dyn GraphicsBackend,
        settings: &DisplaySettings,
        allow_srgb: bool,
    ) -> RenderResult<()> {
        let config = settings.render_graph;
        let (main, w, h) = if config.mode != RenderGraphMode::DirectToFrontBuffer {
            let (w, h) = if config.mode == RenderGraphMode::FixedRenderBuffer {
                (config.render_buffer_width, config.render_buffer_height)
            } else {
                self.scaled_for = Some((settings.framebuffer_width, settings.framebuffer_height));
                compute_auto_scale_size(
                    settings.framebuffer_width,
                    settings.framebuffer_height,
                    config.render_buffer_max_size,
                )
            };
            let mut color_flags = TextureFlags::LINEAR | TextureFlags::UV_CLAMP;
            if settings.color_space == ColorSpace::Linear {
                color_flags |= TextureFlags::SRGB;
            }
            let target = NodeTarget::create(
                backend,
                to_u16(w),
                to_u16(h),
                Some((RenderTargetFormat::Rgba, color_flags)),
                Some((
                    RenderTargetFormat::DepthStencil,
                    TextureFlags::LINEAR | TextureFlags::UV_CLAMP,
                )),
                allow_srgb,
            )?;
            let main = graph.add_node(RenderNode::offscreen(target));
            // size follows the display every frame
            let front = Self::create_front_buffer_node(graph, 0, 0);
            graph.link(front, main);
            self.front_node = Some(front);
            self.add_blitter(world, graph, main, front);
            (main, w, h)
        } else {
            if settings.color_space != ColorSpace::Gamma {
                log::warn!(
                    "Rendering directly to the front buffer with linear color space. This will not look the same on all platforms."
                );
            }
            let (w, h) = (settings.framebuffer_width, settings.framebuffer_height);
            let main = Self::create_front_buffer_node(graph, w, h);
            self.front_node = Some(main);
            (main, w, h)
        };
        self.main_node = Some(main);

        let aspect = w as f32 / h.max(1) as f32;
        let mut cameras: Vec<(f32, Entity, u64)> = Vec::new();
        for (entity, (camera, mask)) in world.query_mut::<(&mut Camera, Option<&CameraMask>)>() {
            camera.aspect = aspect;
            let mask = mask.map_or(u64::MAX, |m| m.0);
            if mask == 0 {
                continue;
            }
            cameras.push((camera.depth, entity, mask));
        }
        cameras.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.id().cmp(&b.1.id())));
        for (_, camera, mask) in cameras {
            Self::create_camera_passes(graph, main, camera, mask, w, h);
        }
        Ok(())
    }

    fn create_front_buffer_node(graph: &mut RenderGraph, w: u32, h: u32) -> NodeId {
        let node = graph.add_node(RenderNode::primary());
        let viewport = Rect::new(0, 0, to_u16(w), to_u16(h));
        let blit = RenderPass {
            auto_size: true,
            clear_from_border: true,
            ..RenderPass::new(RenderPassType::FULLSCREEN_QUAD, PassSort::Unsorted, viewport)
                .with_clear(ClearFlags::COLOR, 0xff)
        };
        graph.add_pass(node, blit);
        let debug = RenderPass {
            auto_size: true,
            ..RenderPass::new(RenderPassType::DEBUG_OVERLAY, PassSort::Sorted, viewport)
        };
        graph.add_pass(node, debug);
        node
    }

    /// Appends the Clear, Opaque, Transparent, Sprites and UI passes of one camera.
    fn create_camera_passes(
        graph: &mut RenderGraph,
        node: NodeId,
        camera: Entity,
        camera_mask: u64,
        w: u32,
        h: u32,
    ) {
        let viewport = Rect::new(0, 0, to_u16(w), to_u16(h));
        let passes = [
            (RenderPassType::CLEAR, PassSort::Unsorted),
            (RenderPassType::OPAQUE, PassSort::Unsorted),
            (RenderPassType::TRANSPARENT, PassSort::SortZLess),
            (RenderPassType::SPRITES, PassSort::SortZGreater),
            (RenderPassType::UI, PassSort::Sorted),
        ];
        for (pass_type, sort) in passes {
            let update_clear = pass_type == RenderPassType::CLEAR;
            let mut pass = RenderPass {
                auto_size: true,
                mask: PassMask::Camera(camera_mask),
                binding: PassBinding::Camera {
                    camera,
                    update_clear,
                },
                ..RenderPass::new(pass_type, sort, viewport)
            };
            if update_clear {
                // copied from the camera every frame
                pass = pass.with_clear(ClearFlags::COLOR | ClearFlags::DEPTH, WARNING_CLEAR_COLOR);
            }
            graph.add_pass(node, pass);
        }
    }

    fn add_blitter(&mut self, world: &mut World, graph: &mut RenderGraph, source: NodeId, target: NodeId) {
        let texture = graph
            .node(source)
            .target
            .and_then(|t| t.color)
            .map(|c| c.handle)
            .unwrap_or_default();
        let Some(pass) = graph.find_pass_on_node(target, RenderPassType::FULLSCREEN_QUAD) else {
            return;
        };
        graph.pass_mut(pass).binding = PassBinding::BlitterAutoAspect { source };
        let group = graph.groups_mut().create_explicit(vec![pass]);
        let blitter = world.spawn((
            BlitRenderer {
                texture,
                color: Vec4::ONE,
            },
            RenderToPasses(group),
        ));
        self.blitter = Some(blitter);
    }

    fn create_screen_to_world_chain(
        &self,
        graph: &mut RenderGraph,
        pass_type: RenderPassType,
        id: ScreenToWorldId,
    ) {
        let (Some(main), Some(front)) = (self.main_node, self.front_node) else {
            return;
        };
        let root = if main != front {
            let root_pass = graph.find_pass_on_node(front, RenderPassType::FULLSCREEN_QUAD);
            let chain_pass = graph.find_pass_on_node(main, pass_type);
            root_pass.zip(chain_pass).map(|(pass, chain)| ScreenToWorldRoot {
                id,
                pass,
                chain: vec![chain],
            })
        } else {
            graph
                .find_pass_on_node(front, pass_type)
                .map(|pass| ScreenToWorldRoot {
                    id,
                    pass,
                    chain: Vec::new(),
                })
        };
        match root {
            Some(root) => graph.add_root(root),
            None => log::debug!("No {:?} pass for screen to world root {:?}", pass_type, id),
        }
    }

    /// Gives every shadow mapped light without a shadow node its node, passes
    /// and shadow map. Returns how many nodes were added.
    fn build_light_nodes(
        &self,
        world: &World,
        graph: &mut RenderGraph,
        backend: &mut dyn GraphicsBackend,
        allow_srgb: bool,
    ) -> RenderResult<usize> {
        let Some(output) = self.main_node else {
            return Ok(0);
        };
        let mut added = 0;
        for (light, (_, shadowed, cascaded, mask)) in world
            .query::<(
                &Light,
                &ShadowmappedLight,
                Option<&CascadeShadowmappedLight>,
                Option<&ShadowMask>,
            )>()
            .iter()
        {
            if graph.shadow_node(light).is_some() {
                continue;
            }
            let size = to_u16(shadowed.shadow_map_resolution.max(1));
            let flags = TextureFlags::UV_CLAMP | TextureFlags::NEAREST;
            let target = NodeTarget::create(
                backend,
                size,
                size,
                Some((RenderTargetFormat::Rgba, flags)),
                Some((RenderTargetFormat::ShadowMap, flags)),
                allow_srgb,
            )?;
            let node = graph.add_node(RenderNode {
                shadow_light: Some(light),
                ..RenderNode::offscreen(target)
            });
            let mask = PassMask::Shadow(mask.map_or(u64::MAX, |m| m.0));
            if cascaded.is_some() {
                for cascade in 0..4 {
                    add_shadow_map_pass(graph, node, light, Some(cascade), size, mask);
                }
            } else {
                add_shadow_map_pass(graph, node, light, None, size, mask);
            }
            graph.link(output, node);
            log::debug!(
                "Build shadow map node {}*{} for light {:?}, input to {:?}",
                size,
                size,
                light,
                output
            );
            added += 1;
        }
        Ok(added)
    }
}

fn add_shadow_map_pass(
    graph: &mut RenderGraph,
    node: NodeId,
    light: Entity,
    cascade: Option<usize>,
    size: u16,
    mask: PassMask,
) {
    let (rect, color, binding) = match cascade {
        Some(index) => {
            let res = size >> 1;
            let (dx, dy) = match index {
                0 => (0, 0),
                1 => (0, res),
                2 => (res, 0),
                _ => (res, res),
            };
            (
                Rect::new(dx, dy, res, res),
                CASCADE_CLEAR_COLORS[index.min(3)],
                PassBinding::Cascade {
                    light,
                    cascade: index,
                },
            )
        }
        None => (
            Rect::new(0, 0, size, size),
            SHADOW_CLEAR_COLOR,
            PassBinding::Light { light },
        ),
    };
    let pass = RenderPass {
        scissor: rect,
        binding,
        mask,
        ..RenderPass::new(RenderPassType::SHADOW_MAP, PassSort::Unsorted, rect)
            .with_clear(ClearFlags::DEPTH | ClearFlags::COLOR, color)
    };
    graph.add_pass(node, pass);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::RecordingBackend;

    #[test]
    fn auto_scale_keeps_small_targets() {
        assert_eq!(compute_auto_scale_size(800, 600, 1024), (800, 600));
        assert_eq!(compute_auto_scale_size(2048, 1024, 1024), (1024, 512));
        assert_eq!(compute_auto_scale_size(1000, 4000, 1000), (250, 1000));
    }

    #[test]
    fn direct_mode_renders_cameras_into_front_buffer() {
        let mut world = World::new();
        world.spawn((Camera::default(),));
        let mut graph = RenderGraph::new();
        let mut backend = RecordingBackend::new();
        let mut settings = DisplaySettings::default();
        settings.render_graph.mode = RenderGraphMode::DirectToFrontBuffer;

        let mut builder = RenderGraphBuilder::new();
        assert!(builder
            .update(&mut world, &mut graph, &mut backend, &settings, false)
            .expect("build"));
        assert_eq!(builder.main_node(), builder.front_node());
        assert_eq!(graph.node_count(), 1);
        // blit + debug + camera quintet
        assert_eq!(graph.pass_count(), 7);
        assert!(builder.blitter().is_none());
        assert_eq!(backend.live_textures(), 0);
    }

    #[test]
    fn masked_out_cameras_get_no_passes() {
        let mut world = World::new();
        world.spawn((Camera::default(), CameraMask(0)));
        let mut graph = RenderGraph::new();
        let mut backend = RecordingBackend::new();
        let settings = DisplaySettings::default();
        let mut builder = RenderGraphBuilder::new();
        builder
            .update(&mut world, &mut graph, &mut backend, &settings, false)
            .expect("build");
        let main = builder.main_node().expect("main");
        assert!(graph.node(main).passes.is_empty());
    }

    #[test]
    fn single_shadow_pass_covers_whole_map() {
        let mut world = World::new();
        world.spawn((Camera::default(),));
        let light = world.spawn((
            Light::default(),
            ShadowmappedLight {
                shadow_map_resolution: 512,
            },
            ShadowMask(0b10),
        ));
        let mut graph = RenderGraph::new();
        let mut backend = RecordingBackend::new();
        let settings = DisplaySettings::default();
        let mut builder = RenderGraphBuilder::new();
        builder
            .update(&mut world, &mut graph, &mut backend, &settings, false)
            .expect("build");

        let node = graph.shadow_node(light).expect("shadow node");
        assert_eq!(graph.node(node).passes.len(), 1);
        let pass = graph.pass(graph.node(node).passes[0]);
        assert_eq!(pass.viewport, Rect::new(0, 0, 512, 512));
        assert_eq!(pass.scissor, pass.viewport);
        assert_eq!(pass.clear.rgba, SHADOW_CLEAR_COLOR);
        assert_eq!(pass.mask, PassMask::Shadow(0b10));
        let main = builder.main_node().expect("main");
        assert!(graph.node(main).dependencies.contains(&node));

        // second update adds nothing
        let before = graph.pass_count();
        assert!(!builder
            .update(&mut world, &mut graph, &mut backend, &settings, false)
            .expect("update"));
        assert_eq!(graph.pass_count(), before);
    }

    #[test]
    fn auto_scaled_graph_follows_framebuffer_size() {
        let mut world = World::new();
        world.spawn((Camera::default(),));
        let mut graph = RenderGraph::new();
        let mut backend = RecordingBackend::new();
        let mut settings = DisplaySettings::default();
        let mut builder = RenderGraphBuilder::new();
        builder
            .update(&mut world, &mut graph, &mut backend, &settings, false)
            .expect("build");
        settings.framebuffer_width = 640;
        settings.framebuffer_height = 480;
        assert!(builder
            .update(&mut world, &mut graph, &mut backend, &settings, false)
            .expect("rebuild"));
        let main = builder.main_node().expect("main");
        let rect = graph.node(main).target.expect("offscreen").rect;
        assert_eq!((rect.w, rect.h), (640, 480));
    }
}
