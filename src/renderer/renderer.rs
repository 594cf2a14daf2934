// renderer/renderer.rs
use std::collections::HashMap;

use hecs::World;

use crate::error::RenderResult;
use crate::renderer::backend::GraphicsBackend;
use crate::renderer::graph::{
    assign_render_groups, prepare_passes, RenderGraph, RenderGraphBuilder, RenderPassType,
    ScreenToWorld,
};
use crate::renderer::lighting::update_lighting;
use crate::renderer::material::resolve_materials;
use crate::renderer::mesh_manager::{upload_meshes, MeshUploadStats};
use crate::renderer::render_context::RenderContext;
use crate::renderer::shaders::ShaderRegistry;
use crate::renderer::submit::{
    submit_blitters, submit_lit_meshes, submit_simple_meshes, SubmitContext, SubmitStats,
};
use crate::renderer::texture::upload_textures;
use crate::scene::{
    update_camera_matrices, update_light_matrices, update_skinning, update_world_bounds,
    SkinningStats,
};
use crate::settings::{ColorSpace, DisplaySettings};

/// What one call to `Renderer::render_frame` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Backend frame number.
    pub frame: u64,
    pub passes: usize,
    pub draws: HashMap<RenderPassType, usize>,
    pub culled_chunks: usize,
    pub culled_instances: usize,
    pub encoders_used: usize,
    pub graph_rebuilt: bool,
    pub fallback_clear: bool,
    pub textures_uploaded: usize,
    pub meshes: MeshUploadStats,
    pub skinning: SkinningStats,
}

impl FrameStats {
    pub fn total_draws(&self) -> usize {
        self.draws.values().sum()
    }

    pub fn draws_for(&self, pass_type: RenderPassType) -> usize {
        self.draws.get(&pass_type).copied().unwrap_or(0)
    }
}

pub struct Renderer<B: GraphicsBackend> {
    context: RenderContext<B>,
    builder: RenderGraphBuilder,
    graph: RenderGraph,
    settings: DisplaySettings,
}

impl<B: GraphicsBackend> Renderer<B> {
    pub fn new(backend: B, shaders: &ShaderRegistry, settings: DisplaySettings) -> RenderResult<Self> {
        let context = RenderContext::init(backend, shaders)?;
        Ok(Self {
            context,
            builder: RenderGraphBuilder::new(),
            graph: RenderGraph::new(),
            settings,
        })
    }

    pub fn settings(&self) -> &DisplaySettings {
        &self.settings
    }

    /// Changes take effect on the next frame. A different render graph
    /// configuration rebuilds the graph.
    pub fn set_settings(&mut self, settings: DisplaySettings) {
        self.settings = settings;
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.settings.framebuffer_width = width.max(1);
        self.settings.framebuffer_height = height.max(1);
        if self.settings.auto_size_to_frame {
            self.settings.width = self.settings.framebuffer_width;
            self.settings.height = self.settings.framebuffer_height;
        }
    }

    pub fn context(&self) -> &RenderContext<B> {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut RenderContext<B> {
        &mut self.context
    }

    pub fn backend(&self) -> &B {
        self.context.backend()
    }

    pub fn graph(&self) -> &RenderGraph {
        &self.graph
    }

    pub fn builder(&self) -> &RenderGraphBuilder {
        &self.builder
    }

    /// Picking queries against the graph as prepared by the last frame.
    pub fn screen_to_world<'a>(&'a self, world: &'a World) -> ScreenToWorld<'a> {
        ScreenToWorld::new(&self.graph, world, &self.settings)
    }

    /// Runs one frame: the main thread phase in fixed order, then
    /// submission, then hands the frame to the backend.
    pub fn render_frame(&mut self, world: &mut World) -> RenderResult<FrameStats> {
        let mut stats = FrameStats::default();
        let settings = self.settings.clone();
        let srgb_colors = settings.color_space == ColorSpace::Gamma;

        self.context.reset_if_needed(&settings)?;
        let allow_srgb = self.context.allow_srgb();

        update_camera_matrices(world);
        update_light_matrices(world);
        update_world_bounds(world);
        stats.skinning = update_skinning(world, self.context.backend_mut(), settings.gpu_skinning);

        stats.graph_rebuilt = self.builder.update(
            world,
            &mut self.graph,
            self.context.backend_mut(),
            &settings,
            allow_srgb,
        )?;
        assign_render_groups(world, &mut self.graph);

        stats.textures_uploaded = upload_textures(world, self.context.backend_mut(), allow_srgb)?;
        let defaults = *self.context.defaults();
        resolve_materials(world, &defaults, srgb_colors);
        stats.meshes = upload_meshes(world, self.context.backend_mut())?;
        update_lighting(world, &self.graph, defaults.no_shadow, srgb_colors)?;
        self.context.pool_mut().flush_caches();
        prepare_passes(&mut self.graph, world, self.context.backend_mut(), &settings)?;
        stats.fallback_clear = self.context.fallback_clear_if_needed(world, &self.graph);

        let submitted = match self.submit(world) {
            Ok(submitted) => submitted,
            Err(err) => {
                self.context.discard_encoders();
                return Err(err);
            }
        };
        stats.draws = submitted.draws;
        stats.culled_chunks = submitted.culled_chunks;
        stats.culled_instances = submitted.culled_instances;
        stats.passes = self.graph.pass_count();
        stats.encoders_used = self.context.finish_encoders();
        stats.frame = self.context.backend_mut().frame()?;
        Ok(stats)
    }

    fn submit(&self, world: &World) -> RenderResult<SubmitStats> {
        let ctx = SubmitContext {
            world,
            graph: &self.graph,
            programs: self.context.programs(),
            quad: self.context.quad(),
            blit_primary_srgb: self.context.blit_primary_srgb(),
            allow_srgb: self.context.allow_srgb(),
        };
        let backend = self.context.backend();
        let pool = self.context.pool();

        let main = pool.main_slot();
        let mut stats = SubmitStats::default();
        pool.with_slot(main, |slot| -> RenderResult<()> {
            let encoder = slot.encoder(backend, main);
            submit_blitters(&ctx, encoder, &mut stats)?;
            submit_simple_meshes(&ctx, encoder, &mut stats)
        })?;
        let lit = submit_lit_meshes(&ctx, pool, backend)?;
        Ok(stats.merge(lit))
    }

    /// Releases every GPU resource.
    pub fn shutdown(mut self, world: &mut World) {
        self.builder
            .destroy(world, &mut self.graph, self.context.backend_mut());
        self.context.shutdown(world, &mut self.graph);
    }
}

impl<B: GraphicsBackend> std::fmt::Debug for Renderer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("context", &self.context)
            .field("nodes", &self.graph.node_count())
            .field("passes", &self.graph.pass_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::RecordingBackend;
    use crate::scene::components::Camera;

    fn renderer() -> Renderer<RecordingBackend> {
        Renderer::new(
            RecordingBackend::new(),
            &ShaderRegistry::placeholder(),
            DisplaySettings::default(),
        )
        .expect("renderer")
    }

    #[test]
    fn empty_world_renders_the_warning_clear() {
        let mut renderer = renderer();
        let mut world = World::new();
        let stats = renderer.render_frame(&mut world).expect("frame");
        assert!(stats.fallback_clear);
        assert!(stats.graph_rebuilt);
        assert_eq!(stats.frame, 1);
    }

    #[test]
    fn camera_frame_blits_once() {
        let mut renderer = renderer();
        let mut world = World::new();
        world.spawn((Camera::default(),));
        let stats = renderer.render_frame(&mut world).expect("frame");
        assert!(!stats.fallback_clear);
        // auto scaled: offscreen main node plus front buffer node
        assert_eq!(renderer.graph().node_count(), 2);
        assert_eq!(stats.draws_for(RenderPassType::FULLSCREEN_QUAD), 1);

        let second = renderer.render_frame(&mut world).expect("frame");
        assert!(!second.graph_rebuilt);
        assert_eq!(second.passes, stats.passes);
    }
}
