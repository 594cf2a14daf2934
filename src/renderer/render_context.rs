// src/renderer/render_context.rs

use hecs::World;

use crate::error::RenderResult;
use crate::renderer::backend::{
    BackendFamily, ClearFlags, FramebufferHandle, GraphicsBackend, Rect, ViewClear, ViewId,
    ViewMode,
};
use crate::renderer::encoder_pool::EncoderPool;
use crate::renderer::graph::{RenderGraph, WARNING_CLEAR_COLOR};
use crate::renderer::mesh::GpuMesh;
use crate::renderer::mesh_manager;
use crate::renderer::shaders::{ShaderPrograms, ShaderRegistry};
use crate::renderer::texture::DefaultTextures;
use crate::renderer::vertex::SimpleVertex;
use crate::scene::components::Camera;
use crate::settings::{ColorSpace, DisplaySettings};

/// View used by the fallback warning clear.
pub const FALLBACK_VIEW: ViewId = 0;
const FALLBACK_RECT: Rect = Rect::new(0, 0, 10000, 10000);

/// Backend state the last reset was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResetState {
    width: u32,
    height: u32,
    vsync: bool,
    color_space: ColorSpace,
}

impl ResetState {
    fn from_settings(settings: &DisplaySettings) -> Self {
        Self {
            width: settings.framebuffer_width,
            height: settings.framebuffer_height,
            vsync: !settings.disable_vsync,
            color_space: settings.color_space,
        }
    }
}

/// Two triangles covering clip space, uv origin top left.
fn fullscreen_quad() -> ([u16; 6], [SimpleVertex; 4]) {
    let corner = |x: f32, y: f32, u: f32, v: f32| SimpleVertex {
        position: [x, y, 0.0],
        uv0: [u, v],
        color: [1.0; 4],
    };
    (
        [0, 1, 2, 0, 2, 3],
        [
            corner(-1.0, -1.0, 0.0, 1.0),
            corner(1.0, -1.0, 1.0, 1.0),
            corner(1.0, 1.0, 1.0, 0.0),
            corner(-1.0, 1.0, 0.0, 0.0),
        ],
    )
}

/// The graphics backend plus everything created once at startup: shader
/// programs, default textures, the blit quad and the encoder pool.
pub struct RenderContext<B: GraphicsBackend> {
    backend: B,
    programs: ShaderPrograms,
    defaults: DefaultTextures,
    quad: GpuMesh,
    pool: EncoderPool,
    applied: Option<ResetState>,
    allow_srgb: bool,
    blit_primary_srgb: bool,
}

impl<B: GraphicsBackend> RenderContext<B> {
    /// Fails when a mandatory shader has no binary for the backend.
    pub fn init(mut backend: B, shaders: &ShaderRegistry) -> RenderResult<Self> {
        let caps = backend.caps();
        log::info!(
            "Initializing renderer on {:?} (homogeneous depth: {}, origin bottom left: {})",
            caps.family,
            caps.homogeneous_depth,
            caps.origin_bottom_left
        );
        let programs = ShaderPrograms::load(shaders, &mut backend)?;
        let defaults = DefaultTextures::create(&mut backend)?;
        let (indices, vertices) = fullscreen_quad();
        let quad = GpuMesh::create_static(&mut backend, &indices, &vertices)?;
        let pool = EncoderPool::new()?;
        Ok(Self {
            backend,
            programs,
            defaults,
            quad,
            pool,
            applied: None,
            allow_srgb: false,
            blit_primary_srgb: false,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn programs(&self) -> &ShaderPrograms {
        &self.programs
    }

    pub fn defaults(&self) -> &DefaultTextures {
        &self.defaults
    }

    pub fn quad(&self) -> &GpuMesh {
        &self.quad
    }

    pub fn pool(&self) -> &EncoderPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut EncoderPool {
        &mut self.pool
    }

    pub fn allow_srgb(&self) -> bool {
        self.allow_srgb
    }

    pub fn blit_primary_srgb(&self) -> bool {
        self.blit_primary_srgb
    }

    /// Hands every encoder started this frame back to the backend.
    pub fn finish_encoders(&mut self) -> usize {
        self.pool.finish(&self.backend)
    }

    /// Drops the encoders of a frame that failed during submission.
    pub fn discard_encoders(&mut self) -> usize {
        self.pool.discard()
    }

    /// Resets the backend when the framebuffer size, vsync or color space
    /// changed since the last reset. Returns whether a reset happened.
    pub fn reset_if_needed(&mut self, settings: &DisplaySettings) -> RenderResult<bool> {
        let wanted = ResetState::from_settings(settings);
        if self.applied == Some(wanted) {
            return Ok(false);
        }
        match self.applied {
            None => log::info!(
                "Backend reset to {}x{} (vsync: {}, {:?})",
                wanted.width,
                wanted.height,
                wanted.vsync,
                wanted.color_space
            ),
            Some(old) => {
                if (old.width, old.height) != (wanted.width, wanted.height) {
                    log::info!(
                        "Framebuffer resized from {}x{} to {}x{}",
                        old.width,
                        old.height,
                        wanted.width,
                        wanted.height
                    );
                }
                if old.vsync != wanted.vsync {
                    log::info!("Vsync changed to {}", wanted.vsync);
                }
                if old.color_space != wanted.color_space {
                    log::info!("Color space changed to {:?}", wanted.color_space);
                }
            }
        }

        self.allow_srgb = wanted.color_space == ColorSpace::Linear;
        self.blit_primary_srgb =
            self.allow_srgb && self.backend.caps().family == BackendFamily::Gles;
        self.backend
            .reset(wanted.width, wanted.height, wanted.vsync, self.allow_srgb)?;
        self.applied = Some(wanted);
        Ok(true)
    }

    /// Without a primary surface or a camera nothing would be drawn, so view 0
    /// gets a full screen warning clear instead. Returns whether it was used.
    pub fn fallback_clear_if_needed(&mut self, world: &World, graph: &RenderGraph) -> bool {
        let has_primary = graph.primary_nodes().next().is_some();
        let has_camera = world.query::<&Camera>().iter().next().is_some();
        if has_primary && has_camera {
            return false;
        }
        log::warn!(
            "Nothing to render (primary surface: {}, camera: {}), clearing to warning color",
            has_primary,
            has_camera
        );
        let backend = &mut self.backend;
        backend.set_view_mode(FALLBACK_VIEW, ViewMode::Default);
        backend.set_view_rect(FALLBACK_VIEW, FALLBACK_RECT);
        backend.set_view_scissor(FALLBACK_VIEW, Rect::default());
        backend.set_view_framebuffer(FALLBACK_VIEW, FramebufferHandle::INVALID);
        backend.set_view_clear(
            FALLBACK_VIEW,
            ViewClear {
                flags: ClearFlags::COLOR | ClearFlags::DEPTH,
                rgba: WARNING_CLEAR_COLOR,
                depth: 1.0,
                stencil: 0,
            },
        );
        backend.touch(FALLBACK_VIEW);
        true
    }

    /// Releases every GPU resource the context or the world owns.
    pub fn shutdown(mut self, world: &mut World, graph: &mut RenderGraph) {
        mesh_manager::release_all(world, &mut self.backend);
        graph.teardown(&mut self.backend);
        self.quad.destroy(&mut self.backend);
        self.defaults.destroy(&mut self.backend);
        self.programs.destroy(&mut self.backend);
        log::info!("Renderer shut down");
    }
}

impl<B: GraphicsBackend> std::fmt::Debug for RenderContext<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("family", &self.backend.caps().family)
            .field("allow_srgb", &self.allow_srgb)
            .field("blit_primary_srgb", &self.blit_primary_srgb)
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::{Caps, RecordingBackend};

    fn context(backend: RecordingBackend) -> RenderContext<RecordingBackend> {
        RenderContext::init(backend, &ShaderRegistry::placeholder()).expect("init")
    }

    #[test]
    fn missing_mandatory_shader_fails_init() {
        let err = RenderContext::init(RecordingBackend::new(), &ShaderRegistry::new())
            .expect_err("no shaders");
        assert!(matches!(err, crate::error::RenderError::MissingShader { .. }));
    }

    #[test]
    fn reset_only_on_relevant_changes() {
        let mut ctx = context(RecordingBackend::new());
        let mut settings = DisplaySettings::default();
        assert!(ctx.reset_if_needed(&settings).expect("reset"));
        assert!(!ctx.reset_if_needed(&settings).expect("unchanged"));

        settings.width += 10;
        assert!(!ctx.reset_if_needed(&settings).expect("window size is not a reset"));

        settings.framebuffer_width = 640;
        assert!(ctx.reset_if_needed(&settings).expect("resize"));
        settings.disable_vsync = true;
        assert!(ctx.reset_if_needed(&settings).expect("vsync"));
        assert_eq!(ctx.backend().resets().len(), 3);
    }

    #[test]
    fn srgb_blit_only_on_gles_in_linear_space() {
        let gles = RecordingBackend::with_caps(Caps {
            family: BackendFamily::Gles,
            ..RecordingBackend::new().caps()
        });
        let mut ctx = context(gles);
        let mut settings = DisplaySettings::default();
        ctx.reset_if_needed(&settings).expect("reset");
        assert!(!ctx.allow_srgb() && !ctx.blit_primary_srgb());

        settings.color_space = ColorSpace::Linear;
        ctx.reset_if_needed(&settings).expect("reset");
        assert!(ctx.allow_srgb() && ctx.blit_primary_srgb());

        let mut desktop = context(RecordingBackend::new());
        desktop.reset_if_needed(&settings).expect("reset");
        assert!(desktop.allow_srgb() && !desktop.blit_primary_srgb());
    }

    #[test]
    fn empty_scene_gets_warning_clear() {
        let mut ctx = context(RecordingBackend::new());
        let world = World::new();
        let graph = RenderGraph::new();
        assert!(ctx.fallback_clear_if_needed(&world, &graph));
        let view = ctx.backend().view(FALLBACK_VIEW).expect("view 0");
        assert_eq!(view.rect, FALLBACK_RECT);
        assert_eq!(view.clear.rgba, WARNING_CLEAR_COLOR);
        assert_eq!(view.clear.flags, ClearFlags::COLOR | ClearFlags::DEPTH);
        assert_eq!(view.framebuffer, FramebufferHandle::INVALID);
        assert!(view.touched);
    }
}
