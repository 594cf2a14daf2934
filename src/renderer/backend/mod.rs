//! Low-level graphics layer the render graph submits through.
//!
//! The interface is modelled on immediate-mode view/encoder APIs: views are
//! numbered targets with a transform, rect, scissor and clear, and encoders
//! accumulate draw state that `submit` turns into one recorded draw call.

pub mod recording;
pub mod wgpu_backend;

use bitflags::bitflags;
use glam::{Mat4, Vec4};

use crate::asset::Handle;
use crate::error::RenderResult;
use crate::renderer::shaders::ShaderId;
use crate::renderer::vertex::VertexLayoutKind;

pub use recording::RecordingBackend;
pub use wgpu_backend::WgpuBackend;

/// Shader binary families a backend can consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum BackendFamily {
    D3D9,
    D3D11,
    Metal,
    Gles,
    Glsl,
    SpirV,
    Wgsl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caps {
    /// Clip space depth is `[-1, 1]` rather than `[0, 1]`.
    pub homogeneous_depth: bool,
    /// Texture and framebuffer origin is bottom left.
    pub origin_bottom_left: bool,
    pub family: BackendFamily,
}

pub enum IndexBufferResource {}
pub enum VertexBufferResource {}
pub enum DynamicIndexBufferResource {}
pub enum DynamicVertexBufferResource {}
pub enum TextureResource {}
pub enum FramebufferResource {}
pub enum ProgramResource {}

pub type IndexBufferHandle = Handle<IndexBufferResource>;
pub type VertexBufferHandle = Handle<VertexBufferResource>;
pub type DynamicIndexBufferHandle = Handle<DynamicIndexBufferResource>;
pub type DynamicVertexBufferHandle = Handle<DynamicVertexBufferResource>;
pub type TextureHandle = Handle<TextureResource>;
pub type FramebufferHandle = Handle<FramebufferResource>;
pub type ProgramHandle = Handle<ProgramResource>;

pub type ViewId = u16;

/// Draw ordering inside one view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewMode {
    /// Sorted by program to reduce state changes.
    #[default]
    Default,
    /// Submission order.
    Sequential,
    /// Nearest first.
    DepthAscending,
    /// Farthest first.
    DepthDescending,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ClearFlags: u16 {
        const COLOR = 0x0001;
        const DEPTH = 0x0002;
        const STENCIL = 0x0004;
    }
}

bitflags! {
    /// Fixed function state for one draw call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DrawState: u32 {
        const WRITE_RGB = 1 << 0;
        const WRITE_A = 1 << 1;
        const WRITE_Z = 1 << 2;
        const DEPTH_TEST_LESS = 1 << 3;
        const DEPTH_TEST_LEQUAL = 1 << 4;
        const CULL_CW = 1 << 5;
        const CULL_CCW = 1 << 6;
        const BLEND_ALPHA = 1 << 7;
        const PRIMITIVE_LINES = 1 << 8;

        const CULL_MASK = Self::CULL_CW.bits() | Self::CULL_CCW.bits();
        const DEFAULT = Self::WRITE_RGB.bits()
            | Self::WRITE_A.bits()
            | Self::WRITE_Z.bits()
            | Self::DEPTH_TEST_LESS.bits()
            | Self::CULL_CW.bits();
    }
}

impl DrawState {
    /// Applies a pass culling mode: 0 keeps the winding, any other value
    /// swaps clockwise and counter clockwise culling.
    pub fn with_flipped_culling(self, flip: u8) -> Self {
        if flip == 0 {
            return self;
        }
        let cull = self & DrawState::CULL_MASK;
        let mut flipped = self - DrawState::CULL_MASK;
        if cull.contains(DrawState::CULL_CW) {
            flipped |= DrawState::CULL_CCW;
        }
        if cull.contains(DrawState::CULL_CCW) {
            flipped |= DrawState::CULL_CW;
        }
        flipped
    }
}

bitflags! {
    /// Sampler and creation flags of a GPU texture.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SamplerFlags: u32 {
        const U_CLAMP = 1 << 0;
        const V_CLAMP = 1 << 1;
        const U_MIRROR = 1 << 2;
        const V_MIRROR = 1 << 3;
        const POINT = 1 << 4;
        const MIP_POINT = 1 << 5;
        const COMPARE_LESS = 1 << 6;
        const SRGB = 1 << 7;
        const RENDER_TARGET = 1 << 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8,
    R8,
    Rgba16F,
    R16F,
    R32F,
    D16,
    D24S8,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::D16 | TextureFormat::D24S8)
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            TextureFormat::R8 => 1,
            TextureFormat::D16 | TextureFormat::R16F => 2,
            TextureFormat::Rgba8 | TextureFormat::R32F | TextureFormat::D24S8 => 4,
            TextureFormat::Rgba16F => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u16,
    pub height: u16,
    /// Pixel data holds the full mip chain.
    pub mips: bool,
    pub format: TextureFormat,
    pub flags: SamplerFlags,
}

/// Number of levels in a full mip chain down to 1x1.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Viewport or scissor rectangle in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
}

impl Rect {
    pub const fn new(x: u16, y: u16, w: u16, h: u16) -> Self {
        Self { x, y, w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewClear {
    pub flags: ClearFlags,
    /// Packed `0xRRGGBBAA`.
    pub rgba: u32,
    pub depth: f32,
    pub stencil: u8,
}

impl Default for ViewClear {
    fn default() -> Self {
        Self {
            flags: ClearFlags::empty(),
            rgba: 0,
            depth: 1.0,
            stencil: 0,
        }
    }
}

/// Everything a backend knows about one view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewState {
    pub view: Mat4,
    pub projection: Mat4,
    pub mode: ViewMode,
    pub rect: Rect,
    pub scissor: Rect,
    pub clear: ViewClear,
    /// Invalid handle targets the primary surface.
    pub framebuffer: FramebufferHandle,
    pub touched: bool,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            mode: ViewMode::Default,
            rect: Rect::default(),
            scissor: Rect::default(),
            clear: ViewClear::default(),
            framebuffer: FramebufferHandle::INVALID,
            touched: false,
        }
    }
}

/// View state table, grown on demand.
#[derive(Debug, Default, Clone)]
pub struct ViewTable {
    views: Vec<ViewState>,
}

impl ViewTable {
    pub fn get(&self, view: ViewId) -> Option<&ViewState> {
        self.views.get(view as usize)
    }

    pub fn get_mut(&mut self, view: ViewId) -> &mut ViewState {
        let index = view as usize;
        if index >= self.views.len() {
            self.views.resize(index + 1, ViewState::default());
        }
        &mut self.views[index]
    }

    /// Touched views in id order.
    pub fn touched(&self) -> impl Iterator<Item = (ViewId, &ViewState)> {
        self.views
            .iter()
            .enumerate()
            .filter(|(_, v)| v.touched)
            .map(|(i, v)| (i as ViewId, v))
    }

    /// Clears per-frame touch state. Other view state persists across frames.
    pub fn end_frame(&mut self) {
        for view in &mut self.views {
            view.touched = false;
        }
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

/// Uniform slots shared by all programs. Every slot is an array of vec4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Uniform {
    AlbedoOpacity,
    /// metal, smoothness, normal map z scale, smoothness from albedo alpha
    MetalSmoothness,
    Emissive,
    TexMad,
    Billboarded,
    Ambient,
    /// simple lights, mapped lights, cascaded lights, unused
    NumLights,
    SimpleLightPosOrDir,
    SimpleLightColorIvr,
    MappedLightPosOrDir,
    MappedLightColorIvr,
    MappedLightMask,
    MappedLightViewProj,
    MappedSizeInvSize,
    CsmLightDir,
    CsmLightColor,
    CsmViewProj,
    CsmOffsetScale,
    CsmSizeInvSize,
    FogColor,
    FogParams,
    Bias,
    Color,
}

impl Uniform {
    pub const ALL: [Uniform; 23] = [
        Uniform::AlbedoOpacity,
        Uniform::MetalSmoothness,
        Uniform::Emissive,
        Uniform::TexMad,
        Uniform::Billboarded,
        Uniform::Ambient,
        Uniform::NumLights,
        Uniform::SimpleLightPosOrDir,
        Uniform::SimpleLightColorIvr,
        Uniform::MappedLightPosOrDir,
        Uniform::MappedLightColorIvr,
        Uniform::MappedLightMask,
        Uniform::MappedLightViewProj,
        Uniform::MappedSizeInvSize,
        Uniform::CsmLightDir,
        Uniform::CsmLightColor,
        Uniform::CsmViewProj,
        Uniform::CsmOffsetScale,
        Uniform::CsmSizeInvSize,
        Uniform::FogColor,
        Uniform::FogParams,
        Uniform::Bias,
        Uniform::Color,
    ];

    /// Array length in vec4 units.
    pub const fn vec4_count(self) -> usize {
        match self {
            Uniform::SimpleLightPosOrDir | Uniform::SimpleLightColorIvr => 8,
            Uniform::MappedLightPosOrDir
            | Uniform::MappedLightColorIvr
            | Uniform::MappedLightMask => 2,
            Uniform::MappedLightViewProj => 8,
            Uniform::CsmViewProj => 4,
            Uniform::CsmOffsetScale => 4,
            _ => 1,
        }
    }

    /// Offset in vec4 units inside the uniform block.
    pub fn offset(self) -> usize {
        Uniform::ALL
            .iter()
            .take_while(|u| **u != self)
            .map(|u| u.vec4_count())
            .sum()
    }
}

/// Total vec4 count of the uniform block.
pub const UNIFORM_BLOCK_VEC4S: usize = {
    let mut total = 0;
    let mut i = 0;
    while i < Uniform::ALL.len() {
        total += Uniform::ALL[i].vec4_count();
        i += 1;
    }
    total
};

/// Per-draw copy of the uniform block.
#[derive(Debug, Clone, PartialEq)]
pub struct UniformBlock {
    data: Vec<Vec4>,
}

impl Default for UniformBlock {
    fn default() -> Self {
        Self {
            data: vec![Vec4::ZERO; UNIFORM_BLOCK_VEC4S],
        }
    }
}

impl UniformBlock {
    /// Writes up to `uniform.vec4_count()` values; extra values are ignored.
    pub fn set(&mut self, uniform: Uniform, values: &[Vec4]) {
        let offset = uniform.offset();
        let n = values.len().min(uniform.vec4_count());
        self.data[offset..offset + n].copy_from_slice(&values[..n]);
    }

    pub fn get(&self, uniform: Uniform) -> &[Vec4] {
        let offset = uniform.offset();
        &self.data[offset..offset + uniform.vec4_count()]
    }

    pub fn as_vec4s(&self) -> &[Vec4] {
        &self.data
    }
}

/// Texture sampler stages shared by all programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureStage {
    Albedo = 0,
    Metal = 1,
    Normal = 2,
    Emissive = 3,
    ShadowMap0 = 4,
    ShadowMap1 = 5,
    ShadowMapCsm = 6,
}

pub const TEXTURE_STAGE_COUNT: usize = 7;

impl TextureStage {
    pub fn is_shadow(self) -> bool {
        matches!(
            self,
            TextureStage::ShadowMap0 | TextureStage::ShadowMap1 | TextureStage::ShadowMapCsm
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBinding {
    Static(IndexBufferHandle),
    Dynamic(DynamicIndexBufferHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexBinding {
    Static(VertexBufferHandle),
    Dynamic(DynamicVertexBufferHandle),
}

/// One submitted draw call with its full state.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawCall {
    pub view: ViewId,
    pub program: ProgramHandle,
    pub transform: Mat4,
    pub state: DrawState,
    pub index: Option<(IndexBinding, u32, u32)>,
    pub vertex: Option<(VertexBinding, u32, u32)>,
    pub textures: [TextureHandle; TEXTURE_STAGE_COUNT],
    pub uniforms: UniformBlock,
    /// Submission order inside the encoder that produced it.
    pub sequence: u32,
    /// Encoder slot that produced it.
    pub encoder: usize,
}

impl DrawCall {
    pub fn index_count(&self) -> u32 {
        self.index.map(|(_, _, count)| count).unwrap_or(0)
    }
}

/// Records draw state and turns it into draw calls on `submit`.
///
/// After a submit the transform, state, buffers and textures are discarded;
/// uniforms persist until overwritten.
#[derive(Debug)]
pub struct Encoder {
    slot: usize,
    transform: Mat4,
    state: DrawState,
    index: Option<(IndexBinding, u32, u32)>,
    vertex: Option<(VertexBinding, u32, u32)>,
    textures: [TextureHandle; TEXTURE_STAGE_COUNT],
    uniforms: UniformBlock,
    draws: Vec<DrawCall>,
}

impl Encoder {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            transform: Mat4::IDENTITY,
            state: DrawState::DEFAULT,
            index: None,
            vertex: None,
            textures: [TextureHandle::INVALID; TEXTURE_STAGE_COUNT],
            uniforms: UniformBlock::default(),
            draws: Vec::new(),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn set_transform(&mut self, transform: &Mat4) {
        self.transform = *transform;
    }

    pub fn set_uniform(&mut self, uniform: Uniform, values: &[Vec4]) {
        self.uniforms.set(uniform, values);
    }

    pub fn set_texture(&mut self, stage: TextureStage, texture: TextureHandle) {
        self.textures[stage as usize] = texture;
    }

    pub fn set_state(&mut self, state: DrawState) {
        self.state = state;
    }

    pub fn set_index_buffer(&mut self, binding: IndexBinding, start: u32, count: u32) {
        self.index = Some((binding, start, count));
    }

    pub fn set_vertex_buffer(&mut self, binding: VertexBinding, start: u32, count: u32) {
        self.vertex = Some((binding, start, count));
    }

    pub fn submit(&mut self, view: ViewId, program: ProgramHandle) {
        let draw = DrawCall {
            view,
            program,
            transform: self.transform,
            state: self.state,
            index: self.index.take(),
            vertex: self.vertex.take(),
            textures: self.textures,
            uniforms: self.uniforms.clone(),
            sequence: self.draws.len() as u32,
            encoder: self.slot,
        };
        self.draws.push(draw);
        self.transform = Mat4::IDENTITY;
        self.state = DrawState::DEFAULT;
        self.textures = [TextureHandle::INVALID; TEXTURE_STAGE_COUNT];
    }

    pub fn draw_count(&self) -> usize {
        self.draws.len()
    }

    pub fn into_draws(self) -> Vec<DrawCall> {
        self.draws
    }
}

/// Orders draws for execution: by view id, then by each view's mode.
pub fn sort_draws(views: &ViewTable, draws: &mut [DrawCall]) {
    let depth = |d: &DrawCall| -> f32 {
        let view = views.get(d.view).map(|v| v.view).unwrap_or(Mat4::IDENTITY);
        -(view * d.transform.w_axis).z
    };
    draws.sort_by(|a, b| {
        a.view.cmp(&b.view).then_with(|| {
            let mode = views.get(a.view).map(|v| v.mode).unwrap_or_default();
            let submitted = (a.encoder, a.sequence).cmp(&(b.encoder, b.sequence));
            match mode {
                ViewMode::Sequential => submitted,
                ViewMode::Default => a
                    .program
                    .raw()
                    .cmp(&b.program.raw())
                    .then(a.state.bits().cmp(&b.state.bits()))
                    .then(submitted),
                ViewMode::DepthAscending => depth(a).total_cmp(&depth(b)).then(submitted),
                ViewMode::DepthDescending => depth(b).total_cmp(&depth(a)).then(submitted),
            }
        })
    });
}

/// The graphics layer. Resource and view calls happen on the main thread;
/// encoders may be started and ended from worker threads.
pub trait GraphicsBackend: Send + Sync {
    fn caps(&self) -> Caps;

    fn create_index_buffer(&mut self, indices: &[u16]) -> RenderResult<IndexBufferHandle>;
    fn create_vertex_buffer(
        &mut self,
        bytes: &[u8],
        layout: VertexLayoutKind,
    ) -> RenderResult<VertexBufferHandle>;
    fn destroy_index_buffer(&mut self, handle: IndexBufferHandle);
    fn destroy_vertex_buffer(&mut self, handle: VertexBufferHandle);

    /// `capacity` is in indices.
    fn create_dynamic_index_buffer(&mut self, capacity: u32)
        -> RenderResult<DynamicIndexBufferHandle>;
    /// `capacity` is in vertices of `layout`.
    fn create_dynamic_vertex_buffer(
        &mut self,
        capacity: u32,
        layout: VertexLayoutKind,
    ) -> RenderResult<DynamicVertexBufferHandle>;
    fn update_dynamic_index_buffer(
        &mut self,
        handle: DynamicIndexBufferHandle,
        start: u32,
        indices: &[u16],
    ) -> RenderResult<()>;
    fn update_dynamic_vertex_buffer(
        &mut self,
        handle: DynamicVertexBufferHandle,
        start: u32,
        bytes: &[u8],
    ) -> RenderResult<()>;
    fn destroy_dynamic_index_buffer(&mut self, handle: DynamicIndexBufferHandle);
    fn destroy_dynamic_vertex_buffer(&mut self, handle: DynamicVertexBufferHandle);

    fn create_texture_2d(
        &mut self,
        desc: &TextureDesc,
        pixels: Option<&[u8]>,
    ) -> RenderResult<TextureHandle>;
    fn destroy_texture(&mut self, handle: TextureHandle);
    fn create_framebuffer(&mut self, attachments: &[TextureHandle])
        -> RenderResult<FramebufferHandle>;
    fn destroy_framebuffer(&mut self, handle: FramebufferHandle);

    fn create_program(&mut self, shader: ShaderId, blob: &[u8]) -> RenderResult<ProgramHandle>;
    fn destroy_program(&mut self, handle: ProgramHandle);

    fn set_view_transform(&mut self, view: ViewId, view_matrix: &Mat4, projection: &Mat4);
    fn set_view_mode(&mut self, view: ViewId, mode: ViewMode);
    fn set_view_rect(&mut self, view: ViewId, rect: Rect);
    fn set_view_scissor(&mut self, view: ViewId, rect: Rect);
    fn set_view_clear(&mut self, view: ViewId, clear: ViewClear);
    fn set_view_framebuffer(&mut self, view: ViewId, framebuffer: FramebufferHandle);
    fn touch(&mut self, view: ViewId);

    fn begin_encoder(&self, slot: usize) -> Encoder {
        Encoder::new(slot)
    }
    fn end_encoder(&self, encoder: Encoder);

    /// Executes all ended encoders and views touched this frame. Returns the
    /// number of frames completed so far.
    fn frame(&mut self) -> RenderResult<u64>;
    fn reset(&mut self, width: u32, height: u32, vsync: bool, srgb_backbuffer: bool)
        -> RenderResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_offsets_are_contiguous() {
        let mut expected = 0;
        for u in Uniform::ALL {
            assert_eq!(u.offset(), expected, "{u:?}");
            expected += u.vec4_count();
        }
        assert_eq!(expected, UNIFORM_BLOCK_VEC4S);
    }

    #[test]
    fn uniform_block_ignores_overflow() {
        let mut block = UniformBlock::default();
        block.set(Uniform::Bias, &[Vec4::ONE, Vec4::splat(2.0)]);
        assert_eq!(block.get(Uniform::Bias), &[Vec4::ONE]);
        assert_eq!(block.get(Uniform::Color), &[Vec4::ZERO]);
    }

    #[test]
    fn flipping_culling_swaps_winding() {
        let state = DrawState::DEFAULT.with_flipped_culling(3);
        assert!(state.contains(DrawState::CULL_CCW));
        assert!(!state.contains(DrawState::CULL_CW));
        assert_eq!(DrawState::DEFAULT.with_flipped_culling(0), DrawState::DEFAULT);
        let none = (DrawState::DEFAULT - DrawState::CULL_MASK).with_flipped_culling(3);
        assert!(!none.intersects(DrawState::CULL_MASK));
    }

    #[test]
    fn encoder_discards_state_after_submit() {
        let mut enc = Encoder::new(0);
        enc.set_state(DrawState::WRITE_Z);
        enc.set_uniform(Uniform::Color, &[Vec4::ONE]);
        enc.set_index_buffer(IndexBinding::Static(Handle::new(1)), 0, 3);
        enc.submit(2, Handle::new(0));
        enc.submit(2, Handle::new(0));
        let draws = enc.into_draws();
        assert_eq!(draws[0].state, DrawState::WRITE_Z);
        assert_eq!(draws[0].index_count(), 3);
        assert_eq!(draws[1].state, DrawState::DEFAULT);
        assert_eq!(draws[1].index_count(), 0);
        assert_eq!(draws[1].uniforms.get(Uniform::Color), &[Vec4::ONE]);
    }

    #[test]
    fn depth_sorting_respects_view_mode() {
        let mut views = ViewTable::default();
        views.get_mut(0).mode = ViewMode::DepthDescending;
        let mut enc = Encoder::new(0);
        for z in [-1.0, -5.0, -3.0] {
            enc.set_transform(&Mat4::from_translation(glam::Vec3::new(0.0, 0.0, z)));
            enc.submit(0, Handle::new(0));
        }
        let mut draws = enc.into_draws();
        sort_draws(&views, &mut draws);
        let order: Vec<f32> = draws.iter().map(|d| d.transform.w_axis.z).collect();
        assert_eq!(order, vec![-5.0, -3.0, -1.0]);
    }

    #[test]
    fn mip_count_covers_largest_dimension() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(256, 64), 9);
        assert_eq!(mip_level_count(300, 10), 9);
    }
}
