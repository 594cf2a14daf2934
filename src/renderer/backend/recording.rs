//! Headless backend that keeps every resource and draw in memory.

use std::sync::{Mutex, PoisonError};

use glam::Mat4;

use crate::asset::AssetCache;
use crate::error::{RenderError, RenderResult};
use crate::renderer::shaders::ShaderId;
use crate::renderer::vertex::VertexLayoutKind;

use super::{
    sort_draws, BackendFamily, Caps, DrawCall, DynamicIndexBufferHandle,
    DynamicVertexBufferHandle, Encoder, FramebufferHandle, GraphicsBackend, IndexBufferHandle,
    ProgramHandle, Rect, TextureDesc, TextureHandle, VertexBufferHandle, ViewClear, ViewId,
    ViewMode, ViewState, ViewTable,
};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedVertexBuffer {
    pub bytes: Vec<u8>,
    pub layout: VertexLayoutKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedDynamicIndexBuffer {
    pub capacity: u32,
    pub indices: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedDynamicVertexBuffer {
    pub capacity: u32,
    pub layout: VertexLayoutKind,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedTexture {
    pub desc: TextureDesc,
    pub pixels: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedProgram {
    pub shader: ShaderId,
    pub blob_len: usize,
}

/// What the last `frame()` executed.
#[derive(Debug, Clone, Default)]
pub struct FrameLog {
    /// Draws in execution order.
    pub draws: Vec<DrawCall>,
    /// Views touched this frame, in id order.
    pub views: Vec<(ViewId, ViewState)>,
    pub encoders: usize,
}

impl FrameLog {
    pub fn draws_for_view(&self, view: ViewId) -> impl Iterator<Item = &DrawCall> {
        self.draws.iter().filter(move |d| d.view == view)
    }

    pub fn view(&self, view: ViewId) -> Option<&ViewState> {
        self.views.iter().find(|(id, _)| *id == view).map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetRecord {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub srgb_backbuffer: bool,
}

pub struct RecordingBackend {
    caps: Caps,
    index_buffers: AssetCache<Vec<u16>>,
    vertex_buffers: AssetCache<RecordedVertexBuffer>,
    dynamic_index_buffers: AssetCache<RecordedDynamicIndexBuffer>,
    dynamic_vertex_buffers: AssetCache<RecordedDynamicVertexBuffer>,
    textures: AssetCache<RecordedTexture>,
    framebuffers: AssetCache<Vec<TextureHandle>>,
    programs: AssetCache<RecordedProgram>,
    views: ViewTable,
    pending: Mutex<Vec<Encoder>>,
    last_frame: FrameLog,
    frames: u64,
    resets: Vec<ResetRecord>,
}

impl RecordingBackend {
    /// GL style conventions: homogeneous depth, bottom-left origin.
    pub fn new() -> Self {
        Self::with_caps(Caps {
            homogeneous_depth: true,
            origin_bottom_left: true,
            family: BackendFamily::Glsl,
        })
    }

    pub fn with_caps(caps: Caps) -> Self {
        Self {
            caps,
            index_buffers: AssetCache::new(),
            vertex_buffers: AssetCache::new(),
            dynamic_index_buffers: AssetCache::new(),
            dynamic_vertex_buffers: AssetCache::new(),
            textures: AssetCache::new(),
            framebuffers: AssetCache::new(),
            programs: AssetCache::new(),
            views: ViewTable::default(),
            pending: Mutex::new(Vec::new()),
            last_frame: FrameLog::default(),
            frames: 0,
            resets: Vec::new(),
        }
    }

    pub fn index_buffer(&self, handle: IndexBufferHandle) -> Option<&[u16]> {
        self.index_buffers.get(handle.cast()).map(Vec::as_slice)
    }

    pub fn vertex_buffer(&self, handle: VertexBufferHandle) -> Option<&RecordedVertexBuffer> {
        self.vertex_buffers.get(handle.cast())
    }

    pub fn dynamic_index_buffer(
        &self,
        handle: DynamicIndexBufferHandle,
    ) -> Option<&RecordedDynamicIndexBuffer> {
        self.dynamic_index_buffers.get(handle.cast())
    }

    pub fn dynamic_vertex_buffer(
        &self,
        handle: DynamicVertexBufferHandle,
    ) -> Option<&RecordedDynamicVertexBuffer> {
        self.dynamic_vertex_buffers.get(handle.cast())
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&RecordedTexture> {
        self.textures.get(handle.cast())
    }

    pub fn framebuffer(&self, handle: FramebufferHandle) -> Option<&[TextureHandle]> {
        self.framebuffers.get(handle.cast()).map(Vec::as_slice)
    }

    pub fn program(&self, handle: ProgramHandle) -> Option<&RecordedProgram> {
        self.programs.get(handle.cast())
    }

    /// Current (persistent) state of a view.
    pub fn view(&self, view: ViewId) -> Option<&ViewState> {
        self.views.get(view)
    }

    pub fn last_frame(&self) -> &FrameLog {
        &self.last_frame
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn resets(&self) -> &[ResetRecord] {
        &self.resets
    }

    /// Live buffer count: static plus dynamic, index plus vertex.
    pub fn live_buffers(&self) -> usize {
        self.index_buffers.len()
            + self.vertex_buffers.len()
            + self.dynamic_index_buffers.len()
            + self.dynamic_vertex_buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn out_of_handles(what: &str) -> RenderError {
    RenderError::Backend(format!("out of {what} handles"))
}

impl GraphicsBackend for RecordingBackend {
    fn caps(&self) -> Caps {
        self.caps
    }

    fn create_index_buffer(&mut self, indices: &[u16]) -> RenderResult<IndexBufferHandle> {
        self.index_buffers
            .insert(indices.to_vec())
            .map(|h| h.cast())
            .ok_or_else(|| out_of_handles("index buffer"))
    }

    fn create_vertex_buffer(
        &mut self,
        bytes: &[u8],
        layout: VertexLayoutKind,
    ) -> RenderResult<VertexBufferHandle> {
        self.vertex_buffers
            .insert(RecordedVertexBuffer {
                bytes: bytes.to_vec(),
                layout,
            })
            .map(|h| h.cast())
            .ok_or_else(|| out_of_handles("vertex buffer"))
    }

    fn destroy_index_buffer(&mut self, handle: IndexBufferHandle) {
        self.index_buffers.remove(handle.cast());
    }

    fn destroy_vertex_buffer(&mut self, handle: VertexBufferHandle) {
        self.vertex_buffers.remove(handle.cast());
    }

    fn create_dynamic_index_buffer(
        &mut self,
        capacity: u32,
    ) -> RenderResult<DynamicIndexBufferHandle> {
        self.dynamic_index_buffers
            .insert(RecordedDynamicIndexBuffer {
                capacity,
                indices: vec![0; capacity as usize],
            })
            .map(|h| h.cast())
            .ok_or_else(|| out_of_handles("dynamic index buffer"))
    }

    fn create_dynamic_vertex_buffer(
        &mut self,
        capacity: u32,
        layout: VertexLayoutKind,
    ) -> RenderResult<DynamicVertexBufferHandle> {
        self.dynamic_vertex_buffers
            .insert(RecordedDynamicVertexBuffer {
                capacity,
                layout,
                bytes: vec![0; capacity as usize * layout.stride()],
            })
            .map(|h| h.cast())
            .ok_or_else(|| out_of_handles("dynamic vertex buffer"))
    }

    fn update_dynamic_index_buffer(
        &mut self,
        handle: DynamicIndexBufferHandle,
        start: u32,
        indices: &[u16],
    ) -> RenderResult<()> {
        let buffer = self
            .dynamic_index_buffers
            .get_mut(handle.cast())
            .ok_or_else(|| RenderError::Backend(format!("unknown dynamic index buffer {handle:?}")))?;
        let start = start as usize;
        let end = start + indices.len();
        if end > buffer.capacity as usize {
            return Err(RenderError::IndexCapacityExceeded {
                requested: end,
                capacity: buffer.capacity as usize,
            });
        }
        buffer.indices[start..end].copy_from_slice(indices);
        Ok(())
    }

    fn update_dynamic_vertex_buffer(
        &mut self,
        handle: DynamicVertexBufferHandle,
        start: u32,
        bytes: &[u8],
    ) -> RenderResult<()> {
        let buffer = self
            .dynamic_vertex_buffers
            .get_mut(handle.cast())
            .ok_or_else(|| {
                RenderError::Backend(format!("unknown dynamic vertex buffer {handle:?}"))
            })?;
        let stride = buffer.layout.stride();
        let start = start as usize * stride;
        let end = start + bytes.len();
        if end > buffer.bytes.len() {
            return Err(RenderError::VertexCapacityExceeded {
                requested: end / stride,
                capacity: buffer.capacity as usize,
            });
        }
        buffer.bytes[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn destroy_dynamic_index_buffer(&mut self, handle: DynamicIndexBufferHandle) {
        self.dynamic_index_buffers.remove(handle.cast());
    }

    fn destroy_dynamic_vertex_buffer(&mut self, handle: DynamicVertexBufferHandle) {
        self.dynamic_vertex_buffers.remove(handle.cast());
    }

    fn create_texture_2d(
        &mut self,
        desc: &TextureDesc,
        pixels: Option<&[u8]>,
    ) -> RenderResult<TextureHandle> {
        self.textures
            .insert(RecordedTexture {
                desc: *desc,
                pixels: pixels.map(<[u8]>::to_vec),
            })
            .map(|h| h.cast())
            .ok_or_else(|| out_of_handles("texture"))
    }

    fn destroy_texture(&mut self, handle: TextureHandle) {
        self.textures.remove(handle.cast());
    }

    fn create_framebuffer(
        &mut self,
        attachments: &[TextureHandle],
    ) -> RenderResult<FramebufferHandle> {
        if let Some(missing) = attachments.iter().find(|h| !self.textures.contains(h.cast())) {
            return Err(RenderError::Backend(format!(
                "framebuffer attachment {missing:?} does not exist"
            )));
        }
        self.framebuffers
            .insert(attachments.to_vec())
            .map(|h| h.cast())
            .ok_or_else(|| out_of_handles("framebuffer"))
    }

    fn destroy_framebuffer(&mut self, handle: FramebufferHandle) {
        self.framebuffers.remove(handle.cast());
    }

    fn create_program(&mut self, shader: ShaderId, blob: &[u8]) -> RenderResult<ProgramHandle> {
        self.programs
            .insert(RecordedProgram {
                shader,
                blob_len: blob.len(),
            })
            .map(|h| h.cast())
            .ok_or_else(|| out_of_handles("program"))
    }

    fn destroy_program(&mut self, handle: ProgramHandle) {
        self.programs.remove(handle.cast());
    }

    fn set_view_transform(&mut self, view: ViewId, view_matrix: &Mat4, projection: &Mat4) {
        let state = self.views.get_mut(view);
        state.view = *view_matrix;
        state.projection = *projection;
    }

    fn set_view_mode(&mut self, view: ViewId, mode: ViewMode) {
        self.views.get_mut(view).mode = mode;
    }

    fn set_view_rect(&mut self, view: ViewId, rect: Rect) {
        self.views.get_mut(view).rect = rect;
    }

    fn set_view_scissor(&mut self, view: ViewId, rect: Rect) {
        self.views.get_mut(view).scissor = rect;
    }

    fn set_view_clear(&mut self, view: ViewId, clear: ViewClear) {
        self.views.get_mut(view).clear = clear;
    }

    fn set_view_framebuffer(&mut self, view: ViewId, framebuffer: FramebufferHandle) {
        self.views.get_mut(view).framebuffer = framebuffer;
    }

    fn touch(&mut self, view: ViewId) {
        self.views.get_mut(view).touched = true;
    }

    fn end_encoder(&self, encoder: Encoder) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(encoder);
    }

    fn frame(&mut self) -> RenderResult<u64> {
        let encoders = std::mem::take(
            &mut *self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let encoder_count = encoders.len();
        let mut draws: Vec<DrawCall> = encoders.into_iter().flat_map(Encoder::into_draws).collect();
        for draw in &draws {
            self.views.get_mut(draw.view).touched = true;
        }
        sort_draws(&self.views, &mut draws);

        let views = self.views.touched().map(|(id, v)| (id, *v)).collect();
        self.last_frame = FrameLog {
            draws,
            views,
            encoders: encoder_count,
        };
        self.views.end_frame();
        self.frames += 1;
        Ok(self.frames)
    }

    fn reset(
        &mut self,
        width: u32,
        height: u32,
        vsync: bool,
        srgb_backbuffer: bool,
    ) -> RenderResult<()> {
        self.resets.push(ResetRecord {
            width,
            height,
            vsync,
            srgb_backbuffer,
        });
        Ok(())
    }
}
