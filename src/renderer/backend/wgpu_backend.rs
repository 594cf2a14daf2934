//! `wgpu` implementation of the graphics layer.
//!
//! The primary surface is an offscreen color + depth target; presenting it to
//! a window is left to the embedding application. Draws are recorded by the
//! encoders and replayed at `frame()`, one render pass per touched view.

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::{Mutex, PoisonError};

use glam::Mat4;
use wgpu::util::DeviceExt;

use crate::asset::AssetCache;
use crate::error::{RenderError, RenderResult};
use crate::math::color::unpack_color;
use crate::renderer::shaders::ShaderId;
use crate::renderer::vertex::{VertexFormat, VertexLayoutKind};

use super::{
    mip_level_count, sort_draws, BackendFamily, Caps, ClearFlags, DrawCall, DrawState,
    DynamicIndexBufferHandle, DynamicVertexBufferHandle, Encoder, FramebufferHandle,
    GraphicsBackend, IndexBinding, IndexBufferHandle, ProgramHandle, Rect, SamplerFlags,
    TextureDesc, TextureFormat, TextureHandle, TextureStage, VertexBinding, VertexBufferHandle,
    ViewClear, ViewId, ViewMode, ViewState, ViewTable, TEXTURE_STAGE_COUNT,
    UNIFORM_BLOCK_VEC4S,
};

const PRIMARY_DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24PlusStencil8;
const INITIAL_UNIFORM_CAPACITY: u64 = 256;
/// model, view and projection matrices ahead of the shared uniform block.
const DRAW_MATRIX_VEC4S: usize = 12;

struct GpuBuffer {
    buffer: wgpu::Buffer,
    /// Elements: indices or vertices.
    capacity: u32,
    layout: Option<VertexLayoutKind>,
}

struct GpuTexture {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
    sampler: wgpu::Sampler,
    format: wgpu::TextureFormat,
    width: u32,
    height: u32,
}

impl GpuTexture {
    fn is_depth(&self) -> bool {
        self.format.is_depth_stencil_format()
    }

    fn sampleable(&self) -> bool {
        !self.format.has_stencil_aspect()
    }
}

struct GpuProgram {
    shader: ShaderId,
    module: wgpu::ShaderModule,
}

struct PrimaryTarget {
    _color: wgpu::Texture,
    color_view: wgpu::TextureView,
    color_format: wgpu::TextureFormat,
    _depth: wgpu::Texture,
    depth_view: wgpu::TextureView,
    width: u32,
    height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: u16,
    layout: VertexLayoutKind,
    state: DrawState,
    color: Option<wgpu::TextureFormat>,
    depth: Option<wgpu::TextureFormat>,
}

struct TargetViews<'a> {
    color: Option<(&'a wgpu::TextureView, wgpu::TextureFormat)>,
    depth: Option<(&'a wgpu::TextureView, wgpu::TextureFormat)>,
    width: u32,
    height: u32,
}

pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    primary: PrimaryTarget,
    vsync: bool,

    index_buffers: AssetCache<GpuBuffer>,
    vertex_buffers: AssetCache<GpuBuffer>,
    dynamic_index_buffers: AssetCache<GpuBuffer>,
    dynamic_vertex_buffers: AssetCache<GpuBuffer>,
    textures: AssetCache<GpuTexture>,
    framebuffers: AssetCache<Vec<TextureHandle>>,
    programs: AssetCache<GpuProgram>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,

    uniform_layout: wgpu::BindGroupLayout,
    texture_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    uniform_buffer: wgpu::Buffer,
    uniform_bind_group: wgpu::BindGroup,
    uniform_capacity: u64,
    uniform_stride: u64,

    fallback_color: GpuTexture,
    fallback_depth: GpuTexture,
    filtering_sampler: wgpu::Sampler,
    shadow_sampler: wgpu::Sampler,

    views: ViewTable,
    pending: Mutex<Vec<Encoder>>,
    frames: u64,
}

impl WgpuBackend {
    /// Creates a headless device with an offscreen primary target.
    pub fn new(width: u32, height: u32, srgb_backbuffer: bool) -> RenderResult<Self> {
        pollster::block_on(Self::new_async(width, height, srgb_backbuffer))
    }

    pub async fn new_async(width: u32, height: u32, srgb_backbuffer: bool) -> RenderResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|err| RenderError::Backend(format!("no suitable adapter: {err}")))?;

        log::info!("Using adapter: {:?}", adapter.get_info());

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|err| RenderError::Backend(format!("device request failed: {err}")))?;

        let uniform_size = ((DRAW_MATRIX_VEC4S + UNIFORM_BLOCK_VEC4S) * 16) as u64;
        let alignment = device.limits().min_uniform_buffer_offset_alignment as u64;
        let uniform_stride = uniform_size.div_ceil(alignment) * alignment;

        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("DrawUniformLayout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: NonZeroU64::new(uniform_size),
                },
                count: None,
            }],
        });

        let texture_entries: Vec<wgpu::BindGroupLayoutEntry> = (0..TEXTURE_STAGE_COUNT)
            .flat_map(|stage| {
                let shadow = stage >= TextureStage::ShadowMap0 as usize;
                let sample_type = if shadow {
                    wgpu::TextureSampleType::Depth
                } else {
                    wgpu::TextureSampleType::Float { filterable: true }
                };
                let sampler_type = if shadow {
                    wgpu::SamplerBindingType::Comparison
                } else {
                    wgpu::SamplerBindingType::Filtering
                };
                [
                    wgpu::BindGroupLayoutEntry {
                        binding: (stage * 2) as u32,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type,
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: (stage * 2 + 1) as u32,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(sampler_type),
                        count: None,
                    },
                ]
            })
            .collect();
        let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("TextureStageLayout"),
            entries: &texture_entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("PipelineLayout"),
            bind_group_layouts: &[&uniform_layout, &texture_layout],
            push_constant_ranges: &[],
        });

        let uniform_capacity = INITIAL_UNIFORM_CAPACITY;
        let (uniform_buffer, uniform_bind_group) = Self::create_uniform_buffer(
            &device,
            &uniform_layout,
            uniform_capacity * uniform_stride,
            uniform_size,
        );

        let filtering_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("FallbackSampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let shadow_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("ShadowSampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            compare: Some(wgpu::CompareFunction::LessEqual),
            ..Default::default()
        });

        let fallback_color = Self::upload_texture(
            &device,
            &queue,
            &TextureDesc {
                width: 1,
                height: 1,
                mips: false,
                format: TextureFormat::Rgba8,
                flags: SamplerFlags::empty(),
            },
            Some(&[0xff; 4]),
        )?;
        let fallback_depth = Self::upload_texture(
            &device,
            &queue,
            &TextureDesc {
                width: 1,
                height: 1,
                mips: false,
                format: TextureFormat::D16,
                flags: SamplerFlags::U_CLAMP | SamplerFlags::V_CLAMP,
            },
            Some(&[0xff; 2]),
        )?;

        let primary = Self::create_primary(&device, width, height, srgb_backbuffer);

        Ok(Self {
            device,
            queue,
            primary,
            vsync: true,
            index_buffers: AssetCache::new(),
            vertex_buffers: AssetCache::new(),
            dynamic_index_buffers: AssetCache::new(),
            dynamic_vertex_buffers: AssetCache::new(),
            textures: AssetCache::new(),
            framebuffers: AssetCache::new(),
            programs: AssetCache::new(),
            pipelines: HashMap::new(),
            uniform_layout,
            texture_layout,
            pipeline_layout,
            uniform_buffer,
            uniform_bind_group,
            uniform_capacity,
            uniform_stride,
            fallback_color,
            fallback_depth,
            filtering_sampler,
            shadow_sampler,
            views: ViewTable::default(),
            pending: Mutex::new(Vec::new()),
            frames: 0,
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Color texture of the primary surface, for presentation or readback.
    pub fn primary_color_view(&self) -> &wgpu::TextureView {
        &self.primary.color_view
    }

    pub fn vsync(&self) -> bool {
        self.vsync
    }

    fn create_uniform_buffer(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        size: u64,
        binding_size: u64,
    ) -> (wgpu::Buffer, wgpu::BindGroup) {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("DrawUniformBuffer"),
            size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("DrawUniformBindGroup"),
            layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer,
                    offset: 0,
                    size: NonZeroU64::new(binding_size),
                }),
            }],
        });
        (buffer, bind_group)
    }

    fn create_primary(
        device: &wgpu::Device,
        width: u32,
        height: u32,
        srgb: bool,
    ) -> PrimaryTarget {
        let size = wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        };
        let color_format = if srgb {
            wgpu::TextureFormat::Rgba8UnormSrgb
        } else {
            wgpu::TextureFormat::Rgba8Unorm
        };
        let color = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("PrimaryColor"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: color_format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let depth = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("PrimaryDepth"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: PRIMARY_DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        PrimaryTarget {
            color_view: color.create_view(&wgpu::TextureViewDescriptor::default()),
            _color: color,
            color_format,
            depth_view: depth.create_view(&wgpu::TextureViewDescriptor::default()),
            _depth: depth,
            width: size.width,
            height: size.height,
        }
    }

    fn wgpu_format(format: TextureFormat, flags: SamplerFlags) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba8 if flags.contains(SamplerFlags::SRGB) => {
                wgpu::TextureFormat::Rgba8UnormSrgb
            }
            TextureFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::R8 => wgpu::TextureFormat::R8Unorm,
            TextureFormat::Rgba16F => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::R16F => wgpu::TextureFormat::R16Float,
            TextureFormat::R32F => wgpu::TextureFormat::R32Float,
            TextureFormat::D16 => wgpu::TextureFormat::Depth16Unorm,
            TextureFormat::D24S8 => wgpu::TextureFormat::Depth24PlusStencil8,
        }
    }

    fn address_mode(clamp: bool, mirror: bool) -> wgpu::AddressMode {
        if clamp {
            wgpu::AddressMode::ClampToEdge
        } else if mirror {
            wgpu::AddressMode::MirrorRepeat
        } else {
            wgpu::AddressMode::Repeat
        }
    }

    fn upload_texture(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        desc: &TextureDesc,
        pixels: Option<&[u8]>,
    ) -> RenderResult<GpuTexture> {
        let format = Self::wgpu_format(desc.format, desc.flags);
        let width = u32::from(desc.width.max(1));
        let height = u32::from(desc.height.max(1));
        let mip_level_count = if desc.mips {
            mip_level_count(width, height)
        } else {
            1
        };
        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST;
        if desc.flags.contains(SamplerFlags::RENDER_TARGET) {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Texture2D"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });

        if let Some(pixels) = pixels {
            if format.has_stencil_aspect() {
                return Err(RenderError::Backend(
                    "depth-stencil textures cannot be initialised with pixel data".into(),
                ));
            }
            let bpp = desc.format.bytes_per_pixel();
            let mut offset = 0usize;
            for level in 0..mip_level_count {
                let w = (width >> level).max(1);
                let h = (height >> level).max(1);
                let len = w as usize * h as usize * bpp;
                let Some(level_pixels) = pixels.get(offset..offset + len) else {
                    return Err(RenderError::Backend(format!(
                        "texture data too short for mip level {level} ({w}x{h})"
                    )));
                };
                queue.write_texture(
                    wgpu::TexelCopyTextureInfo {
                        texture: &texture,
                        mip_level: level,
                        origin: wgpu::Origin3d::ZERO,
                        aspect: wgpu::TextureAspect::All,
                    },
                    level_pixels,
                    wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(w * bpp as u32),
                        rows_per_image: Some(h),
                    },
                    wgpu::Extent3d {
                        width: w,
                        height: h,
                        depth_or_array_layers: 1,
                    },
                );
                offset += len;
            }
        }

        let flags = desc.flags;
        let filter = if flags.contains(SamplerFlags::POINT) {
            wgpu::FilterMode::Nearest
        } else {
            wgpu::FilterMode::Linear
        };
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Texture2DSampler"),
            address_mode_u: Self::address_mode(
                flags.contains(SamplerFlags::U_CLAMP),
                flags.contains(SamplerFlags::U_MIRROR),
            ),
            address_mode_v: Self::address_mode(
                flags.contains(SamplerFlags::V_CLAMP),
                flags.contains(SamplerFlags::V_MIRROR),
            ),
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: if flags.contains(SamplerFlags::MIP_POINT) {
                wgpu::FilterMode::Nearest
            } else {
                wgpu::FilterMode::Linear
            },
            compare: flags
                .contains(SamplerFlags::COMPARE_LESS)
                .then_some(wgpu::CompareFunction::Less),
            ..Default::default()
        });

        Ok(GpuTexture {
            view: texture.create_view(&wgpu::TextureViewDescriptor::default()),
            _texture: texture,
            sampler,
            format,
            width,
            height,
        })
    }

    fn vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
        match format {
            VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
            VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
            VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
        }
    }

    fn target_views(&self, framebuffer: FramebufferHandle) -> Option<TargetViews<'_>> {
        if !framebuffer.is_valid() {
            return Some(TargetViews {
                color: Some((&self.primary.color_view, self.primary.color_format)),
                depth: Some((&self.primary.depth_view, PRIMARY_DEPTH_FORMAT)),
                width: self.primary.width,
                height: self.primary.height,
            });
        }
        let attachments = self.framebuffers.get(framebuffer.cast())?;
        let mut views = TargetViews {
            color: None,
            depth: None,
            width: 0,
            height: 0,
        };
        for handle in attachments {
            let texture = self.textures.get(handle.cast())?;
            views.width = texture.width;
            views.height = texture.height;
            if texture.is_depth() {
                views.depth = Some((&texture.view, texture.format));
            } else if views.color.is_none() {
                views.color = Some((&texture.view, texture.format));
            }
        }
        Some(views)
    }

    fn vertex_layout_of(&self, binding: VertexBinding) -> Option<VertexLayoutKind> {
        match binding {
            VertexBinding::Static(h) => self.vertex_buffers.get(h.cast())?.layout,
            VertexBinding::Dynamic(h) => self.dynamic_vertex_buffers.get(h.cast())?.layout,
        }
    }

    fn ensure_pipeline(&mut self, key: PipelineKey) -> RenderResult<()> {
        if self.pipelines.contains_key(&key) {
            return Ok(());
        }
        let program = self
            .programs
            .get(ProgramHandle::new(key.program).cast())
            .ok_or_else(|| RenderError::Backend(format!("unknown program {}", key.program)))?;

        let attributes: Vec<wgpu::VertexAttribute> = key
            .layout
            .attributes()
            .iter()
            .enumerate()
            .map(|(location, attr)| wgpu::VertexAttribute {
                format: Self::vertex_format(attr.format),
                offset: attr.offset as u64,
                shader_location: location as u32,
            })
            .collect();

        let state = key.state;
        let mut write_mask = wgpu::ColorWrites::empty();
        if state.contains(DrawState::WRITE_RGB) {
            write_mask |= wgpu::ColorWrites::COLOR;
        }
        if state.contains(DrawState::WRITE_A) {
            write_mask |= wgpu::ColorWrites::ALPHA;
        }
        let blend = if state.contains(DrawState::BLEND_ALPHA) {
            wgpu::BlendState::ALPHA_BLENDING
        } else {
            wgpu::BlendState::REPLACE
        };
        let targets: Vec<Option<wgpu::ColorTargetState>> = key
            .color
            .map(|format| wgpu::ColorTargetState {
                format,
                blend: Some(blend),
                write_mask,
            })
            .into_iter()
            .map(Some)
            .collect();

        // Winding is counter clockwise, so clockwise triangles are back faces.
        let cull_mode = if state.contains(DrawState::CULL_CW) {
            Some(wgpu::Face::Back)
        } else if state.contains(DrawState::CULL_CCW) {
            Some(wgpu::Face::Front)
        } else {
            None
        };
        let depth_compare = if state.contains(DrawState::DEPTH_TEST_LESS) {
            wgpu::CompareFunction::Less
        } else if state.contains(DrawState::DEPTH_TEST_LEQUAL) {
            wgpu::CompareFunction::LessEqual
        } else {
            wgpu::CompareFunction::Always
        };

        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(&format!("{:?}Pipeline", program.shader)),
                layout: Some(&self.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &program.module,
                    entry_point: Some("vs_main"),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: key.layout.stride() as u64,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &attributes,
                    }],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &program.module,
                    entry_point: Some("fs_main"),
                    targets: &targets,
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: if state.contains(DrawState::PRIMITIVE_LINES) {
                        wgpu::PrimitiveTopology::LineList
                    } else {
                        wgpu::PrimitiveTopology::TriangleList
                    },
                    cull_mode,
                    front_face: wgpu::FrontFace::Ccw,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                    strip_index_format: None,
                },
                depth_stencil: key.depth.map(|format| wgpu::DepthStencilState {
                    format,
                    depth_write_enabled: state.contains(DrawState::WRITE_Z),
                    depth_compare,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });
        self.pipelines.insert(key, pipeline);
        Ok(())
    }

    fn texture_bind_group(&self, handles: &[TextureHandle; TEXTURE_STAGE_COUNT]) -> wgpu::BindGroup {
        let mut entries = Vec::with_capacity(TEXTURE_STAGE_COUNT * 2);
        for (stage, handle) in handles.iter().enumerate() {
            let shadow = stage >= TextureStage::ShadowMap0 as usize;
            let bound = self
                .textures
                .get(handle.cast())
                .filter(|t| t.sampleable() && t.is_depth() == shadow);
            let (view, sampler) = match (bound, shadow) {
                (Some(t), true) => (&t.view, &self.shadow_sampler),
                (Some(t), false) => (&t.view, &t.sampler),
                (None, true) => (&self.fallback_depth.view, &self.shadow_sampler),
                (None, false) => (&self.fallback_color.view, &self.filtering_sampler),
            };
            entries.push(wgpu::BindGroupEntry {
                binding: (stage * 2) as u32,
                resource: wgpu::BindingResource::TextureView(view),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: (stage * 2 + 1) as u32,
                resource: wgpu::BindingResource::Sampler(sampler),
            });
        }
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("TextureStageBindGroup"),
            layout: &self.texture_layout,
            entries: &entries,
        })
    }

    fn ensure_uniform_capacity(&mut self, draws: u64) {
        if draws <= self.uniform_capacity {
            return;
        }
        let new_capacity = draws.max(self.uniform_capacity * 2);
        log::info!(
            "Growing draw uniform buffer: {} -> {}",
            self.uniform_capacity,
            new_capacity
        );
        let binding_size = ((DRAW_MATRIX_VEC4S + UNIFORM_BLOCK_VEC4S) * 16) as u64;
        let (buffer, bind_group) = Self::create_uniform_buffer(
            &self.device,
            &self.uniform_layout,
            new_capacity * self.uniform_stride,
            binding_size,
        );
        self.uniform_buffer = buffer;
        self.uniform_bind_group = bind_group;
        self.uniform_capacity = new_capacity;
    }

    fn write_uniforms(&self, draws: &[DrawCall]) {
        let floats_per_draw = (self.uniform_stride / 4) as usize;
        let mut data = vec![0.0f32; floats_per_draw * draws.len()];
        for (draw, chunk) in draws.iter().zip(data.chunks_mut(floats_per_draw)) {
            let view = self.views.get(draw.view).copied().unwrap_or_default();
            let matrices = [draw.transform, view.view, view.projection];
            let mut cursor = 0;
            for m in matrices.iter().map(Mat4::to_cols_array) {
                chunk[cursor..cursor + 16].copy_from_slice(&m);
                cursor += 16;
            }
            for v in draw.uniforms.as_vec4s() {
                chunk[cursor..cursor + 4].copy_from_slice(&v.to_array());
                cursor += 4;
            }
        }
        if !data.is_empty() {
            self.queue
                .write_buffer(&self.uniform_buffer, 0, bytemuck::cast_slice(&data));
        }
    }

    fn clamp_rect(rect: Rect, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        if rect.is_empty() {
            return Some((0, 0, width, height));
        }
        let x = u32::from(rect.x).min(width);
        let y = u32::from(rect.y).min(height);
        let w = u32::from(rect.w).min(width - x);
        let h = u32::from(rect.h).min(height - y);
        (w > 0 && h > 0).then_some((x, y, w, h))
    }

    fn write_padded(&self, buffer: &wgpu::Buffer, offset: u64, bytes: &[u8]) -> RenderResult<()> {
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(RenderError::Backend(format!(
                "buffer update offset {offset} is not 4 byte aligned"
            )));
        }
        if bytes.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
            self.queue.write_buffer(buffer, offset, bytes);
        } else {
            let mut padded = bytes.to_vec();
            padded.resize(bytes.len().next_multiple_of(4), 0);
            self.queue.write_buffer(buffer, offset, &padded);
        }
        Ok(())
    }

    fn create_dynamic_buffer(
        &self,
        label: &str,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT).max(4),
            usage: usage | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }
}

fn out_of_handles(what: &str) -> RenderError {
    RenderError::Backend(format!("out of {what} handles"))
}

impl GraphicsBackend for WgpuBackend {
    fn caps(&self) -> Caps {
        Caps {
            homogeneous_depth: false,
            origin_bottom_left: false,
            family: BackendFamily::Wgsl,
        }
    }

    fn create_index_buffer(&mut self, indices: &[u16]) -> RenderResult<IndexBufferHandle> {
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("IndexBuffer"),
                contents: bytemuck::cast_slice(indices),
                usage: wgpu::BufferUsages::INDEX,
            });
        self.index_buffers
            .insert(GpuBuffer {
                buffer,
                capacity: indices.len() as u32,
                layout: None,
            })
            .map(|h| h.cast())
            .ok_or_else(|| out_of_handles("index buffer"))
    }

    fn create_vertex_buffer(
        &mut self,
        bytes: &[u8],
        layout: VertexLayoutKind,
    ) -> RenderResult<VertexBufferHandle> {
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("VertexBuffer"),
                contents: bytes,
                usage: wgpu::BufferUsages::VERTEX,
            });
        self.vertex_buffers
            .insert(GpuBuffer {
                buffer,
                capacity: (bytes.len() / layout.stride()) as u32,
                layout: Some(layout),
            })
            .map(|h| h.cast())
            .ok_or_else(|| out_of_handles("vertex buffer"))
    }

    fn destroy_index_buffer(&mut self, handle: IndexBufferHandle) {
        if let Some(b) = self.index_buffers.remove(handle.cast()) {
            b.buffer.destroy();
        }
    }

    fn destroy_vertex_buffer(&mut self, handle: VertexBufferHandle) {
        if let Some(b) = self.vertex_buffers.remove(handle.cast()) {
            b.buffer.destroy();
        }
    }

    fn create_dynamic_index_buffer(
        &mut self,
        capacity: u32,
    ) -> RenderResult<DynamicIndexBufferHandle> {
        let buffer = self.create_dynamic_buffer(
            "DynamicIndexBuffer",
            u64::from(capacity) * 2,
            wgpu::BufferUsages::INDEX,
        );
        self.dynamic_index_buffers
            .insert(GpuBuffer {
                buffer,
                capacity,
                layout: None,
            })
            .map(|h| h.cast())
            .ok_or_else(|| out_of_handles("dynamic index buffer"))
    }

    fn create_dynamic_vertex_buffer(
        &mut self,
        capacity: u32,
        layout: VertexLayoutKind,
    ) -> RenderResult<DynamicVertexBufferHandle> {
        let buffer = self.create_dynamic_buffer(
            "DynamicVertexBuffer",
            u64::from(capacity) * layout.stride() as u64,
            wgpu::BufferUsages::VERTEX,
        );
        self.dynamic_vertex_buffers
            .insert(GpuBuffer {
                buffer,
                capacity,
                layout: Some(layout),
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
        let target = self
            .dynamic_index_buffers
            .get(handle.cast())
            .ok_or_else(|| RenderError::Backend(format!("unknown dynamic index buffer {handle:?}")))?;
        let end = start as usize + indices.len();
        if end > target.capacity as usize {
            return Err(RenderError::IndexCapacityExceeded {
                requested: end,
                capacity: target.capacity as usize,
            });
        }
        self.write_padded(&target.buffer, u64::from(start) * 2, bytemuck::cast_slice(indices))
    }

    fn update_dynamic_vertex_buffer(
        &mut self,
        handle: DynamicVertexBufferHandle,
        start: u32,
        bytes: &[u8],
    ) -> RenderResult<()> {
        let target = self
            .dynamic_vertex_buffers
            .get(handle.cast())
            .ok_or_else(|| {
                RenderError::Backend(format!("unknown dynamic vertex buffer {handle:?}"))
            })?;
        let stride = target.layout.map(VertexLayoutKind::stride).unwrap_or(1);
        let end = start as usize + bytes.len() / stride;
        if end > target.capacity as usize {
            return Err(RenderError::VertexCapacityExceeded {
                requested: end,
                capacity: target.capacity as usize,
            });
        }
        self.write_padded(&target.buffer, u64::from(start) * stride as u64, bytes)
    }

    fn destroy_dynamic_index_buffer(&mut self, handle: DynamicIndexBufferHandle) {
        if let Some(b) = self.dynamic_index_buffers.remove(handle.cast()) {
            b.buffer.destroy();
        }
    }

    fn destroy_dynamic_vertex_buffer(&mut self, handle: DynamicVertexBufferHandle) {
        if let Some(b) = self.dynamic_vertex_buffers.remove(handle.cast()) {
            b.buffer.destroy();
        }
    }

    fn create_texture_2d(
        &mut self,
        desc: &TextureDesc,
        pixels: Option<&[u8]>,
    ) -> RenderResult<TextureHandle> {
        let texture = Self::upload_texture(&self.device, &self.queue, desc, pixels)?;
        self.textures
            .insert(texture)
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
        let source = std::str::from_utf8(blob).map_err(|err| {
            RenderError::Backend(format!("shader {shader:?} is not valid WGSL text: {err}"))
        })?;
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&format!("{shader:?}")),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(RenderError::Backend(format!(
                "shader {shader:?} failed to compile: {err}"
            )));
        }
        self.programs
            .insert(GpuProgram { shader, module })
            .map(|h| h.cast())
            .ok_or_else(|| out_of_handles("program"))
    }

    fn destroy_program(&mut self, handle: ProgramHandle) {
        if self.programs.remove(handle.cast()).is_some() {
            self.pipelines.retain(|key, _| key.program != handle.raw());
        }
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
        let mut draws: Vec<DrawCall> = encoders.into_iter().flat_map(Encoder::into_draws).collect();
        for draw in &draws {
            self.views.get_mut(draw.view).touched = true;
        }
        sort_draws(&self.views, &mut draws);

        // Resolve pipelines up front; the render passes only borrow.
        let mut keys: Vec<Option<PipelineKey>> = Vec::with_capacity(draws.len());
        for draw in &draws {
            let framebuffer = self
                .views
                .get(draw.view)
                .map(|v| v.framebuffer)
                .unwrap_or(FramebufferHandle::INVALID);
            let key = match (
                draw.vertex.and_then(|(b, _, _)| self.vertex_layout_of(b)),
                self.target_views(framebuffer),
            ) {
                (Some(layout), Some(target)) => Some(PipelineKey {
                    program: draw.program.raw(),
                    layout,
                    state: draw.state,
                    color: target.color.map(|(_, f)| f),
                    depth: target.depth.map(|(_, f)| f),
                }),
                _ => None,
            };
            if let Some(key) = key {
                self.ensure_pipeline(key)?;
            } else {
                log::warn!("Skipping draw on view {} with missing buffers or target", draw.view);
            }
            keys.push(key);
        }

        self.ensure_uniform_capacity(draws.len() as u64);
        self.write_uniforms(&draws);

        let mut texture_groups: HashMap<[u16; TEXTURE_STAGE_COUNT], wgpu::BindGroup> =
            HashMap::new();
        for draw in &draws {
            let key = draw.textures.map(|h| h.raw());
            if !texture_groups.contains_key(&key) {
                texture_groups.insert(key, self.texture_bind_group(&draw.textures));
            }
        }

        let views: Vec<(ViewId, ViewState)> = self.views.touched().map(|(id, v)| (id, *v)).collect();
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("FrameEncoder"),
            });

        for (view_id, view) in &views {
            let Some(target) = self.target_views(view.framebuffer) else {
                log::warn!("View {view_id} targets a missing framebuffer");
                continue;
            };
            let clear = view.clear;
            let color_load = if clear.flags.contains(ClearFlags::COLOR) {
                let c = unpack_color(clear.rgba);
                wgpu::LoadOp::Clear(wgpu::Color {
                    r: f64::from(c.x),
                    g: f64::from(c.y),
                    b: f64::from(c.z),
                    a: f64::from(c.w),
                })
            } else {
                wgpu::LoadOp::Load
            };
            let color_attachment = target.color.map(|(view, _)| wgpu::RenderPassColorAttachment {
                view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: color_load,
                    store: wgpu::StoreOp::Store,
                },
            });
            let depth_attachment =
                target
                    .depth
                    .map(|(view, format)| wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: if clear.flags.contains(ClearFlags::DEPTH) {
                                wgpu::LoadOp::Clear(clear.depth)
                            } else {
                                wgpu::LoadOp::Load
                            },
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: format.has_stencil_aspect().then_some(wgpu::Operations {
                            load: if clear.flags.contains(ClearFlags::STENCIL) {
                                wgpu::LoadOp::Clear(u32::from(clear.stencil))
                            } else {
                                wgpu::LoadOp::Load
                            },
                            store: wgpu::StoreOp::Store,
                        }),
                    });
            let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> =
                color_attachment.into_iter().map(Some).collect();

            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("ViewPass"),
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            let Some((x, y, w, h)) = Self::clamp_rect(view.rect, target.width, target.height)
            else {
                continue;
            };
            rpass.set_viewport(x as f32, y as f32, w as f32, h as f32, 0.0, 1.0);
            match Self::clamp_rect(view.scissor, target.width, target.height) {
                Some((sx, sy, sw, sh)) => rpass.set_scissor_rect(sx, sy, sw, sh),
                None => continue,
            }

            for (i, (draw, key)) in draws.iter().zip(&keys).enumerate() {
                if draw.view != *view_id {
                    continue;
                }
                let Some(pipeline) = key.as_ref().and_then(|k| self.pipelines.get(k)) else {
                    continue;
                };
                let Some((index_binding, index_start, index_count)) = draw.index else {
                    continue;
                };
                let index_buffer = match index_binding {
                    IndexBinding::Static(h) => self.index_buffers.get(h.cast()),
                    IndexBinding::Dynamic(h) => self.dynamic_index_buffers.get(h.cast()),
                };
                let vertex = draw.vertex.and_then(|(binding, start, _)| {
                    let buffer = match binding {
                        VertexBinding::Static(h) => self.vertex_buffers.get(h.cast()),
                        VertexBinding::Dynamic(h) => self.dynamic_vertex_buffers.get(h.cast()),
                    }?;
                    let stride = buffer.layout.map(VertexLayoutKind::stride).unwrap_or(0) as u64;
                    Some((buffer, u64::from(start) * stride))
                });
                let (Some(index_buffer), Some((vertex_buffer, vertex_offset))) =
                    (index_buffer, vertex)
                else {
                    continue;
                };
                let Some(textures) = texture_groups.get(&draw.textures.map(|h| h.raw())) else {
                    continue;
                };

                rpass.set_pipeline(pipeline);
                rpass.set_bind_group(
                    0,
                    &self.uniform_bind_group,
                    &[(i as u64 * self.uniform_stride) as u32],
                );
                rpass.set_bind_group(1, textures, &[]);
                rpass.set_vertex_buffer(0, vertex_buffer.buffer.slice(vertex_offset..));
                rpass.set_index_buffer(index_buffer.buffer.slice(..), wgpu::IndexFormat::Uint16);
                rpass.draw_indexed(index_start..index_start + index_count, 0, 0..1);
            }
        }

        self.queue.submit(Some(encoder.finish()));
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
        self.primary = Self::create_primary(&self.device, width, height, srgb_backbuffer);
        self.vsync = vsync;
        let color_format = self.primary.color_format;
        let depth_format = PRIMARY_DEPTH_FORMAT;
        // Pipelines for the old primary format are never hit again.
        self.pipelines.retain(|key, _| {
            key.depth != Some(depth_format) || key.color == Some(color_format)
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_rect_covers_the_whole_target() {
        assert_eq!(
            WgpuBackend::clamp_rect(Rect::default(), 640, 480),
            Some((0, 0, 640, 480))
        );
    }

    #[test]
    fn rect_is_clamped_to_target() {
        assert_eq!(
            WgpuBackend::clamp_rect(Rect::new(600, 0, 100, 100), 640, 480),
            Some((600, 0, 40, 100))
        );
        assert_eq!(
            WgpuBackend::clamp_rect(Rect::new(700, 0, 100, 100), 640, 480),
            None
        );
    }

    #[test]
    fn srgb_flag_selects_srgb_format() {
        assert_eq!(
            WgpuBackend::wgpu_format(TextureFormat::Rgba8, SamplerFlags::SRGB),
            wgpu::TextureFormat::Rgba8UnormSrgb
        );
        assert_eq!(
            WgpuBackend::wgpu_format(TextureFormat::D16, SamplerFlags::SRGB),
            wgpu::TextureFormat::Depth16Unorm
        );
    }
}
