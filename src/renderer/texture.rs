// renderer/texture.rs (authored textures, render targets and defaults)

use bitflags::bitflags;
use glam::Vec4;
use hecs::{CommandBuffer, World};

use crate::error::RenderResult;
use crate::math::{linear_to_srgb, srgb_to_linear};
use crate::renderer::backend::{
    GraphicsBackend, SamplerFlags, TextureDesc, TextureFormat, TextureHandle,
};

bitflags! {
    /// Authoring side texture flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureFlags: u32 {
        const POINT = 1 << 0;
        const LINEAR = 1 << 1;
        const NEAREST = 1 << 2;
        const U_CLAMP = 1 << 3;
        const V_CLAMP = 1 << 4;
        const U_MIRROR = 1 << 5;
        const V_MIRROR = 1 << 6;
        const UV_REPEAT = 1 << 7;
        const MIPMAP_ENABLED = 1 << 8;
        const SRGB = 1 << 9;

        const UV_CLAMP = Self::U_CLAMP.bits() | Self::V_CLAMP.bits();
        const UV_MIRROR = Self::U_MIRROR.bits() | Self::V_MIRROR.bits();
    }
}

/// An RGBA8 texture authored in the scene.
#[derive(Debug, Clone, PartialEq)]
pub struct Texture2D {
    pub width: u16,
    pub height: u16,
    pub flags: TextureFlags,
    /// Tightly packed RGBA8, `width * height * 4` bytes. `None` while loading.
    pub pixels: Option<Vec<u8>>,
}

impl Texture2D {
    pub fn from_rgba8(width: u16, height: u16, flags: TextureFlags, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            flags,
            pixels: Some(pixels),
        }
    }
}

/// GPU texture owned by the texture upload system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureGpu {
    pub handle: TextureHandle,
}

/// Formats a render target texture can be created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderTargetFormat {
    Rgba,
    R,
    Rgba16F,
    R16F,
    R32F,
    Depth,
    DepthStencil,
    ShadowMap,
}

impl RenderTargetFormat {
    pub fn is_depth(self) -> bool {
        matches!(
            self,
            RenderTargetFormat::Depth | RenderTargetFormat::DepthStencil | RenderTargetFormat::ShadowMap
        )
    }
}

fn is_pot(x: u16) -> bool {
    x != 0 && x & (x - 1) == 0
}

/// Non power of two textures must clamp and cannot have mipmaps.
pub fn adjust_flags_for_pot(width: u16, height: u16, mut flags: TextureFlags) -> TextureFlags {
    if is_pot(width) && is_pot(height) {
        return flags;
    }
    if !flags.contains(TextureFlags::UV_CLAMP) {
        log::warn!("Texture {}x{} is not a power of two but is not set to clamp. Forcing clamp.", width, height);
        flags -= TextureFlags::UV_MIRROR | TextureFlags::UV_REPEAT;
        flags |= TextureFlags::UV_CLAMP;
    }
    if flags.contains(TextureFlags::MIPMAP_ENABLED) {
        log::warn!("Texture {}x{} is not a power of two but had mipmaps enabled. Turning off mipmaps.", width, height);
        flags -= TextureFlags::MIPMAP_ENABLED;
    }
    flags
}

/// Backend sampler flags for authored flags. Default sampling is repeat and trilinear.
pub fn sampler_flags(flags: TextureFlags, allow_srgb: bool) -> SamplerFlags {
    let mut out = SamplerFlags::empty();
    if flags.contains(TextureFlags::U_CLAMP) {
        out |= SamplerFlags::U_CLAMP;
    }
    if flags.contains(TextureFlags::V_CLAMP) {
        out |= SamplerFlags::V_CLAMP;
    }
    if flags.contains(TextureFlags::U_MIRROR) {
        out |= SamplerFlags::U_MIRROR;
    }
    if flags.contains(TextureFlags::V_MIRROR) {
        out |= SamplerFlags::V_MIRROR;
    }
    if flags.contains(TextureFlags::POINT) {
        out |= SamplerFlags::POINT;
    }
    if allow_srgb && flags.contains(TextureFlags::SRGB) {
        out |= SamplerFlags::SRGB;
    }
    if flags.contains(TextureFlags::MIPMAP_ENABLED | TextureFlags::LINEAR) {
        out |= SamplerFlags::MIP_POINT;
    }
    out
}

/// Backend description of a render target texture.
pub fn render_target_desc(
    width: u16,
    height: u16,
    format: RenderTargetFormat,
    flags: TextureFlags,
    allow_srgb: bool,
) -> TextureDesc {
    let mut sampler = sampler_flags(flags, allow_srgb) | SamplerFlags::RENDER_TARGET;
    let format = match format {
        RenderTargetFormat::ShadowMap => {
            sampler |= SamplerFlags::COMPARE_LESS;
            TextureFormat::D16
        }
        RenderTargetFormat::Depth => TextureFormat::D16,
        RenderTargetFormat::DepthStencil => TextureFormat::D24S8,
        RenderTargetFormat::Rgba => TextureFormat::Rgba8,
        RenderTargetFormat::R => TextureFormat::R8,
        RenderTargetFormat::Rgba16F => TextureFormat::Rgba16F,
        RenderTargetFormat::R16F => TextureFormat::R16F,
        RenderTargetFormat::R32F => TextureFormat::R32F,
    };
    TextureDesc {
        width,
        height,
        mips: false,
        format,
        flags: sampler,
    }
}

/// Appends every mip level down to 1x1 after the base level. Each level is a
/// 2x2 box filter of the previous one; sRGB data is averaged in linear space.
pub fn build_mip_chain(width: u16, height: u16, base: &[u8], srgb: bool) -> Vec<u8> {
    let mut chain = base.to_vec();
    let (mut w, mut h) = (usize::from(width.max(1)), usize::from(height.max(1)));
    let mut level_start = 0;
    while w > 1 || h > 1 {
        let (nw, nh) = ((w >> 1).max(1), (h >> 1).max(1));
        let mut next = Vec::with_capacity(nw * nh * 4);
        for y in 0..nh {
            for x in 0..nw {
                let mut sum = Vec4::ZERO;
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let sx = (x * 2 + dx).min(w - 1);
                    let sy = (y * 2 + dy).min(h - 1);
                    let at = level_start + (sy * w + sx) * 4;
                    let texel = Vec4::new(
                        f32::from(chain[at]),
                        f32::from(chain[at + 1]),
                        f32::from(chain[at + 2]),
                        f32::from(chain[at + 3]),
                    ) / 255.0;
                    sum += if srgb { srgb_to_linear(texel) } else { texel };
                }
                let mut avg = sum * 0.25;
                if srgb {
                    avg = linear_to_srgb(avg);
                }
                let bytes = (avg.clamp(Vec4::ZERO, Vec4::ONE) * 255.0).round();
                next.extend_from_slice(&[bytes.x as u8, bytes.y as u8, bytes.z as u8, bytes.w as u8]);
            }
        }
        level_start = chain.len();
        chain.extend_from_slice(&next);
        w = nw;
        h = nh;
    }
    chain
}

/// Uploads one authored texture. Flags are adjusted for non power of two sizes first.
pub fn upload_texture_2d(
    backend: &mut dyn GraphicsBackend,
    texture: &Texture2D,
    pixels: &[u8],
    allow_srgb: bool,
) -> RenderResult<TextureHandle> {
    let flags = adjust_flags_for_pot(texture.width, texture.height, texture.flags);
    let mips = flags.contains(TextureFlags::MIPMAP_ENABLED);
    let desc = TextureDesc {
        width: texture.width,
        height: texture.height,
        mips,
        format: TextureFormat::Rgba8,
        flags: sampler_flags(flags, allow_srgb),
    };
    let handle = if mips {
        let chain = build_mip_chain(
            texture.width,
            texture.height,
            pixels,
            flags.contains(TextureFlags::SRGB),
        );
        backend.create_texture_2d(&desc, Some(&chain))?
    } else {
        backend.create_texture_2d(&desc, Some(pixels))?
    };
    log::debug!(
        "Uploaded texture {}x{} to index {}",
        texture.width,
        texture.height,
        handle.raw()
    );
    Ok(handle)
}

/// Creates GPU textures for loaded textures that lack one and releases GPU
/// textures whose source was removed.
pub fn upload_textures(
    world: &mut World,
    backend: &mut dyn GraphicsBackend,
    allow_srgb: bool,
) -> RenderResult<usize> {
    let mut cmd = CommandBuffer::new();
    let mut uploaded = 0;
    for (entity, (texture, gpu)) in world.query::<(&Texture2D, Option<&TextureGpu>)>().iter() {
        if gpu.is_some() {
            continue;
        }
        let Some(pixels) = texture.pixels.as_deref() else {
            continue;
        };
        let handle = upload_texture_2d(backend, texture, pixels, allow_srgb)?;
        cmd.insert_one(entity, TextureGpu { handle });
        uploaded += 1;
    }
    for (entity, (gpu, texture)) in world.query::<(&TextureGpu, Option<&Texture2D>)>().iter() {
        if texture.is_none() {
            backend.destroy_texture(gpu.handle);
            cmd.remove_one::<TextureGpu>(entity);
        }
    }
    cmd.run_on(world);
    Ok(uploaded)
}

/// 1x1 fallback textures bound whenever a material or light has none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultTextures {
    pub white: TextureHandle,
    pub black: TextureHandle,
    pub grey: TextureHandle,
    /// Tangent space normal pointing straight up.
    pub up: TextureHandle,
    /// Depth texture that never shadows.
    pub no_shadow: TextureHandle,
}

impl DefaultTextures {
    pub fn create(backend: &mut dyn GraphicsBackend) -> RenderResult<Self> {
        let mut solid = |rgba: [u8; 4]| {
            let desc = TextureDesc {
                width: 1,
                height: 1,
                mips: false,
                format: TextureFormat::Rgba8,
                flags: SamplerFlags::empty(),
            };
            backend.create_texture_2d(&desc, Some(&rgba))
        };
        let white = solid([0xff; 4])?;
        let black = solid([0; 4])?;
        let grey = solid([0x7f; 4])?;
        let up = solid([0x7f, 0x7f, 0xff, 0xff])?;

        let no_shadow_desc = TextureDesc {
            width: 1,
            height: 1,
            mips: false,
            format: TextureFormat::D16,
            flags: SamplerFlags::COMPARE_LESS,
        };
        let no_shadow = backend.create_texture_2d(&no_shadow_desc, Some(&0xffffu16.to_le_bytes()))?;

        Ok(Self {
            white,
            black,
            grey,
            up,
            no_shadow,
        })
    }

    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        for handle in [self.white, self.black, self.grey, self.up, self.no_shadow] {
            backend.destroy_texture(handle);
        }
    }
}
