// renderer/material.rs (authored materials and their per-frame GPU records)

use glam::{Vec3, Vec4};
use hecs::{Entity, World};

use crate::math::color::linear_to_srgb3;
use crate::renderer::backend::{DrawState, TextureHandle};
use crate::renderer::texture::{DefaultTextures, TextureGpu};

/// Unlit material for simple meshes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimpleMaterial {
    /// Linear color.
    pub constant_albedo: Vec3,
    pub constant_opacity: f32,
    /// Entity with a `Texture2D`.
    pub texture_albedo: Option<Entity>,
    pub transparent: bool,
    pub two_sided: bool,
    pub billboarded: bool,
    /// uv scale in xy, uv offset in zw.
    pub tex_mad: Vec4,
}

impl Default for SimpleMaterial {
    fn default() -> Self {
        Self {
            constant_albedo: Vec3::ONE,
            constant_opacity: 1.0,
            texture_albedo: None,
            transparent: false,
            two_sided: false,
            billboarded: false,
            tex_mad: Vec4::new(1.0, 1.0, 0.0, 0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LitMaterial {
    /// Linear color.
    pub constant_albedo: Vec3,
    pub constant_opacity: f32,
    /// Linear color.
    pub constant_emissive: Vec3,
    pub constant_metal: f32,
    pub constant_smoothness: f32,
    pub normal_map_z_scale: f32,
    pub texture_albedo: Option<Entity>,
    pub texture_metal: Option<Entity>,
    pub texture_normal: Option<Entity>,
    pub texture_emissive: Option<Entity>,
    pub transparent: bool,
    pub two_sided: bool,
    pub billboarded: bool,
    /// Read smoothness from the albedo alpha channel instead of the metal texture.
    pub smoothness_albedo_alpha: bool,
    pub tex_mad: Vec4,
}

impl Default for LitMaterial {
    fn default() -> Self {
        Self {
            constant_albedo: Vec3::ONE,
            constant_opacity: 1.0,
            constant_emissive: Vec3::ZERO,
            constant_metal: 0.0,
            constant_smoothness: 0.5,
            normal_map_z_scale: 1.0,
            texture_albedo: None,
            texture_metal: None,
            texture_normal: None,
            texture_emissive: None,
            transparent: false,
            two_sided: false,
            billboarded: false,
            smoothness_albedo_alpha: false,
            tex_mad: Vec4::new(1.0, 1.0, 0.0, 0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimpleMaterialGpu {
    pub texture_albedo: TextureHandle,
    pub albedo_opacity: Vec4,
    pub tex_mad: Vec4,
    pub billboarded: Vec4,
    pub state: DrawState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LitMaterialGpu {
    pub texture_albedo: TextureHandle,
    pub texture_metal: TextureHandle,
    pub texture_normal: TextureHandle,
    pub texture_emissive: TextureHandle,
    pub albedo_opacity: Vec4,
    /// metal, smoothness, normal map z scale, smoothness from albedo alpha
    pub metal_smoothness: Vec4,
    pub emissive: Vec4,
    pub tex_mad: Vec4,
    pub billboarded: Vec4,
    pub state: DrawState,
}

fn draw_state(transparent: bool, two_sided: bool) -> DrawState {
    let mut state = DrawState::DEFAULT;
    if transparent {
        state |= DrawState::BLEND_ALPHA;
        state -= DrawState::WRITE_Z;
    }
    if two_sided {
        state -= DrawState::CULL_MASK;
    }
    state
}

fn flag(b: bool) -> f32 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn resolve_texture(
    world: &World,
    texture: Option<Entity>,
    fallback: TextureHandle,
    what: &str,
) -> TextureHandle {
    let Some(entity) = texture else {
        return fallback;
    };
    match world.get::<&TextureGpu>(entity) {
        Ok(gpu) => gpu.handle,
        Err(_) => {
            log::debug!("{} texture {:?} is not uploaded, using default", what, entity);
            fallback
        }
    }
}

fn convert(color: Vec3, srgb_colors: bool) -> Vec3 {
    if srgb_colors {
        linear_to_srgb3(color)
    } else {
        color
    }
}

impl SimpleMaterialGpu {
    pub fn resolve(
        world: &World,
        material: &SimpleMaterial,
        defaults: &DefaultTextures,
        srgb_colors: bool,
    ) -> Self {
        Self {
            texture_albedo: resolve_texture(world, material.texture_albedo, defaults.white, "albedo"),
            albedo_opacity: convert(material.constant_albedo, srgb_colors)
                .extend(material.constant_opacity),
            tex_mad: material.tex_mad,
            billboarded: Vec4::new(flag(material.billboarded), 0.0, 0.0, 0.0),
            state: draw_state(material.transparent, material.two_sided),
        }
    }
}

impl LitMaterialGpu {
    pub fn resolve(
        world: &World,
        material: &LitMaterial,
        defaults: &DefaultTextures,
        srgb_colors: bool,
    ) -> Self {
        Self {
            texture_albedo: resolve_texture(world, material.texture_albedo, defaults.white, "albedo"),
            texture_metal: resolve_texture(world, material.texture_metal, defaults.white, "metal"),
            texture_normal: resolve_texture(world, material.texture_normal, defaults.up, "normal"),
            texture_emissive: resolve_texture(
                world,
                material.texture_emissive,
                defaults.black,
                "emissive",
            ),
            albedo_opacity: convert(material.constant_albedo, srgb_colors)
                .extend(material.constant_opacity),
            metal_smoothness: Vec4::new(
                material.constant_metal,
                material.constant_smoothness,
                material.normal_map_z_scale,
                flag(material.smoothness_albedo_alpha),
            ),
            emissive: convert(material.constant_emissive, srgb_colors).extend(0.0),
            tex_mad: material.tex_mad,
            billboarded: Vec4::new(flag(material.billboarded), 0.0, 0.0, 0.0),
            state: draw_state(material.transparent, material.two_sided),
        }
    }
}

/// Rebuilds the GPU record of every material. Runs once per frame after
/// texture upload so freshly uploaded textures are picked up.
pub fn resolve_materials(world: &mut World, defaults: &DefaultTextures, srgb_colors: bool) {
    let simple: Vec<(Entity, SimpleMaterialGpu)> = world
        .query::<&SimpleMaterial>()
        .iter()
        .map(|(e, m)| (e, SimpleMaterialGpu::resolve(world, m, defaults, srgb_colors)))
        .collect();
    let lit: Vec<(Entity, LitMaterialGpu)> = world
        .query::<&LitMaterial>()
        .iter()
        .map(|(e, m)| (e, LitMaterialGpu::resolve(world, m, defaults, srgb_colors)))
        .collect();

    for (entity, gpu) in simple {
        // entity came from the query above, insert cannot fail
        let _ = world.insert_one(entity, gpu);
    }
    for (entity, gpu) in lit {
        let _ = world.insert_one(entity, gpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::RecordingBackend;

    #[test]
    fn transparent_two_sided_state() {
        let state = draw_state(true, true);
        assert!(state.contains(DrawState::BLEND_ALPHA));
        assert!(!state.contains(DrawState::WRITE_Z));
        assert!(!state.intersects(DrawState::CULL_MASK));
        assert_eq!(draw_state(false, false), DrawState::DEFAULT);
    }

    #[test]
    fn missing_textures_fall_back_to_defaults() {
        let mut backend = RecordingBackend::new();
        let defaults = DefaultTextures::create(&mut backend).expect("defaults");
        let mut world = World::new();
        let pending = world.spawn(());
        let uploaded = world.spawn((TextureGpu {
            handle: TextureHandle::new(42),
        },));
        let material = world.spawn((LitMaterial {
            texture_albedo: Some(uploaded),
            texture_normal: Some(pending),
            ..LitMaterial::default()
        },));

        resolve_materials(&mut world, &defaults, false);
        let gpu = *world.get::<&LitMaterialGpu>(material).expect("resolved");
        assert_eq!(gpu.texture_albedo, TextureHandle::new(42));
        assert_eq!(gpu.texture_normal, defaults.up);
        assert_eq!(gpu.texture_metal, defaults.white);
        assert_eq!(gpu.texture_emissive, defaults.black);
    }

    #[test]
    fn gamma_mode_converts_albedo() {
        let world = World::new();
        let defaults = DefaultTextures {
            white: TextureHandle::new(0),
            black: TextureHandle::new(1),
            grey: TextureHandle::new(2),
            up: TextureHandle::new(3),
            no_shadow: TextureHandle::new(4),
        };
        let material = SimpleMaterial {
            constant_albedo: Vec3::splat(0.5),
            constant_opacity: 0.25,
            ..SimpleMaterial::default()
        };
        let linear = SimpleMaterialGpu::resolve(&world, &material, &defaults, false);
        let gamma = SimpleMaterialGpu::resolve(&world, &material, &defaults, true);
        assert_eq!(linear.albedo_opacity, Vec4::new(0.5, 0.5, 0.5, 0.25));
        assert!(gamma.albedo_opacity.x > 0.7);
        assert_eq!(gamma.albedo_opacity.w, 0.25);
    }
}
