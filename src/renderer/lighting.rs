//! Per lighting setup aggregation of every light that feeds it.
//!
//! A lighting setup is rebuilt from scratch each frame: ambient first, then
//! unshadowed directional and point lights, then shadow mapped spot and
//! directional lights, then the cascaded light and fog. Capacities are fixed
//! so the whole setup maps onto one uniform block.

use glam::{Mat4, Vec3, Vec4};
use hecs::{Entity, World};

use crate::error::{LightSlot, RenderError, RenderResult};
use crate::math::color::linear_to_srgb3;
use crate::math::linear_to_srgb;
use crate::renderer::backend::{Encoder, TextureHandle, TextureStage, Uniform, ViewId};
use crate::renderer::graph::RenderGraph;
use crate::scene::components::{
    AmbientLight, CascadeShadowmappedLight, CascadeShadowmappedLightCache, DirectionalLight, Fog,
    Light, LightMatrices, LightToLightingSetup, LocalToWorld, ShadowmappedLight, SpotLight,
};

pub const MAX_POINT_OR_DIR_LIGHTS: usize = 8;
pub const MAX_MAPPED_LIGHTS: usize = 2;
pub const MAX_CSM_LIGHTS: usize = 1;

/// `(1 / x)^2`, or zero for non positive ranges.
pub fn inverse_square(x: f32) -> f32 {
    if x <= 0.0 {
        return 0.0;
    }
    let inv = 1.0 / x;
    inv * inv
}

/// Spot cone parameters for the shader, which evaluates
/// `min(max(z - dot(s, s), w), 1)` with `s = xy * ndc.xy`.
pub fn spot_mask(inner_radius: f32, ratio: f32) -> RenderResult<Vec4> {
    if !(0.0..1.0).contains(&inner_radius) || !(ratio > 0.0 && ratio <= 1.0) {
        return Err(RenderError::InvalidSpotCone {
            inner_radius,
            ratio,
        });
    }
    let iri = 1.0 / (1.0 - inner_radius);
    let siri = iri.sqrt();
    Ok(Vec4::new(siri, 1.0 / ratio * siri, 1.0 + inner_radius * iri, 0.0))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MappedLight {
    pub shadow_map: TextureHandle,
    /// World to shadow map texture space.
    pub projection: Mat4,
    /// Color in xyz, inverse squared range in w (zero for directional lights).
    pub color_ivr: Vec4,
    /// w is 1 for positions, 0 for directions.
    pub world_pos_or_dir: Vec4,
    pub mask: Vec4,
}

impl MappedLight {
    fn unused(no_shadow: TextureHandle) -> Self {
        Self {
            shadow_map: no_shadow,
            projection: Mat4::ZERO,
            color_ivr: Vec4::ZERO,
            world_pos_or_dir: Vec4::ZERO,
            mask: Vec4::ZERO,
        }
    }

    fn set(
        &mut self,
        projection: Mat4,
        color: Vec3,
        world_pos_or_dir: Vec4,
        range: f32,
        mask: Vec4,
        shadow_map: TextureHandle,
    ) {
        self.projection = projection;
        self.color_ivr = color.extend(inverse_square(range) * world_pos_or_dir.w);
        self.world_pos_or_dir = world_pos_or_dir;
        self.mask = mask;
        self.shadow_map = shadow_map;
    }
}

/// Shadow map of a mapped light. Size 1 with the no-shadow texture when the
/// light has no shadow node yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowMapBinding {
    pub texture: TextureHandle,
    pub size: u32,
}

/// Aggregated lights of one lighting setup. Attach to the setup entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lighting {
    num_point_or_dir: usize,
    point_or_dir_pos: [Vec4; MAX_POINT_OR_DIR_LIGHTS],
    point_or_dir_color_ivr: [Vec4; MAX_POINT_OR_DIR_LIGHTS],

    num_mapped: usize,
    mapped: [MappedLight; MAX_MAPPED_LIGHTS],
    /// size and inverse size of mapped light 0 in xy, light 1 in zw
    mapped_sis: Vec4,

    num_csm: usize,
    csm: MappedLight,
    /// size, inverse size, cascade border
    csm_sis: Vec4,
    csm_offset_scale: [Vec4; 4],

    pub ambient: Vec4,
    /// mode, density, end distance, `1 / (end - start)`
    pub fog_params: Vec4,
    pub fog_color: Vec4,
}

impl Default for Lighting {
    fn default() -> Self {
        Self::reset(TextureHandle::INVALID)
    }
}

impl Lighting {
    pub fn reset(no_shadow: TextureHandle) -> Self {
        Self {
            num_point_or_dir: 0,
            point_or_dir_pos: [Vec4::ZERO; MAX_POINT_OR_DIR_LIGHTS],
            point_or_dir_color_ivr: [Vec4::ZERO; MAX_POINT_OR_DIR_LIGHTS],
            num_mapped: 0,
            mapped: [MappedLight::unused(no_shadow); MAX_MAPPED_LIGHTS],
            mapped_sis: Vec4::ZERO,
            num_csm: 0,
            csm: MappedLight::unused(no_shadow),
            csm_sis: Vec4::ZERO,
            csm_offset_scale: [Vec4::ZERO; 4],
            ambient: Vec4::ZERO,
            fog_params: Vec4::ZERO,
            fog_color: Vec4::ZERO,
        }
    }

    pub fn num_point_or_dir(&self) -> usize {
        self.num_point_or_dir
    }

    pub fn num_mapped(&self) -> usize {
        self.num_mapped
    }

    pub fn num_csm(&self) -> usize {
        self.num_csm
    }

    pub fn point_or_dir(&self, index: usize) -> Option<(Vec4, Vec4)> {
        (index < self.num_point_or_dir)
            .then(|| (self.point_or_dir_pos[index], self.point_or_dir_color_ivr[index]))
    }

    pub fn mapped(&self, index: usize) -> Option<&MappedLight> {
        (index < self.num_mapped).then(|| &self.mapped[index])
    }

    pub fn csm(&self) -> Option<&MappedLight> {
        (self.num_csm > 0).then_some(&self.csm)
    }

    pub fn mapped_sis(&self) -> Vec4 {
        self.mapped_sis
    }

    pub fn csm_sis(&self) -> Vec4 {
        self.csm_sis
    }

    pub fn csm_offset_scale(&self) -> &[Vec4; 4] {
        &self.csm_offset_scale
    }

    pub fn add_ambient(&mut self, color: Vec3) {
        self.ambient += color.extend(0.0);
    }

    fn next_simple_slot(&mut self) -> RenderResult<usize> {
        if self.num_point_or_dir >= MAX_POINT_OR_DIR_LIGHTS {
            return Err(RenderError::TooManyLights {
                kind: LightSlot::PointOrDirectional,
                capacity: MAX_POINT_OR_DIR_LIGHTS,
            });
        }
        Ok(self.num_point_or_dir)
    }

    pub fn add_point_light(&mut self, position: Vec3, range: f32, color: Vec3) -> RenderResult<()> {
        let slot = self.next_simple_slot()?;
        if color.length_squared() <= 0.0 {
            return Err(RenderError::InvalidLight("point light without color".into()));
        }
        if range <= 0.0 {
            return Err(RenderError::InvalidLight(format!("point light range {range}")));
        }
        self.point_or_dir_pos[slot] = position.extend(1.0);
        self.point_or_dir_color_ivr[slot] = color.extend(inverse_square(range));
        self.num_point_or_dir += 1;
        Ok(())
    }

    /// `direction` is the direction the light travels in.
    pub fn add_directional_light(&mut self, direction: Vec3, color: Vec3) -> RenderResult<()> {
        let slot = self.next_simple_slot()?;
        if color.length_squared() <= 0.0 {
            return Err(RenderError::InvalidLight("directional light without color".into()));
        }
        if direction.length_squared() <= 0.0 {
            return Err(RenderError::InvalidLight("directional light without direction".into()));
        }
        self.point_or_dir_pos[slot] = (-direction).extend(0.0);
        self.point_or_dir_color_ivr[slot] = color.extend(0.0);
        self.num_point_or_dir += 1;
        Ok(())
    }

    pub fn add_mapped_light(
        &mut self,
        projection: Mat4,
        color: Vec3,
        world_pos_or_dir: Vec4,
        range: f32,
        mask: Vec4,
        shadow_map: ShadowMapBinding,
    ) -> RenderResult<()> {
        let slot = self.num_mapped;
        if slot >= MAX_MAPPED_LIGHTS {
            return Err(RenderError::TooManyLights {
                kind: LightSlot::Mapped,
                capacity: MAX_MAPPED_LIGHTS,
            });
        }
        self.mapped[slot].set(projection, color, world_pos_or_dir, range, mask, shadow_map.texture);
        let size = shadow_map.size as f32;
        if slot == 0 {
            self.mapped_sis.x = size;
            self.mapped_sis.y = 1.0 / size;
        } else {
            self.mapped_sis.z = size;
            self.mapped_sis.w = 1.0 / size;
        }
        self.num_mapped += 1;
        Ok(())
    }

    /// `offset_scale` holds `(offset.x, offset.y, 0, scale)` of each cascade.
    pub fn add_cascade_light(
        &mut self,
        projection: Mat4,
        color: Vec3,
        direction: Vec3,
        range: f32,
        shadow_map: ShadowMapBinding,
        offset_scale: [Vec4; 4],
    ) -> RenderResult<()> {
        if self.num_csm >= MAX_CSM_LIGHTS {
            return Err(RenderError::TooManyLights {
                kind: LightSlot::Cascaded,
                capacity: MAX_CSM_LIGHTS,
            });
        }
        let world_dir = (-direction).normalize_or_zero().extend(0.0);
        self.csm.set(projection, color, world_dir, range, Vec4::ZERO, shadow_map.texture);
        // full atlas size, not cascade size
        let size = shadow_map.size as f32;
        self.csm_sis = Vec4::new(size, 1.0 / size, 1.0 - 3.0 / size, 0.0);
        self.csm_offset_scale = offset_scale;
        self.num_csm += 1;
        Ok(())
    }

    pub fn set_fog(&mut self, fog: &Fog, color: Vec4) -> RenderResult<()> {
        let range = fog.end_distance - fog.start_distance;
        if !(range > 0.0) {
            return Err(RenderError::InvalidFogRange {
                start: fog.start_distance,
                end: fog.end_distance,
            });
        }
        self.fog_color = color;
        self.fog_params = Vec4::new(fog.mode as i32 as f32, fog.density, fog.end_distance, 1.0 / range);
        Ok(())
    }

    /// Transforms light positions into the space of `view`. Skipped when the
    /// cache already holds this setup for `view_id`.
    pub fn transform_to_view_space(
        &self,
        setup: Entity,
        view: &Mat4,
        view_id: ViewId,
        cache: &mut ViewSpaceLightCache,
    ) {
        if cache.tag == Some((view_id, setup)) {
            return;
        }
        for i in 0..self.num_point_or_dir {
            cache.point_or_dir[i] = *view * self.point_or_dir_pos[i];
        }
        cache.mapped[0] = *view * self.mapped[0].world_pos_or_dir;
        cache.mapped[1] = *view * self.mapped[1].world_pos_or_dir;
        cache.csm = *view * self.csm.world_pos_or_dir;
        cache.tag = Some((view_id, setup));
    }

    /// Binds the setup for a lit draw. `cache` must hold this setup in view space.
    pub fn bind(&self, encoder: &mut Encoder, cache: &ViewSpaceLightCache) {
        let counts = Vec4::new(
            self.num_point_or_dir as f32,
            self.num_mapped as f32,
            self.num_csm as f32,
            0.0,
        );
        encoder.set_uniform(Uniform::NumLights, &[counts]);
        encoder.set_uniform(Uniform::Ambient, &[self.ambient]);
        encoder.set_uniform(Uniform::SimpleLightPosOrDir, &cache.point_or_dir);
        encoder.set_uniform(Uniform::SimpleLightColorIvr, &self.point_or_dir_color_ivr);

        encoder.set_uniform(Uniform::MappedLightPosOrDir, &cache.mapped);
        encoder.set_uniform(
            Uniform::MappedLightColorIvr,
            &[self.mapped[0].color_ivr, self.mapped[1].color_ivr],
        );
        encoder.set_uniform(Uniform::MappedLightMask, &[self.mapped[0].mask, self.mapped[1].mask]);
        let m0 = self.mapped[0].projection.to_cols_array_2d();
        let m1 = self.mapped[1].projection.to_cols_array_2d();
        let view_proj: Vec<Vec4> = m0.iter().chain(m1.iter()).map(|c| Vec4::from_array(*c)).collect();
        encoder.set_uniform(Uniform::MappedLightViewProj, &view_proj);
        encoder.set_uniform(Uniform::MappedSizeInvSize, &[self.mapped_sis]);

        encoder.set_uniform(Uniform::CsmLightDir, &[cache.csm]);
        encoder.set_uniform(Uniform::CsmLightColor, &[self.csm.color_ivr]);
        let csm: Vec<Vec4> = self
            .csm
            .projection
            .to_cols_array_2d()
            .iter()
            .map(|c| Vec4::from_array(*c))
            .collect();
        encoder.set_uniform(Uniform::CsmViewProj, &csm);
        encoder.set_uniform(Uniform::CsmOffsetScale, &self.csm_offset_scale);
        encoder.set_uniform(Uniform::CsmSizeInvSize, &[self.csm_sis]);

        encoder.set_uniform(Uniform::FogColor, &[self.fog_color]);
        encoder.set_uniform(Uniform::FogParams, &[self.fog_params]);

        encoder.set_texture(TextureStage::ShadowMap0, self.mapped[0].shadow_map);
        encoder.set_texture(TextureStage::ShadowMap1, self.mapped[1].shadow_map);
        encoder.set_texture(TextureStage::ShadowMapCsm, self.csm.shadow_map);
    }
}

/// View space light positions of the last setup a worker encoded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewSpaceLightCache {
    point_or_dir: [Vec4; MAX_POINT_OR_DIR_LIGHTS],
    mapped: [Vec4; MAX_MAPPED_LIGHTS],
    csm: Vec4,
    tag: Option<(ViewId, Entity)>,
}

impl Default for ViewSpaceLightCache {
    fn default() -> Self {
        Self {
            point_or_dir: [Vec4::ZERO; MAX_POINT_OR_DIR_LIGHTS],
            mapped: [Vec4::ZERO; MAX_MAPPED_LIGHTS],
            csm: Vec4::ZERO,
            tag: None,
        }
    }
}

impl ViewSpaceLightCache {
    pub fn invalidate(&mut self) {
        self.tag = None;
    }

    pub fn is_valid_for(&self, view_id: ViewId, setup: Entity) -> bool {
        self.tag == Some((view_id, setup))
    }

    pub fn point_or_dir(&self, index: usize) -> Vec4 {
        self.point_or_dir[index]
    }

    pub fn mapped(&self, index: usize) -> Vec4 {
        self.mapped[index]
    }

    pub fn csm(&self) -> Vec4 {
        self.csm
    }
}

#[derive(Debug, Clone, Copy)]
enum LightKind {
    Ambient,
    Directional,
    Point,
    MappedSpot(SpotLight),
    MappedDirectional,
    Cascaded,
}

impl LightKind {
    /// Accumulation order: ambient, unshadowed directional, point, then the
    /// shadow mapped lights.
    fn phase(self) -> u8 {
        match self {
            LightKind::Ambient => 0,
            LightKind::Directional => 1,
            LightKind::Point => 2,
            LightKind::MappedSpot(_) => 3,
            LightKind::MappedDirectional | LightKind::Cascaded => 4,
        }
    }
}

struct LightRecord {
    entity: Entity,
    kind: LightKind,
    dest: Vec<Entity>,
    local_to_world: Mat4,
    light: Light,
    matrices: LightMatrices,
    cascades: Option<CascadeShadowmappedLightCache>,
}

fn light_color(light: &Light, srgb_colors: bool) -> Vec3 {
    let c = if srgb_colors {
        linear_to_srgb3(light.color)
    } else {
        light.color
    };
    c * light.intensity
}

fn collect_lights(world: &World) -> Vec<LightRecord> {
    let mut records = Vec::new();
    let mut query = world.query::<(
        &LightToLightingSetup,
        &Light,
        Option<&LocalToWorld>,
        Option<&AmbientLight>,
        Option<&DirectionalLight>,
        Option<&SpotLight>,
        Option<&ShadowmappedLight>,
        Option<&CascadeShadowmappedLight>,
        Option<&LightMatrices>,
        Option<&CascadeShadowmappedLightCache>,
    )>();
    for (entity, (dest, light, ltw, ambient, directional, spot, shadowed, cascaded, matrices, cache)) in
        query.iter()
    {
        let kind = match (ambient, directional, spot, shadowed) {
            (Some(_), ..) => LightKind::Ambient,
            (None, Some(_), _, None) => LightKind::Directional,
            (None, Some(_), _, Some(_)) if cascaded.is_some() => LightKind::Cascaded,
            (None, Some(_), _, Some(_)) => LightKind::MappedDirectional,
            (None, None, Some(spot), Some(_)) => LightKind::MappedSpot(*spot),
            (None, None, _, None) => LightKind::Point,
            (None, None, None, Some(_)) => {
                log::warn!("Shadow mapped point light {:?} is not supported, skipping", entity);
                continue;
            }
        };
        records.push(LightRecord {
            entity,
            kind,
            dest: dest.0.clone(),
            local_to_world: ltw.map(|t| t.0).unwrap_or(Mat4::IDENTITY),
            light: *light,
            matrices: matrices.copied().unwrap_or_default(),
            cascades: cache.copied(),
        });
    }
    records.sort_by_key(|r| r.kind.phase());
    records
}

fn shadow_map_of(graph: &RenderGraph, light: Entity, no_shadow: TextureHandle) -> ShadowMapBinding {
    graph.shadow_map(light).unwrap_or(ShadowMapBinding {
        texture: no_shadow,
        size: 1,
    })
}

fn accumulate(
    lighting: &mut Lighting,
    record: &LightRecord,
    graph: &RenderGraph,
    no_shadow: TextureHandle,
    srgb_colors: bool,
) -> RenderResult<()> {
    let color = light_color(&record.light, srgb_colors);
    let ltw = record.local_to_world;
    // lights shine along local -z
    let forward = -ltw.z_axis.truncate();
    match record.kind {
        LightKind::Ambient => lighting.add_ambient(color),
        LightKind::Directional => {
            lighting.add_directional_light(forward.normalize_or_zero(), color)?;
        }
        LightKind::Point => {
            lighting.add_point_light(ltw.w_axis.truncate(), record.light.clip_z_far, color)?;
        }
        LightKind::MappedSpot(spot) => {
            let mask = spot_mask(spot.inner_radius, spot.ratio)?;
            lighting.add_mapped_light(
                record.matrices.mvp,
                color,
                ltw.w_axis.truncate().extend(1.0),
                record.light.clip_z_far,
                mask,
                shadow_map_of(graph, record.entity, no_shadow),
            )?;
        }
        LightKind::MappedDirectional => {
            lighting.add_mapped_light(
                record.matrices.mvp,
                color,
                (-forward).extend(0.0),
                record.light.clip_z_far,
                Vec4::new(0.0, 0.0, 0.0, 1.0),
                shadow_map_of(graph, record.entity, no_shadow),
            )?;
        }
        LightKind::Cascaded => {
            let cascades = record.cascades.unwrap_or_default().cascades;
            let offset_scale = cascades.map(|c| Vec4::new(c.offset.x, c.offset.y, 0.0, c.scale));
            lighting.add_cascade_light(
                record.matrices.mvp,
                color,
                forward,
                record.light.clip_z_far,
                shadow_map_of(graph, record.entity, no_shadow),
                offset_scale,
            )?;
        }
    }
    Ok(())
}

/// Rebuilds every `Lighting` component from the lights that target it.
pub fn update_lighting(
    world: &mut World,
    graph: &RenderGraph,
    no_shadow: TextureHandle,
    srgb_colors: bool,
) -> RenderResult<()> {
    for (_, lighting) in world.query_mut::<&mut Lighting>() {
        *lighting = Lighting::reset(no_shadow);
    }

    for record in collect_lights(world) {
        for &dest in &record.dest {
            let Ok(mut lighting) = world.get::<&mut Lighting>(dest) else {
                log::warn!("Light {:?} targets {:?} which is not a lighting setup", record.entity, dest);
                continue;
            };
            accumulate(&mut lighting, &record, graph, no_shadow, srgb_colors)?;
        }
    }

    let fogs: Vec<(Vec<Entity>, Fog)> = world
        .query::<(&LightToLightingSetup, &Fog)>()
        .iter()
        .map(|(_, (dest, fog))| (dest.0.clone(), *fog))
        .collect();
    for (dest, fog) in fogs {
        let color = if srgb_colors {
            linear_to_srgb(fog.color)
        } else {
            fog.color
        };
        for setup in dest {
            if let Ok(mut lighting) = world.get::<&mut Lighting>(setup) {
                lighting.set_fog(&fog, color)?;
            }
        }
    }

    for (entity, lighting) in world.query_mut::<&Lighting>() {
        if lighting.num_point_or_dir + lighting.num_mapped == 0 {
            log::warn!("No lights found for lighting setup {:?}", entity);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::components::FogMode;

    const EPSILON: f32 = 1e-5;

    #[test]
    fn spot_mask_unit_cone() {
        let mask = spot_mask(0.0, 1.0).expect("valid");
        assert!((mask - Vec4::new(1.0, 1.0, 1.0, 0.0)).abs().max_element() < EPSILON);
        let mask = spot_mask(0.5, 0.5).expect("valid");
        let siri = 2.0f32.sqrt();
        assert!((mask - Vec4::new(siri, 2.0 * siri, 2.0, 0.0)).abs().max_element() < EPSILON);
        assert!(spot_mask(1.0, 1.0).is_err());
        assert!(spot_mask(0.2, 0.0).is_err());
    }

    #[test]
    fn point_light_stores_inverse_square_range() {
        let mut lighting = Lighting::default();
        lighting
            .add_point_light(Vec3::new(1.0, 2.0, 3.0), 2.0, Vec3::ONE)
            .expect("fits");
        let (pos, color) = lighting.point_or_dir(0).expect("slot 0");
        assert_eq!(pos, Vec4::new(1.0, 2.0, 3.0, 1.0));
        assert!((color.w - 0.25).abs() < EPSILON);
        assert!(lighting.add_point_light(Vec3::ZERO, 0.0, Vec3::ONE).is_err());
    }

    #[test]
    fn directional_light_points_towards_light() {
        let mut lighting = Lighting::default();
        lighting
            .add_directional_light(Vec3::new(0.0, -1.0, 0.0), Vec3::ONE)
            .expect("fits");
        let (dir, color) = lighting.point_or_dir(0).expect("slot 0");
        assert_eq!(dir, Vec4::new(0.0, 1.0, 0.0, 0.0));
        assert_eq!(color.w, 0.0);
    }

    #[test]
    fn mapped_light_sizes_fill_both_halves() {
        let mut lighting = Lighting::default();
        let map = |size| ShadowMapBinding {
            texture: TextureHandle::new(size as u16),
            size,
        };
        for size in [512, 256] {
            lighting
                .add_mapped_light(Mat4::IDENTITY, Vec3::ONE, Vec4::W, 4.0, Vec4::ZERO, map(size))
                .expect("fits");
        }
        assert_eq!(lighting.mapped_sis(), Vec4::new(512.0, 1.0 / 512.0, 256.0, 1.0 / 256.0));
        assert!((lighting.mapped(0).expect("mapped").color_ivr.w - 1.0 / 16.0).abs() < EPSILON);
        let err = lighting
            .add_mapped_light(Mat4::IDENTITY, Vec3::ONE, Vec4::W, 4.0, Vec4::ZERO, map(64))
            .unwrap_err();
        assert_eq!(
            err,
            RenderError::TooManyLights {
                kind: LightSlot::Mapped,
                capacity: 2
            }
        );
    }

    #[test]
    fn cascade_border_uses_full_atlas_size() {
        let mut lighting = Lighting::default();
        let binding = ShadowMapBinding {
            texture: TextureHandle::new(1),
            size: 1024,
        };
        lighting
            .add_cascade_light(Mat4::IDENTITY, Vec3::ONE, Vec3::NEG_Z, 50.0, binding, [Vec4::ONE; 4])
            .expect("fits");
        let sis = lighting.csm_sis();
        assert!((sis.z - (1.0 - 3.0 / 1024.0)).abs() < EPSILON);
        assert_eq!(lighting.csm().expect("csm").world_pos_or_dir, Vec4::new(0.0, 0.0, 1.0, 0.0));
        assert!(lighting
            .add_cascade_light(Mat4::IDENTITY, Vec3::ONE, Vec3::NEG_Z, 50.0, binding, [Vec4::ONE; 4])
            .is_err());
    }

    #[test]
    fn fog_rejects_empty_range() {
        let mut lighting = Lighting::default();
        let fog = Fog {
            mode: FogMode::Linear,
            color: Vec4::ONE,
            density: 0.1,
            start_distance: 10.0,
            end_distance: 10.0,
        };
        let err = lighting.set_fog(&fog, fog.color).unwrap_err();
        assert_eq!(err, RenderError::InvalidFogRange { start: 10.0, end: 10.0 });

        let fog = Fog {
            end_distance: 20.0,
            ..fog
        };
        lighting.set_fog(&fog, fog.color).expect("valid range");
        assert_eq!(lighting.fog_params, Vec4::new(1.0, 0.1, 20.0, 0.1));
    }

    #[test]
    fn view_space_cache_is_keyed_by_view_and_setup() {
        let mut world = World::new();
        let a = world.spawn(());
        let b = world.spawn(());
        let mut lighting = Lighting::default();
        lighting
            .add_point_light(Vec3::new(0.0, 0.0, -5.0), 10.0, Vec3::ONE)
            .expect("fits");
        let mut cache = ViewSpaceLightCache::default();
        let view = Mat4::from_translation(Vec3::new(0.0, 0.0, 5.0));
        lighting.transform_to_view_space(a, &view, 3, &mut cache);
        assert!(cache.is_valid_for(3, a));
        assert_eq!(cache.point_or_dir(0), Vec4::new(0.0, 0.0, 0.0, 1.0));

        // same tag: stale data is kept
        lighting.transform_to_view_space(a, &Mat4::IDENTITY, 3, &mut cache);
        assert_eq!(cache.point_or_dir(0), Vec4::new(0.0, 0.0, 0.0, 1.0));

        lighting.transform_to_view_space(b, &Mat4::IDENTITY, 3, &mut cache);
        assert_eq!(cache.point_or_dir(0), Vec4::new(0.0, 0.0, -5.0, 1.0));
        cache.invalidate();
        assert!(!cache.is_valid_for(3, b));
    }
}
