//! Culling and draw encoding.
//!
//! Blitters and simple meshes are encoded on the main thread. Lit meshes are
//! batched into chunks that share a render group and a lighting setup, and
//! the chunks are encoded in parallel, one encoder per worker.

use std::collections::HashMap;

use glam::{Mat4, Vec4};
use hecs::{Entity, World};
use rayon::prelude::*;

use crate::error::{RenderError, RenderResult};
use crate::math::{Aabb, BoundingSphere, CullingResult};
use crate::renderer::backend::{
    DrawState, Encoder, GraphicsBackend, ProgramHandle, TextureStage, Uniform, ViewId,
};
use crate::renderer::encoder_pool::EncoderPool;
use crate::renderer::graph::{GroupId, RenderGraph, RenderPass, RenderPassType};
use crate::renderer::lighting::{Lighting, ViewSpaceLightCache};
use crate::renderer::material::{LitMaterialGpu, SimpleMaterialGpu};
use crate::renderer::mesh::GpuMesh;
use crate::renderer::shaders::{ShaderId, ShaderPrograms};
use crate::scene::components::{
    BlitRenderer, LightingRef, LitMeshRenderer, LocalToWorld, MeshRenderer, RenderToPasses,
    SimpleMeshRenderer, SkinnedMeshRenderer, WorldBoundingSphere, WorldBounds,
};

/// Lit renderers per chunk.
pub const CHUNK_CAPACITY: usize = 128;

const DEPTH_ONLY_STATE: DrawState = DrawState::WRITE_Z
    .union(DrawState::DEPTH_TEST_LESS)
    .union(DrawState::CULL_CW);
const SHADOW_MAP_STATE: DrawState = DrawState::DEFAULT;
const BLIT_STATE: DrawState = DrawState::WRITE_RGB.union(DrawState::WRITE_A);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitStats {
    pub draws: HashMap<RenderPassType, usize>,
    /// Chunks rejected by their bounding sphere, counted per pass.
    pub culled_chunks: usize,
    /// Renderers rejected by their own bounds, counted per pass.
    pub culled_instances: usize,
}

impl SubmitStats {
    fn count_draw(&mut self, pass_type: RenderPassType) {
        *self.draws.entry(pass_type).or_insert(0) += 1;
    }

    pub fn merge(mut self, other: SubmitStats) -> SubmitStats {
        for (pass_type, n) in other.draws {
            *self.draws.entry(pass_type).or_insert(0) += n;
        }
        self.culled_chunks += other.culled_chunks;
        self.culled_instances += other.culled_instances;
        self
    }

    pub fn total_draws(&self) -> usize {
        self.draws.values().sum()
    }

    pub fn draws_for(&self, pass_type: RenderPassType) -> usize {
        self.draws.get(&pass_type).copied().unwrap_or(0)
    }
}

/// Read only frame state shared by every encode path.
#[derive(Clone, Copy)]
pub struct SubmitContext<'a> {
    pub world: &'a World,
    pub graph: &'a RenderGraph,
    pub programs: &'a ShaderPrograms,
    /// Fullscreen quad used by blitters.
    pub quad: &'a GpuMesh,
    /// Blits into the primary surface convert to sRGB in the shader.
    pub blit_primary_srgb: bool,
    pub allow_srgb: bool,
}

/// Draw range of one renderer.
#[derive(Debug, Clone, Copy)]
struct DrawRange {
    start: u32,
    count: Option<u32>,
}

impl DrawRange {
    fn of(renderer: &MeshRenderer) -> Self {
        Self {
            start: renderer.start_index,
            count: Some(renderer.index_count),
        }
    }

    fn is_empty(&self) -> bool {
        self.count == Some(0)
    }
}

/// `None` for a mesh that is uploaded but currently holds no buffers, such as
/// a dynamic mesh emptied by its producer.
fn gpu_mesh(world: &World, mesh: Entity) -> RenderResult<Option<GpuMesh>> {
    match world.get::<&GpuMesh>(mesh) {
        Ok(gpu) if gpu.is_valid() => Ok(Some(*gpu)),
        Ok(_) => Ok(None),
        Err(_) => Err(RenderError::MeshNotUploaded(mesh)),
    }
}

fn encode_depth_only(
    encoder: &mut Encoder,
    view_id: ViewId,
    program: ProgramHandle,
    mesh: &GpuMesh,
    transform: &Mat4,
    range: DrawRange,
    state: DrawState,
) -> RenderResult<()> {
    mesh.set_for_submit(encoder, range.start, range.count)?;
    encoder.set_transform(transform);
    encoder.set_state(state);
    encoder.submit(view_id, program);
    Ok(())
}

fn encode_z_only(
    ctx: &SubmitContext,
    encoder: &mut Encoder,
    pass: &RenderPass,
    mesh: &GpuMesh,
    transform: &Mat4,
    range: DrawRange,
    flip: u8,
) -> RenderResult<()> {
    encode_depth_only(
        encoder,
        pass.view_id,
        ctx.programs.get(ShaderId::ZOnly),
        mesh,
        transform,
        range,
        DEPTH_ONLY_STATE.with_flipped_culling(flip),
    )
}

fn encode_shadow_map(
    ctx: &SubmitContext,
    encoder: &mut Encoder,
    pass: &RenderPass,
    mesh: &GpuMesh,
    transform: &Mat4,
    range: DrawRange,
    bias: Vec4,
) -> RenderResult<()> {
    encoder.set_uniform(Uniform::Bias, &[bias]);
    encode_depth_only(
        encoder,
        pass.view_id,
        ctx.programs.get(ShaderId::ShadowMap),
        mesh,
        transform,
        range,
        SHADOW_MAP_STATE.with_flipped_culling(pass.flip_culling_inverse()),
    )
}

fn encode_simple(
    ctx: &SubmitContext,
    encoder: &mut Encoder,
    pass: &RenderPass,
    mesh: &GpuMesh,
    transform: &Mat4,
    material: &SimpleMaterialGpu,
    range: DrawRange,
) -> RenderResult<()> {
    mesh.set_for_submit(encoder, range.start, range.count)?;
    encoder.set_transform(transform);
    encoder.set_uniform(Uniform::AlbedoOpacity, &[material.albedo_opacity]);
    encoder.set_uniform(Uniform::TexMad, &[material.tex_mad]);
    encoder.set_uniform(Uniform::Billboarded, &[material.billboarded]);
    encoder.set_texture(TextureStage::Albedo, material.texture_albedo);
    encoder.set_state(material.state.with_flipped_culling(pass.flip_culling()));
    encoder.submit(pass.view_id, ctx.programs.get(ShaderId::Simple));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn encode_lit(
    ctx: &SubmitContext,
    encoder: &mut Encoder,
    cache: &mut ViewSpaceLightCache,
    pass: &RenderPass,
    mesh: &GpuMesh,
    transform: &Mat4,
    material: &LitMaterialGpu,
    setup: Entity,
    lighting: &Lighting,
    range: DrawRange,
) -> RenderResult<()> {
    mesh.set_for_submit(encoder, range.start, range.count)?;
    encoder.set_transform(transform);
    encoder.set_uniform(Uniform::AlbedoOpacity, &[material.albedo_opacity]);
    encoder.set_uniform(Uniform::MetalSmoothness, &[material.metal_smoothness]);
    encoder.set_uniform(Uniform::Emissive, &[material.emissive]);
    encoder.set_uniform(Uniform::TexMad, &[material.tex_mad]);
    encoder.set_uniform(Uniform::Billboarded, &[material.billboarded]);
    encoder.set_texture(TextureStage::Albedo, material.texture_albedo);
    encoder.set_texture(TextureStage::Metal, material.texture_metal);
    encoder.set_texture(TextureStage::Normal, material.texture_normal);
    encoder.set_texture(TextureStage::Emissive, material.texture_emissive);
    lighting.transform_to_view_space(setup, &pass.view, pass.view_id, cache);
    lighting.bind(encoder, cache);
    encoder.set_state(material.state.with_flipped_culling(pass.flip_culling()));
    encoder.submit(pass.view_id, ctx.programs.get(ShaderId::SimpleLit));
    Ok(())
}

/// Copies the texture of every blitter into the passes of its group.
pub fn submit_blitters(
    ctx: &SubmitContext,
    encoder: &mut Encoder,
    stats: &mut SubmitStats,
) -> RenderResult<()> {
    for (_, (blit, to_passes)) in ctx
        .world
        .query::<(&BlitRenderer, Option<&RenderToPasses>)>()
        .iter()
    {
        let Some(to_passes) = to_passes else {
            continue;
        };
        if !blit.texture.is_valid() {
            continue;
        }
        for &pass_id in ctx.graph.groups().passes(to_passes.0) {
            let pass = ctx.graph.pass(pass_id);
            let to_primary = ctx.graph.node(pass.node).primary_surface;
            // linear output has to be encoded when the primary surface is not sRGB
            let convert = ctx.blit_primary_srgb && to_primary && ctx.allow_srgb;
            let (color, bias) = if convert {
                (Vec4::ONE, Vec4::new(1.0, 0.0, 0.0, 0.0))
            } else {
                (blit.color, Vec4::ZERO)
            };
            ctx.quad.set_for_submit(encoder, 0, None)?;
            encoder.set_transform(&Mat4::IDENTITY);
            encoder.set_uniform(Uniform::Color, &[color]);
            encoder.set_uniform(Uniform::Bias, &[bias]);
            encoder.set_texture(TextureStage::Albedo, blit.texture);
            encoder.set_state(BLIT_STATE);
            encoder.submit(pass.view_id, ctx.programs.get(ShaderId::BlitSrgb));
            stats.count_draw(pass.pass_type);
        }
    }
    Ok(())
}

/// Outside by sphere, then by box. A zero radius skips the sphere test.
fn is_outside(pass: &RenderPass, sphere: Option<&BoundingSphere>, bounds: Option<&Aabb>) -> bool {
    if let Some(sphere) = sphere {
        if sphere.radius > 0.0 && pass.frustum.cull_sphere(sphere) == CullingResult::Outside {
            return true;
        }
    }
    bounds.map_or(false, |b| pass.frustum.is_culled(b))
}

/// Encodes every unlit mesh renderer on the calling thread.
pub fn submit_simple_meshes(
    ctx: &SubmitContext,
    encoder: &mut Encoder,
    stats: &mut SubmitStats,
) -> RenderResult<()> {
    for (_, (renderer, to_passes, ltw, bounds, sphere)) in ctx
        .world
        .query::<(
            &MeshRenderer,
            &RenderToPasses,
            Option<&LocalToWorld>,
            Option<&WorldBounds>,
            Option<&WorldBoundingSphere>,
        )>()
        .with::<&SimpleMeshRenderer>()
        .iter()
    {
        let range = DrawRange::of(renderer);
        if range.is_empty() {
            continue;
        }
        let transform = ltw.map_or(Mat4::IDENTITY, |t| t.0);
        for &pass_id in ctx.graph.groups().passes(to_passes.0) {
            let pass = ctx.graph.pass(pass_id);
            if is_outside(pass, sphere.map(|s| &s.0), bounds.map(|b| &b.0)) {
                stats.culled_instances += 1;
                continue;
            }
            let Some(mesh) = gpu_mesh(ctx.world, renderer.mesh)? else {
                continue;
            };
            match pass.pass_type {
                RenderPassType::Z_ONLY => {
                    encode_z_only(ctx, encoder, pass, &mesh, &transform, range, pass.flip_culling())?
                }
                RenderPassType::SHADOW_MAP => encode_z_only(
                    ctx,
                    encoder,
                    pass,
                    &mesh,
                    &transform,
                    range,
                    pass.flip_culling_inverse(),
                )?,
                RenderPassType::OPAQUE | RenderPassType::TRANSPARENT => {
                    let Ok(material) = ctx.world.get::<&SimpleMaterialGpu>(renderer.material) else {
                        log::debug!("Simple material {:?} is not resolved", renderer.material);
                        continue;
                    };
                    encode_simple(ctx, encoder, pass, &mesh, &transform, &material, range)?;
                }
                // render groups never route simple meshes anywhere else
                _ => continue,
            }
            stats.count_draw(pass.pass_type);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct LitInstance {
    mesh: Entity,
    material: Entity,
    transform: Mat4,
    bounds: Option<Aabb>,
    sphere: Option<BoundingSphere>,
    range: DrawRange,
}

/// Renderers sharing a render group and a lighting setup.
#[derive(Debug, Clone)]
pub struct LitChunk {
    group: GroupId,
    lighting: Option<Entity>,
    sphere: BoundingSphere,
    instances: Vec<LitInstance>,
}

impl LitChunk {
    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn lighting(&self) -> Option<Entity> {
        self.lighting
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Batches lit renderers by (group, lighting setup) in storage order and
/// splits every batch into chunks of at most `CHUNK_CAPACITY`.
pub fn collect_lit_chunks(world: &World) -> Vec<LitChunk> {
    let mut order: Vec<(GroupId, Option<Entity>)> = Vec::new();
    let mut batches: HashMap<(GroupId, Option<Entity>), Vec<LitInstance>> = HashMap::new();
    let mut push = |key: (GroupId, Option<Entity>), instance: LitInstance| {
        batches
            .entry(key)
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(instance);
    };

    for (_, (renderer, to_passes, lighting, ltw, bounds, sphere)) in world
        .query::<(
            &MeshRenderer,
            &RenderToPasses,
            Option<&LightingRef>,
            Option<&LocalToWorld>,
            Option<&WorldBounds>,
            Option<&WorldBoundingSphere>,
        )>()
        .with::<&LitMeshRenderer>()
        .iter()
    {
        push(
            (to_passes.0, lighting.map(|l| l.0)),
            LitInstance {
                mesh: renderer.mesh,
                material: renderer.material,
                transform: ltw.map_or(Mat4::IDENTITY, |t| t.0),
                bounds: bounds.map(|b| b.0),
                sphere: sphere.map(|s| s.0),
                range: DrawRange::of(renderer),
            },
        );
    }

    let mut unskinned = 0;
    for (_, (skinned, to_passes, lighting, ltw, bounds, sphere)) in world
        .query::<(
            &SkinnedMeshRenderer,
            &RenderToPasses,
            Option<&LightingRef>,
            Option<&LocalToWorld>,
            Option<&WorldBounds>,
            Option<&WorldBoundingSphere>,
        )>()
        .with::<&LitMeshRenderer>()
        .without::<&MeshRenderer>()
        .iter()
    {
        let Some(mesh) = skinned.dynamic_mesh else {
            unskinned += 1;
            continue;
        };
        push(
            (to_passes.0, lighting.map(|l| l.0)),
            LitInstance {
                mesh,
                material: skinned.material,
                transform: ltw.map_or(Mat4::IDENTITY, |t| t.0),
                bounds: bounds.map(|b| b.0),
                sphere: sphere.map(|s| s.0),
                range: DrawRange {
                    start: 0,
                    count: None,
                },
            },
        );
    }
    if unskinned > 0 {
        log::debug!("{} skinned renderers have no CPU skinned mesh, skipping", unskinned);
    }

    let mut chunks = Vec::new();
    for key in order {
        let Some(instances) = batches.remove(&key) else {
            continue;
        };
        for part in instances.chunks(CHUNK_CAPACITY) {
            let sphere = chunk_sphere(part);
            chunks.push(LitChunk {
                group: key.0,
                lighting: key.1,
                sphere,
                instances: part.to_vec(),
            });
        }
    }
    chunks
}

/// Sphere around every instance box. Radius 0 when any instance has no
/// bounds, which disables the chunk test.
fn chunk_sphere(instances: &[LitInstance]) -> BoundingSphere {
    let mut total = Aabb::EMPTY;
    for instance in instances {
        match instance.bounds {
            Some(b) if !b.is_empty() => total = total.union(&b),
            _ => return BoundingSphere::default(),
        }
    }
    BoundingSphere::from_aabb(&total)
}

fn encode_lit_chunk(
    ctx: &SubmitContext,
    chunk: &LitChunk,
    encoder: &mut Encoder,
    cache: &mut ViewSpaceLightCache,
) -> RenderResult<SubmitStats> {
    let mut stats = SubmitStats::default();
    let setup = chunk.lighting.unwrap_or(Entity::DANGLING);
    let lighting = chunk
        .lighting
        .and_then(|e| ctx.world.get::<&Lighting>(e).ok().map(|l| *l))
        .unwrap_or_default();

    for &pass_id in ctx.graph.groups().passes(chunk.group) {
        let pass = ctx.graph.pass(pass_id);
        if chunk.sphere.radius > 0.0
            && pass.frustum.cull_sphere(&chunk.sphere) == CullingResult::Outside
        {
            stats.culled_chunks += 1;
            continue;
        }
        for instance in &chunk.instances {
            if instance.range.is_empty() {
                continue;
            }
            if is_outside(pass, instance.sphere.as_ref(), instance.bounds.as_ref()) {
                stats.culled_instances += 1;
                continue;
            }
            let Some(mesh) = gpu_mesh(ctx.world, instance.mesh)? else {
                continue;
            };
            match pass.pass_type {
                RenderPassType::Z_ONLY => encode_z_only(
                    ctx,
                    encoder,
                    pass,
                    &mesh,
                    &instance.transform,
                    instance.range,
                    pass.flip_culling(),
                )?,
                RenderPassType::SHADOW_MAP => encode_shadow_map(
                    ctx,
                    encoder,
                    pass,
                    &mesh,
                    &instance.transform,
                    instance.range,
                    Vec4::ZERO,
                )?,
                RenderPassType::OPAQUE | RenderPassType::TRANSPARENT => {
                    let Ok(material) = ctx.world.get::<&LitMaterialGpu>(instance.material) else {
                        log::debug!("Lit material {:?} is not resolved", instance.material);
                        continue;
                    };
                    encode_lit(
                        ctx,
                        encoder,
                        cache,
                        pass,
                        &mesh,
                        &instance.transform,
                        &material,
                        setup,
                        &lighting,
                        instance.range,
                    )?;
                }
                _ => continue,
            }
            stats.count_draw(pass.pass_type);
        }
    }
    Ok(stats)
}

/// Encodes every lit chunk on the worker pool. Each worker writes into its
/// own encoder and light cache.
pub fn submit_lit_meshes(
    ctx: &SubmitContext,
    pool: &EncoderPool,
    backend: &dyn GraphicsBackend,
) -> RenderResult<SubmitStats> {
    let chunks = collect_lit_chunks(ctx.world);
    if chunks.is_empty() {
        return Ok(SubmitStats::default());
    }
    pool.install(|| {
        chunks
            .par_iter()
            .map(|chunk| {
                let slot = pool.current_slot();
                pool.with_slot(slot, |worker| {
                    let (encoder, cache) = worker.encoder_and_cache(backend, slot);
                    encode_lit_chunk(ctx, chunk, encoder, cache)
                })
            })
            .try_reduce(SubmitStats::default, |a, b| Ok(a.merge(b)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Frustum;
    use crate::renderer::backend::Rect;
    use crate::renderer::graph::{PassSort, RenderNode};
    use crate::renderer::vertex::VertexLayoutKind;
    use glam::Vec3;

    fn instance(x: f32) -> LitInstance {
        LitInstance {
            mesh: Entity::DANGLING,
            material: Entity::DANGLING,
            transform: Mat4::from_translation(Vec3::new(x, 0.0, 0.0)),
            bounds: Some(Aabb::new(Vec3::new(x, 0.0, 0.0), Vec3::ONE)),
            sphere: Some(BoundingSphere::new(Vec3::new(x, 0.0, 0.0), 3f32.sqrt())),
            range: DrawRange {
                start: 0,
                count: Some(3),
            },
        }
    }

    #[test]
    fn chunk_sphere_encloses_all_instances() {
        let sphere = chunk_sphere(&[instance(-4.0), instance(4.0)]);
        assert!(sphere.position.length() < 1e-5);
        assert!(sphere.radius >= 5.0);

        let mut unbounded = instance(0.0);
        unbounded.bounds = None;
        assert_eq!(chunk_sphere(&[instance(1.0), unbounded]).radius, 0.0);
    }

    #[test]
    fn culling_checks_sphere_then_box() {
        let mut graph = RenderGraph::new();
        let node = graph.add_node(RenderNode::primary());
        let mut pass = RenderPass::new(RenderPassType::OPAQUE, PassSort::Sorted, Rect::default());
        pass.frustum = Frustum::from_view_projection(&Mat4::orthographic_rh_gl(
            -1.0, 1.0, -1.0, 1.0, -1.0, 1.0,
        ));
        let id = graph.add_pass(node, pass);
        let pass = graph.pass(id);

        let inside = instance(0.0);
        let far = instance(10.0);
        assert!(!is_outside(pass, inside.sphere.as_ref(), inside.bounds.as_ref()));
        assert!(is_outside(pass, far.sphere.as_ref(), far.bounds.as_ref()));
        // zero radius skips the sphere, the box still culls
        let no_sphere = BoundingSphere::new(Vec3::new(10.0, 0.0, 0.0), 0.0);
        assert!(is_outside(pass, Some(&no_sphere), far.bounds.as_ref()));
        assert!(!is_outside(pass, Some(&no_sphere), None));
    }

    #[test]
    fn unuploaded_mesh_is_an_error() {
        let mut world = World::new();
        let mesh = world.spawn(());
        assert_eq!(gpu_mesh(&world, mesh), Err(RenderError::MeshNotUploaded(mesh)));
    }

    #[test]
    fn empty_mesh_is_skipped() {
        let mut world = World::new();
        let mesh = world.spawn((GpuMesh::empty(VertexLayoutKind::Simple),));
        assert_eq!(gpu_mesh(&world, mesh), Ok(None));
    }

    #[test]
    fn stats_merge_adds_per_pass_type() {
        let mut a = SubmitStats::default();
        a.count_draw(RenderPassType::OPAQUE);
        a.culled_instances = 2;
        let mut b = SubmitStats::default();
        b.count_draw(RenderPassType::OPAQUE);
        b.count_draw(RenderPassType::SHADOW_MAP);
        b.culled_chunks = 1;
        let merged = a.merge(b);
        assert_eq!(merged.draws_for(RenderPassType::OPAQUE), 2);
        assert_eq!(merged.draws_for(RenderPassType::SHADOW_MAP), 1);
        assert_eq!(merged.total_draws(), 3);
        assert_eq!((merged.culled_chunks, merged.culled_instances), (1, 2));
    }
}
