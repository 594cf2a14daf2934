// scene/components.rs
// Pure hecs components read by the renderer

use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3, Vec4};
use hecs::Entity;

use crate::asset::{LitMeshData, SimpleMeshData};
use crate::math::{Aabb, BoundingSphere, Frustum};
use crate::renderer::backend::TextureHandle;
use crate::renderer::graph::GroupId;

// ============================================================================
// Transform
// ============================================================================

/// Object to world matrix, produced by whatever drives the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalToWorld(pub Mat4);

impl Default for LocalToWorld {
    fn default() -> Self {
        Self(Mat4::IDENTITY)
    }
}

// ============================================================================
// Cameras
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraClearFlags {
    #[default]
    SolidColor,
    DepthOnly,
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProjectionMode {
    #[default]
    Perspective,
    Orthographic,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub clear_flags: CameraClearFlags,
    /// Linear color.
    pub background_color: Vec4,
    pub mode: ProjectionMode,
    /// Vertical field of view in degrees.
    pub fov: f32,
    /// Half height of the orthographic view volume.
    pub ortho_size: f32,
    pub clip_z_near: f32,
    pub clip_z_far: f32,
    /// Set from the target node size when the graph is built.
    pub aspect: f32,
    /// Cameras paint in ascending depth order.
    pub depth: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            clear_flags: CameraClearFlags::SolidColor,
            background_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
            mode: ProjectionMode::Perspective,
            fov: 60.0,
            ortho_size: 5.0,
            clip_z_near: 0.1,
            clip_z_far: 100.0,
            aspect: 1.0,
            depth: 0.0,
        }
    }
}

/// Which renderers a camera sees. Missing means all bits set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CameraMask(pub u64);

/// Which renderers cast into a shadow map. Missing means all bits set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShadowMask(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CameraMatrices {
    pub view: Mat4,
    pub projection: Mat4,
    pub frustum: Frustum,
}

// ============================================================================
// Lights
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    /// Linear color.
    pub color: Vec3,
    pub intensity: f32,
    pub clip_z_near: f32,
    /// Range of point and spot lights, far plane of shadow maps.
    pub clip_z_far: f32,
}

impl Default for Light {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            intensity: 1.0,
            clip_z_near: 0.1,
            clip_z_far: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AmbientLight;

/// Shines along the local -z axis.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DirectionalLight {
    /// Width and height of the orthographic shadow volume.
    pub size: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpotLight {
    /// Full cone angle in degrees.
    pub fov: f32,
    /// Fraction of the cone with full intensity, `[0, 1)`.
    pub inner_radius: f32,
    /// Cone aspect, `(0, 1]`.
    pub ratio: f32,
}

impl Default for SpotLight {
    fn default() -> Self {
        Self {
            fov: 60.0,
            inner_radius: 0.0,
            ratio: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowmappedLight {
    /// Square shadow map size in pixels.
    pub shadow_map_resolution: u32,
}

/// Splits a directional shadow into four cascades of one shared atlas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeShadowmappedLight {
    /// Far distance of cascades 0..2 as a fraction of the camera range.
    pub cascade_scale: Vec3,
    /// Camera whose view range the cascades cover.
    pub camera: Entity,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LightMatrices {
    pub view: Mat4,
    pub projection: Mat4,
    /// World to shadow texture space.
    pub mvp: Mat4,
    pub frustum: Frustum,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CascadeData {
    pub view: Mat4,
    pub projection: Mat4,
    pub frustum: Frustum,
    /// Position of the cascade inside the full light projection.
    pub offset: Vec2,
    pub scale: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CascadeShadowmappedLightCache {
    pub cascades: [CascadeData; 4],
}

/// Stored as the shader flag value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FogMode {
    #[default]
    None = 0,
    Linear = 1,
    Exponential = 2,
    ExponentialSquared = 4,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fog {
    pub mode: FogMode,
    /// Linear color.
    pub color: Vec4,
    pub density: f32,
    pub start_distance: f32,
    pub end_distance: f32,
}

/// Lighting setups a light (or fog) contributes to.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LightToLightingSetup(pub Vec<Entity>);

/// Lighting setup a lit renderer is shaded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LightingRef(pub Entity);

// ============================================================================
// Renderers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshRenderer {
    pub mesh: Entity,
    pub material: Entity,
    pub start_index: u32,
    pub index_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimpleMeshRenderer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LitMeshRenderer;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldBounds(pub Aabb);

/// A radius of zero disables sphere culling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldBoundingSphere(pub BoundingSphere);

/// Copies a texture into every pass of its render group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlitRenderer {
    pub texture: TextureHandle,
    pub color: Vec4,
}

/// Render group a renderer submits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderToPasses(pub GroupId);

// ============================================================================
// Meshes
// ============================================================================

#[derive(Debug, Clone)]
pub struct SimpleMeshRenderData(pub Arc<SimpleMeshData>);

#[derive(Debug, Clone)]
pub struct LitMeshRenderData(pub Arc<LitMeshData>);

/// Object space bounds of a mesh entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshBounds(pub Aabb);

/// Staging state of procedurally written geometry. Sits next to
/// `DynamicVertices<V>` and `DynamicIndices`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicMeshData {
    /// Set to trigger a re-upload, cleared by the mesh manager.
    pub dirty: bool,
    /// Persistent device buffer updated in place, otherwise the static
    /// buffers are recreated on every change.
    pub use_dynamic_gpu_buffer: bool,
    pub vertex_capacity: usize,
    pub index_capacity: usize,
    pub num_vertices: usize,
    pub num_indices: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DynamicVertices<V>(pub Vec<V>);

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DynamicIndices(pub Vec<u16>);

// ============================================================================
// Skinning
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SkinQuality {
    Bone1,
    Bone2,
    #[default]
    Bone4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkinnedMeshRenderer {
    /// Mesh entity with `LitMeshRenderData`.
    pub shared_mesh: Entity,
    pub material: Entity,
    /// CPU skinned copy of the shared mesh.
    pub dynamic_mesh: Option<Entity>,
    pub skin_quality: SkinQuality,
    pub can_use_cpu_skinning: bool,
    pub can_use_gpu_skinning: bool,
}

/// Bone entities, indexed by vertex bone indices.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SkinnedMeshBoneRef(pub Vec<Entity>);

/// Sits on a bone entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkinnedMeshBoneInfo {
    pub smr_entity: Entity,
    pub bindpose: Mat4,
    /// Skin space matrix, refreshed every frame.
    pub bone_matrix: Mat4,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OriginalVertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub tangent: Vec3,
}

/// Unskinned positions and normals of a dynamic mesh.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OriginalVertices(pub Vec<OriginalVertex>);
