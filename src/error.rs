use thiserror::Error;

use crate::renderer::backend::BackendFamily;
use crate::renderer::shaders::ShaderId;

/// Kinds of light slots in a lighting setup, used to report which capacity ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightSlot {
    PointOrDirectional,
    Mapped,
    Cascaded,
}

impl std::fmt::Display for LightSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LightSlot::PointOrDirectional => write!(f, "point/directional"),
            LightSlot::Mapped => write!(f, "shadow mapped"),
            LightSlot::Cascaded => write!(f, "cascade shadow mapped"),
        }
    }
}

/// Fatal renderer errors. Any of these aborts the current init or frame.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("too many {kind} lights (capacity {capacity})")]
    TooManyLights { kind: LightSlot, capacity: usize },

    #[error("invalid light: {0}")]
    InvalidLight(String),

    #[error("invalid spot cone: inner radius {inner_radius}, ratio {ratio}")]
    InvalidSpotCone { inner_radius: f32, ratio: f32 },

    #[error("fog end distance {end} must be greater than start distance {start}")]
    InvalidFogRange { start: f32, end: f32 },

    #[error("requested {requested} vertices but capacity is {capacity}")]
    VertexCapacityExceeded { requested: usize, capacity: usize },

    #[error("requested {requested} indices but capacity is {capacity}")]
    IndexCapacityExceeded { requested: usize, capacity: usize },

    #[error("invalid mesh size: {vertices} vertices, {indices} indices")]
    InvalidMeshSize { vertices: usize, indices: usize },

    #[error("dynamic mesh operation on a mesh that is not in dynamic mode")]
    InvalidDynamicMode,

    #[error("mesh for entity {0:?} was submitted before it was uploaded")]
    MeshNotUploaded(hecs::Entity),

    #[error("submit range {start}+{count} exceeds index count {index_count}")]
    SubmitRangeOutOfBounds {
        start: u32,
        count: u32,
        index_count: u32,
    },

    #[error("mandatory shader {shader:?} has no binary for backend family {family:?}")]
    MissingShader { shader: ShaderId, family: BackendFamily },

    #[error("render pass {pass} on node {node} is not reachable from any primary surface")]
    OrphanedPass { pass: usize, node: usize },

    #[error("render graph contains a dependency cycle through node {node}")]
    RenderGraphCycle { node: usize },

    #[error("render graph has {passes} reachable passes, more than the {max} view ids available")]
    TooManyViews { passes: usize, max: usize },

    #[error("render graph has no main view node")]
    MissingMainNode,

    #[error("screen to world root {0}")]
    ScreenToWorldRoot(String),

    #[error("graphics backend error: {0}")]
    Backend(String),
}

pub type RenderResult<T> = Result<T, RenderError>;
