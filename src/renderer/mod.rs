pub mod backend;
pub mod encoder_pool;
pub mod graph;
pub mod lighting;
pub mod material;
pub mod mesh;
pub mod mesh_manager;
pub mod render_context;
pub mod renderer;
pub mod shaders;
pub mod submit;
pub mod texture;
pub mod vertex;

pub use backend::{GraphicsBackend, RecordingBackend, WgpuBackend};
pub use graph::{RenderGraph, RenderGraphBuilder, ScreenToWorld, ScreenToWorldId};
pub use lighting::{update_lighting, Lighting};
pub use material::{LitMaterial, SimpleMaterial};
pub use mesh::GpuMesh;
pub use render_context::RenderContext;
pub use renderer::{FrameStats, Renderer};
pub use shaders::{ShaderId, ShaderRegistry};
pub use vertex::{LitVertex, SimpleVertex};
