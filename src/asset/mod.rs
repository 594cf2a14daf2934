pub mod cache;
pub mod handle;
pub mod mesh;
pub mod mesh_cache;

pub use cache::AssetCache;
pub use handle::Handle;
pub use mesh::{LitMeshData, MeshData, SimpleMeshData, MAX_MESH_VERTICES};
pub use mesh_cache::{MeshCache, MeshContentHash};
