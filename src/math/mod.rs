pub mod bounds;
pub mod color;
pub mod frustum;
pub mod projection;

pub use bounds::{Aabb, BoundingSphere};
pub use color::{linear_to_srgb, pack_color, srgb_to_linear};
pub use frustum::{CullingResult, Frustum};
pub use projection::{adjust_projection, adjust_shadow_map_projection};
