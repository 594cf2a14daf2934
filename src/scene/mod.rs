// scene/mod.rs
// Components the renderer reads and the producers that fill them each frame

pub mod bounds;
pub mod camera;
pub mod components;
pub mod light_matrices;
pub mod skinning;

pub use bounds::update_world_bounds;
pub use camera::update_camera_matrices;
pub use light_matrices::update_light_matrices;
pub use skinning::{update_skinning, SkinningStats};
