use glam::Mat4;
use hecs::{CommandBuffer, World};

use crate::math::Frustum;
use crate::scene::components::{Camera, CameraMatrices, LocalToWorld, ProjectionMode};

/// GL style projection of a camera. Backends adapt it per pass.
pub fn camera_projection(camera: &Camera) -> Mat4 {
    let aspect = if camera.aspect > 0.0 { camera.aspect } else { 1.0 };
    match camera.mode {
        ProjectionMode::Perspective => Mat4::perspective_rh_gl(
            camera.fov.to_radians(),
            aspect,
            camera.clip_z_near,
            camera.clip_z_far,
        ),
        ProjectionMode::Orthographic => {
            let h = camera.ortho_size;
            let w = h * aspect;
            Mat4::orthographic_rh_gl(-w, w, -h, h, camera.clip_z_near, camera.clip_z_far)
        }
    }
}

/// Cameras look along their local -z.
pub fn camera_matrices(camera: &Camera, local_to_world: &Mat4) -> CameraMatrices {
    let view = local_to_world.inverse();
    let projection = camera_projection(camera);
    CameraMatrices {
        view,
        projection,
        frustum: Frustum::from_view_projection(&(projection * view)),
    }
}

/// Refreshes `CameraMatrices` of every camera, adding it where missing.
pub fn update_camera_matrices(world: &mut World) {
    let mut cmd = CommandBuffer::new();
    for (entity, (camera, ltw, matrices)) in world.query_mut::<(
        &Camera,
        Option<&LocalToWorld>,
        Option<&mut CameraMatrices>,
    )>() {
        let computed = camera_matrices(camera, &ltw.map_or(Mat4::IDENTITY, |t| t.0));
        match matrices {
            Some(m) => *m = computed,
            None => cmd.insert_one(entity, computed),
        }
    }
    cmd.run_on(world);
}
