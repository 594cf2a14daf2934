//! Shadow projections of shadow mapped lights.
//!
//! Spot lights get a perspective projection, directional lights an
//! orthographic box. Cascaded directional lights split the view range of
//! their camera into four slices; every slice is fitted with a sphere and gets
//! its own orthographic projection inside the full light projection.

use glam::{Mat4, Vec2, Vec3};
use hecs::{CommandBuffer, Entity, World};

use crate::math::{adjust_shadow_map_projection, Frustum};
use crate::scene::components::{
    Camera, CascadeData, CascadeShadowmappedLight, CascadeShadowmappedLightCache,
    DirectionalLight, Light, LightMatrices, LocalToWorld, ProjectionMode, ShadowmappedLight,
    SpotLight,
};

/// Up vector for a light view that never lines up with `direction`.
fn shadow_up(direction: Vec3) -> Vec3 {
    if direction.abs().dot(Vec3::Y) > 0.95 {
        Vec3::Z
    } else {
        Vec3::Y
    }
}

fn light_matrices(view: Mat4, projection: Mat4) -> LightMatrices {
    let view_projection = projection * view;
    LightMatrices {
        view,
        projection,
        mvp: adjust_shadow_map_projection(&view_projection),
        frustum: Frustum::from_view_projection(&view_projection),
    }
}

pub fn spot_light_matrices(light: &Light, spot: &SpotLight, local_to_world: &Mat4) -> LightMatrices {
    let fov = spot.fov.to_radians().clamp(0.01, std::f32::consts::PI - 0.01);
    let projection = Mat4::perspective_rh_gl(fov, 1.0, light.clip_z_near, light.clip_z_far);
    light_matrices(local_to_world.inverse(), projection)
}

pub fn directional_light_matrices(
    light: &Light,
    directional: &DirectionalLight,
    local_to_world: &Mat4,
) -> LightMatrices {
    let half = (directional.size * 0.5).max(0.05);
    let projection =
        Mat4::orthographic_rh_gl(-half, half, -half, half, light.clip_z_near, light.clip_z_far);
    light_matrices(local_to_world.inverse(), projection)
}

/// World space sphere around the slice of the camera view volume between
/// the distances `near` and `far`.
fn slice_sphere(camera: &Camera, camera_to_world: &Mat4, near: f32, far: f32) -> (Vec3, f32) {
    let aspect = if camera.aspect > 0.0 { camera.aspect } else { 1.0 };
    let half_extent = |d: f32| -> Vec2 {
        let h = match camera.mode {
            ProjectionMode::Perspective => d * (camera.fov.to_radians() * 0.5).tan(),
            ProjectionMode::Orthographic => camera.ortho_size,
        };
        Vec2::new(h * aspect, h)
    };
    let mid = (near + far) * 0.5;
    let center = Vec3::new(0.0, 0.0, -mid);
    let radius = [(near, half_extent(near)), (far, half_extent(far))]
        .into_iter()
        .map(|(d, e)| (Vec3::new(e.x, e.y, -d) - center).length())
        .fold(0.0f32, f32::max);
    (camera_to_world.transform_point3(center), radius)
}

/// Light matrices of the whole cascade set plus the per cascade data.
pub fn cascade_matrices(
    cascaded: &CascadeShadowmappedLight,
    light_to_world: &Mat4,
    camera: &Camera,
    camera_to_world: &Mat4,
) -> (LightMatrices, CascadeShadowmappedLightCache) {
    let direction = (-light_to_world.z_axis.truncate()).try_normalize().unwrap_or(Vec3::NEG_Y);
    let up = shadow_up(direction);
    let near = camera.clip_z_near;
    let range = camera.clip_z_far - near;
    let splits = [
        near,
        near + range * cascaded.cascade_scale.x,
        near + range * cascaded.cascade_scale.y,
        near + range * cascaded.cascade_scale.z,
        camera.clip_z_far,
    ];

    let spheres: Vec<(Vec3, f32)> = splits
        .windows(2)
        .map(|w| {
            let (center, radius) = slice_sphere(camera, camera_to_world, w[0], w[1]);
            (center, radius.max(0.05))
        })
        .collect();
    let (full_center, _) = slice_sphere(camera, camera_to_world, near, camera.clip_z_far);
    // every cascade sphere lies inside the full projection
    let full_radius = spheres
        .iter()
        .map(|(center, radius)| center.distance(full_center) + radius)
        .fold(0.05f32, f32::max);
    let depth = full_radius * 2.0;
    let view = Mat4::look_to_rh(full_center - direction * full_radius, direction, up);
    let projection =
        Mat4::orthographic_rh_gl(-full_radius, full_radius, -full_radius, full_radius, 0.0, depth);

    let mut cache = CascadeShadowmappedLightCache::default();
    for (data, &(center, radius)) in cache.cascades.iter_mut().zip(&spheres) {
        let light_space = view.transform_point3(center);
        let cascade_view =
            Mat4::from_translation(Vec3::new(-light_space.x, -light_space.y, 0.0)) * view;
        let cascade_projection =
            Mat4::orthographic_rh_gl(-radius, radius, -radius, radius, 0.0, depth);
        *data = CascadeData {
            view: cascade_view,
            projection: cascade_projection,
            frustum: Frustum::from_view_projection(&(cascade_projection * cascade_view)),
            // lower left corner in full projection texture space
            offset: (Vec2::new(light_space.x, light_space.y) - Vec2::splat(radius)
                + Vec2::splat(full_radius))
                / (2.0 * full_radius),
            scale: radius / full_radius,
        };
    }
    (light_matrices(view, projection), cache)
}

/// Refreshes `LightMatrices` of every shadow mapped light and the cascade
/// cache of cascaded ones.
pub fn update_light_matrices(world: &mut World) {
    let mut updates: Vec<(Entity, LightMatrices, Option<CascadeShadowmappedLightCache>)> = Vec::new();
    for (entity, (light, _, ltw, spot, directional, cascaded)) in world
        .query::<(
            &Light,
            &ShadowmappedLight,
            Option<&LocalToWorld>,
            Option<&SpotLight>,
            Option<&DirectionalLight>,
            Option<&CascadeShadowmappedLight>,
        )>()
        .iter()
    {
        let ltw = ltw.map_or(Mat4::IDENTITY, |t| t.0);
        match (spot, directional, cascaded) {
            (_, Some(_), Some(cascaded)) => {
                let camera = world.get::<&Camera>(cascaded.camera).ok().map(|c| *c);
                let camera_to_world = world
                    .get::<&LocalToWorld>(cascaded.camera)
                    .map_or(Mat4::IDENTITY, |t| t.0);
                let Some(camera) = camera else {
                    log::debug!("Cascaded light {:?} has no camera", entity);
                    continue;
                };
                let (matrices, cache) = cascade_matrices(cascaded, &ltw, &camera, &camera_to_world);
                updates.push((entity, matrices, Some(cache)));
            }
            (_, Some(directional), None) => {
                updates.push((entity, directional_light_matrices(light, directional, &ltw), None));
            }
            (Some(spot), None, _) => {
                updates.push((entity, spot_light_matrices(light, spot, &ltw), None));
            }
            // point light shadows are not supported
            (None, None, _) => {}
        }
    }

    let mut cmd = CommandBuffer::new();
    for (entity, matrices, cache) in updates {
        cmd.insert_one(entity, matrices);
        if let Some(cache) = cache {
            cmd.insert_one(entity, cache);
        }
    }
    cmd.run_on(world);
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-4;

    #[test]
    fn shadow_texture_space_is_unit_cube() {
        let light = Light::default();
        let m = directional_light_matrices(&light, &DirectionalLight { size: 4.0 }, &Mat4::IDENTITY);
        // center of the box, halfway between the clip planes
        let mid = -(light.clip_z_near + light.clip_z_far) * 0.5;
        let p = m.mvp * Vec3::new(0.0, 0.0, mid).extend(1.0);
        let p = p / p.w;
        assert!((p.x - 0.5).abs() < EPSILON);
        assert!((p.y - 0.5).abs() < EPSILON);
        assert!((p.z - 0.5).abs() < EPSILON);
        let corner = m.mvp * Vec3::new(-2.0, -2.0, mid).extend(1.0);
        assert!(corner.x.abs() < EPSILON && corner.y.abs() < EPSILON);
    }

    #[test]
    fn cascades_grow_with_distance_and_fit_inside_full_projection() {
        let cascaded = CascadeShadowmappedLight {
            cascade_scale: Vec3::new(0.1, 0.25, 0.5),
            camera: Entity::DANGLING,
        };
        let camera = Camera {
            aspect: 1.5,
            ..Camera::default()
        };
        let light_to_world = Mat4::from_rotation_x(-std::f32::consts::FRAC_PI_2);
        let (_, cache) = cascade_matrices(&cascaded, &light_to_world, &camera, &Mat4::IDENTITY);
        let scales: Vec<f32> = cache.cascades.iter().map(|c| c.scale).collect();
        assert!(scales.windows(2).all(|w| w[0] < w[1]));
        for c in &cache.cascades {
            assert!(c.scale <= 1.0 + EPSILON);
            assert!(c.offset.x >= -EPSILON && c.offset.y >= -EPSILON);
            assert!(c.offset.x + c.scale <= 1.0 + EPSILON);
            assert!(c.offset.y + c.scale <= 1.0 + EPSILON);
        }
    }

    #[test]
    fn update_adds_matrices_to_shadowed_lights_only() {
        let mut world = World::new();
        let spot = world.spawn((
            Light::default(),
            SpotLight::default(),
            ShadowmappedLight {
                shadow_map_resolution: 256,
            },
        ));
        let unshadowed = world.spawn((Light::default(), SpotLight::default()));
        update_light_matrices(&mut world);
        assert!(world.get::<&LightMatrices>(spot).is_ok());
        assert!(world.get::<&LightMatrices>(unshadowed).is_err());
    }
}
