//! View frustum used for late stage culling.

use glam::{Mat4, Vec3, Vec4};

use super::{Aabb, BoundingSphere};

pub const MAX_FRUSTUM_PLANES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullingResult {
    Outside,
    Intersects,
    Inside,
}

/// Up to six planes, `xyz` is the inward facing normal and `w` the distance.
/// A frustum with no planes contains everything.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    planes: [Vec4; MAX_FRUSTUM_PLANES],
    plane_count: usize,
}

impl Default for Frustum {
    fn default() -> Self {
        Self::EVERYTHING
    }
}

impl Frustum {
    pub const EVERYTHING: Frustum = Frustum {
        planes: [Vec4::ZERO; MAX_FRUSTUM_PLANES],
        plane_count: 0,
    };

    /// Extracts the planes of a view-projection matrix with an OpenGL style
    /// clip volume (`-w <= z <= w`).
    pub fn from_view_projection(m: &Mat4) -> Self {
        let r0 = m.row(0);
        let r1 = m.row(1);
        let r2 = m.row(2);
        let r3 = m.row(3);
        let raw = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r3 + r2, r3 - r2];

        let mut planes = [Vec4::ZERO; MAX_FRUSTUM_PLANES];
        for (dst, p) in planes.iter_mut().zip(raw) {
            let len = p.truncate().length();
            *dst = if len > 0.0 { p / len } else { p };
        }
        Self {
            planes,
            plane_count: MAX_FRUSTUM_PLANES,
        }
    }

    pub fn from_planes(src: &[Vec4]) -> Self {
        let mut planes = [Vec4::ZERO; MAX_FRUSTUM_PLANES];
        let plane_count = src.len().min(MAX_FRUSTUM_PLANES);
        planes[..plane_count].copy_from_slice(&src[..plane_count]);
        Self {
            planes,
            plane_count,
        }
    }

    pub fn planes(&self) -> &[Vec4] {
        &self.planes[..self.plane_count]
    }

    pub fn is_everything(&self) -> bool {
        self.plane_count == 0
    }

    fn distance(plane: Vec4, p: Vec3) -> f32 {
        plane.truncate().dot(p) + plane.w
    }

    pub fn cull_sphere(&self, sphere: &BoundingSphere) -> CullingResult {
        let mut result = CullingResult::Inside;
        for plane in self.planes() {
            let d = Self::distance(*plane, sphere.position);
            if d < -sphere.radius {
                return CullingResult::Outside;
            }
            if d < sphere.radius {
                result = CullingResult::Intersects;
            }
        }
        result
    }

    /// True when the box lies completely outside one of the planes.
    pub fn is_culled(&self, aabb: &Aabb) -> bool {
        if aabb.is_empty() {
            return false;
        }
        self.planes().iter().any(|plane| {
            let n = plane.truncate();
            let r = aabb.extents.dot(n.abs());
            Self::distance(*plane, aabb.center) < -r
        })
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        self.planes()
            .iter()
            .all(|plane| Self::distance(*plane, p) >= 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera_frustum() -> Frustum {
        let proj = Mat4::perspective_rh_gl(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        Frustum::from_view_projection(&(proj * view))
    }

    #[test]
    fn sphere_in_front_is_inside() {
        let f = camera_frustum();
        let s = BoundingSphere::new(Vec3::new(0.0, 0.0, -10.0), 1.0);
        assert_eq!(f.cull_sphere(&s), CullingResult::Inside);
    }

    #[test]
    fn sphere_behind_is_outside() {
        let f = camera_frustum();
        let s = BoundingSphere::new(Vec3::new(0.0, 0.0, 10.0), 1.0);
        assert_eq!(f.cull_sphere(&s), CullingResult::Outside);
    }

    #[test]
    fn sphere_on_near_plane_intersects() {
        let f = camera_frustum();
        let s = BoundingSphere::new(Vec3::new(0.0, 0.0, -0.1), 0.5);
        assert_eq!(f.cull_sphere(&s), CullingResult::Intersects);
    }

    #[test]
    fn box_outside_side_plane_is_culled() {
        let f = camera_frustum();
        let outside = Aabb::new(Vec3::new(50.0, 0.0, -10.0), Vec3::ONE);
        let inside = Aabb::new(Vec3::new(0.0, 0.0, -10.0), Vec3::ONE);
        assert!(f.is_culled(&outside));
        assert!(!f.is_culled(&inside));
    }

    #[test]
    fn empty_frustum_never_culls() {
        let f = Frustum::EVERYTHING;
        let s = BoundingSphere::new(Vec3::splat(1e6), 1.0);
        assert_eq!(f.cull_sphere(&s), CullingResult::Inside);
        assert!(!f.is_culled(&Aabb::new(Vec3::splat(-1e6), Vec3::ONE)));
    }
}
