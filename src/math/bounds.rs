use glam::{Mat4, Vec3};

/// Axis aligned box stored as center and half extents.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Aabb {
    pub center: Vec3,
    pub extents: Vec3,
}

impl Aabb {
    pub const EMPTY: Aabb = Aabb {
        center: Vec3::ZERO,
        extents: Vec3::splat(-1.0),
    };

    pub fn new(center: Vec3, extents: Vec3) -> Self {
        Self { center, extents }
    }

    pub fn from_min_max(min: Vec3, max: Vec3) -> Self {
        Self {
            center: (min + max) * 0.5,
            extents: (max - min) * 0.5,
        }
    }

    /// Smallest box containing all `points`, or `EMPTY` if there are none.
    pub fn from_points<I: IntoIterator<Item = Vec3>>(points: I) -> Self {
        let mut iter = points.into_iter();
        let Some(first) = iter.next() else {
            return Self::EMPTY;
        };
        let (min, max) = iter.fold((first, first), |(min, max), p| (min.min(p), max.max(p)));
        Self::from_min_max(min, max)
    }

    pub fn is_empty(&self) -> bool {
        self.extents.x < 0.0 || self.extents.y < 0.0 || self.extents.z < 0.0
    }

    pub fn min(&self) -> Vec3 {
        self.center - self.extents
    }

    pub fn max(&self) -> Vec3 {
        self.center + self.extents
    }

    /// Transforms the box and returns the axis aligned box around the result.
    pub fn transform(&self, m: &Mat4) -> Aabb {
        if self.is_empty() {
            return *self;
        }
        let center = m.transform_point3(self.center);
        let extents = m.x_axis.truncate().abs() * self.extents.x
            + m.y_axis.truncate().abs() * self.extents.y
            + m.z_axis.truncate().abs() * self.extents.z;
        Aabb { center, extents }
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Aabb::from_min_max(self.min().min(other.min()), self.max().max(other.max()))
    }

    pub fn contains(&self, p: Vec3) -> bool {
        let d = (p - self.center).abs();
        d.x <= self.extents.x && d.y <= self.extents.y && d.z <= self.extents.z
    }
}

/// Sphere used for coarse culling. A radius of zero disables sphere culling.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingSphere {
    pub position: Vec3,
    pub radius: f32,
}

impl BoundingSphere {
    pub fn new(position: Vec3, radius: f32) -> Self {
        Self { position, radius }
    }

    /// Sphere that encloses the whole box.
    pub fn from_aabb(aabb: &Aabb) -> Self {
        if aabb.is_empty() {
            return Self::default();
        }
        Self {
            position: aabb.center,
            radius: aabb.extents.length(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_keeps_box_around_rotated_corners() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::new(1.0, 2.0, 3.0));
        let m = Mat4::from_rotation_y(std::f32::consts::FRAC_PI_4)
            * Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0));
        let world = aabb.transform(&m);

        for x in [-1.0, 1.0] {
            for y in [-2.0, 2.0] {
                for z in [-3.0, 3.0] {
                    let p = m.transform_point3(Vec3::new(x, y, z));
                    let d = (p - world.center).abs() - world.extents;
                    assert!(d.max_element() <= 1e-4, "corner {p:?} escaped {world:?}");
                }
            }
        }
    }

    #[test]
    fn union_ignores_empty_boxes() {
        let a = Aabb::from_min_max(Vec3::ZERO, Vec3::ONE);
        assert_eq!(a.union(&Aabb::EMPTY), a);
        assert_eq!(Aabb::EMPTY.union(&a), a);
        let b = Aabb::from_min_max(Vec3::splat(2.0), Vec3::splat(3.0));
        let u = a.union(&b);
        assert_eq!(u.min(), Vec3::ZERO);
        assert_eq!(u.max(), Vec3::splat(3.0));
    }

    #[test]
    fn sphere_encloses_box() {
        let aabb = Aabb::from_min_max(Vec3::splat(-1.0), Vec3::splat(1.0));
        let sphere = BoundingSphere::from_aabb(&aabb);
        assert!((sphere.radius - 3.0f32.sqrt()).abs() < 1e-6);
    }
}
