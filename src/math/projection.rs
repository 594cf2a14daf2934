use glam::{Mat4, Vec4};

fn map_columns(m: &Mat4, f: impl Fn(Vec4) -> Vec4) -> Mat4 {
    Mat4::from_cols(f(m.x_axis), f(m.y_axis), f(m.z_axis), f(m.w_axis))
}

/// Adapts an OpenGL style projection to the backend clip conventions.
/// `z_compress` remaps clip z from `[-1, 1]` to `[0, 1]`, `y_flip` mirrors y.
pub fn adjust_projection(m: &Mat4, z_compress: bool, y_flip: bool) -> Mat4 {
    let mut r = *m;
    if z_compress {
        r = map_columns(&r, |mut c| {
            c.z = (c.z + c.w) * 0.5;
            c
        });
    }
    if y_flip {
        r = map_columns(&r, |mut c| {
            c.y = -c.y;
            c
        });
    }
    r
}

/// Maps xyz of a light projection from ndc `[-1, 1]` to texture space `[0, 1]`.
pub fn adjust_shadow_map_projection(m: &Mat4) -> Mat4 {
    map_columns(m, |c| (c + Vec4::splat(c.w)) * 0.5)
}

/// Backend adjusted projection for a pass plus whether triangle winding flips.
/// GL style backends (homogeneous depth, bottom-left origin) get the matrix unchanged.
pub fn backend_projection(
    m: &Mat4,
    homogeneous_depth: bool,
    origin_bottom_left: bool,
    render_to_texture: bool,
) -> (Mat4, bool) {
    if homogeneous_depth && origin_bottom_left {
        return (*m, false);
    }
    let y_flip = !origin_bottom_left && render_to_texture;
    (adjust_projection(m, !homogeneous_depth, y_flip), y_flip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    const EPSILON: f32 = 1e-5;

    #[test]
    fn z_compress_maps_near_and_far_to_unit_range() {
        let proj = Mat4::perspective_rh_gl(1.0, 1.0, 1.0, 10.0);
        let adjusted = adjust_projection(&proj, true, false);

        let near = adjusted * Vec3::new(0.0, 0.0, -1.0).extend(1.0);
        let far = adjusted * Vec3::new(0.0, 0.0, -10.0).extend(1.0);
        assert!((near.z / near.w).abs() < EPSILON);
        assert!((far.z / far.w - 1.0).abs() < EPSILON);
    }

    #[test]
    fn y_flip_negates_clip_y() {
        let proj = Mat4::perspective_rh_gl(1.0, 1.0, 1.0, 10.0);
        let p = Vec3::new(0.5, 0.5, -3.0).extend(1.0);
        let a = proj * p;
        let b = adjust_projection(&proj, false, true) * p;
        assert!((a.y + b.y).abs() < EPSILON);
        assert!((a.x - b.x).abs() < EPSILON);
    }

    #[test]
    fn gl_style_backend_keeps_matrix_and_culling() {
        let proj = Mat4::orthographic_rh_gl(-1.0, 1.0, -1.0, 1.0, 0.0, 1.0);
        let (m, flip) = backend_projection(&proj, true, true, true);
        assert_eq!(m, proj);
        assert!(!flip);
    }

    #[test]
    fn top_left_origin_flips_only_render_to_texture() {
        let proj = Mat4::IDENTITY;
        assert!(backend_projection(&proj, false, false, true).1);
        assert!(!backend_projection(&proj, false, false, false).1);
    }

    #[test]
    fn shadow_map_projection_maps_ndc_corners_to_uv() {
        let m = adjust_shadow_map_projection(&Mat4::IDENTITY);
        let lo = m * Vec4::new(-1.0, -1.0, -1.0, 1.0);
        let hi = m * Vec4::new(1.0, 1.0, 1.0, 1.0);
        assert!((lo.truncate()).abs().max_element() < EPSILON);
        assert!((hi.truncate() - Vec3::ONE).abs().max_element() < EPSILON);
    }
}
