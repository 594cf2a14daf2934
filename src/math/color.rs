use glam::{Vec3, Vec4};

fn channel_linear_to_srgb(x: f32) -> f32 {
    if x <= 0.0031308 {
        x * 12.92
    } else {
        1.055 * x.powf(1.0 / 2.4) - 0.055
    }
}

fn channel_srgb_to_linear(x: f32) -> f32 {
    if x <= 0.04045 {
        x / 12.92
    } else {
        ((x + 0.055) / 1.055).powf(2.4)
    }
}

/// Converts rgb from linear to sRGB. Alpha is left alone.
pub fn linear_to_srgb(c: Vec4) -> Vec4 {
    linear_to_srgb3(c.truncate()).extend(c.w)
}

pub fn linear_to_srgb3(c: Vec3) -> Vec3 {
    Vec3::new(
        channel_linear_to_srgb(c.x),
        channel_linear_to_srgb(c.y),
        channel_linear_to_srgb(c.z),
    )
}

pub fn srgb_to_linear(c: Vec4) -> Vec4 {
    Vec3::new(
        channel_srgb_to_linear(c.x),
        channel_srgb_to_linear(c.y),
        channel_srgb_to_linear(c.z),
    )
    .extend(c.w)
}

fn pack_channel(x: f32) -> u32 {
    ((x * 255.0) as i32).clamp(0, 255) as u32
}

/// Packs a color as `0xRRGGBBAA`, the layout views expect for clear colors.
pub fn pack_color(c: Vec4) -> u32 {
    (pack_channel(c.x) << 24) | (pack_channel(c.y) << 16) | (pack_channel(c.z) << 8) | pack_channel(c.w)
}

pub fn unpack_color(rgba: u32) -> Vec4 {
    Vec4::new(
        ((rgba >> 24) & 0xff) as f32 / 255.0,
        ((rgba >> 16) & 0xff) as f32 / 255.0,
        ((rgba >> 8) & 0xff) as f32 / 255.0,
        (rgba & 0xff) as f32 / 255.0,
    )
}
