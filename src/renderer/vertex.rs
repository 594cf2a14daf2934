use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use std::mem::{offset_of, size_of};

/// Unlit vertex: position, uv and color.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, Default, PartialEq)]
pub struct SimpleVertex {
    pub position: [f32; 3],
    pub uv0: [f32; 2],
    pub color: [f32; 4],
}

/// Lit vertex. The byte offsets are a binary contract with the mesh
/// conversion stage and the shaders and must not change.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, Default, PartialEq)]
pub struct LitVertex {
    pub position: [f32; 3],
    pub uv0: [f32; 2],
    pub normal: [f32; 3],
    pub tangent: [f32; 3],
    pub bone_weight: [f32; 4],
    pub bone_index: [f32; 4],
    pub billboard_pos: [f32; 3],
    pub albedo_opacity: [f32; 4],
    pub metal_smoothness: [f32; 2],
}

const _: () = assert!(size_of::<SimpleVertex>() == 36);
const _: () = assert!(offset_of!(SimpleVertex, position) == 0);
const _: () = assert!(offset_of!(SimpleVertex, uv0) == 12);
const _: () = assert!(offset_of!(SimpleVertex, color) == 20);

const _: () = assert!(size_of::<LitVertex>() == 112);
const _: () = assert!(offset_of!(LitVertex, position) == 0);
const _: () = assert!(offset_of!(LitVertex, uv0) == 12);
const _: () = assert!(offset_of!(LitVertex, normal) == 20);
const _: () = assert!(offset_of!(LitVertex, tangent) == 32);
const _: () = assert!(offset_of!(LitVertex, bone_weight) == 44);
const _: () = assert!(offset_of!(LitVertex, bone_index) == 60);
const _: () = assert!(offset_of!(LitVertex, billboard_pos) == 76);
const _: () = assert!(offset_of!(LitVertex, albedo_opacity) == 88);
const _: () = assert!(offset_of!(LitVertex, metal_smoothness) == 104);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexSemantic {
    Position,
    TexCoord0,
    Normal,
    Tangent,
    Weight,
    Indices,
    TexCoord1,
    Color0,
    TexCoord2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32x2,
    Float32x3,
    Float32x4,
}

impl VertexFormat {
    pub fn size(self) -> usize {
        match self {
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub semantic: VertexSemantic,
    pub format: VertexFormat,
    pub offset: usize,
}

const fn attr(semantic: VertexSemantic, format: VertexFormat, offset: usize) -> VertexAttribute {
    VertexAttribute {
        semantic,
        format,
        offset,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexLayoutKind {
    Simple,
    Lit,
    PositionOnly,
}

impl VertexLayoutKind {
    pub const ALL: [VertexLayoutKind; 3] = [
        VertexLayoutKind::Simple,
        VertexLayoutKind::Lit,
        VertexLayoutKind::PositionOnly,
    ];

    pub fn stride(self) -> usize {
        match self {
            VertexLayoutKind::Simple => size_of::<SimpleVertex>(),
            VertexLayoutKind::Lit => size_of::<LitVertex>(),
            VertexLayoutKind::PositionOnly => size_of::<[f32; 3]>(),
        }
    }

    pub fn attributes(self) -> &'static [VertexAttribute] {
        use VertexFormat::*;
        use VertexSemantic::*;

        const SIMPLE: [VertexAttribute; 3] = [
            attr(Position, Float32x3, offset_of!(SimpleVertex, position)),
            attr(TexCoord0, Float32x2, offset_of!(SimpleVertex, uv0)),
            attr(Color0, Float32x4, offset_of!(SimpleVertex, color)),
        ];
        const LIT: [VertexAttribute; 9] = [
            attr(Position, Float32x3, offset_of!(LitVertex, position)),
            attr(TexCoord0, Float32x2, offset_of!(LitVertex, uv0)),
            attr(Normal, Float32x3, offset_of!(LitVertex, normal)),
            attr(Tangent, Float32x3, offset_of!(LitVertex, tangent)),
            attr(Weight, Float32x4, offset_of!(LitVertex, bone_weight)),
            attr(Indices, Float32x4, offset_of!(LitVertex, bone_index)),
            attr(TexCoord1, Float32x3, offset_of!(LitVertex, billboard_pos)),
            attr(Color0, Float32x4, offset_of!(LitVertex, albedo_opacity)),
            attr(TexCoord2, Float32x2, offset_of!(LitVertex, metal_smoothness)),
        ];
        const POSITION_ONLY: [VertexAttribute; 1] = [attr(Position, Float32x3, 0)];

        match self {
            VertexLayoutKind::Simple => &SIMPLE,
            VertexLayoutKind::Lit => &LIT,
            VertexLayoutKind::PositionOnly => &POSITION_ONLY,
        }
    }
}

/// Vertex types the GPU mesh manager can upload.
pub trait MeshVertex: Pod + Send + Sync + 'static {
    const LAYOUT: VertexLayoutKind;

    fn position(&self) -> Vec3;
}

impl MeshVertex for SimpleVertex {
    const LAYOUT: VertexLayoutKind = VertexLayoutKind::Simple;

    fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }
}

impl MeshVertex for LitVertex {
    const LAYOUT: VertexLayoutKind = VertexLayoutKind::Lit;

    fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_stride_matches_struct_size() {
        assert_eq!(VertexLayoutKind::Simple.stride(), 36);
        assert_eq!(VertexLayoutKind::Lit.stride(), 112);
    }

    #[test]
    fn attributes_are_packed_without_gaps() {
        for kind in VertexLayoutKind::ALL {
            let end = kind
                .attributes()
                .iter()
                .map(|a| a.offset + a.format.size())
                .max()
                .unwrap_or(0);
            assert_eq!(end, kind.stride(), "{kind:?}");
        }
    }

    #[test]
    fn lit_vertex_bytes_land_at_contract_offsets() {
        let v = LitVertex {
            metal_smoothness: [0.25, 0.75],
            ..LitVertex::default()
        };
        let bytes = bytemuck::bytes_of(&v);
        let tail: &[f32] = bytemuck::cast_slice(&bytes[104..112]);
        assert_eq!(tail, &[0.25, 0.75]);
    }
}
