use std::collections::HashMap;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{RenderError, RenderResult};
use crate::renderer::backend::{BackendFamily, GraphicsBackend, ProgramHandle};

/// Stable identifiers of the shaders the renderer knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShaderId {
    Simple,
    SimpleLit,
    SimpleLitGpuSkinning,
    Line,
    ZOnly,
    BlitSrgb,
    ExternalBlitEs3,
    ShadowMap,
    ShadowMapGpuSkinning,
    Sprite,
}

impl ShaderId {
    pub const ALL: [ShaderId; 10] = [
        ShaderId::Simple,
        ShaderId::SimpleLit,
        ShaderId::SimpleLitGpuSkinning,
        ShaderId::Line,
        ShaderId::ZOnly,
        ShaderId::BlitSrgb,
        ShaderId::ExternalBlitEs3,
        ShaderId::ShadowMap,
        ShaderId::ShadowMapGpuSkinning,
        ShaderId::Sprite,
    ];

    /// Startup fails if any of these has no binary for the active backend.
    pub const MANDATORY: [ShaderId; 6] = [
        ShaderId::Simple,
        ShaderId::SimpleLit,
        ShaderId::Line,
        ShaderId::ZOnly,
        ShaderId::BlitSrgb,
        ShaderId::ShadowMap,
    ];

    pub fn is_mandatory(self) -> bool {
        Self::MANDATORY.contains(&self)
    }
}

/// Compiled shader binaries, one opaque blob per backend family.
#[derive(Debug, Default, Clone)]
pub struct ShaderRegistry {
    blobs: HashMap<(ShaderId, BackendFamily), Vec<u8>>,
}

impl ShaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, shader: ShaderId, family: BackendFamily, blob: impl Into<Vec<u8>>) {
        self.blobs.insert((shader, family), blob.into());
    }

    pub fn get(&self, shader: ShaderId, family: BackendFamily) -> Option<&[u8]> {
        self.blobs.get(&(shader, family)).map(Vec::as_slice)
    }

    /// Registry with a placeholder blob for every shader and family. Used by
    /// headless setups where the backend never compiles the blob.
    pub fn placeholder() -> Self {
        let mut registry = Self::new();
        let families = [
            BackendFamily::D3D9,
            BackendFamily::D3D11,
            BackendFamily::Metal,
            BackendFamily::Gles,
            BackendFamily::Glsl,
            BackendFamily::SpirV,
            BackendFamily::Wgsl,
        ];
        for shader in ShaderId::ALL {
            for family in families {
                registry.register(shader, family, format!("{shader:?}").into_bytes());
            }
        }
        registry
    }
}

/// Programs created from the registry for the active backend.
#[derive(Debug, Clone)]
pub struct ShaderPrograms {
    programs: HashMap<ShaderId, ProgramHandle>,
}

impl ShaderPrograms {
    pub fn load(registry: &ShaderRegistry, backend: &mut dyn GraphicsBackend) -> RenderResult<Self> {
        let family = backend.caps().family;
        let mut programs = HashMap::new();
        for shader in ShaderId::ALL {
            match registry.get(shader, family) {
                Some(blob) => {
                    let handle = backend.create_program(shader, blob)?;
                    programs.insert(shader, handle);
                }
                None if shader.is_mandatory() => {
                    return Err(RenderError::MissingShader { shader, family });
                }
                None => warn!("Optional shader {:?} has no {:?} binary, skipping", shader, family),
            }
        }
        info!("Loaded {} shader programs for {:?}", programs.len(), family);
        Ok(Self { programs })
    }

    /// Invalid handle when the shader was not loaded.
    pub fn get(&self, shader: ShaderId) -> ProgramHandle {
        self.programs
            .get(&shader)
            .copied()
            .unwrap_or(ProgramHandle::INVALID)
    }

    pub fn contains(&self, shader: ShaderId) -> bool {
        self.programs.contains_key(&shader)
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        for handle in self.programs.into_values() {
            backend.destroy_program(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::RecordingBackend;

    #[test]
    fn missing_mandatory_shader_fails() {
        let mut registry = ShaderRegistry::placeholder();
        registry.blobs.remove(&(ShaderId::ZOnly, BackendFamily::Glsl));
        let mut backend = RecordingBackend::new();
        let err = ShaderPrograms::load(&registry, &mut backend).unwrap_err();
        assert_eq!(
            err,
            RenderError::MissingShader {
                shader: ShaderId::ZOnly,
                family: BackendFamily::Glsl
            }
        );
    }

    #[test]
    fn missing_optional_shader_is_skipped() {
        let mut registry = ShaderRegistry::new();
        for shader in ShaderId::MANDATORY {
            registry.register(shader, BackendFamily::Glsl, vec![1, 2, 3]);
        }
        let mut backend = RecordingBackend::new();
        let programs = ShaderPrograms::load(&registry, &mut backend).expect("mandatory present");
        assert!(programs.contains(ShaderId::BlitSrgb));
        assert!(!programs.contains(ShaderId::Sprite));
        assert!(!programs.get(ShaderId::Sprite).is_valid());
        let simple = programs.get(ShaderId::Simple);
        assert_eq!(backend.program(simple).expect("created").blob_len, 3);
    }
}
