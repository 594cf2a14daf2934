use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::error::RenderResult;
use crate::renderer::vertex::MeshVertex;

use super::MeshData;

/// Content address of a mesh: hash over layout, index bytes and vertex bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshContentHash(blake3::Hash);

impl MeshContentHash {
    pub fn of<V: MeshVertex>(indices: &[u16], vertices: &[V]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[V::LAYOUT as u8]);
        hasher.update(&(indices.len() as u64).to_le_bytes());
        hasher.update(bytemuck::cast_slice(indices));
        hasher.update(bytemuck::cast_slice(vertices));
        Self(hasher.finalize())
    }
}

/// Shares identical mesh geometry between renderers. Entries are weak, the
/// geometry lives as long as any renderer holds the `Arc`.
pub struct MeshCache<V> {
    entries: HashMap<MeshContentHash, Weak<MeshData<V>>>,
    hits: u64,
    misses: u64,
}

impl<V: MeshVertex> MeshCache<V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Returns the shared mesh for this content, building it only on a miss.
    pub fn get_or_insert(
        &mut self,
        indices: Vec<u16>,
        vertices: Vec<V>,
    ) -> RenderResult<Arc<MeshData<V>>> {
        let key = MeshContentHash::of(&indices, &vertices);
        if let Some(mesh) = self.entries.get(&key).and_then(Weak::upgrade) {
            self.hits += 1;
            return Ok(mesh);
        }
        self.misses += 1;
        let mesh = Arc::new(MeshData::new(indices, vertices)?);
        self.entries.insert(key, Arc::downgrade(&mesh));
        Ok(mesh)
    }

    pub fn get(&self, key: &MeshContentHash) -> Option<Arc<MeshData<V>>> {
        self.entries.get(key).and_then(Weak::upgrade)
    }

    /// Drops entries whose geometry is no longer referenced.
    pub fn purge(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, mesh| mesh.strong_count() > 0);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

impl<V: MeshVertex> Default for MeshCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
