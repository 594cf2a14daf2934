// renderer/graph/groups.rs (deduplicated renderer to pass assignment)

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use hecs::{Entity, World};

use super::{PassId, PassMask, RenderGraph, RenderPass, RenderPassType};
use crate::renderer::material::{LitMaterial, SimpleMaterial};
use crate::scene::components::{
    CameraMask, LitMeshRenderer, MeshRenderer, RenderToPasses, ShadowMask, SimpleMeshRenderer,
    SkinnedMeshRenderer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(u32);

impl GroupId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Value key of a render group. Renderers with equal keys share a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildGroup {
    pub pass_types: RenderPassType,
    pub camera_mask: u64,
    pub shadow_mask: u64,
}

impl BuildGroup {
    pub const OPAQUE_TYPES: RenderPassType = RenderPassType::OPAQUE
        .union(RenderPassType::Z_ONLY)
        .union(RenderPassType::SHADOW_MAP);

    pub fn for_renderer(transparent: bool, camera_mask: u64, shadow_mask: u64) -> Self {
        let pass_types = if transparent {
            RenderPassType::TRANSPARENT
        } else {
            Self::OPAQUE_TYPES
        };
        Self {
            pass_types,
            camera_mask,
            shadow_mask,
        }
    }

    /// Sum of the pass types and the 32 bit halves of both masks.
    pub fn hash_code(&self) -> u32 {
        self.pass_types
            .bits()
            .wrapping_add(self.camera_mask as u32)
            .wrapping_add((self.camera_mask >> 32) as u32)
            .wrapping_add(self.shadow_mask as u32)
            .wrapping_add((self.shadow_mask >> 32) as u32)
    }

    pub fn matches(&self, pass: &RenderPass) -> bool {
        if !pass.pass_type.intersects(self.pass_types) {
            return false;
        }
        match pass.mask {
            PassMask::All => true,
            PassMask::Camera(mask) => mask & self.camera_mask != 0,
            PassMask::Shadow(mask) => mask & self.shadow_mask != 0,
        }
    }
}

impl Hash for BuildGroup {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash_code());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RenderGroup {
    /// `None` for groups with a hand picked pass list.
    key: Option<BuildGroup>,
    passes: Vec<PassId>,
}

#[derive(Debug, Default)]
pub struct RenderGroups {
    keyed: HashMap<BuildGroup, GroupId>,
    groups: Vec<RenderGroup>,
}

fn collect_passes(passes: &[RenderPass], key: &BuildGroup) -> Vec<PassId> {
    passes
        .iter()
        .enumerate()
        .filter(|(_, p)| key.matches(p))
        .map(|(i, _)| PassId(i as u32))
        .collect()
}

impl RenderGroups {
    pub fn find_or_create(&mut self, passes: &[RenderPass], key: BuildGroup) -> GroupId {
        if let Some(&id) = self.keyed.get(&key) {
            return id;
        }
        let id = GroupId(self.groups.len() as u32);
        self.groups.push(RenderGroup {
            key: Some(key),
            passes: collect_passes(passes, &key),
        });
        self.keyed.insert(key, id);
        id
    }

    pub fn create_explicit(&mut self, passes: Vec<PassId>) -> GroupId {
        let id = GroupId(self.groups.len() as u32);
        self.groups.push(RenderGroup { key: None, passes });
        id
    }

    /// Target passes of a group. Unknown ids have none.
    pub fn passes(&self, id: GroupId) -> &[PassId] {
        self.groups
            .get(id.index())
            .map(|g| g.passes.as_slice())
            .unwrap_or(&[])
    }

    pub fn key(&self, id: GroupId) -> Option<BuildGroup> {
        self.groups.get(id.index()).and_then(|g| g.key)
    }

    /// Recomputes the pass list of every keyed group, keeping ids stable.
    pub fn refresh(&mut self, passes: &[RenderPass]) {
        for group in &mut self.groups {
            if let Some(key) = group.key {
                group.passes = collect_passes(passes, &key);
            }
        }
    }

    pub fn invalidate_all(&mut self) {
        self.keyed.clear();
        self.groups.clear();
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Gives every renderer without a `RenderToPasses` the group matching its
/// transparency and masks. Returns how many renderers were assigned.
pub fn assign_render_groups(world: &mut World, graph: &mut RenderGraph) -> usize {
    let mut pending: Vec<(Entity, bool, u64, u64)> = Vec::new();
    let transparent_simple = |material: Entity| {
        world
            .get::<&SimpleMaterial>(material)
            .map(|m| m.transparent)
            .unwrap_or(false)
    };
    let transparent_lit = |material: Entity| {
        world
            .get::<&LitMaterial>(material)
            .map(|m| m.transparent)
            .unwrap_or(false)
    };

    for (entity, (renderer, simple, lit, camera_mask, shadow_mask)) in world
        .query::<(
            &MeshRenderer,
            Option<&SimpleMeshRenderer>,
            Option<&LitMeshRenderer>,
            Option<&CameraMask>,
            Option<&ShadowMask>,
        )>()
        .without::<&RenderToPasses>()
        .iter()
    {
        let transparent = match (simple, lit) {
            (Some(_), _) => transparent_simple(renderer.material),
            (None, Some(_)) => transparent_lit(renderer.material),
            (None, None) => continue,
        };
        pending.push((
            entity,
            transparent,
            camera_mask.map_or(u64::MAX, |m| m.0),
            shadow_mask.map_or(u64::MAX, |m| m.0),
        ));
    }

    for (entity, (skinned, _, camera_mask, shadow_mask)) in world
        .query::<(
            &SkinnedMeshRenderer,
            &LitMeshRenderer,
            Option<&CameraMask>,
            Option<&ShadowMask>,
        )>()
        .without::<&RenderToPasses>()
        .without::<&MeshRenderer>()
        .iter()
    {
        pending.push((
            entity,
            transparent_lit(skinned.material),
            camera_mask.map_or(u64::MAX, |m| m.0),
            shadow_mask.map_or(u64::MAX, |m| m.0),
        ));
    }

    let (groups, passes) = graph.groups_and_passes();
    let assigned = pending.len();
    for (entity, transparent, camera_mask, shadow_mask) in pending {
        let key = BuildGroup::for_renderer(transparent, camera_mask, shadow_mask);
        let group = groups.find_or_create(passes, key);
        // entity came from the queries above
        let _ = world.insert_one(entity, RenderToPasses(group));
    }
    assigned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::Rect;
    use crate::renderer::graph::{PassSort, RenderNode};

    fn pass(pass_type: RenderPassType, mask: PassMask) -> RenderPass {
        RenderPass {
            mask,
            ..RenderPass::new(pass_type, PassSort::Unsorted, Rect::default())
        }
    }

    #[test]
    fn hash_code_wraps_mask_halves() {
        let key = BuildGroup {
            pass_types: RenderPassType::TRANSPARENT,
            camera_mask: u64::MAX,
            shadow_mask: 0,
        };
        // 4 + 0xffffffff + 0xffffffff wraps to 2
        assert_eq!(key.hash_code(), 2);
    }

    #[test]
    fn equal_keys_share_a_group() {
        let passes = vec![
            pass(RenderPassType::OPAQUE, PassMask::Camera(1)),
            pass(RenderPassType::TRANSPARENT, PassMask::Camera(1)),
            pass(RenderPassType::SHADOW_MAP, PassMask::Shadow(u64::MAX)),
            pass(RenderPassType::OPAQUE, PassMask::Camera(2)),
        ];
        let mut groups = RenderGroups::default();
        let a = groups.find_or_create(&passes, BuildGroup::for_renderer(false, 1, u64::MAX));
        let b = groups.find_or_create(&passes, BuildGroup::for_renderer(false, 1, u64::MAX));
        let c = groups.find_or_create(&passes, BuildGroup::for_renderer(true, 1, u64::MAX));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(groups.passes(a), &[PassId(0), PassId(2)]);
        assert_eq!(groups.passes(c), &[PassId(1)]);
    }

    #[test]
    fn refresh_reaches_new_passes_and_keeps_explicit_groups() {
        let mut passes = vec![pass(RenderPassType::OPAQUE, PassMask::All)];
        let mut groups = RenderGroups::default();
        let keyed = groups.find_or_create(&passes, BuildGroup::for_renderer(false, 1, 1));
        let explicit = groups.create_explicit(vec![PassId(0)]);
        passes.push(pass(RenderPassType::SHADOW_MAP, PassMask::Shadow(1)));
        groups.refresh(&passes);
        assert_eq!(groups.passes(keyed), &[PassId(0), PassId(1)]);
        assert_eq!(groups.passes(explicit), &[PassId(0)]);
    }

    #[test]
    fn renderers_get_groups_by_transparency() {
        let mut graph = RenderGraph::new();
        let node = graph.add_node(RenderNode::primary());
        graph.add_pass(node, pass(RenderPassType::OPAQUE, PassMask::Camera(u64::MAX)));
        graph.add_pass(node, pass(RenderPassType::TRANSPARENT, PassMask::Camera(u64::MAX)));

        let mut world = World::new();
        let glass = world.spawn((SimpleMaterial {
            transparent: true,
            ..SimpleMaterial::default()
        },));
        let stone = world.spawn((LitMaterial::default(),));
        let mesh = world.spawn(());
        let renderer = |material| MeshRenderer {
            mesh,
            material,
            start_index: 0,
            index_count: 3,
        };
        let a = world.spawn((renderer(glass), SimpleMeshRenderer));
        let b = world.spawn((renderer(stone), LitMeshRenderer));

        assert_eq!(assign_render_groups(&mut world, &mut graph), 2);
        let ga = world.get::<&RenderToPasses>(a).expect("assigned").0;
        let gb = world.get::<&RenderToPasses>(b).expect("assigned").0;
        assert_eq!(graph.groups().passes(ga).len(), 1);
        assert_eq!(graph.pass(graph.groups().passes(ga)[0]).pass_type, RenderPassType::TRANSPARENT);
        assert_eq!(graph.pass(graph.groups().passes(gb)[0]).pass_type, RenderPassType::OPAQUE);

        // already assigned renderers are left alone
        assert_eq!(assign_render_groups(&mut world, &mut graph), 0);
    }
}
