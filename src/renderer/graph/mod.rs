//! Render graph: nodes are render targets, passes are backend views.
//!
//! Nodes and passes live in arenas owned by `RenderGraph` and are addressed by
//! `NodeId` and `PassId`. The graph is torn down and rebuilt wholesale when the
//! render graph configuration changes; shadow nodes are appended lazily.

pub mod builder;
pub mod groups;
pub mod schedule;
pub mod screen_to_world;

use std::collections::HashMap;

use bitflags::bitflags;
use glam::Mat4;
use hecs::Entity;

use crate::error::RenderResult;
use crate::math::Frustum;
use crate::renderer::backend::{
    ClearFlags, FramebufferHandle, GraphicsBackend, Rect, TextureHandle, ViewClear, ViewId,
    ViewMode,
};
use crate::renderer::lighting::ShadowMapBinding;
use crate::renderer::texture::{render_target_desc, RenderTargetFormat, TextureFlags};

pub use builder::{compute_auto_scale_size, RenderGraphBuilder, WARNING_CLEAR_COLOR};
pub use groups::{assign_render_groups, BuildGroup, GroupId, RenderGroups};
pub use schedule::{assign_view_ids, prepare_passes, UNASSIGNED_VIEW};
pub use screen_to_world::{ScreenToWorld, ScreenToWorldId, ScreenToWorldRoot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(u32);

impl PassId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenderPassType: u32 {
        const Z_ONLY = 1;
        const OPAQUE = 2;
        const TRANSPARENT = 4;
        const UI = 8;
        const FULLSCREEN_QUAD = 16;
        const SHADOW_MAP = 32;
        const SPRITES = 64;
        const DEBUG_OVERLAY = 128;
        const CLEAR = 256;
    }
}

bitflags! {
    /// Pass state that never reaches the backend.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PassFlags: u8 {
        /// Culling flip value handed to `DrawState::with_flipped_culling`.
        const FLIP_CULLING = 0b011;
        const RENDER_TO_TEXTURE = 0b100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassSort {
    #[default]
    Unsorted,
    /// Back to front.
    SortZLess,
    /// Front to back.
    SortZGreater,
    /// Submission order.
    Sorted,
}

impl PassSort {
    pub fn view_mode(self) -> ViewMode {
        match self {
            PassSort::Unsorted => ViewMode::Default,
            PassSort::SortZLess => ViewMode::DepthDescending,
            PassSort::SortZGreater => ViewMode::DepthAscending,
            PassSort::Sorted => ViewMode::Sequential,
        }
    }
}

/// Where a pass takes its transforms from every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassBinding {
    Fixed,
    Camera { camera: Entity, update_clear: bool },
    Light { light: Entity },
    Cascade { light: Entity, cascade: usize },
    /// Aspect fit of the color output of `source` into the pass viewport.
    BlitterAutoAspect { source: NodeId },
}

/// Which renderer mask a pass compares against when render groups are built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMask {
    All,
    Camera(u64),
    Shadow(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderPass {
    pub node: NodeId,
    pub pass_type: RenderPassType,
    pub sort: PassSort,
    pub view: Mat4,
    pub projection: Mat4,
    pub frustum: Frustum,
    pub view_id: ViewId,
    pub viewport: Rect,
    pub scissor: Rect,
    pub clear: ViewClear,
    pub flags: PassFlags,
    pub binding: PassBinding,
    pub mask: PassMask,
    /// Viewport follows the node size.
    pub auto_size: bool,
    /// Clear color follows the display border color.
    pub clear_from_border: bool,
}

impl RenderPass {
    pub fn new(pass_type: RenderPassType, sort: PassSort, viewport: Rect) -> Self {
        Self {
            node: NodeId(0),
            pass_type,
            sort,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            frustum: Frustum::EVERYTHING,
            view_id: schedule::UNASSIGNED_VIEW,
            viewport,
            scissor: Rect::default(),
            clear: ViewClear::default(),
            flags: PassFlags::empty(),
            binding: PassBinding::Fixed,
            mask: PassMask::All,
            auto_size: false,
            clear_from_border: false,
        }
    }

    pub fn with_clear(mut self, flags: ClearFlags, rgba: u32) -> Self {
        self.clear.flags = flags;
        self.clear.rgba = rgba;
        self
    }

    pub fn flip_culling(&self) -> u8 {
        (self.flags & PassFlags::FLIP_CULLING).bits()
    }

    pub fn flip_culling_inverse(&self) -> u8 {
        self.flip_culling() ^ PassFlags::FLIP_CULLING.bits()
    }

    pub fn is_render_to_texture(&self) -> bool {
        self.flags.contains(PassFlags::RENDER_TO_TEXTURE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetTexture {
    pub handle: TextureHandle,
    pub format: RenderTargetFormat,
    pub flags: TextureFlags,
    pub width: u16,
    pub height: u16,
}

/// Offscreen color and depth outputs of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeTarget {
    pub color: Option<TargetTexture>,
    pub depth: Option<TargetTexture>,
    pub rect: Rect,
    pub framebuffer: FramebufferHandle,
}

impl NodeTarget {
    /// Creates the textures and the framebuffer binding them.
    pub fn create(
        backend: &mut dyn GraphicsBackend,
        width: u16,
        height: u16,
        color: Option<(RenderTargetFormat, TextureFlags)>,
        depth: Option<(RenderTargetFormat, TextureFlags)>,
        allow_srgb: bool,
    ) -> RenderResult<Self> {
        let mut create = |desc: Option<(RenderTargetFormat, TextureFlags)>| -> RenderResult<Option<TargetTexture>> {
            let Some((format, flags)) = desc else {
                return Ok(None);
            };
            let desc = render_target_desc(width, height, format, flags, allow_srgb);
            let handle = backend.create_texture_2d(&desc, None)?;
            Ok(Some(TargetTexture {
                handle,
                format,
                flags,
                width,
                height,
            }))
        };
        let color = create(color)?;
        let depth = create(depth)?;
        let attachments: Vec<TextureHandle> =
            color.iter().chain(depth.iter()).map(|t| t.handle).collect();
        let framebuffer = backend.create_framebuffer(&attachments)?;
        Ok(Self {
            color,
            depth,
            rect: Rect::new(0, 0, width, height),
            framebuffer,
        })
    }

    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_framebuffer(self.framebuffer);
        for texture in self.color.iter().chain(self.depth.iter()) {
            backend.destroy_texture(texture.handle);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderNode {
    /// Sink of the graph: scheduling starts here.
    pub primary_surface: bool,
    pub target: Option<NodeTarget>,
    /// Nodes that must render before this one.
    pub dependencies: Vec<NodeId>,
    /// Passes in submission order.
    pub passes: Vec<PassId>,
    /// Light this node renders the shadow map of.
    pub shadow_light: Option<Entity>,
}

impl RenderNode {
    pub fn primary() -> Self {
        Self {
            primary_surface: true,
            ..Self::default()
        }
    }

    pub fn offscreen(target: NodeTarget) -> Self {
        Self {
            target: Some(target),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct RenderGraph {
    nodes: Vec<RenderNode>,
    passes: Vec<RenderPass>,
    roots: Vec<ScreenToWorldRoot>,
    groups: RenderGroups,
    shadow_nodes: HashMap<Entity, NodeId>,
}

impl RenderGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: RenderNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        if let Some(light) = node.shadow_light {
            self.shadow_nodes.insert(light, id);
        }
        self.nodes.push(node);
        id
    }

    /// Appends `pass` to the pass list of `node`.
    pub fn add_pass(&mut self, node: NodeId, mut pass: RenderPass) -> PassId {
        let id = PassId(self.passes.len() as u32);
        pass.node = node;
        self.passes.push(pass);
        self.nodes[node.index()].passes.push(id);
        id
    }

    /// `node` renders after `depends_on`.
    pub fn link(&mut self, node: NodeId, depends_on: NodeId) {
        self.nodes[node.index()].dependencies.push(depends_on);
    }

    pub fn node(&self, id: NodeId) -> &RenderNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut RenderNode {
        &mut self.nodes[id.index()]
    }

    pub fn pass(&self, id: PassId) -> &RenderPass {
        &self.passes[id.index()]
    }

    pub fn pass_mut(&mut self, id: PassId) -> &mut RenderPass {
        &mut self.passes[id.index()]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &RenderNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i as u32), n))
    }

    pub fn passes(&self) -> impl Iterator<Item = (PassId, &RenderPass)> {
        self.passes.iter().enumerate().map(|(i, p)| (PassId(i as u32), p))
    }

    pub(crate) fn passes_mut(&mut self) -> impl Iterator<Item = &mut RenderPass> {
        self.passes.iter_mut()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn primary_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes()
            .filter(|(_, n)| n.primary_surface)
            .map(|(id, _)| id)
    }

    /// First pass of `pass_type` in the pass list of `node`.
    pub fn find_pass_on_node(&self, node: NodeId, pass_type: RenderPassType) -> Option<PassId> {
        self.node(node)
            .passes
            .iter()
            .copied()
            .find(|&p| self.pass(p).pass_type == pass_type)
    }

    pub fn shadow_node(&self, light: Entity) -> Option<NodeId> {
        self.shadow_nodes.get(&light).copied()
    }

    /// Depth texture and size of the shadow map rendered for `light`.
    pub fn shadow_map(&self, light: Entity) -> Option<ShadowMapBinding> {
        let node = self.shadow_node(light)?;
        let depth = self.node(node).target?.depth?;
        Some(ShadowMapBinding {
            texture: depth.handle,
            size: u32::from(depth.width),
        })
    }

    pub fn roots(&self) -> &[ScreenToWorldRoot] {
        &self.roots
    }

    pub fn add_root(&mut self, root: ScreenToWorldRoot) {
        self.roots.push(root);
    }

    pub fn groups(&self) -> &RenderGroups {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut RenderGroups {
        &mut self.groups
    }

    /// Splits the borrow so groups can be rebuilt from the pass table.
    pub(crate) fn groups_and_passes(&mut self) -> (&mut RenderGroups, &[RenderPass]) {
        (&mut self.groups, &self.passes)
    }

    /// Releases every render target and forgets all nodes, passes, roots and groups.
    pub fn teardown(&mut self, backend: &mut dyn GraphicsBackend) {
        for node in &self.nodes {
            if let Some(target) = &node.target {
                target.destroy(backend);
            }
        }
        self.nodes.clear();
        self.passes.clear();
        self.roots.clear();
        self.shadow_nodes.clear();
        self.groups.invalidate_all();
    }
}
