// renderer/graph/schedule.rs
// Per frame view id assignment and backend view setup

use glam::Mat4;
use hecs::World;

use super::{NodeId, PassBinding, PassFlags, RenderGraph, RenderPass};
use crate::error::{RenderError, RenderResult};
use crate::math::color::{linear_to_srgb, pack_color};
use crate::math::projection::backend_projection;
use crate::renderer::backend::{ClearFlags, FramebufferHandle, GraphicsBackend, Rect, ViewId};
use crate::scene::components::{
    Camera, CameraClearFlags, CameraMatrices, CascadeShadowmappedLightCache, LightMatrices,
};
use crate::settings::{ColorSpace, DisplaySettings};

/// View id of a pass no primary node reaches.
pub const UNASSIGNED_VIEW: ViewId = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    Active,
    Done,
}

fn visit(
    graph: &RenderGraph,
    node: NodeId,
    state: &mut [Visit],
    order: &mut Vec<NodeId>,
) -> RenderResult<()> {
    match state[node.index()] {
        Visit::Done => return Ok(()),
        Visit::Active => return Err(RenderError::RenderGraphCycle { node: node.index() }),
        Visit::New => {}
    }
    state[node.index()] = Visit::Active;
    for &dependency in &graph.node(node).dependencies {
        visit(graph, dependency, state, order)?;
    }
    state[node.index()] = Visit::Done;
    order.push(node);
    Ok(())
}

/// Numbers passes in dependency order: every node's dependencies get lower
/// view ids than its own passes. Returns the number of views used.
pub fn assign_view_ids(graph: &mut RenderGraph) -> RenderResult<u16> {
    for pass in graph.passes_mut() {
        pass.view_id = UNASSIGNED_VIEW;
    }
    let mut state = vec![Visit::New; graph.node_count()];
    let mut order = Vec::with_capacity(graph.node_count());
    let primaries: Vec<NodeId> = graph.primary_nodes().collect();
    for node in primaries {
        visit(graph, node, &mut state, &mut order)?;
    }

    // the last id is the unassigned marker
    let reachable: usize = order.iter().map(|&n| graph.node(n).passes.len()).sum();
    if reachable >= usize::from(UNASSIGNED_VIEW) {
        return Err(RenderError::TooManyViews {
            passes: reachable,
            max: usize::from(UNASSIGNED_VIEW),
        });
    }
    let mut next: u16 = 0;
    for node in order {
        let passes = graph.node(node).passes.clone();
        for pass in passes {
            graph.pass_mut(pass).view_id = next;
            next = next.checked_add(1).ok_or(RenderError::TooManyViews {
                passes: reachable,
                max: usize::from(UNASSIGNED_VIEW),
            })?;
        }
    }
    Ok(next)
}

fn display_color(color: glam::Vec4, color_space: ColorSpace) -> u32 {
    match color_space {
        ColorSpace::Gamma => pack_color(linear_to_srgb(color)),
        ColorSpace::Linear => pack_color(color),
    }
}

/// Scales x or y so a texture of `source_aspect` fits the viewport without
/// stretching.
pub fn blit_aspect_transform(source_aspect: f32, viewport: Rect) -> Mat4 {
    let dest_aspect = f32::from(viewport.w) / f32::from(viewport.h.max(1));
    let mut m = Mat4::IDENTITY;
    if dest_aspect <= source_aspect {
        m.x_axis.x = 1.0;
        m.y_axis.y = dest_aspect / source_aspect;
    } else {
        m.x_axis.x = source_aspect / dest_aspect;
        m.y_axis.y = 1.0;
    }
    m
}

fn update_from_binding(
    pass: &mut RenderPass,
    world: &World,
    source_aspect: Option<f32>,
    color_space: ColorSpace,
) {
    match pass.binding {
        PassBinding::Fixed => {}
        PassBinding::Camera {
            camera,
            update_clear,
        } => {
            let Ok(matrices) = world.get::<&CameraMatrices>(camera) else {
                log::debug!("Camera {:?} of a render pass has no matrices", camera);
                return;
            };
            pass.view = matrices.view;
            pass.projection = matrices.projection;
            pass.frustum = matrices.frustum;
            if !update_clear {
                return;
            }
            if let Ok(cam) = world.get::<&Camera>(camera) {
                pass.clear.flags = match cam.clear_flags {
                    CameraClearFlags::SolidColor => ClearFlags::COLOR | ClearFlags::DEPTH,
                    CameraClearFlags::DepthOnly => ClearFlags::DEPTH,
                    CameraClearFlags::Nothing => ClearFlags::empty(),
                };
                pass.clear.rgba = display_color(cam.background_color, color_space);
            }
        }
        PassBinding::Light { light } => {
            if let Ok(matrices) = world.get::<&LightMatrices>(light) {
                pass.view = matrices.view;
                pass.projection = matrices.projection;
                pass.frustum = matrices.frustum;
            }
        }
        PassBinding::Cascade { light, cascade } => {
            if let Ok(cache) = world.get::<&CascadeShadowmappedLightCache>(light) {
                if let Some(data) = cache.cascades.get(cascade) {
                    pass.view = data.view;
                    pass.projection = data.projection;
                    pass.frustum = data.frustum;
                }
            }
        }
        PassBinding::BlitterAutoAspect { .. } => {
            if let Some(aspect) = source_aspect {
                pass.view = blit_aspect_transform(aspect, pass.viewport);
            }
        }
    }
}

/// Assigns view ids, refreshes pass state from its bindings and pushes the
/// full view setup of every pass to the backend.
pub fn prepare_passes(
    graph: &mut RenderGraph,
    world: &World,
    backend: &mut dyn GraphicsBackend,
    settings: &DisplaySettings,
) -> RenderResult<()> {
    assign_view_ids(graph)?;

    let framebuffer_rect = Rect::new(
        0,
        0,
        u16::try_from(settings.framebuffer_width).unwrap_or(u16::MAX),
        u16::try_from(settings.framebuffer_height).unwrap_or(u16::MAX),
    );
    let border = display_color(settings.background_border_color(), settings.color_space);
    let caps = backend.caps();

    let node_info: Vec<(bool, Option<Rect>, FramebufferHandle, Option<f32>)> = graph
        .nodes()
        .map(|(_, node)| {
            let target_rect = node.target.map(|t| t.rect);
            let framebuffer = node
                .target
                .map_or(FramebufferHandle::INVALID, |t| t.framebuffer);
            let aspect = node
                .target
                .and_then(|t| t.color)
                .map(|c| f32::from(c.width) / f32::from(c.height.max(1)));
            (node.primary_surface, target_rect, framebuffer, aspect)
        })
        .collect();

    for (index, pass) in graph.passes_mut().enumerate() {
        let (primary, target_rect, framebuffer, _) = node_info[pass.node.index()];
        if pass.auto_size {
            if primary {
                pass.viewport = framebuffer_rect;
            } else if let Some(rect) = target_rect {
                pass.viewport = rect;
            }
        }

        let source_aspect = match pass.binding {
            PassBinding::BlitterAutoAspect { source } => {
                node_info.get(source.index()).and_then(|info| info.3)
            }
            _ => None,
        };
        update_from_binding(pass, world, source_aspect, settings.color_space);
        if pass.clear_from_border {
            pass.clear.rgba = border;
        }

        if pass.view_id == UNASSIGNED_VIEW {
            return Err(RenderError::OrphanedPass {
                pass: index,
                node: pass.node.index(),
            });
        }

        let render_to_texture = target_rect.is_some();
        pass.flags = if render_to_texture {
            PassFlags::RENDER_TO_TEXTURE
        } else {
            PassFlags::empty()
        };
        let (projection, y_flip) = backend_projection(
            &pass.projection,
            caps.homogeneous_depth,
            caps.origin_bottom_left,
            render_to_texture,
        );
        if y_flip {
            pass.flags |= PassFlags::FLIP_CULLING;
        }

        let view = pass.view_id;
        backend.set_view_transform(view, &pass.view, &projection);
        backend.set_view_mode(view, pass.sort.view_mode());
        backend.set_view_rect(view, pass.viewport);
        backend.set_view_scissor(view, pass.scissor);
        backend.set_view_clear(view, pass.clear);
        backend.set_view_framebuffer(view, framebuffer);
        backend.touch(view);
    }
    Ok(())
}
