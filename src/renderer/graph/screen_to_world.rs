//! Pixel and world space mapping through the passes of a render graph.
//!
//! A root names the pass whose viewport the pixels live in. Its chain lists
//! the passes the picture went through before that, so in offscreen modes
//! picking goes through the blit first and then through the camera pass.

use glam::{Vec2, Vec3, Vec4, Vec4Swizzles};
use hecs::{Entity, World};

use super::{PassBinding, PassId, RenderGraph, RenderPass};
use crate::error::{RenderError, RenderResult};
use crate::scene::components::LocalToWorld;
use crate::settings::DisplaySettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScreenToWorldId {
    MainCamera,
    UILayer,
    DebugLayer,
    Sprites,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenToWorldRoot {
    pub id: ScreenToWorldId,
    /// Pass the viewport transform is taken from.
    pub pass: PassId,
    /// Applied in order when going from screen to world.
    pub chain: Vec<PassId>,
}

/// Forward pass transform followed by the perspective divide.
pub fn pass_transform(pos: Vec4, pass: &RenderPass) -> Vec4 {
    let p = pass.projection * (pass.view * pos);
    p / p.w
}

pub fn inverse_pass_transform(pos: Vec4, pass: &RenderPass) -> Vec4 {
    let pos = pos * pos.w;
    let p = pass.projection.inverse() * pos;
    pass.view.inverse() * p
}

/// Normalized device xy to pixels.
pub fn viewport_transform(p: Vec2, pass: &RenderPass) -> Vec2 {
    let vp = pass.viewport;
    (p + Vec2::ONE) * 0.5 * Vec2::new(f32::from(vp.w), f32::from(vp.h))
        + Vec2::new(f32::from(vp.x), f32::from(vp.y))
}

pub fn inverse_viewport_transform(p: Vec2, pass: &RenderPass) -> Vec2 {
    let vp = pass.viewport;
    let p = (p - Vec2::new(f32::from(vp.x), f32::from(vp.y)))
        / Vec2::new(f32::from(vp.w.max(1)), f32::from(vp.h.max(1)));
    p * 2.0 - Vec2::ONE
}

fn intersect_plane_ray(plane_pos: Vec3, plane_normal: Vec3, origin: Vec3, direction: Vec3) -> Vec3 {
    let t = plane_normal.dot(plane_pos - origin) / plane_normal.dot(direction);
    origin + t * direction
}

/// Query object over the prepared passes of one frame.
pub struct ScreenToWorld<'a> {
    graph: &'a RenderGraph,
    world: &'a World,
    framebuffer: Vec2,
    window: Vec2,
}

impl<'a> ScreenToWorld<'a> {
    pub fn new(graph: &'a RenderGraph, world: &'a World, settings: &DisplaySettings) -> Self {
        Self {
            graph,
            world,
            framebuffer: Vec2::new(
                settings.framebuffer_width as f32,
                settings.framebuffer_height as f32,
            ),
            window: Vec2::new(settings.width.max(1) as f32, settings.height.max(1) as f32),
        }
    }

    fn root(&self, id: ScreenToWorldId) -> RenderResult<&'a ScreenToWorldRoot> {
        let mut found = self.graph.roots().iter().filter(|r| r.id == id);
        let root = found
            .next()
            .ok_or_else(|| RenderError::ScreenToWorldRoot(format!("no root for {id:?}")))?;
        if found.next().is_some() {
            return Err(RenderError::ScreenToWorldRoot(format!(
                "multiple roots for {id:?}"
            )));
        }
        Ok(root)
    }

    /// Points (window units) to pixels. They differ on high dpi displays.
    pub fn input_pos_to_pixels(&self, input: Vec2) -> Vec2 {
        input * (self.framebuffer / self.window)
    }

    /// xy in pixels, z in normalized device depth.
    pub fn world_to_screen(&self, world_pos: Vec3, id: ScreenToWorldId) -> RenderResult<Vec3> {
        let root = self.root(id)?;
        let mut p = world_pos.extend(1.0);
        for &pass in root.chain.iter().rev() {
            p = pass_transform(p, self.graph.pass(pass));
        }
        let pass = self.graph.pass(root.pass);
        p = pass_transform(p, pass);
        let xy = viewport_transform(p.xy(), pass);
        Ok(xy.extend(p.z))
    }

    /// `ndc_z` is -1 at the near plane and 1 at the far plane.
    pub fn screen_to_world(
        &self,
        pixel: Vec2,
        ndc_z: f32,
        id: ScreenToWorldId,
    ) -> RenderResult<Vec3> {
        let root = self.root(id)?;
        let pass = self.graph.pass(root.pass);
        let ndc = inverse_viewport_transform(pixel, pass);
        let mut p = inverse_pass_transform(Vec4::new(ndc.x, ndc.y, ndc_z, 1.0), pass);
        for &chained in &root.chain {
            p = inverse_pass_transform(p, self.graph.pass(chained));
        }
        Ok((p / p.w).xyz())
    }

    /// World space ray through a pixel. The direction is zero when the pixel
    /// maps to a single point.
    pub fn screen_to_world_ray(
        &self,
        pixel: Vec2,
        id: ScreenToWorldId,
    ) -> RenderResult<(Vec3, Vec3)> {
        let origin = self.screen_to_world(pixel, 0.0, id)?;
        let toward = self.screen_to_world(pixel, -1.0, id)?;
        Ok((origin, (toward - origin).normalize_or_zero()))
    }

    /// Camera bound to the root pass or, failing that, to the first chained
    /// pass that has one.
    pub fn find_camera(&self, id: ScreenToWorldId) -> RenderResult<Option<Entity>> {
        let root = self.root(id)?;
        let camera = std::iter::once(root.pass)
            .chain(root.chain.iter().copied())
            .find_map(|p| match self.graph.pass(p).binding {
                PassBinding::Camera { camera, .. } => Some(camera),
                _ => None,
            });
        Ok(camera)
    }

    /// Plane `distance` units in front of the camera, which looks along its
    /// local -z: position, up, left.
    pub fn camera_plane(&self, camera: Entity, distance: f32) -> (Vec3, Vec3, Vec3) {
        match self.world.get::<&LocalToWorld>(camera) {
            Ok(ltw) => {
                let m = ltw.0;
                (
                    m.w_axis.xyz() - m.z_axis.xyz() * distance,
                    m.y_axis.xyz(),
                    m.x_axis.xyz(),
                )
            }
            Err(_) => (Vec3::ZERO, Vec3::Y, Vec3::X),
        }
    }

    /// Point where the ray through `pixel` meets the camera plane at `distance`.
    pub fn screen_to_world_pos(
        &self,
        pixel: Vec2,
        distance: f32,
        id: ScreenToWorldId,
    ) -> RenderResult<Vec3> {
        let (origin, direction) = self.screen_to_world_ray(pixel, id)?;
        let camera = self.find_camera(id)?.ok_or_else(|| {
            RenderError::ScreenToWorldRoot(format!("no camera behind {id:?}"))
        })?;
        let (pos, up, left) = self.camera_plane(camera, distance);
        Ok(intersect_plane_ray(pos, up.cross(left), origin, direction))
    }

    pub fn input_pos_to_world_ray(
        &self,
        input: Vec2,
        id: ScreenToWorldId,
    ) -> RenderResult<(Vec3, Vec3)> {
        self.screen_to_world_ray(self.input_pos_to_pixels(input), id)
    }

    pub fn input_pos_to_world_pos(
        &self,
        input: Vec2,
        distance: f32,
        id: ScreenToWorldId,
    ) -> RenderResult<Vec3> {
        self.screen_to_world_pos(self.input_pos_to_pixels(input), distance, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::Rect;
    use crate::renderer::graph::{PassSort, RenderNode, RenderPassType};
    use glam::Mat4;

    const EPSILON: f32 = 1e-4;

    #[test]
    fn viewport_round_trips_through_offset_rect() {
        let pass = RenderPass::new(RenderPassType::UI, PassSort::Sorted, Rect::new(10, 20, 200, 100));
        let pixel = viewport_transform(Vec2::new(0.5, -0.5), &pass);
        assert!((pixel - Vec2::new(160.0, 45.0)).length() < EPSILON);
        let ndc = inverse_viewport_transform(pixel, &pass);
        assert!((ndc - Vec2::new(0.5, -0.5)).length() < EPSILON);
    }

    #[test]
    fn missing_and_duplicate_roots_are_errors() {
        let mut graph = RenderGraph::new();
        let node = graph.add_node(RenderNode::primary());
        let pass = graph.add_pass(
            node,
            RenderPass::new(RenderPassType::UI, PassSort::Sorted, Rect::new(0, 0, 4, 4)),
        );
        let world = World::new();
        let settings = DisplaySettings::default();
        {
            let query = ScreenToWorld::new(&graph, &world, &settings);
            assert!(query.world_to_screen(Vec3::ZERO, ScreenToWorldId::UILayer).is_err());
        }
        for _ in 0..2 {
            graph.add_root(ScreenToWorldRoot {
                id: ScreenToWorldId::UILayer,
                pass,
                chain: Vec::new(),
            });
        }
        let query = ScreenToWorld::new(&graph, &world, &settings);
        let err = query.world_to_screen(Vec3::ZERO, ScreenToWorldId::UILayer).unwrap_err();
        assert!(matches!(err, RenderError::ScreenToWorldRoot(_)));
    }

    #[test]
    fn orthographic_center_maps_to_viewport_center() {
        let mut graph = RenderGraph::new();
        let node = graph.add_node(RenderNode::primary());
        let pass = graph.add_pass(
            node,
            RenderPass {
                projection: Mat4::orthographic_rh_gl(-2.0, 2.0, -1.0, 1.0, 0.1, 10.0),
                ..RenderPass::new(RenderPassType::OPAQUE, PassSort::Unsorted, Rect::new(0, 0, 400, 200))
            },
        );
        graph.add_root(ScreenToWorldRoot {
            id: ScreenToWorldId::MainCamera,
            pass,
            chain: Vec::new(),
        });
        let world = World::new();
        let settings = DisplaySettings::default();
        let query = ScreenToWorld::new(&graph, &world, &settings);
        let screen = query
            .world_to_screen(Vec3::new(1.0, 0.5, -1.0), ScreenToWorldId::MainCamera)
            .expect("root");
        assert!((screen.x - 300.0).abs() < EPSILON);
        assert!((screen.y - 150.0).abs() < EPSILON);

        let (origin, dir) = query
            .screen_to_world_ray(Vec2::new(200.0, 100.0), ScreenToWorldId::MainCamera)
            .expect("root");
        assert!(origin.truncate().length() < EPSILON);
        assert!((dir - Vec3::Z).length() < EPSILON);
    }

    #[test]
    fn input_points_scale_to_pixels() {
        let graph = RenderGraph::new();
        let world = World::new();
        let mut settings = DisplaySettings::default();
        settings.width = 100;
        settings.height = 50;
        settings.framebuffer_width = 200;
        settings.framebuffer_height = 100;
        let query = ScreenToWorld::new(&graph, &world, &settings);
        assert_eq!(query.input_pos_to_pixels(Vec2::new(10.0, 5.0)), Vec2::new(20.0, 10.0));
    }
}
