//! Perspective camera with cached view-projection, frustum and SSE factor.

use glam::{DMat4, DVec2, DVec3, DVec4};

use crate::{Aabb, Frustum};

/// Minimum clip-space `w` for a corner to count as in front of the camera.
const MIN_CLIP_W: f64 = 1e-9;

/// A right-handed perspective camera.
///
/// Derived matrices are recomputed by every setter so the read accessors are
/// cheap during the per-frame tree walk.
#[derive(Clone, Debug)]
pub struct PerspectiveCamera {
    position: DVec3,
    direction: DVec3,
    up: DVec3,
    /// Vertical field of view in radians.
    fov_y: f64,
    near: f64,
    far: f64,
    /// Viewport size in pixels.
    viewport: DVec2,
    view_projection: DMat4,
    frustum: Frustum,
    pre_sse: f64,
}

impl PerspectiveCamera {
    pub fn new(fov_y: f64, viewport: DVec2, near: f64, far: f64) -> Self {
        let mut camera = Self {
            position: DVec3::ZERO,
            direction: DVec3::NEG_Z,
            up: DVec3::Y,
            fov_y,
            near,
            far,
            viewport,
            view_projection: DMat4::IDENTITY,
            frustum: Frustum::from_view_projection(&DMat4::IDENTITY),
            pre_sse: 0.0,
        };
        camera.refresh();
        camera
    }

    /// Place the camera at `position` looking at `target`.
    pub fn look_at(&mut self, position: DVec3, target: DVec3, up: DVec3) {
        self.position = position;
        self.direction = (target - position).try_normalize().unwrap_or(DVec3::NEG_Z);
        self.up = up;
        self.refresh();
    }

    pub fn set_viewport(&mut self, viewport: DVec2) {
        self.viewport = viewport;
        self.refresh();
    }

    fn refresh(&mut self) {
        let aspect = if self.viewport.y > 0.0 {
            self.viewport.x / self.viewport.y
        } else {
            1.0
        };
        let view = DMat4::look_to_rh(self.position, self.direction, self.up);
        let proj = DMat4::perspective_rh(self.fov_y, aspect, self.near, self.far);
        self.view_projection = proj * view;
        self.frustum = Frustum::from_view_projection(&self.view_projection);
        self.pre_sse = self.viewport.y / (2.0 * (self.fov_y * 0.5).tan());
    }

    pub fn position(&self) -> DVec3 {
        self.position
    }

    /// Unit view direction.
    pub fn direction(&self) -> DVec3 {
        self.direction
    }

    pub fn viewport(&self) -> DVec2 {
        self.viewport
    }

    pub fn view_projection(&self) -> &DMat4 {
        &self.view_projection
    }

    pub fn frustum(&self) -> &Frustum {
        &self.frustum
    }

    /// Pixels per world unit at distance 1: `viewport_height / (2 tan(fov/2))`.
    pub fn pre_sse(&self) -> f64 {
        self.pre_sse
    }

    pub fn distance_to_point(&self, p: DVec3) -> f64 {
        (p - self.position).length()
    }

    /// True if the box, placed in the world by `world`, intersects the frustum.
    pub fn is_box_visible(&self, aabb: &Aabb, world: &DMat4) -> bool {
        self.frustum.intersects_box(&aabb.transformed(world))
    }

    /// Project a world point to pixel coordinates (origin top-left).
    ///
    /// Returns `None` for points at or behind the camera plane.
    pub fn project_point(&self, p: DVec3) -> Option<DVec2> {
        let clip = self.view_projection * DVec4::new(p.x, p.y, p.z, 1.0);
        if clip.w <= MIN_CLIP_W {
            return None;
        }
        let ndc = clip.truncate() / clip.w;
        Some(DVec2::new(
            (ndc.x + 1.0) * 0.5 * self.viewport.x,
            (1.0 - ndc.y) * 0.5 * self.viewport.y,
        ))
    }

    /// Pixel size of the screen-space rectangle enclosing the projected box.
    ///
    /// Returns `None` when any corner lies at or behind the camera plane, in
    /// which case the projected size is undefined.
    pub fn projected_screen_size(&self, aabb: &Aabb, world: &DMat4) -> Option<DVec2> {
        let mut min = DVec2::splat(f64::INFINITY);
        let mut max = DVec2::splat(f64::NEG_INFINITY);
        for corner in aabb.transformed(world).corners() {
            let px = self.project_point(corner)?;
            min = min.min(px);
            max = max.max(px);
        }
        Some(max - min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> PerspectiveCamera {
        let mut camera =
            PerspectiveCamera::new(std::f64::consts::FRAC_PI_2, DVec2::new(800.0, 600.0), 0.1, 1e5);
        camera.look_at(DVec3::new(0.0, 0.0, 100.0), DVec3::ZERO, DVec3::Y);
        camera
    }

    /// With a 90° vertical fov the SSE factor is half the viewport height.
    #[test]
    fn test_pre_sse() {
        assert!((camera().pre_sse() - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_project_center() {
        let px = camera().project_point(DVec3::ZERO).unwrap();
        assert!((px.x - 400.0).abs() < 1e-6);
        assert!((px.y - 300.0).abs() < 1e-6);
        assert!(camera().project_point(DVec3::new(0.0, 0.0, 200.0)).is_none());
    }

    /// A box of height 20 at distance ~100 covers ~pre_sse * 20 / 100 pixels.
    #[test]
    fn test_projected_screen_size() {
        let aabb = Aabb::new(DVec3::new(-10.0, -10.0, 0.0), DVec3::new(10.0, 10.0, 0.0));
        let size = camera().projected_screen_size(&aabb, &DMat4::IDENTITY).unwrap();
        assert!((size.y - 60.0).abs() < 1e-6, "{size:?}");
        assert!((size.x - 60.0).abs() < 1e-6, "{size:?}");
    }

    #[test]
    fn test_box_behind_camera_has_no_projected_size() {
        let aabb = Aabb::new(DVec3::new(-1.0, -1.0, 90.0), DVec3::new(1.0, 1.0, 110.0));
        assert!(camera().projected_screen_size(&aabb, &DMat4::IDENTITY).is_none());
    }

    #[test]
    fn test_visibility_uses_world_matrix() {
        let cam = camera();
        let aabb = Aabb::new(DVec3::splat(-1.0), DVec3::splat(1.0));
        assert!(cam.is_box_visible(&aabb, &DMat4::IDENTITY));
        let behind = DMat4::from_translation(DVec3::new(0.0, 0.0, 500.0));
        assert!(!cam.is_box_visible(&aabb, &behind));
    }
}
