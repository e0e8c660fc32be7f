//! Camera capability consumed by the walker.

use glam::{DMat4, DVec2, DVec3};
use meridian_math::{Aabb, PerspectiveCamera};

/// What the walker needs from a camera.
pub trait ViewCamera {
    /// Whether `aabb`, placed by `world`, intersects the view frustum.
    fn is_box_visible(&self, aabb: &Aabb, world: &DMat4) -> bool;

    /// On-screen size of `aabb` in pixels, or `None` if it cannot be projected.
    fn projected_screen_size(&self, aabb: &Aabb, world: &DMat4) -> Option<DVec2>;

    fn distance_to_point(&self, point: DVec3) -> f64;

    /// Pixels per world unit at distance 1 along the view axis.
    fn pre_sse(&self) -> f64;

    fn position(&self) -> DVec3;

    /// Unit view direction.
    fn direction(&self) -> DVec3;
}

impl ViewCamera for PerspectiveCamera {
    fn is_box_visible(&self, aabb: &Aabb, world: &DMat4) -> bool {
        PerspectiveCamera::is_box_visible(self, aabb, world)
    }

    fn projected_screen_size(&self, aabb: &Aabb, world: &DMat4) -> Option<DVec2> {
        PerspectiveCamera::projected_screen_size(self, aabb, world)
    }

    fn distance_to_point(&self, point: DVec3) -> f64 {
        PerspectiveCamera::distance_to_point(self, point)
    }

    fn pre_sse(&self) -> f64 {
        PerspectiveCamera::pre_sse(self)
    }

    fn position(&self) -> DVec3 {
        PerspectiveCamera::position(self)
    }

    fn direction(&self) -> DVec3 {
        PerspectiveCamera::direction(self)
    }
}
