//! Fixtures shared by unit tests.

use std::time::Instant;

use glam::{DMat4, DVec2, DVec3};
use meridian_math::Aabb;

use crate::camera::ViewCamera;
use crate::change::ChangeSource;
use crate::request_queue::PriorityRequestQueue;
use crate::walker::{FrameContext, LodEntity};

/// Camera that sees every box intersecting `view`.
pub(crate) struct StaticCamera {
    pub view: Aabb,
    pub position: DVec3,
    pub pre_sse: f64,
    pub projected: Option<DVec2>,
}

impl StaticCamera {
    pub fn seeing(view: Aabb) -> Self {
        Self {
            view,
            position: DVec3::new(0.0, 0.0, 100.0),
            pre_sse: 1000.0,
            projected: None,
        }
    }
}

impl ViewCamera for StaticCamera {
    fn is_box_visible(&self, aabb: &Aabb, world: &DMat4) -> bool {
        aabb.transformed(world).intersects(&self.view)
    }

    fn projected_screen_size(&self, _aabb: &Aabb, _world: &DMat4) -> Option<DVec2> {
        self.projected
    }

    fn distance_to_point(&self, point: DVec3) -> f64 {
        (point - self.position).length()
    }

    fn pre_sse(&self) -> f64 {
        self.pre_sse
    }

    fn position(&self) -> DVec3 {
        self.position
    }

    fn direction(&self) -> DVec3 {
        DVec3::NEG_Z
    }
}

/// Run one frame the way the driver does. Returns the number of visited nodes.
pub(crate) fn run_frame(
    entity: &mut dyn LodEntity,
    queue: &PriorityRequestQueue,
    camera: &dyn ViewCamera,
    now: Instant,
    changes: &[ChangeSource],
) -> usize {
    let mut all = changes.to_vec();
    all.extend(entity.process_completions(now));
    let ctx = FrameContext { camera, now };
    let mut stack = entity.pre_update(&ctx, &all);
    stack.reverse();
    let mut visited = 0;
    while let Some(id) = stack.pop() {
        visited += 1;
        let mut children = entity.update(&ctx, id);
        children.reverse();
        stack.extend(children);
    }
    entity.post_update(&ctx);
    queue.pump();
    visited
}
