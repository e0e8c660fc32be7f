//! View frustum culling of f64 boxes against view-projection planes.

use glam::{DMat4, DVec3, DVec4};

use crate::Aabb;

const LEFT: usize = 0;
const RIGHT: usize = 1;
const BOTTOM: usize = 2;
const TOP: usize = 3;
const NEAR: usize = 4;
const FAR: usize = 5;

/// A view frustum defined by six inward-pointing planes extracted from a
/// view-projection matrix with a `[0, 1]` depth range.
#[derive(Clone, Debug, PartialEq)]
pub struct Frustum {
    /// Left, right, bottom, top, near, far. `(a, b, c)` is the unit inward
    /// normal and `w` the signed distance term.
    planes: [DVec4; 6],
}

impl Frustum {
    /// Extract frustum planes using the Gribb-Hartmann method.
    pub fn from_view_projection(vp: &DMat4) -> Self {
        let rows = [vp.row(0), vp.row(1), vp.row(2), vp.row(3)];

        let mut planes = [DVec4::ZERO; 6];
        planes[LEFT] = rows[3] + rows[0];
        planes[RIGHT] = rows[3] - rows[0];
        planes[BOTTOM] = rows[3] + rows[1];
        planes[TOP] = rows[3] - rows[1];
        // 0..1 clip depth: near is z >= 0, far is z <= w.
        planes[NEAR] = rows[2];
        planes[FAR] = rows[3] - rows[2];

        for plane in &mut planes {
            let len = plane.truncate().length();
            if len > 0.0 {
                *plane /= len;
            }
        }

        Self { planes }
    }

    pub fn planes(&self) -> &[DVec4; 6] {
        &self.planes
    }

    /// Test whether a box is at least partially inside the frustum.
    ///
    /// p-vertex test: conservative near frustum corners, never rejects a
    /// visible box.
    pub fn intersects_box(&self, aabb: &Aabb) -> bool {
        self.planes.iter().all(|plane| {
            let normal = plane.truncate();
            let p = DVec3::new(
                if normal.x >= 0.0 { aabb.max.x } else { aabb.min.x },
                if normal.y >= 0.0 { aabb.max.y } else { aabb.min.y },
                if normal.z >= 0.0 { aabb.max.z } else { aabb.min.z },
            );
            normal.dot(p) + plane.w >= 0.0
        })
    }

    pub fn contains_point(&self, p: DVec3) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.truncate().dot(p) + plane.w >= 0.0)
    }
}
