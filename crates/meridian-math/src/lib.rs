//! f64 spatial value objects for the Meridian LOD engine: boxes, spheres, geographic
//! extents, frustum planes and a perspective camera.

mod bounds;
mod camera;
mod extent;
mod frustum;

pub use bounds::{Aabb, BoundingSphere};
pub use camera::PerspectiveCamera;
pub use extent::Extent;
pub use frustum::Frustum;
