//! Axis-aligned boxes and bounding spheres in f64 space.

use glam::{DMat4, DVec3};

/// An axis-aligned bounding box in f64 space.
///
/// Invariant: `min <= max` on every axis for a valid box. [`Aabb::new`] sorts
/// its corners; [`Aabb::from_min_max`] does not, so callers that build boxes
/// from untrusted data should check [`Aabb::is_valid`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    /// Minimum corner.
    pub min: DVec3,
    /// Maximum corner.
    pub max: DVec3,
}

impl Aabb {
    /// Create a box from two arbitrary corners, sorting components so that
    /// `min <= max` on every axis.
    pub fn new(a: DVec3, b: DVec3) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    /// Create a box from explicit min/max corners without reordering.
    pub const fn from_min_max(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    /// Create a box from a center point and half-extents.
    pub fn from_center_half_extents(center: DVec3, half: DVec3) -> Self {
        Self {
            min: center - half,
            max: center + half,
        }
    }

    /// Smallest box enclosing every point, or `None` for an empty iterator.
    pub fn from_points<I: IntoIterator<Item = DVec3>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut aabb = Self::from_min_max(first, first);
        for p in iter {
            aabb.expand_to_point(p);
        }
        Some(aabb)
    }

    /// True if every component is finite and `min <= max` on every axis.
    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min.cmple(self.max).all()
    }

    /// True if the box has zero extent on at least one axis.
    pub fn is_degenerate(&self) -> bool {
        self.min.x == self.max.x || self.min.y == self.max.y || self.min.z == self.max.z
    }

    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    pub fn half_extents(&self) -> DVec3 {
        self.size() * 0.5
    }

    /// Returns true if the point lies inside or on the boundary.
    pub fn contains_point(&self, p: DVec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    /// Returns true if `other` lies entirely inside this box (boundaries included).
    pub fn contains_box(&self, other: &Aabb) -> bool {
        self.contains_point(other.min) && self.contains_point(other.max)
    }

    /// Returns true if the boxes overlap, touching faces included.
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    /// Smallest box enclosing both boxes.
    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Grow the box so it contains `p`.
    pub fn expand_to_point(&mut self, p: DVec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// Euclidean distance from `p` to the closest point of the box; 0 inside.
    pub fn distance_to_point(&self, p: DVec3) -> f64 {
        (p.clamp(self.min, self.max) - p).length()
    }

    /// Length of the box projected onto the (normalized) direction `dir`.
    pub fn extent_along(&self, dir: DVec3) -> f64 {
        let size = self.size();
        (size.x * dir.x).abs() + (size.y * dir.y).abs() + (size.z * dir.z).abs()
    }

    /// The eight corners, indexed so that bit 2 selects max x, bit 1 max y and
    /// bit 0 max z.
    pub fn corners(&self) -> [DVec3; 8] {
        std::array::from_fn(|i| {
            DVec3::new(
                if i & 0b100 != 0 { self.max.x } else { self.min.x },
                if i & 0b010 != 0 { self.max.y } else { self.min.y },
                if i & 0b001 != 0 { self.max.z } else { self.min.z },
            )
        })
    }

    /// The octant sub-box with the given child index (0..8).
    ///
    /// Each axis is halved; bit 2 of `index` selects the upper x half, bit 1
    /// the upper y half and bit 0 the upper z half.
    pub fn octant(&self, index: u8) -> Aabb {
        let center = self.center();
        let mut min = self.min;
        let mut max = center;
        if index & 0b100 != 0 {
            min.x = center.x;
            max.x = self.max.x;
        }
        if index & 0b010 != 0 {
            min.y = center.y;
            max.y = self.max.y;
        }
        if index & 0b001 != 0 {
            min.z = center.z;
            max.z = self.max.z;
        }
        Aabb { min, max }
    }

    /// Axis-aligned box enclosing this box after transformation by `matrix`.
    pub fn transformed(&self, matrix: &DMat4) -> Aabb {
        if *matrix == DMat4::IDENTITY {
            return *self;
        }
        let corners = self.corners();
        let mut out = Aabb::from_min_max(
            matrix.transform_point3(corners[0]),
            matrix.transform_point3(corners[0]),
        );
        for c in &corners[1..] {
            out.expand_to_point(matrix.transform_point3(*c));
        }
        out
    }

    pub fn bounding_sphere(&self) -> BoundingSphere {
        BoundingSphere {
            center: self.center(),
            radius: self.half_extents().length(),
        }
    }
}

/// A bounding sphere in f64 space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingSphere {
    /// Center of the sphere.
    pub center: DVec3,
    /// Radius of the sphere.
    pub radius: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box() -> Aabb {
        Aabb::new(DVec3::ZERO, DVec3::splat(10.0))
    }

    #[test]
    fn test_new_sorts_corners() {
        let aabb = Aabb::new(DVec3::new(5.0, -1.0, 3.0), DVec3::new(-5.0, 1.0, -3.0));
        assert_eq!(aabb.min, DVec3::new(-5.0, -1.0, -3.0));
        assert_eq!(aabb.max, DVec3::new(5.0, 1.0, 3.0));
        assert!(aabb.is_valid());
    }

    #[test]
    fn test_inverted_box_is_invalid() {
        let aabb = Aabb::from_min_max(DVec3::splat(1.0), DVec3::ZERO);
        assert!(!aabb.is_valid());
        let nan = Aabb::from_min_max(DVec3::ZERO, DVec3::new(f64::NAN, 1.0, 1.0));
        assert!(!nan.is_valid());
    }

    #[test]
    fn test_distance_to_point() {
        let aabb = unit_box();
        assert_eq!(aabb.distance_to_point(DVec3::splat(5.0)), 0.0);
        assert!((aabb.distance_to_point(DVec3::new(13.0, 14.0, 5.0)) - 5.0).abs() < 1e-12);
    }

    /// Octants tile the parent box exactly, with the index bits selecting halves.
    #[test]
    fn test_octants_partition_parent() {
        let aabb = unit_box();
        let o0 = aabb.octant(0);
        assert_eq!(o0, Aabb::new(DVec3::ZERO, DVec3::splat(5.0)));
        let o7 = aabb.octant(7);
        assert_eq!(o7, Aabb::new(DVec3::splat(5.0), DVec3::splat(10.0)));
        let o4 = aabb.octant(0b100);
        assert_eq!(o4.min, DVec3::new(5.0, 0.0, 0.0));
        assert_eq!(o4.max, DVec3::new(10.0, 5.0, 5.0));

        let total: f64 = (0..8)
            .map(|i| {
                let s = aabb.octant(i).size();
                s.x * s.y * s.z
            })
            .sum();
        assert!((total - 1000.0).abs() < 1e-9);
        for i in 0..8 {
            assert!(aabb.contains_box(&aabb.octant(i)));
        }
    }

    #[test]
    fn test_intersects_and_union() {
        let a = unit_box();
        let b = Aabb::new(DVec3::splat(5.0), DVec3::splat(15.0));
        let c = Aabb::new(DVec3::splat(20.0), DVec3::splat(30.0));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert_eq!(a.union(&c), Aabb::new(DVec3::ZERO, DVec3::splat(30.0)));
    }

    #[test]
    fn test_extent_along_axis() {
        let aabb = Aabb::new(DVec3::ZERO, DVec3::new(2.0, 4.0, 0.0));
        assert_eq!(aabb.extent_along(DVec3::Y), 4.0);
        assert_eq!(aabb.extent_along(DVec3::Z), 0.0);
        assert!(aabb.is_degenerate());
    }

    #[test]
    fn test_transformed_by_translation() {
        let aabb = unit_box();
        let moved = aabb.transformed(&DMat4::from_translation(DVec3::new(1.0, 2.0, 3.0)));
        assert_eq!(moved.min, DVec3::new(1.0, 2.0, 3.0));
        assert_eq!(moved.max, DVec3::new(11.0, 12.0, 13.0));
    }

    #[test]
    fn test_from_points() {
        assert!(Aabb::from_points(std::iter::empty()).is_none());
        let aabb = Aabb::from_points([DVec3::new(1.0, 5.0, -2.0), DVec3::new(-1.0, 0.0, 4.0)])
            .unwrap();
        assert_eq!(aabb.min, DVec3::new(-1.0, 0.0, -2.0));
        assert_eq!(aabb.max, DVec3::new(1.0, 5.0, 4.0));
    }
}
