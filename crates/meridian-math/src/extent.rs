//! Two-dimensional geographic extents in projected CRS units.

use glam::{DVec2, DVec3};

use crate::Aabb;

/// A rectangular extent on the map plane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Extent {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl Extent {
    pub const fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// True if all bounds are finite and the extent has positive area.
    pub fn is_valid(&self) -> bool {
        [self.west, self.south, self.east, self.north]
            .iter()
            .all(|v| v.is_finite())
            && self.west < self.east
            && self.south < self.north
    }

    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    pub fn center(&self) -> DVec2 {
        DVec2::new(
            (self.west + self.east) * 0.5,
            (self.south + self.north) * 0.5,
        )
    }

    pub fn contains_point(&self, p: DVec2) -> bool {
        p.x >= self.west && p.x <= self.east && p.y >= self.south && p.y <= self.north
    }

    pub fn intersects(&self, other: &Extent) -> bool {
        self.west <= other.east
            && self.east >= other.west
            && self.south <= other.north
            && self.north >= other.south
    }

    /// Planar distance from `p` to the extent; 0 inside.
    pub fn distance_to_point(&self, p: DVec2) -> f64 {
        let clamped = DVec2::new(
            p.x.clamp(self.west, self.east),
            p.y.clamp(self.south, self.north),
        );
        (clamped - p).length()
    }

    /// Split into four equal quadrants ordered
    /// \[south-west, south-east, north-west, north-east\].
    pub fn split(&self) -> [Extent; 4] {
        let c = self.center();
        [
            Extent::new(self.west, self.south, c.x, c.y),
            Extent::new(c.x, self.south, self.east, c.y),
            Extent::new(self.west, c.y, c.x, self.north),
            Extent::new(c.x, c.y, self.east, self.north),
        ]
    }

    /// Extrude the extent into a box spanning `min_z..=max_z`.
    pub fn to_aabb(&self, min_z: f64, max_z: f64) -> Aabb {
        Aabb::new(
            DVec3::new(self.west, self.south, min_z),
            DVec3::new(self.east, self.north, max_z),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_quadrants_cover_parent() {
        let extent = Extent::new(0.0, 0.0, 100.0, 50.0);
        let [sw, se, nw, ne] = extent.split();
        assert_eq!(sw, Extent::new(0.0, 0.0, 50.0, 25.0));
        assert_eq!(se, Extent::new(50.0, 0.0, 100.0, 25.0));
        assert_eq!(nw, Extent::new(0.0, 25.0, 50.0, 50.0));
        assert_eq!(ne, Extent::new(50.0, 25.0, 100.0, 50.0));
        let area: f64 = extent.split().iter().map(|e| e.width() * e.height()).sum();
        assert_eq!(area, extent.width() * extent.height());
    }

    #[test]
    fn test_contains_and_distance() {
        let extent = Extent::new(-10.0, -10.0, 10.0, 10.0);
        assert!(extent.contains_point(DVec2::ZERO));
        assert!(extent.contains_point(DVec2::new(10.0, -10.0)));
        assert!(!extent.contains_point(DVec2::new(10.1, 0.0)));
        assert_eq!(extent.distance_to_point(DVec2::ZERO), 0.0);
        assert!((extent.distance_to_point(DVec2::new(13.0, 14.0)) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_extent_is_invalid() {
        assert!(!Extent::new(0.0, 0.0, 0.0, 1.0).is_valid());
        assert!(!Extent::new(0.0, 0.0, f64::INFINITY, 1.0).is_valid());
        assert!(Extent::new(0.0, 0.0, 1.0, 1.0).is_valid());
    }

    #[test]
    fn test_to_aabb() {
        let aabb = Extent::new(0.0, 1.0, 2.0, 3.0).to_aabb(-5.0, 5.0);
        assert_eq!(aabb.min, DVec3::new(0.0, 1.0, -5.0));
        assert_eq!(aabb.max, DVec3::new(2.0, 3.0, 5.0));
    }
}
