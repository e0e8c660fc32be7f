//! Concrete tree adapters: point-cloud octrees, 3D tile trees, and feature quadtrees.

pub mod features;
pub mod point_cloud;
pub mod tiles3d;

pub use features::{FeatureAdapter, FeatureNodeData, FeatureSource, passes_subdivision_thresholds};
pub use point_cloud::{PointCloudAdapter, PointCloudSource, PointNodeData};
pub use tiles3d::{TileContent, TileData, TilesetAdapter, TilesetDocument};
