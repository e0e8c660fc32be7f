//! Feature quadtree adapter.
//!
//! Vector features are served as a tile pyramid over a planar extent. A
//! tile subdivides when its projected footprint is large enough on screen,
//! and its four children replace it once they are loaded.

use glam::DVec2;
use meridian_config::{Config, FeaturesConfig};
use meridian_math::Extent;

use crate::adapter::{ChildSource, ChildSpec, ContentRequest, Refinement, TreeAdapter, ViewContext};
use crate::change::EntityId;
use crate::collab::{GeometryKind, SchemaHint};
use crate::error::LodError;
use crate::node::{NodeKey, SpatialNode, SpatialTree, TileCoord};
use crate::walker::{EntityOptions, EntityServices, SpatialEntity};

/// Description of a feature layer.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureSource {
    pub base_url: String,
    pub extent: Extent,
    /// Vertical span given to every tile's box.
    pub min_z: f64,
    pub max_z: f64,
}

/// Per-node data of a feature quadtree.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FeatureNodeData {
    pub extent: Extent,
}

/// Whether a tile projected to `size` pixels needs its children.
///
/// The larger axis must exceed `lower`, and both axes must exceed `upper`,
/// so long thin tiles seen edge-on do not split.
#[must_use]
pub fn passes_subdivision_thresholds(size: DVec2, lower: f64, upper: f64) -> bool {
    let above_upper = usize::from(size.x > upper) + usize::from(size.y > upper);
    size.x.max(size.y) > lower && above_upper >= 2
}

/// Quadtree behaviour for feature layers.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureAdapter {
    base_url: String,
    lower_px: f64,
    upper_px: f64,
    min_z: f64,
    max_z: f64,
}

impl FeatureAdapter {
    pub fn new(source: &FeatureSource, config: &FeaturesConfig) -> Result<Self, LodError> {
        if source.base_url.is_empty() {
            return Err(LodError::MissingOption("base_url"));
        }
        let heights_valid =
            source.min_z.is_finite() && source.max_z.is_finite() && source.min_z <= source.max_z;
        if !source.extent.is_valid() || !heights_valid {
            return Err(LodError::InvalidBounds {
                context: format!("feature layer {}", source.base_url),
            });
        }
        Ok(Self {
            base_url: source.base_url.trim_end_matches('/').to_string(),
            lower_px: config.subdivision_lower_px,
            upper_px: config.subdivision_upper_px,
            min_z: source.min_z,
            max_z: source.max_z,
        })
    }

    #[must_use]
    pub fn thresholds(&self) -> (f64, f64) {
        (self.lower_px, self.upper_px)
    }
}

impl TreeAdapter for FeatureAdapter {
    type Data = FeatureNodeData;

    fn kind_name(&self) -> &'static str {
        "features"
    }

    /// Larger axis of the projected footprint, infinite when the tile cannot
    /// be projected.
    fn screen_space_error(&self, node: &SpatialNode<FeatureNodeData>, view: &ViewContext<'_>) -> f64 {
        view.camera
            .projected_screen_size(&node.bounding_volume(), view.world)
            .map_or(f64::INFINITY, |size| size.x.max(size.y))
    }

    fn should_subdivide(
        &self,
        node: &SpatialNode<FeatureNodeData>,
        view: &ViewContext<'_>,
        _sse: f64,
    ) -> bool {
        view.camera
            .projected_screen_size(&node.bounding_volume(), view.world)
            .is_none_or(|size| passes_subdivision_thresholds(size, self.lower_px, self.upper_px))
    }

    fn children(&self, node: &SpatialNode<FeatureNodeData>) -> ChildSource<FeatureNodeData> {
        let NodeKey::Tile(coord) = node.key() else {
            return ChildSource::Leaf;
        };
        let specs: Option<Vec<_>> = node
            .data
            .extent
            .split()
            .into_iter()
            .zip(0u8..)
            .map(|(extent, quadrant)| {
                Some(ChildSpec {
                    key: NodeKey::Tile(coord.checked_child(quadrant)?),
                    bounds: extent.to_aabb(self.min_z, self.max_z),
                    data: FeatureNodeData { extent },
                })
            })
            .collect();
        specs.map_or(ChildSource::Leaf, ChildSource::Ready)
    }

    fn parse_children(
        &self,
        _node: &SpatialNode<FeatureNodeData>,
        _document: serde_json::Value,
    ) -> Result<ChildSource<FeatureNodeData>, LodError> {
        Ok(ChildSource::Leaf)
    }

    fn content_request(&self, node: &SpatialNode<FeatureNodeData>) -> Option<ContentRequest> {
        let NodeKey::Tile(TileCoord { depth, x, y }) = node.key() else {
            return None;
        };
        Some(ContentRequest {
            url: format!("{}/{depth}/{x}/{y}.bin", self.base_url),
            hint: SchemaHint {
                kind: GeometryKind::Features,
            },
        })
    }

    fn refinement(&self, _node: &SpatialNode<FeatureNodeData>) -> Refinement {
        Refinement::Replace
    }
}

/// Build a feature-layer entity, validating the source.
pub fn feature_entity(
    id: EntityId,
    source: &FeatureSource,
    config: &Config,
    services: EntityServices,
) -> Result<SpatialEntity<FeatureAdapter>, LodError> {
    let adapter = FeatureAdapter::new(source, &config.features)?;
    let tree = SpatialTree::new(
        NodeKey::Tile(TileCoord::default()),
        source.extent.to_aabb(source.min_z, source.max_z),
        FeatureNodeData {
            extent: source.extent,
        },
    )?;
    Ok(SpatialEntity::new(
        id,
        adapter,
        tree,
        EntityOptions::features(config),
        services,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeSource;
    use crate::collab::{Fetcher, Geometry};
    use crate::memory::{MemoryFetcher, RetainedBuilder, SimpleDecoder};
    use crate::request_queue::PriorityRequestQueue;
    use crate::test_support::{StaticCamera, run_frame};
    use crate::walker::LodEntity;
    use glam::{DMat4, DVec3};
    use meridian_math::Aabb;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn source() -> FeatureSource {
        FeatureSource {
            base_url: "mem://roads".to_string(),
            extent: Extent::new(0.0, 0.0, 64.0, 64.0),
            min_z: 0.0,
            max_z: 1.0,
        }
    }

    #[test]
    fn test_double_threshold() {
        // Only the larger axis clears the lower bound.
        assert!(!passes_subdivision_thresholds(DVec2::new(50.0, 500.0), 100.0, 384.0));
        assert!(!passes_subdivision_thresholds(DVec2::new(90.0, 400.0), 100.0, 384.0));
        assert!(passes_subdivision_thresholds(DVec2::new(400.0, 500.0), 100.0, 384.0));
        assert!(!passes_subdivision_thresholds(DVec2::new(80.0, 90.0), 100.0, 384.0));
    }

    #[test]
    fn test_unprojectable_tile_subdivides() {
        let adapter = FeatureAdapter::new(&source(), &FeaturesConfig::default()).unwrap();
        let tree = SpatialTree::new(
            NodeKey::Tile(TileCoord::default()),
            source().extent.to_aabb(0.0, 1.0),
            FeatureNodeData {
                extent: source().extent,
            },
        )
        .unwrap();
        let root = tree.get(tree.root()).unwrap();
        let camera = StaticCamera::seeing(source().extent.to_aabb(0.0, 1.0));
        let view = ViewContext {
            camera: &camera,
            world: &DMat4::IDENTITY,
        };
        let sse = adapter.screen_space_error(root, &view);
        assert_eq!(sse, f64::INFINITY);
        assert!(adapter.should_subdivide(root, &view, sse));
    }

    #[test]
    fn test_quadrant_children() {
        let adapter = FeatureAdapter::new(&source(), &FeaturesConfig::default()).unwrap();
        let tree = SpatialTree::new(
            NodeKey::Tile(TileCoord::new(1, 1, 0)),
            Aabb::new(DVec3::ZERO, DVec3::new(64.0, 64.0, 1.0)),
            FeatureNodeData {
                extent: source().extent,
            },
        )
        .unwrap();
        let root = tree.get(tree.root()).unwrap();
        let ChildSource::Ready(specs) = adapter.children(root) else {
            panic!("expected quadrants");
        };
        assert_eq!(specs.len(), 4);
        // North-east quadrant.
        assert_eq!(specs[3].key, NodeKey::Tile(TileCoord::new(2, 3, 1)));
        assert_eq!(specs[3].data.extent, Extent::new(32.0, 32.0, 64.0, 64.0));
        assert_eq!(
            specs[3].bounds,
            Aabb::new(DVec3::new(32.0, 32.0, 0.0), DVec3::new(64.0, 64.0, 1.0))
        );
        assert_eq!(
            adapter.content_request(root).unwrap().url,
            "mem://roads/1/1/0.bin"
        );
    }

    /// A tile at the deepest addressable level has no quadrants.
    #[test]
    fn test_deepest_tile_is_leaf() {
        let adapter = FeatureAdapter::new(&source(), &FeaturesConfig::default()).unwrap();
        let tree = SpatialTree::new(
            NodeKey::Tile(TileCoord::new(32, u32::MAX, 7)),
            Aabb::new(DVec3::ZERO, DVec3::new(64.0, 64.0, 1.0)),
            FeatureNodeData {
                extent: source().extent,
            },
        )
        .unwrap();
        let root = tree.get(tree.root()).unwrap();
        assert!(matches!(adapter.children(root), ChildSource::Leaf));
    }

    #[test]
    fn test_source_validation() {
        let mut bad = source();
        bad.extent = Extent::new(10.0, 0.0, 0.0, 10.0);
        assert!(matches!(
            FeatureAdapter::new(&bad, &FeaturesConfig::default()),
            Err(LodError::InvalidBounds { .. })
        ));
        let mut bad = source();
        bad.base_url.clear();
        assert!(matches!(
            FeatureAdapter::new(&bad, &FeaturesConfig::default()),
            Err(LodError::MissingOption("base_url"))
        ));
    }

    /// The root stays on screen until its four children are loaded, then
    /// they replace it.
    #[test]
    fn test_children_replace_root_once_loaded() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let features = |n: u64| Geometry {
            kind: GeometryKind::Features,
            primitive_count: n,
            positions: Vec::new(),
        };
        fetcher.insert_geometry("mem://roads/0/0/0.bin", &features(64));

        let queue = Arc::new(PriorityRequestQueue::new(8, 0));
        let services = EntityServices::new(
            Arc::clone(&queue),
            Arc::clone(&fetcher) as Arc<dyn Fetcher>,
            Arc::new(SimpleDecoder),
            Arc::new(RetainedBuilder::new()),
        );
        let mut config = Config::default();
        config.features.max_level = 1;
        config.queue.retry_delay_ms = 0;
        let mut entity = feature_entity(EntityId(4), &source(), &config, services).unwrap();

        let mut camera = StaticCamera::seeing(source().extent.to_aabb(0.0, 1.0));
        camera.projected = Some(DVec2::new(500.0, 500.0));
        let t0 = Instant::now();
        let frame = |entity: &mut SpatialEntity<FeatureAdapter>, n: u64| {
            let now = t0 + Duration::from_millis(n * 16);
            run_frame(entity, &queue, &camera, now, &[ChangeSource::Camera]);
        };

        frame(&mut entity, 0);
        frame(&mut entity, 1);
        // Children are not available yet: the root keeps covering them.
        let root = entity.tree().root();
        assert_eq!(entity.tree().len(), 5);
        assert!(entity.tree().get(root).unwrap().is_displayed());
        assert_eq!(entity.displayed_primitives(), 64);

        for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            fetcher.insert_geometry(format!("mem://roads/1/{x}/{y}.bin"), &features(10));
        }
        for n in 2..5 {
            frame(&mut entity, n);
        }
        assert_eq!(entity.displayed_primitives(), 40);
        assert!(!entity.tree().get(root).unwrap().is_displayed());
        assert!(!entity.loading());
    }
}
