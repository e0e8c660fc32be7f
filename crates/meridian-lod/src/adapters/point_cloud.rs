//! Point-cloud octree adapter.
//!
//! Nodes are octants named by their path from the root (`r`, `r0`, `r07`, ...).
//! Each node's children are listed in a small hierarchy document fetched on
//! demand, which also carries the children's point counts.

use meridian_config::{Config, PointCloudConfig};
use meridian_math::Aabb;
use serde::Deserialize;

use crate::adapter::{ChildSource, ChildSpec, ContentRequest, Refinement, TreeAdapter, ViewContext};
use crate::change::EntityId;
use crate::collab::{GeometryKind, SchemaHint};
use crate::error::LodError;
use crate::eviction::{BudgetStrategy, PointBudget};
use crate::node::{NodeKey, NodeName, SpatialNode, SpatialTree};
use crate::walker::{EntityOptions, EntityServices, SpatialEntity};

/// Description of a point-cloud dataset.
#[derive(Clone, Debug, PartialEq)]
pub struct PointCloudSource {
    /// Prefix of every resource of the dataset.
    pub base_url: String,
    /// Loose box of the root node.
    pub bounds: Aabb,
    /// Average distance between root-level points.
    pub spacing: f64,
    /// Points stored in the root node.
    pub root_points: u64,
    /// Whether the points of a node are evenly distributed, so drawing a
    /// prefix of them is a valid down-sampling.
    pub progressive: bool,
}

/// Per-node data of a point-cloud octree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PointNodeData {
    pub point_count: u64,
    /// Bit `i` set when child `i` exists; `None` until the parent's hierarchy
    /// document said otherwise.
    pub child_mask: Option<u8>,
}

#[derive(Deserialize)]
struct HierarchyDocument {
    #[serde(default)]
    children: Vec<HierarchyEntry>,
}

#[derive(Deserialize)]
struct HierarchyEntry {
    index: u8,
    points: u64,
    #[serde(default)]
    mask: Option<u8>,
}

/// Octree behaviour for point clouds.
#[derive(Clone, Debug, PartialEq)]
pub struct PointCloudAdapter {
    base_url: String,
    spacing: f64,
    point_radius: f64,
    sse_threshold: f64,
    budget: PointBudget,
}

impl PointCloudAdapter {
    pub fn new(source: &PointCloudSource, config: &PointCloudConfig) -> Result<Self, LodError> {
        if source.base_url.is_empty() {
            return Err(LodError::MissingOption("base_url"));
        }
        if !(source.spacing.is_finite() && source.spacing > 0.0) {
            return Err(LodError::MissingOption("spacing"));
        }
        let strategy = if source.progressive {
            BudgetStrategy::Proportional
        } else {
            BudgetStrategy::ImportanceRanked
        };
        Ok(Self {
            base_url: source.base_url.trim_end_matches('/').to_string(),
            spacing: source.spacing,
            point_radius: config.point_radius,
            sse_threshold: config.sse_threshold.max(f64::EPSILON),
            budget: PointBudget {
                limit: config.point_budget,
                strategy,
            },
        })
    }

    fn name<'a>(node: &'a SpatialNode<PointNodeData>) -> Option<&'a NodeName> {
        match node.key() {
            NodeKey::Path(name) => Some(name),
            NodeKey::Tile(_) => None,
        }
    }

    fn resource(&self, node: &SpatialNode<PointNodeData>, suffix: &str) -> Option<String> {
        Self::name(node).map(|name| format!("{}/{name}{suffix}", self.base_url))
    }
}

impl TreeAdapter for PointCloudAdapter {
    type Data = PointNodeData;

    fn kind_name(&self) -> &'static str {
        "point-cloud"
    }

    /// Projected spacing of the node's points minus the on-screen point
    /// radius, clamped at 0.
    fn screen_space_error(&self, node: &SpatialNode<PointNodeData>, view: &ViewContext<'_>) -> f64 {
        let bounds = view.world_bounds(node);
        if bounds.extent_along(view.camera.direction()) <= 0.0 {
            return f64::INFINITY;
        }
        let distance = view.camera.distance_to_point(bounds.center());
        if distance <= 0.0 {
            return f64::INFINITY;
        }
        let spacing = self.spacing / 2f64.powi(node.depth() as i32);
        let on_screen_spacing = view.camera.pre_sse() * spacing / distance;
        (on_screen_spacing - self.point_radius).max(0.0)
    }

    fn should_subdivide(
        &self,
        _node: &SpatialNode<PointNodeData>,
        _view: &ViewContext<'_>,
        sse: f64,
    ) -> bool {
        sse / self.sse_threshold >= 1.0
    }

    fn children(&self, node: &SpatialNode<PointNodeData>) -> ChildSource<PointNodeData> {
        if node.data.child_mask == Some(0) {
            return ChildSource::Leaf;
        }
        match self.resource(node, ".hierarchy.json") {
            Some(url) => ChildSource::Fetch { url },
            None => ChildSource::Leaf,
        }
    }

    fn parse_children(
        &self,
        node: &SpatialNode<PointNodeData>,
        document: serde_json::Value,
    ) -> Result<ChildSource<PointNodeData>, LodError> {
        let invalid = |reason: String| LodError::InvalidHierarchy {
            node: node.key().to_string(),
            reason,
        };
        let name = Self::name(node).ok_or_else(|| invalid("node is not an octant".to_string()))?;
        let document: HierarchyDocument =
            serde_json::from_value(document).map_err(|e| invalid(e.to_string()))?;
        if document.children.is_empty() {
            return Ok(ChildSource::Leaf);
        }

        let mut seen = 0u8;
        let mut specs = Vec::with_capacity(document.children.len());
        for entry in document.children {
            if entry.index >= 8 {
                return Err(invalid(format!("child index {} out of range", entry.index)));
            }
            let bit = 1u8 << entry.index;
            if seen & bit != 0 {
                return Err(invalid(format!("child {} listed twice", entry.index)));
            }
            if node.data.child_mask.is_some_and(|mask| mask & bit == 0) {
                return Err(invalid(format!("child {} not in the parent's mask", entry.index)));
            }
            seen |= bit;
            specs.push(ChildSpec {
                key: NodeKey::Path(name.child(entry.index)),
                bounds: node.loose_bounds().octant(entry.index),
                data: PointNodeData {
                    point_count: entry.points,
                    child_mask: entry.mask,
                },
            });
        }
        Ok(ChildSource::Ready(specs))
    }

    fn content_request(&self, node: &SpatialNode<PointNodeData>) -> Option<ContentRequest> {
        if node.data.point_count == 0 {
            return None;
        }
        Some(ContentRequest {
            url: self.resource(node, ".bin")?,
            hint: SchemaHint {
                kind: GeometryKind::Points,
            },
        })
    }

    fn refinement(&self, _node: &SpatialNode<PointNodeData>) -> Refinement {
        Refinement::Additive
    }

    fn retains_structure(&self) -> bool {
        true
    }

    fn budget(&self) -> Option<PointBudget> {
        Some(self.budget)
    }

    fn uses_load_hint(&self) -> bool {
        true
    }
}

/// Build a point-cloud entity, validating the source.
pub fn point_cloud_entity(
    id: EntityId,
    source: &PointCloudSource,
    config: &Config,
    services: EntityServices,
) -> Result<SpatialEntity<PointCloudAdapter>, LodError> {
    let adapter = PointCloudAdapter::new(source, &config.point_cloud)?;
    let tree = SpatialTree::new(
        NodeKey::Path(NodeName::root()),
        source.bounds,
        PointNodeData {
            point_count: source.root_points,
            child_mask: None,
        },
    )?;
    Ok(SpatialEntity::new(
        id,
        adapter,
        tree,
        EntityOptions::point_cloud(config),
        services,
    ))
}
