//! 3D tile tree adapter.
//!
//! A tileset is a JSON tree of tiles, each with a bounding box, a geometric
//! error, optional content, and a refinement mode inherited from its parent
//! when absent. Content pointing at another `.json` document is an external
//! tileset whose root becomes the tile's only child once fetched.

use glam::DVec3;
use meridian_config::Config;
use meridian_math::Aabb;
use serde::Deserialize;

use crate::adapter::{ChildSource, ChildSpec, ContentRequest, Refinement, TreeAdapter, ViewContext};
use crate::change::EntityId;
use crate::collab::{GeometryKind, SchemaHint};
use crate::error::LodError;
use crate::node::{NodeKey, NodeName, SpatialNode, SpatialTree};
use crate::walker::{EntityOptions, EntityServices, SpatialEntity};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TileDescriptor {
    bounding_volume: BoundingVolume,
    geometric_error: f64,
    #[serde(default)]
    refine: Option<RefineMode>,
    #[serde(default)]
    content: Option<ContentDescriptor>,
    #[serde(default)]
    children: Vec<TileDescriptor>,
}

/// Axis-aligned box written as `[min_x, min_y, min_z, max_x, max_y, max_z]`.
#[derive(Debug, Deserialize)]
struct BoundingVolume {
    #[serde(rename = "box")]
    aabb: [f64; 6],
}

#[derive(Debug, Deserialize)]
struct ContentDescriptor {
    uri: String,
}

#[derive(Clone, Copy, Debug, Deserialize)]
enum RefineMode {
    #[serde(rename = "ADD", alias = "add")]
    Add,
    #[serde(rename = "REPLACE", alias = "replace")]
    Replace,
}

impl From<RefineMode> for Refinement {
    fn from(mode: RefineMode) -> Self {
        match mode {
            RefineMode::Add => Refinement::Additive,
            RefineMode::Replace => Refinement::Replace,
        }
    }
}

/// A parsed tileset document.
#[derive(Debug, Deserialize)]
pub struct TilesetDocument {
    root: TileDescriptor,
}

impl TilesetDocument {
    pub fn parse(value: serde_json::Value) -> Result<Self, LodError> {
        serde_json::from_value(value).map_err(|e| LodError::InvalidTileset(e.to_string()))
    }
}

impl std::str::FromStr for TilesetDocument {
    type Err = LodError;

    fn from_str(text: &str) -> Result<Self, LodError> {
        serde_json::from_str(text).map_err(|e| LodError::InvalidTileset(e.to_string()))
    }
}

/// What a tile's content resolves to.
#[derive(Clone, Debug, PartialEq)]
pub enum TileContent {
    Renderable { url: String, kind: GeometryKind },
    External { url: String },
}

/// Per-node data of a tile tree.
#[derive(Clone, Debug, PartialEq)]
pub struct TileData {
    pub geometric_error: f64,
    pub refinement: Refinement,
    pub content: Option<TileContent>,
    declared: Vec<DeclaredTile>,
}

impl TileData {
    /// Number of children declared inline by the tileset.
    #[must_use]
    pub fn declared_children(&self) -> usize {
        self.declared.len()
    }
}

#[derive(Clone, Debug, PartialEq)]
struct DeclaredTile {
    bounds: Aabb,
    data: TileData,
}

fn resolve_uri(base: &str, uri: &str) -> String {
    if uri.contains("://") || uri.starts_with('/') || base.is_empty() {
        return uri.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        uri.trim_start_matches("./")
    )
}

fn directory_of(url: &str) -> &str {
    url.rsplit_once('/').map_or("", |(dir, _)| dir)
}

/// Validate a descriptor and its subtree into tile data.
fn convert(
    tile: &TileDescriptor,
    inherited: Refinement,
    base: &str,
    path: &str,
) -> Result<DeclaredTile, LodError> {
    let [x0, y0, z0, x1, y1, z1] = tile.bounding_volume.aabb;
    let bounds = Aabb::from_min_max(DVec3::new(x0, y0, z0), DVec3::new(x1, y1, z1));
    if !bounds.is_valid() {
        return Err(LodError::InvalidBounds {
            context: format!("tile {path}"),
        });
    }
    if !(tile.geometric_error.is_finite() && tile.geometric_error >= 0.0) {
        return Err(LodError::InvalidTileset(format!(
            "tile {path}: geometric error {} is not a non-negative number",
            tile.geometric_error
        )));
    }

    let content = match &tile.content {
        None => None,
        Some(ContentDescriptor { uri }) => {
            let url = resolve_uri(base, uri);
            let extension = uri.rsplit_once('.').map_or("", |(_, ext)| ext);
            if extension.eq_ignore_ascii_case("json") {
                Some(TileContent::External { url })
            } else {
                let kind = GeometryKind::parse(&extension.to_ascii_lowercase())?;
                Some(TileContent::Renderable { url, kind })
            }
        }
    };

    let refinement = tile.refine.map_or(inherited, Refinement::from);
    let declared = tile
        .children
        .iter()
        .enumerate()
        .map(|(i, child)| convert(child, refinement, base, &format!("{path}/{i}")))
        .collect::<Result<Vec<_>, _>>()?;
    if declared.len() > usize::from(u8::MAX) {
        return Err(LodError::InvalidTileset(format!(
            "tile {path}: too many children ({})",
            declared.len()
        )));
    }

    Ok(DeclaredTile {
        bounds,
        data: TileData {
            geometric_error: tile.geometric_error,
            refinement,
            content,
            declared,
        },
    })
}

/// Tile-tree behaviour.
#[derive(Clone, Debug, PartialEq)]
pub struct TilesetAdapter {
    sse_threshold: f64,
}

impl TilesetAdapter {
    #[must_use]
    pub fn new(sse_threshold: f64) -> Self {
        Self { sse_threshold }
    }

    /// Validate `document` and build the tree rooted at its root tile.
    /// Relative content URIs resolve against `base_url`.
    pub fn create_tree(
        document: &TilesetDocument,
        base_url: &str,
    ) -> Result<SpatialTree<TileData>, LodError> {
        let root = convert(&document.root, Refinement::Replace, base_url, "root")?;
        SpatialTree::new(NodeKey::Path(NodeName::root()), root.bounds, root.data)
    }
}

impl TreeAdapter for TilesetAdapter {
    type Data = TileData;

    fn kind_name(&self) -> &'static str {
        "tiles3d"
    }

    /// Geometric error projected from the distance between the camera and
    /// the tile's box.
    fn screen_space_error(&self, node: &SpatialNode<TileData>, view: &ViewContext<'_>) -> f64 {
        let distance = view
            .world_bounds(node)
            .distance_to_point(view.camera.position());
        if distance <= 0.0 {
            return f64::INFINITY;
        }
        view.camera.pre_sse() * node.data.geometric_error / distance
    }

    fn should_subdivide(
        &self,
        _node: &SpatialNode<TileData>,
        _view: &ViewContext<'_>,
        sse: f64,
    ) -> bool {
        sse > self.sse_threshold
    }

    fn children(&self, node: &SpatialNode<TileData>) -> ChildSource<TileData> {
        let NodeKey::Path(name) = node.key() else {
            return ChildSource::Leaf;
        };
        if !node.data.declared.is_empty() {
            let specs = node
                .data
                .declared
                .iter()
                .zip(0u8..)
                .map(|(tile, index)| ChildSpec {
                    key: NodeKey::Path(name.child(index)),
                    bounds: tile.bounds,
                    data: tile.data.clone(),
                })
                .collect();
            return ChildSource::Ready(specs);
        }
        match &node.data.content {
            Some(TileContent::External { url }) => ChildSource::Fetch { url: url.clone() },
            _ => ChildSource::Leaf,
        }
    }

    fn parse_children(
        &self,
        node: &SpatialNode<TileData>,
        document: serde_json::Value,
    ) -> Result<ChildSource<TileData>, LodError> {
        let (NodeKey::Path(name), Some(TileContent::External { url })) =
            (node.key(), &node.data.content)
        else {
            return Ok(ChildSource::Leaf);
        };
        let document = TilesetDocument::parse(document)?;
        let root = convert(
            &document.root,
            node.data.refinement,
            directory_of(url),
            &format!("{url}#root"),
        )?;
        Ok(ChildSource::Ready(vec![ChildSpec {
            key: NodeKey::Path(name.child(0)),
            bounds: root.bounds,
            data: root.data,
        }]))
    }

    fn content_request(&self, node: &SpatialNode<TileData>) -> Option<ContentRequest> {
        match &node.data.content {
            Some(TileContent::Renderable { url, kind }) => Some(ContentRequest {
                url: url.clone(),
                hint: SchemaHint { kind: *kind },
            }),
            _ => None,
        }
    }

    fn refinement(&self, node: &SpatialNode<TileData>) -> Refinement {
        node.data.refinement
    }
}

/// Build a tile-tree entity from a parsed tileset.
pub fn tileset_entity(
    id: EntityId,
    document: &TilesetDocument,
    base_url: &str,
    config: &Config,
    services: EntityServices,
) -> Result<SpatialEntity<TilesetAdapter>, LodError> {
    let tree = TilesetAdapter::create_tree(document, base_url)?;
    Ok(SpatialEntity::new(
        id,
        TilesetAdapter::new(config.tiles.sse_threshold),
        tree,
        EntityOptions::tiles(config),
        services,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeSource;
    use crate::collab::{Fetcher, Geometry};
    use crate::memory::{MemoryFetcher, RetainedBuilder, SimpleDecoder};
    use crate::node::NodeState;
    use crate::request_queue::PriorityRequestQueue;
    use crate::test_support::{StaticCamera, run_frame};
    use crate::walker::LodEntity;
    use glam::DMat4;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn tileset() -> serde_json::Value {
        json!({
            "asset": { "version": "1.0" },
            "root": {
                "boundingVolume": { "box": [0, 0, 0, 100, 100, 100] },
                "geometricError": 500,
                "content": { "uri": "root.b3dm" },
                "children": [{
                    "boundingVolume": { "box": [0, 0, 0, 50, 100, 100] },
                    "geometricError": 100,
                    "refine": "ADD",
                    "content": { "uri": "sub/tileset.json" }
                }, {
                    "boundingVolume": { "box": [50, 0, 0, 100, 100, 100] },
                    "geometricError": 0,
                    "content": { "uri": "east.pnts" }
                }]
            }
        })
    }

    fn tree() -> SpatialTree<TileData> {
        let doc = TilesetDocument::parse(tileset()).unwrap();
        TilesetAdapter::create_tree(&doc, "mem://tiles").unwrap()
    }

    #[test]
    fn test_parse_resolves_content_and_refinement() {
        let tree = tree();
        let root = tree.get(tree.root()).unwrap();
        assert_eq!(root.data.refinement, Refinement::Replace);
        assert_eq!(
            root.data.content,
            Some(TileContent::Renderable {
                url: "mem://tiles/root.b3dm".to_string(),
                kind: GeometryKind::Mesh,
            })
        );
        assert_eq!(root.data.declared_children(), 2);

        let ChildSource::Ready(specs) = TilesetAdapter::new(16.0).children(root) else {
            panic!("expected declared children");
        };
        assert_eq!(specs[0].data.refinement, Refinement::Additive);
        assert_eq!(
            specs[0].data.content,
            Some(TileContent::External {
                url: "mem://tiles/sub/tileset.json".to_string()
            })
        );
        // Refinement is inherited from the parent when absent.
        assert_eq!(specs[1].data.refinement, Refinement::Replace);
        assert_eq!(specs[1].key, NodeKey::Path(NodeName::from_indices(&[1])));
    }

    #[test]
    fn test_invalid_tilesets_fail_fast() {
        let mut bad_box = tileset();
        bad_box["root"]["boundingVolume"]["box"] = json!([10, 0, 0, 0, 10, 10]);
        let doc = TilesetDocument::parse(bad_box).unwrap();
        assert!(matches!(
            TilesetAdapter::create_tree(&doc, ""),
            Err(LodError::InvalidBounds { .. })
        ));

        let mut negative = tileset();
        negative["root"]["children"][1]["geometricError"] = json!(-1.0);
        let doc = TilesetDocument::parse(negative).unwrap();
        assert!(matches!(
            TilesetAdapter::create_tree(&doc, ""),
            Err(LodError::InvalidTileset(_))
        ));

        let mut unknown = tileset();
        unknown["root"]["content"]["uri"] = json!("root.xyz");
        let doc = TilesetDocument::parse(unknown).unwrap();
        assert!(matches!(
            TilesetAdapter::create_tree(&doc, ""),
            Err(LodError::UnknownGeometry(_))
        ));

        assert!(matches!(
            TilesetDocument::parse(json!({ "asset": {} })),
            Err(LodError::InvalidTileset(_))
        ));
    }

    #[test]
    fn test_sse_from_box_distance() {
        let tree = tree();
        let root = tree.get(tree.root()).unwrap();
        let mut camera = StaticCamera::seeing(Aabb::new(DVec3::splat(-1e3), DVec3::splat(1e3)));
        camera.position = DVec3::new(50.0, 50.0, 150.0);
        let view = ViewContext {
            camera: &camera,
            world: &DMat4::IDENTITY,
        };
        let adapter = TilesetAdapter::new(16.0);
        let sse = adapter.screen_space_error(root, &view);
        assert!((sse - 1000.0 * 500.0 / 50.0).abs() < 1e-9);
        assert!(adapter.should_subdivide(root, &view, sse));

        camera.position = DVec3::splat(50.0);
        let view = ViewContext {
            camera: &camera,
            world: &DMat4::IDENTITY,
        };
        assert_eq!(adapter.screen_space_error(root, &view), f64::INFINITY);
    }

    /// An external tileset is fetched on demand and its root becomes the
    /// referencing tile's child.
    #[test]
    fn test_external_tileset_loads_on_demand() {
        let fetcher = Arc::new(MemoryFetcher::new());
        let mesh = |n: u64| Geometry {
            kind: GeometryKind::Mesh,
            primitive_count: n,
            positions: vec![DVec3::splat(10.0)],
        };
        fetcher.insert_geometry("mem://tiles/root.b3dm", &mesh(100));
        fetcher.insert_geometry("mem://tiles/sub/leaf.b3dm", &mesh(40));
        fetcher.insert_json(
            "mem://tiles/sub/tileset.json",
            json!({
                "root": {
                    "boundingVolume": { "box": [0, 0, 0, 50, 100, 100] },
                    "geometricError": 0,
                    "content": { "uri": "leaf.b3dm" }
                }
            }),
        );

        let queue = Arc::new(PriorityRequestQueue::new(8, 0));
        let services = EntityServices::new(
            Arc::clone(&queue),
            Arc::clone(&fetcher) as Arc<dyn Fetcher>,
            Arc::new(SimpleDecoder),
            Arc::new(RetainedBuilder::new()),
        );
        let doc = TilesetDocument::parse(tileset()).unwrap();
        let mut entity =
            tileset_entity(EntityId(2), &doc, "mem://tiles", &Config::default(), services).unwrap();

        // Only the west half is in view.
        let mut camera = StaticCamera::seeing(Aabb::new(
            DVec3::new(-10.0, -10.0, -10.0),
            DVec3::new(40.0, 110.0, 110.0),
        ));
        camera.position = DVec3::new(25.0, 50.0, 150.0);
        let t0 = Instant::now();
        for frame in 0..4u64 {
            let now = t0 + Duration::from_millis(frame * 16);
            run_frame(&mut entity, &queue, &camera, now, &[ChangeSource::Camera]);
        }

        let tree = entity.tree();
        let leaf = tree.find(&NodeKey::Path(NodeName::from_indices(&[0, 0]))).unwrap();
        assert!(tree.get(leaf).unwrap().is_displayed());
        assert!(!tree.get(tree.root()).unwrap().is_displayed());
        assert!(matches!(
            tree.get(tree.root()).unwrap().state(),
            NodeState::Ready(_)
        ));
        assert_eq!(entity.displayed_primitives(), 40);
        assert_eq!(fetcher.request_count("mem://tiles/sub/tileset.json"), 1);
        assert_eq!(fetcher.request_count("mem://tiles/east.pnts"), 0);
    }
}
