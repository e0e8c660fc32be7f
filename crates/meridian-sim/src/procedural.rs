//! Datasets generated on request from the height field.
//!
//! Resources live under `proc://`:
//! - `cloud/{name}.bin` and `cloud/{name}.hierarchy.json`: a point-cloud octree
//! - `tiles/tileset.json`, `tiles/ne/tileset.json` and `tiles/**/{d}_{x}_{y}.b3dm`: a tile tree
//!   whose north-east quadrant is an external tileset
//! - `roads/{d}/{x}/{y}.bin`: a feature quadtree

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use glam::DVec3;
use meridian_lod::{CancelToken, FetchError, Fetcher, Geometry, GeometryKind, NodeName, TileCoord};
use meridian_math::{Aabb, Extent};
use serde_json::{Value, json};

use crate::terrain::Terrain;

/// Samples per axis when generating point-cloud nodes.
const CLOUD_GRID: u32 = 16;
/// Vertices per axis of a tile mesh.
const MESH_GRID: u32 = 9;
const ROAD_VERTICES: u32 = 9;

/// Where the generated datasets sit in the world.
#[derive(Clone, Debug)]
pub struct Layout {
    pub extent: Extent,
    pub min_z: f64,
    pub max_z: f64,
    /// Depth of the deepest point-cloud octants.
    pub cloud_depth: u32,
    /// Depth of the deepest tiles.
    pub tiles_depth: u32,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            extent: Extent::new(0.0, 0.0, 1024.0, 1024.0),
            min_z: -512.0,
            max_z: 512.0,
            cloud_depth: 6,
            tiles_depth: 4,
        }
    }
}

impl Layout {
    /// Root cube of the point cloud.
    pub fn cloud_root(&self) -> Aabb {
        self.extent.to_aabb(self.min_z, self.max_z)
    }

    pub fn cloud_bounds(&self, name: &NodeName) -> Aabb {
        name.indices()
            .iter()
            .fold(self.cloud_root(), |bounds, &i| bounds.octant(i))
    }

    pub fn tile_extent(&self, coord: TileCoord) -> Extent {
        let scale = f64::from(1u32 << coord.depth.min(31));
        let w = self.extent.width() / scale;
        let h = self.extent.height() / scale;
        let west = self.extent.west + f64::from(coord.x) * w;
        let south = self.extent.south + f64::from(coord.y) * h;
        Extent::new(west, south, west + w, south + h)
    }
}

/// Fetcher serving the procedural datasets.
pub struct ProceduralFetcher {
    terrain: Terrain,
    layout: Layout,
    latency: Duration,
    requests: AtomicU64,
}

impl ProceduralFetcher {
    pub fn new(terrain: Terrain, layout: Layout) -> Self {
        Self {
            terrain,
            layout,
            latency: Duration::ZERO,
            requests: AtomicU64::new(0),
        }
    }

    /// Delay every response by `latency`, polling for cancellation meanwhile.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Terrain samples falling inside `bounds`.
    pub fn cloud_points(&self, bounds: &Aabb) -> Vec<DVec3> {
        let step = (bounds.max - bounds.min) / f64::from(CLOUD_GRID);
        let mut points = Vec::new();
        for i in 0..CLOUD_GRID {
            for j in 0..CLOUD_GRID {
                let x = bounds.min.x + (f64::from(i) + 0.5) * step.x;
                let y = bounds.min.y + (f64::from(j) + 0.5) * step.y;
                let p = DVec3::new(x, y, self.terrain.height(x, y));
                if bounds.contains_point(p) {
                    points.push(p);
                }
            }
        }
        points
    }

    fn hierarchy(&self, name: &NodeName) -> Value {
        let bounds = self.layout.cloud_bounds(name);
        let leaf_children = name.depth() + 1 >= self.layout.cloud_depth;
        let children: Vec<Value> = (0..8u8)
            .filter_map(|index| {
                let points = self.cloud_points(&bounds.octant(index)).len();
                if points == 0 {
                    return None;
                }
                Some(if leaf_children {
                    json!({ "index": index, "points": points, "mask": 0 })
                } else {
                    json!({ "index": index, "points": points })
                })
            })
            .collect();
        json!({ "children": children })
    }

    fn tile_json(&self, coord: TileCoord, external_ne: bool) -> Value {
        let extent = self.layout.tile_extent(coord);
        let leaf = coord.depth >= self.layout.tiles_depth;
        let children: Vec<Value> = if leaf {
            Vec::new()
        } else {
            (0..4u8)
                .map(|q| {
                    let child = coord.child(q);
                    if external_ne && coord.depth == 0 && q == 3 {
                        let child_extent = self.layout.tile_extent(child);
                        json!({
                            "boundingVolume": { "box": self.tile_box(child_extent) },
                            "geometricError": child_extent.width() / 16.0,
                            "content": { "uri": "ne/tileset.json" }
                        })
                    } else {
                        self.tile_json(child, false)
                    }
                })
                .collect()
        };
        json!({
            "boundingVolume": { "box": self.tile_box(extent) },
            "geometricError": if leaf { 0.0 } else { extent.width() / 16.0 },
            "content": { "uri": format!("{}_{}_{}.b3dm", coord.depth, coord.x, coord.y) },
            "children": children
        })
    }

    fn tile_box(&self, extent: Extent) -> [f64; 6] {
        let h = self.terrain.max_height();
        [extent.west, extent.south, -h, extent.east, extent.north, h]
    }

    fn tileset(&self, external: bool) -> Value {
        let root = if external {
            self.tile_json(TileCoord::new(1, 1, 1), false)
        } else {
            let mut root = self.tile_json(TileCoord::default(), true);
            root["refine"] = json!("REPLACE");
            root
        };
        json!({ "asset": { "version": "1.0" }, "root": root })
    }

    fn mesh(&self, coord: TileCoord) -> Geometry {
        let extent = self.layout.tile_extent(coord);
        let cells = f64::from(MESH_GRID - 1);
        let mut positions = Vec::with_capacity((MESH_GRID * MESH_GRID) as usize);
        for i in 0..MESH_GRID {
            for j in 0..MESH_GRID {
                let x = extent.west + extent.width() * f64::from(i) / cells;
                let y = extent.south + extent.height() * f64::from(j) / cells;
                positions.push(DVec3::new(x, y, self.terrain.height(x, y)));
            }
        }
        Geometry {
            kind: GeometryKind::Mesh,
            primitive_count: u64::from(2 * (MESH_GRID - 1) * (MESH_GRID - 1)),
            positions,
        }
    }

    /// A road crossing the tile diagonally, draped on the terrain.
    fn road(&self, coord: TileCoord) -> Geometry {
        let extent = self.layout.tile_extent(coord);
        let last = f64::from(ROAD_VERTICES - 1);
        let positions = (0..ROAD_VERTICES)
            .map(|i| {
                let t = f64::from(i) / last;
                let x = extent.west + extent.width() * t;
                let y = extent.south + extent.height() * t;
                DVec3::new(x, y, self.terrain.height(x, y) + 1.0)
            })
            .collect();
        Geometry {
            kind: GeometryKind::Features,
            primitive_count: u64::from(ROAD_VERTICES - 1),
            positions,
        }
    }

    fn begin(&self, url: &str, cancel: &CancelToken) -> Result<(), FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Aborted);
        }
        self.requests.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(%url, "procedural fetch");
        if self.latency.is_zero() {
            return Ok(());
        }
        let deadline = Instant::now() + self.latency;
        while Instant::now() < deadline {
            if cancel.is_cancelled() {
                return Err(FetchError::Aborted);
            }
            std::thread::sleep(self.latency.min(Duration::from_millis(2)));
        }
        Ok(())
    }

    fn resolve_binary(&self, url: &str) -> Option<Geometry> {
        let (dataset, path) = url.strip_prefix("proc://")?.split_once('/')?;
        match dataset {
            "cloud" => {
                let name = NodeName::parse(path.strip_suffix(".bin")?)?;
                let positions = self.cloud_points(&self.layout.cloud_bounds(&name));
                Some(Geometry {
                    kind: GeometryKind::Points,
                    primitive_count: positions.len() as u64,
                    positions,
                })
            }
            "tiles" => {
                let file = path.rsplit('/').next()?.strip_suffix(".b3dm")?;
                let mut parts = file.split('_').map(str::parse::<u32>);
                let (Some(Ok(d)), Some(Ok(x)), Some(Ok(y))) = (parts.next(), parts.next(), parts.next())
                else {
                    return None;
                };
                Some(self.mesh(TileCoord::new(d, x, y)))
            }
            "roads" => {
                let mut parts = path.strip_suffix(".bin")?.split('/').map(str::parse::<u32>);
                let (Some(Ok(d)), Some(Ok(x)), Some(Ok(y))) = (parts.next(), parts.next(), parts.next())
                else {
                    return None;
                };
                Some(self.road(TileCoord::new(d, x, y)))
            }
            _ => None,
        }
    }

    fn resolve_json(&self, url: &str) -> Option<Value> {
        match url.strip_prefix("proc://")? {
            "tiles/tileset.json" => Some(self.tileset(false)),
            "tiles/ne/tileset.json" => Some(self.tileset(true)),
            path => {
                let name = path
                    .strip_prefix("cloud/")?
                    .strip_suffix(".hierarchy.json")?;
                Some(self.hierarchy(&NodeName::parse(name)?))
            }
        }
    }

    fn not_found(url: &str) -> FetchError {
        FetchError::Failed {
            url: url.to_string(),
            reason: "no such procedural resource".to_string(),
        }
    }
}

impl Fetcher for ProceduralFetcher {
    fn fetch_binary(&self, url: &str, cancel: &CancelToken) -> Result<Vec<u8>, FetchError> {
        self.begin(url, cancel)?;
        self.resolve_binary(url)
            .ok_or_else(|| Self::not_found(url))?
            .encode()
    }

    fn fetch_json(&self, url: &str, cancel: &CancelToken) -> Result<Value, FetchError> {
        self.begin(url, cancel)?;
        self.resolve_json(url).ok_or_else(|| Self::not_found(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::TerrainParams;
    use meridian_lod::adapters::tiles3d::{TilesetAdapter, TilesetDocument};
    use meridian_lod::memory::SimpleDecoder;
    use meridian_lod::{Decoder, SchemaHint};

    fn fetcher() -> ProceduralFetcher {
        ProceduralFetcher::new(Terrain::new(TerrainParams::default()), Layout::default())
    }

    /// Point counts announced by a hierarchy document match the payloads.
    #[test]
    fn test_hierarchy_matches_payloads() {
        let fetcher = fetcher();
        let cancel = CancelToken::new();
        let doc = fetcher.fetch_json("proc://cloud/r.hierarchy.json", &cancel).unwrap();
        let children = doc["children"].as_array().unwrap();
        assert!(!children.is_empty());
        for child in children {
            let index = child["index"].as_u64().unwrap() as u8;
            let url = format!("proc://cloud/{}.bin", NodeName::root().child(index));
            let bytes = fetcher.fetch_binary(&url, &cancel).unwrap();
            let hint = SchemaHint {
                kind: GeometryKind::Points,
            };
            let geometry = SimpleDecoder.decode(&bytes, &hint).unwrap();
            assert_eq!(geometry.primitive_count, child["points"].as_u64().unwrap());
        }
    }

    #[test]
    fn test_tilesets_are_valid() {
        let fetcher = fetcher();
        let cancel = CancelToken::new();
        for url in ["proc://tiles/tileset.json", "proc://tiles/ne/tileset.json"] {
            let doc = TilesetDocument::parse(fetcher.fetch_json(url, &cancel).unwrap()).unwrap();
            assert!(TilesetAdapter::create_tree(&doc, "proc://tiles").is_ok());
        }
        let mesh = fetcher
            .fetch_binary("proc://tiles/ne/1_1_1.b3dm", &cancel)
            .unwrap();
        assert!(!mesh.is_empty());
    }

    #[test]
    fn test_tile_extent_matches_quadrants() {
        let layout = Layout::default();
        let root = TileCoord::default();
        let split = layout.extent.split();
        for q in 0..4u8 {
            assert_eq!(layout.tile_extent(root.child(q)), split[usize::from(q)]);
        }
    }

    #[test]
    fn test_unknown_and_cancelled_requests() {
        let fetcher = fetcher();
        let cancel = CancelToken::new();
        assert!(matches!(
            fetcher.fetch_binary("proc://nowhere/x.bin", &cancel),
            Err(FetchError::Failed { .. })
        ));
        assert!(fetcher.fetch_binary("proc://roads/2/1/3.bin", &cancel).is_ok());
        cancel.cancel();
        assert_eq!(
            fetcher.fetch_binary("proc://roads/2/1/3.bin", &cancel),
            Err(FetchError::Aborted)
        );
        assert_eq!(fetcher.requests(), 2);
    }
}
