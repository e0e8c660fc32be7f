//! The simulated scene: a point cloud, a tile tree, and a road layer over the
//! same terrain, all sharing one request queue.

use std::sync::Arc;

use meridian_config::Config;
use meridian_lod::diagnostics;
use meridian_lod::memory::{RetainedBuilder, SimpleDecoder};
use meridian_lod::{
    CancelToken, EntityId, EntityServices, FeatureSource, FetchError, Fetcher, FrameDriver,
    LodError, NodeName, PointCloudSource, PriorityRequestQueue, TilesetDocument, feature_entity,
    point_cloud_entity, tileset_entity,
};
use thiserror::Error;

use crate::procedural::ProceduralFetcher;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("failed to build entity: {0}")]
    Lod(#[from] LodError),

    #[error("failed to fetch dataset: {0}")]
    Fetch(#[from] FetchError),
}

pub struct World {
    pub driver: FrameDriver,
    pub queue: Arc<PriorityRequestQueue>,
    pub builder: RetainedBuilder,
    pub cloud: EntityId,
    pub tiles: EntityId,
    pub roads: EntityId,
}

impl World {
    pub fn build(config: &Config, fetcher: Arc<ProceduralFetcher>) -> Result<Self, SimError> {
        let queue = Arc::new(PriorityRequestQueue::from_config(&config.queue));
        let builder = RetainedBuilder::new();
        let services = EntityServices::new(
            Arc::clone(&queue),
            Arc::clone(&fetcher) as Arc<dyn Fetcher>,
            Arc::new(SimpleDecoder),
            Arc::new(builder.clone()),
        )
        .with_diagnostics(diagnostics::from_config(&config.debug));
        let mut driver = FrameDriver::new(Arc::clone(&queue));
        let layout = fetcher.layout().clone();

        let cloud = driver.allocate_id();
        let root_bounds = layout.cloud_root();
        let source = PointCloudSource {
            base_url: "proc://cloud".to_string(),
            bounds: root_bounds,
            spacing: layout.extent.width() / 16.0,
            root_points: fetcher.cloud_points(&layout.cloud_bounds(&NodeName::root())).len() as u64,
            progressive: true,
        };
        driver.add_entity(Box::new(point_cloud_entity(
            cloud,
            &source,
            config,
            services.clone(),
        )?));

        let tiles = driver.allocate_id();
        let document = fetcher.fetch_json("proc://tiles/tileset.json", &CancelToken::new())?;
        let document = TilesetDocument::parse(document)?;
        driver.add_entity(Box::new(tileset_entity(
            tiles,
            &document,
            "proc://tiles",
            config,
            services.clone(),
        )?));

        let roads = driver.allocate_id();
        let source = FeatureSource {
            base_url: "proc://roads".to_string(),
            extent: layout.extent,
            min_z: layout.min_z,
            max_z: layout.max_z,
        };
        driver.add_entity(Box::new(feature_entity(roads, &source, config, services)?));

        tracing::info!(%cloud, %tiles, %roads, workers = config.queue.worker_threads, "scene built");
        Ok(Self {
            driver,
            queue,
            builder,
            cloud,
            tiles,
            roads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flight::Flight;
    use crate::procedural::Layout;
    use crate::terrain::{Terrain, TerrainParams};
    use glam::DVec3;
    use std::time::{Duration, Instant};

    fn inline_config() -> Config {
        let mut config = Config::default();
        config.queue.worker_threads = 0;
        config
    }

    /// Flying the survey path loads content for every entity and stays
    /// within the point budget.
    #[test]
    fn test_survey_loads_all_entities() {
        let mut config = inline_config();
        config.point_cloud.point_budget = 20_000;
        let fetcher = Arc::new(ProceduralFetcher::new(
            Terrain::new(TerrainParams::default()),
            Layout::default(),
        ));
        let mut world = World::build(&config, Arc::clone(&fetcher)).unwrap();
        let flight = Flight::survey(DVec3::new(512.0, 512.0, 0.0), 1024.0, 60);

        let t0 = Instant::now();
        let mut last = None;
        for frame in 0..60 {
            let camera = flight.camera_at(frame);
            world.driver.notify_change(meridian_lod::ChangeSource::Camera);
            let now = t0 + Duration::from_millis(u64::from(frame) * 16);
            last = Some(world.driver.tick(&camera, now));
        }

        let stats = last.unwrap();
        assert!(stats.nodes_visited > 0);
        assert!(stats.near <= stats.far);
        for id in [world.cloud, world.tiles, world.roads] {
            let entity = world.driver.entity(id).unwrap();
            assert!(entity.displayed_primitives() > 0, "{id} shows nothing");
        }
        let cloud = world.driver.entity(world.cloud).unwrap();
        assert!(cloud.displayed_primitives() <= 20_000);
        assert!(world.builder.stats().live() > 0);
        assert!(fetcher.requests() > 3);
    }

    #[test]
    fn test_rejects_invalid_layout() {
        let layout = Layout {
            extent: meridian_math::Extent::new(10.0, 0.0, 0.0, 10.0),
            ..Layout::default()
        };
        let fetcher = Arc::new(ProceduralFetcher::new(
            Terrain::new(TerrainParams::default()),
            layout,
        ));
        assert!(World::build(&inline_config(), fetcher).is_err());
    }
}
