//! Headless Meridian simulator.
//!
//! Builds a point cloud, a tile tree, and a road layer over procedural
//! terrain, flies a scripted camera across them, and logs what the LOD engine
//! loads and displays each frame.
//!
//! Run with `cargo run -p meridian-sim -- --frames 600 --workers 0`.

mod flight;
mod procedural;
mod terrain;
mod world;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use glam::DVec3;
use meridian_config::{CliArgs, Config, default_config_dir};
use meridian_lod::{ChangeSource, FrameStats};
use tracing::info;

use crate::flight::Flight;
use crate::procedural::{Layout, ProceduralFetcher};
use crate::terrain::{Terrain, TerrainParams};
use crate::world::{SimError, World};

/// Simulated frame interval.
const FRAME: Duration = Duration::from_millis(16);
/// Frames between two progress lines.
const REPORT_EVERY: u32 = 30;

fn main() {
    let args = CliArgs::parse();

    let config_dir = args
        .config
        .clone()
        .or_else(default_config_dir)
        .unwrap_or_else(|| PathBuf::from(".meridian"));

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        std::process::exit(2);
    }

    let log_dir = config_dir.join("logs");
    meridian_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    if let Err(err) = run(&config, args.frames) {
        tracing::error!(%err, "simulation aborted");
        std::process::exit(1);
    }
}

fn run(config: &Config, frames: u32) -> Result<(), SimError> {
    let layout = Layout::default();
    let center = layout.extent.center();
    let size = layout.extent.width();
    let latency = if config.queue.worker_threads > 0 {
        Duration::from_millis(5)
    } else {
        Duration::ZERO
    };
    let fetcher = Arc::new(
        ProceduralFetcher::new(Terrain::new(TerrainParams::default()), layout).with_latency(latency),
    );
    let mut world = World::build(config, Arc::clone(&fetcher))?;
    let flight = Flight::survey(DVec3::new(center.x, center.y, 0.0), size, frames);

    let t0 = Instant::now();
    let mut last: Option<FrameStats> = None;
    for frame in 0..frames {
        // Hide the roads for the middle stretch of the flight.
        if frame == frames / 2 {
            world.driver.set_entity_visible(world.roads, false);
        } else if frame == frames * 3 / 4 {
            world.driver.set_entity_visible(world.roads, true);
        }

        let camera = flight.camera_at(frame);
        world.driver.notify_change(ChangeSource::Camera);
        let now = if config.queue.worker_threads > 0 {
            std::thread::sleep(FRAME);
            Instant::now()
        } else {
            t0 + FRAME * frame
        };
        let stats = world.driver.tick(&camera, now);

        if frame % REPORT_EVERY == 0 {
            info!(
                frame = stats.frame,
                visited = stats.nodes_visited,
                displayed = stats.displayed_primitives,
                loading = stats.loading,
                progress = format_args!("{:.0}%", stats.progress * 100.0),
                near = format_args!("{:.1}", stats.near),
                far = format_args!("{:.1}", stats.far),
                pending = stats.pending_jobs,
                "frame"
            );
        }
        last = Some(stats);
    }

    let queue = world.queue.stats();
    let built = world.builder.stats();
    info!(
        frames,
        displayed = last.map_or(0, |s| s.displayed_primitives),
        requests = fetcher.requests(),
        executed = queue.executed,
        cancelled = queue.cancelled,
        failed = queue.failed,
        live_content = built.live(),
        "simulation finished"
    );
    for (kind, id) in [("cloud", world.cloud), ("tiles", world.tiles), ("roads", world.roads)] {
        if let Some(entity) = world.driver.entity(id) {
            info!(
                kind,
                entity = %id,
                displayed = entity.displayed_primitives(),
                loading = entity.loading(),
                "entity summary"
            );
        }
    }
    Ok(())
}
