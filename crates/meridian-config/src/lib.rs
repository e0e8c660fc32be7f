//! Configuration system for Meridian.
//!
//! Runtime-tunable LOD, queue and eviction settings persisted to disk as RON.
//! Supports CLI overrides via clap, hot-reload detection, and forward/backward
//! compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    Config, DebugConfig, FeaturesConfig, MAX_FEATURE_LEVEL, PointCloudConfig, QueueConfig,
    TilesConfig, default_config_dir,
};
pub use error::ConfigError;
