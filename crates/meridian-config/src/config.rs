//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Deepest feature tile level; tile x/y are `u32`.
pub const MAX_FEATURE_LEVEL: u32 = 32;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Shared content request queue.
    pub queue: QueueConfig,
    /// Point-cloud octree entities.
    pub point_cloud: PointCloudConfig,
    /// 3D Tiles entities.
    pub tiles: TilesConfig,
    /// Feature-collection quadtree entities.
    pub features: FeaturesConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Request queue and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of jobs running at once.
    pub max_concurrent: usize,
    /// Worker threads executing jobs. 0 runs jobs inline when the queue is pumped.
    pub worker_threads: usize,
    /// Base delay before a failed node may retry, doubled per failed attempt.
    pub retry_delay_ms: u64,
    /// Upper bound for the retry backoff.
    pub max_retry_delay_ms: u64,
}

/// Point-cloud entity settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PointCloudConfig {
    /// Normalizing SSE threshold; a node subdivides when `sse / threshold >= 1`.
    pub sse_threshold: f64,
    /// On-screen point radius in pixels.
    pub point_radius: f64,
    /// Maximum number of points displayed at once.
    pub point_budget: u64,
    /// Grace period before invisible content is disposed.
    pub cleanup_delay_ms: u64,
    /// Lowest level eligible for content.
    pub min_level: u32,
    /// Deepest level walked, if limited.
    pub max_depth: Option<u32>,
}

/// 3D Tiles entity settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TilesConfig {
    /// Subdivide when the tile SSE exceeds this many pixels.
    pub sse_threshold: f64,
    /// Grace period before invisible tiles are disposed.
    pub cleanup_delay_ms: u64,
    pub min_level: u32,
    pub max_level: Option<u32>,
}

/// Feature-collection entity settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Projected size (px) a tile must exceed to still be subdividable.
    pub subdivision_lower_px: f64,
    /// Projected size (px) that at least two axes must exceed to subdivide.
    pub subdivision_upper_px: f64,
    pub min_level: u32,
    pub max_level: u32,
    /// Grace period before invisible tiles are disposed.
    pub cleanup_delay_ms: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "meridian_lod=trace").
    pub log_level: String,
    /// Emit per-node diagnostics events.
    pub diagnostics: bool,
}

// --- Default implementations ---

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            worker_threads: 4,
            retry_delay_ms: 2_000,
            max_retry_delay_ms: 30_000,
        }
    }
}

impl Default for PointCloudConfig {
    fn default() -> Self {
        Self {
            sse_threshold: 2.0,
            point_radius: 2.0,
            point_budget: 2_000_000,
            cleanup_delay_ms: 10_000,
            min_level: 0,
            max_depth: None,
        }
    }
}

impl Default for TilesConfig {
    fn default() -> Self {
        Self {
            sse_threshold: 16.0,
            cleanup_delay_ms: 1_000,
            min_level: 0,
            max_level: None,
        }
    }
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            subdivision_lower_px: 100.0,
            subdivision_upper_px: 384.0,
            min_level: 0,
            max_level: 14,
            cleanup_delay_ms: 1_000,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            diagnostics: false,
        }
    }
}

/// Platform config directory for Meridian (e.g. `~/.config/meridian`).
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("meridian"))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Write {
            path: config_dir.to_path_buf(),
            source,
        })?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Serialize)?;

        std::fs::write(&config_path, serialized).map_err(|source| ConfigError::Write {
            path: config_path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let new_config = Self::read(&config_path)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Reject settings the engine cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let features = &self.features;
        if features.max_level > MAX_FEATURE_LEVEL {
            return Err(ConfigError::Invalid {
                key: "features.max_level",
                reason: format!("{} exceeds {MAX_FEATURE_LEVEL}", features.max_level),
            });
        }
        if features.min_level > features.max_level {
            return Err(ConfigError::Invalid {
                key: "features.min_level",
                reason: format!("{} is above max_level {}", features.min_level, features.max_level),
            });
        }
        if features.subdivision_lower_px > features.subdivision_upper_px {
            return Err(ConfigError::Invalid {
                key: "features.subdivision_lower_px",
                reason: "must not exceed subdivision_upper_px".to_string(),
            });
        }
        for (key, threshold) in [
            ("point_cloud.sse_threshold", self.point_cloud.sse_threshold),
            ("tiles.sse_threshold", self.tiles.sse_threshold),
        ] {
            if threshold.is_nan() || threshold <= 0.0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("{threshold} is not positive"),
                });
            }
        }
        Ok(())
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = ron::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }
}
