//! Command-line argument parsing for Meridian.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Meridian command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "meridian", about = "Meridian headless LOD simulator")]
pub struct CliArgs {
    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of frames to simulate.
    #[arg(long, default_value_t = 240)]
    pub frames: u32,

    /// Point-cloud point budget.
    #[arg(long)]
    pub point_budget: Option<u64>,

    /// Point-cloud SSE threshold.
    #[arg(long)]
    pub sse_threshold: Option<f64>,

    /// Request queue worker threads (0 = inline).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit per-node diagnostics.
    #[arg(long)]
    pub diagnostics: bool,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(budget) = args.point_budget {
            self.point_cloud.point_budget = budget;
        }
        if let Some(sse) = args.sse_threshold {
            self.point_cloud.sse_threshold = sse;
        }
        if let Some(workers) = args.workers {
            self.queue.worker_threads = workers;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
        if args.diagnostics {
            self.debug.diagnostics = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            point_budget: Some(1_000),
            workers: Some(0),
            diagnostics: true,
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.point_cloud.point_budget, 1_000);
        assert_eq!(config.queue.worker_threads, 0);
        assert!(config.debug.diagnostics);
        // Non-overridden fields retain defaults
        assert_eq!(config.point_cloud.sse_threshold, 2.0);
        assert_eq!(config.debug.log_level, "info");
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_parse_args() {
        let args = CliArgs::parse_from(["meridian", "--frames", "10", "--log-level", "debug"]);
        assert_eq!(args.frames, 10);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.config.is_none());
    }
}
