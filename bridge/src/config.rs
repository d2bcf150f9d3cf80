//! Process configuration.
//!
//! All settings are captured into an immutable [`Config`] at startup and
//! passed into each target manager by value; nothing is re-read from the
//! environment after that.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use common::parse_lookback;

use crate::error::Result;

/// Interval between retention sweeps over a target's segment directory.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(360);

/// File extension used for on-disk segments.
pub const SEGMENT_EXT: &str = "mcap";

/// CLI arguments for the bridge server.
#[derive(Parser, Debug)]
#[command(name = "bridge")]
#[command(about = "Recording and replay bridge for channelised telemetry streams")]
pub struct CliArgs {
    /// Directory holding layout descriptors and the retained-set index
    #[arg(long, env = "LAYOUTS_DIR")]
    pub layouts_dir: Option<PathBuf>,

    /// Root directory for per-target segment files
    #[arg(long, env = "DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, default_value = "8080", env = "PORT")]
    pub port: u16,

    /// In-memory history window, `<int><s|m|h|d|w>`
    #[arg(long, default_value = "15m", env = "HISTORY_LOOKBACK")]
    pub history_lookback: String,

    /// Days to keep on-disk segments before they are deleted
    #[arg(long, default_value = "7", env = "RETENTION_DAYS")]
    pub retention_days: u64,
}

/// Immutable runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Descriptor root (`{layouts_dir}/index.json`, `{layouts_dir}/{name}.json`).
    pub layouts_dir: PathBuf,
    /// Segment root (`{data_dir}/{slug}/YYYYMMDD_HH.mcap`).
    pub data_dir: PathBuf,
    /// HTTP listen port.
    pub port: u16,
    /// Ring-buffer age bound; also the default client lookback.
    pub max_ring_age: Duration,
    /// Age beyond which segment files are swept.
    pub retention: Duration,
}

impl Config {
    /// Resolves CLI arguments into a validated configuration.
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let max_ring_age = parse_lookback(&args.history_lookback)?;
        Ok(Self {
            layouts_dir: args
                .layouts_dir
                .clone()
                .unwrap_or_else(|| default_root("layouts")),
            data_dir: args
                .data_dir
                .clone()
                .unwrap_or_else(|| default_root("data")),
            port: args.port,
            max_ring_age,
            retention: Duration::from_secs(args.retention_days * 86_400),
        })
    }
}

/// `/foxglove/{sub}` when the conventional container root exists, otherwise
/// `./{sub}` relative to the working directory.
fn default_root(sub: &str) -> PathBuf {
    let container = Path::new("/foxglove");
    if container.is_dir() {
        container.join(sub)
    } else {
        PathBuf::from(sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> CliArgs {
        CliArgs {
            layouts_dir: Some(PathBuf::from("/tmp/layouts")),
            data_dir: Some(PathBuf::from("/tmp/data")),
            port: 9999,
            history_lookback: "15m".to_string(),
            retention_days: 7,
        }
    }

    #[test]
    fn should_resolve_explicit_directories() {
        // given
        let args = args();

        // when
        let config = Config::from_args(&args).unwrap();

        // then
        assert_eq!(config.layouts_dir, PathBuf::from("/tmp/layouts"));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/data"));
        assert_eq!(config.port, 9999);
    }

    #[test]
    fn should_parse_lookback_and_retention() {
        // given
        let mut args = args();
        args.history_lookback = "2h".to_string();
        args.retention_days = 1;

        // when
        let config = Config::from_args(&args).unwrap();

        // then
        assert_eq!(config.max_ring_age, Duration::from_secs(7_200));
        assert_eq!(config.retention, Duration::from_secs(86_400));
    }

    #[test]
    fn should_reject_malformed_lookback() {
        // given
        let mut args = args();
        args.history_lookback = "soon".to_string();

        // then
        assert!(Config::from_args(&args).is_err());
    }
}
