//! Loader configuration.
//!
//! Resolved once at startup from the command line with an environment
//! fallback for the diagnostic level.

use std::path::PathBuf;

use log::LevelFilter;

use crate::cli::{parse_level, Cli};
use crate::output::OutputFormat;
use crate::page::MapPolicy;

/// Environment variable consulted when `--log-level` is not given.
pub const LOG_ENV: &str = "LAZYLOAD_LOG";

/// Default diagnostic level: one line per resolved fault.
pub const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// Everything a run needs to know besides the image itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    pub executable: PathBuf,
    pub log_level: LevelFilter,
    pub output: OutputFormat,
    pub map_policy: MapPolicy,
}

impl LoaderConfig {
    /// Default settings for `executable`.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            log_level: DEFAULT_LOG_LEVEL,
            output: OutputFormat::default(),
            map_policy: MapPolicy::default(),
        }
    }

    /// Build from parsed arguments, reading [`LOG_ENV`] from the process
    /// environment.
    pub fn from_cli(cli: Cli) -> Self {
        let env = std::env::var(LOG_ENV).ok();
        Self::from_cli_with_env(cli, env.as_deref())
    }

    /// Level precedence: `--quiet`, then `--log-level`, then `env`, then
    /// [`DEFAULT_LOG_LEVEL`]. An unparsable `env` value is ignored.
    pub fn from_cli_with_env(cli: Cli, env: Option<&str>) -> Self {
        let log_level = if cli.quiet {
            LevelFilter::Warn
        } else {
            cli.log_level
                .or_else(|| env.and_then(|value| parse_level(value.trim()).ok()))
                .unwrap_or(DEFAULT_LOG_LEVEL)
        };

        let map_policy = if cli.overwrite {
            MapPolicy::Overwrite
        } else {
            MapPolicy::Exclusive
        };

        Self {
            executable: cli.executable,
            log_level,
            output: cli.output,
            map_policy,
        }
    }
}
