use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

use crate::output::OutputFormat;

/// Run a statically linked ELF executable, mapping its pages on first touch.
#[derive(Parser, Debug)]
#[command(name = "lazyload", version, about)]
pub struct Cli {
    /// Path to the executable to load.
    pub executable: PathBuf,

    /// Output format for the run summary.
    #[arg(long, value_enum, default_value = "human")]
    pub output: OutputFormat,

    /// Diagnostic verbosity: off, error, warn, info, debug or trace.
    #[arg(long, value_name = "LEVEL", value_parser = parse_level)]
    pub log_level: Option<LevelFilter>,

    /// Only report warnings and errors on stderr.
    #[arg(short, long, conflicts_with = "log_level")]
    pub quiet: bool,

    /// Replace anything already mapped at a segment address instead of
    /// failing the fault.
    #[arg(long)]
    pub overwrite: bool,
}

/// Parse a level name, case-insensitively.
pub fn parse_level(s: &str) -> Result<LevelFilter, String> {
    s.parse::<LevelFilter>()
        .map_err(|_| format!("unknown log level '{s}'"))
}
