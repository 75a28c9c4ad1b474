use serde::Serialize;
use std::fmt;
use std::io::{self, Write};

use crate::context::RunReport;

/// Output format for the run summary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Single JSON object on stdout.
    Json,
    /// Human-readable summary on stdout.
    #[default]
    Human,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Human => write!(f, "human"),
        }
    }
}

/// The human summary, one fact per line.
struct Summary<'a>(&'a RunReport);

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = self.0;
        writeln!(f, "User _start return value = {}", report.result)?;
        writeln!(f, "Total page faults: {}", report.metrics.faults)?;
        writeln!(f, "Total page allocations: {}", report.metrics.allocations)?;
        writeln!(
            f,
            "Total internal fragmentation: {:.2} KB",
            report.metrics.fragmentation_kib()
        )?;
        write!(f, "Total bytes loaded: {}", report.metrics.bytes_loaded)
    }
}

/// Write the run summary to `out`.
pub fn write_report<W: Write>(out: &mut W, format: OutputFormat, report: &RunReport) -> io::Result<()> {
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string(report).map_err(io::Error::other)?;
            writeln!(out, "{json}")
        }
        OutputFormat::Human => writeln!(out, "{}", Summary(report)),
    }
}

/// Write the run summary to stdout.
pub fn emit(format: OutputFormat, report: &RunReport) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_report(&mut out, format, report)?;
    out.flush()
}

/// Write an error to stdout (JSON mode) or stderr (human mode).
///
/// `exit_code_num` is the raw numeric exit code (1 or 2).
pub fn emit_error(format: OutputFormat, exit_code_num: u8, message: &str) {
    match format {
        OutputFormat::Json => {
            let obj = ErrorReport {
                error: message,
                exit_code: exit_code_num,
            };
            // JSON errors go to stdout so the caller always gets valid JSON on stdout.
            match serde_json::to_string(&obj) {
                Ok(json) => println!("{json}"),
                Err(_) => println!("{{\"error\":\"{}\"}}", message.escape_default()),
            }
        }
        OutputFormat::Human => {
            eprintln!("error: {message}");
        }
    }
}

#[derive(Serialize)]
struct ErrorReport<'a> {
    error: &'a str,
    exit_code: u8,
}
