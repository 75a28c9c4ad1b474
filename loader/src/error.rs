use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use crate::elf::ElfError;

/// Errors that stop the loader before or around the loaded program.
///
/// Variants are split into two categories:
/// - **Host errors** (exit code 2): the loader could not set itself up
/// - **Image errors** (exit code 1): the executable cannot be loaded
///
/// Failures while resolving a fault are [`FaultError`](crate::fault::FaultError)s
/// and never reach this type; the signal handler terminates the process.
#[derive(thiserror::Error, Debug)]
pub enum LoaderError {
    // ── Image errors (exit code 1) ───────────────────────────────────

    #[error("cannot open {path}: {source}")]
    FileAccess {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Elf(#[from] ElfError),

    // ── Host errors (exit code 2) ────────────────────────────────────

    #[error("cannot determine the page size: {0}")]
    PageSize(#[source] io::Error),

    #[error("cannot install the SIGSEGV handler: {0}")]
    HandlerInstall(#[source] io::Error),

    #[error("another loader already owns the SIGSEGV handler")]
    HandlerBusy,
}

impl LoaderError {
    /// Raw numeric exit status for this error.
    pub fn exit_status(&self) -> u8 {
        match self {
            Self::FileAccess { .. } | Self::Elf(_) => 1,
            Self::PageSize(_) | Self::HandlerInstall(_) | Self::HandlerBusy => 2,
        }
    }

    /// Map each error variant to its process exit code.
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }
}
