//! lazyload: demand-paged loader for statically linked ELF executables.
//!
//! Nothing of the image is mapped up front. The loader reads the program
//! header table, installs a SIGSEGV handler and calls the entry point.
//! Every first touch of a page inside a PT_LOAD segment faults into the
//! handler, which maps exactly that page and fills it from the file before
//! the faulting instruction is retried.
//!
//! # Layout
//!
//! - [`elf`]: header and program header decoding ([`SegmentMap`])
//! - [`page`]: page geometry and fixed-address mapping
//! - [`fault`]: the per-fault resolver ([`FaultResolver`])
//! - [`metrics`]: fault, allocation and fragmentation counters
//! - [`signal`]: scoped SIGSEGV registration
//! - [`context`]: one load-and-run ([`LoaderContext`])
//!
//! The rest is the command-line surface: [`cli`], [`config`], [`logging`],
//! [`output`] and [`error`].

#[cfg(not(target_os = "linux"))]
compile_error!("lazyload relies on Linux mmap and signal semantics");

pub mod cli;
pub mod config;
pub mod context;
pub mod elf;
pub mod error;
pub mod fault;
pub mod logging;
pub mod metrics;
pub mod output;
pub mod page;
pub mod signal;

pub use config::LoaderConfig;
pub use context::{LoaderContext, RunReport};
pub use elf::{ElfError, SegmentDescriptor, SegmentMap};
pub use error::LoaderError;
pub use fault::{FaultError, FaultRecord, FaultResolver};
pub use metrics::PageMappingMetrics;
pub use page::{MapPolicy, MmapMapper, PageMapper};
