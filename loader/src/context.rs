use std::fs::File;
use std::mem;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::LoaderConfig;
use crate::elf::{ElfError, SegmentMap};
use crate::error::LoaderError;
use crate::fault::FaultResolver;
use crate::metrics::PageMappingMetrics;
use crate::page::{system_page_size, MmapMapper};
use crate::signal::{FaultHandlerGuard, ProcessResolver};

/// Signature the entry point is called with.
type EntryFn = extern "C" fn() -> i32;

/// Outcome of one load-and-run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub executable: PathBuf,
    pub entry_point: u64,
    /// Value the entry point returned
    pub result: i32,
    pub page_size: usize,
    pub metrics: PageMappingMetrics,
}

/// One loader invocation: the open image, its segment map and the resolver
/// that will back its pages.
///
/// Dropping the context closes the image.
#[derive(Debug)]
pub struct LoaderContext {
    executable: PathBuf,
    resolver: ProcessResolver,
}

impl LoaderContext {
    /// Open `config.executable` and read its segment map. Nothing is mapped.
    pub fn open(config: &LoaderConfig) -> Result<Self, LoaderError> {
        let path = config.executable.as_path();
        let mut file = File::open(path).map_err(|source| LoaderError::FileAccess {
            path: path.to_path_buf(),
            source,
        })?;

        let map = SegmentMap::read_from(&mut file)?;
        let page_size = system_page_size().map_err(LoaderError::PageSize)?;

        log::debug!(
            "{}: entry {:#x}, {} program headers, {} loadable, page size {}",
            path.display(),
            map.entry_point(),
            map.segments().len(),
            map.loadable().count(),
            page_size
        );

        let mapper = MmapMapper::new(config.map_policy);
        Ok(Self {
            executable: path.to_path_buf(),
            resolver: FaultResolver::new(map, file, mapper, page_size),
        })
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn segment_map(&self) -> &SegmentMap {
        self.resolver.segment_map()
    }

    pub fn metrics(&self) -> PageMappingMetrics {
        self.resolver.metrics()
    }

    /// Transfer control to the entry point with nothing mapped and return
    /// once it does.
    ///
    /// The SIGSEGV handler is installed only for the duration of the call.
    ///
    /// # Safety
    ///
    /// This executes arbitrary machine code from the image in the current
    /// process. The caller must trust the image: its loadable segments must
    /// not overlap memory the process relies on, and its entry point must
    /// behave as a C function returning `int`.
    pub unsafe fn run(&mut self) -> Result<RunReport, LoaderError> {
        let header = self.resolver.segment_map().header();
        header.check_runnable()?;

        let entry_point = header.entry;
        let entry_addr = usize::try_from(entry_point).map_err(|_| ElfError::NotRunnable {
            reason: format!("entry point {entry_point:#x} does not fit the address space"),
        })?;

        let result = {
            let _guard = FaultHandlerGuard::install(&mut self.resolver)?;
            log::debug!("transferring control to {entry_point:#x}");
            // SAFETY: the caller vouches for the image; every page the entry
            // point touches is mapped on demand by the installed handler.
            let entry = unsafe { mem::transmute::<usize, EntryFn>(entry_addr) };
            entry()
        };

        let metrics = self.resolver.metrics();
        log::debug!("entry point returned {result}; {metrics}");

        Ok(RunReport {
            executable: self.executable.clone(),
            entry_point,
            result,
            page_size: self.resolver.page_size(),
            metrics,
        })
    }
}
