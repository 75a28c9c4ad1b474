//! Page mapping accounting.

use std::fmt;

use serde::Serialize;

/// Counters for faults handled, pages allocated and internal fragmentation.
///
/// Mutated only by the fault resolver, which the OS runs one fault at a
/// time on the faulting thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageMappingMetrics {
    /// Faults resolved to a mapped page
    pub faults: u64,
    /// Pages allocated (one per resolved fault)
    pub allocations: u64,
    /// Bytes of allocated pages not covered by file content
    pub fragmentation_bytes: u64,
    /// File bytes copied into pages
    pub bytes_loaded: u64,
}

impl PageMappingMetrics {
    /// All counters at zero.
    pub const fn new() -> Self {
        Self {
            faults: 0,
            allocations: 0,
            fragmentation_bytes: 0,
            bytes_loaded: 0,
        }
    }

    /// Account for one resolved fault that copied `bytes_loaded` file bytes
    /// into a freshly allocated page.
    pub fn record(&mut self, bytes_loaded: usize, page_size: usize) {
        self.faults += 1;
        self.allocations += 1;
        self.fragmentation_bytes += page_waste(bytes_loaded, page_size);
        self.bytes_loaded += bytes_loaded as u64;
    }

    /// Fragmentation in KiB, the unit the summary reports in.
    pub fn fragmentation_kib(&self) -> f64 {
        self.fragmentation_bytes as f64 / 1024.0
    }
}

impl fmt::Display for PageMappingMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "faults={} allocations={} fragmentation={:.2} KB",
            self.faults,
            self.allocations,
            self.fragmentation_kib()
        )
    }
}

/// Unused bytes on the last, partially backed page of a load.
///
/// Zero when `bytes_loaded` is a multiple of the page size, including zero.
pub fn page_waste(bytes_loaded: usize, page_size: usize) -> u64 {
    ((page_size - bytes_loaded % page_size) % page_size) as u64
}
