//! Page Geometry and Fixed-Address Mapping
//!
//! Two halves:
//!
//! 1. [`FillPlan`]: pure arithmetic deciding, for one faulting address,
//!    which page to map and which bytes of the segment's file image land
//!    in it.
//! 2. [`PageMapper`]: the privileged step, "map exactly at address X for
//!    length L with permissions P". [`MmapMapper`] implements it with
//!    anonymous private `mmap` at a fixed address.
//!
//! Pages are never unmapped. Once resident they stay for the life of the
//! process.

use std::collections::BTreeSet;
use std::io;

use bitflags::bitflags;

use crate::elf::SegmentDescriptor;

bitflags! {
    /// Access permissions for a mapped page
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        /// Read access
        const READ = 1 << 0;
        /// Write access
        const WRITE = 1 << 1;
        /// Execute access
        const EXEC = 1 << 2;
        /// Read + Write + Execute
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

impl Protection {
    /// Convert to `PROT_*` bits for `mmap`.
    pub fn to_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// Query the page size from the OS.
pub fn system_page_size() -> io::Result<usize> {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        return Err(io::Error::last_os_error());
    }
    let size = size as usize;
    if !size.is_power_of_two() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("page size {size} is not a power of two"),
        ));
    }
    Ok(size)
}

/// Align `addr` down to a page boundary. `page_size` must be a power of two.
#[inline]
pub const fn page_align_down(addr: u64, page_size: u64) -> u64 {
    addr & !(page_size - 1)
}

/// Where one fault's page goes and what gets copied into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillPlan {
    /// Page-aligned address to map
    pub page_start: u64,
    /// Offset of `page_start` from the segment start (0 when the segment
    /// begins part way into this page)
    pub offset_in_segment: u64,
    /// Offset within the page where file bytes begin
    pub page_offset: usize,
    /// File offset of the first byte to copy
    pub file_offset: u64,
    /// Number of file-backed bytes to copy into the page
    pub bytes_to_load: usize,
}

impl FillPlan {
    /// Plan the page covering `addr` for `segment`.
    ///
    /// `addr` is expected to lie inside the segment. The copy never goes
    /// past `filesz` and never past the end of the page; everything else in
    /// the page stays zero.
    pub fn for_address(segment: &SegmentDescriptor, addr: u64, page_size: u64) -> Self {
        let page_start = page_align_down(addr, page_size);

        let (offset_in_segment, page_offset) = if page_start >= segment.vaddr {
            (page_start - segment.vaddr, 0)
        } else {
            (0, segment.vaddr - page_start)
        };

        let room = page_size - page_offset;
        let file_left = segment.filesz.saturating_sub(offset_in_segment);
        let bytes_to_load = file_left.min(room);

        Self {
            page_start,
            offset_in_segment,
            page_offset: page_offset as usize,
            file_offset: segment.offset.saturating_add(offset_in_segment),
            bytes_to_load: bytes_to_load as usize,
        }
    }
}

/// How a fixed-address mapping treats memory already present at the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MapPolicy {
    /// Fail with [`MapError::AlreadyMapped`] (`MAP_FIXED_NOREPLACE`).
    #[default]
    Exclusive,
    /// Silently replace whatever is there (`MAP_FIXED`).
    Overwrite,
}

/// Errors from establishing a page mapping.
#[derive(thiserror::Error, Debug)]
pub enum MapError {
    #[error("page {page:#x} overlaps an existing mapping")]
    AlreadyMapped { page: u64 },

    #[error("page {page:#x} is outside this host's address space")]
    OutOfRange { page: u64 },

    #[error("mmap placed page {page:#x} at {actual:#x}")]
    Misplaced { page: u64, actual: u64 },

    #[error("mmap at {page:#x} failed: {source}")]
    Os {
        page: u64,
        #[source]
        source: io::Error,
    },
}

/// Establishes fresh, zero-filled mappings at exact addresses.
pub trait PageMapper {
    /// Map `len` zeroed bytes at exactly `page` with `prot`.
    ///
    /// Must not disturb any other mapping.
    fn map_fixed(&mut self, page: u64, len: usize, prot: Protection) -> Result<(), MapError>;

    /// Whether `page` was established by this mapper.
    fn is_mapped(&self, page: u64) -> bool;

    /// Mutable view of a page previously established by [`map_fixed`].
    ///
    /// Returns `None` for pages this mapper did not map.
    ///
    /// [`map_fixed`]: PageMapper::map_fixed
    fn page_mut(&mut self, page: u64, len: usize) -> Option<&mut [u8]>;
}

/// [`PageMapper`] backed by anonymous private `mmap`.
#[derive(Debug, Default)]
pub struct MmapMapper {
    policy: MapPolicy,
    mapped: BTreeSet<u64>,
}

impl MmapMapper {
    /// Create a mapper using `policy` for already-occupied addresses.
    pub fn new(policy: MapPolicy) -> Self {
        Self {
            policy,
            mapped: BTreeSet::new(),
        }
    }

    /// Number of pages this mapper has established.
    pub fn mapped_pages(&self) -> usize {
        self.mapped.len()
    }
}

impl PageMapper for MmapMapper {
    fn map_fixed(&mut self, page: u64, len: usize, prot: Protection) -> Result<(), MapError> {
        let addr = usize::try_from(page).map_err(|_| MapError::OutOfRange { page })?;

        let placement = match self.policy {
            MapPolicy::Exclusive => libc::MAP_FIXED_NOREPLACE,
            MapPolicy::Overwrite => libc::MAP_FIXED,
        };
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | placement;

        // SAFETY: anonymous mapping, no file descriptor. Under `Exclusive`
        // the kernel refuses to touch existing mappings; under `Overwrite`
        // the caller asked for replacement explicitly.
        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                prot.to_prot(),
                flags,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            let source = io::Error::last_os_error();
            return Err(match source.raw_os_error() {
                Some(libc::EEXIST) => MapError::AlreadyMapped { page },
                _ => MapError::Os { page, source },
            });
        }

        // Kernels older than 4.17 treat MAP_FIXED_NOREPLACE as a hint.
        if ptr as usize != addr {
            // SAFETY: `ptr` is the mapping just returned by mmap.
            unsafe { libc::munmap(ptr, len) };
            return Err(MapError::Misplaced {
                page,
                actual: ptr as u64,
            });
        }

        self.mapped.insert(page);
        Ok(())
    }

    fn is_mapped(&self, page: u64) -> bool {
        self.mapped.contains(&page)
    }

    fn page_mut(&mut self, page: u64, len: usize) -> Option<&mut [u8]> {
        if !self.mapped.contains(&page) {
            return None;
        }
        // SAFETY: this mapper mapped `page` with at least `len` bytes and
        // never unmaps it; the exclusive borrow of `self` keeps the view
        // unique on the loader side.
        Some(unsafe { std::slice::from_raw_parts_mut(page as usize as *mut u8, len) })
    }
}
