//! Fault Resolver
//!
//! Turns a faulting address into a resident, file-backed page.
//!
//! # Per-fault flow
//!
//! ```text
//!   FaultDelivered
//!        │
//!   SegmentLookup ──── no PT_LOAD covers addr ───► Unhandled (fatal)
//!        │
//!   PageMapped        one fresh RWX page at page_start
//!        │
//!   ContentFilled     file bytes up to filesz, rest stays zero
//!        │
//!   Resume            faulting instruction is retried
//! ```
//!
//! The resolver itself never terminates the process. It returns a
//! [`FaultError`] and the signal path decides what to do with it.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

use serde::Serialize;

use crate::elf::{SegmentDescriptor, SegmentMap};
use crate::metrics::PageMappingMetrics;
use crate::page::{FillPlan, MapError, PageMapper, Protection};

/// Ways a fault can fail to resolve. All of them are fatal for the loaded
/// program.
#[derive(thiserror::Error, Debug)]
pub enum FaultError {
    #[error("segmentation fault at address {addr:#x}: unhandled by lazyload")]
    Unhandled { addr: u64 },

    #[error("fault at {addr:#x} on page {page:#x}, which is already resident")]
    Refault { addr: u64, page: u64 },

    #[error("cannot map page for segment {segment}: {source}")]
    Mapping {
        segment: usize,
        #[source]
        source: MapError,
    },

    #[error("cannot fill page {page:#x} from file offset {offset:#x}: {source}")]
    Fill {
        page: u64,
        offset: u64,
        #[source]
        source: io::Error,
    },
}

/// Diagnostic record of one resolved fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FaultRecord {
    /// Faulting address
    pub addr: u64,
    /// Program header index of the owning segment
    pub segment: usize,
    /// Page that was mapped
    pub page_start: u64,
    /// Offset of the page within the segment
    pub offset_in_segment: u64,
    /// File bytes copied into the page
    pub bytes_loaded: usize,
    /// Running totals after this fault
    pub totals: PageMappingMetrics,
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "segment {} page {:#x} offset {} bytes {} | faults {} pages {} fragmentation {:.2} KB",
            self.segment,
            self.page_start,
            self.offset_in_segment,
            self.bytes_loaded,
            self.totals.faults,
            self.totals.allocations,
            self.totals.fragmentation_kib()
        )
    }
}

/// On-demand page mapper for one loaded image.
#[derive(Debug)]
pub struct FaultResolver<R, M> {
    map: SegmentMap,
    image: R,
    mapper: M,
    page_size: usize,
    metrics: PageMappingMetrics,
}

impl<R: Read + Seek, M: PageMapper> FaultResolver<R, M> {
    /// Build a resolver. `page_size` must be a power of two.
    pub fn new(map: SegmentMap, image: R, mapper: M, page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self {
            map,
            image,
            mapper,
            page_size,
            metrics: PageMappingMetrics::new(),
        }
    }

    /// The parsed image metadata.
    pub fn segment_map(&self) -> &SegmentMap {
        &self.map
    }

    /// Snapshot of the counters.
    pub fn metrics(&self) -> PageMappingMetrics {
        self.metrics
    }

    /// Page size every mapping uses.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The underlying mapper.
    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Resolve one fault at `addr`.
    ///
    /// On success exactly one new page is resident at the page containing
    /// `addr`, holding the owning segment's file bytes for that page and
    /// zeros elsewhere. On error nothing is counted.
    pub fn resolve(&mut self, addr: u64) -> Result<FaultRecord, FaultError> {
        let (index, segment) = self
            .map
            .find_loadable(addr)
            .map(|(index, segment)| (index, *segment))
            .ok_or(FaultError::Unhandled { addr })?;

        let plan = FillPlan::for_address(&segment, addr, self.page_size as u64);

        if self.mapper.is_mapped(plan.page_start) {
            return Err(FaultError::Refault {
                addr,
                page: plan.page_start,
            });
        }

        self.mapper
            .map_fixed(plan.page_start, self.page_size, Protection::RWX)
            .map_err(|source| FaultError::Mapping {
                segment: index,
                source,
            })?;

        if plan.bytes_to_load > 0 {
            self.fill(&plan)?;
        }

        self.metrics.record(plan.bytes_to_load, self.page_size);

        let record = FaultRecord {
            addr,
            segment: index,
            page_start: plan.page_start,
            offset_in_segment: plan.offset_in_segment,
            bytes_loaded: plan.bytes_to_load,
            totals: self.metrics,
        };
        log::info!("{record}");
        trace_segment(index, &segment);

        Ok(record)
    }

    fn fill(&mut self, plan: &FillPlan) -> Result<(), FaultError> {
        let fill_error = |source| FaultError::Fill {
            page: plan.page_start,
            offset: plan.file_offset,
            source,
        };

        let page = self
            .mapper
            .page_mut(plan.page_start, self.page_size)
            .ok_or_else(|| fill_error(io::Error::other("page is not mapped")))?;
        let dst = &mut page[plan.page_offset..plan.page_offset + plan.bytes_to_load];

        self.image
            .seek(SeekFrom::Start(plan.file_offset))
            .and_then(|_| self.image.read_exact(dst))
            .map_err(fill_error)
    }
}

fn trace_segment(index: usize, segment: &SegmentDescriptor) {
    log::trace!(
        "segment {} spans {:#x}..{:#x} ({}), filesz {:#x}",
        index,
        segment.vaddr,
        segment.end(),
        segment.permissions_string(),
        segment.filesz
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{ELF_MAGIC, PT_LOAD, PT_NOTE};
    use std::collections::BTreeMap;
    use std::io::Cursor;

    const PAGE: usize = 4096;

    /// In-memory stand-in for mmap.
    #[derive(Debug, Default)]
    struct FakeMapper {
        pages: BTreeMap<u64, Vec<u8>>,
        refuse: Option<u64>,
    }

    impl PageMapper for FakeMapper {
        fn map_fixed(&mut self, page: u64, len: usize, _prot: Protection) -> Result<(), MapError> {
            if self.refuse == Some(page) {
                return Err(MapError::AlreadyMapped { page });
            }
            self.pages.insert(page, vec![0; len]);
            Ok(())
        }

        fn is_mapped(&self, page: u64) -> bool {
            self.pages.contains_key(&page)
        }

        fn page_mut(&mut self, page: u64, len: usize) -> Option<&mut [u8]> {
            self.pages.get_mut(&page).map(|p| &mut p[..len])
        }
    }

    struct Seg {
        kind: u32,
        offset: u32,
        vaddr: u32,
        filesz: u32,
        memsz: u32,
    }

    /// ELF32 image with the given program headers; file bytes at offset
    /// `i` hold `i as u8` so copies can be checked position by position.
    fn image(segs: &[Seg], len: usize) -> Vec<u8> {
        let mut elf: Vec<u8> = (0..len).map(|i| i as u8).collect();
        elf[..52 + 32 * segs.len()].fill(0);

        elf[0..4].copy_from_slice(&ELF_MAGIC);
        elf[4] = 1;
        elf[5] = 1;
        elf[6] = 1;
        elf[16..18].copy_from_slice(&2u16.to_le_bytes());
        elf[18..20].copy_from_slice(&3u16.to_le_bytes());
        elf[24..28].copy_from_slice(&segs[0].vaddr.to_le_bytes());
        elf[28..32].copy_from_slice(&52u32.to_le_bytes());
        elf[42..44].copy_from_slice(&32u16.to_le_bytes());
        elf[44..46].copy_from_slice(&(segs.len() as u16).to_le_bytes());

        for (i, seg) in segs.iter().enumerate() {
            let at = 52 + 32 * i;
            elf[at..at + 4].copy_from_slice(&seg.kind.to_le_bytes());
            elf[at + 4..at + 8].copy_from_slice(&seg.offset.to_le_bytes());
            elf[at + 8..at + 12].copy_from_slice(&seg.vaddr.to_le_bytes());
            elf[at + 16..at + 20].copy_from_slice(&seg.filesz.to_le_bytes());
            elf[at + 20..at + 24].copy_from_slice(&seg.memsz.to_le_bytes());
            elf[at + 24..at + 28].copy_from_slice(&7u32.to_le_bytes());
        }

        elf
    }

    fn resolver(segs: &[Seg], len: usize) -> FaultResolver<Cursor<Vec<u8>>, FakeMapper> {
        let mut cursor = Cursor::new(image(segs, len));
        let map = SegmentMap::read_from(&mut cursor).unwrap();
        FaultResolver::new(map, cursor, FakeMapper::default(), PAGE)
    }

    fn load(offset: u32, vaddr: u32, filesz: u32, memsz: u32) -> Seg {
        Seg {
            kind: PT_LOAD,
            offset,
            vaddr,
            filesz,
            memsz,
        }
    }

    #[test]
    fn test_fully_backed_page_matches_file() {
        let mut r = resolver(&[load(0x1000, 0x1000_0000, 0x2000, 0x2000)], 0x3000);

        let record = r.resolve(0x1000_1010).unwrap();
        assert_eq!(record.segment, 0);
        assert_eq!(record.page_start, 0x1000_1000);
        assert_eq!(record.offset_in_segment, 0x1000);
        assert_eq!(record.bytes_loaded, PAGE);

        let page = &r.mapper().pages[&0x1000_1000];
        let expected: Vec<u8> = (0x2000..0x3000).map(|i: usize| i as u8).collect();
        assert_eq!(page.as_slice(), expected.as_slice());
        assert_eq!(r.metrics().fragmentation_bytes, 0);
    }

    #[test]
    fn test_partial_page_is_zero_past_filesz() {
        let mut r = resolver(&[load(0x1000, 0x1000_0000, 0x1100, 0x3000)], 0x3000);

        let record = r.resolve(0x1000_1ffc).unwrap();
        assert_eq!(record.bytes_loaded, 0x100);

        let page = &r.mapper().pages[&0x1000_1000];
        let expected: Vec<u8> = (0x2000..0x2100).map(|i: usize| i as u8).collect();
        assert_eq!(&page[..0x100], expected.as_slice());
        assert!(page[0x100..].iter().all(|&b| b == 0));
        assert_eq!(r.metrics().fragmentation_bytes, (PAGE - 0x100) as u64);
    }

    #[test]
    fn test_bss_page_reads_zero() {
        let mut r = resolver(&[load(0x1000, 0x1000_0000, 0x10, 0x4000)], 0x2000);

        let record = r.resolve(0x1000_3000).unwrap();
        assert_eq!(record.bytes_loaded, 0);
        assert!(r.mapper().pages[&0x1000_3000].iter().all(|&b| b == 0));
        assert_eq!(r.metrics().fragmentation_bytes, 0);
        assert_eq!(r.metrics().bytes_loaded, 0);
    }

    #[test]
    fn test_unaligned_segment_start() {
        let mut r = resolver(&[load(0x1100, 0x1000_0100, 0x80, 0x80)], 0x2000);

        let record = r.resolve(0x1000_0140).unwrap();
        assert_eq!(record.page_start, 0x1000_0000);
        assert_eq!(record.bytes_loaded, 0x80);

        let page = &r.mapper().pages[&0x1000_0000];
        assert!(page[..0x100].iter().all(|&b| b == 0));
        let expected: Vec<u8> = (0x1100..0x1180).map(|i: usize| i as u8).collect();
        assert_eq!(&page[0x100..0x180], expected.as_slice());
        assert!(page[0x180..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_unhandled_address_maps_nothing() {
        let mut r = resolver(&[load(0x1000, 0x1000_0000, 0x1000, 0x1000)], 0x2000);

        let err = r.resolve(0x2000_0000).unwrap_err();
        assert!(matches!(err, FaultError::Unhandled { addr: 0x2000_0000 }));
        assert!(err.to_string().contains("unhandled"));
        assert!(r.mapper().pages.is_empty());
        assert_eq!(r.metrics(), PageMappingMetrics::new());
    }

    #[test]
    fn test_end_of_memsz_is_outside() {
        let mut r = resolver(&[load(0x1000, 0x1000_0000, 0x1000, 0x1000)], 0x2000);
        assert!(matches!(
            r.resolve(0x1000_1000),
            Err(FaultError::Unhandled { .. })
        ));
    }

    #[test]
    fn test_non_load_segment_is_ignored() {
        let segs = [
            Seg {
                kind: PT_NOTE,
                offset: 0x1000,
                vaddr: 0x3000_0000,
                filesz: 0x100,
                memsz: 0x100,
            },
            load(0x1000, 0x1000_0000, 0x100, 0x100),
        ];
        let mut r = resolver(&segs, 0x2000);
        assert!(matches!(
            r.resolve(0x3000_0010),
            Err(FaultError::Unhandled { .. })
        ));
        assert_eq!(r.resolve(0x1000_0010).unwrap().segment, 1);
    }

    #[test]
    fn test_overlapping_segments_first_wins() {
        let segs = [
            load(0x1000, 0x1000_0000, 0x100, 0x2000),
            load(0x1800, 0x1000_0000, 0x200, 0x2000),
        ];
        let mut r = resolver(&segs, 0x2000);

        let record = r.resolve(0x1000_0000).unwrap();
        assert_eq!(record.segment, 0);
        assert_eq!(record.bytes_loaded, 0x100);
        assert_eq!(r.mapper().pages[&0x1000_0000][0], 0x1000usize as u8);
    }

    #[test]
    fn test_refault_on_resident_page() {
        let mut r = resolver(&[load(0x1000, 0x1000_0000, 0x1000, 0x1000)], 0x2000);

        r.resolve(0x1000_0000).unwrap();
        assert!(matches!(
            r.resolve(0x1000_0800),
            Err(FaultError::Refault { page: 0x1000_0000, .. })
        ));
        assert_eq!(r.metrics().faults, 1);
    }

    #[test]
    fn test_counts_match_distinct_pages() {
        let mut r = resolver(&[load(0x1000, 0x1000_0000, 0x100, 0x4000)], 0x2000);

        for page in 0..4u64 {
            r.resolve(0x1000_0000 + page * PAGE as u64 + 8).unwrap();
        }

        let metrics = r.metrics();
        assert_eq!(metrics.faults, 4);
        assert_eq!(metrics.allocations, 4);
        assert_eq!(metrics.bytes_loaded, 0x100);
        assert_eq!(metrics.fragmentation_bytes, (PAGE - 0x100) as u64);
    }

    #[test]
    fn test_mapping_failure_counts_nothing() {
        let mut r = resolver(&[load(0x1000, 0x1000_0000, 0x100, 0x1000)], 0x2000);
        r.mapper.refuse = Some(0x1000_0000);

        let err = r.resolve(0x1000_0000).unwrap_err();
        assert!(matches!(err, FaultError::Mapping { segment: 0, .. }));
        assert_eq!(r.metrics().faults, 0);
    }

    #[test]
    fn test_short_file_is_fill_error() {
        // filesz claims more bytes than the file holds
        let mut r = resolver(&[load(0x1000, 0x1000_0000, 0x1000, 0x1000)], 0x1800);

        let err = r.resolve(0x1000_0000).unwrap_err();
        assert!(matches!(
            err,
            FaultError::Fill { page: 0x1000_0000, offset: 0x1000, .. }
        ));
        assert_eq!(r.metrics().allocations, 0);
    }

    #[test]
    fn test_record_display() {
        let mut r = resolver(&[load(0x1000, 0x1000_0000, 0x200, 0x1000)], 0x2000);
        let line = r.resolve(0x1000_0000).unwrap().to_string();
        assert!(line.starts_with("segment 0 page 0x10000000 offset 0 bytes 512"));
        assert!(line.ends_with("faults 1 pages 1 fragmentation 3.50 KB"));
    }
}
