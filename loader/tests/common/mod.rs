//! Builds little-endian ELF images for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Write;

use lazyload::elf::{ELF_MAGIC, ET_EXEC, PT_LOAD};
use lazyload::page::{MapError, PageMapper, Protection};

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

/// One program header plus the file bytes it points at.
#[derive(Debug, Clone)]
pub struct Phdr {
    pub kind: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

#[derive(Debug, Clone)]
pub struct ImageBuilder {
    elf64: bool,
    kind: u16,
    machine: u16,
    entry: u64,
    phdrs: Vec<Phdr>,
    blobs: Vec<(u64, Vec<u8>)>,
    min_len: usize,
}

impl ImageBuilder {
    pub fn elf64(machine: u16) -> Self {
        Self {
            elf64: true,
            kind: ET_EXEC,
            machine,
            entry: 0,
            phdrs: Vec::new(),
            blobs: Vec::new(),
            min_len: 0,
        }
    }

    pub fn elf32(machine: u16) -> Self {
        Self {
            elf64: false,
            ..Self::elf64(machine)
        }
    }

    pub fn entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }

    pub fn phdr(mut self, phdr: Phdr) -> Self {
        self.phdrs.push(phdr);
        self
    }

    /// PT_LOAD whose file bytes are `data`, placed at `offset`.
    pub fn load(mut self, vaddr: u64, offset: u64, data: &[u8], memsz: u64, flags: u32) -> Self {
        self.phdrs.push(Phdr {
            kind: PT_LOAD,
            flags,
            offset,
            vaddr,
            filesz: data.len() as u64,
            memsz,
        });
        self.blobs.push((offset, data.to_vec()));
        self
    }

    /// Pad the image to at least `len` bytes.
    pub fn min_len(mut self, len: usize) -> Self {
        self.min_len = len;
        self
    }

    pub fn header_size(&self) -> usize {
        if self.elf64 {
            64
        } else {
            52
        }
    }

    pub fn phdr_size(&self) -> usize {
        if self.elf64 {
            56
        } else {
            32
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let ehsize = self.header_size();
        let phsize = self.phdr_size();
        let table_end = ehsize + phsize * self.phdrs.len();

        let blob_end = self
            .blobs
            .iter()
            .map(|(offset, data)| *offset as usize + data.len())
            .max()
            .unwrap_or(0);
        let mut image = vec![0u8; table_end.max(blob_end).max(self.min_len)];

        image[0..4].copy_from_slice(&ELF_MAGIC);
        image[4] = if self.elf64 { 2 } else { 1 };
        image[5] = 1;
        image[6] = 1;
        put16(&mut image, 16, self.kind);
        put16(&mut image, 18, self.machine);
        put32(&mut image, 20, 1);

        if self.elf64 {
            put64(&mut image, 24, self.entry);
            put64(&mut image, 32, ehsize as u64);
            put16(&mut image, 52, ehsize as u16);
            put16(&mut image, 54, phsize as u16);
            put16(&mut image, 56, self.phdrs.len() as u16);
        } else {
            put32(&mut image, 24, self.entry as u32);
            put32(&mut image, 28, ehsize as u32);
            put16(&mut image, 40, ehsize as u16);
            put16(&mut image, 42, phsize as u16);
            put16(&mut image, 44, self.phdrs.len() as u16);
        }

        for (i, p) in self.phdrs.iter().enumerate() {
            let at = ehsize + i * phsize;
            put32(&mut image, at, p.kind);
            if self.elf64 {
                put32(&mut image, at + 4, p.flags);
                put64(&mut image, at + 8, p.offset);
                put64(&mut image, at + 16, p.vaddr);
                put64(&mut image, at + 24, p.vaddr);
                put64(&mut image, at + 32, p.filesz);
                put64(&mut image, at + 40, p.memsz);
                put64(&mut image, at + 48, 0x1000);
            } else {
                put32(&mut image, at + 4, p.offset as u32);
                put32(&mut image, at + 8, p.vaddr as u32);
                put32(&mut image, at + 12, p.vaddr as u32);
                put32(&mut image, at + 16, p.filesz as u32);
                put32(&mut image, at + 20, p.memsz as u32);
                put32(&mut image, at + 24, p.flags);
                put32(&mut image, at + 28, 0x1000);
            }
        }

        for (offset, data) in &self.blobs {
            let start = *offset as usize;
            image[start..start + data.len()].copy_from_slice(data);
        }

        image
    }

    pub fn write_temp(&self) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&self.build()).unwrap();
        file.flush().unwrap();
        file
    }
}

fn put16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

/// Deterministic non-zero filler so copied bytes are distinguishable from
/// zero fill.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) | 1)
        .collect()
}

/// Heap-backed stand-in for mmap.
#[derive(Debug, Default)]
pub struct MemoryMapper {
    pub pages: BTreeMap<u64, Vec<u8>>,
}

impl PageMapper for MemoryMapper {
    fn map_fixed(&mut self, page: u64, len: usize, _prot: Protection) -> Result<(), MapError> {
        if self.pages.contains_key(&page) {
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
