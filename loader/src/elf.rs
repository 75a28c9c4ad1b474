//! ELF Segment Map
//!
//! Decodes the parts of an ELF image a demand pager needs and nothing else:
//! the identification block, the entry point, the location of the program
//! header table, and the placement fields of every program header.
//!
//! # Format Support
//!
//! - ELF32 and ELF64, little endian
//! - Program headers decoded in file order, every type retained
//! - Sections, symbols, relocations and dynamic segments are ignored
//!
//! No validation of segment overlap, ordering or permissions happens here.
//! Those are resolved at fault time (first matching PT_LOAD wins).

use std::io::{self, Read, Seek, SeekFrom};

use bitflags::bitflags;

/// ELF magic number: 0x7F 'E' 'L' 'F'
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// Size of the identification block at the start of every ELF file
pub const EI_NIDENT: usize = 16;

/// ELF class: 32-bit
pub const ELFCLASS32: u8 = 1;

/// ELF class: 64-bit
pub const ELFCLASS64: u8 = 2;

/// ELF data encoding: little endian
pub const ELFDATA2LSB: u8 = 1;

/// ELF type: executable
pub const ET_EXEC: u16 = 2;

/// ELF type: shared object (PIE)
pub const ET_DYN: u16 = 3;

/// Machine type: Intel 80386
pub const EM_386: u16 = 3;

/// Machine type: ARM
pub const EM_ARM: u16 = 40;

/// Machine type: x86_64
pub const EM_X86_64: u16 = 62;

/// Machine type: AArch64
pub const EM_AARCH64: u16 = 183;

/// Machine type: RISC-V
pub const EM_RISCV: u16 = 243;

/// Program header type: unused entry
pub const PT_NULL: u32 = 0;

/// Program header type: loadable segment
pub const PT_LOAD: u32 = 1;

/// Program header type: dynamic linking info
pub const PT_DYNAMIC: u32 = 2;

/// Program header type: interpreter path
pub const PT_INTERP: u32 = 3;

/// Program header type: auxiliary notes
pub const PT_NOTE: u32 = 4;

/// Program header type: program header table
pub const PT_PHDR: u32 = 6;

/// Program header type: thread-local storage template
pub const PT_TLS: u32 = 7;

/// ELF32 file header size
pub const ELF32_EHDR_SIZE: usize = 52;

/// ELF64 file header size
pub const ELF64_EHDR_SIZE: usize = 64;

/// ELF32 program header size
pub const ELF32_PHDR_SIZE: usize = 32;

/// ELF64 program header size
pub const ELF64_PHDR_SIZE: usize = 56;

bitflags! {
    /// Segment permission bits (`p_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SegmentFlags: u32 {
        /// Segment is executable
        const EXECUTE = 1 << 0;
        /// Segment is writable
        const WRITE = 1 << 1;
        /// Segment is readable
        const READ = 1 << 2;
    }
}

/// Errors produced while decoding an image.
#[derive(thiserror::Error, Debug)]
pub enum ElfError {
    #[error("malformed ELF header: {reason}")]
    MalformedHeader { reason: &'static str },

    #[error("malformed program header table: {reason}")]
    MalformedProgramHeaders { reason: &'static str },

    #[error("image cannot run on this host: {reason}")]
    NotRunnable { reason: String },

    #[error("I/O error while reading image: {0}")]
    Io(#[from] io::Error),
}

/// Word size of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElfClass {
    /// ELFCLASS32
    Elf32,
    /// ELFCLASS64
    Elf64,
}

impl ElfClass {
    /// Decode the class byte of `e_ident`.
    pub fn from_ident(byte: u8) -> Option<Self> {
        match byte {
            ELFCLASS32 => Some(Self::Elf32),
            ELFCLASS64 => Some(Self::Elf64),
            _ => None,
        }
    }

    /// Size of the file header for this class.
    pub const fn header_size(self) -> usize {
        match self {
            Self::Elf32 => ELF32_EHDR_SIZE,
            Self::Elf64 => ELF64_EHDR_SIZE,
        }
    }

    /// Size of one program header record for this class.
    pub const fn phdr_size(self) -> usize {
        match self {
            Self::Elf32 => ELF32_PHDR_SIZE,
            Self::Elf64 => ELF64_PHDR_SIZE,
        }
    }

    /// Class the running loader can transfer control into.
    pub const fn host() -> Self {
        if cfg!(target_pointer_width = "64") {
            Self::Elf64
        } else {
            Self::Elf32
        }
    }
}

/// Decoded ELF file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Identification block (magic, class, encoding, version, ABI)
    pub ident: [u8; EI_NIDENT],
    /// Word size
    pub class: ElfClass,
    /// Object file type (`e_type`)
    pub kind: u16,
    /// Machine type
    pub machine: u16,
    /// Entry point virtual address
    pub entry: u64,
    /// Program header table file offset
    pub phoff: u64,
    /// Program header table entry size
    pub phentsize: u16,
    /// Program header table entry count
    pub phnum: u16,
}

impl FileHeader {
    /// Decode a file header from the bytes read at offset 0.
    ///
    /// `data` may be shorter than the largest header; whatever was read is
    /// checked against the size the class byte asks for.
    pub fn parse(data: &[u8]) -> Result<Self, ElfError> {
        if data.len() < EI_NIDENT {
            return Err(ElfError::MalformedHeader {
                reason: "file is shorter than the identification block",
            });
        }

        if data[0..4] != ELF_MAGIC {
            return Err(ElfError::MalformedHeader {
                reason: "bad magic number",
            });
        }

        let class = ElfClass::from_ident(data[4]).ok_or(ElfError::MalformedHeader {
            reason: "unknown ELF class",
        })?;

        if data[5] != ELFDATA2LSB {
            return Err(ElfError::MalformedHeader {
                reason: "only little-endian images are supported",
            });
        }

        if data.len() < class.header_size() {
            return Err(ElfError::MalformedHeader {
                reason: "file is shorter than the ELF header",
            });
        }

        let mut ident = [0u8; EI_NIDENT];
        ident.copy_from_slice(&data[..EI_NIDENT]);

        let kind = le_u16(data, 16);
        let machine = le_u16(data, 18);

        let header = match class {
            ElfClass::Elf32 => Self {
                ident,
                class,
                kind,
                machine,
                entry: u64::from(le_u32(data, 24)),
                phoff: u64::from(le_u32(data, 28)),
                phentsize: le_u16(data, 42),
                phnum: le_u16(data, 44),
            },
            ElfClass::Elf64 => Self {
                ident,
                class,
                kind,
                machine,
                entry: le_u64(data, 24),
                phoff: le_u64(data, 32),
                phentsize: le_u16(data, 54),
                phnum: le_u16(data, 56),
            },
        };

        Ok(header)
    }

    /// Byte length of the program header table.
    pub fn table_len(&self) -> usize {
        usize::from(self.phentsize) * usize::from(self.phnum)
    }

    /// Check that this image can be entered by the running loader.
    ///
    /// The loader calls the entry point directly, so the image must be a
    /// fixed-address executable for this host's word size and machine.
    pub fn check_runnable(&self) -> Result<(), ElfError> {
        if self.kind != ET_EXEC {
            let reason = if self.kind == ET_DYN {
                "position-independent images need relocation".to_string()
            } else {
                format!("object type {} is not an executable", self.kind)
            };
            return Err(ElfError::NotRunnable { reason });
        }

        if self.class != ElfClass::host() {
            return Err(ElfError::NotRunnable {
                reason: format!(
                    "{:?} image on a {}-bit host",
                    self.class,
                    usize::BITS
                ),
            });
        }

        if let Some(machine) = host_machine() {
            if self.machine != machine {
                return Err(ElfError::NotRunnable {
                    reason: format!(
                        "machine type {} does not match host machine type {}",
                        self.machine, machine
                    ),
                });
            }
        }

        if self.entry == 0 {
            return Err(ElfError::NotRunnable {
                reason: "entry point is null".to_string(),
            });
        }

        Ok(())
    }
}

/// `e_machine` value of the running host, when known.
pub const fn host_machine() -> Option<u16> {
    if cfg!(target_arch = "x86") {
        Some(EM_386)
    } else if cfg!(target_arch = "x86_64") {
        Some(EM_X86_64)
    } else if cfg!(target_arch = "arm") {
        Some(EM_ARM)
    } else if cfg!(target_arch = "aarch64") {
        Some(EM_AARCH64)
    } else if cfg!(any(target_arch = "riscv32", target_arch = "riscv64")) {
        Some(EM_RISCV)
    } else {
        None
    }
}

/// One program header table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Segment type (`p_type`)
    pub kind: u32,
    /// Segment permissions
    pub flags: SegmentFlags,
    /// File offset of segment data
    pub offset: u64,
    /// Virtual address where the segment lives
    pub vaddr: u64,
    /// Size of segment data in file
    pub filesz: u64,
    /// Size of segment in memory
    pub memsz: u64,
    /// Alignment requirement
    pub align: u64,
}

impl SegmentDescriptor {
    /// Decode one program header record. `d` must hold at least
    /// `class.phdr_size()` bytes.
    pub fn parse(class: ElfClass, d: &[u8]) -> Self {
        match class {
            ElfClass::Elf32 => Self {
                kind: le_u32(d, 0),
                offset: u64::from(le_u32(d, 4)),
                vaddr: u64::from(le_u32(d, 8)),
                filesz: u64::from(le_u32(d, 16)),
                memsz: u64::from(le_u32(d, 20)),
                flags: SegmentFlags::from_bits_retain(le_u32(d, 24)),
                align: u64::from(le_u32(d, 28)),
            },
            ElfClass::Elf64 => Self {
                kind: le_u32(d, 0),
                flags: SegmentFlags::from_bits_retain(le_u32(d, 4)),
                offset: le_u64(d, 8),
                vaddr: le_u64(d, 16),
                filesz: le_u64(d, 32),
                memsz: le_u64(d, 40),
                align: le_u64(d, 48),
            },
        }
    }

    /// Check if segment is loadable
    pub fn is_loadable(&self) -> bool {
        self.kind == PT_LOAD
    }

    /// First address past the in-memory extent of the segment.
    pub fn end(&self) -> u64 {
        self.vaddr.saturating_add(self.memsz)
    }

    /// Check if `addr` falls inside `[vaddr, vaddr + memsz)`.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.vaddr && addr < self.end()
    }

    /// Get segment permissions as a string
    pub fn permissions_string(&self) -> &'static str {
        let r = self.flags.contains(SegmentFlags::READ);
        let w = self.flags.contains(SegmentFlags::WRITE);
        let x = self.flags.contains(SegmentFlags::EXECUTE);
        match (r, w, x) {
            (true, true, true) => "rwx",
            (true, true, false) => "rw-",
            (true, false, true) => "r-x",
            (true, false, false) => "r--",
            (false, true, true) => "-wx",
            (false, true, false) => "-w-",
            (false, false, true) => "--x",
            (false, false, false) => "---",
        }
    }
}

/// Parsed image metadata: the file header and every program header in file
/// order.
#[derive(Debug, Clone)]
pub struct SegmentMap {
    header: FileHeader,
    segments: Vec<SegmentDescriptor>,
}

impl SegmentMap {
    /// Read the file header and program header table from `reader`.
    ///
    /// Performs exactly two reads: the header at offset 0 and the table at
    /// `phoff`. Nothing is mapped.
    pub fn read_from<R: Read + Seek>(reader: &mut R) -> Result<Self, ElfError> {
        let mut buf = [0u8; ELF64_EHDR_SIZE];
        reader.seek(SeekFrom::Start(0))?;
        let read = read_full(reader, &mut buf)?;
        let header = FileHeader::parse(&buf[..read])?;

        let phdr_size = header.class.phdr_size();
        if header.phnum > 0 && usize::from(header.phentsize) < phdr_size {
            return Err(ElfError::MalformedProgramHeaders {
                reason: "entry size is smaller than a program header",
            });
        }

        let len = header.table_len();
        let mut table = Vec::new();
        table
            .try_reserve_exact(len)
            .map_err(|_| ElfError::MalformedProgramHeaders {
                reason: "cannot allocate the program header table",
            })?;
        table.resize(len, 0);

        reader.seek(SeekFrom::Start(header.phoff))?;
        if read_full(reader, &mut table)? != len {
            return Err(ElfError::MalformedProgramHeaders {
                reason: "short read of the program header table",
            });
        }

        let segments: Vec<SegmentDescriptor> = if len == 0 {
            Vec::new()
        } else {
            table
                .chunks_exact(usize::from(header.phentsize))
                .map(|entry| SegmentDescriptor::parse(header.class, entry))
                .collect()
        };

        for (index, segment) in segments.iter().enumerate().filter(|(_, s)| s.is_loadable()) {
            log::debug!(
                "segment {}: vaddr={:#x} memsz={:#x} offset={:#x} filesz={:#x} {}",
                index,
                segment.vaddr,
                segment.memsz,
                segment.offset,
                segment.filesz,
                segment.permissions_string()
            );
        }

        Ok(Self { header, segments })
    }

    /// The decoded file header.
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Entry point virtual address.
    pub fn entry_point(&self) -> u64 {
        self.header.entry
    }

    /// Every program header in file order.
    pub fn segments(&self) -> &[SegmentDescriptor] {
        &self.segments
    }

    /// PT_LOAD entries with their program header index.
    pub fn loadable(&self) -> impl Iterator<Item = (usize, &SegmentDescriptor)> + '_ {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, segment)| segment.is_loadable())
    }

    /// Find the segment covering `addr`.
    ///
    /// Segment ranges are not guaranteed disjoint by the format, so the
    /// lookup is an ordered scan and the first PT_LOAD entry in file order
    /// that contains `addr` wins.
    pub fn find_loadable(&self, addr: u64) -> Option<(usize, &SegmentDescriptor)> {
        self.loadable().find(|(_, segment)| segment.contains(addr))
    }
}

/// Read until `buf` is full or the reader hits end of file.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn le_u16(d: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([d[at], d[at + 1]])
}

fn le_u32(d: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([d[at], d[at + 1], d[at + 2], d[at + 3]])
}

fn le_u64(d: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&d[at..at + 8]);
    u64::from_le_bytes(bytes)
}
