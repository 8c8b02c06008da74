//! # File Header and Program Headers
//!
//! The identification bytes at the start of the file select the width and
//! byte order used for every other record. Program headers are preserved
//! byte-for-byte; the only edit ever made is turning one `PT_NOTE` or
//! `PT_NULL` entry into the `PT_LOAD` that maps injected code.

use std::fmt;
use std::io::Cursor;

use goblin::elf::header::{EI_CLASS, EI_DATA, ELFMAG, SELFMAG};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD, PT_NOTE, PT_NULL};
use goblin::elf::section_header::{SHN_LORESERVE, SHN_XINDEX};

use crate::error::{InstrumentError, InstrumentResult};
use crate::section::section_header_layout;
use crate::structure::{BinaryStructure, Endian, FieldKey, FieldSpec, Layout, RawRecord, Width};

/// Size of `e_ident`
pub const IDENT_SIZE: usize = 16;

/// Fields of the ELF file header
#[derive(Debug, Clone, Copy)]
pub enum HeaderField {
    Ident,
    Type,
    Machine,
    Version,
    Entry,
    Phoff,
    Shoff,
    Flags,
    Ehsize,
    Phentsize,
    Phnum,
    Shentsize,
    Shnum,
    Shstrndx,
}

impl FieldKey for HeaderField {
    fn index(self) -> usize {
        self as usize
    }
}

static FILE_HEADER_32: Layout = Layout {
    name: "Elf32_Ehdr",
    size: 52,
    fields: &[
        FieldSpec::new("e_ident", 0, IDENT_SIZE),
        FieldSpec::new("e_type", 16, 2),
        FieldSpec::new("e_machine", 18, 2),
        FieldSpec::new("e_version", 20, 4),
        FieldSpec::new("e_entry", 24, 4),
        FieldSpec::new("e_phoff", 28, 4),
        FieldSpec::new("e_shoff", 32, 4),
        FieldSpec::new("e_flags", 36, 4),
        FieldSpec::new("e_ehsize", 40, 2),
        FieldSpec::new("e_phentsize", 42, 2),
        FieldSpec::new("e_phnum", 44, 2),
        FieldSpec::new("e_shentsize", 46, 2),
        FieldSpec::new("e_shnum", 48, 2),
        FieldSpec::new("e_shstrndx", 50, 2),
    ],
};

static FILE_HEADER_64: Layout = Layout {
    name: "Elf64_Ehdr",
    size: 64,
    fields: &[
        FieldSpec::new("e_ident", 0, IDENT_SIZE),
        FieldSpec::new("e_type", 16, 2),
        FieldSpec::new("e_machine", 18, 2),
        FieldSpec::new("e_version", 20, 4),
        FieldSpec::new("e_entry", 24, 8),
        FieldSpec::new("e_phoff", 32, 8),
        FieldSpec::new("e_shoff", 40, 8),
        FieldSpec::new("e_flags", 48, 4),
        FieldSpec::new("e_ehsize", 52, 2),
        FieldSpec::new("e_phentsize", 54, 2),
        FieldSpec::new("e_phnum", 56, 2),
        FieldSpec::new("e_shentsize", 58, 2),
        FieldSpec::new("e_shnum", 60, 2),
        FieldSpec::new("e_shstrndx", 62, 2),
    ],
};

pub fn file_header_layout(width: Width) -> &'static Layout {
    match width {
        Width::Elf32 => &FILE_HEADER_32,
        Width::Elf64 => &FILE_HEADER_64,
    }
}

/// ELF file header
#[derive(Debug, Clone)]
pub struct FileHeader {
    width: Width,
    record: RawRecord<HeaderField>,
}

impl FileHeader {
    /// Parse the header at the start of `data`
    pub fn parse(data: &[u8]) -> InstrumentResult<Self> {
        if data.len() < IDENT_SIZE {
            return Err(InstrumentError::structural(format!(
                "file too short for ELF identification: {} bytes",
                data.len()
            )));
        }
        if &data[..SELFMAG] != ELFMAG {
            return Err(InstrumentError::structural("invalid ELF magic"));
        }

        let width = Width::from_class(data[EI_CLASS])?;
        let endian = Endian::from_data(data[EI_DATA])?;

        let mut header = Self {
            width,
            record: RawRecord::zeroed(file_header_layout(width), endian),
        };
        header.read(&mut Cursor::new(data))?;
        header.verify()?;
        Ok(header)
    }

    pub fn width(&self) -> Width {
        self.width
    }

    pub fn endian(&self) -> Endian {
        self.record.endian()
    }

    pub fn get(&self, field: HeaderField) -> u64 {
        self.record.get(field)
    }

    pub fn set(&mut self, field: HeaderField, value: u64) -> InstrumentResult<()> {
        self.record.set(field, value)
    }

    pub fn file_type(&self) -> u16 {
        self.get(HeaderField::Type) as u16
    }

    pub fn machine(&self) -> u16 {
        self.get(HeaderField::Machine) as u16
    }

    pub fn entry(&self) -> u64 {
        self.get(HeaderField::Entry)
    }

    pub fn phoff(&self) -> u64 {
        self.get(HeaderField::Phoff)
    }

    pub fn phnum(&self) -> usize {
        self.get(HeaderField::Phnum) as usize
    }

    pub fn shoff(&self) -> u64 {
        self.get(HeaderField::Shoff)
    }

    pub fn shnum(&self) -> usize {
        self.get(HeaderField::Shnum) as usize
    }

    pub fn shstrndx(&self) -> usize {
        self.get(HeaderField::Shstrndx) as usize
    }
}

impl BinaryStructure for FileHeader {
    fn size_in_bytes(&self) -> usize {
        self.record.size_in_bytes()
    }

    fn raw_bytes(&self) -> &[u8] {
        self.record.raw_bytes()
    }

    fn raw_bytes_mut(&mut self) -> &mut [u8] {
        self.record.raw_bytes_mut()
    }

    fn verify(&self) -> InstrumentResult<()> {
        self.record.verify()?;

        let ehsize = self.get(HeaderField::Ehsize) as usize;
        if ehsize != self.size_in_bytes() {
            return Err(InstrumentError::structural(format!(
                "e_ehsize {} does not match {} header size {}",
                ehsize,
                self.width,
                self.size_in_bytes()
            )));
        }

        let shnum = self.shnum();
        if shnum == 0 && self.shoff() != 0 {
            return Err(InstrumentError::structural(
                "extended section numbering is not supported",
            ));
        }
        if shnum as u32 >= SHN_LORESERVE {
            return Err(InstrumentError::structural(format!(
                "section count {} is in the reserved range",
                shnum
            )));
        }
        if shnum > 0 {
            let expected = section_header_layout(self.width).size;
            let shentsize = self.get(HeaderField::Shentsize) as usize;
            if shentsize != expected {
                return Err(InstrumentError::structural(format!(
                    "e_shentsize {} does not match {} section header size {}",
                    shentsize, self.width, expected
                )));
            }
            let shstrndx = self.shstrndx();
            if shstrndx as u32 == SHN_XINDEX || shstrndx >= shnum {
                return Err(InstrumentError::structural(format!(
                    "e_shstrndx {} outside {} sections",
                    shstrndx, shnum
                )));
            }
        }

        if self.phnum() > 0 {
            let expected = program_header_layout(self.width).size;
            let phentsize = self.get(HeaderField::Phentsize) as usize;
            if phentsize != expected {
                return Err(InstrumentError::structural(format!(
                    "e_phentsize {} does not match {} program header size {}",
                    phentsize, self.width, expected
                )));
            }
        }
        Ok(())
    }
}

/// Fields of a program header entry
#[derive(Debug, Clone, Copy)]
pub enum SegmentField {
    Type,
    Flags,
    Offset,
    Vaddr,
    Paddr,
    Filesz,
    Memsz,
    Align,
}

impl FieldKey for SegmentField {
    fn index(self) -> usize {
        self as usize
    }
}

static PROGRAM_HEADER_32: Layout = Layout {
    name: "Elf32_Phdr",
    size: 32,
    fields: &[
        FieldSpec::new("p_type", 0, 4),
        FieldSpec::new("p_flags", 24, 4),
        FieldSpec::new("p_offset", 4, 4),
        FieldSpec::new("p_vaddr", 8, 4),
        FieldSpec::new("p_paddr", 12, 4),
        FieldSpec::new("p_filesz", 16, 4),
        FieldSpec::new("p_memsz", 20, 4),
        FieldSpec::new("p_align", 28, 4),
    ],
};

static PROGRAM_HEADER_64: Layout = Layout {
    name: "Elf64_Phdr",
    size: 56,
    fields: &[
        FieldSpec::new("p_type", 0, 4),
        FieldSpec::new("p_flags", 4, 4),
        FieldSpec::new("p_offset", 8, 8),
        FieldSpec::new("p_vaddr", 16, 8),
        FieldSpec::new("p_paddr", 24, 8),
        FieldSpec::new("p_filesz", 32, 8),
        FieldSpec::new("p_memsz", 40, 8),
        FieldSpec::new("p_align", 48, 8),
    ],
};

pub fn program_header_layout(width: Width) -> &'static Layout {
    match width {
        Width::Elf32 => &PROGRAM_HEADER_32,
        Width::Elf64 => &PROGRAM_HEADER_64,
    }
}

/// Program header (segment) entry
#[derive(Debug, Clone)]
pub struct ProgramHeader {
    record: RawRecord<SegmentField>,
}

impl ProgramHeader {
    pub fn new(width: Width, endian: Endian) -> Self {
        Self {
            record: RawRecord::zeroed(program_header_layout(width), endian),
        }
    }

    pub fn get(&self, field: SegmentField) -> u64 {
        self.record.get(field)
    }

    pub fn set(&mut self, field: SegmentField, value: u64) -> InstrumentResult<()> {
        self.record.set(field, value)
    }

    pub fn segment_type(&self) -> u32 {
        self.get(SegmentField::Type) as u32
    }

    pub fn is_load(&self) -> bool {
        self.segment_type() == PT_LOAD
    }

    /// Entries that can be given up to map injected code
    pub fn is_reusable(&self) -> bool {
        matches!(self.segment_type(), PT_NOTE | PT_NULL)
    }

    /// End of the memory image of a loadable segment
    pub fn memory_end(&self) -> Option<u64> {
        if self.is_load() {
            Some(self.get(SegmentField::Vaddr).saturating_add(self.get(SegmentField::Memsz)))
        } else {
            None
        }
    }

    /// Rewrite this entry as a readable, writable, executable `PT_LOAD`
    pub fn make_load(&mut self, offset: u64, vaddr: u64, size: u64, align: u64) -> InstrumentResult<()> {
        self.set(SegmentField::Type, PT_LOAD as u64)?;
        self.set(SegmentField::Flags, (PF_R | PF_W | PF_X) as u64)?;
        self.set(SegmentField::Offset, offset)?;
        self.set(SegmentField::Vaddr, vaddr)?;
        self.set(SegmentField::Paddr, vaddr)?;
        self.set(SegmentField::Filesz, size)?;
        self.set(SegmentField::Memsz, size)?;
        self.set(SegmentField::Align, align)
    }
}

impl BinaryStructure for ProgramHeader {
    fn size_in_bytes(&self) -> usize {
        self.record.size_in_bytes()
    }

    fn raw_bytes(&self) -> &[u8] {
        self.record.raw_bytes()
    }

    fn raw_bytes_mut(&mut self) -> &mut [u8] {
        self.record.raw_bytes_mut()
    }

    fn verify(&self) -> InstrumentResult<()> {
        self.record.verify()?;
        if self.is_load() && self.get(SegmentField::Filesz) > self.get(SegmentField::Memsz) {
            return Err(InstrumentError::structural(format!(
                "PT_LOAD at 0x{:x} has p_filesz larger than p_memsz",
                self.get(SegmentField::Vaddr)
            )));
        }
        let offset = self.get(SegmentField::Offset);
        let vaddr = self.get(SegmentField::Vaddr);
        if offset.checked_add(self.get(SegmentField::Filesz)).is_none()
            || vaddr.checked_add(self.get(SegmentField::Memsz)).is_none()
        {
            return Err(InstrumentError::structural(format!(
                "program header at 0x{:x}: segment extent overflows",
                vaddr
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ProgramHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type 0x{:x} off 0x{:x} vaddr 0x{:x} filesz 0x{:x} memsz 0x{:x} flags 0x{:x}",
            self.segment_type(),
            self.get(SegmentField::Offset),
            self.get(SegmentField::Vaddr),
            self.get(SegmentField::Filesz),
            self.get(SegmentField::Memsz),
            self.get(SegmentField::Flags)
        )
    }
}
