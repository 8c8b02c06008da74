//! # Sections and Section Headers
//!
//! A section header is one fixed-size record per section in either the
//! 32-bit or the 64-bit layout. Everything above the raw record (permission
//! predicates, type classification, address-range membership) is written
//! once against the field keys and works for both widths.

use std::fmt;
use std::io::{Seek, SeekFrom, Write};
use std::ops::Range;

use goblin::elf::section_header::{
    SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_DYNAMIC, SHT_DYNSYM, SHT_FINI_ARRAY, SHT_INIT_ARRAY,
    SHT_NOBITS, SHT_NOTE, SHT_NULL, SHT_PREINIT_ARRAY, SHT_PROGBITS, SHT_REL, SHT_RELA,
    SHT_STRTAB, SHT_SYMTAB,
};

use crate::error::{InstrumentError, InstrumentResult};
use crate::string_pool::StringPool;
use crate::structure::{BinaryStructure, Endian, FieldKey, FieldSpec, Layout, RawRecord, Width};
use crate::symbol::symbol_layout;

/// Fields of a section header entry
#[derive(Debug, Clone, Copy)]
pub enum SectionField {
    Name,
    Type,
    Flags,
    Addr,
    Offset,
    Size,
    Link,
    Info,
    AddrAlign,
    EntSize,
}

impl FieldKey for SectionField {
    fn index(self) -> usize {
        self as usize
    }
}

static SECTION_HEADER_32: Layout = Layout {
    name: "Elf32_Shdr",
    size: 40,
    fields: &[
        FieldSpec::new("sh_name", 0, 4),
        FieldSpec::new("sh_type", 4, 4),
        FieldSpec::new("sh_flags", 8, 4),
        FieldSpec::new("sh_addr", 12, 4),
        FieldSpec::new("sh_offset", 16, 4),
        FieldSpec::new("sh_size", 20, 4),
        FieldSpec::new("sh_link", 24, 4),
        FieldSpec::new("sh_info", 28, 4),
        FieldSpec::new("sh_addralign", 32, 4),
        FieldSpec::new("sh_entsize", 36, 4),
    ],
};

static SECTION_HEADER_64: Layout = Layout {
    name: "Elf64_Shdr",
    size: 64,
    fields: &[
        FieldSpec::new("sh_name", 0, 4),
        FieldSpec::new("sh_type", 4, 4),
        FieldSpec::new("sh_flags", 8, 8),
        FieldSpec::new("sh_addr", 16, 8),
        FieldSpec::new("sh_offset", 24, 8),
        FieldSpec::new("sh_size", 32, 8),
        FieldSpec::new("sh_link", 40, 4),
        FieldSpec::new("sh_info", 44, 4),
        FieldSpec::new("sh_addralign", 48, 8),
        FieldSpec::new("sh_entsize", 56, 8),
    ],
};

pub fn section_header_layout(width: Width) -> &'static Layout {
    match width {
        Width::Elf32 => &SECTION_HEADER_32,
        Width::Elf64 => &SECTION_HEADER_64,
    }
}

/// Coarse classification used to pick the accessor for a section's contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Code,
    Data,
    StringTable,
    SymbolTable,
    Relocation,
    None,
}

impl SectionKind {
    pub fn name(self) -> &'static str {
        match self {
            SectionKind::Code => "code",
            SectionKind::Data => "data",
            SectionKind::StringTable => "string-table",
            SectionKind::SymbolTable => "symbol-table",
            SectionKind::Relocation => "relocation",
            SectionKind::None => "none",
        }
    }
}

/// One section header entry
#[derive(Debug, Clone)]
pub struct SectionHeader {
    index: usize,
    width: Width,
    kind: SectionKind,
    record: RawRecord<SectionField>,
}

impl SectionHeader {
    pub fn new(width: Width, endian: Endian, index: usize) -> Self {
        Self {
            index,
            width,
            kind: SectionKind::None,
            record: RawRecord::zeroed(section_header_layout(width), endian),
        }
    }

    /// Decode entry `index` from the start of `data` and classify it
    pub fn parse(width: Width, endian: Endian, index: usize, data: &[u8]) -> InstrumentResult<Self> {
        let mut header = Self {
            index,
            width,
            kind: SectionKind::None,
            record: RawRecord::from_bytes(section_header_layout(width), endian, data)?,
        };
        header.set_section_type();
        Ok(header)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn width(&self) -> Width {
        self.width
    }

    pub fn get(&self, field: SectionField) -> u64 {
        self.record.get(field)
    }

    pub fn set(&mut self, field: SectionField, value: u64) -> InstrumentResult<()> {
        self.record.set(field, value)
    }

    pub fn name_offset(&self) -> u32 {
        self.get(SectionField::Name) as u32
    }

    pub fn sh_type(&self) -> u32 {
        self.get(SectionField::Type) as u32
    }

    pub fn flags(&self) -> u64 {
        self.get(SectionField::Flags)
    }

    pub fn addr(&self) -> u64 {
        self.get(SectionField::Addr)
    }

    pub fn offset(&self) -> u64 {
        self.get(SectionField::Offset)
    }

    pub fn size(&self) -> u64 {
        self.get(SectionField::Size)
    }

    pub fn link(&self) -> u32 {
        self.get(SectionField::Link) as u32
    }

    pub fn align(&self) -> u64 {
        self.get(SectionField::AddrAlign)
    }

    pub fn has_write_bit(&self) -> bool {
        self.flags() & SHF_WRITE as u64 != 0
    }

    pub fn has_alloc_bit(&self) -> bool {
        self.flags() & SHF_ALLOC as u64 != 0
    }

    pub fn has_exec_instr_bit(&self) -> bool {
        self.flags() & SHF_EXECINSTR as u64 != 0
    }

    /// Whether the section occupies bytes in the file
    pub fn has_file_contents(&self) -> bool {
        !matches!(self.sh_type(), SHT_NOBITS | SHT_NULL)
    }

    /// Absolute file range of the section's contents
    pub fn data_range(&self) -> InstrumentResult<Option<Range<u64>>> {
        if !self.has_file_contents() {
            return Ok(None);
        }
        let end = self.offset().checked_add(self.size()).ok_or_else(|| {
            InstrumentError::structural(format!(
                "section {}: sh_offset 0x{:x} + sh_size 0x{:x} overflows",
                self.index,
                self.offset(),
                self.size()
            ))
        })?;
        Ok(Some(self.offset()..end))
    }

    /// Classify from raw type and flags, remember and return the result
    pub fn set_section_type(&mut self) -> SectionKind {
        self.kind = match self.sh_type() {
            SHT_SYMTAB | SHT_DYNSYM => SectionKind::SymbolTable,
            SHT_STRTAB => SectionKind::StringTable,
            SHT_REL | SHT_RELA => SectionKind::Relocation,
            SHT_PROGBITS if self.has_exec_instr_bit() => SectionKind::Code,
            SHT_PROGBITS | SHT_NOBITS | SHT_NOTE | SHT_DYNAMIC | SHT_INIT_ARRAY
            | SHT_FINI_ARRAY | SHT_PREINIT_ARRAY
                if self.has_alloc_bit() =>
            {
                SectionKind::Data
            }
            _ => SectionKind::None,
        };
        self.kind
    }

    pub fn section_type(&self) -> SectionKind {
        self.kind
    }

    /// True iff `address` lies in `[sh_addr, sh_addr + sh_size)` of an
    /// allocatable section
    pub fn in_range(&self, address: u64) -> bool {
        if !self.has_alloc_bit() {
            return false;
        }
        let start = self.addr();
        address >= start && address - start < self.size()
    }

    /// Human-readable name of the raw section type
    pub fn type_name(&self) -> &'static str {
        match self.sh_type() {
            SHT_NULL => "NULL",
            SHT_PROGBITS => "PROGBITS",
            SHT_SYMTAB => "SYMTAB",
            SHT_STRTAB => "STRTAB",
            SHT_RELA => "RELA",
            SHT_DYNAMIC => "DYNAMIC",
            SHT_NOTE => "NOTE",
            SHT_NOBITS => "NOBITS",
            SHT_REL => "REL",
            SHT_DYNSYM => "DYNSYM",
            SHT_INIT_ARRAY => "INIT_ARRAY",
            SHT_FINI_ARRAY => "FINI_ARRAY",
            SHT_PREINIT_ARRAY => "PREINIT_ARRAY",
            _ => "OTHER",
        }
    }

    /// Section flags to string
    pub fn flags_str(&self) -> String {
        let mut result = String::new();
        if self.has_write_bit() {
            result.push('W');
        }
        if self.has_alloc_bit() {
            result.push('A');
        }
        if self.has_exec_instr_bit() {
            result.push('X');
        }
        if result.is_empty() {
            result.push('-');
        }
        result
    }
}

impl BinaryStructure for SectionHeader {
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

        let align = self.align();
        if align > 1 && !align.is_power_of_two() {
            return Err(InstrumentError::structural(format!(
                "section {}: alignment {} is not a power of two",
                self.index, align
            )));
        }
        self.data_range()?;
        if self.has_alloc_bit() && self.addr().checked_add(self.size()).is_none() {
            return Err(InstrumentError::structural(format!(
                "section {}: sh_addr 0x{:x} + sh_size 0x{:x} overflows",
                self.index,
                self.addr(),
                self.size()
            )));
        }

        match self.sh_type() {
            SHT_STRTAB if self.size() == 0 => Err(InstrumentError::structural(format!(
                "section {}: string table with size 0",
                self.index
            ))),
            SHT_SYMTAB | SHT_DYNSYM => {
                let entsize = symbol_layout(self.width).size as u64;
                if self.get(SectionField::EntSize) != entsize {
                    return Err(InstrumentError::structural(format!(
                        "section {}: symbol entry size {} (expected {})",
                        self.index,
                        self.get(SectionField::EntSize),
                        entsize
                    )));
                }
                if self.size() == 0 || self.size() % entsize != 0 {
                    return Err(InstrumentError::structural(format!(
                        "section {}: symbol table size {} is not a positive multiple of {}",
                        self.index,
                        self.size(),
                        entsize
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for SectionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:>2}] {:<13} {:<12} {:>3} addr 0x{:08x} off 0x{:06x} size 0x{:06x} link {} align {}",
            self.index,
            self.type_name(),
            self.kind.name(),
            self.flags_str(),
            self.addr(),
            self.offset(),
            self.size(),
            self.link(),
            self.align()
        )
    }
}

/// Where a section's bytes came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Read from the input at this file range
    Original { offset: u64, size: u64 },
    /// Created by the rewriter; the writer assigns its file offset
    Injected,
}

/// In-memory contents of a section
#[derive(Debug, Clone)]
pub enum SectionContents {
    Bytes(Vec<u8>),
    Strings(StringPool),
    NoBits,
}

/// A section: header, resolved name and contents
#[derive(Debug, Clone)]
pub struct Section {
    header: SectionHeader,
    name: String,
    contents: SectionContents,
    placement: Placement,
}

impl Section {
    /// Attach contents from the input file to a parsed header
    pub fn load(header: SectionHeader, file: &[u8]) -> InstrumentResult<Self> {
        let contents = match header.data_range()? {
            None => SectionContents::NoBits,
            Some(range) => {
                if range.end > file.len() as u64 {
                    return Err(InstrumentError::structural(format!(
                        "section {}: contents 0x{:x}..0x{:x} extend past end of file (0x{:x})",
                        header.index(),
                        range.start,
                        range.end,
                        file.len()
                    )));
                }
                let data = &file[range.start as usize..range.end as usize];
                if header.section_type() == SectionKind::StringTable {
                    SectionContents::Strings(StringPool::read(header.index(), data)?)
                } else {
                    SectionContents::Bytes(data.to_vec())
                }
            }
        };
        let placement = Placement::Original {
            offset: header.offset(),
            size: header.size(),
        };
        Ok(Self {
            header,
            name: String::new(),
            contents,
            placement,
        })
    }

    /// A section created by the rewriter
    pub fn injected(header: SectionHeader, name: String, contents: SectionContents) -> Self {
        Self {
            header,
            name,
            contents,
            placement: Placement::Injected,
        }
    }

    pub fn index(&self) -> usize {
        self.header.index()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn header(&self) -> &SectionHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut SectionHeader {
        &mut self.header
    }

    pub fn kind(&self) -> SectionKind {
        self.header.section_type()
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn in_range(&self, address: u64) -> bool {
        self.header.in_range(address)
    }

    /// File-backed bytes (empty for `SHT_NOBITS`)
    pub fn bytes(&self) -> &[u8] {
        match &self.contents {
            SectionContents::Bytes(data) => data,
            SectionContents::Strings(pool) => pool.as_bytes(),
            SectionContents::NoBits => &[],
        }
    }

    pub fn bytes_mut(&mut self) -> Option<&mut Vec<u8>> {
        match &mut self.contents {
            SectionContents::Bytes(data) => Some(data),
            _ => None,
        }
    }

    pub fn string_pool(&self) -> Option<&StringPool> {
        match &self.contents {
            SectionContents::Strings(pool) => Some(pool),
            _ => None,
        }
    }

    pub fn string_pool_mut(&mut self) -> Option<&mut StringPool> {
        match &mut self.contents {
            SectionContents::Strings(pool) => Some(pool),
            _ => None,
        }
    }

    /// Whether the contents no longer fit in their original file range
    pub fn outgrew_placement(&self) -> bool {
        match self.placement {
            Placement::Original { size, .. } => self.bytes().len() as u64 > size,
            Placement::Injected => false,
        }
    }

    /// Bring `sh_size` in line with the in-memory contents
    pub fn sync_size(&mut self) -> InstrumentResult<()> {
        if matches!(self.contents, SectionContents::NoBits) {
            return Ok(());
        }
        let len = self.bytes().len() as u64;
        if self.header.size() != len {
            self.header.set(SectionField::Size, len)?;
        }
        Ok(())
    }

    /// `sh_size` equals the buffer length for every file-backed section
    pub fn verify(&self) -> InstrumentResult<()> {
        self.header.verify()?;
        if !matches!(self.contents, SectionContents::NoBits)
            && self.header.size() != self.bytes().len() as u64
        {
            return Err(InstrumentError::structural(format!(
                "section {} ({}): sh_size 0x{:x} but holds 0x{:x} bytes",
                self.index(),
                self.name,
                self.header.size(),
                self.bytes().len()
            )));
        }
        Ok(())
    }

    /// Write the contents at the header's file offset
    pub fn dump<W: Write + Seek>(&self, output: &mut W) -> InstrumentResult<()> {
        match &self.contents {
            SectionContents::NoBits => Ok(()),
            SectionContents::Strings(pool) => pool.dump(output, self.header.offset()),
            SectionContents::Bytes(data) => {
                output.seek(SeekFrom::Start(self.header.offset()))?;
                output.write_all(data)?;
                Ok(())
            }
        }
    }
}
