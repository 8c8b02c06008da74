//! # ELF Image
//!
//! The whole parsed file: header, program headers and the ordered section
//! sequence, with lookups by name and by virtual address. Section order is
//! the on-disk section index; sections are only ever appended.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use goblin::elf::section_header::{SHF_ALLOC, SHN_LORESERVE, SHN_UNDEF, SHT_STRTAB, SHT_SYMTAB};
use tracing::{debug, info};

use crate::descriptor::PatchTarget;
use crate::error::{InstrumentError, InstrumentResult};
use crate::header::{FileHeader, HeaderField, ProgramHeader};
use crate::section::{Section, SectionContents, SectionField, SectionHeader, SectionKind};
use crate::string_pool::StringPool;
use crate::structure::{align_up, BinaryStructure, Endian, Width};
use crate::symbol::{parse_symbols, symbol_layout, Symbol, SymbolKind};

/// Attributes of a section created by the rewriter
#[derive(Debug, Clone)]
pub struct NewSection {
    pub name: String,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub align: u64,
    pub entsize: u64,
    pub link: u32,
    pub info: u32,
    pub contents: SectionContents,
}

#[derive(Debug, Clone)]
pub struct ElfImage {
    header: FileHeader,
    program_headers: Vec<ProgramHeader>,
    sections: Vec<Section>,
    original: Vec<u8>,
    original_section_count: usize,
    mapped_end: u64,
    by_name: HashMap<String, usize>,
    by_address: BTreeMap<u64, Vec<usize>>,
}

impl ElfImage {
    /// Read a file and parse it
    pub fn from_path(path: &Path) -> InstrumentResult<Self> {
        let mut file = File::open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        debug!("read {} ({} bytes)", path.display(), data.len());
        Self::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> InstrumentResult<Self> {
        let header = FileHeader::parse(&data)?;
        let width = header.width();
        let endian = header.endian();
        let file_len = data.len() as u64;

        let mut program_headers = Vec::with_capacity(header.phnum());
        if header.phnum() > 0 {
            let entsize = header.get(HeaderField::Phentsize);
            let end = entsize
                .checked_mul(header.phnum() as u64)
                .and_then(|size| size.checked_add(header.phoff()))
                .ok_or_else(|| InstrumentError::structural("program header table extent overflows"))?;
            if end > file_len {
                return Err(InstrumentError::structural(format!(
                    "program header table ends at 0x{:x}, past end of file (0x{:x})",
                    end, file_len
                )));
            }
            let mut cursor = Cursor::new(&data[..]);
            cursor.seek(SeekFrom::Start(header.phoff()))?;
            for _ in 0..header.phnum() {
                let mut ph = ProgramHeader::new(width, endian);
                ph.read(&mut cursor)?;
                ph.verify()?;
                program_headers.push(ph);
            }
        }

        let shnum = header.shnum();
        if shnum == 0 {
            return Err(InstrumentError::structural("file has no section header table"));
        }
        let shentsize = header.get(HeaderField::Shentsize);
        let sht_end = shentsize
            .checked_mul(shnum as u64)
            .and_then(|size| size.checked_add(header.shoff()))
            .ok_or_else(|| InstrumentError::structural("section header table extent overflows"))?;
        if sht_end > file_len {
            return Err(InstrumentError::structural(format!(
                "section header table ends at 0x{:x}, past end of file (0x{:x})",
                sht_end, file_len
            )));
        }

        let mut sections = Vec::with_capacity(shnum);
        for index in 0..shnum {
            let start = (header.shoff() + shentsize * index as u64) as usize;
            let sh = SectionHeader::parse(width, endian, index, &data[start..])?;
            if index > 0 {
                sh.verify()?;
            }
            if sh.link() as usize >= shnum {
                return Err(InstrumentError::structural(format!(
                    "section {}: sh_link {} outside {} sections",
                    index,
                    sh.link(),
                    shnum
                )));
            }
            debug!("{}", sh);
            sections.push(Section::load(sh, &data)?);
        }

        let shstrndx = header.shstrndx();
        if sections[shstrndx].kind() != SectionKind::StringTable {
            return Err(InstrumentError::structural(format!(
                "e_shstrndx {} is not a string table",
                shstrndx
            )));
        }
        for index in 0..shnum {
            let offset = sections[index].header().name_offset();
            let name = match sections[shstrndx].string_pool() {
                Some(pool) => pool.get_string(offset)?.into_owned(),
                None => String::new(),
            };
            sections[index].set_name(name);
        }

        let mapped_end = Self::compute_mapped_end(&program_headers, &sections);

        let mut image = Self {
            header,
            program_headers,
            sections,
            original: data,
            original_section_count: shnum,
            mapped_end,
            by_name: HashMap::new(),
            by_address: BTreeMap::new(),
        };
        image.rebuild_indices();
        image.verify()?;

        info!(
            "loaded {} image: {} sections, {} program headers, entry 0x{:x}",
            width,
            image.sections.len(),
            image.program_headers.len(),
            image.entry()
        );
        Ok(image)
    }

    fn compute_mapped_end(program_headers: &[ProgramHeader], sections: &[Section]) -> u64 {
        let segments = program_headers.iter().filter_map(ProgramHeader::memory_end);
        let allocated = sections
            .iter()
            .filter(|s| s.header().has_alloc_bit())
            .map(|s| s.header().addr().saturating_add(s.header().size()));
        segments.chain(allocated).max().unwrap_or(0)
    }

    fn rebuild_indices(&mut self) {
        self.by_name.clear();
        self.by_address.clear();
        for section in &self.sections {
            if !section.name().is_empty() {
                self.by_name
                    .entry(section.name().to_string())
                    .or_insert(section.index());
            }
            let h = section.header();
            if h.has_alloc_bit() && h.size() > 0 {
                self.by_address.entry(h.addr()).or_default().push(section.index());
            }
        }
        // file-backed sections first among those sharing a start address
        for indices in self.by_address.values_mut() {
            let sections = &self.sections;
            indices.sort_by_key(|&i| (!sections[i].header().has_file_contents(), i));
        }
    }

    /// Check the cross-structure invariants: names resolve, sizes match
    /// contents, symbol section indices resolve
    pub fn verify(&self) -> InstrumentResult<()> {
        self.header.verify()?;
        if self.header.shnum() != self.sections.len() {
            return Err(InstrumentError::structural(format!(
                "e_shnum {} but {} sections held",
                self.header.shnum(),
                self.sections.len()
            )));
        }

        let names = self.shstrtab()?;
        for section in &self.sections {
            names.get_string(section.header().name_offset())?;
            if section.index() > 0 {
                section.verify()?;
            }
        }

        if let Some(symtab) = self.symtab_index() {
            let shnum = self.sections.len();
            for (i, symbol) in self.raw_symbols(symtab)?.iter().enumerate() {
                let shndx = symbol.shndx();
                if shndx as u32 >= SHN_LORESERVE || shndx as u32 == SHN_UNDEF {
                    continue;
                }
                if shndx as usize >= shnum {
                    return Err(InstrumentError::out_of_range(
                        format!("section index of symbol {}", i),
                        shndx as u64,
                        shnum as u64,
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn width(&self) -> Width {
        self.header.width()
    }

    pub fn endian(&self) -> Endian {
        self.header.endian()
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub(crate) fn header_mut(&mut self) -> &mut FileHeader {
        &mut self.header
    }

    pub fn machine(&self) -> u16 {
        self.header.machine()
    }

    pub fn entry(&self) -> u64 {
        self.header.entry()
    }

    pub fn set_entry(&mut self, address: u64) -> InstrumentResult<()> {
        self.header.set(HeaderField::Entry, address)
    }

    pub fn program_headers(&self) -> &[ProgramHeader] {
        &self.program_headers
    }

    pub(crate) fn program_headers_mut(&mut self) -> &mut [ProgramHeader] {
        &mut self.program_headers
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, index: usize) -> InstrumentResult<&Section> {
        let count = self.sections.len();
        self.sections
            .get(index)
            .ok_or_else(|| InstrumentError::out_of_range("section index", index as u64, count as u64))
    }

    pub(crate) fn section_mut(&mut self, index: usize) -> InstrumentResult<&mut Section> {
        let count = self.sections.len();
        self.sections
            .get_mut(index)
            .ok_or_else(|| InstrumentError::out_of_range("section index", index as u64, count as u64))
    }

    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.by_name.get(name).map(|&i| &self.sections[i])
    }

    /// Allocatable section whose address range holds `address`
    pub fn section_containing(&self, address: u64) -> Option<&Section> {
        let (_, indices) = self.by_address.range(..=address).next_back()?;
        indices
            .iter()
            .map(|&i| &self.sections[i])
            .find(|s| s.in_range(address))
    }

    /// Bytes of the input file as loaded
    pub fn original_bytes(&self) -> &[u8] {
        &self.original
    }

    pub fn original_section_count(&self) -> usize {
        self.original_section_count
    }

    /// Highest virtual address mapped by the input file
    pub fn mapped_end(&self) -> u64 {
        self.mapped_end
    }

    /// Virtual base of the injected region
    pub fn injected_base(&self, page_size: u64) -> u64 {
        align_up(self.mapped_end, page_size)
    }

    /// First free address above every allocatable section, aligned
    pub fn next_free_address(&self, page_size: u64, align: u64) -> u64 {
        let top = self
            .sections
            .iter()
            .filter(|s| s.header().has_alloc_bit())
            .map(|s| s.header().addr().saturating_add(s.header().size()))
            .max()
            .unwrap_or(0);
        align_up(top.max(self.injected_base(page_size)), align)
    }

    /// Program header entry that can be turned into the injected `PT_LOAD`
    pub fn injection_slot(&self) -> Option<usize> {
        self.program_headers.iter().position(ProgramHeader::is_reusable)
    }

    fn shstrtab(&self) -> InstrumentResult<&StringPool> {
        let index = self.header.shstrndx();
        self.section(index)?
            .string_pool()
            .ok_or_else(|| InstrumentError::structural("section name table is not a string table"))
    }

    pub fn symtab_index(&self) -> Option<usize> {
        self.sections
            .iter()
            .position(|s| s.header().sh_type() == SHT_SYMTAB)
    }

    fn raw_symbols(&self, symtab: usize) -> InstrumentResult<Vec<Symbol>> {
        parse_symbols(self.width(), self.endian(), self.section(symtab)?.bytes())
    }

    /// Every `.symtab` entry with its resolved name
    pub fn symbols(&self) -> InstrumentResult<Vec<(String, Symbol)>> {
        let symtab = match self.symtab_index() {
            Some(index) => index,
            None => return Ok(Vec::new()),
        };
        let strtab = self.section(self.sections[symtab].header().link() as usize)?;
        let pool = strtab.string_pool().ok_or_else(|| {
            InstrumentError::structural(format!("symbol table {} is not linked to a string table", symtab))
        })?;
        self.raw_symbols(symtab)?
            .into_iter()
            .map(|sym| Ok((pool.get_string(sym.name_offset())?.into_owned(), sym)))
            .collect()
    }

    pub fn find_symbol(&self, name: &str) -> InstrumentResult<Option<Symbol>> {
        Ok(self
            .symbols()?
            .into_iter()
            .find(|(n, sym)| n == name && sym.shndx() as u32 != SHN_UNDEF)
            .map(|(_, sym)| sym))
    }

    pub fn has_symbol(&self, name: &str) -> InstrumentResult<bool> {
        Ok(self.symbols()?.iter().any(|(n, _)| n == name))
    }

    /// Append a section and return its index. `sh_offset` is assigned when the
    /// image is written.
    pub fn add_section(&mut self, new: NewSection) -> InstrumentResult<usize> {
        let index = self.sections.len();
        if index as u32 >= SHN_LORESERVE {
            return Err(InstrumentError::out_of_range(
                "section count",
                index as u64 + 1,
                SHN_LORESERVE as u64 - 1,
            ));
        }
        let shstrndx = self.header.shstrndx();
        let name_offset = self
            .section_mut(shstrndx)?
            .string_pool_mut()
            .ok_or_else(|| InstrumentError::structural("section name table is not a string table"))?
            .add_string(&new.name)?;

        let mut sh = SectionHeader::new(self.width(), self.endian(), index);
        sh.set(SectionField::Name, name_offset as u64)?;
        sh.set(SectionField::Type, new.sh_type as u64)?;
        sh.set(SectionField::Flags, new.flags)?;
        sh.set(SectionField::Addr, new.addr)?;
        sh.set(SectionField::AddrAlign, new.align)?;
        sh.set(SectionField::EntSize, new.entsize)?;
        sh.set(SectionField::Link, new.link as u64)?;
        sh.set(SectionField::Info, new.info as u64)?;
        sh.set_section_type();

        let mut section = Section::injected(sh, new.name, new.contents);
        section.sync_size()?;
        self.sections.push(section);
        self.header.set(HeaderField::Shnum, self.sections.len() as u64)?;
        self.section_mut(shstrndx)?.sync_size()?;
        self.rebuild_indices();

        debug!("added section [{}] {}", index, self.sections[index].name());
        Ok(index)
    }

    fn ensure_symtab(&mut self) -> InstrumentResult<usize> {
        if let Some(index) = self.symtab_index() {
            return Ok(index);
        }

        let strtab = self.add_section(NewSection {
            name: ".strtab".to_string(),
            sh_type: SHT_STRTAB,
            flags: 0,
            addr: 0,
            align: 1,
            entsize: 0,
            link: 0,
            info: 0,
            contents: SectionContents::Strings(StringPool::new(self.sections.len())),
        })?;
        let null = Symbol::null(self.width(), self.endian());
        let symtab = self.add_section(NewSection {
            name: ".symtab".to_string(),
            sh_type: SHT_SYMTAB,
            flags: 0,
            addr: 0,
            align: self.width().word_size() as u64,
            entsize: symbol_layout(self.width()).size as u64,
            link: strtab as u32,
            info: 1,
            contents: SectionContents::Bytes(null.raw_bytes().to_vec()),
        })?;
        info!("created .symtab [{}] and .strtab [{}]", symtab, strtab);
        Ok(symtab)
    }

    /// Append a global symbol and return its index in `.symtab`
    pub fn add_symbol(
        &mut self,
        name: &str,
        kind: SymbolKind,
        value: u64,
        size: u64,
        shndx: usize,
    ) -> InstrumentResult<usize> {
        if shndx >= self.sections.len() {
            return Err(InstrumentError::out_of_range(
                "symbol section index",
                shndx as u64,
                self.sections.len() as u64,
            ));
        }
        let symtab = self.ensure_symtab()?;
        let strtab = self.sections[symtab].header().link() as usize;
        let name_offset = self
            .section_mut(strtab)?
            .string_pool_mut()
            .ok_or_else(|| InstrumentError::structural("symbol string table is not a string table"))?
            .add_string(name)?;
        self.section_mut(strtab)?.sync_size()?;

        let symbol = Symbol::global(
            self.width(),
            self.endian(),
            name_offset,
            kind,
            value,
            size,
            shndx as u16,
        )?;
        let section = self.section_mut(symtab)?;
        let data = section
            .bytes_mut()
            .ok_or_else(|| InstrumentError::structural("symbol table holds no bytes"))?;
        let entsize = symbol.size_in_bytes();
        data.extend_from_slice(symbol.raw_bytes());
        let index = data.len() / entsize - 1;
        section.sync_size()?;
        Ok(index)
    }

    /// File-backed section bytes and offset within the section for `[vaddr, vaddr+len)`
    fn locate(&self, vaddr: u64, len: usize) -> InstrumentResult<(usize, usize)> {
        let section = self
            .section_containing(vaddr)
            .ok_or_else(|| InstrumentError::invalid_site(vaddr, "address is not in any allocated section"))?;
        let h = section.header();
        if !h.has_file_contents() {
            return Err(InstrumentError::invalid_site(
                vaddr,
                format!("section {} has no file contents", section.name()),
            ));
        }
        let start = (vaddr - h.addr()) as usize;
        if start + len > section.bytes().len() {
            return Err(InstrumentError::invalid_site(
                vaddr,
                format!("{} bytes run past the end of {}", len, section.name()),
            ));
        }
        Ok((section.index(), start))
    }
}

impl PatchTarget for ElfImage {
    fn read_bytes(&self, vaddr: u64, len: usize) -> InstrumentResult<Vec<u8>> {
        let (index, start) = self.locate(vaddr, len)?;
        Ok(self.sections[index].bytes()[start..start + len].to_vec())
    }

    fn write_bytes(&mut self, vaddr: u64, bytes: &[u8]) -> InstrumentResult<()> {
        let (index, start) = self.locate(vaddr, bytes.len())?;
        let data = self.sections[index].bytes_mut().ok_or_else(|| {
            InstrumentError::invalid_site(vaddr, "section contents cannot be patched")
        })?;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

/// Flags of an injected allocatable section
pub(crate) fn alloc_flags(extra: u32) -> u64 {
    (SHF_ALLOC | extra) as u64
}
