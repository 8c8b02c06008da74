//! Small in-memory ELF executables for tests.

use goblin::elf::header::{EM_386, EM_X86_64, ET_EXEC, EV_CURRENT};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD, PT_NOTE};
use goblin::elf::section_header::{
    SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_NOBITS, SHT_NOTE, SHT_PROGBITS, SHT_STRTAB,
    SHT_SYMTAB,
};

use crate::header::{file_header_layout, program_header_layout, HeaderField, ProgramHeader, SegmentField};
use crate::section::{section_header_layout, SectionField, SectionHeader};
use crate::sites::{BlockSite, CallSite, FunctionSites, LoopSites, PatchSite, SiteInventory};
use crate::structure::{align_up, BinaryStructure, Endian, RawRecord, Width};
use crate::symbol::{symbol_layout, Symbol, SymbolKind};

pub const TEXT_OFFSET: u64 = 0x100;
pub const TEXT_SIZE: u64 = 0x40;
pub const SECTION_COUNT: usize = 8;
pub const TEXT_INDEX: usize = 1;
pub const SYMTAB_INDEX: usize = 5;
pub const STRTAB_INDEX: usize = 6;
pub const SHSTRTAB_INDEX: usize = 7;

const NOP5: [u8; 5] = [0x0f, 0x1f, 0x44, 0x00, 0x00];

pub fn base_addr(width: Width) -> u64 {
    match width {
        Width::Elf32 => 0x0804_8000,
        Width::Elf64 => 0x0040_0000,
    }
}

pub fn text_addr(width: Width) -> u64 {
    base_addr(width) + TEXT_OFFSET
}

/// First page boundary above every mapped address of the sample
pub fn injected_base(width: Width) -> u64 {
    base_addr(width) + 0x1000
}

/// `.text` contents; offsets of interest are listed in [`sample_inventory`]
pub fn text_bytes() -> Vec<u8> {
    let mut code = Vec::with_capacity(TEXT_SIZE as usize);
    code.extend_from_slice(&NOP5); // 0x00 main entry, block 0
    code.extend_from_slice(&NOP5); // 0x05 loop entry
    code.extend_from_slice(&NOP5); // 0x0a loop exit
    code.push(0x90);
    code.extend_from_slice(&NOP5); // 0x10 block 1
    code.extend_from_slice(&[0x90, 0x90, 0x90]);
    code.extend_from_slice(&[0xe8, 0x03, 0x00, 0x00, 0x00]); // 0x18 call helper
    code.push(0xc3);
    code.extend_from_slice(&[0x90, 0x90]);
    code.extend_from_slice(&NOP5); // 0x20 helper entry, block 2
    code.extend_from_slice(&NOP5); // 0x25 helper exit
    code.push(0xc3);
    code.resize(TEXT_SIZE as usize, 0xcc);
    code
}

pub fn sample_inventory(width: Width) -> SiteInventory {
    let text = text_addr(width);
    let block = |id: u64, offset: u64, function: &str| BlockSite {
        id,
        address: text + offset,
        length: 5,
        function: Some(function.to_string()),
    };
    SiteInventory {
        functions: vec![
            FunctionSites {
                name: "main".to_string(),
                entry: PatchSite::new(text, 5),
                exits: vec![],
            },
            FunctionSites {
                name: "helper".to_string(),
                entry: PatchSite::new(text + 0x20, 5),
                exits: vec![PatchSite::new(text + 0x25, 5)],
            },
        ],
        blocks: vec![block(0, 0x00, "main"), block(1, 0x10, "main"), block(2, 0x20, "helper")],
        loops: vec![LoopSites {
            hash: 123456,
            entries: vec![PatchSite::new(text + 0x05, 5)],
            exits: vec![PatchSite::new(text + 0x0a, 5)],
        }],
        call_sites: vec![CallSite {
            address: text + 0x18,
            callee: "helper".to_string(),
        }],
    }
}

fn put(out: &mut Vec<u8>, offset: u64, bytes: &[u8]) {
    let start = offset as usize;
    if out.len() < start + bytes.len() {
        out.resize(start + bytes.len(), 0);
    }
    out[start..start + bytes.len()].copy_from_slice(bytes);
}

fn names(strings: &[&str]) -> (Vec<u8>, Vec<u32>) {
    let mut table = vec![0u8];
    let mut offsets = Vec::new();
    for s in strings {
        offsets.push(table.len() as u32);
        table.extend_from_slice(s.as_bytes());
        table.push(0);
    }
    (table, offsets)
}

#[allow(clippy::too_many_arguments)]
fn section(
    width: Width,
    index: usize,
    name: u32,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
) -> SectionHeader {
    let mut h = SectionHeader::new(width, Endian::Little, index);
    h.set(SectionField::Name, name as u64).unwrap();
    h.set(SectionField::Type, sh_type as u64).unwrap();
    h.set(SectionField::Flags, flags).unwrap();
    h.set(SectionField::Addr, addr).unwrap();
    h.set(SectionField::Offset, offset).unwrap();
    h.set(SectionField::Size, size).unwrap();
    h.set(SectionField::AddrAlign, 1).unwrap();
    h
}

/// A little-endian x86 executable with `.text`, `.data`, `.note`, `.bss`,
/// `.symtab`, `.strtab` and `.shstrtab`; one `PT_LOAD` and one `PT_NOTE`
pub fn sample_elf(width: Width) -> Vec<u8> {
    let le = Endian::Little;
    let base = base_addr(width);
    let ehsize = file_header_layout(width).size as u64;
    let phentsize = program_header_layout(width).size as u64;
    let shentsize = section_header_layout(width).size as u64;
    let symentsize = symbol_layout(width).size as u64;

    let mut out = vec![0u8; TEXT_OFFSET as usize];
    put(&mut out, TEXT_OFFSET, &text_bytes());
    put(&mut out, 0x140, &[0x11; 0x10]); // .data
    put(&mut out, 0x150, &[0x04, 0, 0, 0, 0, 0, 0, 0, 0x01, 0, 0, 0, b'G', b'N', b'U', 0]); // .note

    let (strtab, sym_names) = names(&["main", "helper"]);
    let mut symtab = Symbol::null(width, le).raw_bytes().to_vec();
    let main = Symbol::global(width, le, sym_names[0], SymbolKind::Function, text_addr(width), 0x20, 1).unwrap();
    let helper = Symbol::global(width, le, sym_names[1], SymbolKind::Function, text_addr(width) + 0x20, 0x0b, 1).unwrap();
    symtab.extend_from_slice(main.raw_bytes());
    symtab.extend_from_slice(helper.raw_bytes());

    let symtab_off = 0x160;
    put(&mut out, symtab_off, &symtab);
    let strtab_off = symtab_off + symtab.len() as u64;
    put(&mut out, strtab_off, &strtab);

    let (shstrtab, sec_names) = names(&[".text", ".data", ".note", ".bss", ".symtab", ".strtab", ".shstrtab"]);
    let shstrtab_off = strtab_off + strtab.len() as u64;
    put(&mut out, shstrtab_off, &shstrtab);

    let shoff = align_up(out.len() as u64, 8);
    let alloc = SHF_ALLOC as u64;
    let mut headers = vec![
        SectionHeader::new(width, le, 0),
        section(width, 1, sec_names[0], SHT_PROGBITS, alloc | SHF_EXECINSTR as u64, text_addr(width), TEXT_OFFSET, TEXT_SIZE),
        section(width, 2, sec_names[1], SHT_PROGBITS, alloc | SHF_WRITE as u64, base + 0x140, 0x140, 0x10),
        section(width, 3, sec_names[2], SHT_NOTE, alloc, base + 0x150, 0x150, 0x10),
        section(width, 4, sec_names[3], SHT_NOBITS, alloc | SHF_WRITE as u64, base + 0x160, 0x160, 0x20),
        section(width, 5, sec_names[4], SHT_SYMTAB, 0, 0, symtab_off, symtab.len() as u64),
        section(width, 6, sec_names[5], SHT_STRTAB, 0, 0, strtab_off, strtab.len() as u64),
        section(width, 7, sec_names[6], SHT_STRTAB, 0, 0, shstrtab_off, shstrtab.len() as u64),
    ];
    headers[1].set(SectionField::AddrAlign, 16).unwrap();
    headers[5].set(SectionField::Link, STRTAB_INDEX as u64).unwrap();
    headers[5].set(SectionField::Info, 1).unwrap();
    headers[5].set(SectionField::EntSize, symentsize).unwrap();
    headers[5].set(SectionField::AddrAlign, width.word_size() as u64).unwrap();
    for (i, h) in headers.iter().enumerate() {
        put(&mut out, shoff + i as u64 * shentsize, h.raw_bytes());
    }

    let mut load = ProgramHeader::new(width, le);
    load.set(SegmentField::Type, PT_LOAD as u64).unwrap();
    load.set(SegmentField::Flags, (PF_R | PF_W | PF_X) as u64).unwrap();
    load.set(SegmentField::Vaddr, base).unwrap();
    load.set(SegmentField::Paddr, base).unwrap();
    load.set(SegmentField::Filesz, 0x160).unwrap();
    load.set(SegmentField::Memsz, 0x180).unwrap();
    load.set(SegmentField::Align, 0x1000).unwrap();

    let mut note = ProgramHeader::new(width, le);
    note.set(SegmentField::Type, PT_NOTE as u64).unwrap();
    note.set(SegmentField::Flags, PF_R as u64).unwrap();
    note.set(SegmentField::Offset, 0x150).unwrap();
    note.set(SegmentField::Vaddr, base + 0x150).unwrap();
    note.set(SegmentField::Paddr, base + 0x150).unwrap();
    note.set(SegmentField::Filesz, 0x10).unwrap();
    note.set(SegmentField::Memsz, 0x10).unwrap();
    note.set(SegmentField::Align, 4).unwrap();

    put(&mut out, ehsize, load.raw_bytes());
    put(&mut out, ehsize + phentsize, note.raw_bytes());

    let mut ehdr: RawRecord<HeaderField> = RawRecord::zeroed(file_header_layout(width), le);
    let mut ident = [0u8; 16];
    ident[..4].copy_from_slice(b"\x7fELF");
    ident[4] = width.class();
    ident[5] = le.data();
    ident[6] = EV_CURRENT;
    ehdr.set_bytes(HeaderField::Ident, &ident).unwrap();
    ehdr.set(HeaderField::Type, ET_EXEC as u64).unwrap();
    let machine = match width {
        Width::Elf32 => EM_386,
        Width::Elf64 => EM_X86_64,
    };
    ehdr.set(HeaderField::Machine, machine as u64).unwrap();
    ehdr.set(HeaderField::Version, EV_CURRENT as u64).unwrap();
    ehdr.set(HeaderField::Entry, text_addr(width)).unwrap();
    ehdr.set(HeaderField::Phoff, ehsize).unwrap();
    ehdr.set(HeaderField::Shoff, shoff).unwrap();
    ehdr.set(HeaderField::Ehsize, ehsize).unwrap();
    ehdr.set(HeaderField::Phentsize, phentsize).unwrap();
    ehdr.set(HeaderField::Phnum, 2).unwrap();
    ehdr.set(HeaderField::Shentsize, shentsize).unwrap();
    ehdr.set(HeaderField::Shnum, SECTION_COUNT as u64).unwrap();
    ehdr.set(HeaderField::Shstrndx, SHSTRTAB_INDEX as u64).unwrap();
    put(&mut out, 0, ehdr.raw_bytes());

    out
}
