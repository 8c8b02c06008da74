//! Symbol table entries for both ELF widths.

use std::fmt;

use goblin::elf::sym::{STB_GLOBAL, STB_LOCAL, STT_FUNC, STT_NOTYPE, STT_OBJECT};

use crate::error::InstrumentResult;
use crate::structure::{BinaryStructure, Endian, FieldKey, FieldSpec, Layout, RawRecord, Width};

#[derive(Debug, Clone, Copy)]
pub enum SymbolField {
    Name,
    Value,
    Size,
    Info,
    Other,
    Shndx,
}

impl FieldKey for SymbolField {
    fn index(self) -> usize {
        self as usize
    }
}

static SYMBOL_32: Layout = Layout {
    name: "Elf32_Sym",
    size: 16,
    fields: &[
        FieldSpec::new("st_name", 0, 4),
        FieldSpec::new("st_value", 4, 4),
        FieldSpec::new("st_size", 8, 4),
        FieldSpec::new("st_info", 12, 1),
        FieldSpec::new("st_other", 13, 1),
        FieldSpec::new("st_shndx", 14, 2),
    ],
};

static SYMBOL_64: Layout = Layout {
    name: "Elf64_Sym",
    size: 24,
    fields: &[
        FieldSpec::new("st_name", 0, 4),
        FieldSpec::new("st_value", 8, 8),
        FieldSpec::new("st_size", 16, 8),
        FieldSpec::new("st_info", 4, 1),
        FieldSpec::new("st_other", 5, 1),
        FieldSpec::new("st_shndx", 6, 2),
    ],
};

pub fn symbol_layout(width: Width) -> &'static Layout {
    match width {
        Width::Elf32 => &SYMBOL_32,
        Width::Elf64 => &SYMBOL_64,
    }
}

/// What a symbol names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Object,
    NoType,
}

impl SymbolKind {
    fn st_type(self) -> u8 {
        match self {
            SymbolKind::Function => STT_FUNC,
            SymbolKind::Object => STT_OBJECT,
            SymbolKind::NoType => STT_NOTYPE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Symbol {
    record: RawRecord<SymbolField>,
}

impl Symbol {
    /// The all-zero entry every symbol table starts with
    pub fn null(width: Width, endian: Endian) -> Self {
        Self {
            record: RawRecord::zeroed(symbol_layout(width), endian),
        }
    }

    /// A global symbol defined in section `shndx`
    pub fn global(
        width: Width,
        endian: Endian,
        name_offset: u32,
        kind: SymbolKind,
        value: u64,
        size: u64,
        shndx: u16,
    ) -> InstrumentResult<Self> {
        let mut symbol = Self::null(width, endian);
        symbol.record.set(SymbolField::Name, name_offset as u64)?;
        symbol.record.set(SymbolField::Value, value)?;
        symbol.record.set(SymbolField::Size, size)?;
        symbol
            .record
            .set(SymbolField::Info, ((STB_GLOBAL << 4) | kind.st_type()) as u64)?;
        symbol.record.set(SymbolField::Shndx, shndx as u64)?;
        Ok(symbol)
    }

    pub fn parse(width: Width, endian: Endian, data: &[u8]) -> InstrumentResult<Self> {
        Ok(Self {
            record: RawRecord::from_bytes(symbol_layout(width), endian, data)?,
        })
    }

    pub fn name_offset(&self) -> u32 {
        self.record.get(SymbolField::Name) as u32
    }

    pub fn value(&self) -> u64 {
        self.record.get(SymbolField::Value)
    }

    pub fn size(&self) -> u64 {
        self.record.get(SymbolField::Size)
    }

    pub fn shndx(&self) -> u16 {
        self.record.get(SymbolField::Shndx) as u16
    }

    pub fn bind(&self) -> u8 {
        (self.record.get(SymbolField::Info) as u8) >> 4
    }

    pub fn st_type(&self) -> u8 {
        (self.record.get(SymbolField::Info) as u8) & 0xf
    }

    pub fn is_function(&self) -> bool {
        self.st_type() == STT_FUNC
    }

    pub fn is_local(&self) -> bool {
        self.bind() == STB_LOCAL
    }
}

impl BinaryStructure for Symbol {
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
        self.record.verify()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "value 0x{:x} size {} bind {} type {} shndx {}",
            self.value(),
            self.size(),
            self.bind(),
            self.st_type(),
            self.shndx()
        )
    }
}

/// Decode every entry of a symbol table section
pub fn parse_symbols(width: Width, endian: Endian, data: &[u8]) -> InstrumentResult<Vec<Symbol>> {
    let entsize = symbol_layout(width).size;
    data.chunks_exact(entsize)
        .map(|chunk| Symbol::parse(width, endian, chunk))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layouts_are_consistent() {
        SYMBOL_32.verify().unwrap();
        SYMBOL_64.verify().unwrap();
    }

    #[test]
    fn test_global_function_encoding() {
        let sym = Symbol::global(Width::Elf64, Endian::Little, 9, SymbolKind::Function, 0x401000, 0x20, 1)
            .unwrap();
        let raw = sym.raw_bytes();
        assert_eq!(raw.len(), 24);
        assert_eq!(raw[4], 0x12);
        assert_eq!(&raw[6..8], &[1, 0]);
        assert!(sym.is_function());
        assert!(!sym.is_local());
        assert_eq!(sym.value(), 0x401000);
    }

    #[test]
    fn test_parse_table() {
        let mut data = Symbol::null(Width::Elf32, Endian::Little).raw_bytes().to_vec();
        let obj = Symbol::global(Width::Elf32, Endian::Little, 1, SymbolKind::Object, 0x8049000, 4, 2)
            .unwrap();
        data.extend_from_slice(obj.raw_bytes());

        let symbols = parse_symbols(Width::Elf32, Endian::Little, &data).unwrap();
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].value(), 0);
        assert_eq!(symbols[1].name_offset(), 1);
        assert_eq!(symbols[1].st_type(), STT_OBJECT);
        assert_eq!(symbols[1].shndx(), 2);
    }

    #[test]
    fn test_32bit_rejects_wide_value() {
        assert!(Symbol::global(Width::Elf32, Endian::Little, 1, SymbolKind::Function, 1 << 40, 0, 1).is_err());
    }
}
