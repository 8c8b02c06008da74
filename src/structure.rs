//! # Binary Structure Model
//!
//! Every fixed-size record in an ELF file (file header, program header,
//! section header, symbol) and in the runtime descriptor table is held as an
//! in-memory copy of its raw bytes plus a [`Layout`]: an ordered list of
//! named fields with their byte offset and width. One generic routine reads
//! and writes fields through the layout, so the 32-bit and 64-bit variants of
//! a record differ only in their tables.
//!
//! ```text
//! Layout (SectionHeader, 64-bit)       raw bytes
//! +-------------+--------+-------+     +----+----+--------+--------+--
//! | sh_name     | off 0  | w 4   | --> |name|type| flags  |  addr  | ...
//! | sh_type     | off 4  | w 4   |     +----+----+--------+--------+--
//! | sh_flags    | off 8  | w 8   |
//! | ...         |        |       |
//! +-------------+--------+-------+
//! ```

use std::fmt;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use goblin::elf::header::{ELFCLASS32, ELFCLASS64, ELFDATA2LSB, ELFDATA2MSB};

use crate::error::{InstrumentError, InstrumentResult};

/// Address width of an ELF file, selected by `e_ident[EI_CLASS]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Elf32,
    Elf64,
}

impl Width {
    pub fn from_class(class: u8) -> InstrumentResult<Self> {
        match class {
            ELFCLASS32 => Ok(Width::Elf32),
            ELFCLASS64 => Ok(Width::Elf64),
            other => Err(InstrumentError::structural(format!(
                "unsupported ELF class {}",
                other
            ))),
        }
    }

    pub fn class(self) -> u8 {
        match self {
            Width::Elf32 => ELFCLASS32,
            Width::Elf64 => ELFCLASS64,
        }
    }

    /// Size of an address-sized field in bytes
    pub fn word_size(self) -> usize {
        match self {
            Width::Elf32 => 4,
            Width::Elf64 => 8,
        }
    }

    pub fn max_address(self) -> u64 {
        match self {
            Width::Elf32 => u32::MAX as u64,
            Width::Elf64 => u64::MAX,
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Width::Elf32 => write!(f, "ELF32"),
            Width::Elf64 => write!(f, "ELF64"),
        }
    }
}

/// Byte order of an ELF file, selected by `e_ident[EI_DATA]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn from_data(data: u8) -> InstrumentResult<Self> {
        match data {
            ELFDATA2LSB => Ok(Endian::Little),
            ELFDATA2MSB => Ok(Endian::Big),
            other => Err(InstrumentError::structural(format!(
                "unsupported ELF data encoding {}",
                other
            ))),
        }
    }

    pub fn data(self) -> u8 {
        match self {
            Endian::Little => ELFDATA2LSB,
            Endian::Big => ELFDATA2MSB,
        }
    }

    /// Read an unsigned integer of `width` bytes (1..=8)
    pub fn read_uint(self, buf: &[u8], width: usize) -> u64 {
        match self {
            Endian::Little => LittleEndian::read_uint(buf, width),
            Endian::Big => BigEndian::read_uint(buf, width),
        }
    }

    /// Write an unsigned integer of `width` bytes (1..=8). The value must fit.
    pub fn write_uint(self, buf: &mut [u8], value: u64, width: usize) {
        match self {
            Endian::Little => LittleEndian::write_uint(buf, value, width),
            Endian::Big => BigEndian::write_uint(buf, value, width),
        }
    }
}

/// One named field inside a fixed-size record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub offset: usize,
    pub width: usize,
}

impl FieldSpec {
    pub const fn new(name: &'static str, offset: usize, width: usize) -> Self {
        Self {
            name,
            offset,
            width,
        }
    }

    /// Fields wider than a machine word are opaque byte blobs
    pub fn is_blob(&self) -> bool {
        self.width > 8
    }
}

/// Declared on-disk shape of a record
///
/// Fields are listed in key order, not offset order: the field for a key is
/// `fields[key.index()]` in every width variant of the same record.
#[derive(Debug)]
pub struct Layout {
    pub name: &'static str,
    pub size: usize,
    pub fields: &'static [FieldSpec],
}

impl Layout {
    /// Check that every field lies inside the record and no two overlap
    pub fn verify(&self) -> InstrumentResult<()> {
        let mut spans: Vec<(usize, usize, &str)> = Vec::with_capacity(self.fields.len());
        for field in self.fields {
            if field.width == 0 || field.offset + field.width > self.size {
                return Err(InstrumentError::structural(format!(
                    "{}: field {} ({}+{}) outside record of {} bytes",
                    self.name, field.name, field.offset, field.width, self.size
                )));
            }
            spans.push((field.offset, field.offset + field.width, field.name));
        }

        spans.sort_unstable();
        for pair in spans.windows(2) {
            if pair[0].1 > pair[1].0 {
                return Err(InstrumentError::structural(format!(
                    "{}: fields {} and {} overlap",
                    self.name, pair[0].2, pair[1].2
                )));
            }
        }
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Typed key selecting a field of one record kind
pub trait FieldKey: Copy + fmt::Debug {
    fn index(self) -> usize;
}

/// Common contract of every fixed-size structure
pub trait BinaryStructure {
    /// Declared serialized size
    fn size_in_bytes(&self) -> usize;

    fn raw_bytes(&self) -> &[u8];

    fn raw_bytes_mut(&mut self) -> &mut [u8];

    /// Internal consistency check; a failure means downstream offsets are
    /// meaningless and the load must be aborted.
    fn verify(&self) -> InstrumentResult<()>;

    /// Fill the structure from a positioned stream and return bytes consumed
    fn read<R: Read>(&mut self, input: &mut R) -> InstrumentResult<usize>
    where
        Self: Sized,
    {
        let size = self.size_in_bytes();
        input
            .read_exact(&mut self.raw_bytes_mut()[..size])
            .map_err(|e| match e.kind() {
                ErrorKind::UnexpectedEof => InstrumentError::structural(format!(
                    "truncated record: needed {} bytes",
                    size
                )),
                _ => InstrumentError::Io(e),
            })?;
        Ok(size)
    }

    /// Write the raw bytes at `offset` in the output
    fn dump<W: Write + Seek>(&self, output: &mut W, offset: u64) -> InstrumentResult<()>
    where
        Self: Sized,
    {
        output.seek(SeekFrom::Start(offset))?;
        output.write_all(self.raw_bytes())?;
        Ok(())
    }
}

/// Raw bytes of one record interpreted through a layout
#[derive(Clone)]
pub struct RawRecord<K> {
    layout: &'static Layout,
    endian: Endian,
    bytes: Vec<u8>,
    _key: PhantomData<K>,
}

impl<K: FieldKey> RawRecord<K> {
    pub fn zeroed(layout: &'static Layout, endian: Endian) -> Self {
        Self {
            layout,
            endian,
            bytes: vec![0; layout.size],
            _key: PhantomData,
        }
    }

    pub fn from_bytes(layout: &'static Layout, endian: Endian, data: &[u8]) -> InstrumentResult<Self> {
        if data.len() < layout.size {
            return Err(InstrumentError::structural(format!(
                "{}: need {} bytes, have {}",
                layout.name,
                layout.size,
                data.len()
            )));
        }
        Ok(Self {
            layout,
            endian,
            bytes: data[..layout.size].to_vec(),
            _key: PhantomData,
        })
    }

    pub fn layout(&self) -> &'static Layout {
        self.layout
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn field(&self, key: K) -> &'static FieldSpec {
        &self.layout.fields[key.index()]
    }

    /// Read an integer field
    pub fn get(&self, key: K) -> u64 {
        let field = self.field(key);
        debug_assert!(!field.is_blob(), "{} is a blob field", field.name);
        self.endian.read_uint(
            &self.bytes[field.offset..field.offset + field.width],
            field.width,
        )
    }

    /// Write an integer field, rejecting values that do not fit its width
    pub fn set(&mut self, key: K, value: u64) -> InstrumentResult<()> {
        let field = self.field(key);
        debug_assert!(!field.is_blob(), "{} is a blob field", field.name);
        if field.width < 8 && value >> (field.width * 8) != 0 {
            return Err(InstrumentError::out_of_range(
                format!("{}.{}", self.layout.name, field.name),
                value,
                (1u64 << (field.width * 8)) - 1,
            ));
        }
        let endian = self.endian;
        endian.write_uint(
            &mut self.bytes[field.offset..field.offset + field.width],
            value,
            field.width,
        );
        Ok(())
    }

    pub fn get_bytes(&self, key: K) -> &[u8] {
        let field = self.field(key);
        &self.bytes[field.offset..field.offset + field.width]
    }

    /// Store `data` at the start of a blob field and zero the remainder
    pub fn set_bytes(&mut self, key: K, data: &[u8]) -> InstrumentResult<()> {
        let field = self.field(key);
        if data.len() > field.width {
            return Err(InstrumentError::out_of_range(
                format!("{}.{} length", self.layout.name, field.name),
                data.len() as u64,
                field.width as u64,
            ));
        }
        let slot = &mut self.bytes[field.offset..field.offset + field.width];
        slot[..data.len()].copy_from_slice(data);
        slot[data.len()..].fill(0);
        Ok(())
    }
}

impl<K: FieldKey> BinaryStructure for RawRecord<K> {
    fn size_in_bytes(&self) -> usize {
        self.layout.size
    }

    fn raw_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn raw_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn verify(&self) -> InstrumentResult<()> {
        if self.bytes.len() != self.layout.size {
            return Err(InstrumentError::structural(format!(
                "{}: holds {} bytes, layout declares {}",
                self.layout.name,
                self.bytes.len(),
                self.layout.size
            )));
        }
        self.layout.verify()
    }
}

impl<K: FieldKey> fmt::Debug for RawRecord<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(self.layout.name);
        for field in self.layout.fields {
            let raw = &self.bytes[field.offset..field.offset + field.width];
            if field.is_blob() {
                s.field(field.name, &raw);
            } else {
                s.field(field.name, &self.endian.read_uint(raw, field.width));
            }
        }
        s.finish()
    }
}

pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Debug, Clone, Copy)]
    enum Sample {
        Tag,
        Value,
        Blob,
    }

    impl FieldKey for Sample {
        fn index(self) -> usize {
            self as usize
        }
    }

    static SAMPLE: Layout = Layout {
        name: "Sample",
        size: 16,
        fields: &[
            FieldSpec::new("tag", 0, 2),
            FieldSpec::new("value", 4, 4),
            FieldSpec::new("blob", 8, 8),
        ],
    };

    static BROKEN: Layout = Layout {
        name: "Broken",
        size: 8,
        fields: &[FieldSpec::new("a", 0, 4), FieldSpec::new("b", 2, 4)],
    };

    #[test]
    fn test_get_set_little_and_big() {
        let mut le: RawRecord<Sample> = RawRecord::zeroed(&SAMPLE, Endian::Little);
        le.set(Sample::Value, 0x11223344).unwrap();
        assert_eq!(&le.raw_bytes()[4..8], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(le.get(Sample::Value), 0x11223344);

        let mut be: RawRecord<Sample> = RawRecord::zeroed(&SAMPLE, Endian::Big);
        be.set(Sample::Value, 0x11223344).unwrap();
        assert_eq!(&be.raw_bytes()[4..8], &[0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn test_set_rejects_overflow() {
        let mut rec: RawRecord<Sample> = RawRecord::zeroed(&SAMPLE, Endian::Little);
        let err = rec.set(Sample::Tag, 0x1_0000).unwrap_err();
        assert!(matches!(err, InstrumentError::OutOfRange { .. }));
        assert_eq!(rec.get(Sample::Tag), 0);
    }

    #[test]
    fn test_blob_field() {
        let mut rec: RawRecord<Sample> = RawRecord::zeroed(&SAMPLE, Endian::Little);
        rec.set_bytes(Sample::Blob, &[1, 2, 3]).unwrap();
        assert_eq!(rec.get_bytes(Sample::Blob), &[1, 2, 3, 0, 0, 0, 0, 0]);
        assert!(rec.set_bytes(Sample::Blob, &[0; 9]).is_err());
    }

    #[test]
    fn test_read_reports_bytes_consumed() {
        let data: Vec<u8> = (0u8..20).collect();
        let mut cursor = Cursor::new(&data[..]);
        let mut rec: RawRecord<Sample> = RawRecord::zeroed(&SAMPLE, Endian::Little);
        assert_eq!(rec.read(&mut cursor).unwrap(), 16);
        assert_eq!(rec.get(Sample::Tag), 0x0100);
        assert!(rec.verify().is_ok());

        let mut short = Cursor::new(&data[..10]);
        let err = rec.read(&mut short).unwrap_err();
        assert!(matches!(err, InstrumentError::Structural(_)));
    }

    #[test]
    fn test_layout_verify_detects_overlap() {
        assert!(SAMPLE.verify().is_ok());
        assert!(BROKEN.verify().is_err());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(7, 0), 7);
    }
}
