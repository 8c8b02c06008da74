//! # String Pool
//!
//! Append-only table of null-terminated names backing section and symbol
//! naming. Offsets handed out by [`StringPool::add_string`] stay valid for
//! the life of the pool: the buffer only ever grows at the end.

use std::borrow::Cow;
use std::io::{Seek, SeekFrom, Write};

use crate::error::{InstrumentError, InstrumentResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringPool {
    section_index: usize,
    buffer: Vec<u8>,
}

impl StringPool {
    /// An empty pool holding only the leading null byte
    pub fn new(section_index: usize) -> Self {
        Self {
            section_index,
            buffer: vec![0],
        }
    }

    /// Wrap the raw contents of a string-table section
    pub fn read(section_index: usize, data: &[u8]) -> InstrumentResult<Self> {
        if data.is_empty() {
            return Err(InstrumentError::structural(format!(
                "string table in section {} is empty",
                section_index
            )));
        }
        Ok(Self {
            section_index,
            buffer: data.to_vec(),
        })
    }

    pub fn section_index(&self) -> usize {
        self.section_index
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Raw bytes of the string starting at `offset`, without the terminator
    pub fn get_bytes(&self, offset: u32) -> InstrumentResult<&[u8]> {
        let start = offset as usize;
        if start >= self.buffer.len() {
            return Err(InstrumentError::out_of_range(
                "string pool offset",
                offset as u64,
                self.buffer.len() as u64,
            ));
        }
        let rest = &self.buffer[start..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => Ok(&rest[..end]),
            None => Err(InstrumentError::out_of_range(
                "unterminated string at pool offset",
                offset as u64,
                self.buffer.len() as u64,
            )),
        }
    }

    pub fn get_string(&self, offset: u32) -> InstrumentResult<Cow<'_, str>> {
        self.get_bytes(offset).map(String::from_utf8_lossy)
    }

    /// Store `name` and return the offset where it begins
    ///
    /// An existing identical run (including a suffix of a longer string) is
    /// reused; otherwise the name and its terminator are appended.
    pub fn add_string(&mut self, name: &str) -> InstrumentResult<u32> {
        if name.as_bytes().contains(&0) {
            return Err(InstrumentError::InvalidString(name.to_string()));
        }

        if let Some(offset) = self.find(name) {
            return Ok(offset);
        }

        let offset = self.buffer.len();
        if offset + name.len() + 1 > u32::MAX as usize {
            return Err(InstrumentError::out_of_range(
                "string pool size",
                (offset + name.len() + 1) as u64,
                u32::MAX as u64,
            ));
        }
        self.buffer.extend_from_slice(name.as_bytes());
        self.buffer.push(0);
        Ok(offset as u32)
    }

    fn find(&self, name: &str) -> Option<u32> {
        let needle_len = name.len() + 1;
        self.buffer
            .windows(needle_len)
            .position(|w| &w[..name.len()] == name.as_bytes() && w[name.len()] == 0)
            .map(|pos| pos as u32)
    }

    /// Write the buffer verbatim at `offset` in the output
    pub fn dump<W: Write + Seek>(&self, output: &mut W, offset: u64) -> InstrumentResult<()> {
        output.seek(SeekFrom::Start(offset))?;
        output.write_all(&self.buffer)?;
        Ok(())
    }

    /// All strings in storage order, with their offsets
    pub fn iter(&self) -> impl Iterator<Item = (u32, Cow<'_, str>)> {
        let mut offset = 0usize;
        self.buffer
            .split(|&b| b == 0)
            .map(move |s| {
                let start = offset;
                offset += s.len() + 1;
                (start as u32, String::from_utf8_lossy(s))
            })
            .filter(|(_, s)| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const TABLE: &[u8] = b"\0.text\0.data\0.shstrtab\0";

    #[test]
    fn test_get_string() {
        let pool = StringPool::read(3, TABLE).unwrap();
        assert_eq!(pool.get_string(1).unwrap(), ".text");
        assert_eq!(pool.get_string(7).unwrap(), ".data");
        assert_eq!(pool.get_string(0).unwrap(), "");
        // suffix of ".shstrtab"
        assert_eq!(pool.get_string(16).unwrap(), "strtab");
    }

    #[test]
    fn test_get_string_out_of_range() {
        let pool = StringPool::read(3, TABLE).unwrap();
        assert!(matches!(
            pool.get_string(TABLE.len() as u32),
            Err(InstrumentError::OutOfRange { .. })
        ));

        let unterminated = StringPool::read(3, b"\0abc").unwrap();
        assert!(matches!(
            unterminated.get_string(1),
            Err(InstrumentError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_add_then_get() {
        let mut pool = StringPool::read(3, TABLE).unwrap();
        for name in [".inst.text", ".inst.data", "bbcounter_increment", ""] {
            let offset = pool.add_string(name).unwrap();
            assert_eq!(pool.get_string(offset).unwrap(), name);
        }
    }

    #[test]
    fn test_append_never_moves_prior_offsets() {
        let mut pool = StringPool::new(0);
        let first = pool.add_string("alpha").unwrap();
        let second = pool.add_string("beta").unwrap();
        let before = pool.as_bytes()[..pool.len()].to_vec();

        let third = pool.add_string("gamma").unwrap();
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(&pool.as_bytes()[..before.len()], &before[..]);
        assert_eq!(pool.get_string(first).unwrap(), "alpha");
        assert_eq!(pool.get_string(second).unwrap(), "beta");
    }

    #[test]
    fn test_dedup_reuses_existing_run() {
        let mut pool = StringPool::read(3, TABLE).unwrap();
        let len = pool.len();
        assert_eq!(pool.add_string(".data").unwrap(), 7);
        assert_eq!(pool.add_string("strtab").unwrap(), 16);
        assert_eq!(pool.len(), len);
    }

    #[test]
    fn test_rejects_interior_null() {
        let mut pool = StringPool::new(0);
        assert!(matches!(
            pool.add_string("a\0b"),
            Err(InstrumentError::InvalidString(_))
        ));
    }

    #[test]
    fn test_read_dump_round_trip() {
        let pool = StringPool::read(3, TABLE).unwrap();
        let mut out = Cursor::new(vec![0xAAu8; 40]);
        pool.dump(&mut out, 8).unwrap();
        let out = out.into_inner();
        assert_eq!(&out[8..8 + TABLE.len()], TABLE);
        assert_eq!(out[7], 0xAA);
    }

    #[test]
    fn test_iter() {
        let pool = StringPool::read(3, TABLE).unwrap();
        let names: Vec<_> = pool.iter().map(|(o, s)| (o, s.into_owned())).collect();
        assert_eq!(
            names,
            vec![
                (1, ".text".to_string()),
                (7, ".data".to_string()),
                (13, ".shstrtab".to_string())
            ]
        );
    }
}
