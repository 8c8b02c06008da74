//! # Runtime Descriptor Table
//!
//! Wire format shared by the rewriter and the code running inside a rewritten
//! process. The table lives in injected data and starts with a fixed header:
//!
//! ```text
//! __inst_table (64 bytes)            __inst_sites          __inst_points
//! +-------------------------+        +----------+          +------------------+
//! | magic | version         |        | site id 0|          | site | len       |
//! | point_count | site_count|        | site id 1|          | vaddr            |
//! | self_vaddr              |        | ...      |          | original  [32]   |
//! | points_vaddr     -------+------------------------->    | replacement [32] |
//! | site_ids_vaddr   -------+------> +----------+          +------------------+
//! | original_entry          |                               | ... 80 bytes each
//! | exit_hook               |
//! | counters_vaddr          |
//! +-------------------------+
//! ```
//!
//! Every multi-byte field uses the byte order of the image.

use std::fmt;

use tracing::debug;

use crate::error::{InstrumentError, InstrumentResult};
use crate::image::ElfImage;
use crate::structure::{BinaryStructure, Endian, FieldKey, FieldSpec, Layout, RawRecord};

/// "INST" read as a little-endian u32
pub const TABLE_MAGIC: u32 = 0x5453_4e49;
pub const TABLE_VERSION: u32 = 1;
/// Largest patch a descriptor can describe
pub const MAX_PATCH_BYTES: usize = 32;
/// Symbol naming the table header
pub const TABLE_SYMBOL: &str = "__inst_table";

/// Memory holding patched code, addressed by virtual address
pub trait PatchTarget {
    fn read_bytes(&self, vaddr: u64, len: usize) -> InstrumentResult<Vec<u8>>;

    fn write_bytes(&mut self, vaddr: u64, bytes: &[u8]) -> InstrumentResult<()>;
}

/// A copy of one mapped range of a process image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRegion {
    base: u64,
    bytes: Vec<u8>,
}

impl MappedRegion {
    pub fn new(base: u64, bytes: Vec<u8>) -> Self {
        Self { base, bytes }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn range(&self, vaddr: u64, len: usize) -> InstrumentResult<std::ops::Range<usize>> {
        let end = self.base + self.bytes.len() as u64;
        if vaddr < self.base || vaddr + len as u64 > end {
            return Err(InstrumentError::out_of_range("mapped region address", vaddr, end));
        }
        let start = (vaddr - self.base) as usize;
        Ok(start..start + len)
    }
}

impl PatchTarget for MappedRegion {
    fn read_bytes(&self, vaddr: u64, len: usize) -> InstrumentResult<Vec<u8>> {
        let range = self.range(vaddr, len)?;
        Ok(self.bytes[range].to_vec())
    }

    fn write_bytes(&mut self, vaddr: u64, bytes: &[u8]) -> InstrumentResult<()> {
        let range = self.range(vaddr, bytes.len())?;
        self.bytes[range].copy_from_slice(bytes);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum TableField {
    Magic,
    Version,
    PointCount,
    SiteCount,
    SelfVaddr,
    PointsVaddr,
    SiteIdsVaddr,
    OriginalEntry,
    ExitHook,
    CountersVaddr,
}

impl FieldKey for TableField {
    fn index(self) -> usize {
        self as usize
    }
}

pub static TABLE_HEADER: Layout = Layout {
    name: "inst_table",
    size: 64,
    fields: &[
        FieldSpec::new("magic", 0, 4),
        FieldSpec::new("version", 4, 4),
        FieldSpec::new("point_count", 8, 4),
        FieldSpec::new("site_count", 12, 4),
        FieldSpec::new("self_vaddr", 16, 8),
        FieldSpec::new("points_vaddr", 24, 8),
        FieldSpec::new("site_ids_vaddr", 32, 8),
        FieldSpec::new("original_entry", 40, 8),
        FieldSpec::new("exit_hook", 48, 8),
        FieldSpec::new("counters_vaddr", 56, 8),
    ],
};

#[derive(Debug, Clone, Copy)]
pub enum PointField {
    Site,
    Length,
    Vaddr,
    Original,
    Replacement,
}

impl FieldKey for PointField {
    fn index(self) -> usize {
        self as usize
    }
}

pub static POINT_RECORD: Layout = Layout {
    name: "inst_point",
    size: 80,
    fields: &[
        FieldSpec::new("site", 0, 4),
        FieldSpec::new("length", 4, 4),
        FieldSpec::new("vaddr", 8, 8),
        FieldSpec::new("original", 16, MAX_PATCH_BYTES),
        FieldSpec::new("replacement", 48, MAX_PATCH_BYTES),
    ],
};

/// Decoded table header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableHeader {
    pub point_count: u32,
    pub site_count: u32,
    pub self_vaddr: u64,
    pub points_vaddr: u64,
    pub site_ids_vaddr: u64,
    pub original_entry: u64,
    pub exit_hook: u64,
    pub counters_vaddr: u64,
}

impl TableHeader {
    pub fn encode(&self, endian: Endian) -> InstrumentResult<Vec<u8>> {
        let mut record: RawRecord<TableField> = RawRecord::zeroed(&TABLE_HEADER, endian);
        record.set(TableField::Magic, TABLE_MAGIC as u64)?;
        record.set(TableField::Version, TABLE_VERSION as u64)?;
        record.set(TableField::PointCount, self.point_count as u64)?;
        record.set(TableField::SiteCount, self.site_count as u64)?;
        record.set(TableField::SelfVaddr, self.self_vaddr)?;
        record.set(TableField::PointsVaddr, self.points_vaddr)?;
        record.set(TableField::SiteIdsVaddr, self.site_ids_vaddr)?;
        record.set(TableField::OriginalEntry, self.original_entry)?;
        record.set(TableField::ExitHook, self.exit_hook)?;
        record.set(TableField::CountersVaddr, self.counters_vaddr)?;
        Ok(record.raw_bytes().to_vec())
    }

    pub fn decode(endian: Endian, data: &[u8]) -> InstrumentResult<Self> {
        let record: RawRecord<TableField> = RawRecord::from_bytes(&TABLE_HEADER, endian, data)?;
        let magic = record.get(TableField::Magic) as u32;
        if magic != TABLE_MAGIC {
            return Err(InstrumentError::structural(format!(
                "descriptor table magic 0x{:08x} (expected 0x{:08x})",
                magic, TABLE_MAGIC
            )));
        }
        let version = record.get(TableField::Version) as u32;
        if version != TABLE_VERSION {
            return Err(InstrumentError::structural(format!(
                "descriptor table version {} is not supported",
                version
            )));
        }
        Ok(Self {
            point_count: record.get(TableField::PointCount) as u32,
            site_count: record.get(TableField::SiteCount) as u32,
            self_vaddr: record.get(TableField::SelfVaddr),
            points_vaddr: record.get(TableField::PointsVaddr),
            site_ids_vaddr: record.get(TableField::SiteIdsVaddr),
            original_entry: record.get(TableField::OriginalEntry),
            exit_hook: record.get(TableField::ExitHook),
            counters_vaddr: record.get(TableField::CountersVaddr),
        })
    }
}

/// Whether the instrumentation bytes or the original bytes are live at a point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointState {
    Enabled,
    Disabled,
}

impl fmt::Display for PointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointState::Enabled => write!(f, "enabled"),
            PointState::Disabled => write!(f, "disabled"),
        }
    }
}

/// One patched location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationPoint {
    site: u32,
    vaddr: u64,
    original: Vec<u8>,
    replacement: Vec<u8>,
    state: PointState,
}

impl InstrumentationPoint {
    pub fn new(site: u32, vaddr: u64, original: Vec<u8>, replacement: Vec<u8>) -> InstrumentResult<Self> {
        if original.len() != replacement.len() {
            return Err(InstrumentError::invalid_site(
                vaddr,
                format!(
                    "original is {} bytes but replacement is {}",
                    original.len(),
                    replacement.len()
                ),
            ));
        }
        if original.is_empty() || original.len() > MAX_PATCH_BYTES {
            return Err(InstrumentError::out_of_range(
                "patch length",
                original.len() as u64,
                MAX_PATCH_BYTES as u64,
            ));
        }
        Ok(Self {
            site,
            vaddr,
            original,
            replacement,
            state: PointState::Enabled,
        })
    }

    /// Index of the owning site in the site identifier array
    pub fn site(&self) -> u32 {
        self.site
    }

    pub fn vaddr(&self) -> u64 {
        self.vaddr
    }

    pub fn len(&self) -> usize {
        self.original.len()
    }

    pub fn is_empty(&self) -> bool {
        self.original.is_empty()
    }

    pub fn original(&self) -> &[u8] {
        &self.original
    }

    pub fn replacement(&self) -> &[u8] {
        &self.replacement
    }

    pub fn state(&self) -> PointState {
        self.state
    }

    fn expected_bytes(&self, state: PointState) -> &[u8] {
        match state {
            PointState::Enabled => &self.replacement,
            PointState::Disabled => &self.original,
        }
    }

    /// Swap the bytes at the point so `to` becomes live
    ///
    /// The caller must be the only writer to the target and no thread may be
    /// executing the patched range.
    fn transition<T: PatchTarget + ?Sized>(&mut self, target: &mut T, to: PointState) -> InstrumentResult<()> {
        if self.state == to {
            return Ok(());
        }
        let current = target.read_bytes(self.vaddr, self.len())?;
        if current != self.expected_bytes(self.state) {
            return Err(InstrumentError::invalid_site(
                self.vaddr,
                format!("bytes in memory do not match the {} point", self.state),
            ));
        }
        target.write_bytes(self.vaddr, self.expected_bytes(to))?;
        debug!("point at 0x{:x} (site {}) {}", self.vaddr, self.site, to);
        self.state = to;
        Ok(())
    }

    pub fn disable<T: PatchTarget + ?Sized>(&mut self, target: &mut T) -> InstrumentResult<()> {
        self.transition(target, PointState::Disabled)
    }

    pub fn enable<T: PatchTarget + ?Sized>(&mut self, target: &mut T) -> InstrumentResult<()> {
        self.transition(target, PointState::Enabled)
    }

    pub fn encode(&self, endian: Endian) -> InstrumentResult<Vec<u8>> {
        let mut record: RawRecord<PointField> = RawRecord::zeroed(&POINT_RECORD, endian);
        record.set(PointField::Site, self.site as u64)?;
        record.set(PointField::Length, self.len() as u64)?;
        record.set(PointField::Vaddr, self.vaddr)?;
        record.set_bytes(PointField::Original, &self.original)?;
        record.set_bytes(PointField::Replacement, &self.replacement)?;
        Ok(record.raw_bytes().to_vec())
    }

    /// Decode a record; the state starts as `Enabled`
    pub fn decode(endian: Endian, data: &[u8]) -> InstrumentResult<Self> {
        let record: RawRecord<PointField> = RawRecord::from_bytes(&POINT_RECORD, endian, data)?;
        let length = record.get(PointField::Length) as usize;
        if length == 0 || length > MAX_PATCH_BYTES {
            return Err(InstrumentError::out_of_range(
                "descriptor patch length",
                length as u64,
                MAX_PATCH_BYTES as u64,
            ));
        }
        Self::new(
            record.get(PointField::Site) as u32,
            record.get(PointField::Vaddr),
            record.get_bytes(PointField::Original)[..length].to_vec(),
            record.get_bytes(PointField::Replacement)[..length].to_vec(),
        )
    }

    /// Derive the state from what is currently in memory
    pub fn sync_state<T: PatchTarget + ?Sized>(&mut self, target: &T) -> InstrumentResult<PointState> {
        let current = target.read_bytes(self.vaddr, self.len())?;
        self.state = if current == self.replacement {
            PointState::Enabled
        } else if current == self.original {
            PointState::Disabled
        } else {
            return Err(InstrumentError::invalid_site(
                self.vaddr,
                "bytes in memory match neither the original nor the replacement",
            ));
        };
        Ok(self.state)
    }
}

/// Header, site identifiers and points, as read back from memory
#[derive(Debug, Clone)]
pub struct RuntimeTable {
    pub header: TableHeader,
    pub site_ids: Vec<u64>,
    pub points: Vec<InstrumentationPoint>,
}

impl RuntimeTable {
    /// Decode the table starting at `table_vaddr`
    pub fn read<T: PatchTarget + ?Sized>(target: &T, endian: Endian, table_vaddr: u64) -> InstrumentResult<Self> {
        let header = TableHeader::decode(endian, &target.read_bytes(table_vaddr, TABLE_HEADER.size)?)?;

        let mut site_ids = Vec::with_capacity(header.site_count as usize);
        if header.site_count > 0 {
            let ids = target.read_bytes(header.site_ids_vaddr, header.site_count as usize * 8)?;
            site_ids.extend(ids.chunks_exact(8).map(|c| endian.read_uint(c, 8)));
        }

        let mut points = Vec::with_capacity(header.point_count as usize);
        if header.point_count == 0 {
            return Ok(Self {
                header,
                site_ids,
                points,
            });
        }
        let records = target.read_bytes(header.points_vaddr, header.point_count as usize * POINT_RECORD.size)?;
        for chunk in records.chunks_exact(POINT_RECORD.size) {
            let mut point = InstrumentationPoint::decode(endian, chunk)?;
            if point.site() >= header.site_count {
                return Err(InstrumentError::out_of_range(
                    "descriptor site index",
                    point.site() as u64,
                    header.site_count as u64,
                ));
            }
            point.sync_state(target)?;
            points.push(point);
        }

        Ok(Self {
            header,
            site_ids,
            points,
        })
    }

    /// Locate the table through its symbol in a rewritten image
    pub fn from_image(image: &ElfImage) -> InstrumentResult<Self> {
        let symbol = image
            .find_symbol(TABLE_SYMBOL)?
            .ok_or_else(|| InstrumentError::structural(format!("no {} symbol in image", TABLE_SYMBOL)))?;
        Self::read(image, image.endian(), symbol.value())
    }

    /// Points owned by site `site`
    pub fn points_for_site(&mut self, site: u32) -> impl Iterator<Item = &mut InstrumentationPoint> {
        self.points.iter_mut().filter(move |p| p.site() == site)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> InstrumentationPoint {
        InstrumentationPoint::new(
            2,
            0x1004,
            vec![0x0f, 0x1f, 0x44, 0x00, 0x00],
            vec![0xe9, 0xf7, 0x0f, 0x00, 0x00],
        )
        .unwrap()
    }

    fn region_with(point: &InstrumentationPoint) -> MappedRegion {
        let mut bytes = vec![0x90u8; 0x20];
        bytes[4..9].copy_from_slice(point.replacement());
        MappedRegion::new(0x1000, bytes)
    }

    #[test]
    fn test_layouts_are_consistent() {
        TABLE_HEADER.verify().unwrap();
        POINT_RECORD.verify().unwrap();
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        let err = InstrumentationPoint::new(0, 0x10, vec![0x90; 5], vec![0x90; 6]).unwrap_err();
        assert!(matches!(err, InstrumentError::InvalidSite { .. }));
        assert!(InstrumentationPoint::new(0, 0x10, vec![0; 33], vec![0; 33]).is_err());
    }

    #[test]
    fn test_disable_enable_swaps_bytes() {
        let mut p = point();
        let mut region = region_with(&p);

        p.disable(&mut region).unwrap();
        assert_eq!(p.state(), PointState::Disabled);
        assert_eq!(&region.as_bytes()[4..9], p.original());

        // idempotent
        p.disable(&mut region).unwrap();

        p.enable(&mut region).unwrap();
        assert_eq!(p.state(), PointState::Enabled);
        assert_eq!(&region.as_bytes()[4..9], p.replacement());
    }

    #[test]
    fn test_transition_checks_current_bytes() {
        let mut p = point();
        let mut region = MappedRegion::new(0x1000, vec![0xcc; 0x20]);
        assert!(matches!(
            p.disable(&mut region),
            Err(InstrumentError::InvalidSite { .. })
        ));
        assert_eq!(p.state(), PointState::Enabled);
        assert_eq!(region.as_bytes(), &[0xcc; 0x20][..]);
    }

    #[test]
    fn test_point_record_encoding() {
        let p = point();
        let raw = p.encode(Endian::Little).unwrap();
        assert_eq!(raw.len(), 80);
        assert_eq!(&raw[0..4], &[2, 0, 0, 0]);
        assert_eq!(&raw[4..8], &[5, 0, 0, 0]);
        assert_eq!(&raw[16..21], p.original());
        assert_eq!(raw[21], 0);
        assert_eq!(&raw[48..53], p.replacement());
        assert_eq!(InstrumentationPoint::decode(Endian::Little, &raw).unwrap(), p);
    }

    #[test]
    fn test_read_table_from_region() {
        let endian = Endian::Little;
        let p = point();
        let mut bytes = vec![0u8; 0x200];
        let header = TableHeader {
            point_count: 1,
            site_count: 3,
            self_vaddr: 0x2000,
            points_vaddr: 0x2080,
            site_ids_vaddr: 0x2040,
            original_entry: 0x1000,
            exit_hook: 0,
            counters_vaddr: 0,
        };
        bytes[..64].copy_from_slice(&header.encode(endian).unwrap());
        for (i, id) in [10u64, 11, 12].iter().enumerate() {
            bytes[0x40 + i * 8..0x48 + i * 8].copy_from_slice(&id.to_le_bytes());
        }
        bytes[0x80..0xd0].copy_from_slice(&p.encode(endian).unwrap());

        // code at 0x1000, table at 0x2000 in one region
        let mut memory = vec![0x90u8; 0x1000];
        memory[4..9].copy_from_slice(p.original());
        memory.extend_from_slice(&bytes);
        let region = MappedRegion::new(0x1000, memory);

        let mut table = RuntimeTable::read(&region, endian, 0x2000).unwrap();
        assert_eq!(table.header, header);
        assert_eq!(table.site_ids, vec![10, 11, 12]);
        assert_eq!(table.points.len(), 1);
        assert_eq!(table.points[0].state(), PointState::Disabled);
        assert_eq!(table.points_for_site(2).count(), 1);
        assert_eq!(table.points_for_site(0).count(), 0);
    }

    #[test]
    fn test_bad_magic() {
        let raw = vec![0u8; 64];
        assert!(matches!(
            TableHeader::decode(Endian::Little, &raw),
            Err(InstrumentError::Structural(_))
        ));
    }
}
