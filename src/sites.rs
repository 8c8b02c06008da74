//! # Site Inventory
//!
//! Functions, basic blocks, loops and call sites found by an external
//! disassembly pass. Every patch site carries the byte length of the whole
//! instructions it covers; those instructions are moved into a trampoline.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::load_structured;
use crate::error::{InstrumentError, InstrumentResult};

/// A run of whole instructions that may be displaced by a 5-byte jump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatchSite {
    pub address: u64,
    pub length: u8,
}

impl PatchSite {
    pub fn new(address: u64, length: u8) -> Self {
        Self { address, length }
    }

    pub fn end(&self) -> u64 {
        self.address + self.length as u64
    }

    pub fn overlaps(&self, other: &PatchSite) -> bool {
        self.address < other.end() && other.address < self.end()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSites {
    pub name: String,
    pub entry: PatchSite,
    #[serde(default)]
    pub exits: Vec<PatchSite>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSite {
    /// Stable block identifier assigned by the analysis
    pub id: u64,
    pub address: u64,
    pub length: u8,
    /// Containing function, when known
    #[serde(default)]
    pub function: Option<String>,
}

impl BlockSite {
    pub fn site(&self) -> PatchSite {
        PatchSite::new(self.address, self.length)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSites {
    pub hash: u64,
    #[serde(default)]
    pub entries: Vec<PatchSite>,
    #[serde(default)]
    pub exits: Vec<PatchSite>,
}

/// A `call rel32` instruction and the name of the function it targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSite {
    pub address: u64,
    pub callee: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteInventory {
    #[serde(default)]
    pub functions: Vec<FunctionSites>,
    #[serde(default)]
    pub blocks: Vec<BlockSite>,
    #[serde(default)]
    pub loops: Vec<LoopSites>,
    #[serde(default)]
    pub call_sites: Vec<CallSite>,
}

impl SiteInventory {
    pub fn load(path: &Path) -> InstrumentResult<Self> {
        let inventory: Self = load_structured(path)?;
        inventory.validate()?;
        Ok(inventory)
    }

    /// Block ids must be unique and loop hashes must be unique
    pub fn validate(&self) -> InstrumentResult<()> {
        let mut ids: Vec<u64> = self.blocks.iter().map(|b| b.id).collect();
        ids.sort_unstable();
        if let Some(pair) = ids.windows(2).find(|p| p[0] == p[1]) {
            return Err(InstrumentError::Config(format!(
                "duplicate basic block id {}",
                pair[0]
            )));
        }

        let mut hashes: Vec<u64> = self.loops.iter().map(|l| l.hash).collect();
        hashes.sort_unstable();
        if let Some(pair) = hashes.windows(2).find(|p| p[0] == p[1]) {
            return Err(InstrumentError::Config(format!(
                "duplicate loop hash {}",
                pair[0]
            )));
        }
        Ok(())
    }

    pub fn function(&self, name: &str) -> Option<&FunctionSites> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_toml_inventory() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[[functions]]
name = "main"
entry = {{ address = 0x400100, length = 5 }}

[[blocks]]
id = 7
address = 0x400110
length = 5
function = "main"

[[loops]]
hash = 123456
entries = [{{ address = 0x400105, length = 5 }}]
exits = [{{ address = 0x40010a, length = 5 }}]

[[call_sites]]
address = 0x400118
callee = "helper"
"#
        )
        .unwrap();

        let inventory = SiteInventory::load(file.path()).unwrap();
        assert_eq!(inventory.function("main").unwrap().entry.address, 0x400100);
        assert_eq!(inventory.blocks[0].site(), PatchSite::new(0x400110, 5));
        assert_eq!(inventory.loops[0].exits.len(), 1);
        assert_eq!(inventory.call_sites[0].callee, "helper");
    }

    #[test]
    fn test_load_json_inventory() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"blocks": [{{"id": 0, "address": 4194560, "length": 5}}]}}"#
        )
        .unwrap();

        let inventory = SiteInventory::load(file.path()).unwrap();
        assert_eq!(inventory.blocks.len(), 1);
        assert!(inventory.functions.is_empty());
    }

    #[test]
    fn test_duplicate_block_id() {
        let block = BlockSite {
            id: 1,
            address: 0x1000,
            length: 5,
            function: None,
        };
        let inventory = SiteInventory {
            blocks: vec![block.clone(), block],
            ..Default::default()
        };
        assert!(matches!(
            inventory.validate(),
            Err(InstrumentError::Config(_))
        ));
    }

    #[test]
    fn test_overlap() {
        let a = PatchSite::new(0x100, 5);
        assert!(a.overlaps(&PatchSite::new(0x104, 5)));
        assert!(!a.overlaps(&PatchSite::new(0x105, 5)));
        assert!(a.overlaps(&a));
    }
}
