//! Counts executions of every basic block in the site inventory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::{FunctionBody, FunctionId, Instrumenter};
use crate::error::{InstrumentError, InstrumentResult};
use crate::sites::{BlockSite, SiteInventory};
use crate::tools::{ArgCardinality, InstrumentationTool, ToolInfo};

/// One counted block, in counter order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticBlock {
    pub id: u64,
    pub address: u64,
    pub length: u8,
    #[serde(default)]
    pub function: Option<String>,
}

/// Maps each counter slot back to the block it counts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticFile {
    pub tool: String,
    pub blocks: Vec<StaticBlock>,
}

impl StaticFile {
    /// `<output>.static`
    pub fn path_for(output: &Path) -> PathBuf {
        let mut path = output.as_os_str().to_owned();
        path.push(".static");
        PathBuf::from(path)
    }

    pub fn load(path: &Path) -> InstrumentResult<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| InstrumentError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> InstrumentResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| InstrumentError::Config(format!("{}: {}", path.display(), e)))?;
        fs::write(path, content)?;
        Ok(())
    }
}

pub struct BasicBlockCounter {
    blocks: Vec<BlockSite>,
    counter: Option<FunctionId>,
}

impl BasicBlockCounter {
    pub const NAME: &'static str = "BasicBlockCounter";

    pub const INFO: ToolInfo = ToolInfo {
        name: Self::NAME,
        extension: "jbbinst",
        args: ArgCardinality::Optional,
        description: "count executions of every basic block, reported at exit",
    };

    /// `functions`, when given, limits counting to blocks of those functions
    pub fn new(inventory: SiteInventory, functions: Option<Vec<String>>) -> Self {
        let mut blocks = inventory.blocks;
        if let Some(names) = functions {
            blocks.retain(|b| b.function.as_ref().map_or(false, |f| names.contains(f)));
        }
        blocks.sort_by_key(|b| b.id);
        Self { blocks, counter: None }
    }

    pub fn blocks(&self) -> &[BlockSite] {
        &self.blocks
    }

    pub fn static_file(&self) -> StaticFile {
        StaticFile {
            tool: Self::NAME.to_string(),
            blocks: self
                .blocks
                .iter()
                .map(|b| StaticBlock {
                    id: b.id,
                    address: b.address,
                    length: b.length,
                    function: b.function.clone(),
                })
                .collect(),
        }
    }
}

impl InstrumentationTool for BasicBlockCounter {
    fn info(&self) -> ToolInfo {
        Self::INFO
    }

    fn declare(&mut self, engine: &mut Instrumenter) -> InstrumentResult<()> {
        let counters = engine.reserve_data("bbcounter_counts", self.blocks.len() as u64 * 8)?;
        self.counter = Some(engine.declare_function("bbcounter_increment", FunctionBody::Counter { data: counters })?);
        let report = engine.declare_function("bbcounter_report", FunctionBody::Stub)?;
        engine.set_exit_hook(report)?;
        Ok(())
    }

    fn instrument(&mut self, engine: &mut Instrumenter) -> InstrumentResult<()> {
        let counter = self
            .counter
            .ok_or_else(|| InstrumentError::structural("BasicBlockCounter was not declared"))?;
        for block in &self.blocks {
            let site = engine.add_site(block.id)?;
            engine.add_point(site, counter, block.site())?;
            debug!("block {} at 0x{:x}", block.id, block.address);
        }
        Ok(())
    }

    fn write_side_files(&self, output: &Path) -> InstrumentResult<()> {
        let path = StaticFile::path_for(output);
        self.static_file().save(&path)?;
        info!("{} blocks described in {}", self.blocks.len(), path.display());
        Ok(())
    }
}
