//! Paired entry/exit counters on every function and loop.
//!
//! Sites are numbered functions first, then loops. Function sites carry the
//! function's entry address as their identifier and loop sites their hash.
//! Entry and exit counts of one site live at the same index of two counter
//! arrays, so a balanced run leaves both arrays equal.

use tracing::debug;

use crate::engine::{FunctionBody, FunctionId, Instrumenter};
use crate::error::{InstrumentError, InstrumentResult};
use crate::sites::SiteInventory;
use crate::tools::{ArgCardinality, InstrumentationTool, ToolInfo};

#[derive(Debug, Clone, Copy)]
struct Hooks {
    function_entry: FunctionId,
    function_exit: FunctionId,
    loop_entry: FunctionId,
    loop_exit: FunctionId,
}

pub struct RareEventCounter {
    inventory: SiteInventory,
    hooks: Option<Hooks>,
}

impl RareEventCounter {
    pub const NAME: &'static str = "RareEventCounter";

    pub const INFO: ToolInfo = ToolInfo {
        name: Self::NAME,
        extension: "recinst",
        args: ArgCardinality::None,
        description: "count entries and exits of every function and loop",
    };

    pub fn new(inventory: SiteInventory) -> Self {
        Self { inventory, hooks: None }
    }

    fn site_count(&self) -> u64 {
        (self.inventory.functions.len() + self.inventory.loops.len()) as u64
    }
}

impl InstrumentationTool for RareEventCounter {
    fn info(&self) -> ToolInfo {
        Self::INFO
    }

    fn declare(&mut self, engine: &mut Instrumenter) -> InstrumentResult<()> {
        let size = self.site_count() * 8;
        let entries = engine.reserve_data("rec_entry_counts", size)?;
        let exits = engine.reserve_data("rec_exit_counts", size)?;

        self.hooks = Some(Hooks {
            function_entry: engine.declare_function("rec_function_entry", FunctionBody::Counter { data: entries })?,
            function_exit: engine.declare_function("rec_function_exit", FunctionBody::Counter { data: exits })?,
            loop_entry: engine.declare_function("rec_loop_entry", FunctionBody::Counter { data: entries })?,
            loop_exit: engine.declare_function("rec_loop_exit", FunctionBody::Counter { data: exits })?,
        });
        let report = engine.declare_function("rec_report", FunctionBody::Stub)?;
        engine.set_exit_hook(report)?;
        Ok(())
    }

    fn instrument(&mut self, engine: &mut Instrumenter) -> InstrumentResult<()> {
        let hooks = self
            .hooks
            .ok_or_else(|| InstrumentError::structural("RareEventCounter was not declared"))?;

        for function in &self.inventory.functions {
            let site = engine.add_site(function.entry.address)?;
            engine.add_point(site, hooks.function_entry, function.entry)?;
            for exit in &function.exits {
                engine.add_point(site, hooks.function_exit, *exit)?;
            }
            debug!("function {}: {} exits", function.name, function.exits.len());
        }

        for lp in &self.inventory.loops {
            let site = engine.add_site(lp.hash)?;
            for entry in &lp.entries {
                engine.add_point(site, hooks.loop_entry, *entry)?;
            }
            for exit in &lp.exits {
                engine.add_point(site, hooks.loop_exit, *exit)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RewriteConfig;
    use crate::fixtures;
    use crate::image::ElfImage;
    use crate::structure::Width;

    #[test]
    fn test_functions_and_loops_instrumented() {
        for width in [Width::Elf32, Width::Elf64] {
            let text = fixtures::text_addr(width);
            let image = ElfImage::from_bytes(fixtures::sample_elf(width)).unwrap();
            let mut engine = Instrumenter::new(image, RewriteConfig::default()).unwrap();
            let mut tool = RareEventCounter::new(fixtures::sample_inventory(width));

            engine.declare(&mut tool).unwrap();
            engine.instrument(&mut tool).unwrap();

            assert_eq!(engine.site_ids(), &[text, text + 0x20, 123456]);
            let addresses: Vec<u64> = engine.points().iter().map(|p| p.vaddr()).collect();
            assert_eq!(
                addresses,
                vec![text, text + 0x05, text + 0x0a, text + 0x20, text + 0x25]
            );
            let sites: Vec<u32> = engine.points().iter().map(|p| p.site()).collect();
            assert_eq!(sites, vec![0, 2, 2, 1, 1]);
        }
    }

    #[test]
    fn test_counter_arrays_sized_per_site() {
        let width = Width::Elf64;
        let image = ElfImage::from_bytes(fixtures::sample_elf(width)).unwrap();
        let mut engine = Instrumenter::new(image, RewriteConfig::default()).unwrap();
        let mut tool = RareEventCounter::new(fixtures::sample_inventory(width));
        engine.declare(&mut tool).unwrap();

        for name in ["rec_entry_counts", "rec_exit_counts"] {
            let symbol = engine.image().find_symbol(name).unwrap().unwrap();
            assert_eq!(symbol.size(), 24);
        }
        assert_eq!(engine.functions().len(), 5);
    }
}
