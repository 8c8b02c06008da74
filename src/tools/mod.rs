//! # Instrumentation Tools
//!
//! A tool decides where to patch and what to call; the engine does the rest.

use std::fmt;
use std::fs;
use std::path::Path;

use crate::engine::Instrumenter;
use crate::error::{InstrumentError, InstrumentResult};
use crate::sites::SiteInventory;

pub mod basic_block_counter;
pub mod call_replace;
pub mod rare_event_counter;

pub use basic_block_counter::BasicBlockCounter;
pub use call_replace::CallReplace;
pub use rare_event_counter::RareEventCounter;

/// How many argument files a tool takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgCardinality {
    None,
    Optional,
    Required,
}

impl fmt::Display for ArgCardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgCardinality::None => write!(f, "none"),
            ArgCardinality::Optional => write!(f, "optional"),
            ArgCardinality::Required => write!(f, "required"),
        }
    }
}

/// Metadata read by the command-line driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolInfo {
    pub name: &'static str,
    pub extension: &'static str,
    pub args: ArgCardinality,
    pub description: &'static str,
}

pub trait InstrumentationTool {
    fn info(&self) -> ToolInfo;

    /// Register functions, data and hooks. No code is patched yet.
    fn declare(&mut self, engine: &mut Instrumenter) -> InstrumentResult<()>;

    /// Request patches at every site the tool wants instrumented
    fn instrument(&mut self, engine: &mut Instrumenter) -> InstrumentResult<()>;

    /// Write files that describe the instrumented `output` next to it
    fn write_side_files(&self, _output: &Path) -> InstrumentResult<()> {
        Ok(())
    }
}

/// Metadata of every built-in tool
pub fn available_tools() -> [ToolInfo; 3] {
    [BasicBlockCounter::INFO, CallReplace::INFO, RareEventCounter::INFO]
}

pub fn find_tool(name: &str) -> Option<ToolInfo> {
    available_tools()
        .into_iter()
        .find(|t| t.name.eq_ignore_ascii_case(name))
}

/// Build a tool by name from the site inventory and its argument file
pub fn build_tool(
    name: &str,
    inventory: SiteInventory,
    argument: Option<&Path>,
) -> InstrumentResult<Box<dyn InstrumentationTool>> {
    let info = find_tool(name).ok_or_else(|| InstrumentError::Config(format!("unknown tool {}", name)))?;

    match (info.args, argument) {
        (ArgCardinality::None, Some(path)) => {
            return Err(InstrumentError::Config(format!(
                "{} takes no argument file (got {})",
                info.name,
                path.display()
            )))
        }
        (ArgCardinality::Required, None) => {
            return Err(InstrumentError::Config(format!(
                "{} requires an argument file",
                info.name
            )))
        }
        _ => {}
    }

    let lines = match argument {
        Some(path) => Some(read_name_list(path)?),
        None => None,
    };

    let tool: Box<dyn InstrumentationTool> = match info.name {
        BasicBlockCounter::NAME => Box::new(BasicBlockCounter::new(inventory, lines)),
        CallReplace::NAME => Box::new(CallReplace::from_lines(inventory, &lines.unwrap_or_default())?),
        _ => Box::new(RareEventCounter::new(inventory)),
    };
    Ok(tool)
}

/// Non-empty lines of an argument file with `#` comments removed
pub fn read_name_list(path: &Path) -> InstrumentResult<Vec<String>> {
    let content = fs::read_to_string(path)?;
    Ok(parse_name_list(&content))
}

pub(crate) fn parse_name_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_tool_metadata() {
        let tools = available_tools();
        assert_eq!(tools[0].name, "BasicBlockCounter");
        assert_eq!(tools[0].args, ArgCardinality::Optional);
        assert_eq!(tools[1].args, ArgCardinality::Required);
        assert_eq!(tools[2].extension, "recinst");
        assert_eq!(tools[2].args, ArgCardinality::None);
        assert_eq!(find_tool("callreplace").unwrap().extension, "crinst");
    }

    #[test]
    fn test_parse_name_list() {
        let names = parse_name_list("# header\nmalloc\n\n  free wrap_free  # comment\n");
        assert_eq!(names, vec!["malloc".to_string(), "free wrap_free".to_string()]);
    }

    #[test]
    fn test_build_tool_checks_cardinality() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "helper").unwrap();

        assert!(build_tool("CallReplace", SiteInventory::default(), None).is_err());
        assert!(build_tool("RareEventCounter", SiteInventory::default(), Some(file.path())).is_err());
        assert!(build_tool("Nope", SiteInventory::default(), None).is_err());

        let tool = build_tool("BasicBlockCounter", SiteInventory::default(), None).unwrap();
        assert_eq!(tool.info().extension, "jbbinst");
        let tool = build_tool("CallReplace", SiteInventory::default(), Some(file.path())).unwrap();
        assert_eq!(tool.info().name, "CallReplace");
    }
}
