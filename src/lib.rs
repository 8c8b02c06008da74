//! # Static ELF Instrumentation
//!
//! Rewrites 32- and 64-bit ELF files on disk to call injected code at chosen
//! program points, and describes every patched point in a table the running
//! program can read.
//!
//! ## Architecture
//!
//! ```text
//! +------------------+
//! |   ElfImage       |  Header, program headers, sections, symbols
//! +------------------+
//!          |
//! +------------------+
//! |   Tool           |  Chooses sites from the site inventory
//! +------------------+
//!          |
//! +------------------+
//! |   Instrumenter   |  declare -> instrument, trampolines, descriptor table
//! +------------------+
//!          |
//! +------------------+
//! |   Writer         |  Layout, verification, atomic replace
//! +------------------+
//! ```
//!
//! Only x86 and x86-64 code can be instrumented. The `runtime` module holds
//! the process-side consumer of the descriptor table.

pub mod codegen;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod header;
pub mod image;
pub mod runtime;
pub mod section;
pub mod sites;
pub mod string_pool;
pub mod structure;
pub mod symbol;
pub mod tools;
pub mod writer;

#[cfg(test)]
pub(crate) mod fixtures;

pub use codegen::Arch;
pub use config::RewriteConfig;
pub use descriptor::{InstrumentationPoint, MappedRegion, PatchTarget, PointState, RuntimeTable, TableHeader};
pub use engine::{EngineState, FunctionBody, FunctionId, Instrumenter};
pub use error::{InstrumentError, InstrumentResult};
pub use image::ElfImage;
pub use section::{Section, SectionHeader, SectionKind};
pub use sites::{PatchSite, SiteInventory};
pub use string_pool::StringPool;
pub use structure::{BinaryStructure, Endian, Width};
pub use tools::{available_tools, build_tool, ArgCardinality, InstrumentationTool, ToolInfo};
