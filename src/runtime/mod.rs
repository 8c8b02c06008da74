//! # Runtime Support
//!
//! The side of the descriptor table that runs inside a rewritten process:
//! a frequency policy read once at start, a context that receives every site
//! entry and exit, and the CPU frequency backend it drives.

pub mod context;
pub mod frequency;
pub mod policy;

pub use context::{Imbalance, RuntimeContext, Teardown};
pub use frequency::{cpu_for_rank, pin_to_rank, FrequencyControl, SysfsFrequency};
pub use policy::{FrequencyMap, PolicyLine, FREQUENCY_MAP_VAR};
