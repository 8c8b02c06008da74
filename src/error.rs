//! # Error Types for ELF Rewriting

use thiserror::Error;

/// Main error type
#[derive(Error, Debug)]
pub enum InstrumentError {
    /// Malformed on-disk layout. The load is aborted before any tool runs.
    #[error("Structural error: {0}")]
    Structural(String),

    /// Bad offset or index into a pool, section or table
    #[error("Out of range: {what} (value {value:#x}, limit {limit:#x})")]
    OutOfRange {
        what: String,
        value: u64,
        limit: u64,
    },

    /// Engine phase called out of order
    #[error("Sequencing error: cannot {operation} while {state}")]
    Sequencing {
        state: String,
        operation: String,
    },

    /// Malformed runtime policy line
    #[error("Policy parse error at line {line}: {content:?}")]
    PolicyParse {
        line: usize,
        content: String,
    },

    /// Patch site that cannot be rewritten in place
    #[error("Invalid instrumentation site at 0x{address:x}: {reason}")]
    InvalidSite {
        address: u64,
        reason: String,
    },

    /// Name that cannot live in a null-terminated string pool
    #[error("Invalid string for string pool: {0:?}")]
    InvalidString(String),

    /// No code generator for this machine
    #[error("Architecture not supported: e_machine {0}")]
    UnsupportedArchitecture(u16),

    /// Configuration or site inventory problem
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Goblin error
    #[error("Goblin error: {0}")]
    Goblin(#[from] goblin::error::Error),
}

impl InstrumentError {
    pub(crate) fn structural(msg: impl Into<String>) -> Self {
        InstrumentError::Structural(msg.into())
    }

    pub(crate) fn out_of_range(what: impl Into<String>, value: u64, limit: u64) -> Self {
        InstrumentError::OutOfRange {
            what: what.into(),
            value,
            limit,
        }
    }

    pub(crate) fn invalid_site(address: u64, reason: impl Into<String>) -> Self {
        InstrumentError::InvalidSite {
            address,
            reason: reason.into(),
        }
    }

    /// Errors that make the input file unusable. The caller should reject the
    /// file rather than retry.
    pub fn is_fatal_to_load(&self) -> bool {
        matches!(
            self,
            InstrumentError::Structural(_)
                | InstrumentError::OutOfRange { .. }
                | InstrumentError::Goblin(_)
        )
    }

    /// Errors caused by misuse of the engine API rather than by input data
    pub fn is_programming_error(&self) -> bool {
        matches!(self, InstrumentError::Sequencing { .. })
    }
}

/// Result type alias
pub type InstrumentResult<T> = Result<T, InstrumentError>;
