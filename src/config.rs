//! Rewrite configuration

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{InstrumentError, InstrumentResult};

/// Settings that shape the injected region
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteConfig {
    /// Alignment of the injected region in file and memory
    #[serde(default = "default_page_size")]
    pub page_size: u64,

    /// Prefix of every injected section name
    #[serde(default = "default_section_prefix")]
    pub section_prefix: String,

    /// Replacement machine code for named instrumentation functions
    #[serde(default)]
    pub function_bodies: BTreeMap<String, PathBuf>,

    /// Re-parse the output with goblin before replacing the destination
    #[serde(default = "default_true")]
    pub validate_output: bool,
}

fn default_page_size() -> u64 {
    4096
}

fn default_section_prefix() -> String {
    ".inst".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            section_prefix: default_section_prefix(),
            function_bodies: BTreeMap::new(),
            validate_output: true,
        }
    }
}

impl RewriteConfig {
    pub fn load(path: &Path) -> InstrumentResult<Self> {
        let config: Self = load_structured(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> InstrumentResult<()> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(InstrumentError::Config(format!(
                "page_size {} is not a power of two",
                self.page_size
            )));
        }
        if !self.section_prefix.starts_with('.') || self.section_prefix.contains('\0') {
            return Err(InstrumentError::Config(format!(
                "section_prefix {:?} must start with '.'",
                self.section_prefix
            )));
        }
        Ok(())
    }

    /// Full name of an injected section, e.g. `.inst.text`
    pub fn section_name(&self, suffix: &str) -> String {
        format!("{}.{}", self.section_prefix, suffix)
    }

    /// Read the configured replacement body for `function`, if any
    pub fn body_override(&self, function: &str) -> InstrumentResult<Option<Vec<u8>>> {
        match self.function_bodies.get(function) {
            None => Ok(None),
            Some(path) => {
                let bytes = fs::read(path).map_err(|e| {
                    InstrumentError::Config(format!(
                        "cannot read body for {} from {}: {}",
                        function,
                        path.display(),
                        e
                    ))
                })?;
                if bytes.is_empty() {
                    return Err(InstrumentError::Config(format!(
                        "body for {} in {} is empty",
                        function,
                        path.display()
                    )));
                }
                Ok(Some(bytes))
            }
        }
    }
}

/// Load a serde document, JSON if the extension says so and TOML otherwise
pub(crate) fn load_structured<T: DeserializeOwned>(path: &Path) -> InstrumentResult<T> {
    let content = fs::read_to_string(path)?;

    if path.extension().map_or(false, |ext| ext == "json") {
        serde_json::from_str(&content)
            .map_err(|e| InstrumentError::Config(format!("{}: {}", path.display(), e)))
    } else {
        toml::from_str(&content)
            .map_err(|e| InstrumentError::Config(format!("{}: {}", path.display(), e)))
    }
}
