//! Frequency policy files.
//!
//! ```text
//! # loop hash   ranks   kHz
//! 123456        *       1800000     every rank runs loop 123456 at 1.8 GHz
//! 0x1e240       3       1600000     rank 3 only
//! 0                     2600000     rank 0 never runs above 2.6 GHz
//! ```
//!
//! Loop lines always have three fields; a two-field line is a rank ceiling.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{InstrumentError, InstrumentResult};

/// Environment variable naming the policy file
pub const FREQUENCY_MAP_VAR: &str = "PFREQ_FREQUENCY_MAP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyLine {
    AllRanks { hash: u64, freq: u32 },
    OneRank { hash: u64, rank: u32, freq: u32 },
    RankCeiling { rank: u32, freq: u32 },
}

fn parse_hash(field: &str) -> Option<u64> {
    match field.strip_prefix("0x").or_else(|| field.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => field.parse().ok(),
    }
}

impl PolicyLine {
    /// Parse one line; blank lines and comments yield `None`
    pub fn parse(number: usize, line: &str) -> InstrumentResult<Option<Self>> {
        let content = line.split('#').next().unwrap_or("").trim();
        if content.is_empty() {
            return Ok(None);
        }
        let fields: Vec<&str> = content.split_whitespace().collect();
        let parsed = match fields.as_slice() {
            [hash, "*", freq] => parse_hash(hash)
                .zip(freq.parse::<u32>().ok())
                .map(|(hash, freq)| PolicyLine::AllRanks { hash, freq }),
            [hash, rank, freq] => match (parse_hash(hash), rank.parse::<u32>(), freq.parse::<u32>()) {
                (Some(hash), Ok(rank), Ok(freq)) => Some(PolicyLine::OneRank { hash, rank, freq }),
                _ => None,
            },
            [rank, freq] => match (rank.parse::<u32>(), freq.parse::<u32>()) {
                (Ok(rank), Ok(freq)) => Some(PolicyLine::RankCeiling { rank, freq }),
                _ => None,
            },
            _ => None,
        };
        parsed.map(Some).ok_or_else(|| InstrumentError::PolicyParse {
            line: number,
            content: line.trim_end().to_string(),
        })
    }
}

/// Loop frequencies and ceiling that apply to one rank
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrequencyMap {
    frequencies: HashMap<u64, u32>,
    ceiling: Option<u32>,
}

impl FrequencyMap {
    /// A map that leaves every loop alone
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Parse a whole policy for `rank`; the first bad line fails the parse
    pub fn parse(content: &str, rank: u32) -> InstrumentResult<Self> {
        let mut map = Self::default();
        for (i, line) in content.lines().enumerate() {
            match PolicyLine::parse(i + 1, line)? {
                Some(PolicyLine::AllRanks { hash, freq }) => {
                    map.frequencies.insert(hash, freq);
                }
                Some(PolicyLine::OneRank { hash, rank: r, freq }) if r == rank => {
                    map.frequencies.insert(hash, freq);
                }
                Some(PolicyLine::RankCeiling { rank: r, freq }) if r == rank => {
                    map.ceiling = Some(freq);
                }
                Some(other) => debug!("line {}: {:?} is for another rank", i + 1, other),
                None => {}
            }
        }
        Ok(map)
    }

    pub fn load(path: &Path, rank: u32) -> InstrumentResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content, rank)
    }

    /// Load the file named by `PFREQ_FREQUENCY_MAP`, or run without scaling
    pub fn load_from_env(rank: u32) -> Self {
        let Some(path) = env::var_os(FREQUENCY_MAP_VAR) else {
            info!("{} not set, proceeding without frequency scaling", FREQUENCY_MAP_VAR);
            return Self::disabled();
        };
        let path = Path::new(&path);
        match Self::load(path, rank) {
            Ok(map) => {
                info!(
                    "frequency map from {}: {} loops, ceiling {:?}",
                    path.display(),
                    map.len(),
                    map.ceiling
                );
                map
            }
            Err(e) => {
                warn!("{}: {}; proceeding without frequency scaling", path.display(), e);
                Self::disabled()
            }
        }
    }

    pub fn frequency(&self, hash: u64) -> Option<u32> {
        self.frequencies.get(&hash).copied()
    }

    pub fn ceiling(&self) -> Option<u32> {
        self.ceiling
    }

    pub fn hashes(&self) -> impl Iterator<Item = u64> + '_ {
        self.frequencies.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty() && self.ceiling.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_all_ranks_line() {
        let map = FrequencyMap::parse("123456 * 1800000\n", 7).unwrap();
        assert_eq!(map.frequency(123456), Some(1800000));
        assert_eq!(map.ceiling(), None);
    }

    #[test]
    fn test_ceiling_is_not_a_loop_line() {
        let map = FrequencyMap::parse("0 2600000\n", 0).unwrap();
        assert_eq!(map.ceiling(), Some(2600000));
        assert_eq!(map.frequency(0), None);
        assert_eq!(map.len(), 0);

        let other = FrequencyMap::parse("0 2600000\n", 1).unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn test_one_rank_line_and_hex_hash() {
        let content = "# policy\n0x1e240 3 1600000\n99 4 1200000\n\n";
        let map = FrequencyMap::parse(content, 3).unwrap();
        assert_eq!(map.frequency(123456), Some(1600000));
        assert_eq!(map.frequency(99), None);
    }

    #[test]
    fn test_first_bad_line_fails() {
        let err = FrequencyMap::parse("1 * 100\nfast please\n2 * 200\n", 0).unwrap_err();
        match err {
            InstrumentError::PolicyParse { line, content } => {
                assert_eq!(line, 2);
                assert_eq!(content, "fast please");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(PolicyLine::parse(1, "12 * -5").is_err());
        assert!(PolicyLine::parse(1, "1 2 3 4").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "123456 * 1800000").unwrap();
        writeln!(file, "2 2000000").unwrap();
        let map = FrequencyMap::load(file.path(), 2).unwrap();
        assert_eq!(map.frequency(123456), Some(1800000));
        assert_eq!(map.ceiling(), Some(2000000));
    }
}
