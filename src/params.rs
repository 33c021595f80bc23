//! Scheme parameters and cache configuration
//!
//! Ring parameters are passed through to the backend untouched; the
//! remaining fields decide how compiled transforms are cached on disk.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How diagonal data and keys move between memory and disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    /// Everything stays in memory; the cache is never touched.
    #[default]
    None,
    /// Write fresh cache entries, replacing any existing layer entry.
    Save,
    /// Read existing entries after verifying them against the live layer.
    Load,
}

impl IoMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IoMode::None => "none",
            IoMode::Save => "save",
            IoMode::Load => "load",
        }
    }

    /// True when compiled transforms go through the on-disk cache.
    pub fn uses_disk(&self) -> bool {
        !matches!(self, IoMode::None)
    }
}

impl fmt::Display for IoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IoMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(IoMode::None),
            "save" => Ok(IoMode::Save),
            "load" => Ok(IoMode::Load),
            other => Err(Error::InvalidParams(format!(
                "unknown io mode `{}` (expected none, save or load)",
                other
            ))),
        }
    }
}

/// Packing strategy used when the layer's diagonals were produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingMethod {
    #[default]
    Hybrid,
    Square,
}

impl EmbeddingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingMethod::Hybrid => "hybrid",
            EmbeddingMethod::Square => "square",
        }
    }
}

impl fmt::Display for EmbeddingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbeddingMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hybrid" => Ok(EmbeddingMethod::Hybrid),
            "square" => Ok(EmbeddingMethod::Square),
            other => Err(Error::InvalidParams(format!(
                "unknown embedding method `{}` (expected hybrid or square)",
                other
            ))),
        }
    }
}

/// Core parameters for a CKKS scheme instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemeParams {
    /// log2 of the ring dimension N; the backend exposes N/2 slots
    pub log_n: u32,

    /// Bit sizes of the ciphertext moduli chain
    pub log_q: Vec<u32>,

    /// Bit sizes of the auxiliary key-switching moduli
    pub log_p: Vec<u32>,

    /// log2 of the default encoding scale
    pub log_scale: u32,

    /// Auxiliary moduli used by bootstrapping key switches
    pub boot_logp: Vec<u32>,

    pub embedding_method: EmbeddingMethod,

    pub io_mode: IoMode,

    /// Root directory of the transform cache
    pub diags_path: PathBuf,

    /// Location of serialized evaluation keys, owned by the backend
    pub keys_path: PathBuf,
}

impl SchemeParams {
    /// Small parameter set for tests and demos (N = 2^13)
    pub fn toy() -> Self {
        Self {
            log_n: 13,
            log_q: vec![29, 26, 26, 26, 26, 26],
            log_p: vec![29, 29],
            log_scale: 26,
            boot_logp: vec![61, 61, 61, 61, 61, 61],
            embedding_method: EmbeddingMethod::Hybrid,
            io_mode: IoMode::None,
            diags_path: PathBuf::from("data/diagonals"),
            keys_path: PathBuf::from("data/keys.bin"),
        }
    }

    /// Parse parameters from a JSON document
    pub fn from_json_reader<R: Read>(reader: R) -> Result<Self> {
        let params: SchemeParams = serde_json::from_reader(reader)
            .map_err(|e| Error::InvalidParams(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    /// Number of plaintext slots (N/2), or 0 when `log_n` is out of range
    pub fn max_slots(&self) -> usize {
        self.log_n
            .checked_sub(1)
            .and_then(|shift| 1usize.checked_shl(shift))
            .unwrap_or(0)
    }

    /// Highest ciphertext level
    pub fn max_level(&self) -> u32 {
        (self.log_q.len() as u32).saturating_sub(1)
    }

    pub fn storage(&self) -> StorageConfig<'_> {
        StorageConfig {
            diags_path: &self.diags_path,
            keys_path: &self.keys_path,
            io_mode: self.io_mode,
        }
    }

    /// Check if parameters are valid
    pub fn validate(&self) -> Result<()> {
        if !(2..=17).contains(&self.log_n) {
            return Err(Error::InvalidParams(format!(
                "log_n must be in [2, 17], got {}",
                self.log_n
            )));
        }
        if self.log_q.is_empty() {
            return Err(Error::InvalidParams("log_q must list at least one modulus".into()));
        }
        if self.log_scale == 0 || self.log_q.iter().any(|&q| q < self.log_scale) {
            return Err(Error::InvalidParams(
                "log_scale must be positive and no larger than any log_q entry".into(),
            ));
        }
        if self.boot_logp.is_empty() {
            return Err(Error::InvalidParams("boot_logp must not be empty".into()));
        }
        if self.io_mode.uses_disk() && self.diags_path.as_os_str().is_empty() {
            return Err(Error::InvalidParams(format!(
                "io mode `{}` requires a diags_path",
                self.io_mode
            )));
        }
        Ok(())
    }
}

impl Default for SchemeParams {
    fn default() -> Self {
        Self::toy()
    }
}

/// Cache locations and IO mode handed to the backend with every transform call
#[derive(Debug, Clone, Copy)]
pub struct StorageConfig<'a> {
    pub diags_path: &'a Path,
    pub keys_path: &'a Path,
    pub io_mode: IoMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_valid() {
        let params = SchemeParams::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.max_slots(), 4096);
        assert_eq!(params.max_level(), 5);
    }

    #[test]
    fn test_ring_sizes_of_unvalidated_params() {
        let params = SchemeParams {
            log_n: 0,
            log_q: Vec::new(),
            ..SchemeParams::toy()
        };
        assert_eq!(params.max_slots(), 0);
        assert_eq!(params.max_level(), 0);
        assert!(params.validate().is_err());

        let params = SchemeParams {
            log_n: 200,
            ..SchemeParams::toy()
        };
        assert_eq!(params.max_slots(), 0);
    }

    #[test]
    fn test_io_mode_parse() {
        assert_eq!("save".parse::<IoMode>().unwrap(), IoMode::Save);
        assert_eq!("load".parse::<IoMode>().unwrap(), IoMode::Load);
        assert_eq!("none".parse::<IoMode>().unwrap(), IoMode::None);
        assert!("write".parse::<IoMode>().is_err());
        assert!(!IoMode::None.uses_disk());
        assert!(IoMode::Load.uses_disk());
    }

    #[test]
    fn test_reject_bad_scale() {
        let mut params = SchemeParams::toy();
        params.log_scale = 40;
        assert!(matches!(params.validate(), Err(Error::InvalidParams(_))));
    }

    #[test]
    fn test_json_roundtrip() {
        let mut params = SchemeParams::toy();
        params.io_mode = IoMode::Save;
        params.embedding_method = EmbeddingMethod::Square;

        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"io_mode\":\"save\""));
        assert!(json.contains("\"embedding_method\":\"square\""));

        let parsed = SchemeParams::from_json_reader(json.as_bytes()).unwrap();
        assert_eq!(parsed, params);
    }
}
