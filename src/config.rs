// Codec configuration: the layer-banded bin schedule of §6.1, loaded from a TOML table keyed
// by model name. Mirrors the `from_file`/validate-at-load-time shape used for engine config
// elsewhere in this codebase's family, rather than validating lazily on first use.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, Result};

/// Alphabet cap fixed by the spec: symbols live in `[0, ALPHABET]`, CDFs have `ALPHABET + 1`
/// entries.
pub const ALPHABET: u32 = 32;

/// Fixed-point precision used by the CDF normalizer (§4.3).
pub const CDF_PRECISION: u32 = 16;

/// The layer-banded bin schedule for one model (§6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
  pub key_first_layers: usize,
  pub key_first_bins: u32,
  pub key_second_layers: usize,
  pub key_second_bins: u32,
  pub key_third_bins: u32,
  pub value_first_layers: usize,
  pub value_first_bins: u32,
  pub value_second_bins: u32,
}

impl CodecConfig {
  /// Bin count for a given Key layer index (§4.1 step 1).
  pub fn key_bins(&self, layer: usize) -> u32 {
    if layer < self.key_first_layers {
      self.key_first_bins
    } else if layer < self.key_second_layers {
      self.key_second_bins
    } else {
      self.key_third_bins
    }
  }

  /// Bin count for a given Value layer index.
  pub fn value_bins(&self, layer: usize) -> u32 {
    if layer < self.value_first_layers {
      self.value_first_bins
    } else {
      self.value_second_bins
    }
  }

  /// Validate band monotonicity and bin caps (§4.8). Called at load time, not first use.
  pub fn validate(&self) -> Result<()> {
    if self.key_second_layers < self.key_first_layers {
      return Err(CodecError::config_invalid(format!(
        "key_second_layers ({}) must be >= key_first_layers ({})",
        self.key_second_layers, self.key_first_layers
      )));
    }

    for (name, bins) in [
      ("key_first_bins", self.key_first_bins),
      ("key_second_bins", self.key_second_bins),
      ("key_third_bins", self.key_third_bins),
      ("value_first_bins", self.value_first_bins),
      ("value_second_bins", self.value_second_bins),
    ] {
      if bins == 0 {
        return Err(CodecError::config_invalid(format!("{name} must be positive")));
      }
      if bins > ALPHABET + 1 {
        return Err(CodecError::config_invalid(format!(
          "{name} = {bins} exceeds the CDF alphabet size of {}",
          ALPHABET + 1
        )));
      }
    }

    Ok(())
  }
}

/// Engine-level configuration: the `T` axis length (§6.1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineConfig {
  pub chunk_size: usize,
}

/// A map from model name to `CodecConfig`, as loaded from a TOML document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodecConfigTable {
  #[serde(flatten)]
  models: HashMap<String, CodecConfig>,
}

impl CodecConfigTable {
  pub fn from_toml(text: &str) -> Result<Self> {
    let table: CodecConfigTable =
      toml::from_str(text).map_err(|e| CodecError::config_invalid(format!("TOML parse error: {e}")))?;

    for (model_name, cfg) in &table.models {
      cfg.validate().map_err(|e| match e {
        CodecError::ConfigInvalid { detail } => {
          CodecError::config_invalid(format!("model '{model_name}': {detail}"))
        }
        other => other,
      })?;
    }

    Ok(table)
  }

  pub fn get(&self, model_name: &str) -> Option<&CodecConfig> {
    self.models.get(model_name)
  }

  pub fn insert(&mut self, model_name: impl Into<String>, config: CodecConfig) {
    self.models.insert(model_name.into(), config);
  }

  /// A small built-in default table covering the common case where no external config is
  /// supplied (§4.8).
  pub fn defaults() -> Self {
    let mut table = CodecConfigTable::default();
    table.insert(
      "default",
      CodecConfig {
        key_first_layers: 10,
        key_first_bins: 32,
        key_second_layers: 20,
        key_second_bins: 16,
        key_third_bins: 4,
        value_first_layers: 2,
        value_first_bins: 32,
        value_second_bins: 16,
      },
    );
    table
  }
}

/// Selects the input-layout adapter named in engine metadata (§6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
  /// Native layout: `[L, 2, T, H, D]`, no adapter needed.
  Native,
  /// `[L, 2, H, T, D]`; transposed by `layout::to_native` before entering the core.
  Huggingface,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> CodecConfig {
    CodecConfig {
      key_first_layers: 2,
      key_first_bins: 8,
      key_second_layers: 4,
      key_second_bins: 16,
      key_third_bins: 32,
      value_first_layers: 1,
      value_first_bins: 32,
      value_second_bins: 16,
    }
  }

  #[test]
  fn layer_band_boundaries_select_the_right_bins() {
    let cfg = sample();
    assert_eq!(cfg.key_bins(0), 8);
    assert_eq!(cfg.key_bins(1), 8);
    assert_eq!(cfg.key_bins(2), 16);
    assert_eq!(cfg.key_bins(3), 16);
    assert_eq!(cfg.key_bins(4), 32);
    assert_eq!(cfg.value_bins(0), 32);
    assert_eq!(cfg.value_bins(1), 16);
  }

  #[test]
  fn rejects_non_monotone_bands() {
    let mut cfg = sample();
    cfg.key_second_layers = 1; // < key_first_layers (2)
    assert!(cfg.validate().is_err());
  }

  #[test]
  fn rejects_bins_over_alphabet_cap() {
    let mut cfg = sample();
    cfg.key_third_bins = 34;
    assert!(cfg.validate().is_err());
  }

  #[test]
  fn from_toml_rejects_non_monotone_bands_at_load_time() {
    let text = r#"
      [broken]
      key_first_layers = 4
      key_first_bins = 8
      key_second_layers = 2
      key_second_bins = 16
      key_third_bins = 32
      value_first_layers = 1
      value_first_bins = 32
      value_second_bins = 16
    "#;
    assert!(CodecConfigTable::from_toml(text).is_err());
  }

  #[test]
  fn defaults_table_is_valid() {
    let table = CodecConfigTable::defaults();
    let cfg = table.get("default").unwrap();
    assert!(cfg.validate().is_ok());
  }
}
