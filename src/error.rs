// Structured error kinds for the codec core (§7).
//
// Grounded in the `thiserror` usage elsewhere in the corpus (volt-core, exsa-engine): one
// variant per `kind` named by the spec, each carrying a human-readable detail.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
  #[error("invalid codec configuration: {detail}")]
  ConfigInvalid { detail: String },

  #[error("shape mismatch: {detail}")]
  ShapeMismatch { detail: String },

  #[error("entropy coder output exceeded the per-blob size cap ({size} > {cap} bytes)")]
  CoderOverflow { size: usize, cap: usize },

  #[error("internal invariant violated: {detail}")]
  InternalInvariant { detail: String },
}

impl CodecError {
  pub fn config_invalid(detail: impl Into<String>) -> Self {
    CodecError::ConfigInvalid { detail: detail.into() }
  }

  pub fn shape_mismatch(detail: impl Into<String>) -> Self {
    CodecError::ShapeMismatch { detail: detail.into() }
  }

  pub fn internal_invariant(detail: impl Into<String>) -> Self {
    CodecError::InternalInvariant { detail: detail.into() }
  }
}

pub type Result<T> = std::result::Result<T, CodecError>;
