// A small CLI driving the codec end to end: synthesize (or load) a KV tensor, encode it to a
// blob, and optionally decode it back and report the reconstruction error (§4.6/§4.7).

mod blob;
mod cdf_estimator;
mod config;
mod driver;
mod entropy;
mod error;
mod facade;
mod layout;
mod normalizer;
mod quantizer;
mod tensor;

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info};

use crate::config::{CodecConfigTable, InputFormat};
use crate::error::Result;
use crate::tensor::KvTensor;

/// Encode (and optionally round-trip) a transformer KV-cache tensor through the CacheGen-style
/// quantize/entropy-code pipeline.
#[derive(Parser, Debug)]
#[command(name = "kvcache-codec")]
#[command(about = "Quantize + entropy-code a KV-cache tensor into a self-describing blob", long_about = None)]
struct Cli {
  /// Number of transformer layers (`L`).
  #[arg(long, default_value_t = 4)]
  num_layers: usize,

  /// Tokens per chunk (`T`); must match `--config`'s expected chunk size when one is given.
  #[arg(long, default_value_t = 16)]
  chunk_size: usize,

  /// Attention heads (`H`).
  #[arg(long, default_value_t = 8)]
  num_heads: usize,

  /// Per-head dimension (`D`).
  #[arg(long, default_value_t = 16)]
  head_size: usize,

  /// Path to a TOML codec-configuration table keyed by model name (§6.1). Falls back to a
  /// small built-in default table when omitted.
  #[arg(long)]
  config: Option<PathBuf>,

  /// Model name selecting a band schedule from the config table.
  #[arg(long, default_value = "default")]
  model_name: String,

  /// Raw little-endian `f32` input file in the layout named by `--fmt`, of shape
  /// `[L, 2, *, *, D]`. A synthetic random tensor is generated when omitted.
  #[arg(long)]
  input: Option<PathBuf>,

  /// Input tensor layout (§6.1).
  #[arg(long, value_enum, default_value = "native")]
  fmt: InputFormat,

  /// Where to write the encoded blob.
  #[arg(long, default_value = "out.kvc")]
  output: PathBuf,

  /// Decode the freshly-written blob back and report the peak reconstruction error.
  #[arg(long)]
  roundtrip: bool,

  /// RNG seed for the synthetic tensor (ignored when `--input` is given).
  #[arg(long, default_value_t = 0)]
  seed: u64,
}

fn synthetic_kv(cli: &Cli) -> KvTensor {
  let mut rng = StdRng::seed_from_u64(cli.seed);
  let mut kv = KvTensor::zeroed(cli.num_layers, cli.chunk_size, cli.num_heads, cli.head_size);
  for layer in 0..cli.num_layers {
    for kind in 0..2 {
      for token in 0..cli.chunk_size {
        for head in 0..cli.num_heads {
          for dim in 0..cli.head_size {
            kv.set(layer, kind, token, head, dim, rng.gen_range(-4.0f32..4.0));
          }
        }
      }
    }
  }
  kv
}

fn load_kv(cli: &Cli, path: &PathBuf) -> Result<KvTensor> {
  let bytes = fs::read(path)
    .map_err(|e| error::CodecError::shape_mismatch(format!("reading {}: {e}", path.display())))?;
  if bytes.len() % 4 != 0 {
    return Err(error::CodecError::shape_mismatch(format!(
      "{} is {} bytes, not a whole number of f32 elements",
      path.display(),
      bytes.len()
    )));
  }
  let data: Vec<f32> = bytes.chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect();
  let expected = cli.num_layers * 2 * cli.chunk_size * cli.num_heads * cli.head_size;
  if data.len() != expected {
    return Err(error::CodecError::shape_mismatch(format!(
      "{} holds {} f32 elements, expected {expected} for L={} T={} H={} D={}",
      path.display(),
      data.len(),
      cli.num_layers,
      cli.chunk_size,
      cli.num_heads,
      cli.head_size
    )));
  }

  match cli.fmt {
    InputFormat::Native => {
      Ok(KvTensor::from_native(cli.num_layers, cli.chunk_size, cli.num_heads, cli.head_size, data))
    }
    InputFormat::Huggingface => Ok(layout::huggingface_to_native(
      cli.num_layers,
      cli.chunk_size,
      cli.num_heads,
      cli.head_size,
      &data,
    )),
  }
}

fn run(cli: Cli) -> Result<()> {
  let table = match &cli.config {
    Some(path) => {
      let text = fs::read_to_string(path)
        .map_err(|e| error::CodecError::config_invalid(format!("reading {}: {e}", path.display())))?;
      CodecConfigTable::from_toml(&text)?
    }
    None => CodecConfigTable::defaults(),
  };
  let config = table
    .get(&cli.model_name)
    .ok_or_else(|| error::CodecError::config_invalid(format!("no config for model '{}'", cli.model_name)))?
    .clone();

  let kv = match &cli.input {
    Some(path) => {
      info!(path = %path.display(), "loading KV tensor");
      load_kv(&cli, path)?
    }
    None => {
      info!(seed = cli.seed, "generating synthetic KV tensor");
      synthetic_kv(&cli)
    }
  };

  info!(
    num_layers = kv.num_layers,
    num_tokens = kv.num_tokens,
    num_heads = kv.num_heads,
    head_size = kv.head_size,
    "encoding"
  );
  let bytes = facade::encode(&kv, &config, cli.chunk_size)?;
  fs::write(&cli.output, &bytes)
    .map_err(|e| error::CodecError::internal_invariant(format!("writing {}: {e}", cli.output.display())))?;
  info!(bytes = bytes.len(), path = %cli.output.display(), "wrote blob");

  if cli.roundtrip {
    let decoded = facade::decode(&bytes, &config)?;
    let roundtripped = decoded.into_kv_tensor();

    let mut max_err = 0.0f32;
    for layer in 0..kv.num_layers {
      for kind in 0..2 {
        for token in 0..kv.num_tokens {
          for head in 0..kv.num_heads {
            for dim in 0..kv.head_size {
              let err = (kv.get(layer, kind, token, head, dim) - roundtripped.get(layer, kind, token, head, dim)).abs();
              max_err = max_err.max(err);
            }
          }
        }
      }
    }
    info!(max_abs_error = max_err, "round-trip complete");
  }

  Ok(())
}

fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "kvcache_codec=info".into()))
    .init();

  let cli = Cli::parse();
  match run(cli) {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      error!(error = %e, "encode failed");
      ExitCode::FAILURE
    }
  }
}
