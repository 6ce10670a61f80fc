// The Codec Facade (§4.6), its decoder counterpart (§4.7), and the small registry/port shapes
// from §4.9/§6.3.
//
// Grounded on `encode_function` in the original CacheGen encoder for orchestration order; the
// `KvCodec` trait + `CodecRegistry` shape is grounded on §9's polymorphism note, in the idiom of
// trait-object registries keyed by string name used elsewhere in this corpus (tinyavif itself is
// a single-codec binary with no registry of its own).

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::blob::{self, EncoderOutput};
use crate::cdf_estimator::estimate_cdf;
use crate::config::CodecConfig;
use crate::driver;
use crate::entropy;
use crate::error::{CodecError, Result};
use crate::normalizer::normalize_cdf;
use crate::quantizer::{self, Quantized};
use crate::tensor::{KvTensor, Tensor3};

/// Reconstructed Key/Value tensors plus the shape metadata needed to un-flatten channels back
/// to `[L, T, H, D]` (§4.7).
pub struct DecodedKv {
  pub fp_k: Tensor3<f32>,
  pub fp_v: Tensor3<f32>,
  pub num_heads: usize,
  pub head_size: usize,
}

impl DecodedKv {
  /// Merge back into the native `[L, 2, T, H, D]` layout.
  pub fn into_kv_tensor(self) -> KvTensor {
    KvTensor::merge_flatten(&self.fp_k, &self.fp_v, self.num_heads, self.head_size)
  }
}

/// Minimal consumer-facing view of decoded KV state (§6.3's retriever/blender sketch): one
/// `(K, V)` row per layer, as flat channel slices.
pub trait KvSource {
  fn decoded(&self, layer: usize) -> Option<(&[f32], &[f32])>;
}

impl KvSource for DecodedKv {
  fn decoded(&self, layer: usize) -> Option<(&[f32], &[f32])> {
    if layer >= self.fp_k.dim0() {
      return None;
    }
    Some((self.fp_k.layer(layer), self.fp_v.layer(layer)))
  }
}

fn quantize_bank(fp: &Tensor3<f32>, config: &CodecConfig, is_key: bool) -> Result<Quantized> {
  quantizer::quantize(fp, config, is_key)
}

/// Stack two `[L, T, C]` symbol tensors into one `[2L, T, C]` tensor, K slabs first (§4.4
/// step 1).
fn stack_symbol_slabs(k: &Tensor3<u8>, v: &Tensor3<u8>) -> Tensor3<u8> {
  let (l, t, c) = (k.dim0(), k.dim1(), k.dim2());
  let mut out = Tensor3::<u8>::zeroed(2 * l, t, c);
  out.as_mut_slice()[..l * t * c].copy_from_slice(k.as_slice());
  out.as_mut_slice()[l * t * c..].copy_from_slice(v.as_slice());
  out
}

fn split_symbol_slabs(stacked: &Tensor3<u8>, num_layers: usize) -> (Tensor3<u8>, Tensor3<u8>) {
  let (t, c) = (stacked.dim1(), stacked.dim2());
  let mut k = Tensor3::<u8>::zeroed(num_layers, t, c);
  let mut v = Tensor3::<u8>::zeroed(num_layers, t, c);
  let half = num_layers * t * c;
  k.as_mut_slice().copy_from_slice(&stacked.as_slice()[..half]);
  v.as_mut_slice().copy_from_slice(&stacked.as_slice()[half..]);
  (k, v)
}

/// Concatenate two `[L, C, A+1]` CDF tensors along the leading axis into `[2L, C, A+1]` (§4.2).
fn concat_cdf_banks(k: &Tensor3<f32>, v: &Tensor3<f32>) -> Tensor3<f32> {
  let (l, c, a1) = (k.dim0(), k.dim1(), k.dim2());
  let mut out = Tensor3::<f32>::zeroed(2 * l, c, a1);
  out.as_mut_slice()[..l * c * a1].copy_from_slice(k.as_slice());
  out.as_mut_slice()[l * c * a1..].copy_from_slice(v.as_slice());
  out
}

/// Encode a native `[L, 2, T, H, D]` KV tensor into a self-describing blob (§4.6).
pub fn encode(kv: &KvTensor, config: &CodecConfig, chunk_size: usize) -> Result<Vec<u8>> {
  if kv.num_tokens != chunk_size {
    return Err(CodecError::shape_mismatch(format!(
      "kv has {} tokens but chunk_size is {chunk_size}",
      kv.num_tokens
    )));
  }

  debug!(num_layers = kv.num_layers, num_tokens = kv.num_tokens, "encode: splitting K/V");
  let (fp_k, fp_v) = kv.split_flatten();

  debug!("encode: quantizing");
  let qk = quantize_bank(&fp_k, config, true)?;
  let qv = quantize_bank(&fp_v, config, false)?;

  debug!("encode: estimating CDFs");
  let cdf_k = estimate_cdf(&qk.symbols)?;
  let cdf_v = estimate_cdf(&qv.symbols)?;
  let cdf_float = concat_cdf_banks(&cdf_k, &cdf_v);

  debug!("encode: normalizing CDF");
  let cdf_int = normalize_cdf(&cdf_float);

  debug!("encode: running entropy coder driver");
  let symbols = stack_symbol_slabs(&qk.symbols, &qv.symbols);
  let driver_out = driver::encode_serial(&symbols, &cdf_int)?;

  debug!("encode: assembling blob");
  let output = EncoderOutput {
    bytestream: driver_out.bytestream,
    offsets: driver_out.offsets,
    cdf_int,
    scales_key: qk.scales,
    scales_value: qv.scales,
    num_heads: kv.num_heads as u32,
    head_size: kv.head_size as u32,
    num_layers: kv.num_layers as u32,
    num_tokens: kv.num_tokens as u32,
    num_channels: kv.num_channels() as u32,
  };

  let bytes = blob::assemble(&output)?;
  debug!(bytes = bytes.len(), "encode: done");
  Ok(bytes)
}

/// Decode a blob produced by `encode` back into `(K, V)` tensors (§4.7).
pub fn decode(bytes: &[u8], config: &CodecConfig) -> Result<DecodedKv> {
  debug!(bytes = bytes.len(), "decode: parsing blob");
  let parsed = blob::parse(bytes)?;

  let num_layers = parsed.num_layers as usize;
  let num_tokens = parsed.num_tokens as usize;
  let num_channels = parsed.num_channels as usize;

  debug!("decode: running entropy coder driver");
  let stacked = driver::decode(
    &parsed.bytestream,
    &parsed.offsets,
    &parsed.cdf_int,
    2 * num_layers,
    num_tokens,
    num_channels,
  )?;
  let (sym_k, sym_v) = split_symbol_slabs(&stacked, num_layers);

  debug!("decode: dequantizing");
  let c_max_k: Vec<i32> = (0..num_layers).map(|l| config.key_bins(l) as i32 / 2 - 1).collect();
  let c_max_v: Vec<i32> = (0..num_layers).map(|l| config.value_bins(l) as i32 / 2 - 1).collect();

  let fp_k = quantizer::dequantize(&sym_k, &parsed.scales_key, &c_max_k);
  let fp_v = quantizer::dequantize(&sym_v, &parsed.scales_value, &c_max_v);

  Ok(DecodedKv {
    fp_k,
    fp_v,
    num_heads: parsed.num_heads as usize,
    head_size: parsed.head_size as usize,
  })
}

/// A pluggable KV-tensor serializer (§9's polymorphism note, §4.9).
pub trait KvCodec {
  fn to_bytes(&self, kv: &KvTensor) -> Result<Vec<u8>>;
  fn from_bytes(&self, bytes: &[u8]) -> Result<DecodedKv>;
}

/// The codec this crate implements: §2-§8's CacheGen-style quantize/CDF/entropy-code pipeline.
pub struct CacheGenCodec {
  pub config: CodecConfig,
  pub chunk_size: usize,
}

impl KvCodec for CacheGenCodec {
  fn to_bytes(&self, kv: &KvTensor) -> Result<Vec<u8>> {
    encode(kv, &self.config, self.chunk_size)
  }

  fn from_bytes(&self, bytes: &[u8]) -> Result<DecodedKv> {
    decode(bytes, &self.config)
  }
}

/// Maps a codec name to a boxed `KvCodec` implementation (§4.9, §9). Only `CacheGenCodec` is
/// implemented today; the registry exists so adding a second codec is a non-breaking addition.
#[derive(Default)]
pub struct CodecRegistry {
  codecs: HashMap<String, Box<dyn KvCodec>>,
}

impl CodecRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, name: impl Into<String>, codec: Box<dyn KvCodec>) {
    self.codecs.insert(name.into(), codec);
  }

  pub fn get(&self, name: &str) -> Option<&dyn KvCodec> {
    self.codecs.get(name).map(|b| b.as_ref())
  }

  pub fn encode(&self, name: &str, kv: &KvTensor) -> Result<Vec<u8>> {
    match self.get(name) {
      Some(codec) => codec.to_bytes(kv),
      None => {
        warn!(codec = name, "no codec registered under this name");
        Err(CodecError::config_invalid(format!("unknown codec '{name}'")))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tensor::KvTensor;

  fn small_config() -> CodecConfig {
    CodecConfig {
      key_first_layers: 1,
      key_first_bins: 8,
      key_second_layers: 2,
      key_second_bins: 16,
      key_third_bins: 32,
      value_first_layers: 1,
      value_first_bins: 8,
      value_second_bins: 4,
    }
  }

  fn random_kv(l: usize, t: usize, h: usize, d: usize) -> KvTensor {
    let mut kv = KvTensor::zeroed(l, t, h, d);
    let mut state = 999u32;
    for layer in 0..l {
      for kind in 0..2 {
        for token in 0..t {
          for head in 0..h {
            for dim in 0..d {
              state = state.wrapping_mul(1664525).wrapping_add(1013904223);
              let v = ((state >> 8) as i32 % 2000 - 1000) as f32 / 100.0;
              kv.set(layer, kind, token, head, dim, v);
            }
          }
        }
      }
    }
    kv
  }

  #[test]
  fn all_zero_kv_round_trips_to_the_center_symbol() {
    let cfg = small_config();
    let kv = KvTensor::zeroed(2, 4, 2, 2);
    let bytes = encode(&kv, &cfg, 4).unwrap();
    let decoded = decode(&bytes, &cfg).unwrap();

    for layer in 0..2 {
      for token in 0..4 {
        for &x in decoded.fp_k.row(layer, token) {
          assert_eq!(x, 0.0);
        }
      }
    }
  }

  #[test]
  fn random_kv_round_trips_within_error_bound() {
    let cfg = small_config();
    let kv = random_kv(2, 5, 2, 3);
    let bytes = encode(&kv, &cfg, 5).unwrap();
    let decoded = decode(&bytes, &cfg).unwrap();
    let roundtripped = DecodedKv {
      fp_k: decoded.fp_k,
      fp_v: decoded.fp_v,
      num_heads: decoded.num_heads,
      head_size: decoded.head_size,
    }
    .into_kv_tensor();

    let (fp_k, fp_v) = kv.split_flatten();
    for layer in 0..2 {
      for token in 0..5 {
        for head in 0..2 {
          for dim in 0..3 {
            let orig_k = kv.get(layer, 0, token, head, dim);
            let got_k = roundtripped.get(layer, 0, token, head, dim);
            let bound = fp_k.row(layer, token).iter().fold(0.0f32, |a, &b| a.max(b.abs())) / 3.0 + 1e-3;
            assert!((orig_k - got_k).abs() <= bound, "K mismatch: {orig_k} vs {got_k}");

            let orig_v = kv.get(layer, 1, token, head, dim);
            let got_v = roundtripped.get(layer, 1, token, head, dim);
            let bound_v = fp_v.row(layer, token).iter().fold(0.0f32, |a, &b| a.max(b.abs())) / 1.0 + 1e-3;
            assert!((orig_v - got_v).abs() <= bound_v, "V mismatch: {orig_v} vs {got_v}");
          }
        }
      }
    }
  }

  #[test]
  fn chunk_size_mismatch_is_a_shape_error() {
    let cfg = small_config();
    let kv = KvTensor::zeroed(1, 4, 1, 1);
    assert!(encode(&kv, &cfg, 8).is_err());
  }

  #[test]
  fn registry_dispatches_by_name() {
    let mut registry = CodecRegistry::new();
    registry.register(
      "cachegen",
      Box::new(CacheGenCodec { config: small_config(), chunk_size: 4 }),
    );

    let kv = KvTensor::zeroed(1, 4, 1, 1);
    assert!(registry.encode("cachegen", &kv).is_ok());
    assert!(registry.encode("missing", &kv).is_err());
  }
}
