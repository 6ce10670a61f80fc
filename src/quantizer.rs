// Scalar, symmetric, per-(layer, token) uniform quantization with layer-banded bin counts
// (§4.1), and its decoder-side inverse.
//
// Grounded on `torch_quant` in the original CacheGen encoder, translated from tensor-library
// reductions to explicit per-row loops over `Tensor3` rows.

use crate::config::CodecConfig;
use crate::error::{CodecError, Result};
use crate::tensor::Tensor3;

/// Quantized symbols (one alphabet index per `[layer, token, channel]`) and the per-row scale
/// used to invert the quantization on decode.
pub struct Quantized {
  pub symbols: Tensor3<u8>,
  /// One scale per `(layer, token)`; shape `[L, T]`.
  pub scales: Vec<f32>,
  /// `C_max = bins/2 - 1` for each layer, needed to dequantize.
  pub c_max: Vec<i32>,
}

/// Round-half-to-even, matching the fixed rounding mode documented in §9.
fn round_half_to_even(x: f32) -> f32 {
  let floor = x.floor();
  let diff = x - floor;
  if diff < 0.5 {
    floor
  } else if diff > 0.5 {
    floor + 1.0
  } else if (floor as i64) % 2 == 0 {
    floor
  } else {
    floor + 1.0
  }
}

fn bins_for_layer(config: &CodecConfig, layer: usize, is_key: bool) -> Result<u32> {
  let bins = if is_key { config.key_bins(layer) } else { config.value_bins(layer) };
  if bins == 0 || bins > crate::config::ALPHABET + 1 {
    return Err(CodecError::config_invalid(format!(
      "layer {layer} resolved to bins = {bins}, outside (0, {}]",
      crate::config::ALPHABET + 1
    )));
  }
  Ok(bins)
}

/// Quantize one `[L, T, C]` tensor (Keys or Values) under the layer-banded bin schedule.
pub fn quantize(fp: &Tensor3<f32>, config: &CodecConfig, is_key: bool) -> Result<Quantized> {
  let (l, t, c) = (fp.dim0(), fp.dim1(), fp.dim2());
  let mut symbols = Tensor3::<u8>::zeroed(l, t, c);
  let mut scales = vec![0.0f32; l * t];
  let mut c_max = vec![0i32; l];

  for layer in 0..l {
    let bins = bins_for_layer(config, layer, is_key)?;
    let max_val = (bins / 2) as i32 - 1;
    c_max[layer] = max_val;

    for token in 0..t {
      let row = fp.row(layer, token);
      let mut scale = row.iter().fold(0.0f32, |acc, &x| acc.max(x.abs()));
      // Zero-scale substitution (§4.1 step 3 / §9 open question): preserve invertibility by
      // treating an all-zero row as if it were scaled by 1, emitting the center symbol.
      if scale == 0.0 {
        scale = 1.0;
      }
      scales[layer * t + token] = scale;

      let out_row = symbols.row_mut(layer, token);
      for (k, &x) in row.iter().enumerate() {
        let raw = round_half_to_even(x * (max_val as f32 / scale));
        let clipped = raw.clamp(-(max_val as f32), max_val as f32) as i32;
        out_row[k] = (clipped + max_val) as u8;
      }
    }
  }

  Ok(Quantized { symbols, scales, c_max })
}

/// Dequantize one `[L, T, C]` symbol tensor back to floats (decoder-side inverse of `quantize`).
pub fn dequantize(symbols: &Tensor3<u8>, scales: &[f32], c_max: &[i32]) -> Tensor3<f32> {
  let (l, t, c) = (symbols.dim0(), symbols.dim1(), symbols.dim2());
  let mut out = Tensor3::<f32>::zeroed(l, t, c);

  for layer in 0..l {
    let max_val = c_max[layer] as f32;
    for token in 0..t {
      let scale = scales[layer * t + token];
      let in_row = symbols.row(layer, token);
      let out_row = out.row_mut(layer, token);
      for k in 0..c {
        let centered = in_row[k] as f32 - max_val;
        out_row[k] = centered / max_val * scale;
      }
    }
  }

  out
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config_with_bins(bins: u32) -> CodecConfig {
    CodecConfig {
      key_first_layers: 1000,
      key_first_bins: bins,
      key_second_layers: 1000,
      key_second_bins: bins,
      key_third_bins: bins,
      value_first_layers: 1000,
      value_first_bins: bins,
      value_second_bins: bins,
    }
  }

  #[test]
  fn all_zero_row_substitutes_scale_one_and_centers() {
    let cfg = config_with_bins(8);
    let fp = Tensor3::<f32>::zeroed(2, 4, 4); // all zero, L=2 T=4 C=4
    let q = quantize(&fp, &cfg, true).unwrap();
    assert_eq!(q.scales, vec![1.0; 2 * 4]);
    let c_max = q.c_max[0];
    for layer in 0..2 {
      for token in 0..4 {
        for &s in q.symbols.row(layer, token) {
          assert_eq!(s as i32, c_max);
        }
      }
    }
  }

  #[test]
  fn single_row_ramp_maps_to_expected_symbols() {
    // L=1, T=1, C=8: one row, values -3..4 across its channels, bins=8 => C_max=3, scale=4,
    // sym = round_half_to_even(x * 3/4) + 3.
    let mut fp = Tensor3::<f32>::zeroed(1, 1, 8);
    let values = [-3.0, -2.0, -1.0, 0.0, 1.0, 2.0, 3.0, 4.0];
    fp.row_mut(0, 0).copy_from_slice(&values);

    let cfg = config_with_bins(8);
    let q = quantize(&fp, &cfg, true).unwrap();
    assert_eq!(q.scales[0], 4.0);

    let expected = [1u8, 1, 2, 3, 4, 5, 5, 6];
    assert_eq!(q.symbols.row(0, 0), &expected[..]);
  }

  #[test]
  fn dequantize_inverts_quantize_within_step_size() {
    let mut fp = Tensor3::<f32>::zeroed(1, 1, 4);
    for (i, v) in [0.5, -1.25, 3.0, -3.0].iter().enumerate() {
      fp.row_mut(0, 0)[i] = *v;
    }
    let cfg = config_with_bins(8);
    let q = quantize(&fp, &cfg, true).unwrap();
    let recon = dequantize(&q.symbols, &q.scales, &q.c_max);

    let step = q.scales[0] / q.c_max[0] as f32;
    for i in 0..4 {
      let err = (recon.row(0, 0)[i] - fp.row(0, 0)[i]).abs();
      assert!(err <= step + 1e-6, "error {err} exceeded one step {step}");
    }
  }

  #[test]
  fn layer_band_boundary_selects_right_symbol_range() {
    let cfg = CodecConfig {
      key_first_layers: 2,
      key_first_bins: 8,
      key_second_layers: 4,
      key_second_bins: 16,
      key_third_bins: 32,
      value_first_layers: 0,
      value_first_bins: 32,
      value_second_bins: 32,
    };

    // Large-magnitude inputs so quantization saturates to the band's extremes.
    let mut fp = Tensor3::<f32>::zeroed(5, 2, 1);
    for l in 0..5 {
      for t in 0..2 {
        fp.row_mut(l, t)[0] = 1000.0;
      }
    }

    let q = quantize(&fp, &cfg, true).unwrap();
    assert_eq!(q.c_max, vec![3, 3, 7, 7, 15]); // bins/2-1 for 8,8,16,16,32
    for l in 0..5 {
      for &s in q.symbols.layer(l) {
        assert_eq!(s as i32, 2 * q.c_max[l]); // saturated to +C_max -> symbol 2*C_max
      }
    }
  }

  #[test]
  fn bins_over_alphabet_cap_is_a_config_error() {
    let cfg = config_with_bins(34);
    let fp = Tensor3::<f32>::zeroed(1, 1, 1);
    assert!(quantize(&fp, &cfg, true).is_err());
  }
}
