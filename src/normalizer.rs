// Fixed-point CDF normalization (§4.3): float CDF in `[0, 1)` -> strictly increasing integer
// CDF in `[0, 2^16)`.
//
// Grounded on `_convert_to_int_and_normalize`/`_renorm_cast_cdf_` in the original CacheGen
// encoder. This crate always normalizes (the spec fixes `needs_normalization = true` for the
// primary path, §4.3), and reuses the one result for both the entropy coder's CDF and the
// "final CDF for persistence" (§4.3 allows either).

use crate::config::CDF_PRECISION;
use crate::tensor::Tensor3;

/// Round-half-to-even, matching the quantizer's fixed rounding mode (§9).
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

/// Normalize a floating CDF of shape `[.., Lp]` to a strictly increasing `u16` CDF in
/// `[0, 2^16)`.
pub fn normalize_cdf(cdf: &Tensor3<f32>) -> Tensor3<u16> {
  let (l, c, lp) = (cdf.dim0(), cdf.dim1(), cdf.dim2());
  let f = 1u32 << CDF_PRECISION;
  // One more than the textbook `f - (Lp - 1)`: the empirical CDF's trailing entries are often
  // all exactly 1.0 (every symbol used is below the alphabet cap), and `round(1.0 * new_max) +
  // (Lp - 1)` must not exceed `f - 1`. Reserving `Lp` instead of `Lp - 1` gives the ramp enough
  // headroom that the last entry lands exactly on `f - 1` without a clamp, so two ties at 1.0
  // never collide after rounding.
  let new_max = (f - lp as u32) as f32;

  let mut out = Tensor3::<u16>::zeroed(l, c, lp);
  for layer in 0..l {
    for channel in 0..c {
      let in_row = cdf.row(layer, channel);
      let out_row = out.row_mut(layer, channel);
      for (a, &p) in in_row.iter().enumerate() {
        let scaled = round_half_to_even(p * new_max) as u32;
        out_row[a] = (scaled + a as u32) as u16;
      }
    }
  }

  out
}
