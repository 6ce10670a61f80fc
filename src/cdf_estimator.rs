// Per-channel empirical CDF over the quantized symbol alphabet (§4.2).
//
// Grounded on `process_batch`/`process_layers` in the original CacheGen encoder, which
// one-hot-encodes quantized symbols across the token axis and cumulative-sums the resulting
// counts. This crate counts directly instead of materializing a one-hot tensor, per §5's
// resource note ("must not retain the one-hot expansion beyond CDF estimation").

use crate::config::ALPHABET;
use crate::error::{CodecError, Result};
use crate::tensor::Tensor3;

/// Empirical CDF over the quantized symbol alphabet, per `(layer, channel)`.
///
/// Shape `[L, C, ALPHABET+1]`; `cdf[l, c, 0] == 0`, non-decreasing along the last axis,
/// `cdf[l, c, ALPHABET] <= 1`.
pub fn estimate_cdf(symbols: &Tensor3<u8>) -> Result<Tensor3<f32>> {
  let (l, t, c) = (symbols.dim0(), symbols.dim1(), symbols.dim2());
  let a1 = (ALPHABET + 1) as usize;
  let mut cdf = Tensor3::<f32>::zeroed(l, c, a1);

  for layer in 0..l {
    // counts[channel][symbol]
    let mut counts = vec![0u32; c * a1];
    for token in 0..t {
      let row = symbols.row(layer, token);
      for (channel, &sym) in row.iter().enumerate() {
        let sym = sym as usize;
        if sym >= a1 {
          return Err(CodecError::internal_invariant(format!(
            "quantized symbol {sym} at layer {layer} channel {channel} is >= alphabet size {a1} (bins > {})",
            ALPHABET + 1
          )));
        }
        counts[channel * a1 + sym] += 1;
      }
    }

    for channel in 0..c {
      let channel_counts = &counts[channel * a1..(channel + 1) * a1];
      let out_row = cdf.row_mut(layer, channel);

      // Cumulative probability *strictly less than* symbol `a`: prepend 0, drop the last
      // cumulative bucket (§4.2 step 3's "cumulate then right-shift by one position").
      let mut running = 0.0f32;
      out_row[0] = 0.0;
      for a in 0..a1 - 1 {
        running += channel_counts[a] as f32 / t as f32;
        out_row[a + 1] = running;
      }
    }
  }

  Ok(cdf)
}
