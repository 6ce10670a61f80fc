// Input-layout adapter: `fmt == "huggingface"` gives `[L, 2, H, T, D]`; the core always wants
// `[L, 2, T, H, D]` (§6.1, §3's native layout invariant).
//
// Grounded on `tensor.permute(0, 1, 3, 2, 4)` in `CacheGenSerializer.to_bytes` in the original
// encoder, expressed as an explicit copy loop in the teacher's `Array2D::transpose_into` idiom
// rather than a generic permute (the core fixes exactly one foreign layout to adapt, per §1's
// scope note that re-permutation from other foreign layouts is the caller's problem).

use crate::tensor::KvTensor;

/// Transpose a `[L, 2, H, T, D]` tensor (heads before tokens) into this crate's native
/// `[L, 2, T, H, D]` layout.
pub fn huggingface_to_native(
  num_layers: usize,
  num_tokens: usize,
  num_heads: usize,
  head_size: usize,
  heads_last_data: &[f32],
) -> KvTensor {
  assert_eq!(heads_last_data.len(), num_layers * 2 * num_heads * num_tokens * head_size);

  let mut out = KvTensor::zeroed(num_layers, num_tokens, num_heads, head_size);
  let index = |layer: usize, kind: usize, head: usize, token: usize, dim: usize| -> usize {
    (((layer * 2 + kind) * num_heads + head) * num_tokens + token) * head_size + dim
  };

  for layer in 0..num_layers {
    for kind in 0..2 {
      for head in 0..num_heads {
        for token in 0..num_tokens {
          for dim in 0..head_size {
            let value = heads_last_data[index(layer, kind, head, token, dim)];
            out.set(layer, kind, token, head, dim, value);
          }
        }
      }
    }
  }

  out
}
