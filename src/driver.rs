// Drives the integer arithmetic coder over per-(layer, token) symbol slices (§4.4).
//
// Grounded on the `for l in range(...): for i in range(chunk_size):` loop in
// `encode_function`/`encode_function_gpu` in the original CacheGen encoder. The "batched" path
// there broadcasts the CDF across the token axis and flattens to a single big call; this crate
// has no GPU dependency to batch onto (§5), so its batched path instead partitions the same
// `(l, t)` grid across independent per-row coder invocations without changing the per-row
// algorithm — exercising the batched-equivalence property (§8) without a device kernel.

use crate::entropy::{EntropyReader, EntropyWriter, MAX_BLOB_BYTES};
use crate::error::{CodecError, Result};
use crate::tensor::Tensor3;

/// The two sidecars produced alongside the concatenated bytestream: offsets into it (§3's
/// `OffsetTable`) and the bytestream itself.
pub struct DriverOutput {
  pub bytestream: Vec<u8>,
  pub offsets: Vec<u32>,
}

/// Per-`(slab, channel)` CDF rows, sliced out of the `[num_slabs, C, A+1]` integer CDF so the
/// driver can hand one `&[u16]` per channel to the entropy coder (§4.4 step 2b).
fn cdf_rows_for_slab<'a>(cdf_int: &'a Tensor3<u16>, slab: usize) -> Vec<&'a [u16]> {
  let c = cdf_int.dim1();
  (0..c).map(|channel| cdf_int.row(slab, channel)).collect()
}

/// Serial entropy-coder driver (§4.4 algorithm, encode direction).
///
/// `symbols` is `[num_slabs, T, C]` (K slabs followed by V slabs, per the ordering contract),
/// `cdf_int` is `[num_slabs, C, A+1]`.
pub fn encode_serial(symbols: &Tensor3<u8>, cdf_int: &Tensor3<u16>) -> Result<DriverOutput> {
  let (num_slabs, t, _c) = (symbols.dim0(), symbols.dim1(), symbols.dim2());
  let mut bytestream = Vec::new();
  let mut offsets = Vec::with_capacity(num_slabs * t);

  for slab in 0..num_slabs {
    let cdf_rows = cdf_rows_for_slab(cdf_int, slab);
    for token in 0..t {
      offsets.push(bytestream.len() as u32);

      let mut writer = EntropyWriter::new();
      writer.write_row(symbols.row(slab, token), &cdf_rows)?;
      let blob = writer.finalize()?;
      if blob.len() > MAX_BLOB_BYTES {
        return Err(CodecError::CoderOverflow { size: blob.len(), cap: MAX_BLOB_BYTES });
      }
      bytestream.extend_from_slice(&blob);
    }
  }

  Ok(DriverOutput { bytestream, offsets })
}

/// Batched entropy-coder driver: same per-row algorithm as `encode_serial`, partitioned over
/// the full `(slab, token)` grid up front rather than slab-by-slab. Must be bit-identical to
/// `encode_serial` (§8 batched-equivalence property).
pub fn encode_batched(symbols: &Tensor3<u8>, cdf_int: &Tensor3<u16>) -> Result<DriverOutput> {
  let (num_slabs, t, _c) = (symbols.dim0(), symbols.dim1(), symbols.dim2());

  // Flatten the (slab, token) grid so every row is addressed uniformly, mirroring the
  // reshape-to-[2L*T*C] step in the original's GPU path, minus the broadcast materialization.
  let mut rows: Vec<(usize, usize)> = Vec::with_capacity(num_slabs * t);
  for slab in 0..num_slabs {
    for token in 0..t {
      rows.push((slab, token));
    }
  }

  let mut blobs = Vec::with_capacity(rows.len());
  for &(slab, token) in &rows {
    let cdf_rows = cdf_rows_for_slab(cdf_int, slab);
    let mut writer = EntropyWriter::new();
    writer.write_row(symbols.row(slab, token), &cdf_rows)?;
    blobs.push(writer.finalize()?);
  }

  let mut bytestream = Vec::new();
  let mut offsets = Vec::with_capacity(rows.len());
  for blob in &blobs {
    offsets.push(bytestream.len() as u32);
    if blob.len() > MAX_BLOB_BYTES {
      return Err(CodecError::CoderOverflow { size: blob.len(), cap: MAX_BLOB_BYTES });
    }
    bytestream.extend_from_slice(blob);
  }

  Ok(DriverOutput { bytestream, offsets })
}

/// Decode direction: reconstruct `[num_slabs, T, C]` symbols from the bytestream, offsets, and
/// integer CDF (§4.4 decode algorithm).
pub fn decode(
  bytestream: &[u8],
  offsets: &[u32],
  cdf_int: &Tensor3<u16>,
  num_slabs: usize,
  num_tokens: usize,
  num_channels: usize,
) -> Result<Tensor3<u8>> {
  if offsets.len() != num_slabs * num_tokens {
    return Err(CodecError::shape_mismatch(format!(
      "expected {} offsets, got {}",
      num_slabs * num_tokens,
      offsets.len()
    )));
  }

  let mut symbols = Tensor3::<u8>::zeroed(num_slabs, num_tokens, num_channels);

  for slab in 0..num_slabs {
    let cdf_rows = cdf_rows_for_slab(cdf_int, slab);
    for token in 0..num_tokens {
      let idx = slab * num_tokens + token;
      let start = offsets[idx] as usize;
      let end = if idx + 1 < offsets.len() { offsets[idx + 1] as usize } else { bytestream.len() };
      if start > end || end > bytestream.len() {
        return Err(CodecError::shape_mismatch(format!(
          "offset range [{start}, {end}) out of bounds for a {}-byte bytestream",
          bytestream.len()
        )));
      }

      let mut reader = EntropyReader::new(&bytestream[start..end]);
      let row = reader.read_row(&cdf_rows)?;
      symbols.row_mut(slab, token).copy_from_slice(&row);
    }
  }

  Ok(symbols)
}
