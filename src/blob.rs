// Packs EncoderOutput into one self-describing byte sequence, and parses it back (§4.5, §6.2).
//
// Grounded on the teacher's `ISOBMFFWriter`/`ISOBMFFBox` (open-and-drop-to-finalize, explicit
// big-endian field writers over a growing `Vec<u8>`) simplified down to flat length-prefixed
// fields — this format doesn't need ISOBMFF's nested box/size-patching machinery, just a fixed
// sequence of length-prefixed records — and switched to little-endian per §4.5's framing choice,
// using the teacher's own `byteorder` dependency instead of hand-rolled byte shifting.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::error::{CodecError, Result};
use crate::tensor::Tensor3;

/// The Blob Assembler's product (§3's `EncoderOutput`), ready to be framed or already parsed
/// back from a frame.
pub struct EncoderOutput {
  pub bytestream: Vec<u8>,
  /// Length `2L*T`; `start_indices` in §6.2.
  pub offsets: Vec<u32>,
  /// Shape `[2L, C, 33]`.
  pub cdf_int: Tensor3<u16>,
  /// Shape `[L, T]` (flattened `[L, T, 1]`).
  pub scales_key: Vec<f32>,
  /// Shape `[L, T]` (flattened `[L, T, 1]`).
  pub scales_value: Vec<f32>,
  pub num_heads: u32,
  pub head_size: u32,
  pub num_layers: u32,
  pub num_tokens: u32,
  pub num_channels: u32,
}

const MAGIC: u32 = 0x4B56_4331; // "KVC1"

/// Serialize `EncoderOutput` into the crate's concrete little-endian, length-prefixed framing
/// (§4.5, §6.2). Field order is fixed so the parse in `parse` is unambiguous.
pub fn assemble(output: &EncoderOutput) -> Result<Vec<u8>> {
  let mut w = Vec::new();

  w.write_u32::<LittleEndian>(MAGIC).map_err(io_err)?;
  w.write_u32::<LittleEndian>(output.num_layers).map_err(io_err)?;
  w.write_u32::<LittleEndian>(output.num_tokens).map_err(io_err)?;
  w.write_u32::<LittleEndian>(output.num_channels).map_err(io_err)?;
  w.write_u32::<LittleEndian>(output.num_heads).map_err(io_err)?;
  w.write_u32::<LittleEndian>(output.head_size).map_err(io_err)?;

  w.write_u32::<LittleEndian>(output.bytestream.len() as u32).map_err(io_err)?;
  w.extend_from_slice(&output.bytestream);

  w.write_u32::<LittleEndian>(output.offsets.len() as u32).map_err(io_err)?;
  for &o in &output.offsets {
    w.write_i32::<LittleEndian>(o as i32).map_err(io_err)?;
  }

  w.write_u32::<LittleEndian>(output.cdf_int.as_slice().len() as u32).map_err(io_err)?;
  for &v in output.cdf_int.as_slice() {
    w.write_u16::<LittleEndian>(v).map_err(io_err)?;
  }

  w.write_u32::<LittleEndian>(output.scales_key.len() as u32).map_err(io_err)?;
  for &s in &output.scales_key {
    w.write_f32::<LittleEndian>(s).map_err(io_err)?;
  }

  w.write_u32::<LittleEndian>(output.scales_value.len() as u32).map_err(io_err)?;
  for &s in &output.scales_value {
    w.write_f32::<LittleEndian>(s).map_err(io_err)?;
  }

  Ok(w)
}

fn io_err(e: std::io::Error) -> CodecError {
  CodecError::internal_invariant(format!("blob write failed: {e}"))
}

/// Parse a blob produced by `assemble` back into `EncoderOutput`'s fields.
pub fn parse(bytes: &[u8]) -> Result<EncoderOutput> {
  let mut r = Cursor::new(bytes);

  let magic = r.read_u32::<LittleEndian>().map_err(parse_err)?;
  if magic != MAGIC {
    return Err(CodecError::shape_mismatch(format!("bad magic: {magic:#x}")));
  }

  let num_layers = r.read_u32::<LittleEndian>().map_err(parse_err)?;
  let num_tokens = r.read_u32::<LittleEndian>().map_err(parse_err)?;
  let num_channels = r.read_u32::<LittleEndian>().map_err(parse_err)?;
  let num_heads = r.read_u32::<LittleEndian>().map_err(parse_err)?;
  let head_size = r.read_u32::<LittleEndian>().map_err(parse_err)?;

  let bytestream_len = r.read_u32::<LittleEndian>().map_err(parse_err)? as usize;
  let mut bytestream = vec![0u8; bytestream_len];
  r.read_exact(&mut bytestream).map_err(parse_err)?;

  let num_offsets = r.read_u32::<LittleEndian>().map_err(parse_err)? as usize;
  let mut offsets = Vec::with_capacity(num_offsets);
  for _ in 0..num_offsets {
    offsets.push(r.read_i32::<LittleEndian>().map_err(parse_err)? as u32);
  }

  let cdf_len = r.read_u32::<LittleEndian>().map_err(parse_err)? as usize;
  let alphabet_plus_one = 33usize;
  let num_slabs = (2 * num_layers) as usize;
  if cdf_len != num_slabs * num_channels as usize * alphabet_plus_one {
    return Err(CodecError::shape_mismatch(format!(
      "cdf field has {cdf_len} entries, expected {}",
      num_slabs * num_channels as usize * alphabet_plus_one
    )));
  }
  let mut cdf_int = Tensor3::<u16>::zeroed(num_slabs, num_channels as usize, alphabet_plus_one);
  for v in cdf_int.as_mut_slice().iter_mut() {
    *v = r.read_u16::<LittleEndian>().map_err(parse_err)?;
  }

  let num_scales_k = r.read_u32::<LittleEndian>().map_err(parse_err)? as usize;
  let mut scales_key = Vec::with_capacity(num_scales_k);
  for _ in 0..num_scales_k {
    scales_key.push(r.read_f32::<LittleEndian>().map_err(parse_err)?);
  }

  let num_scales_v = r.read_u32::<LittleEndian>().map_err(parse_err)? as usize;
  let mut scales_value = Vec::with_capacity(num_scales_v);
  for _ in 0..num_scales_v {
    scales_value.push(r.read_f32::<LittleEndian>().map_err(parse_err)?);
  }

  Ok(EncoderOutput {
    bytestream,
    offsets,
    cdf_int,
    scales_key,
    scales_value,
    num_heads,
    head_size,
    num_layers,
    num_tokens,
    num_channels,
  })
}

fn parse_err(e: std::io::Error) -> CodecError {
  CodecError::shape_mismatch(format!("truncated or malformed blob: {e}"))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_output() -> EncoderOutput {
    let mut cdf_int = Tensor3::<u16>::zeroed(2, 3, 33); // num_slabs=2 (L=1), C=3
    for (i, v) in cdf_int.as_mut_slice().iter_mut().enumerate() {
      *v = i as u16;
    }
    EncoderOutput {
      bytestream: vec![1, 2, 3, 4, 5],
      offsets: vec![0, 2, 4],
      cdf_int,
      scales_key: vec![1.0, 2.0, 3.0],
      scales_value: vec![4.0, 5.0, 6.0],
      num_heads: 2,
      head_size: 3,
      num_layers: 1,
      num_tokens: 3,
      num_channels: 3,
    }
  }

  #[test]
  fn assemble_then_parse_roundtrips_every_field() {
    let output = sample_output();
    let bytes = assemble(&output).unwrap();
    let parsed = parse(&bytes).unwrap();

    assert_eq!(parsed.bytestream, output.bytestream);
    assert_eq!(parsed.offsets, output.offsets);
    assert_eq!(parsed.cdf_int.as_slice(), output.cdf_int.as_slice());
    assert_eq!(parsed.scales_key, output.scales_key);
    assert_eq!(parsed.scales_value, output.scales_value);
    assert_eq!(parsed.num_heads, output.num_heads);
    assert_eq!(parsed.head_size, output.head_size);
  }

  #[test]
  fn parse_rejects_bad_magic() {
    let mut bytes = assemble(&sample_output()).unwrap();
    bytes[0] = !bytes[0];
    assert!(parse(&bytes).is_err());
  }

  #[test]
  fn parse_rejects_truncated_blob() {
    let bytes = assemble(&sample_output()).unwrap();
    assert!(parse(&bytes[..bytes.len() - 10]).is_err());
  }
}
