//! Checkpointing and Serialization.
//!
//! Two formats are supported:
//!
//! * the native binary checkpoint: a header of 256 little-endian `u32` followed by every parameter
//!   as a little-endian `f32`, in [`ParameterTensors`] order. The header holds
//!
//!   | index | content            |
//!   |-------|--------------------|
//!   | 0     | magic `20240803`   |
//!   | 1     | version `5`        |
//!   | 2     | `max_seq_len`      |
//!   | 3     | `vocab_size`       |
//!   | 4     | `num_layers`       |
//!   | 5     | `num_heads`        |
//!   | 6     | `channels`         |
//!   | 7     | `padded_vocab_size`|
//!   | 8     | `num_kv_heads`     |
//!   | 9     | `ffn_hidden`       |
//!   | 10    | `rope_theta` (f32 bits) |
//!
//! * `safetensors`, one named tensor per parameter table entry, for exchange with other tools.

use crate::error::{LlamaError, Result};
use crate::model::{LlamaConfig, ParameterTensors};
use crate::tensor::Shape;
use memmap2::Mmap;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

pub const MAGIC: u32 = 20240803;
pub const VERSION: u32 = 5;
pub const HEADER_LEN: usize = 256;
const HEADER_BYTES: usize = HEADER_LEN * 4;

fn header_for(config: &LlamaConfig) -> Result<[u32; HEADER_LEN]> {
    let field = |name: &str, value: usize| {
        u32::try_from(value)
            .map_err(|_| LlamaError::Checkpoint(format!("{name} ({value}) does not fit the header")))
    };
    let mut header = [0u32; HEADER_LEN];
    header[0] = MAGIC;
    header[1] = VERSION;
    header[2] = field("max_seq_len", config.max_seq_len)?;
    header[3] = field("vocab_size", config.vocab_size)?;
    header[4] = field("num_layers", config.num_layers)?;
    header[5] = field("num_heads", config.num_heads)?;
    header[6] = field("channels", config.channels)?;
    header[7] = field("padded_vocab_size", config.padded_vocab_size)?;
    header[8] = field("num_kv_heads", config.num_kv_heads)?;
    header[9] = field("ffn_hidden", config.ffn_hidden)?;
    header[10] = config.rope_theta.to_bits();
    Ok(header)
}

fn config_from_header(header: &[u32]) -> Result<LlamaConfig> {
    if header[0] != MAGIC {
        return Err(LlamaError::Checkpoint(format!(
            "bad magic {} (expected {MAGIC})",
            header[0]
        )));
    }
    if header[1] != VERSION {
        return Err(LlamaError::Checkpoint(format!(
            "unsupported version {} (expected {VERSION})",
            header[1]
        )));
    }
    let config = LlamaConfig {
        max_seq_len: header[2] as usize,
        vocab_size: header[3] as usize,
        num_layers: header[4] as usize,
        num_heads: header[5] as usize,
        channels: header[6] as usize,
        padded_vocab_size: header[7] as usize,
        num_kv_heads: header[8] as usize,
        ffn_hidden: header[9] as usize,
        rope_theta: f32::from_bits(header[10]),
        ..LlamaConfig::default()
    };
    config
        .validate()
        .map_err(|e| LlamaError::Checkpoint(format!("invalid hyper-parameters: {e}")))?;
    Ok(config)
}

/// Reads a binary checkpoint through a memory map.
pub fn read_checkpoint(path: impl AsRef<Path>) -> Result<(LlamaConfig, Vec<f32>)> {
    let path = path.as_ref();
    let file = File::open(path)?;
    // SAFETY: the map is read-only and dropped before returning; the file is not modified while
    // it is mapped.
    let mmap = unsafe { Mmap::map(&file)? };
    if mmap.len() < HEADER_BYTES {
        return Err(LlamaError::Checkpoint(format!(
            "file is {} bytes, shorter than the {HEADER_BYTES}-byte header",
            mmap.len()
        )));
    }
    let (head, body) = mmap.split_at(HEADER_BYTES);
    let header: Vec<u32> = head
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let config = config_from_header(&header)?;

    let numel = ParameterTensors::for_config(&config)
        .checked_numel()
        .ok_or_else(|| LlamaError::Checkpoint("parameter count overflows".into()))?;
    let expected_bytes = numel
        .checked_mul(4)
        .ok_or_else(|| LlamaError::Checkpoint("parameter byte count overflows".into()))?;
    if body.len() != expected_bytes {
        return Err(LlamaError::Checkpoint(format!(
            "expected {expected_bytes} parameter bytes, found {}",
            body.len()
        )));
    }
    let params: Vec<f32> = body
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    info!(path = %path.display(), num_parameters = numel, "loaded checkpoint");
    Ok((config, params))
}

/// Writes a binary checkpoint.
pub fn write_checkpoint(path: impl AsRef<Path>, config: &LlamaConfig, params: &[f32]) -> Result<()> {
    let path = path.as_ref();
    let expected = ParameterTensors::for_config(config).numel();
    if params.len() != expected {
        return Err(LlamaError::Checkpoint(format!(
            "parameter buffer has {} elements, the config needs {expected}",
            params.len()
        )));
    }
    let header = header_for(config)?;
    let mut out = BufWriter::new(File::create(path)?);
    for word in header {
        out.write_all(&word.to_le_bytes())?;
    }
    for x in params {
        out.write_all(&x.to_le_bytes())?;
    }
    out.flush()?;
    info!(path = %path.display(), num_parameters = params.len(), "saved checkpoint");
    Ok(())
}

fn safetensors_err(e: safetensors::SafeTensorError) -> LlamaError {
    LlamaError::Checkpoint(format!("safetensors: {e}"))
}

/// Saves every parameter tensor under its table name.
pub fn export_safetensors(
    path: impl AsRef<Path>,
    shapes: &ParameterTensors<Shape>,
    params: &[f32],
) -> Result<()> {
    let tensors = shapes.split(params)?;
    let bytes: Vec<(&'static str, Vec<usize>, Vec<u8>)> = tensors
        .entries()
        .into_iter()
        .zip(shapes.entries())
        .map(|((name, data), (_, shape))| {
            let raw = data.iter().flat_map(|x| x.to_le_bytes()).collect();
            (name, shape.dims().to_vec(), raw)
        })
        .collect();

    let mut views = Vec::with_capacity(bytes.len());
    for (name, shape, raw) in &bytes {
        let view = TensorView::new(Dtype::F32, shape.clone(), raw).map_err(safetensors_err)?;
        views.push((*name, view));
    }
    safetensors::serialize_to_file(views, &None, path.as_ref()).map_err(safetensors_err)?;
    info!(path = %path.as_ref().display(), tensors = bytes.len(), "exported safetensors");
    Ok(())
}

/// Overwrites `params` with the tensors of a safetensors file.
///
/// Every table entry must be present as `F32` with the exact shape; extra tensors are ignored.
/// On error the buffer may be partially overwritten.
pub fn import_safetensors(
    path: impl AsRef<Path>,
    shapes: &ParameterTensors<Shape>,
    params: &mut [f32],
) -> Result<()> {
    let file = File::open(path.as_ref())?;
    // SAFETY: see `read_checkpoint`.
    let mmap = unsafe { Mmap::map(&file)? };
    let tensors = SafeTensors::deserialize(&mmap).map_err(safetensors_err)?;

    let mut result = Ok(());
    shapes.split_mut(params)?.map(|name, slice| {
        if result.is_ok() {
            result = copy_tensor(&tensors, name, shapes, slice);
        }
    });
    result?;
    info!(path = %path.as_ref().display(), "imported safetensors");
    Ok(())
}

fn copy_tensor(
    tensors: &SafeTensors<'_>,
    name: &str,
    shapes: &ParameterTensors<Shape>,
    dst: &mut [f32],
) -> Result<()> {
    let view = tensors
        .tensor(name)
        .map_err(|e| LlamaError::Checkpoint(format!("tensor `{name}`: {e}")))?;
    if view.dtype() != Dtype::F32 {
        return Err(LlamaError::Checkpoint(format!(
            "tensor `{name}` is {:?}, expected F32",
            view.dtype()
        )));
    }
    let expected = shapes
        .entries()
        .into_iter()
        .find(|(n, _)| *n == name)
        .map(|(_, s)| s.dims().to_vec())
        .unwrap_or_default();
    if view.shape() != expected.as_slice() {
        return Err(LlamaError::Shape {
            expected,
            got: view.shape().to_vec(),
        });
    }
    for (x, b) in dst.iter_mut().zip(view.data().chunks_exact(4)) {
        *x = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let cfg = LlamaConfig::gqa_768();
        let header = header_for(&cfg).unwrap();
        assert_eq!(header[0], MAGIC);
        assert_eq!(header[8], 6);
        assert_eq!(config_from_header(&header).unwrap(), cfg);
    }

    #[test]
    fn test_header_rejects_bad_magic_version_and_config() {
        let mut header = header_for(&LlamaConfig::tiny_test()).unwrap();
        header[0] = 1;
        assert!(matches!(config_from_header(&header), Err(LlamaError::Checkpoint(_))));

        let mut header = header_for(&LlamaConfig::tiny_test()).unwrap();
        header[1] = 3;
        assert!(matches!(config_from_header(&header), Err(LlamaError::Checkpoint(_))));

        let mut header = header_for(&LlamaConfig::tiny_test()).unwrap();
        header[8] = 3;
        assert!(matches!(config_from_header(&header), Err(LlamaError::Checkpoint(_))));
    }
}
