use gqa_train::checkpoint::{HEADER_LEN, MAGIC, read_checkpoint};
use gqa_train::{ExecutionContext, Llama, LlamaConfig, LlamaError};
use std::fs;
use tempfile::tempdir;

fn model(seed: u64) -> Llama {
    let config = LlamaConfig::tiny_test().with_rope_theta(500000.0);
    Llama::new_random(config, seed, ExecutionContext::global()).unwrap()
}

#[test]
fn test_binary_checkpoint_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("model.bin");
    let mut original = model(1);
    original.save_checkpoint(&path).unwrap();

    let bytes = fs::read(&path).unwrap();
    assert_eq!(bytes.len(), 4 * (HEADER_LEN + original.num_parameters()));
    assert_eq!(u32::from_le_bytes(bytes[..4].try_into().unwrap()), MAGIC);

    let mut loaded = Llama::from_checkpoint(&path, ExecutionContext::global()).unwrap();
    assert_eq!(loaded.config(), original.config());
    assert_eq!(loaded.params(), original.params());

    let inputs: Vec<u32> = (0..8).collect();
    let targets: Vec<u32> = (1..9).collect();
    assert_eq!(
        loaded.forward(&inputs, Some(&targets), 1, 8).unwrap(),
        original.forward(&inputs, Some(&targets), 1, 8).unwrap()
    );
}

#[test]
fn test_truncated_and_corrupt_checkpoints() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("model.bin");
    model(2).save_checkpoint(&path).unwrap();
    let bytes = fs::read(&path).unwrap();

    let truncated = dir.path().join("truncated.bin");
    fs::write(&truncated, &bytes[..bytes.len() - 4]).unwrap();
    assert!(matches!(
        read_checkpoint(&truncated),
        Err(LlamaError::Checkpoint(_))
    ));

    let short = dir.path().join("short.bin");
    fs::write(&short, &bytes[..100]).unwrap();
    assert!(matches!(read_checkpoint(&short), Err(LlamaError::Checkpoint(_))));

    let mut bad_magic = bytes.clone();
    bad_magic[0] ^= 0xff;
    let corrupt = dir.path().join("corrupt.bin");
    fs::write(&corrupt, &bad_magic).unwrap();
    assert!(matches!(
        Llama::from_checkpoint(&corrupt, ExecutionContext::global()),
        Err(LlamaError::Checkpoint(_))
    ));

    let mut bad_version = bytes;
    bad_version[4] = 4;
    fs::write(&corrupt, &bad_version).unwrap();
    assert!(matches!(read_checkpoint(&corrupt), Err(LlamaError::Checkpoint(_))));

    assert!(matches!(
        read_checkpoint(dir.path().join("missing.bin")),
        Err(LlamaError::Io(_))
    ));
}

#[test]
fn test_safetensors_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("model.safetensors");
    let source = model(3);
    source.export_safetensors(&path).unwrap();

    let mut target = model(4);
    assert_ne!(target.params(), source.params());
    target.import_safetensors(&path).unwrap();
    assert_eq!(target.params(), source.params());
}

#[test]
fn test_safetensors_shape_mismatch() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("wide.safetensors");
    let wide = Llama::new_random(
        LlamaConfig::tiny_test().with_ffn_hidden(256),
        5,
        ExecutionContext::global(),
    )
    .unwrap();
    wide.export_safetensors(&path).unwrap();

    let mut narrow = model(5);
    assert!(matches!(
        narrow.import_safetensors(&path),
        Err(LlamaError::Shape { .. })
    ));
}

fn header_only(words: &[(usize, u32)]) -> Vec<u8> {
    let mut header = [0u32; HEADER_LEN];
    header[0] = MAGIC;
    header[1] = 5;
    for &(i, w) in words {
        header[i] = w;
    }
    header.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[test]
fn test_oversized_header_is_rejected_without_reading_body() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("huge.bin");

    // Every product of these dimensions fits u32 fields, but the parameter count does not fit usize.
    let huge = header_only(&[
        (2, 16),
        (3, 1 << 31),
        (4, 1 << 10),
        (5, 2),
        (6, 1 << 31),
        (7, 1 << 31),
        (8, 2),
        (9, 128),
        (10, 10000.0f32.to_bits()),
    ]);
    fs::write(&path, &huge).unwrap();
    assert!(matches!(read_checkpoint(&path), Err(LlamaError::Checkpoint(_))));
    assert!(matches!(
        Llama::from_checkpoint(&path, ExecutionContext::global()),
        Err(LlamaError::Checkpoint(_))
    ));

    // A small model whose context length would need a gigantic RoPE table.
    let long = header_only(&[
        (2, u32::MAX),
        (3, 64),
        (4, 1),
        (5, 4),
        (6, 64),
        (7, 64),
        (8, 2),
        (9, 128),
        (10, 10000.0f32.to_bits()),
    ]);
    fs::write(&path, &long).unwrap();
    assert!(matches!(read_checkpoint(&path), Err(LlamaError::Checkpoint(_))));
}
