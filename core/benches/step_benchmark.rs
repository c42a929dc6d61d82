use criterion::{Criterion, criterion_group, criterion_main};
use gqa_train::{AdamW, ExecutionContext, Llama, LlamaConfig};
use std::hint::black_box;

fn small_config() -> LlamaConfig {
    LlamaConfig::tiny_test()
        .with_channels(256)
        .with_heads(8, 4)
        .with_ffn_hidden(4 * 256)
        .with_num_layers(4)
        .with_vocab_size(1024)
        .with_padded_vocab_size(1024)
        .with_max_seq_len(128)
}

fn benchmark_step(c: &mut Criterion) {
    let (b, t) = (4, 64);
    let config = small_config();
    let vocab = config.vocab_size as u32;
    let tokens: Vec<u32> = (0..(b * t + 1) as u32).map(|i| (i * 131 + 7) % vocab).collect();
    let (inputs, targets) = (&tokens[..b * t], &tokens[1..]);

    let mut model = Llama::new_random(config, 42, ExecutionContext::global()).unwrap();
    let optimizer = AdamW::new(1e-4);
    let mut group = c.benchmark_group("train_step");
    group.sample_size(20);

    group.bench_function("forward", |bench| {
        bench.iter(|| {
            model
                .forward(black_box(inputs), Some(black_box(targets)), b, t)
                .unwrap()
        })
    });

    group.bench_function("forward_backward", |bench| {
        bench.iter(|| {
            model.forward(inputs, Some(targets), b, t).unwrap();
            model.zero_grad();
            model.backward().unwrap();
        })
    });

    let mut step = 0;
    group.bench_function("full_step", |bench| {
        bench.iter(|| {
            step += 1;
            model.forward(inputs, Some(targets), b, t).unwrap();
            model.zero_grad();
            model.backward().unwrap();
            model.update(&optimizer, step).unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, benchmark_step);
criterion_main!(benches);
