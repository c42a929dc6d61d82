use gqa_train::{ExecutionContext, Llama, LlamaConfig};

fn tokens(n: usize, vocab: u32, salt: u32) -> Vec<u32> {
    (0..n as u32).map(|i| (i * 31 + salt) % vocab).collect()
}

fn step(model: &mut Llama, b: usize, t: usize) -> (f32, Vec<f32>) {
    let inputs = tokens(b * t, 64, 3);
    let targets = tokens(b * t, 64, 11);
    let loss = model
        .forward(&inputs, Some(&targets), b, t)
        .unwrap()
        .unwrap();
    model.zero_grad();
    model.backward().unwrap();
    (loss, model.grads().unwrap().to_vec())
}

#[test]
fn test_repeated_forward_is_bit_identical() {
    let mut model =
        Llama::new_random(LlamaConfig::tiny_test(), 21, ExecutionContext::global()).unwrap();
    let inputs = tokens(16, 64, 0);
    let targets = tokens(16, 64, 1);

    let first = model.forward(&inputs, Some(&targets), 2, 8).unwrap();
    let first_losses = model.losses().unwrap().to_vec();
    let first_logits = model.logits(1, 3).unwrap().to_vec();

    let second = model.forward(&inputs, Some(&targets), 2, 8).unwrap();
    assert_eq!(first, second);
    assert_eq!(model.losses().unwrap(), first_losses.as_slice());
    assert_eq!(model.logits(1, 3).unwrap(), first_logits.as_slice());
}

#[test]
fn test_results_do_not_depend_on_thread_count() {
    let config = LlamaConfig::tiny_test();
    let mut single =
        Llama::new_random(config.clone(), 4, ExecutionContext::new(1).unwrap()).unwrap();
    let mut pooled = Llama::new_random(config, 4, ExecutionContext::new(4).unwrap()).unwrap();
    assert_eq!(single.params(), pooled.params());

    let (loss_a, grads_a) = step(&mut single, 2, 16);
    let (loss_b, grads_b) = step(&mut pooled, 2, 16);
    assert_eq!(loss_a, loss_b);
    assert_eq!(grads_a, grads_b);
}

#[test]
fn test_backward_twice_accumulates_without_zero_grad() {
    let mut model =
        Llama::new_random(LlamaConfig::tiny_test(), 8, ExecutionContext::global()).unwrap();
    let (_, once) = step(&mut model, 1, 8);

    let inputs = tokens(8, 64, 3);
    let targets = tokens(8, 64, 11);
    model.forward(&inputs, Some(&targets), 1, 8).unwrap();
    model.backward().unwrap();
    let twice = model.grads().unwrap();
    for (a, b) in once.iter().zip(twice) {
        assert!((2.0 * a - b).abs() <= 1e-6 + 1e-5 * b.abs(), "{a} vs {b}");
    }
}

#[test]
fn test_same_seed_same_parameters() {
    let a = Llama::new_random(LlamaConfig::tiny_test(), 77, ExecutionContext::global()).unwrap();
    let b = Llama::new_random(LlamaConfig::tiny_test(), 77, ExecutionContext::global()).unwrap();
    let c = Llama::new_random(LlamaConfig::tiny_test(), 78, ExecutionContext::global()).unwrap();
    assert_eq!(a.params(), b.params());
    assert_ne!(a.params(), c.params());
}
