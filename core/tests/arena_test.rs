use gqa_train::kernels::permute_qkv;
use gqa_train::model::{ArenaError, ScratchArena, Slot, SlotSizes};
use gqa_train::{ExecutionContext, Llama, LlamaConfig, View, ViewMut};

fn train_step(model: &mut Llama, b: usize, t: usize) {
    let inputs: Vec<u32> = (0..(b * t) as u32).map(|i| (i * 13 + 5) % 64).collect();
    let targets: Vec<u32> = (0..(b * t) as u32).map(|i| (i * 17 + 2) % 64).collect();
    model.forward(&inputs, Some(&targets), b, t).unwrap();
    model.zero_grad();
    model.backward().unwrap();
}

#[test]
fn test_poisoned_arena_leaves_gradients_finite() {
    // Every scratch lease starts as NaN; a stage reading stale content would poison the result.
    let mut model =
        Llama::new_random(LlamaConfig::tiny_test(), 11, ExecutionContext::global()).unwrap();
    model.set_arena_poisoning(true);
    for _ in 0..2 {
        train_step(&mut model, 2, 8);
        let grads = model.grads().unwrap();
        assert!(grads.iter().all(|g| g.is_finite()));
        assert!(grads.iter().any(|&g| g != 0.0));
        assert!(model.mean_loss().unwrap().is_finite());
    }
}

#[test]
fn test_poisoning_does_not_change_results() {
    let config = LlamaConfig::tiny_test();
    let mut poisoned = Llama::new_random(config.clone(), 12, ExecutionContext::global()).unwrap();
    poisoned.set_arena_poisoning(true);
    let mut clean = Llama::new_random(config, 12, ExecutionContext::global()).unwrap();
    clean.set_arena_poisoning(false);

    train_step(&mut poisoned, 1, 16);
    train_step(&mut clean, 1, 16);
    assert_eq!(poisoned.mean_loss(), clean.mean_loss());
    assert_eq!(poisoned.grads(), clean.grads());
}

#[test]
fn test_scratch_memory_is_independent_of_depth() {
    let mut sizes = Vec::new();
    for layers in [1, 2, 6] {
        let config = LlamaConfig::tiny_test().with_num_layers(layers);
        let mut model = Llama::new_random(config, 13, ExecutionContext::global()).unwrap();
        train_step(&mut model, 2, 8);
        let arena = model.arena();
        assert!(Slot::ALL.iter().all(|&slot| arena.is_allocated(slot)));
        assert!(Slot::ALL.iter().all(|&slot| arena.holder(slot).is_none()));
        sizes.push(arena.allocated_elements());
    }
    assert!(sizes.windows(2).all(|w| w[0] == w[1]), "{sizes:?}");
}

#[test]
fn test_backward_slots_are_reserved_lazily() {
    let mut model =
        Llama::new_random(LlamaConfig::tiny_test(), 14, ExecutionContext::global()).unwrap();
    let inputs = vec![1u32; 8];
    model.forward(&inputs, None, 1, 8).unwrap();
    assert!(model.arena().is_allocated(Slot::Output));
    assert!(!model.arena().is_allocated(Slot::DAtt));
    assert!(model.grads().is_none());
}

#[test]
fn test_lease_conflict_names_both_stages() {
    let cfg = LlamaConfig::tiny_test();
    let mut arena = ScratchArena::new();
    arena.allocate(&SlotSizes::new(&cfg, 1, 4), &Slot::ALL);

    let held = arena.lease(Slot::Bt4c, "swiglu backward").unwrap();
    let err = arena.lease(Slot::Bt4c, "attention backward").unwrap_err();
    assert_eq!(
        err.to_string(),
        "slot Bt4c is held by `swiglu backward`, requested by `attention backward`"
    );
    assert!(matches!(err, ArenaError::SlotInUse { .. }));
    arena.restore(held).unwrap();
}

/// Splits the fused rows left in `Output` by whichever stage now holds it.
fn permute_from(
    arena: &mut ScratchArena,
    cfg: &LlamaConfig,
    stage: &'static str,
    retained: bool,
) -> Vec<f32> {
    let (b, t) = (1, 4);
    let (nh, kvh, hs) = (cfg.num_heads, cfg.num_kv_heads, cfg.head_size());
    let qkv = cfg.qkv_channels();
    let lease = if retained {
        arena.lease_retained(Slot::Output, stage).unwrap()
    } else {
        arena.lease(Slot::Output, stage).unwrap()
    };
    let mut q = vec![0.0f32; b * nh * t * hs];
    let mut k = vec![0.0f32; b * kvh * t * hs];
    let mut v = vec![0.0f32; b * kvh * t * hs];
    permute_qkv(
        View::new(&lease[..b * t * qkv], [b, t, qkv]).unwrap(),
        ViewMut::new(&mut q, [b, nh, t, hs]).unwrap(),
        ViewMut::new(&mut k, [b, kvh, t, hs]).unwrap(),
        ViewMut::new(&mut v, [b, kvh, t, hs]).unwrap(),
    );
    arena.restore(lease).unwrap();
    q
}

#[test]
fn test_stage_reading_an_earlier_stages_scratch_sees_nan() {
    let cfg = LlamaConfig::tiny_test();
    let mut arena = ScratchArena::new().with_poisoning(true);
    arena.allocate(&SlotSizes::new(&cfg, 1, 4), &Slot::ALL);

    let mut fused = arena.lease(Slot::Output, "qkv projection").unwrap();
    fused.fill(0.5);
    arena.restore(fused).unwrap();

    // A stage that reads the projection after the slot changed hands gets NaN.
    let q = permute_from(&mut arena, &cfg, "attention scores", false);
    assert!(q.iter().all(|x| x.is_nan()));

    let mut fused = arena.lease(Slot::Output, "qkv projection").unwrap();
    fused.fill(0.5);
    arena.restore(fused).unwrap();
    let q = permute_from(&mut arena, &cfg, "kv heads", true);
    assert!(q.iter().all(|&x| x == 0.5));
}
