mod common;

use common::{
    TestDims, assert_data_close, random_vec, random_weights, reference_deltas, reference_forward,
    reference_gradients, test_device,
};
use half::f16;
use prnn::{
    Element, OperationKind, Precision, RecurrentActivation, RecurrentDirection, RecurrentError,
    RecurrentOpsHandle, Scratch, TensorView, TensorViewMut, back_prop_deltas_recurrent,
    back_prop_gradients_recurrent, forward_prop_recurrent, scratch_size_for,
};
use test_case::{test_case, test_matrix};

use RecurrentActivation::{Identity, RectifiedLinear, Sigmoid, Tanh};
use RecurrentDirection::{Forward, Reverse};

/// Outputs of one forward + deltas + gradients sequence.
struct Run<E> {
    activations: Vec<E>,
    deltas: Vec<E>,
    weights: Vec<E>,
}

fn run_all<E: Element>(
    handle: &RecurrentOpsHandle,
    inputs: &[E],
    weights: &[E],
    incoming: &[E],
) -> Run<E> {
    let shape = handle.activations_shape();
    let layer = handle.layer_size();
    let mut activations = inputs.to_vec();
    let mut deltas = incoming.to_vec();
    let mut updated = weights.to_vec();
    let mut scratch = Scratch::for_operation(handle, OperationKind::BackPropGradients);

    forward_prop_recurrent(
        TensorViewMut::new(&mut activations, &shape).unwrap(),
        TensorView::new(weights, &[layer, layer]).unwrap(),
        scratch.view(),
        handle,
    )
    .unwrap();
    back_prop_deltas_recurrent(
        TensorViewMut::new(&mut deltas, &shape).unwrap(),
        TensorView::new(weights, &[layer, layer]).unwrap(),
        TensorView::new(&activations, &shape).unwrap(),
        scratch.view(),
        handle,
    )
    .unwrap();
    back_prop_gradients_recurrent(
        TensorViewMut::new(&mut updated, &[layer, layer]).unwrap(),
        TensorView::new(&activations, &shape).unwrap(),
        TensorView::new(&deltas, &shape).unwrap(),
        scratch.view(),
        handle,
    )
    .unwrap();

    Run {
        activations,
        deltas,
        weights: updated,
    }
}

fn inputs_for(dims: &TestDims, seed: u64) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    (
        random_vec(seed, dims.act_len(), 1.0),
        random_weights(seed + 1, dims.layer),
        random_vec(seed + 2, dims.act_len(), 1.0),
    )
}

#[test_case(8, 2, 6, Forward, Tanh, 3 ; "tanh_forward")]
#[test_case(8, 2, 6, Reverse, Tanh, 3 ; "tanh_reverse")]
#[test_case(13, 3, 5, Forward, RectifiedLinear, 4 ; "relu_uneven_tiles")]
#[test_case(16, 1, 9, Reverse, Sigmoid, 4 ; "sigmoid_reverse")]
#[test_case(5, 4, 4, Forward, Identity, 8 ; "more_units_than_rows")]
fn matches_dense_reference(
    layer: usize,
    batch: usize,
    timesteps: usize,
    direction: RecurrentDirection,
    activation: RecurrentActivation,
    units: usize,
) {
    let dims = TestDims::new(layer, batch, timesteps)
        .direction(direction)
        .activation(activation);
    let handle = dims.handle(test_device(units), true);
    let (inputs, weights, incoming) = inputs_for(&dims, 7);

    let run = run_all(&handle, &inputs, &weights, &incoming);

    let (ref_act, ref_preact) = reference_forward(&dims, &inputs, &weights);
    assert_data_close(&run.activations, &ref_act, 1e-4, 1e-5, "activations");

    let ref_deltas = reference_deltas(&dims, &incoming, &weights, &ref_preact);
    assert_data_close(&run.deltas, &ref_deltas, 1e-3, 1e-4, "deltas");

    let grad = reference_gradients(&dims, &ref_act, &ref_deltas);
    let ref_weights: Vec<f32> = weights.iter().zip(&grad).map(|(w, g)| w + g).collect();
    assert_data_close(&run.weights, &ref_weights, 1e-3, 1e-4, "weights");
}

#[test_matrix(
    [Forward, Reverse],
    [Identity, RectifiedLinear, Tanh, Sigmoid]
)]
fn persistent_matches_per_step(direction: RecurrentDirection, activation: RecurrentActivation) {
    let dims = TestDims::new(11, 3, 7)
        .direction(direction)
        .activation(activation);
    let (inputs, weights, incoming) = inputs_for(&dims, 21);

    let persistent = run_all(&dims.handle(test_device(4), true), &inputs, &weights, &incoming);
    let per_step = run_all(&dims.handle(test_device(4), false), &inputs, &weights, &incoming);

    // Same tiles, same summation order: bit-identical.
    assert_eq!(persistent.activations, per_step.activations);
    assert_eq!(persistent.deltas, per_step.deltas);
    assert_eq!(persistent.weights, per_step.weights);
}

#[test]
fn unit_count_does_not_change_results() {
    let dims = TestDims::new(12, 2, 5);
    let (inputs, weights, incoming) = inputs_for(&dims, 5);

    let one = run_all(&dims.handle(test_device(1), true), &inputs, &weights, &incoming);
    let many = run_all(&dims.handle(test_device(5), true), &inputs, &weights, &incoming);

    assert_eq!(one.activations, many.activations);
    assert_eq!(one.deltas, many.deltas);
    assert_eq!(one.weights, many.weights);
}

#[test]
fn single_timestep_has_no_recurrence() {
    let dims = TestDims::new(6, 2, 1);
    let handle = dims.handle(test_device(3), true);
    let (inputs, weights, incoming) = inputs_for(&dims, 11);

    let run = run_all(&handle, &inputs, &weights, &incoming);

    assert_eq!(run.activations, inputs);
    assert_eq!(run.deltas, incoming);
    assert_eq!(run.weights, weights);
}

#[test_case(Forward ; "forward")]
#[test_case(Reverse ; "reverse")]
fn two_timesteps_are_one_dense_step(direction: RecurrentDirection) {
    let dims = TestDims::new(9, 3, 2)
        .direction(direction)
        .activation(RectifiedLinear);
    let handle = dims.handle(test_device(2), true);
    let (inputs, weights, incoming) = inputs_for(&dims, 13);

    let run = run_all(&handle, &inputs, &weights, &incoming);
    let (ref_act, _) = reference_forward(&dims, &inputs, &weights);

    let chunk = dims.layer * dims.batch;
    let (first, second) = match direction {
        Forward => (0, 1),
        Reverse => (1, 0),
    };
    // The initial state is untouched; the other timestep is f(W · h0 + x1).
    assert_eq!(run.activations[first * chunk..(first + 1) * chunk], inputs[first * chunk..(first + 1) * chunk]);
    assert_data_close(
        &run.activations[second * chunk..(second + 1) * chunk],
        &ref_act[second * chunk..(second + 1) * chunk],
        1e-5,
        1e-6,
        "second timestep",
    );
}

/// Loss `Σ c ⊙ h` over every timestep; `c` doubles as the incoming deltas.
fn loss(dims: &TestDims, inputs: &[f32], weights: &[f32], c: &[f32]) -> f64 {
    let handle = dims.handle(test_device(2), true);
    let mut act = inputs.to_vec();
    let mut scratch = Scratch::for_operation(&handle, OperationKind::ForwardProp);
    forward_prop_recurrent(
        TensorViewMut::new(&mut act, &dims.act_shape()).unwrap(),
        TensorView::new(weights, &[dims.layer, dims.layer]).unwrap(),
        scratch.view(),
        &handle,
    )
    .unwrap();
    act.iter().zip(c).map(|(h, c)| f64::from(h * c)).sum()
}

#[test]
fn gradients_match_finite_differences() {
    const EPS: f32 = 1e-2;

    let dims = TestDims::new(4, 2, 3).activation(Tanh);
    let (inputs, weights, c) = inputs_for(&dims, 17);
    let handle = dims.handle(test_device(2), true);
    let run = run_all(&handle, &inputs, &weights, &c);

    let analytic: Vec<f32> = run.weights.iter().zip(&weights).map(|(u, w)| u - w).collect();
    let mut numeric = vec![0.0f32; weights.len()];
    for (i, n) in numeric.iter_mut().enumerate() {
        let mut plus = weights.clone();
        plus[i] += EPS;
        let mut minus = weights.clone();
        minus[i] -= EPS;
        let diff = loss(&dims, &inputs, &plus, &c) - loss(&dims, &inputs, &minus, &c);
        *n = (diff / (2.0 * f64::from(EPS))) as f32;
    }
    assert_data_close(&analytic, &numeric, 1e-2, 2e-3, "dL/dW");

    // At the first timestep the deltas are the gradient w.r.t. the initial state.
    let chunk = dims.layer * dims.batch;
    let mut numeric = vec![0.0f32; chunk];
    for (i, n) in numeric.iter_mut().enumerate() {
        let mut plus = inputs.clone();
        plus[i] += EPS;
        let mut minus = inputs.clone();
        minus[i] -= EPS;
        let diff = loss(&dims, &plus, &weights, &c) - loss(&dims, &minus, &weights, &c);
        *n = (diff / (2.0 * f64::from(EPS))) as f32;
    }
    assert_data_close(&run.deltas[..chunk], &numeric, 1e-2, 2e-3, "dL/dh0");
}

#[test]
fn half_precision_tracks_single() {
    let dims = TestDims::new(10, 2, 5);
    let (inputs, weights, incoming) = inputs_for(&dims, 29);
    let to_half = |v: &[f32]| v.iter().copied().map(f16::from_f32).collect::<Vec<_>>();

    let single = run_all(&dims.handle(test_device(3), true), &inputs, &weights, &incoming);

    let half_handle = |persistent| {
        RecurrentOpsHandle::builder(dims.layer, dims.batch, dims.timesteps)
            .activation(dims.activation)
            .precision(Precision::Half)
            .persistent(persistent)
            .device(test_device(3))
            .build()
            .unwrap()
    };
    let (h_in, h_w, h_inc) = (to_half(&inputs), to_half(&weights), to_half(&incoming));
    let half = run_all(&half_handle(true), &h_in, &h_w, &h_inc);
    let half_per_step = run_all(&half_handle(false), &h_in, &h_w, &h_inc);

    assert_eq!(half.activations, half_per_step.activations);
    assert_eq!(half.weights, half_per_step.weights);

    let widen = |v: &[f16]| v.iter().map(|x| x.to_f32()).collect::<Vec<_>>();
    let tol = Precision::Half.tolerance();
    assert_data_close(&widen(&half.activations), &single.activations, 2e-2, tol, "activations");
    assert_data_close(&widen(&half.deltas), &single.deltas, 5e-2, 5.0 * tol, "deltas");
}

#[test]
fn padded_views_match_contiguous() {
    let dims = TestDims::new(6, 2, 4).activation(Sigmoid);
    let handle = dims.handle(test_device(2), true);
    let (inputs, weights, _) = inputs_for(&dims, 31);

    let (expected, _) = reference_forward(&dims, &inputs, &weights);

    // Leading dimension padded from 6 to 8 in both tensors.
    let (lp, b, t) = (8, dims.batch, dims.timesteps);
    let mut padded = vec![f32::NAN; lp * b * t];
    for ti in 0..t {
        for bi in 0..b {
            for l in 0..dims.layer {
                padded[l + lp * (bi + b * ti)] = inputs[l + dims.layer * (bi + b * ti)];
            }
        }
    }
    let mut padded_weights = vec![f32::NAN; lp * dims.layer];
    for c in 0..dims.layer {
        for r in 0..dims.layer {
            padded_weights[r + lp * c] = weights[r + dims.layer * c];
        }
    }

    let mut scratch = Scratch::for_operation(&handle, OperationKind::ForwardProp);
    forward_prop_recurrent(
        TensorViewMut::with_strides(&mut padded, &dims.act_shape(), &[1, lp, lp * b]).unwrap(),
        TensorView::with_strides(&padded_weights, &[dims.layer, dims.layer], &[1, lp]).unwrap(),
        scratch.view(),
        &handle,
    )
    .unwrap();

    let mut compact = vec![0.0; dims.act_len()];
    for ti in 0..t {
        for bi in 0..b {
            for l in 0..dims.layer {
                compact[l + dims.layer * (bi + b * ti)] = padded[l + lp * (bi + b * ti)];
            }
        }
    }
    assert_data_close(&compact, &expected, 1e-4, 1e-5, "padded activations");
    // Padding is never touched.
    assert!(padded[dims.layer].is_nan());
}

mod errors {
    use super::*;

    fn setup(layer: usize) -> (TestDims, RecurrentOpsHandle, Vec<f32>, Vec<f32>) {
        let dims = TestDims::new(layer, 2, 3);
        let handle = dims.handle(test_device(2), true);
        let (inputs, weights, _) = inputs_for(&dims, 3);
        (dims, handle, inputs, weights)
    }

    #[test]
    fn wrong_weight_shape_is_rejected() {
        let (dims, handle, mut act, _) = setup(4);
        let weights = vec![0.0f32; 5 * 4];
        let mut scratch = Scratch::for_operation(&handle, OperationKind::ForwardProp);

        let result = forward_prop_recurrent(
            TensorViewMut::new(&mut act, &dims.act_shape()).unwrap(),
            TensorView::new(&weights, &[5, 4]).unwrap(),
            scratch.view(),
            &handle,
        );
        match result {
            Err(RecurrentError::ShapeMismatch { name, expected, found }) => {
                assert_eq!(name, "weights");
                assert_eq!(expected, vec![4, 4]);
                assert_eq!(found, vec![5, 4]);
            }
            other => panic!("expected shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn undersized_scratch_is_rejected() {
        let (dims, handle, mut act, weights) = setup(4);
        let required = scratch_size_for(&handle, OperationKind::ForwardProp, Precision::Single);
        let mut scratch = Scratch::zeroed(required - 1);

        let result = forward_prop_recurrent(
            TensorViewMut::new(&mut act, &dims.act_shape()).unwrap(),
            TensorView::new(&weights, &[4, 4]).unwrap(),
            scratch.view(),
            &handle,
        );
        assert!(matches!(
            result,
            Err(RecurrentError::ScratchTooSmall { required: r, .. }) if r == required
        ));
    }

    #[test]
    fn deltas_need_a_forward_pass() {
        let (dims, handle, act, weights) = setup(4);
        let mut deltas = act.clone();
        let mut scratch = Scratch::for_operation(&handle, OperationKind::BackPropDeltas);

        let result = back_prop_deltas_recurrent(
            TensorViewMut::new(&mut deltas, &dims.act_shape()).unwrap(),
            TensorView::new(&weights, &[4, 4]).unwrap(),
            TensorView::new(&act, &dims.act_shape()).unwrap(),
            scratch.view(),
            &handle,
        );
        assert!(matches!(result, Err(RecurrentError::StaleScratch(_))));
    }

    #[test]
    fn scratch_from_another_problem_is_stale() {
        // Forward on a smaller problem into a buffer big enough for both.
        let (small_dims, small, mut small_act, small_weights) = setup(3);
        let (dims, handle, act, weights) = setup(4);
        let mut scratch = Scratch::for_operation(&handle, OperationKind::BackPropGradients);

        forward_prop_recurrent(
            TensorViewMut::new(&mut small_act, &small_dims.act_shape()).unwrap(),
            TensorView::new(&small_weights, &[3, 3]).unwrap(),
            scratch.view(),
            &small,
        )
        .unwrap();

        let mut deltas = act.clone();
        let result = back_prop_deltas_recurrent(
            TensorViewMut::new(&mut deltas, &dims.act_shape()).unwrap(),
            TensorView::new(&weights, &[4, 4]).unwrap(),
            TensorView::new(&act, &dims.act_shape()).unwrap(),
            scratch.view(),
            &handle,
        );
        assert!(matches!(result, Err(RecurrentError::StaleScratch(_))));
        assert_eq!(deltas, act, "deltas must be untouched on failure");
    }

    #[test]
    fn different_activation_is_stale() {
        let (dims, handle, mut act, weights) = setup(4);
        let relu = dims
            .activation(RectifiedLinear)
            .handle(test_device(2), true);
        let mut scratch = Scratch::for_operation(&handle, OperationKind::ForwardProp);

        forward_prop_recurrent(
            TensorViewMut::new(&mut act, &dims.act_shape()).unwrap(),
            TensorView::new(&weights, &[4, 4]).unwrap(),
            scratch.view(),
            &handle,
        )
        .unwrap();

        let mut deltas = act.clone();
        let result = back_prop_deltas_recurrent(
            TensorViewMut::new(&mut deltas, &dims.act_shape()).unwrap(),
            TensorView::new(&weights, &[4, 4]).unwrap(),
            TensorView::new(&act, &dims.act_shape()).unwrap(),
            scratch.view(),
            &relu,
        );
        assert!(matches!(result, Err(RecurrentError::StaleScratch(_))));
    }

    #[test]
    fn precision_must_match_handle() {
        let dims = TestDims::new(4, 1, 2);
        let handle = RecurrentOpsHandle::builder(4, 1, 2)
            .precision(Precision::Half)
            .device(test_device(2))
            .build()
            .unwrap();
        let mut act = vec![0.0f32; dims.act_len()];
        let weights = vec![0.0f32; 16];
        let mut scratch = Scratch::zeroed(1 << 12);

        let result = forward_prop_recurrent(
            TensorViewMut::new(&mut act, &dims.act_shape()).unwrap(),
            TensorView::new(&weights, &[4, 4]).unwrap(),
            scratch.view(),
            &handle,
        );
        assert!(matches!(
            result,
            Err(RecurrentError::PrecisionMismatch {
                expected: Precision::Half,
                found: Precision::Single,
                ..
            })
        ));
    }

    #[test]
    fn failed_forward_leaves_scratch_stale() {
        let (dims, handle, mut act, weights) = setup(4);
        let mut scratch = Scratch::for_operation(&handle, OperationKind::ForwardProp);

        forward_prop_recurrent(
            TensorViewMut::new(&mut act, &dims.act_shape()).unwrap(),
            TensorView::new(&weights, &[4, 4]).unwrap(),
            scratch.view(),
            &handle,
        )
        .unwrap();

        // Hold every unit so the next forward call fails at launch.
        let lease = handle.device().try_claim(2).unwrap();
        let result = forward_prop_recurrent(
            TensorViewMut::new(&mut act, &dims.act_shape()).unwrap(),
            TensorView::new(&weights, &[4, 4]).unwrap(),
            scratch.view(),
            &handle,
        );
        assert!(matches!(result, Err(RecurrentError::LaunchCapacity { .. })));
        drop(lease);

        let mut deltas = act.clone();
        let result = back_prop_deltas_recurrent(
            TensorViewMut::new(&mut deltas, &dims.act_shape()).unwrap(),
            TensorView::new(&weights, &[4, 4]).unwrap(),
            TensorView::new(&act, &dims.act_shape()).unwrap(),
            scratch.view(),
            &handle,
        );
        assert!(matches!(result, Err(RecurrentError::StaleScratch(_))));
    }
}
