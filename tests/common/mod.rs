//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use burn::{
    backend::NdArray,
    tensor::{Tensor, TensorData, activation},
};
use prnn::{Device, DeviceConfig, RecurrentActivation, RecurrentDirection, RecurrentOpsHandle};
use rand::{Rng, SeedableRng, rngs::StdRng};

pub type RefBackend = NdArray<f32>;

/// A private device, so tests running in parallel never compete for units.
pub fn test_device(units: usize) -> Arc<Device> {
    Device::new(DeviceConfig {
        units,
        barrier_timeout_ms: 30_000,
        ..DeviceConfig::default()
    })
    .unwrap()
}

/// Problem dimensions and mode for one test.
#[derive(Debug, Clone, Copy)]
pub struct TestDims {
    pub layer: usize,
    pub batch: usize,
    pub timesteps: usize,
    pub direction: RecurrentDirection,
    pub activation: RecurrentActivation,
}

impl TestDims {
    pub fn new(layer: usize, batch: usize, timesteps: usize) -> Self {
        Self {
            layer,
            batch,
            timesteps,
            direction: RecurrentDirection::Forward,
            activation: RecurrentActivation::Tanh,
        }
    }

    #[must_use]
    pub fn direction(mut self, direction: RecurrentDirection) -> Self {
        self.direction = direction;
        self
    }

    #[must_use]
    pub fn activation(mut self, activation: RecurrentActivation) -> Self {
        self.activation = activation;
        self
    }

    pub fn act_shape(&self) -> [usize; 3] {
        [self.layer, self.batch, self.timesteps]
    }

    pub fn act_len(&self) -> usize {
        self.layer * self.batch * self.timesteps
    }

    pub fn handle(&self, device: Arc<Device>, persistent: bool) -> RecurrentOpsHandle {
        RecurrentOpsHandle::builder(self.layer, self.batch, self.timesteps)
            .activation(self.activation)
            .direction(self.direction)
            .persistent(persistent)
            .device(device)
            .build()
            .unwrap()
    }

    /// Timesteps in recurrence order.
    pub fn order(&self) -> Vec<usize> {
        match self.direction {
            RecurrentDirection::Forward => (0..self.timesteps).collect(),
            RecurrentDirection::Reverse => (0..self.timesteps).rev().collect(),
        }
    }
}

pub fn random_vec(seed: u64, len: usize, scale: f32) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random_range(-scale..scale)).collect()
}

/// Recurrent weights small enough that the recurrence stays well conditioned.
pub fn random_weights(seed: u64, layer: usize) -> Vec<f32> {
    random_vec(seed, layer * layer, 1.0 / (layer as f32).sqrt())
}

/// Element-wise `|a - b| <= atol + rtol * |b|`.
pub fn assert_data_close(a: &[f32], b: &[f32], rtol: f32, atol: f32, name: &str) {
    assert_eq!(
        a.len(),
        b.len(),
        "{name}: Data sizes don't match: {} vs {}",
        a.len(),
        b.len()
    );

    for (i, (&av, &bv)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (av - bv).abs();
        let tolerance = atol + rtol * bv.abs();
        assert!(
            diff <= tolerance,
            "{name}: Mismatch at index {i}: {av} vs {bv} (diff: {diff}, tolerance: {tolerance})",
        );
    }
}

fn device() -> <RefBackend as burn::tensor::backend::Backend>::Device {
    Default::default()
}

/// One timestep of a column-major `(layer, batch, time)` buffer as a
/// row-major `[batch, layer]` tensor. The slice is already in that order.
fn time_slice(dims: &TestDims, data: &[f32], t: usize) -> Tensor<RefBackend, 2> {
    let chunk = dims.layer * dims.batch;
    Tensor::from_data(
        TensorData::new(data[t * chunk..(t + 1) * chunk].to_vec(), [dims.batch, dims.layer]),
        &device(),
    )
}

fn store_slice(dims: &TestDims, data: &mut [f32], t: usize, tensor: Tensor<RefBackend, 2>) {
    let chunk = dims.layer * dims.batch;
    let values: Vec<f32> = tensor.into_data().to_vec().unwrap();
    data[t * chunk..(t + 1) * chunk].copy_from_slice(&values);
}

/// Column-major weights read row-major are `Wᵀ`.
fn weights_transposed(dims: &TestDims, weights: &[f32]) -> Tensor<RefBackend, 2> {
    Tensor::from_data(TensorData::new(weights.to_vec(), [dims.layer, dims.layer]), &device())
}

fn activate(kind: RecurrentActivation, x: Tensor<RefBackend, 2>) -> Tensor<RefBackend, 2> {
    match kind {
        RecurrentActivation::Identity => x,
        RecurrentActivation::RectifiedLinear => activation::relu(x),
        RecurrentActivation::Tanh => x.tanh(),
        RecurrentActivation::Sigmoid => activation::sigmoid(x),
    }
}

/// Dense reference of the forward recurrence. Returns `(activations, preact)`.
pub fn reference_forward(dims: &TestDims, inputs: &[f32], weights: &[f32]) -> (Vec<f32>, Vec<f32>) {
    let wt = weights_transposed(dims, weights);
    let order = dims.order();
    let mut act = inputs.to_vec();
    let mut preact = inputs.to_vec();

    for s in 1..dims.timesteps {
        let (prev, t) = (order[s - 1], order[s]);
        let z = time_slice(dims, &act, prev).matmul(wt.clone()) + time_slice(dims, inputs, t);
        store_slice(dims, &mut preact, t, z.clone());
        store_slice(dims, &mut act, t, activate(dims.activation, z));
    }
    (act, preact)
}

/// Dense reference of the delta recurrence.
pub fn reference_deltas(dims: &TestDims, incoming: &[f32], weights: &[f32], preact: &[f32]) -> Vec<f32> {
    let w = weights_transposed(dims, weights).transpose();
    let order = dims.order();
    let chunk = dims.layer * dims.batch;
    let mut deltas = incoming.to_vec();

    for s in (0..dims.timesteps).rev() {
        let t = order[s];
        let mut g = time_slice(dims, incoming, t);
        if s + 1 < dims.timesteps {
            g = g + time_slice(dims, &deltas, order[s + 1]).matmul(w.clone());
        }
        store_slice(dims, &mut deltas, t, g);
        if s > 0 {
            for i in t * chunk..(t + 1) * chunk {
                deltas[i] *= dims.activation.derivative(preact[i]);
            }
        }
    }
    deltas
}

/// Dense reference of the weight gradient, column-major like the weights.
pub fn reference_gradients(dims: &TestDims, activations: &[f32], deltas: &[f32]) -> Vec<f32> {
    let order = dims.order();
    let mut grad = Tensor::<RefBackend, 2>::zeros([dims.layer, dims.layer], &device());
    for s in 1..dims.timesteps {
        let d = time_slice(dims, deltas, order[s]);
        let x = time_slice(dims, activations, order[s - 1]);
        grad = grad + d.transpose().matmul(x);
    }

    // Row-major G[r][c] back to column-major.
    let g: Vec<f32> = grad.transpose().into_data().to_vec().unwrap();
    g
}
