//! Persistent recurrent kernel benchmark.
//!
//! Usage:
//!   prnn-bench --layer-size 256 --mini-batch-size 2 --timesteps 64
//!   prnn-bench --no-persistent --precision half --json
//!   RUST_LOG=prnn=debug prnn-bench --iterations 5

use std::time::Instant;

use clap::Parser;
use half::{bf16, f16};
use prnn::{
    Element, OperationKind, Precision, RecurrentActivation, RecurrentDirection, RecurrentOpsHandle,
    Result, Scratch, TensorView, TensorViewMut, back_prop_deltas_recurrent,
    back_prop_gradients_recurrent, forward_prop_recurrent, maximum_layer_size,
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "prnn-bench", about = "Persistent recurrent kernel benchmark")]
struct Args {
    #[arg(long, default_value = "20")]
    iterations: usize,

    /// Defaults to the largest layer that fits persistently
    #[arg(long)]
    layer_size: Option<usize>,

    #[arg(long, default_value = "2")]
    mini_batch_size: usize,

    #[arg(long, default_value = "64")]
    timesteps: usize,

    /// Issue one dispatch per timestep instead of a persistent launch
    #[arg(long, default_value = "false")]
    no_persistent: bool,

    #[arg(long, value_enum, default_value_t = Precision::Single)]
    precision: Precision,

    #[arg(long, value_enum, default_value_t = RecurrentActivation::RectifiedLinear)]
    activation: RecurrentActivation,

    #[arg(long, value_enum, default_value_t = RecurrentDirection::Forward)]
    direction: RecurrentDirection,

    #[arg(long, default_value = "false")]
    json: bool,
}

#[derive(Serialize)]
struct OpResult {
    operation: &'static str,
    micros_per_call: f64,
    tflops: f64,
}

#[derive(Serialize)]
struct BenchResult {
    layer_size: usize,
    mini_batch_size: usize,
    timesteps: usize,
    persistent: bool,
    precision: Precision,
    activation: RecurrentActivation,
    direction: RecurrentDirection,
    units: usize,
    iterations: usize,
    results: Vec<OpResult>,
}

fn random_buffer<E: Element>(rng: &mut StdRng, len: usize, scale: f32) -> Vec<E> {
    (0..len)
        .map(|_| E::from_acc(rng.random_range(-scale..scale)))
        .collect()
}

/// Average seconds per call of `f` after one warm-up call.
fn time_op(iterations: usize, mut f: impl FnMut() -> Result<()>) -> Result<f64> {
    let iterations = iterations.max(1);
    f()?;
    let start = Instant::now();
    for _ in 0..iterations {
        f()?;
    }
    Ok(start.elapsed().as_secs_f64() / iterations as f64)
}

fn bench<E: Element>(args: &Args, handle: &RecurrentOpsHandle) -> Result<Vec<OpResult>> {
    let layer = handle.layer_size();
    let act_shape = handle.activations_shape();
    let act_len = act_shape.iter().product();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    // Keep the recurrence contractive so repeated calls stay finite.
    let weight_scale = 1.0 / (layer as f32).sqrt();
    let inputs: Vec<E> = random_buffer(&mut rng, act_len, 1.0);
    let mut weights: Vec<E> = random_buffer(&mut rng, layer * layer, weight_scale);
    let incoming: Vec<E> = random_buffer(&mut rng, act_len, 1.0);
    let mut activations = inputs.clone();
    let mut deltas = incoming.clone();

    let mut scratch = Scratch::for_operation(handle, OperationKind::BackPropGradients);
    let flops = handle.flop_count();

    let forward = time_op(args.iterations, || {
        activations.copy_from_slice(&inputs);
        forward_prop_recurrent(
            TensorViewMut::new(&mut activations, &act_shape)?,
            TensorView::new(&weights, &[layer, layer])?,
            scratch.view(),
            handle,
        )
    })?;

    let deltas_time = time_op(args.iterations, || {
        deltas.copy_from_slice(&incoming);
        back_prop_deltas_recurrent(
            TensorViewMut::new(&mut deltas, &act_shape)?,
            TensorView::new(&weights, &[layer, layer])?,
            TensorView::new(&activations, &act_shape)?,
            scratch.view(),
            handle,
        )
    })?;

    let gradients = time_op(args.iterations, || {
        back_prop_gradients_recurrent(
            TensorViewMut::new(&mut weights, &[layer, layer])?,
            TensorView::new(&activations, &act_shape)?,
            TensorView::new(&deltas, &act_shape)?,
            scratch.view(),
            handle,
        )
    })?;

    Ok([
        ("forward_prop", forward),
        ("back_prop_deltas", deltas_time),
        ("back_prop_gradients", gradients),
    ]
    .into_iter()
    .map(|(operation, seconds)| OpResult {
        operation,
        micros_per_call: seconds * 1e6,
        tflops: flops / seconds / 1e12,
    })
    .collect())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let layer_size = args
        .layer_size
        .unwrap_or_else(|| maximum_layer_size(args.precision));

    let handle = RecurrentOpsHandle::builder(layer_size, args.mini_batch_size, args.timesteps)
        .activation(args.activation)
        .direction(args.direction)
        .persistent(!args.no_persistent)
        .precision(args.precision)
        .build()?;
    info!(
        layer_size,
        units = handle.units(),
        persistent = handle.use_persistent(),
        "benchmarking"
    );

    let results = match args.precision {
        Precision::Single => bench::<f32>(&args, &handle)?,
        Precision::Half => bench::<f16>(&args, &handle)?,
        Precision::BFloat16 => bench::<bf16>(&args, &handle)?,
    };

    let result = BenchResult {
        layer_size,
        mini_batch_size: args.mini_batch_size,
        timesteps: args.timesteps,
        persistent: handle.use_persistent(),
        precision: args.precision,
        activation: args.activation,
        direction: args.direction,
        units: handle.units(),
        iterations: args.iterations,
        results,
    };

    if args.json {
        println!("{}", serde_json::to_string(&result).unwrap_or_default());
    } else {
        println!(
            "layer={} batch={} timesteps={} persistent={} precision={} units={}",
            result.layer_size,
            result.mini_batch_size,
            result.timesteps,
            result.persistent,
            result.precision,
            result.units
        );
        for op in &result.results {
            println!(
                "  {:<20} {:>10.1} us/call {:>8.4} TFLOP/s",
                op.operation, op.micros_per_call, op.tflops
            );
        }
    }
    Ok(())
}
