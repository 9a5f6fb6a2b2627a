//! Persistent kernel scheduler.
//!
//! A launch partitions the layer into row-stripe [`Tile`]s and runs a
//! [`StepKernel`] over them for every recurrence step.
//!
//! ## Persistent launch
//!
//! One scoped thread per tile lives for the whole call:
//!
//! 1. `load` the unit-resident state (the weight tile) once
//! 2. for each step: `step`, then arrive at the [`EpochBarrier`]
//! 3. `finish`, then report to the [`CompletionSignal`]
//!
//! The host thread only waits on the completion signal.
//!
//! ## Per-step launch
//!
//! Every step is an independent dispatch that reloads its tile, and the host
//! joins all units before issuing the next step. Results are identical to the
//! persistent launch; only the cost differs.

mod tile;

use std::{
    io,
    thread::{self, Scope, ScopedJoinHandle},
    time::Instant,
};

pub use tile::{Tile, TilePlan};
use tracing::{debug, error, trace};

use crate::{
    device::Device,
    error::{RecurrentError, Result},
    handle::RecurrentOpsHandle,
    sync::{CompletionSignal, EpochBarrier},
};

/// Work of one recurrent operation, split by tile and step.
///
/// Within a step a unit may only write state owned by its tile. State any
/// unit wrote in step `s` may be read by every unit from step `s + 1` on.
pub(crate) trait StepKernel: Sync {
    /// State a unit keeps for the duration of a launch (or of one dispatch
    /// without persistence).
    type Resident: Send;

    fn name(&self) -> &'static str;

    fn steps(&self) -> usize;

    fn load(&self, tile: &Tile) -> Self::Resident;

    fn step(&self, tile: &Tile, resident: &mut Self::Resident, step: usize);

    /// Runs once per tile after the last step.
    fn finish(&self, _tile: &Tile, _resident: &mut Self::Resident) {}
}

/// Run `kernel` to completion on the handle's device.
pub(crate) fn launch<K: StepKernel>(handle: &RecurrentOpsHandle, kernel: &K) -> Result<()> {
    let plan = TilePlan::new(handle.layer_size(), handle.units());
    let device = handle.device();
    let _lease = device.try_claim(plan.grid())?;

    debug!(
        kernel = kernel.name(),
        grid = plan.grid(),
        steps = kernel.steps(),
        persistent = handle.use_persistent(),
        "launching"
    );
    let start = Instant::now();

    let result = if handle.use_persistent() {
        run_persistent(device, &plan, kernel)
    } else {
        run_per_step(device, &plan, kernel)
    };

    match &result {
        Ok(()) => debug!(kernel = kernel.name(), elapsed = ?start.elapsed(), "launch complete"),
        Err(e) => error!(kernel = kernel.name(), "launch failed: {e}"),
    }
    result
}

fn spawn_unit<'scope, 'env, F>(
    scope: &'scope Scope<'scope, 'env>,
    unit: usize,
    f: F,
) -> io::Result<ScopedJoinHandle<'scope, ()>>
where
    F: FnOnce() + Send + 'scope,
{
    thread::Builder::new()
        .name(format!("prnn-unit-{unit}"))
        .spawn_scoped(scope, f)
}

/// Poisons the barrier if a unit unwinds, so its peers stop waiting for it.
struct PoisonOnPanic<'b>(&'b EpochBarrier);

impl Drop for PoisonOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.poison();
        }
    }
}

fn run_persistent<K: StepKernel>(device: &Device, plan: &TilePlan, kernel: &K) -> Result<()> {
    let policy = device.config().spin_policy();
    let barrier = EpochBarrier::new(plan.grid(), policy);
    let completion = CompletionSignal::new(plan.grid());
    let steps = kernel.steps();

    thread::scope(|s| {
        let mut spawned = 0;
        let mut spawn_error = None;

        for tile in plan.tiles() {
            let report = completion.report();
            if spawn_error.is_some() {
                // Counts as an abort; the grid is already being torn down.
                drop(report);
                continue;
            }

            let barrier = &barrier;
            let unit = spawn_unit(s, tile.unit, move || {
                let _guard = PoisonOnPanic(barrier);
                trace!("[UNIT {}] loading rows {:?}", tile.unit, tile.rows);
                let mut resident = kernel.load(tile);

                let mut outcome = Ok(());
                for step in 0..steps {
                    kernel.step(tile, &mut resident, step);
                    if let Err(e) = barrier.arrive_and_wait(step) {
                        outcome = Err(e);
                        break;
                    }
                }
                if outcome.is_ok() {
                    kernel.finish(tile, &mut resident);
                }
                trace!("[UNIT {}] done, ok={}", tile.unit, outcome.is_ok());
                report.finish(outcome);
            });

            match unit {
                Ok(_) => spawned += 1,
                Err(e) => {
                    error!(unit = tile.unit, "failed to spawn unit: {e}");
                    barrier.poison();
                    spawn_error = Some(e);
                }
            }
        }

        trace!("[HOST] {spawned} units running, waiting for completion");
        let waited = completion.wait(&barrier, policy.timeout * 2);

        match spawn_error {
            Some(_) => Err(RecurrentError::LaunchCapacity {
                requested: plan.grid(),
                available: spawned,
                total: device.units(),
            }),
            None => waited,
        }
    })
}

fn run_per_step<K: StepKernel>(device: &Device, plan: &TilePlan, kernel: &K) -> Result<()> {
    let steps = kernel.steps();

    for step in 0..steps {
        let last = step + 1 == steps;
        trace!("[HOST] dispatch {step}/{steps}");

        thread::scope(|s| {
            let mut spawned = 0;
            for tile in plan.tiles() {
                let unit = spawn_unit(s, tile.unit, move || {
                    let mut resident = kernel.load(tile);
                    kernel.step(tile, &mut resident, step);
                    if last {
                        kernel.finish(tile, &mut resident);
                    }
                });
                if let Err(e) = unit {
                    error!(unit = tile.unit, step, "failed to spawn unit: {e}");
                    return Err(RecurrentError::LaunchCapacity {
                        requested: plan.grid(),
                        available: spawned,
                        total: device.units(),
                    });
                }
                spawned += 1;
            }
            Ok(())
        })?;
    }
    Ok(())
}
