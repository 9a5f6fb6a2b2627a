//! Cross-unit synchronization for persistent launches.
//!
//! ## Protocol
//!
//! - [`EpochBarrier`]: one monotonically increasing arrival counter shared by
//!   all units. A unit that finished epoch `e` increments it (release) and
//!   spins until it reads `participants * (e + 1)` (acquire). Every write made
//!   in epoch `e` is therefore visible to every unit before any of them starts
//!   epoch `e + 1`.
//! - [`CompletionSignal`]: the host-visible "all units are done" flag the
//!   launching thread blocks on. It also watches barrier progress so a hung
//!   grid fails instead of blocking forever.

use std::{
    hint,
    sync::{
        Condvar, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{error, warn};

use crate::error::{RecurrentError, Result};

const SLEEP_BACKOFF: Duration = Duration::from_micros(50);

/// How a waiting unit backs off, and for how long it may wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpinPolicy {
    pub spin_iterations: u32,
    pub yield_iterations: u32,
    pub timeout: Duration,
}

impl Default for SpinPolicy {
    fn default() -> Self {
        Self {
            spin_iterations: 1 << 10,
            yield_iterations: 64,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Why a unit left the barrier without completing the epoch.
#[derive(Debug)]
pub enum BarrierError {
    /// This unit waited longer than the policy allows.
    TimedOut(RecurrentError),
    /// Another participant gave up and poisoned the barrier.
    Poisoned,
}

/// Spin barrier over monotonically increasing epochs.
#[derive(Debug)]
pub struct EpochBarrier {
    arrivals: AtomicUsize,
    participants: usize,
    poisoned: AtomicBool,
    policy: SpinPolicy,
}

impl EpochBarrier {
    pub fn new(participants: usize, policy: SpinPolicy) -> Self {
        assert!(participants > 0, "barrier needs at least one participant");
        Self {
            arrivals: AtomicUsize::new(0),
            participants,
            poisoned: AtomicBool::new(false),
            policy,
        }
    }

    pub fn participants(&self) -> usize {
        self.participants
    }

    /// Total arrivals so far, across all epochs.
    pub fn arrivals(&self) -> usize {
        self.arrivals.load(Ordering::Acquire)
    }

    /// Epochs every participant has passed.
    pub fn completed_epochs(&self) -> usize {
        self.arrivals() / self.participants
    }

    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Arrive at the end of `epoch` and wait for every other participant.
    ///
    /// Each participant must arrive exactly once per epoch, in order.
    pub fn arrive_and_wait(&self, epoch: usize) -> Result<(), BarrierError> {
        let expected = self.participants * (epoch + 1);
        self.arrivals.fetch_add(1, Ordering::AcqRel);

        let mut polls = 0u64;
        let mut started: Option<Instant> = None;
        loop {
            let arrived = self.arrivals.load(Ordering::Acquire);
            if arrived >= expected {
                return Ok(());
            }
            if self.is_poisoned() {
                return Err(BarrierError::Poisoned);
            }

            polls += 1;
            if polls <= u64::from(self.policy.spin_iterations) {
                hint::spin_loop();
                continue;
            }

            let start = *started.get_or_insert_with(Instant::now);
            let waited = start.elapsed();
            if waited > self.policy.timeout {
                self.poison();
                warn!(epoch, arrived, expected, ?waited, "barrier wait timed out");
                return Err(BarrierError::TimedOut(RecurrentError::DeadlockTimeout {
                    epoch,
                    arrived,
                    expected,
                    waited,
                }));
            }

            if polls <= u64::from(self.policy.spin_iterations) + u64::from(self.policy.yield_iterations) {
                thread::yield_now();
            } else {
                thread::sleep(SLEEP_BACKOFF);
            }
        }
    }
}

#[derive(Debug)]
struct CompletionState {
    remaining: usize,
    aborted: usize,
    error: Option<RecurrentError>,
}

/// Host-visible completion of one launch.
#[derive(Debug)]
pub struct CompletionSignal {
    state: Mutex<CompletionState>,
    done: Condvar,
}

impl CompletionSignal {
    pub fn new(units: usize) -> Self {
        Self {
            state: Mutex::new(CompletionState {
                remaining: units,
                aborted: 0,
                error: None,
            }),
            done: Condvar::new(),
        }
    }

    /// A guard that reports an abort if dropped without [`UnitReport::finish`],
    /// e.g. while unwinding out of a panicking unit.
    pub fn report(&self) -> UnitReport<'_> {
        UnitReport {
            signal: self,
            reported: false,
        }
    }

    fn record(&self, outcome: Result<(), BarrierError>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Ok(()) => {}
            Err(BarrierError::TimedOut(e)) => {
                if state.error.is_none() {
                    state.error = Some(e);
                }
            }
            Err(BarrierError::Poisoned) => state.aborted += 1,
        }
        state.remaining -= 1;
        if state.remaining == 0 {
            self.done.notify_all();
        }
    }

    /// Block until every unit has reported.
    ///
    /// If the barrier makes no progress for `stall_timeout`, the barrier is
    /// poisoned so the remaining units drain, and the call fails.
    pub fn wait(&self, barrier: &EpochBarrier, stall_timeout: Duration) -> Result<()> {
        let poll = (stall_timeout / 8).max(Duration::from_millis(1));
        let mut last_arrivals = barrier.arrivals();
        let mut last_progress = Instant::now();

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while state.remaining > 0 {
            let (guard, _) = self
                .done
                .wait_timeout(state, poll)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;

            let arrivals = barrier.arrivals();
            if arrivals != last_arrivals {
                last_arrivals = arrivals;
                last_progress = Instant::now();
            } else if state.remaining > 0
                && !barrier.is_poisoned()
                && last_progress.elapsed() > stall_timeout
            {
                let participants = barrier.participants();
                error!(arrivals, participants, "persistent grid stalled, poisoning barrier");
                barrier.poison();
                if state.error.is_none() {
                    let epoch = arrivals / participants;
                    state.error = Some(RecurrentError::DeadlockTimeout {
                        epoch,
                        arrived: arrivals,
                        expected: participants * (epoch + 1),
                        waited: last_progress.elapsed(),
                    });
                }
            }
        }

        if let Some(e) = state.error.take() {
            return Err(e);
        }
        if state.aborted > 0 {
            // Poisoned without a recorded cause: a unit died before reporting.
            let arrivals = barrier.arrivals();
            let epoch = arrivals / barrier.participants();
            return Err(RecurrentError::DeadlockTimeout {
                epoch,
                arrived: arrivals,
                expected: barrier.participants() * (epoch + 1),
                waited: Duration::ZERO,
            });
        }
        Ok(())
    }
}

/// One unit's completion report.
pub struct UnitReport<'s> {
    signal: &'s CompletionSignal,
    reported: bool,
}

impl UnitReport<'_> {
    pub fn finish(mut self, outcome: Result<(), BarrierError>) {
        self.reported = true;
        self.signal.record(outcome);
    }
}

impl Drop for UnitReport<'_> {
    fn drop(&mut self) {
        if !self.reported {
            self.signal.record(Err(BarrierError::Poisoned));
        }
    }
}
