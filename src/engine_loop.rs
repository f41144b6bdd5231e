//! Drives the per-virtual-engine step tasks: dispatches one step per
//! virtual engine, reschedules engines that still have work, waits for
//! new requests when an engine goes idle, and enforces the per-iteration
//! watchdog.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::engine::Engine;
use crate::error::CoreError;
use crate::ids::VirtualEngine;
use crate::scheduler::StepScheduler;
use crate::tracker::RequestTracker;

/// Configuration for one running engine loop.
#[derive(Debug, Clone)]
pub struct EngineLoopConfig {
    /// Hard ceiling on how long a single "wait for any virtual engine's
    /// step to complete" round may take before the loop is declared dead.
    pub iteration_timeout: Duration,
    pub virtual_engine_count: usize,
}

impl EngineLoopConfig {
    /// Reads `ENGINE_ITERATION_TIMEOUT_S`, defaulting to 60 seconds.
    pub fn from_env(virtual_engine_count: usize) -> Self {
        let iteration_timeout = std::env::var("ENGINE_ITERATION_TIMEOUT_S")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(60));
        Self {
            iteration_timeout,
            virtual_engine_count,
        }
    }
}

/// Why the loop stopped.
pub enum LoopExit {
    /// `shutdown()` was requested.
    Shutdown,
    /// A fatal error was latched; it has already been fanned out to every
    /// live stream by the time this is returned.
    Fatal(CoreError),
}

/// Runs the engine loop to completion. Returns once shutdown is requested
/// or a fatal error occurs; the caller (the supervisor) is responsible for
/// latching the returned error onto its errored flag.
#[instrument(skip_all)]
pub async fn run<E, I, P, A>(
    scheduler: Arc<StepScheduler<E>>,
    tracker: Arc<RequestTracker<I, P, A, E::Output>>,
    config: EngineLoopConfig,
    shutdown: CancellationToken,
) -> LoopExit
where
    E: Engine,
    I: Send + 'static,
    P: Send + 'static,
    A: Send + 'static,
{
    let mut in_flight: JoinSet<(VirtualEngine, Result<crate::scheduler::StepResult, CoreError>)> =
        JoinSet::new();
    let mut idle: HashSet<VirtualEngine> = HashSet::new();

    for i in 0..config.virtual_engine_count {
        spawn_step(&mut in_flight, scheduler.clone(), tracker.clone(), VirtualEngine::new(i));
    }

    loop {
        if in_flight.is_empty() {
            debug!("all virtual engines idle, quiescing remote workers");
            scheduler.quiesce().await;
            tokio::select! {
                _ = shutdown.cancelled() => return LoopExit::Shutdown,
                _ = tracker.wait_for_new_requests() => {}
            }
            for v in idle.drain() {
                spawn_step(&mut in_flight, scheduler.clone(), tracker.clone(), v);
            }
            continue;
        }

        let next = tokio::select! {
            _ = shutdown.cancelled() => return LoopExit::Shutdown,
            res = tokio::time::timeout(config.iteration_timeout, in_flight.join_next()) => res,
        };

        let joined = match next {
            Ok(Some(joined)) => joined,
            Ok(None) => continue,
            Err(_elapsed) => {
                let err = CoreError::IterationTimeout(config.iteration_timeout);
                error!("engine iteration exceeded watchdog timeout");
                tracker.propagate_fatal_error(err.clone());
                return LoopExit::Fatal(err);
            }
        };

        let (v, result) = match joined {
            Ok(pair) => pair,
            Err(join_err) => {
                let err = CoreError::StepFailure(format!("step task panicked: {join_err}"));
                tracker.propagate_fatal_error(err.clone());
                return LoopExit::Fatal(err);
            }
        };

        match result {
            Ok(step_result) => {
                // Respawn if the step itself signaled work, or if the
                // engine reports unfinished work for this virtual engine
                // that the step didn't surface as output this round (an
                // empty scheduler batch, or a mid-multi-step call with
                // outputs deferred until the batch completes).
                if step_result.in_progress || scheduler.has_unfinished_requests(v).await {
                    spawn_step(&mut in_flight, scheduler.clone(), tracker.clone(), v);
                } else {
                    idle.insert(v);
                }
            }
            Err(err) if err.is_fatal() => {
                warn!(%err, "fatal error from step, stopping engine loop");
                tracker.propagate_fatal_error(err.clone());
                return LoopExit::Fatal(err);
            }
            Err(_non_fatal) => {
                // Per-request errors are routed to their own stream inside
                // `step`; reaching here means the step itself otherwise
                // completed. Reschedule so the virtual engine keeps moving.
                spawn_step(&mut in_flight, scheduler.clone(), tracker.clone(), v);
            }
        }

        // Fairness: give other tasks on the runtime a chance to run before
        // immediately looping back into another watchdog-guarded wait.
        for _ in 0..config.virtual_engine_count {
            tokio::task::yield_now().await;
        }
    }
}

fn spawn_step<E, I, P, A>(
    in_flight: &mut JoinSet<(VirtualEngine, Result<crate::scheduler::StepResult, CoreError>)>,
    scheduler: Arc<StepScheduler<E>>,
    tracker: Arc<RequestTracker<I, P, A, E::Output>>,
    v: VirtualEngine,
) where
    E: Engine,
    I: Send + 'static,
    P: Send + 'static,
    A: Send + 'static,
{
    in_flight.spawn(async move {
        let result = scheduler.step(v, &tracker).await;
        (v, result)
    });
}
