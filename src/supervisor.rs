//! Public entry point: owns the request tracker and the background engine
//! loop, and exposes `submit`/`abort`/lifecycle queries to callers.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::Engine;
use crate::engine_loop::{self, EngineLoopConfig, LoopExit};
use crate::error::CoreError;
use crate::ids::RequestId;
use crate::request::RequestSpec;
use crate::scheduler::StepScheduler;
use crate::stream::StreamReader;
use crate::tracker::RequestTracker;

/// Configuration for a `Supervisor`.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub loop_config: EngineLoopConfig,
    /// Whether `submit` should start the background loop on first call if
    /// it has not been started yet. If `false`, `submit` before `start`
    /// fails with `CoreError::EngineDead`.
    pub auto_start: bool,
}

impl SupervisorConfig {
    pub fn from_env(virtual_engine_count: usize) -> Self {
        Self {
            loop_config: EngineLoopConfig::from_env(virtual_engine_count),
            auto_start: true,
        }
    }
}

struct LoopHandle {
    task: JoinHandle<LoopExit>,
    shutdown: CancellationToken,
}

/// Multiplexes many concurrent request streams onto one batched engine.
pub struct Supervisor<E: Engine, I, P, A> {
    engine: Arc<E>,
    tracker: Arc<RequestTracker<I, P, A, E::Output>>,
    scheduler: Arc<StepScheduler<E>>,
    config: SupervisorConfig,
    errored: Mutex<Option<CoreError>>,
    running: Mutex<Option<LoopHandle>>,
}

impl<E, I, P, A> Supervisor<E, I, P, A>
where
    E: Engine,
    I: Send + Sync + 'static,
    P: Send + Sync + 'static,
    A: Send + Sync + 'static,
{
    pub fn new(engine: Arc<E>, config: SupervisorConfig) -> Self {
        let scheduler = Arc::new(StepScheduler::new(
            engine.clone(),
            config.loop_config.virtual_engine_count,
        ));
        Self {
            engine,
            tracker: Arc::new(RequestTracker::new()),
            scheduler,
            config,
            errored: Mutex::new(None),
            running: Mutex::new(None),
        }
    }

    /// Starts the background engine loop. Idempotent: does nothing if
    /// already running.
    pub fn start(self: &Arc<Self>) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }
        info!("starting engine loop");
        let shutdown = CancellationToken::new();
        let this = self.clone();
        let task_shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            let exit = engine_loop::run(
                this.scheduler.clone(),
                this.tracker.clone(),
                this.config.loop_config.clone(),
                task_shutdown,
            )
            .await;
            if let LoopExit::Fatal(ref err) = exit {
                *this.errored.lock() = Some(err.clone());
            }
            exit
        });
        *running = Some(LoopHandle { task, shutdown });
    }

    /// Requests the background loop stop and waits for it to exit.
    pub async fn shutdown(&self) {
        let handle = self.running.lock().take();
        if let Some(handle) = handle {
            handle.shutdown.cancel();
            let _ = handle.task.await;
        }
        self.engine.stop_worker_execution_loop_async().await;
    }

    /// Submits a new request, starting the background loop first if
    /// `auto_start` is enabled and it has not started yet.
    pub fn submit(
        self: &Arc<Self>,
        spec: RequestSpec<I, P, A>,
    ) -> Result<StreamReader<E::Output>, CoreError> {
        if spec.adapter.is_some() && !self.engine.adapter_support_enabled() {
            return Err(CoreError::AdapterDisabled);
        }
        if !self.is_running() {
            if self.config.auto_start && !self.is_stopped() {
                self.start();
            } else {
                return Err(CoreError::EngineDead);
            }
        }
        self.tracker.add_request(spec)
    }

    /// Marks a request for cancellation.
    pub fn abort(&self, request_id: &RequestId) {
        self.tracker.abort_request(request_id);
    }

    /// Whether the background loop is currently running.
    pub fn is_running(&self) -> bool {
        match self.running.lock().as_ref() {
            Some(handle) => !handle.task.is_finished(),
            None => false,
        }
    }

    /// Whether the background loop ran and has since stopped (as opposed
    /// to never having been started).
    pub fn is_stopped(&self) -> bool {
        match self.running.lock().as_ref() {
            Some(handle) => handle.task.is_finished(),
            None => false,
        }
    }

    /// The latched fatal error, if the loop has stopped due to one.
    pub fn errored(&self) -> Option<CoreError> {
        self.errored.lock().clone()
    }

    /// Checks engine health. Fails fast with `EngineDead` if the
    /// background loop has already stopped, without delegating to the
    /// engine's own probe.
    pub async fn check_health(&self) -> Result<(), CoreError> {
        if self.is_stopped() {
            return Err(CoreError::EngineDead);
        }
        self.engine.check_health().await
    }
}
