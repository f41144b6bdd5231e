//! A scriptable `Engine` implementation for exercising the core without a
//! real batched inference backend. Mirrors the shape of a scriptable test
//! double: callers queue up scripted outputs per request, then inspect
//! `call_count()`/`get_calls()` afterward.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::engine::{
    Engine, EngineOutput, ExecuteModelRequest, SamplerOutput, SchedulerOutputs,
    SeqGroupMetadata as _,
};
use crate::error::CoreError;
use crate::ids::{RequestId, VirtualEngine};
use crate::request::RequestSpec;

#[derive(Debug, Clone)]
pub struct MockSeqGroupMetadata {
    pub request_id: RequestId,
    pub remaining_steps: usize,
    finished_steps: usize,
}

impl crate::engine::SeqGroupMetadata for MockSeqGroupMetadata {
    fn request_id(&self) -> RequestId {
        self.request_id.clone()
    }

    fn remaining_steps(&self) -> usize {
        self.remaining_steps
    }

    fn finish_step(&mut self) {
        self.finished_steps += 1;
    }
}

#[derive(Debug, Clone)]
pub struct MockSchedulerOutputs {
    pub scheduled: Vec<RequestId>,
    pub remaining_steps: usize,
}

impl SchedulerOutputs for MockSchedulerOutputs {
    fn remaining_steps(&self) -> usize {
        if self.scheduled.is_empty() {
            0
        } else {
            self.remaining_steps.max(1)
        }
    }

    fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    fn running_queue_size(&self) -> usize {
        self.scheduled.len()
    }
}

#[derive(Debug, Clone)]
pub struct MockSamplerOutput {
    pub cpu_resident: bool,
}

impl Default for MockSamplerOutput {
    fn default() -> Self {
        Self { cpu_resident: true }
    }
}

impl SamplerOutput for MockSamplerOutput {
    fn has_cpu_sampled_token_ids(&self) -> bool {
        self.cpu_resident
    }

    fn has_device_sampled_token_ids(&self) -> bool {
        !self.cpu_resident
    }
}

#[derive(Debug, Clone)]
pub struct MockOutput {
    pub request_id: RequestId,
    pub text: String,
    pub finished: bool,
}

impl EngineOutput for MockOutput {
    fn request_id(&self) -> RequestId {
        self.request_id.clone()
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

/// A one-shot gate a test can hold onto and later trigger to make a
/// scripted item eligible for scheduling.
pub struct Gate {
    ready: AtomicBool,
    notify: Notify,
}

impl Gate {
    fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn trigger(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// One scripted step: when this request is scheduled, it yields `text`
/// and is marked finished if `finished` is set. An optional `gate` must be
/// triggered before the item is eligible for scheduling, modeling a
/// request whose next token is not ready yet.
struct ScriptedItem {
    request_id: RequestId,
    text: String,
    finished: bool,
    gate: Option<Arc<Gate>>,
}

#[derive(Debug, Clone)]
pub struct MockCall {
    pub virtual_engine: usize,
    pub kind: &'static str,
}

/// Per-request scripted step queue, keyed by request id (unique across
/// the whole mock instance, not just within one virtual engine).
struct State {
    accepted: HashMap<RequestId, RequestSpec<String, (), ()>>,
    aborted: Vec<RequestId>,
    scripts: HashMap<RequestId, (usize, VecDeque<ScriptedItem>)>,
    finished_ids: HashMap<usize, Vec<RequestId>>,
    health_error: Option<CoreError>,
    reject_ids: HashSet<RequestId>,
    fail_execute_with: Option<CoreError>,
    execute_delay: Option<Duration>,
    adapters_enabled: bool,
}

/// A scriptable in-memory `Engine`.
pub struct MockEngine {
    state: Mutex<State>,
    calls: Mutex<Vec<MockCall>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                accepted: HashMap::new(),
                aborted: Vec::new(),
                scripts: HashMap::new(),
                finished_ids: HashMap::new(),
                health_error: None,
                reject_ids: HashSet::new(),
                fail_execute_with: None,
                execute_delay: None,
                adapters_enabled: true,
            }),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queues one scripted output for `request_id` on virtual engine `v`.
    /// Subsequent calls for the same request append further steps (e.g.
    /// several non-final tokens followed by a finished one).
    pub fn add_response(&self, v: usize, request_id: RequestId, text: impl Into<String>, finished: bool) {
        self.state
            .lock()
            .scripts
            .entry(request_id.clone())
            .or_insert_with(|| (v, VecDeque::new()))
            .1
            .push_back(ScriptedItem {
                request_id,
                text: text.into(),
                finished,
                gate: None,
            });
    }

    /// Like `add_response`, but the item is only eligible for scheduling
    /// after `trigger()` is called on the returned handle. Useful for
    /// deterministically controlling interleaving in tests.
    pub fn add_response_with_trigger(
        &self,
        v: usize,
        request_id: RequestId,
        text: impl Into<String>,
        finished: bool,
    ) -> Arc<Gate> {
        let gate = Arc::new(Gate::new());
        self.state
            .lock()
            .scripts
            .entry(request_id.clone())
            .or_insert_with(|| (v, VecDeque::new()))
            .1
            .push_back(ScriptedItem {
                request_id,
                text: text.into(),
                finished,
                gate: Some(gate.clone()),
            });
        gate
    }

    pub fn set_health_error(&self, err: Option<CoreError>) {
        self.state.lock().health_error = err;
    }

    /// Models a deployment not configured for adapters (e.g. LoRA):
    /// subsequent `submit`s carrying an adapter fail synchronously with
    /// `CoreError::AdapterDisabled`.
    pub fn disable_adapters(&self) {
        self.state.lock().adapters_enabled = false;
    }

    /// Causes the next `add_request` for `request_id` to be rejected with
    /// `RequestValidation`, modeling a spec the engine refuses to accept.
    pub fn reject_request(&self, request_id: RequestId) {
        self.state.lock().reject_ids.insert(request_id);
    }

    /// Causes every subsequent `execute_model_async` call to fail with
    /// `err`, modeling a fatal, whole-engine failure.
    pub fn fail_execute_with(&self, err: CoreError) {
        self.state.lock().fail_execute_with = Some(err);
    }

    /// Causes every subsequent `execute_model_async` call to sleep for
    /// `delay` before returning, modeling a stuck or overloaded backend.
    pub fn set_execute_delay(&self, delay: Duration) {
        self.state.lock().execute_delay = Some(delay);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn accepted_request_ids(&self) -> Vec<RequestId> {
        self.state.lock().accepted.keys().cloned().collect()
    }

    pub fn aborted_request_ids(&self) -> Vec<RequestId> {
        self.state.lock().aborted.clone()
    }

    fn record(&self, v: usize, kind: &'static str) {
        self.calls.lock().push(MockCall {
            virtual_engine: v,
            kind,
        });
    }
}

#[async_trait]
impl Engine for MockEngine {
    type Inputs = String;
    type Params = ();
    type AdapterRef = ();
    type SeqGroupMetadata = MockSeqGroupMetadata;
    type SchedulerOutputs = MockSchedulerOutputs;
    type SamplerOutput = MockSamplerOutput;
    type Output = MockOutput;

    async fn add_request(
        &self,
        spec: RequestSpec<Self::Inputs, Self::Params, Self::AdapterRef>,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock();
        if state.reject_ids.remove(&spec.request_id) {
            return Err(CoreError::RequestValidation("bad".into()));
        }
        if state.accepted.contains_key(&spec.request_id) {
            return Err(CoreError::DuplicateRequest(spec.request_id));
        }
        state.accepted.insert(spec.request_id.clone(), spec);
        Ok(())
    }

    fn abort_request(&self, ids: &[RequestId]) {
        let mut state = self.state.lock();
        for id in ids {
            state.accepted.remove(id);
            state.aborted.push(id.clone());
        }
    }

    async fn schedule(
        &self,
        v: VirtualEngine,
    ) -> Result<(Vec<Self::SeqGroupMetadata>, Self::SchedulerOutputs), CoreError> {
        self.record(v.index(), "schedule");
        let state = self.state.lock();
        // Only the front of each per-request script is eligible: this is
        // a FIFO of steps, and a gated step blocks everything queued
        // behind it for that request.
        let ready: Vec<RequestId> = state
            .scripts
            .values()
            .filter(|(owner, _)| *owner == v.index())
            .filter_map(|(_, queue)| queue.front())
            .filter(|item| item.gate.as_ref().map(|g| g.is_ready()).unwrap_or(true))
            .map(|item| item.request_id.clone())
            .collect();
        drop(state);

        let remaining_steps = if ready.is_empty() { 0 } else { 1 };
        let metadata: Vec<_> = ready
            .iter()
            .cloned()
            .map(|request_id| MockSeqGroupMetadata {
                request_id,
                remaining_steps,
                finished_steps: 0,
            })
            .collect();
        let outputs = MockSchedulerOutputs {
            scheduled: ready,
            remaining_steps,
        };
        Ok((metadata, outputs))
    }

    async fn execute_model_async(
        &self,
        req: ExecuteModelRequest<Self::SeqGroupMetadata, Self::SchedulerOutputs, Self::SamplerOutput>,
    ) -> Result<Vec<Self::SamplerOutput>, CoreError> {
        self.record(req.virtual_engine.index(), "execute_model_async");
        let (fail_with, delay) = {
            let state = self.state.lock();
            (state.fail_execute_with.clone(), state.execute_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = fail_with {
            return Err(err);
        }
        Ok(req
            .seq_group_metadata
            .iter()
            .map(|_| MockSamplerOutput::default())
            .collect())
    }

    async fn process_model_outputs(
        &self,
        _outputs: &[Self::SamplerOutput],
        scheduler_outputs: &Self::SchedulerOutputs,
        metadata: &[Self::SeqGroupMetadata],
    ) -> Result<Vec<Self::Output>, CoreError> {
        let mut state = self.state.lock();
        let mut results = Vec::new();
        for m in metadata {
            let Some((owner, queue)) = state.scripts.get_mut(&m.request_id()) else {
                continue;
            };
            let owner = *owner;
            let Some(item) = queue.pop_front() else {
                continue;
            };
            if item.finished {
                state.accepted.remove(&item.request_id);
                state
                    .finished_ids
                    .entry(owner)
                    .or_default()
                    .push(item.request_id.clone());
            }
            results.push(MockOutput {
                request_id: item.request_id,
                text: item.text,
                finished: item.finished,
            });
        }
        let _ = scheduler_outputs;
        Ok(results)
    }

    async fn has_unfinished_requests_for_virtual_engine(&self, v: VirtualEngine) -> bool {
        let state = self.state.lock();
        state
            .scripts
            .values()
            .any(|(owner, queue)| *owner == v.index() && !queue.is_empty())
    }

    async fn stop_worker_execution_loop_async(&self) {
        self.record(0, "stop_worker_execution_loop_async");
    }

    fn get_and_reset_finished_requests_ids(&self, v: VirtualEngine) -> Vec<RequestId> {
        self.state
            .lock()
            .finished_ids
            .remove(&v.index())
            .unwrap_or_default()
    }

    async fn check_health(&self) -> Result<(), CoreError> {
        match &self.state.lock().health_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn record_stats(&self, _scheduler_outputs: &Self::SchedulerOutputs, _model_outputs: &[Self::SamplerOutput]) {
        self.record(0, "record_stats");
    }

    fn adapter_support_enabled(&self) -> bool {
        self.state.lock().adapters_enabled
    }
}
