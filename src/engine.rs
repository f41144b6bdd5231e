//! The narrow interface the core consumes to drive a concrete inference
//! engine. Batching policy, KV-cache/block management, sampling, and
//! tokenization all live behind this trait; the core never sees them.

use async_trait::async_trait;

use crate::error::CoreError;
use crate::ids::{RequestId, VirtualEngine};
use crate::request::RequestSpec;

/// Per-sequence-group scheduling metadata produced by one `schedule` call.
/// The core only needs to know which requests a batch touches and whether
/// any of them are in their final decoding step; everything else is
/// opaque to it.
pub trait SeqGroupMetadata: Send + Sync + Clone + 'static {
    fn request_id(&self) -> RequestId;

    /// Remaining multi-step decode iterations this group is committed to
    /// before the scheduler is consulted again. `1` outside multi-step
    /// decoding. Every group in a metadata list must report the same
    /// value; disagreement is a fatal `InvariantViolation`.
    fn remaining_steps(&self) -> usize {
        1
    }

    /// Marks one multi-step decode iteration as complete for this group.
    /// Called once per step while a multi-step batch is in flight.
    /// No-op outside multi-step decoding.
    fn finish_step(&mut self) {}
}

/// Output of one `schedule` call. The core forwards this unopened to
/// `execute_model_async` and `process_model_outputs`.
pub trait SchedulerOutputs: Send + Sync + Clone + 'static {
    /// Number of remaining decode steps this scheduling decision commits
    /// the batch to running before the scheduler must be consulted again.
    /// `1` for engines that schedule every step.
    fn remaining_steps(&self) -> usize;

    /// Whether this call produced no work at all (nothing scheduled).
    fn is_empty(&self) -> bool;

    /// Lookahead slots requested by this scheduling decision, forwarded
    /// to `execute_model_async` unopened.
    fn num_lookahead_slots(&self) -> usize {
        0
    }

    /// Size of the engine's running queue at scheduling time, forwarded
    /// to `execute_model_async` unopened.
    fn running_queue_size(&self) -> usize {
        0
    }
}

/// Raw output of one model execution. Opaque to the core; forwarded to
/// `process_model_outputs` for translation into per-request `Output`s.
/// `Clone` is required so the core can retain the last sampled-token
/// output across steps for pipeline-parallel multi-step forwarding
/// without holding the whole output vector alive.
pub trait SamplerOutput: Send + Sync + Clone + 'static {
    /// Whether this output's sampled token ids are already resident on
    /// the CPU, and therefore eligible to be forwarded in-place to a
    /// non-last pipeline stage on the next step without a device round
    /// trip. The engine promises that a cache-eligible output never has
    /// both this and [`has_device_sampled_token_ids`] true at once.
    fn has_cpu_sampled_token_ids(&self) -> bool {
        false
    }

    /// Whether this output's sampled token ids are still device-resident
    /// (not yet copied back to the host). Such outputs are never
    /// forwarded across pipeline stages by the core.
    fn has_device_sampled_token_ids(&self) -> bool {
        false
    }
}

/// A finished or partial result the core delivers to a request's stream.
pub trait EngineOutput: Send + Sync + 'static {
    fn request_id(&self) -> RequestId;
    fn is_finished(&self) -> bool;
}

/// Bundles the scheduling decision and cached metadata passed to one
/// model execution call, mirroring the original's `ExecuteModelRequest`.
/// `scheduler_outputs` rides along unopened so the engine can pull its
/// own swap-in/out/copy block lists back out of the opaque value it
/// handed the core at `schedule` time; the core never inspects it.
pub struct ExecuteModelRequest<M, S, SO> {
    pub seq_group_metadata: Vec<M>,
    pub scheduler_outputs: S,
    pub virtual_engine: VirtualEngine,
    pub num_lookahead_slots: usize,
    pub running_queue_size: usize,
    /// Ids the engine reported finished since the last step, drained via
    /// `get_and_reset_finished_requests_ids` immediately before this call.
    pub finished_requests_ids: Vec<RequestId>,
    /// The last sampled-token output from the previous step, forwarded
    /// in-place to non-last pipeline-parallel stages during multi-step
    /// decoding. Only ever populated when the engine promised CPU-resident
    /// tokens for the cached output (see [`SamplerOutput::has_cpu_sampled_token_ids`]).
    pub last_sampled_token_ids: Option<std::sync::Arc<SO>>,
}

#[async_trait]
pub trait Engine: Send + Sync + 'static {
    type Inputs: Send + Sync + 'static;
    type Params: Send + Sync + 'static;
    type AdapterRef: Send + Sync + Clone + 'static;
    type SeqGroupMetadata: SeqGroupMetadata;
    type SchedulerOutputs: SchedulerOutputs;
    type SamplerOutput: SamplerOutput;
    type Output: EngineOutput;

    /// Hand a new request to the engine's internal scheduler queue.
    async fn add_request(
        &self,
        spec: RequestSpec<Self::Inputs, Self::Params, Self::AdapterRef>,
    ) -> Result<(), CoreError>;

    /// Remove one or more requests from the engine, wherever they currently
    /// sit in its internal queues. Best-effort: ids the engine has never
    /// seen, or has already finished, are silently ignored.
    fn abort_request(&self, ids: &[RequestId]);

    /// Ask the engine's scheduler for the next batch on virtual engine `v`.
    async fn schedule(
        &self,
        v: VirtualEngine,
    ) -> Result<(Vec<Self::SeqGroupMetadata>, Self::SchedulerOutputs), CoreError>;

    /// Run one model forward pass over a scheduled batch.
    async fn execute_model_async(
        &self,
        req: ExecuteModelRequest<Self::SeqGroupMetadata, Self::SchedulerOutputs, Self::SamplerOutput>,
    ) -> Result<Vec<Self::SamplerOutput>, CoreError>;

    /// Translate raw model output into per-request results, updating the
    /// engine's own bookkeeping (sequence state, finish detection) along
    /// the way.
    async fn process_model_outputs(
        &self,
        outputs: &[Self::SamplerOutput],
        scheduler_outputs: &Self::SchedulerOutputs,
        metadata: &[Self::SeqGroupMetadata],
    ) -> Result<Vec<Self::Output>, CoreError>;

    /// Whether virtual engine `v` still has any requests to make progress on.
    async fn has_unfinished_requests_for_virtual_engine(&self, v: VirtualEngine) -> bool;

    /// Best-effort request to stop any out-of-process worker loop the
    /// engine may be running, issued on shutdown.
    async fn stop_worker_execution_loop_async(&self);

    /// Drain and return the ids the engine has finished since the last call.
    fn get_and_reset_finished_requests_ids(&self, v: VirtualEngine) -> Vec<RequestId>;

    /// Probe whether the engine itself is still healthy.
    async fn check_health(&self) -> Result<(), CoreError>;

    /// Best-effort telemetry hook. Infallible and synchronous by
    /// construction so a telemetry failure can never abort a step.
    fn record_stats(
        &self,
        scheduler_outputs: &Self::SchedulerOutputs,
        model_outputs: &[Self::SamplerOutput],
    );

    /// Whether this engine is configured to accept requests that
    /// reference an adapter (e.g. LoRA). `submit` rejects adapter-bearing
    /// requests with `CoreError::AdapterDisabled` when this is `false`.
    fn adapter_support_enabled(&self) -> bool {
        true
    }
}
