//! One step of work for a single virtual engine: drain tracker deltas,
//! consult the engine's scheduler (or reuse a cached multi-step decision),
//! execute the model, and route results back to request streams.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{instrument, trace};

use crate::engine::{Engine, ExecuteModelRequest, SamplerOutput, SchedulerOutputs, SeqGroupMetadata};
use crate::error::CoreError;
use crate::ids::VirtualEngine;
use crate::tracker::RequestTracker;

/// A scheduling decision retained across steps while a multi-step
/// decode commits the batch to running without re-consulting the
/// scheduler. Cleared once `remaining_steps` reaches zero.
struct CachedStep<M, S, SO> {
    seq_group_metadata: Vec<M>,
    scheduler_outputs: S,
    remaining_steps: usize,
    /// The previous step's final sampled-token output, forwarded to the
    /// next step for in-place pipeline-parallel token passing.
    last_output: Option<Arc<SO>>,
}

/// Per-virtual-engine cache, one slot per `v`.
pub struct SchedulerOutputCache<M, S, SO> {
    slots: Mutex<Vec<Option<CachedStep<M, S, SO>>>>,
}

impl<M, S, SO> SchedulerOutputCache<M, S, SO> {
    pub fn new(virtual_engine_count: usize) -> Self {
        Self {
            slots: Mutex::new((0..virtual_engine_count).map(|_| None).collect()),
        }
    }
}

/// Outcome of one `StepScheduler::step` call. Outputs themselves are
/// routed directly into request streams by this call.
pub struct StepResult {
    pub outputs_produced: usize,
    /// Whether any output materialized by this call was not yet finished.
    /// `false` whenever this call produced no outputs at all — including
    /// an empty scheduler batch or a mid-multi-step call with outputs
    /// deferred. Callers must still consult
    /// `Engine::has_unfinished_requests_for_virtual_engine` before treating
    /// a virtual engine as idle, since this alone does not capture work the
    /// engine is still carrying internally (spec.md §4.4 step 3).
    pub in_progress: bool,
}

pub struct StepScheduler<E: Engine> {
    engine: Arc<E>,
    cache: SchedulerOutputCache<E::SeqGroupMetadata, E::SchedulerOutputs, E::SamplerOutput>,
    /// `P`, the pipeline-parallel stage count. Sampled-token forwarding
    /// across steps only applies when this is greater than one.
    pipeline_parallel_size: usize,
}

impl<E: Engine> StepScheduler<E> {
    /// `virtual_engine_count` doubles as `P`, the pipeline-parallel stage
    /// count: each virtual engine drives exactly one PP stage (spec.md
    /// glossary, "Virtual engine"), so there is only ever one count to
    /// configure.
    pub fn new(engine: Arc<E>, virtual_engine_count: usize) -> Self {
        Self {
            engine,
            cache: SchedulerOutputCache::new(virtual_engine_count),
            pipeline_parallel_size: virtual_engine_count,
        }
    }

    /// Asks the engine to quiesce any remote worker loop it runs. Called
    /// by the engine loop whenever every virtual engine has gone idle,
    /// before it parks on `tracker.wait_for_new_requests()`.
    pub async fn quiesce(&self) {
        self.engine.stop_worker_execution_loop_async().await;
    }

    /// Whether virtual engine `v` still has unfinished requests the engine
    /// is carrying internally. Consulted by the engine loop after a step
    /// completes, ORed with that step's own `in_progress` signal, to decide
    /// whether to respawn (spec.md §4.4 step 3) — a step can legitimately
    /// produce no outputs (empty scheduler batch, or a mid-multi-step call
    /// with outputs deferred) while the engine still has work in flight.
    pub async fn has_unfinished_requests(&self, v: VirtualEngine) -> bool {
        self.engine.has_unfinished_requests_for_virtual_engine(v).await
    }

    /// Runs one step for virtual engine `v`, routing outputs into `tracker`.
    #[instrument(skip(self, tracker), fields(v = v.index()))]
    pub async fn step<I, P, A>(
        &self,
        v: VirtualEngine,
        tracker: &RequestTracker<I, P, A, E::Output>,
    ) -> Result<StepResult, CoreError>
    where
        I: Send + 'static,
        P: Send + 'static,
        A: Send + 'static,
    {
        // 1. Drain new/aborted requests and hand them to the engine.
        let (new_requests, aborted) = tracker.get_new_and_aborted_requests();
        for req in new_requests {
            if let Err(err) = self.engine.add_request(req.spec).await {
                req.stream.fail(err);
            }
        }
        if !aborted.is_empty() {
            let ids: Vec<_> = aborted.into_iter().collect();
            self.engine.abort_request(&ids);
        }

        // 1b. Schedule-or-reuse: reuse the cached multi-step decision if
        // one is live for `v`, otherwise consult the scheduler.
        let cached = self.cache.slots.lock()[v.index()].take();
        let (mut seq_group_metadata, scheduler_outputs, remaining_after_this_step, is_multi_step, forwarded_tokens) =
            if let Some(cached) = cached {
                trace!("reusing cached scheduler output");
                let remaining = cached.remaining_steps.saturating_sub(1);
                (
                    cached.seq_group_metadata,
                    cached.scheduler_outputs,
                    remaining,
                    true,
                    cached.last_output,
                )
            } else {
                let (metadata, outputs) = self.engine.schedule(v).await?;
                let total_steps = outputs.remaining_steps();
                (metadata, outputs, total_steps.saturating_sub(1), total_steps > 1, None)
            };

        // 2. Invariant check: every group in this batch must agree on how
        // many multi-step iterations remain.
        if let Some(first) = seq_group_metadata.first().map(|m| m.remaining_steps()) {
            if seq_group_metadata
                .iter()
                .any(|m| m.remaining_steps() != first)
            {
                return Err(CoreError::InvariantViolation(
                    "sequence groups in one scheduling decision disagree on remaining_steps".into(),
                ));
            }
        }
        if !scheduler_outputs.is_empty() && scheduler_outputs.remaining_steps() == 0 {
            return Err(CoreError::InvariantViolation(
                "scheduler produced a non-empty batch with remaining_steps == 0".into(),
            ));
        }

        // If this batch commits to more than one step, stash a copy of the
        // scheduling decision before it is consumed below, so the next
        // call to `step` for this virtual engine can skip scheduling. The
        // forwarded last-output slot is filled in after execution below.
        if remaining_after_this_step > 0 {
            let mut slots = self.cache.slots.lock();
            slots[v.index()] = Some(CachedStep {
                seq_group_metadata: seq_group_metadata.clone(),
                scheduler_outputs: scheduler_outputs.clone(),
                remaining_steps: remaining_after_this_step,
                last_output: None,
            });
        }

        // 3/4. Only run the model when the scheduler actually produced a
        // batch; an empty batch means `output = []` and the model is never
        // invoked this step (spec.md §4.3 step 3). Whether this virtual
        // engine should be stepped again despite producing nothing here is
        // decided by the caller, which also consults
        // `has_unfinished_requests_for_virtual_engine`.
        let model_outputs = if !scheduler_outputs.is_empty() {
            let finished_requests_ids = self.engine.get_and_reset_finished_requests_ids(v);

            // Only forward cached tokens when multi-step decoding is active
            // on a pipeline-parallel deployment, a cached output exists, and
            // the engine promised it is CPU-resident (never device-resident).
            let last_sampled_token_ids = if is_multi_step && self.pipeline_parallel_size > 1 {
                forwarded_tokens
                    .filter(|o| o.has_cpu_sampled_token_ids() && !o.has_device_sampled_token_ids())
            } else {
                None
            };

            let exec_request = ExecuteModelRequest {
                seq_group_metadata: seq_group_metadata.clone(),
                scheduler_outputs: scheduler_outputs.clone(),
                virtual_engine: v,
                num_lookahead_slots: scheduler_outputs.num_lookahead_slots(),
                running_queue_size: scheduler_outputs.running_queue_size(),
                finished_requests_ids,
                last_sampled_token_ids,
            };
            let model_outputs = self
                .engine
                .execute_model_async(exec_request)
                .await
                .map_err(|e| CoreError::StepFailure(e.to_string()))?;

            // Multi-step token forwarding: stash the last output of this
            // step so the next call can forward it to non-last pipeline
            // stages.
            if is_multi_step && self.pipeline_parallel_size > 1 && remaining_after_this_step > 0 {
                if let Some(last) = model_outputs.last() {
                    if last.has_device_sampled_token_ids() || !last.has_cpu_sampled_token_ids() {
                        return Err(CoreError::InvariantViolation(
                            "multi-step pipeline-parallel forwarding requires CPU-resident, non-device-resident sampled token ids".into(),
                        ));
                    }
                    let mut slots = self.cache.slots.lock();
                    if let Some(slot) = slots[v.index()].as_mut() {
                        slot.last_output = Some(Arc::new(last.clone()));
                    }
                }
            }

            model_outputs
        } else {
            trace!("scheduler produced an empty batch, skipping model execution");
            Vec::new()
        };

        // 5. Per-group step completion.
        if is_multi_step {
            for group in seq_group_metadata.iter_mut() {
                group.finish_step();
            }
        }

        // 6. Output materialization: only once the multi-step batch has no
        // remaining iterations; otherwise outputs are deferred until then.
        let (outputs_produced, any_unfinished) = if remaining_after_this_step == 0 {
            let outputs = self
                .engine
                .process_model_outputs(&model_outputs, &scheduler_outputs, &seq_group_metadata)
                .await?;
            let produced = outputs.len();
            let mut any_unfinished = false;
            for output in outputs {
                use crate::engine::EngineOutput;
                let request_id = output.request_id();
                let finished = output.is_finished();
                any_unfinished = any_unfinished || !finished;
                tracker.process_request_output(&request_id, output, finished);
            }
            (produced, any_unfinished)
        } else {
            trace!(
                remaining = remaining_after_this_step,
                "multi-step decode committed for next call, outputs deferred"
            );
            (0, false)
        };

        // 7. Best-effort telemetry. Infallible by construction.
        self.engine.record_stats(&scheduler_outputs, &model_outputs);

        Ok(StepResult {
            outputs_produced,
            in_progress: any_unfinished,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOutput;
    use crate::ids::RequestId;
    use crate::request::RequestSpec;
    use crate::tracker::RequestTracker;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct Meta {
        id: RequestId,
        remaining: usize,
    }
    impl SeqGroupMetadata for Meta {
        fn request_id(&self) -> RequestId {
            self.id.clone()
        }
        fn remaining_steps(&self) -> usize {
            self.remaining
        }
    }

    #[derive(Clone)]
    struct Sched {
        remaining: usize,
    }
    impl SchedulerOutputs for Sched {
        fn remaining_steps(&self) -> usize {
            self.remaining
        }
        fn is_empty(&self) -> bool {
            false
        }
    }

    #[derive(Clone)]
    struct Samp;
    impl SamplerOutput for Samp {
        fn has_cpu_sampled_token_ids(&self) -> bool {
            true
        }
        fn has_device_sampled_token_ids(&self) -> bool {
            false
        }
    }

    struct Out {
        id: RequestId,
    }
    impl EngineOutput for Out {
        fn request_id(&self) -> RequestId {
            self.id.clone()
        }
        fn is_finished(&self) -> bool {
            true
        }
    }

    /// A two-step multi-step engine on a pipeline-parallel-sized
    /// deployment: schedules once, commits to two forward passes, and
    /// only materializes output on the second.
    struct TwoStepEngine {
        schedule_calls: AtomicUsize,
        process_calls: AtomicUsize,
        forwarded_seen: Mutex<Vec<bool>>,
        id: RequestId,
    }

    #[async_trait]
    impl Engine for TwoStepEngine {
        type Inputs = ();
        type Params = ();
        type AdapterRef = ();
        type SeqGroupMetadata = Meta;
        type SchedulerOutputs = Sched;
        type SamplerOutput = Samp;
        type Output = Out;

        async fn add_request(&self, _spec: RequestSpec<(), (), ()>) -> Result<(), CoreError> {
            Ok(())
        }
        fn abort_request(&self, _ids: &[RequestId]) {}
        async fn schedule(&self, _v: VirtualEngine) -> Result<(Vec<Meta>, Sched), CoreError> {
            self.schedule_calls.fetch_add(1, Ordering::SeqCst);
            Ok((
                vec![Meta {
                    id: self.id.clone(),
                    remaining: 2,
                }],
                Sched { remaining: 2 },
            ))
        }
        async fn execute_model_async(
            &self,
            req: ExecuteModelRequest<Meta, Sched, Samp>,
        ) -> Result<Vec<Samp>, CoreError> {
            self.forwarded_seen
                .lock()
                .push(req.last_sampled_token_ids.is_some());
            Ok(vec![Samp])
        }
        async fn process_model_outputs(
            &self,
            _outputs: &[Samp],
            _scheduler_outputs: &Sched,
            _metadata: &[Meta],
        ) -> Result<Vec<Out>, CoreError> {
            self.process_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Out { id: self.id.clone() }])
        }
        async fn has_unfinished_requests_for_virtual_engine(&self, _v: VirtualEngine) -> bool {
            false
        }
        async fn stop_worker_execution_loop_async(&self) {}
        fn get_and_reset_finished_requests_ids(&self, _v: VirtualEngine) -> Vec<RequestId> {
            Vec::new()
        }
        async fn check_health(&self) -> Result<(), CoreError> {
            Ok(())
        }
        fn record_stats(&self, _scheduler_outputs: &Sched, _model_outputs: &[Samp]) {}
    }

    #[tokio::test]
    async fn multi_step_defers_output_until_last_iteration_and_forwards_tokens() {
        let engine = Arc::new(TwoStepEngine {
            schedule_calls: AtomicUsize::new(0),
            process_calls: AtomicUsize::new(0),
            forwarded_seen: Mutex::new(Vec::new()),
            id: RequestId::new("r1"),
        });
        // virtual_engine_count = 2 doubles as P: pipeline-parallel token
        // forwarding only activates when P > 1.
        let scheduler = StepScheduler::new(engine.clone(), 2);
        let tracker: Arc<RequestTracker<(), (), (), Out>> = Arc::new(RequestTracker::new());
        let _reader = tracker.add_request(RequestSpec::new("r1", (), ())).unwrap();

        let v = VirtualEngine::new(0);
        let first = scheduler.step(v, &tracker).await.unwrap();
        assert_eq!(first.outputs_produced, 0, "output deferred mid multi-step");
        assert!(
            !first.in_progress,
            "no outputs materialized yet; the caller must consult \
             has_unfinished_requests_for_virtual_engine to keep stepping"
        );
        assert_eq!(engine.process_calls.load(Ordering::SeqCst), 0);

        let second = scheduler.step(v, &tracker).await.unwrap();
        assert_eq!(second.outputs_produced, 1, "output materializes on final step");
        assert_eq!(engine.process_calls.load(Ordering::SeqCst), 1);
        // Scheduled once; the second step reused the cached decision.
        assert_eq!(engine.schedule_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            engine.forwarded_seen.lock().clone(),
            vec![false, true],
            "first step has nothing cached to forward, second forwards the first step's tokens"
        );
    }

    #[tokio::test]
    async fn disagreeing_remaining_steps_is_an_invariant_violation() {
        struct BadEngine;

        #[async_trait]
        impl Engine for BadEngine {
            type Inputs = ();
            type Params = ();
            type AdapterRef = ();
            type SeqGroupMetadata = Meta;
            type SchedulerOutputs = Sched;
            type SamplerOutput = Samp;
            type Output = Out;

            async fn add_request(&self, _spec: RequestSpec<(), (), ()>) -> Result<(), CoreError> {
                Ok(())
            }
            fn abort_request(&self, _ids: &[RequestId]) {}
            async fn schedule(&self, _v: VirtualEngine) -> Result<(Vec<Meta>, Sched), CoreError> {
                Ok((
                    vec![
                        Meta {
                            id: RequestId::new("a"),
                            remaining: 2,
                        },
                        Meta {
                            id: RequestId::new("b"),
                            remaining: 3,
                        },
                    ],
                    Sched { remaining: 2 },
                ))
            }
            async fn execute_model_async(
                &self,
                _req: ExecuteModelRequest<Meta, Sched, Samp>,
            ) -> Result<Vec<Samp>, CoreError> {
                Ok(vec![Samp, Samp])
            }
            async fn process_model_outputs(
                &self,
                _outputs: &[Samp],
                _scheduler_outputs: &Sched,
                _metadata: &[Meta],
            ) -> Result<Vec<Out>, CoreError> {
                Ok(Vec::new())
            }
            async fn has_unfinished_requests_for_virtual_engine(&self, _v: VirtualEngine) -> bool {
                false
            }
            async fn stop_worker_execution_loop_async(&self) {}
            fn get_and_reset_finished_requests_ids(&self, _v: VirtualEngine) -> Vec<RequestId> {
                Vec::new()
            }
            async fn check_health(&self) -> Result<(), CoreError> {
                Ok(())
            }
            fn record_stats(&self, _scheduler_outputs: &Sched, _model_outputs: &[Samp]) {}
        }

        let engine = Arc::new(BadEngine);
        let scheduler = StepScheduler::new(engine, 1);
        let tracker: Arc<RequestTracker<(), (), (), Out>> = Arc::new(RequestTracker::new());
        let err = scheduler
            .step(VirtualEngine::new(0), &tracker)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvariantViolation(_)));
    }
}
