//! End-to-end scenarios driving a `Supervisor` over a `MockEngine`.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use asyncserve::engine_loop::EngineLoopConfig;
use asyncserve::error::CoreError;
use asyncserve::ids::RequestId;
use asyncserve::mock::MockEngine;
use asyncserve::request::RequestSpec;
use asyncserve::supervisor::{Supervisor, SupervisorConfig};

type TestSupervisor = Supervisor<MockEngine, String, (), ()>;

fn config(virtual_engine_count: usize, iteration_timeout: Duration) -> SupervisorConfig {
    SupervisorConfig {
        loop_config: EngineLoopConfig {
            iteration_timeout,
            virtual_engine_count,
        },
        auto_start: true,
    }
}

fn spec(id: &str) -> RequestSpec<String, (), ()> {
    RequestSpec::new(id, String::new(), ())
}

#[tokio::test]
async fn single_request_three_increments() {
    let engine = Arc::new(MockEngine::new());
    engine.add_response(0, RequestId::new("r1"), "A", false);
    engine.add_response(0, RequestId::new("r1"), "B", false);
    engine.add_response(0, RequestId::new("r1"), "C", true);

    let supervisor: Arc<TestSupervisor> =
        Arc::new(Supervisor::new(engine, config(1, Duration::from_secs(5))));

    let mut stream = supervisor.submit(spec("r1")).unwrap();
    let mut texts = Vec::new();
    while let Some(item) = stream.next().await {
        texts.push(item.unwrap().text);
    }

    assert_eq!(texts, vec!["A", "B", "C"]);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn two_concurrent_requests_keep_independent_order() {
    let engine = Arc::new(MockEngine::new());
    engine.add_response(0, RequestId::new("r1"), "x", false);
    engine.add_response(0, RequestId::new("r2"), "p", false);
    engine.add_response(0, RequestId::new("r1"), "y", true);
    engine.add_response(0, RequestId::new("r2"), "q", true);

    let supervisor: Arc<TestSupervisor> =
        Arc::new(Supervisor::new(engine, config(1, Duration::from_secs(5))));

    let mut s1 = supervisor.submit(spec("r1")).unwrap();
    let mut s2 = supervisor.submit(spec("r2")).unwrap();

    let mut t1 = Vec::new();
    while let Some(item) = s1.next().await {
        t1.push(item.unwrap().text);
    }
    let mut t2 = Vec::new();
    while let Some(item) = s2.next().await {
        t2.push(item.unwrap().text);
    }

    assert_eq!(t1, vec!["x", "y"]);
    assert_eq!(t2, vec!["p", "q"]);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn abort_before_dispatch_never_reaches_engine() {
    let engine = Arc::new(MockEngine::new());
    let supervisor: Arc<TestSupervisor> =
        Arc::new(Supervisor::new(engine.clone(), config(1, Duration::from_secs(5))));

    // No `.await` between submit and abort: the spawned loop task cannot
    // have run yet on this current-thread test runtime.
    let mut stream = supervisor.submit(spec("r1")).unwrap();
    supervisor.abort(&RequestId::new("r1"));

    let item = stream.next().await.unwrap();
    assert!(matches!(item, Err(CoreError::Cancelled)));
    assert!(stream.next().await.is_none());

    assert!(!engine.accepted_request_ids().contains(&RequestId::new("r1")));
    supervisor.shutdown().await;
}

#[tokio::test]
async fn validation_failure_is_isolated_to_one_stream() {
    let engine = Arc::new(MockEngine::new());
    engine.reject_request(RequestId::new("r1"));
    engine.add_response(0, RequestId::new("r2"), "ok", true);

    let supervisor: Arc<TestSupervisor> =
        Arc::new(Supervisor::new(engine, config(1, Duration::from_secs(5))));

    let mut s1 = supervisor.submit(spec("r1")).unwrap();
    let item = s1.next().await.unwrap();
    assert!(matches!(item, Err(CoreError::RequestValidation(_))));
    assert!(s1.next().await.is_none());

    let mut s2 = supervisor.submit(spec("r2")).unwrap();
    let mut texts = Vec::new();
    while let Some(item) = s2.next().await {
        texts.push(item.unwrap().text);
    }
    assert_eq!(texts, vec!["ok"]);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn fatal_step_failure_stops_the_loop_for_everyone() {
    let engine = Arc::new(MockEngine::new());
    engine.add_response(0, RequestId::new("r1"), "unreached", false);
    engine.add_response(0, RequestId::new("r2"), "unreached", false);
    engine.fail_execute_with(CoreError::StepFailure("nccl".into()));

    let supervisor: Arc<TestSupervisor> =
        Arc::new(Supervisor::new(engine, config(1, Duration::from_secs(5))));

    let mut s1 = supervisor.submit(spec("r1")).unwrap();
    let mut s2 = supervisor.submit(spec("r2")).unwrap();

    let e1 = s1.next().await.unwrap();
    let e2 = s2.next().await.unwrap();
    assert!(matches!(e1, Err(CoreError::StepFailure(_))));
    assert!(matches!(e2, Err(CoreError::StepFailure(_))));

    // Give the loop task a moment to finish latching its errored state.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(supervisor.is_stopped());

    let err = supervisor.submit(spec("r3")).unwrap_err();
    assert!(matches!(err, CoreError::EngineDead));
}

#[tokio::test]
async fn adapter_request_rejected_when_engine_has_adapters_disabled() {
    let engine = Arc::new(MockEngine::new());
    engine.disable_adapters();

    let supervisor: Arc<TestSupervisor> =
        Arc::new(Supervisor::new(engine, config(1, Duration::from_secs(5))));

    let err = supervisor
        .submit(spec("r1").with_adapter(()))
        .unwrap_err();
    assert!(matches!(err, CoreError::AdapterDisabled));
    supervisor.shutdown().await;
}

#[tokio::test]
async fn gated_item_skips_model_execution_until_triggered() {
    let engine = Arc::new(MockEngine::new());
    // The scripted item is not eligible for scheduling until the gate
    // fires: `schedule()` returns an empty batch every round up to that
    // point even though `has_unfinished_requests_for_virtual_engine`
    // reports true (the per-VE queue is non-empty). This is exactly the
    // empty-scheduler-output-but-still-unfinished path that must skip
    // model execution entirely rather than calling `execute_model_async`
    // with an empty batch.
    let gate = engine.add_response_with_trigger(0, RequestId::new("r1"), "A", true);

    let supervisor: Arc<TestSupervisor> =
        Arc::new(Supervisor::new(engine.clone(), config(1, Duration::from_secs(5))));

    let mut stream = supervisor.submit(spec("r1")).unwrap();

    // Let the loop spin on the gated, not-yet-ready item for a while.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !engine
            .get_calls()
            .iter()
            .any(|c| c.kind == "execute_model_async"),
        "model execution must be skipped while the scheduled batch is empty"
    );

    gate.trigger();

    let item = stream.next().await.unwrap();
    assert_eq!(item.unwrap().text, "A");
    assert!(stream.next().await.is_none());

    assert!(engine
        .get_calls()
        .iter()
        .any(|c| c.kind == "execute_model_async"));
    supervisor.shutdown().await;
}

#[tokio::test]
async fn iteration_timeout_latches_errored_state() {
    let engine = Arc::new(MockEngine::new());
    engine.add_response(0, RequestId::new("r1"), "unreached", false);
    engine.set_execute_delay(Duration::from_secs(5));

    let supervisor: Arc<TestSupervisor> =
        Arc::new(Supervisor::new(engine, config(1, Duration::from_secs(1))));

    let mut stream = supervisor.submit(spec("r1")).unwrap();
    let item = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("stream should resolve before the test timeout")
        .unwrap();
    assert!(matches!(item, Err(CoreError::IterationTimeout(_))));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(supervisor.is_stopped());
}
