//! Async serving front-end for a batched LLM inference engine.
//!
//! This crate multiplexes many concurrent request streams onto a single
//! batched, synchronous engine. It owns request lifecycle bookkeeping,
//! per-request output streaming with cancel-on-drop semantics, and the
//! per-virtual-engine step loop that drives the engine forward. Batching
//! policy, KV-cache/block management, sampling, and tokenization all live
//! behind the [`Engine`] trait this crate consumes — none of it is
//! implemented here.
//!
//! ```no_run
//! use std::sync::Arc;
//! use asyncserve::{RequestSpec, Supervisor, SupervisorConfig};
//! use asyncserve::mock::MockEngine;
//!
//! # async fn run() {
//! let engine = Arc::new(MockEngine::new());
//! let config = SupervisorConfig::from_env(1);
//! let supervisor = Arc::new(Supervisor::new(engine, config));
//!
//! let spec = RequestSpec::new("request-1", "hello".to_string(), ());
//! let _stream = supervisor.submit(spec).unwrap();
//! supervisor.shutdown().await;
//! # }
//! ```

pub mod engine;
pub mod engine_loop;
pub mod error;
pub mod ids;
pub mod mock;
pub mod request;
pub mod scheduler;
pub mod stream;
pub mod supervisor;
pub mod tracker;

pub use engine::{
    Engine, EngineOutput, ExecuteModelRequest, SamplerOutput, SchedulerOutputs, SeqGroupMetadata,
};
pub use error::{CoreError, Result};
pub use ids::{RequestId, VirtualEngine};
pub use request::RequestSpec;
pub use scheduler::{SchedulerOutputCache, StepResult, StepScheduler};
pub use stream::{AsyncStream, StreamReader};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use tracker::RequestTracker;
