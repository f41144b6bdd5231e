//! The request envelope submitted to the core.

use chrono::{DateTime, Utc};

use crate::ids::RequestId;

/// Everything the core needs to hand a new request to the engine.
/// `Inputs`, `Params`, and `AdapterRef` are the engine's own opaque types;
/// the core stores and forwards them without inspecting their contents.
#[derive(Debug, Clone)]
pub struct RequestSpec<I, P, A> {
    pub request_id: RequestId,
    pub inputs: I,
    pub params: P,
    pub arrival_time: DateTime<Utc>,
    pub adapter: Option<A>,
}

impl<I, P, A> RequestSpec<I, P, A> {
    pub fn new(request_id: impl Into<RequestId>, inputs: I, params: P) -> Self {
        Self {
            request_id: request_id.into(),
            inputs,
            params,
            arrival_time: Utc::now(),
            adapter: None,
        }
    }

    pub fn with_adapter(mut self, adapter: A) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn with_arrival_time(mut self, arrival_time: DateTime<Utc>) -> Self {
        self.arrival_time = arrival_time;
        self
    }
}
