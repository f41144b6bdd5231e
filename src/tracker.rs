//! Bookkeeping for in-flight requests: which streams are live, which
//! requests arrived since the engine last looked, and which were aborted
//! before the engine ever saw them.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::CoreError;
use crate::ids::RequestId;
use crate::request::RequestSpec;
use crate::stream::{self, AsyncStream, StreamReader};

/// A request that has arrived but not yet been handed to the engine.
pub struct NewRequest<I, P, A, O> {
    pub spec: RequestSpec<I, P, A>,
    pub stream: AsyncStream<O>,
}

struct Inner<I, P, A, O> {
    streams: HashMap<RequestId, AsyncStream<O>>,
    pending_new: Vec<NewRequest<I, P, A, O>>,
    pending_abort: HashSet<RequestId>,
}

/// Tracks every request the supervisor currently knows about. One
/// instance is shared (behind `Arc`) between the caller-facing `submit`/
/// `abort` surface and the engine loop.
pub struct RequestTracker<I, P, A, O> {
    inner: Mutex<Inner<I, P, A, O>>,
    wake: Notify,
}

impl<I, P, A, O> Default for RequestTracker<I, P, A, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, P, A, O> RequestTracker<I, P, A, O> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                streams: HashMap::new(),
                pending_new: Vec::new(),
                pending_abort: HashSet::new(),
            }),
            wake: Notify::new(),
        }
    }

    /// Queues a new request for handoff to the engine and returns the
    /// reader handle given back to the caller of `submit`. Fails with
    /// `DuplicateRequest` if the id is already accepted by the engine (i.e.
    /// already present in `streams`). Does not itself register into
    /// `streams` — that happens in `get_new_and_aborted_requests` once the
    /// request actually reaches the engine.
    pub fn add_request(
        self: &std::sync::Arc<Self>,
        spec: RequestSpec<I, P, A>,
    ) -> Result<StreamReader<O>, CoreError>
    where
        I: Send + 'static,
        P: Send + 'static,
        A: Send + 'static,
        O: Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.streams.contains_key(&spec.request_id) {
            return Err(CoreError::DuplicateRequest(spec.request_id.clone()));
        }

        let request_id = spec.request_id.clone();
        let tracker = self.clone();
        let (tx, rx) = stream::channel(request_id, move |id| {
            tracker.abort_request(&id);
        });

        inner.pending_new.push(NewRequest { spec, stream: tx });
        drop(inner);

        self.wake.notify_one();
        Ok(rx)
    }

    /// Marks a request for cancellation. If the engine has already seen
    /// it, immediately finishes its stream with `Cancelled`; otherwise it
    /// is recorded so `get_new_and_aborted_requests` can discard it before
    /// it ever reaches the engine.
    pub fn abort_request(&self, request_id: &RequestId) {
        let mut inner = self.inner.lock();
        if let Some(stream) = inner.streams.remove(request_id) {
            stream.fail(CoreError::Cancelled);
        }
        inner.pending_abort.insert(request_id.clone());
        drop(inner);
        self.wake.notify_one();
        debug!(%request_id, "request marked for abort");
    }

    /// Atomically drains everything that has arrived since the last call:
    /// new requests to hand to the engine, and ids to abort. A new request
    /// whose id is also in the abort set is discarded here and never
    /// reported to the engine, matching the reference implementation.
    /// Requests that survive the tie-break are registered into `streams`
    /// here — not in `add_request` — so that a `request_id` appears in
    /// `streams` iff it has actually been accepted by the engine.
    pub fn get_new_and_aborted_requests(&self) -> (Vec<NewRequest<I, P, A, O>>, HashSet<RequestId>) {
        let mut inner = self.inner.lock();
        let mut aborted = std::mem::take(&mut inner.pending_abort);
        let new_requests = std::mem::take(&mut inner.pending_new);

        let mut accepted = Vec::with_capacity(new_requests.len());
        for req in new_requests {
            if aborted.remove(&req.spec.request_id) {
                trace!(request_id = %req.spec.request_id, "discarding new request aborted before dispatch");
                req.stream.fail(CoreError::Cancelled);
                continue;
            }
            inner
                .streams
                .insert(req.spec.request_id.clone(), req.stream.clone());
            accepted.push(req);
        }
        (accepted, aborted)
    }

    /// Routes one output item to its request's stream, removing the
    /// stream from tracking if this was its final item.
    pub fn process_request_output(&self, request_id: &RequestId, item: O, finished: bool) {
        let mut inner = self.inner.lock();
        let Some(stream) = inner.streams.get(request_id) else {
            return;
        };
        let _ = stream.put(item);
        if finished {
            stream.finish();
            inner.streams.remove(request_id);
        }
    }

    /// Routes a per-request error to its stream and stops tracking it.
    pub fn process_exception(&self, request_id: &RequestId, err: CoreError) {
        let mut inner = self.inner.lock();
        if let Some(stream) = inner.streams.remove(request_id) {
            stream.fail(err);
        }
    }

    /// Fans a fatal, whole-engine error out to every live stream and
    /// drops them all from tracking.
    pub fn propagate_fatal_error(&self, err: CoreError) {
        let mut inner = self.inner.lock();
        for (_, stream) in inner.streams.drain() {
            stream.fail(err.clone());
        }
    }

    /// Waits until a request has been submitted or aborted since the last
    /// drain. Level-triggered: if work already arrived before this call,
    /// returns immediately.
    pub async fn wait_for_new_requests(&self) {
        self.wake.notified().await;
    }

    pub fn has_unfinished_requests(&self) -> bool {
        let inner = self.inner.lock();
        !inner.streams.is_empty() || !inner.pending_new.is_empty()
    }

    pub fn live_request_count(&self) -> usize {
        self.inner.lock().streams.len()
    }
}
