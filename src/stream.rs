//! Per-request output streaming with cancel-on-drop semantics.
//!
//! `AsyncStream` is the producer-side handle the core pushes items into.
//! `StreamReader` is the consumer-side handle returned to the caller; it
//! implements [`futures::Stream`]. Dropping a `StreamReader` before the
//! stream reaches a terminator (`End` or `Err`) fires a one-shot cancel
//! callback, mirroring a generator that is torn down mid-iteration.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::CoreError;
use crate::ids::RequestId;

/// One item pushed down a stream. Modeled as an explicit three-way enum
/// rather than `Option<Result<O, CoreError>>` so a terminator is a single
/// value the channel can carry, not an inferred absence.
enum StreamItem<O> {
    Item(O),
    End,
    Err(CoreError),
}

/// Producer-side handle, held by the engine loop for one in-flight request.
/// Cloneable: the tracker keeps one handle for output routing while the
/// original is queued as part of a new-request record.
#[derive(Clone)]
pub struct AsyncStream<O> {
    tx: mpsc::UnboundedSender<StreamItem<O>>,
    terminated: Arc<AtomicBool>,
}

impl<O> AsyncStream<O> {
    /// Push one output item. Silently drops the item once the stream has
    /// already reached a terminator. Returns `Err(CoreError::Cancelled)`
    /// if the consumer has dropped its reader.
    pub fn put(&self, item: O) -> Result<(), CoreError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.tx
            .send(StreamItem::Item(item))
            .map_err(|_| CoreError::Cancelled)
    }

    /// Mark the stream as successfully finished. Idempotent: a second
    /// call, or a call after `fail`, is a no-op.
    pub fn finish(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(StreamItem::End);
    }

    /// Mark the stream as finished with an error, which the consumer will
    /// observe as the final item of the stream. Idempotent: a call after
    /// `finish` or another `fail` is a no-op, preserving exactly one
    /// terminator per stream.
    pub fn fail(&self, err: CoreError) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(StreamItem::Err(err));
    }

    /// Whether the consumer has dropped its reader.
    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether `finish`/`fail` has already been called. `fail` after this
    /// is a no-op rather than a second terminator, preserving "exactly
    /// one terminator per stream".
    pub fn is_finished(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// Consumer-side handle returned to the caller of `submit`.
pub struct StreamReader<O> {
    rx: mpsc::UnboundedReceiver<StreamItem<O>>,
    terminated: Arc<AtomicBool>,
    request_id: RequestId,
    on_drop_cancel: Option<Box<dyn FnOnce(RequestId) + Send>>,
}

/// Creates a bound producer/consumer pair for one request. `on_drop_cancel`
/// fires with `request_id` if the reader is dropped before the stream
/// reaches `End` or `Err`.
pub fn channel<O>(
    request_id: RequestId,
    on_drop_cancel: impl FnOnce(RequestId) + Send + 'static,
) -> (AsyncStream<O>, StreamReader<O>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let terminated = Arc::new(AtomicBool::new(false));
    (
        AsyncStream {
            tx,
            terminated: terminated.clone(),
        },
        StreamReader {
            rx,
            terminated,
            request_id,
            on_drop_cancel: Some(Box::new(on_drop_cancel)),
        },
    )
}

impl<O> Stream for StreamReader<O> {
    type Item = Result<O, CoreError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamItem::Item(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(StreamItem::End)) => Poll::Ready(None),
            Poll::Ready(Some(StreamItem::Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<O> Drop for StreamReader<O> {
    fn drop(&mut self) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        if let Some(cancel) = self.on_drop_cancel.take() {
            cancel(self.request_id.clone());
        }
    }
}
