//! Result dispatch: exactly-once delivery of terminal outcomes.
//!
//! Each accepted request registers one [`ResultSink`]. Delivery removes the
//! sink under the lock and invokes it after the lock is released, so a sink
//! that submits new work cannot deadlock the dispatcher. A second delivery
//! for the same id finds no sink and is a no-op.

use crate::error::ErrorKind;
use crate::gateway::ApiResponse;
use crate::queue::RequestId;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

/// Terminal failure of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
    /// Gateway response that caused the failure, when there was one.
    pub response: Option<ApiResponse>,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            response: None,
        }
    }

    pub fn with_response(mut self, response: ApiResponse) -> Self {
        self.response = Some(response);
        self
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Terminal outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(ApiResponse),
    Failure(Failure),
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Failure(_) => "failure",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Receives the outcome of one request.
pub trait ResultSink: Send + 'static {
    fn deliver(self: Box<Self>, id: RequestId, outcome: Outcome);
}

impl ResultSink for oneshot::Sender<Outcome> {
    fn deliver(self: Box<Self>, id: RequestId, outcome: Outcome) {
        if (*self).send(outcome).is_err() {
            tracing::debug!(%id, "Result receiver dropped");
        }
    }
}

impl ResultSink for mpsc::UnboundedSender<(RequestId, Outcome)> {
    fn deliver(self: Box<Self>, id: RequestId, outcome: Outcome) {
        if self.send((id, outcome)).is_err() {
            tracing::debug!(%id, "Result channel closed");
        }
    }
}

/// Adapter turning a closure into a [`ResultSink`].
pub struct FnSink<F>(pub F);

impl<F> ResultSink for FnSink<F>
where
    F: FnOnce(RequestId, Outcome) + Send + 'static,
{
    fn deliver(self: Box<Self>, id: RequestId, outcome: Outcome) {
        (self.0)(id, outcome)
    }
}

/// Wrap a closure as a sink.
pub fn sink_fn<F>(f: F) -> FnSink<F>
where
    F: FnOnce(RequestId, Outcome) + Send + 'static,
{
    FnSink(f)
}

#[derive(Default)]
pub struct ResultDispatcher {
    sinks: Mutex<HashMap<RequestId, Box<dyn ResultSink>>>,
}

impl ResultDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: RequestId, sink: Box<dyn ResultSink>) {
        if self.sinks.lock().insert(id, sink).is_some() {
            tracing::warn!(%id, "Result sink replaced");
        }
    }

    /// Deliver `outcome` for `id`. Returns `false` if the id already had its
    /// outcome delivered (or was never registered).
    pub fn deliver(&self, id: RequestId, outcome: Outcome) -> bool {
        let sink = self.sinks.lock().remove(&id);
        match sink {
            Some(sink) => {
                tracing::debug!(%id, outcome = outcome.label(), "Delivering result");
                sink.deliver(id, outcome);
                true
            }
            None => {
                tracing::trace!(%id, outcome = outcome.label(), "Result already delivered");
                false
            }
        }
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.sinks.lock().contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.sinks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RequestIdGenerator;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn delivers_exactly_once() {
        let ids = RequestIdGenerator::new();
        let id = ids.next_id();
        let hits = Arc::new(AtomicUsize::new(0));
        let dispatcher = ResultDispatcher::new();
        let h = hits.clone();
        dispatcher.register(
            id,
            Box::new(sink_fn(move |_, _| {
                h.fetch_add(1, Ordering::SeqCst);
            })),
        );

        assert!(dispatcher.is_pending(id));
        assert!(dispatcher.deliver(id, Outcome::Cancelled));
        assert!(!dispatcher.deliver(id, Outcome::Success(ApiResponse::new(200, ""))));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn unknown_id_is_noop() {
        let dispatcher = ResultDispatcher::new();
        assert!(!dispatcher.deliver(RequestIdGenerator::new().next_id(), Outcome::Cancelled));
    }

    #[tokio::test]
    async fn oneshot_and_channel_sinks() {
        let ids = RequestIdGenerator::new();
        let dispatcher = ResultDispatcher::new();

        let (tx, rx) = oneshot::channel();
        let a = ids.next_id();
        dispatcher.register(a, Box::new(tx));

        let (ctx, mut crx) = mpsc::unbounded_channel();
        let b = ids.next_id();
        dispatcher.register(b, Box::new(ctx));

        dispatcher.deliver(a, Outcome::Success(ApiResponse::new(200, "ok")));
        dispatcher.deliver(b, Outcome::Failure(Failure::new(ErrorKind::Timeout, "slow")));

        assert!(rx.await.unwrap().is_success());
        let (id, outcome) = crx.recv().await.unwrap();
        assert_eq!(id, b);
        assert!(matches!(outcome, Outcome::Failure(f) if f.kind == ErrorKind::Timeout));
    }

    #[test]
    fn dropped_receiver_does_not_panic() {
        let ids = RequestIdGenerator::new();
        let dispatcher = ResultDispatcher::new();
        let (tx, rx) = oneshot::channel();
        drop(rx);
        let id = ids.next_id();
        dispatcher.register(id, Box::new(tx));
        assert!(dispatcher.deliver(id, Outcome::Cancelled));
    }

    #[test]
    fn sink_may_reenter_dispatcher() {
        let ids = RequestIdGenerator::new();
        let dispatcher = Arc::new(ResultDispatcher::new());
        let first = ids.next_id();
        let second = ids.next_id();
        let (tx, rx) = std::sync::mpsc::channel();

        dispatcher.register(second, Box::new(sink_fn(move |id, _| tx.send(id).unwrap())));
        let d = dispatcher.clone();
        dispatcher.register(
            first,
            Box::new(sink_fn(move |_, _| {
                d.deliver(second, Outcome::Cancelled);
            })),
        );

        dispatcher.deliver(first, Outcome::Cancelled);
        assert_eq!(rx.recv().unwrap(), second);
    }
}
