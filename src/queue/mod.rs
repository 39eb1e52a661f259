//! Request queue: per-request state and the pending-interaction list.
//!
//! Every accepted request lives here until it reaches a terminal state.
//! Requests blocked on a user prerequisite are grouped into one
//! [`PendingInteraction`] per kind, kept in the order the kinds first
//! became necessary.

use crate::gateway::ApiRequest;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque, process-unique request handle. Ordering follows arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Monotonic [`RequestId`] source.
#[derive(Debug)]
pub struct RequestIdGenerator(AtomicU64);

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next_id(&self) -> RequestId {
        RequestId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// User prerequisites a request can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Credentials,
    DeviceLockCode,
    RemoteAuthorization,
}

impl std::fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Credentials => "credentials",
            Self::DeviceLockCode => "device lock code",
            Self::RemoteAuthorization => "remote authorization",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    Executing,
    Completed,
    Cancelled,
}

/// An accepted request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub api: ApiRequest,
    /// Resolved absolute URL.
    pub url: Url,
    pub retry_count: u8,
    pub created_at: DateTime<Utc>,
}

/// Read-only view of a tracked request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSnapshot {
    pub state: RequestState,
    pub retry_count: u8,
    pub awaiting: Option<InteractionKind>,
}

/// Requests waiting on one kind of user prerequisite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInteraction {
    pub kind: InteractionKind,
    pub request_ids: Vec<RequestId>,
    pub created_at: DateTime<Utc>,
    /// A prompt for this interaction is currently open.
    pub in_progress: bool,
}

/// Result of [`RequestQueue::park`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parked {
    /// First request waiting on this kind; a new interaction was opened.
    Opened,
    /// Joined an interaction that already existed.
    Joined,
    /// The request is no longer queued (cancelled or finished).
    NotQueued,
}

/// Result of [`RequestQueue::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancelled {
    /// Was queued; removed.
    Removed,
    /// Is executing; marked cancelled and its eventual result will be dropped.
    Flagged,
    /// Unknown or already terminal.
    NotFound,
}

struct Entry {
    request: Request,
    state: RequestState,
    awaiting: Option<InteractionKind>,
}

#[derive(Default)]
struct QueueInner {
    entries: HashMap<RequestId, Entry>,
    interactions: VecDeque<PendingInteraction>,
}

impl QueueInner {
    fn detach(&mut self, id: RequestId) {
        for interaction in &mut self.interactions {
            interaction.request_ids.retain(|r| *r != id);
        }
        self.interactions
            .retain(|i| !i.request_ids.is_empty() || i.in_progress);
    }
}

#[derive(Default)]
pub struct RequestQueue {
    inner: Mutex<QueueInner>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, request: Request) {
        let id = request.id;
        self.inner.lock().entries.insert(
            id,
            Entry {
                request,
                state: RequestState::Queued,
                awaiting: None,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn snapshot(&self, id: RequestId) -> Option<RequestSnapshot> {
        self.inner.lock().entries.get(&id).map(|e| RequestSnapshot {
            state: e.state,
            retry_count: e.request.retry_count,
            awaiting: e.awaiting,
        })
    }

    /// Copy of the request if it is queued and not waiting on a prompt.
    pub fn ready(&self, id: RequestId) -> Option<Request> {
        let inner = self.inner.lock();
        inner
            .entries
            .get(&id)
            .filter(|e| e.state == RequestState::Queued && e.awaiting.is_none())
            .map(|e| e.request.clone())
    }

    /// Queued → Executing. `false` if the request is not queued anymore.
    pub fn mark_executing(&self, id: RequestId) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&id) {
            Some(e) if e.state == RequestState::Queued => {
                e.state = RequestState::Executing;
                true
            }
            _ => false,
        }
    }

    /// Executing → Queued with the retry counter bumped. A request that was
    /// cancelled while executing is removed instead and `None` is returned.
    pub fn requeue_for_retry(&self, id: RequestId) -> Option<u8> {
        let mut inner = self.inner.lock();
        match inner.entries.get(&id).map(|e| e.state) {
            Some(RequestState::Executing) => {
                let e = inner.entries.get_mut(&id)?;
                e.state = RequestState::Queued;
                e.request.retry_count = e.request.retry_count.saturating_add(1);
                Some(e.request.retry_count)
            }
            Some(RequestState::Cancelled) => {
                inner.entries.remove(&id);
                inner.detach(id);
                None
            }
            _ => None,
        }
    }

    /// Move a queued request onto the interaction for `kind`.
    pub fn park(&self, id: RequestId, kind: InteractionKind) -> Parked {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&id) {
            Some(e) if e.state == RequestState::Queued => e.awaiting = Some(kind),
            _ => return Parked::NotQueued,
        }
        match inner.interactions.iter_mut().find(|i| i.kind == kind) {
            Some(interaction) => {
                if !interaction.request_ids.contains(&id) {
                    interaction.request_ids.push(id);
                }
                Parked::Joined
            }
            None => {
                inner.interactions.push_back(PendingInteraction {
                    kind,
                    request_ids: vec![id],
                    created_at: Utc::now(),
                    in_progress: false,
                });
                Parked::Opened
            }
        }
    }

    pub fn pending_interactions(&self) -> Vec<PendingInteraction> {
        self.inner.lock().interactions.iter().cloned().collect()
    }

    /// Kinds with no prompt open, oldest first.
    pub fn open_interaction_kinds(&self) -> Vec<InteractionKind> {
        self.inner
            .lock()
            .interactions
            .iter()
            .filter(|i| !i.in_progress)
            .map(|i| i.kind)
            .collect()
    }

    /// Mark the interaction for `kind` as prompting. `false` if it is gone or
    /// another caller already claimed it.
    pub fn claim_interaction(&self, kind: InteractionKind) -> bool {
        let mut inner = self.inner.lock();
        match inner.interactions.iter_mut().find(|i| i.kind == kind) {
            Some(i) if !i.in_progress => {
                i.in_progress = true;
                true
            }
            _ => false,
        }
    }

    /// Put a claimed interaction back, unresolved.
    pub fn release_interaction(&self, kind: InteractionKind) {
        let mut inner = self.inner.lock();
        if let Some(i) = inner.interactions.iter_mut().find(|i| i.kind == kind) {
            i.in_progress = false;
        }
        inner
            .interactions
            .retain(|i| !i.request_ids.is_empty() || i.in_progress);
    }

    /// Close the interaction for `kind`; its still-queued requests are
    /// returned in arrival order and no longer wait on anything.
    pub fn resolve_interaction(&self, kind: InteractionKind) -> Vec<RequestId> {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.interactions.iter().position(|i| i.kind == kind) else {
            return Vec::new();
        };
        let Some(interaction) = inner.interactions.remove(pos) else {
            return Vec::new();
        };
        let mut ids: Vec<_> = interaction
            .request_ids
            .into_iter()
            .filter(|id| match inner.entries.get_mut(id) {
                Some(e) if e.state == RequestState::Queued => {
                    e.awaiting = None;
                    true
                }
                _ => false,
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Remove a request that reached its end. Returns the state it was in,
    /// so callers can tell a cancelled request from a live one.
    pub fn complete(&self, id: RequestId) -> Option<RequestState> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.remove(&id)?;
        inner.detach(id);
        Some(entry.state)
    }

    pub fn cancel(&self, id: RequestId) -> Cancelled {
        let mut inner = self.inner.lock();
        let state = match inner.entries.get(&id) {
            Some(e) => e.state,
            None => return Cancelled::NotFound,
        };
        match state {
            RequestState::Queued => {
                inner.entries.remove(&id);
                inner.detach(id);
                Cancelled::Removed
            }
            RequestState::Executing => {
                if let Some(e) = inner.entries.get_mut(&id) {
                    e.state = RequestState::Cancelled;
                }
                Cancelled::Flagged
            }
            RequestState::Completed | RequestState::Cancelled => Cancelled::NotFound,
        }
    }

    /// Remove everything; returns the ids that were not yet cancelled.
    pub fn drain(&self) -> Vec<RequestId> {
        let mut inner = self.inner.lock();
        inner.interactions.clear();
        let mut ids: Vec<_> = inner
            .entries
            .drain()
            .filter(|(_, e)| e.state != RequestState::Cancelled)
            .map(|(id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(ids: &RequestIdGenerator) -> Request {
        Request {
            id: ids.next_id(),
            api: ApiRequest::get("/api/items"),
            url: Url::parse("https://gw.example.com/api/items").unwrap(),
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    fn queue_with(n: usize) -> (RequestQueue, Vec<RequestId>) {
        let ids = RequestIdGenerator::new();
        let queue = RequestQueue::new();
        let mut out = Vec::new();
        for _ in 0..n {
            let r = request(&ids);
            out.push(r.id);
            queue.insert(r);
        }
        (queue, out)
    }

    #[test]
    fn ids_are_monotonic() {
        let ids = RequestIdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert!(b > a);
        assert_eq!(a.to_string(), "req-1");
    }

    #[test]
    fn one_interaction_per_kind() {
        let (queue, ids) = queue_with(3);
        assert_eq!(queue.park(ids[0], InteractionKind::DeviceLockCode), Parked::Opened);
        assert_eq!(queue.park(ids[1], InteractionKind::DeviceLockCode), Parked::Joined);
        assert_eq!(queue.park(ids[2], InteractionKind::Credentials), Parked::Opened);

        let pending = queue.pending_interactions();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].kind, InteractionKind::DeviceLockCode);
        assert_eq!(pending[0].request_ids, vec![ids[0], ids[1]]);
        assert_eq!(queue.snapshot(ids[0]).unwrap().awaiting, Some(InteractionKind::DeviceLockCode));
        assert!(queue.ready(ids[0]).is_none());
    }

    #[test]
    fn claim_is_exclusive_until_released() {
        let (queue, ids) = queue_with(1);
        queue.park(ids[0], InteractionKind::Credentials);
        assert!(queue.claim_interaction(InteractionKind::Credentials));
        assert!(!queue.claim_interaction(InteractionKind::Credentials));
        assert!(queue.open_interaction_kinds().is_empty());

        queue.release_interaction(InteractionKind::Credentials);
        assert_eq!(queue.open_interaction_kinds(), vec![InteractionKind::Credentials]);
    }

    #[test]
    fn resolve_returns_waiting_ids_and_clears_awaiting() {
        let (queue, ids) = queue_with(3);
        for id in &ids {
            queue.park(*id, InteractionKind::Credentials);
        }
        assert_eq!(queue.cancel(ids[1]), Cancelled::Removed);

        let resumed = queue.resolve_interaction(InteractionKind::Credentials);
        assert_eq!(resumed, vec![ids[0], ids[2]]);
        assert!(queue.pending_interactions().is_empty());
        assert!(queue.ready(ids[0]).is_some());
    }

    #[test]
    fn cancelling_last_waiter_drops_interaction() {
        let (queue, ids) = queue_with(1);
        queue.park(ids[0], InteractionKind::RemoteAuthorization);
        queue.cancel(ids[0]);
        assert!(queue.pending_interactions().is_empty());
    }

    #[test]
    fn executing_cancel_is_flagged_then_dropped() {
        let (queue, ids) = queue_with(1);
        assert!(queue.mark_executing(ids[0]));
        assert_eq!(queue.cancel(ids[0]), Cancelled::Flagged);
        assert_eq!(queue.cancel(ids[0]), Cancelled::NotFound);
        assert_eq!(queue.complete(ids[0]), Some(RequestState::Cancelled));
        assert_eq!(queue.complete(ids[0]), None);
    }

    #[test]
    fn retry_bumps_counter_once_per_requeue() {
        let (queue, ids) = queue_with(1);
        queue.mark_executing(ids[0]);
        assert_eq!(queue.requeue_for_retry(ids[0]), Some(1));
        assert_eq!(queue.snapshot(ids[0]).unwrap().state, RequestState::Queued);
        queue.mark_executing(ids[0]);
        assert_eq!(queue.snapshot(ids[0]).unwrap().retry_count, 1);
    }

    #[test]
    fn requeue_of_cancelled_request_removes_it() {
        let (queue, ids) = queue_with(1);
        queue.mark_executing(ids[0]);
        queue.cancel(ids[0]);
        assert_eq!(queue.requeue_for_retry(ids[0]), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn park_after_cancel_is_rejected() {
        let (queue, ids) = queue_with(1);
        queue.cancel(ids[0]);
        assert_eq!(queue.park(ids[0], InteractionKind::Credentials), Parked::NotQueued);
        assert!(queue.pending_interactions().is_empty());
    }

    #[test]
    fn drain_skips_already_cancelled() {
        let (queue, ids) = queue_with(3);
        queue.mark_executing(ids[2]);
        queue.cancel(ids[2]);
        queue.park(ids[0], InteractionKind::Credentials);
        assert_eq!(queue.drain(), vec![ids[0], ids[1]]);
        assert!(queue.is_empty());
        assert!(queue.pending_interactions().is_empty());
    }
}
