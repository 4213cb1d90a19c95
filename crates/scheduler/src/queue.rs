//! Priority-then-FIFO queue with O(log n) removal by id.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use tokio::time::Instant;

use crate::priority::Priority;

/// Opaque handle identifying one queued request.
///
/// Ids are handed out in enqueue order, so they double as the FIFO sequence
/// number within a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

#[derive(Debug)]
pub(crate) struct QueuedRequest<T> {
    pub(crate) id: RequestId,
    pub(crate) subject_key: String,
    /// Effective priority, raised at most once by the starvation guard.
    pub(crate) priority: Priority,
    pub(crate) original_priority: Priority,
    pub(crate) enqueued_at: Instant,
    pub(crate) deadline: Instant,
    pub(crate) promote_at: Option<Instant>,
    pub(crate) payload: T,
}

impl<T> QueuedRequest<T> {
    fn order_key(&self) -> (Reverse<Priority>, RequestId) {
        (Reverse(self.priority), self.id)
    }
}

/// Every index is keyed so that removal by id is a map lookup plus a few
/// ordered-set removals.
#[derive(Debug)]
pub(crate) struct PriorityQueue<T> {
    entries: HashMap<RequestId, QueuedRequest<T>>,
    order: BTreeSet<(Reverse<Priority>, RequestId)>,
    promotions: BTreeSet<(Instant, RequestId)>,
    deadlines: BTreeSet<(Instant, RequestId)>,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeSet::new(),
            promotions: BTreeSet::new(),
            deadlines: BTreeSet::new(),
        }
    }
}

impl<T> PriorityQueue<T> {
    pub(crate) fn push(&mut self, request: QueuedRequest<T>) {
        let id = request.id;
        self.order.insert(request.order_key());
        self.deadlines.insert((request.deadline, id));
        if let Some(at) = request.promote_at {
            self.promotions.insert((at, id));
        }
        self.entries.insert(id, request);
    }

    /// Highest priority, oldest first.
    pub(crate) fn pop_next(&mut self) -> Option<QueuedRequest<T>> {
        let (_, id) = self.order.pop_first()?;
        self.take(id)
    }

    pub(crate) fn remove(&mut self, id: RequestId) -> Option<QueuedRequest<T>> {
        let request = self.entries.get(&id)?;
        self.order.remove(&request.order_key());
        self.take(id)
    }

    /// Drop `id` from every index except `order`, which the caller handles.
    fn take(&mut self, id: RequestId) -> Option<QueuedRequest<T>> {
        let request = self.entries.remove(&id)?;
        self.deadlines.remove(&(request.deadline, id));
        if let Some(at) = request.promote_at {
            self.promotions.remove(&(at, id));
        }
        Some(request)
    }

    /// Raise every request whose promotion time has come by one tier.
    /// Returns how many moved.
    pub(crate) fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(&(at, id)) = self.promotions.first() {
            if at > now {
                break;
            }
            self.promotions.pop_first();
            let Some(request) = self.entries.get_mut(&id) else {
                continue;
            };
            request.promote_at = None;
            let next = request.priority.promoted();
            if next == request.priority {
                continue;
            }
            self.order.remove(&(Reverse(request.priority), id));
            request.priority = next;
            self.order.insert((Reverse(next), id));
            promoted += 1;
        }
        promoted
    }

    /// Remove every request whose deadline has passed.
    pub(crate) fn expire_due(&mut self, now: Instant) -> Vec<QueuedRequest<T>> {
        let mut expired = Vec::new();
        while let Some(&(deadline, id)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            match self.remove(id) {
                Some(request) => expired.push(request),
                None => {
                    self.deadlines.pop_first();
                }
            }
        }
        expired
    }

    pub(crate) fn drain(&mut self) -> Vec<QueuedRequest<T>> {
        self.order.clear();
        self.promotions.clear();
        self.deadlines.clear();
        let mut drained: Vec<_> = self.entries.drain().map(|(_, request)| request).collect();
        drained.sort_by_key(|request| request.id);
        drained
    }

    pub(crate) fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
