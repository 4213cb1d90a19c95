//! Priority admission queue.
//!
//! [`RequestScheduler`] caps the number of requests in flight. Work that
//! cannot start immediately is queued and dispatched highest priority first,
//! FIFO within a tier, whenever a slot frees up. A request that has waited
//! for `starvation_ratio` of its `max_wait` is promoted one tier, once.
//!
//! Every queued request owns a oneshot ready signal that is fired exactly
//! once: with [`Signal::Proceed`] when it is dispatched, or with a
//! cancellation reason when it times out, is cancelled, or the scheduler
//! shuts down.

pub mod priority;
mod queue;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use admission_common::SchedulerConfig;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

pub use priority::{ParsePriorityError, Priority};
pub use queue::RequestId;

use queue::{PriorityQueue, QueuedRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("request waited longer than its max_wait")]
    Timeout,
    #[error("scheduler is shutting down")]
    Shutdown,
    #[error("request was cancelled")]
    Cancelled,
    #[error("queue is full ({limit} requests waiting)")]
    QueueFull { limit: usize },
}

/// What a queued request's ready signal resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Proceed,
    Cancelled(SchedulerError),
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub dispatched: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub promoted: u64,
    pub rejected: u64,
}

struct State {
    queue: PriorityQueue<oneshot::Sender<Signal>>,
    in_flight: usize,
    max_concurrent: usize,
    next_id: u64,
    closed: bool,
    stats: SchedulerStats,
}

impl State {
    /// Dispatch queued requests while there is room.
    fn pump(&mut self, now: Instant) {
        let promoted = self.queue.promote_due(now);
        if promoted > 0 {
            self.stats.promoted += promoted as u64;
            debug!(promoted, "starvation guard promoted queued requests");
        }

        while self.in_flight < self.max_concurrent {
            let Some(request) = self.queue.pop_next() else {
                break;
            };
            self.in_flight += 1;
            match request.payload.send(Signal::Proceed) {
                Ok(()) => {
                    self.stats.dispatched += 1;
                    trace!(
                        id = %request.id,
                        subject = %request.subject_key,
                        priority = %request.priority,
                        original_priority = %request.original_priority,
                        waited_ms = now.saturating_duration_since(request.enqueued_at).as_millis() as u64,
                        "request dispatched"
                    );
                }
                Err(_) => {
                    // Waiter vanished without cancelling; hand the slot on.
                    self.in_flight -= 1;
                    self.stats.cancelled += 1;
                }
            }
        }
    }

    fn cancel(&mut self, request: QueuedRequest<oneshot::Sender<Signal>>, reason: SchedulerError) {
        match reason {
            SchedulerError::Timeout => self.stats.timed_out += 1,
            _ => self.stats.cancelled += 1,
        }
        debug!(id = %request.id, subject = %request.subject_key, %reason, "queued request cancelled");
        let _ = request.payload.send(Signal::Cancelled(reason));
    }

    fn release(&mut self) {
        if self.in_flight == 0 {
            if cfg!(debug_assertions) {
                panic!("scheduler released more slots than it dispatched");
            }
            error!("scheduler released more slots than it dispatched, ignoring");
            return;
        }
        self.in_flight -= 1;
    }
}

struct SchedulerInner {
    state: Mutex<State>,
    default_max_wait: Duration,
    starvation_ratio: f64,
    max_queue_depth: usize,
    tick: Duration,
}

/// Bounded-concurrency dispatcher with a priority wait queue.
///
/// Cheap to clone; clones share the same queue and slots.
#[derive(Clone)]
pub struct RequestScheduler {
    inner: Arc<SchedulerInner>,
}

impl RequestScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        info!(
            max_concurrent = config.max_concurrent,
            max_queue_depth = config.max_queue_depth,
            starvation_ratio = config.starvation_ratio,
            "creating request scheduler"
        );
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(State {
                    queue: PriorityQueue::default(),
                    in_flight: 0,
                    max_concurrent: config.max_concurrent.max(1),
                    next_id: 0,
                    closed: false,
                    stats: SchedulerStats::default(),
                }),
                default_max_wait: Duration::from_millis(config.default_max_wait_ms),
                starvation_ratio: config.starvation_ratio.clamp(0.0, 1.0),
                max_queue_depth: config.max_queue_depth,
                tick: Duration::from_millis(config.tick_ms.max(1)),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn default_max_wait(&self) -> Duration {
        self.inner.default_max_wait
    }

    /// Take a slot right away if one is free and nobody is queued ahead.
    pub fn try_acquire(&self) -> Option<DispatchPermit> {
        let mut state = self.lock();
        if state.closed || !state.queue.is_empty() || state.in_flight >= state.max_concurrent {
            return None;
        }
        state.in_flight += 1;
        state.stats.dispatched += 1;
        Some(DispatchPermit::new(self.clone()))
    }

    /// Queue a request. The returned handle resolves once it is dispatched,
    /// or fails after `max_wait`.
    pub fn enqueue(
        &self,
        subject_key: impl Into<String>,
        priority: Priority,
        max_wait: Duration,
    ) -> Result<ScheduledHandle, SchedulerError> {
        let now = Instant::now();
        let subject_key = subject_key.into();
        let mut state = self.lock();

        if state.closed {
            return Err(SchedulerError::Shutdown);
        }
        if state.queue.len() >= self.inner.max_queue_depth {
            state.stats.rejected += 1;
            warn!(
                subject = %subject_key,
                limit = self.inner.max_queue_depth,
                "scheduler queue full, rejecting request"
            );
            return Err(SchedulerError::QueueFull {
                limit: self.inner.max_queue_depth,
            });
        }

        let id = RequestId(state.next_id);
        state.next_id += 1;
        let deadline = now + max_wait;
        let promote_at = (priority != Priority::Critical)
            .then(|| now + max_wait.mul_f64(self.inner.starvation_ratio));
        let (tx, rx) = oneshot::channel();

        trace!(%id, subject = %subject_key, %priority, max_wait_ms = max_wait.as_millis() as u64, "request queued");
        state.queue.push(QueuedRequest {
            id,
            subject_key,
            priority,
            original_priority: priority,
            enqueued_at: now,
            deadline,
            promote_at,
            payload: tx,
        });
        state.pump(now);

        Ok(ScheduledHandle {
            id,
            deadline,
            rx: Some(rx),
            scheduler: self.clone(),
        })
    }

    /// Pick the next request to run, if there is room for it.
    ///
    /// Dispatch normally happens on its own whenever a slot frees up; this
    /// forces a pass, which also applies the starvation guard.
    pub fn dequeue_next(&self) {
        self.lock().pump(Instant::now());
    }

    /// Cancel a queued request. Returns `false` if it is no longer queued
    /// (already dispatched, cancelled or timed out), in which case nothing
    /// happens.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.cancel_with(id, SchedulerError::Cancelled)
    }

    fn cancel_with(&self, id: RequestId, reason: SchedulerError) -> bool {
        let mut state = self.lock();
        match state.queue.remove(id) {
            Some(request) => {
                state.cancel(request, reason);
                true
            }
            None => false,
        }
    }

    /// Return a slot taken by a detached permit.
    pub fn release(&self) {
        let mut state = self.lock();
        state.release();
        state.pump(Instant::now());
    }

    /// Change the concurrency ceiling. Raising it dispatches waiting work
    /// immediately; lowering it lets in-flight work drain.
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        let mut state = self.lock();
        state.max_concurrent = max_concurrent.max(1);
        info!(max_concurrent = state.max_concurrent, "scheduler concurrency updated");
        state.pump(Instant::now());
    }

    /// Cancel everything queued and refuse new work.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let drained = state.queue.drain();
        let count = drained.len();
        for request in drained {
            state.cancel(request, SchedulerError::Shutdown);
        }
        info!(cancelled = count, in_flight = state.in_flight, "scheduler shut down");
    }

    pub fn queue_depth(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn is_saturated(&self) -> bool {
        let state = self.lock();
        state.in_flight >= state.max_concurrent
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.lock();
        SchedulerStats {
            queued: state.queue.len(),
            in_flight: state.in_flight,
            max_concurrent: state.max_concurrent,
            ..state.stats
        }
    }

    /// Expire overdue entries and apply the starvation guard on every tick,
    /// including for requests whose waiters are not currently polling.
    pub fn tick(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        for request in state.queue.expire_due(now) {
            state.cancel(request, SchedulerError::Timeout);
        }
        state.pump(now);
    }

    /// Run [`tick`](Self::tick) every `tick_ms` until `shutdown` flips.
    pub fn spawn_dispatcher(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = self.clone();
        let period = self.inner.tick;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(tick_ms = period.as_millis() as u64, "scheduler dispatcher started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.tick();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("scheduler dispatcher stopped");
        })
    }
}

/// A queued request, awaiting dispatch.
///
/// Dropping the handle cancels the request. If it had already been
/// dispatched, the slot is handed straight back.
#[derive(Debug)]
pub struct ScheduledHandle {
    id: RequestId,
    deadline: Instant,
    rx: Option<oneshot::Receiver<Signal>>,
    scheduler: RequestScheduler,
}

impl ScheduledHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Suspend until dispatched, cancelled, or `max_wait` elapses.
    ///
    /// Dropping the returned future mid-wait behaves like dropping the
    /// handle: the queue entry is cancelled, or the slot released.
    pub async fn wait(mut self) -> Result<DispatchPermit, SchedulerError> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(SchedulerError::Cancelled);
        };
        let outcome = tokio::time::timeout_at(self.deadline, rx).await;

        // No await past this point; the handle's drop is a no-op from here.
        let Some(mut rx) = self.rx.take() else {
            return Err(SchedulerError::Cancelled);
        };
        let signal = match outcome {
            Ok(Ok(signal)) => signal,
            Ok(Err(_)) => Signal::Cancelled(SchedulerError::Shutdown),
            Err(_) => {
                if self.scheduler.cancel_with(self.id, SchedulerError::Timeout) {
                    return Err(SchedulerError::Timeout);
                }
                // Dispatched or cancelled between the deadline and the lock.
                rx.try_recv().unwrap_or(Signal::Cancelled(SchedulerError::Timeout))
            }
        };

        match signal {
            Signal::Proceed => Ok(DispatchPermit::new(self.scheduler.clone())),
            Signal::Cancelled(reason) => Err(reason),
        }
    }
}

impl Drop for ScheduledHandle {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        if self.scheduler.cancel(self.id) {
            return;
        }
        if let Ok(Signal::Proceed) = rx.try_recv() {
            self.scheduler.release();
        }
    }
}

/// An occupied slot. Released on drop.
#[derive(Debug)]
pub struct DispatchPermit {
    scheduler: Option<RequestScheduler>,
}

impl DispatchPermit {
    fn new(scheduler: RequestScheduler) -> Self {
        Self {
            scheduler: Some(scheduler),
        }
    }

    /// Give up automatic release. The owner must call
    /// [`RequestScheduler::release`] once the work is done.
    pub fn detach(mut self) {
        self.scheduler = None;
    }
}

impl Drop for DispatchPermit {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.release();
        }
    }
}

impl std::fmt::Debug for RequestScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("RequestScheduler")
            .field("queued", &stats.queued)
            .field("in_flight", &stats.in_flight)
            .field("max_concurrent", &stats.max_concurrent)
            .finish()
    }
}
