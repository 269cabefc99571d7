//! Rate-limited, at-least-once reconcile queue
//!
//! Items are handed to exactly one consumer per dequeue. A failed item is
//! reinserted after a per-item exponential delay until it has been retried
//! [`MAX_RETRIES`] times, after which it is dropped. Duplicates are allowed;
//! correctness comes from the reconciler being idempotent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lineq_common::metrics::{self, QUEUE_DEPTH, QUEUE_RETRIES};
use lineq_common::retry::RetryConfig;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

/// Number of requeues an item gets before it is dropped
pub const MAX_RETRIES: u32 = 3;

/// An item together with the number of times it has been retried
#[derive(Clone, Debug, PartialEq)]
pub struct QueueItem<T> {
    /// The queued work
    pub event: T,
    /// 0 on first enqueue, +1 per requeue
    pub attempt: u32,
}

/// What `ack_failure` did with an item
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retry {
    /// Reinserted with the given attempt number after `delay`
    Requeued {
        /// Attempt number the item will carry
        attempt: u32,
        /// Delay before it becomes visible again
        delay: Duration,
    },
    /// Retries exhausted; the item is gone
    Dropped,
}

struct State<T> {
    items: VecDeque<QueueItem<T>>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    available: Notify,
    in_flight: AtomicUsize,
    waiting_retry: AtomicUsize,
    requeued: AtomicUsize,
    dropped: AtomicUsize,
    backoff: RetryConfig,
    max_retries: u32,
}

/// Shared handle to a reconcile queue; clones refer to the same queue
pub struct RetryQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RetryQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Default for RetryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> RetryQueue<T> {
    /// Queue with the default per-item backoff and [`MAX_RETRIES`]
    pub fn new() -> Self {
        Self::with_backoff(RetryConfig::work_queue(), MAX_RETRIES)
    }

    /// Queue with a custom backoff and retry budget
    pub fn with_backoff(backoff: RetryConfig, max_retries: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                in_flight: AtomicUsize::new(0),
                waiting_retry: AtomicUsize::new(0),
                requeued: AtomicUsize::new(0),
                dropped: AtomicUsize::new(0),
                backoff,
                max_retries,
            }),
        }
    }

    /// Add a new logical item with `attempt = 0`; never blocks
    pub fn enqueue(&self, event: T) {
        self.push(QueueItem { event, attempt: 0 });
    }

    fn push(&self, item: QueueItem<T>) {
        let depth = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                debug!("Queue is shut down, ignoring item");
                return;
            }
            state.items.push_back(item);
            state.items.len()
        };
        QUEUE_DEPTH.record(depth as u64, &[]);
        self.inner.available.notify_one();
    }

    /// Wait for the next item; `None` once the queue has been shut down
    pub async fn dequeue(&self) -> Option<QueueItem<T>> {
        loop {
            let notified = self.inner.available.notified();
            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.items.pop_front() {
                    self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
                    QUEUE_DEPTH.record(state.items.len() as u64, &[]);
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// The item was processed; it will not be retried
    pub fn ack_success(&self, item: QueueItem<T>) {
        self.finish();
        drop(item);
    }

    /// The item failed; requeue it with backoff or drop it if exhausted
    pub fn ack_failure(&self, item: QueueItem<T>) -> Retry {
        self.finish();

        if item.attempt >= self.inner.max_retries {
            self.inner.dropped.fetch_add(1, Ordering::SeqCst);
            metrics::record_drop("retries_exhausted");
            return Retry::Dropped;
        }

        let delay = self.inner.backoff.delay_for(item.attempt);
        let requeued = QueueItem {
            event: item.event,
            attempt: item.attempt + 1,
        };
        let attempt = requeued.attempt;
        QUEUE_RETRIES.add(1, &[KeyValue::new("attempt", i64::from(attempt))]);

        self.inner.requeued.fetch_add(1, Ordering::SeqCst);
        self.inner.waiting_retry.fetch_add(1, Ordering::SeqCst);
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.inner.waiting_retry.fetch_sub(1, Ordering::SeqCst);
            queue.push(requeued);
        });

        Retry::Requeued { attempt, delay }
    }

    /// Drop the item without retrying (the failure cannot be fixed by retrying)
    pub fn discard(&self, item: QueueItem<T>) {
        self.finish();
        self.inner.dropped.fetch_add(1, Ordering::SeqCst);
        metrics::record_drop("permanent_error");
        drop(item);
    }

    fn finish(&self) {
        let _ = self
            .inner
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Stop handing out items and wake every waiting consumer
    ///
    /// Items still queued are discarded; delayed requeues that fire later
    /// are ignored.
    pub fn shutdown(&self) {
        let discarded = {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            let discarded = state.items.len();
            state.items.clear();
            discarded
        };
        QUEUE_DEPTH.record(0, &[]);
        if discarded > 0 {
            debug!(discarded, "Queue shut down with pending items");
        }
        self.inner.available.notify_waiters();
    }

    /// Whether `shutdown` has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Items ready to be dequeued
    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    /// True when no item is ready to be dequeued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items dequeued but not yet acknowledged
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Failed items waiting out their backoff delay
    pub fn waiting_retry(&self) -> usize {
        self.inner.waiting_retry.load(Ordering::SeqCst)
    }

    /// Requeues made by `ack_failure` since the queue was created
    pub fn requeued(&self) -> usize {
        self.inner.requeued.load(Ordering::SeqCst)
    }

    /// Items given up on, after exhausting retries or through `discard`
    pub fn dropped(&self) -> usize {
        self.inner.dropped.load(Ordering::SeqCst)
    }
}
