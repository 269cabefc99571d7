//! Queue consumers
//!
//! Every worker runs the same loop: take an item, reconcile it, acknowledge
//! the outcome. Workers never exit on a reconcile error; they exit when the
//! queue is shut down.

use std::sync::Arc;

use tracing::{debug, error, info};

use super::event::Event;
use super::queue::{QueueItem, Retry, RetryQueue};
use super::reconciler::Reconciler;

/// One member of the worker pool
pub struct Worker {
    id: usize,
    queue: RetryQueue<Event>,
    reconciler: Arc<Reconciler>,
}

impl Worker {
    /// Create worker `id` draining `queue`
    pub fn new(id: usize, queue: RetryQueue<Event>, reconciler: Arc<Reconciler>) -> Self {
        Self {
            id,
            queue,
            reconciler,
        }
    }

    /// Process items until the queue shuts down
    pub async fn run(self) {
        debug!(worker = self.id, "Worker started");
        while self.process_next_item().await {}
        debug!(worker = self.id, "Worker stopped");
    }

    /// Handle one item; `false` once the queue has shut down
    pub async fn process_next_item(&self) -> bool {
        let Some(item) = self.queue.dequeue().await else {
            return false;
        };

        let result = match &item.event {
            Event::AddWaitingRoom(state) => self.reconciler.reconcile(state).await,
        };

        match result {
            Ok(()) => {
                debug!(
                    worker = self.id,
                    kind = %item.event.kind(),
                    waiting_room = %item.event.room(),
                    "Event processed"
                );
                self.queue.ack_success(item);
            }
            Err(e) if e.is_retryable() => self.retry(item, &e),
            Err(e) => {
                error!(
                    worker = self.id,
                    kind = %item.event.kind(),
                    waiting_room = %item.event.room(),
                    error = %e,
                    "Event failed permanently, dropping"
                );
                self.queue.discard(item);
            }
        }
        true
    }

    fn retry(&self, item: QueueItem<Event>, err: &lineq_common::Error) {
        let kind = item.event.kind();
        let room = item.event.room().to_string();
        match self.queue.ack_failure(item) {
            Retry::Requeued { attempt, delay } => info!(
                worker = self.id,
                kind = %kind,
                waiting_room = %room,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Event failed, requeued"
            ),
            Retry::Dropped => error!(
                worker = self.id,
                kind = %kind,
                waiting_room = %room,
                error = %err,
                "Event failed after all retries, dropping"
            ),
        }
    }
}
