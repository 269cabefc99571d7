//! Pipeline supervisor
//!
//! One run of the pipeline owns a watch source, a translation task that turns
//! newly seen WaitingRooms into queue events, and a fixed pool of workers.
//! Workers only start once every watch has delivered its initial listing, so
//! the cache lookup never answers from a partial view.
//!
//! ```text
//! Initializing -> WaitingForSync -> Running -> Stopped
//!                       |                         ^
//!                       +------ cancelled --------+
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use kube::ResourceExt;
use lineq_common::crd::WaitingRoom;
use lineq_common::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::event::{DesiredState, Event};
use super::queue::RetryQueue;
use super::reconciler::Reconciler;
use super::watch::WatchSource;
use super::worker::Worker;

/// Default size of the worker pool
pub const DEFAULT_WORKERS: usize = 4;

/// Lifecycle of one pipeline run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    /// Watch and translation are starting
    Initializing,
    /// Waiting for the initial listing of every watch
    WaitingForSync,
    /// Workers are processing events
    Running,
    /// Everything has been shut down
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Initializing => "initializing",
            PipelineState::WaitingForSync => "waiting-for-sync",
            PipelineState::Running => "running",
            PipelineState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A single-use pipeline run
pub struct Pipeline {
    reconciler: Arc<Reconciler>,
    workers: usize,
    queue: RetryQueue<Event>,
    state: watch::Sender<PipelineState>,
}

impl Pipeline {
    /// Pipeline with `workers` workers and the default queue
    pub fn new(reconciler: Arc<Reconciler>, workers: usize) -> Self {
        Self::with_queue(reconciler, workers, RetryQueue::new())
    }

    /// Pipeline draining a caller-provided queue
    pub fn with_queue(
        reconciler: Arc<Reconciler>,
        workers: usize,
        queue: RetryQueue<Event>,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Initializing);
        Self {
            reconciler,
            workers: workers.max(1),
            queue,
            state,
        }
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// The queue this run drains
    pub fn queue(&self) -> &RetryQueue<Event> {
        &self.queue
    }

    fn transition(&self, next: PipelineState) {
        debug!(state = %next, "Pipeline state changed");
        self.state.send_replace(next);
    }

    /// Run until `cancel` fires or the run fails
    ///
    /// Cancellation at any point returns `Ok(())` after a clean stop. A
    /// failed sync or a watch stream that ends on its own is an error.
    pub async fn run<S: WatchSource>(
        self,
        mut source: S,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        self.transition(PipelineState::Initializing);
        let stream = source.start()?;
        let translate_token = cancel.child_token();
        let mut translator = tokio::spawn(translate(
            stream,
            self.queue.clone(),
            translate_token.clone(),
        ));

        self.transition(PipelineState::WaitingForSync);
        info!("Waiting for watch caches to sync");
        let synced = tokio::select! {
            _ = cancel.cancelled() => None,
            result = source.wait_for_sync() => Some(result),
        };
        match synced {
            None => {
                info!("Cancelled before caches synced");
                self.stop(Vec::new(), Some(translator), translate_token).await;
                return Ok(());
            }
            Some(Err(e)) => {
                error!(error = %e, "Watch caches failed to sync");
                self.stop(Vec::new(), Some(translator), translate_token).await;
                return Err(e);
            }
            Some(Ok(())) => {}
        }

        self.transition(PipelineState::Running);
        info!(workers = self.workers, "Starting workers");
        let workers: Vec<_> = (0..self.workers)
            .map(|id| {
                let worker = Worker::new(id, self.queue.clone(), Arc::clone(&self.reconciler));
                tokio::spawn(worker.run())
            })
            .collect();

        let stream_ended = tokio::select! {
            _ = cancel.cancelled() => false,
            joined = &mut translator => {
                if let Err(e) = joined {
                    error!(error = %e, "Translation task panicked");
                }
                true
            }
        };
        let result = if stream_ended {
            Err(Error::internal_with_context("pipeline", "watch stream ended"))
        } else {
            Ok(())
        };

        self.stop(workers, (!stream_ended).then_some(translator), translate_token)
            .await;
        result
    }

    async fn stop(
        &self,
        workers: Vec<JoinHandle<()>>,
        translator: Option<JoinHandle<()>>,
        translate_token: CancellationToken,
    ) {
        translate_token.cancel();
        if let Some(handle) = translator {
            if let Err(e) = handle.await {
                warn!(error = %e, "Translation task did not stop cleanly");
            }
        }

        self.queue.shutdown();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker did not stop cleanly");
            }
        }

        self.transition(PipelineState::Stopped);
        info!("Pipeline stopped");
    }
}

/// Enqueue every WaitingRoom the first time it is seen
async fn translate(
    mut stream: BoxStream<'static, Result<WaitingRoom, Error>>,
    queue: RetryQueue<Event>,
    cancel: CancellationToken,
) {
    let mut seen: HashSet<String> = HashSet::new();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.next() => next,
        };
        let room = match next {
            Some(Ok(room)) => room,
            Some(Err(e)) => {
                warn!(error = %e, "Watch error");
                continue;
            }
            None => {
                warn!("Watch stream ended");
                return;
            }
        };

        if let Some(event) = observe(&mut seen, &room) {
            debug!(waiting_room = %event.room(), kind = %event.kind(), "Enqueueing event");
            queue.enqueue(event);
        }
    }
}

/// Event for a WaitingRoom that has not been seen yet
///
/// Rooms are tracked by UID so later updates and re-lists produce nothing.
/// Invalid rooms are not marked as seen and are revalidated on their next
/// update.
fn observe(seen: &mut HashSet<String>, room: &WaitingRoom) -> Option<Event> {
    let name = room.name_any();
    let Some(uid) = room.uid() else {
        warn!(waiting_room = %name, "Ignoring waiting room without uid");
        return None;
    };
    if seen.contains(&uid) {
        return None;
    }

    match DesiredState::from_waiting_room(room) {
        Ok(state) => {
            seen.insert(uid);
            Some(Event::AddWaitingRoom(state))
        }
        Err(e) => {
            warn!(waiting_room = %name, error = %e, "Ignoring invalid waiting room");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::event::tests::sample_room;

    #[test]
    fn first_sighting_enqueues() {
        let mut seen = HashSet::new();
        let event = observe(&mut seen, &sample_room("r", "a.com", "/q")).unwrap();
        assert_eq!(event.room(), "r");
        assert!(seen.contains("uid-r"));
    }

    #[test]
    fn updates_and_relists_are_ignored() {
        let mut seen = HashSet::new();
        let room = sample_room("r", "a.com", "/q");
        assert!(observe(&mut seen, &room).is_some());
        assert!(observe(&mut seen, &room).is_none());

        let mut updated = room.clone();
        updated.spec.active_users = 50;
        assert!(observe(&mut seen, &updated).is_none());
    }

    #[test]
    fn invalid_rooms_are_dropped_until_fixed() {
        let mut seen = HashSet::new();
        let mut room = sample_room("r", "a.com", "no-slash");
        assert!(observe(&mut seen, &room).is_none());
        assert!(seen.is_empty());

        room.spec.path = "/q".to_string();
        assert!(observe(&mut seen, &room).is_some());
    }

    #[test]
    fn rooms_without_uid_are_dropped() {
        let mut seen = HashSet::new();
        let mut room = sample_room("r", "a.com", "/q");
        room.metadata.uid = None;
        assert!(observe(&mut seen, &room).is_none());
    }

    #[test]
    fn same_name_new_uid_is_a_new_room() {
        let mut seen = HashSet::new();
        let room = sample_room("r", "a.com", "/q");
        assert!(observe(&mut seen, &room).is_some());

        let mut recreated = room.clone();
        recreated.metadata.uid = Some("uid-r-2".to_string());
        assert!(observe(&mut seen, &recreated).is_some());
    }
}
