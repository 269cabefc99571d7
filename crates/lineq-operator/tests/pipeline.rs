//! Pipeline runs against an in-memory cluster
//!
//! Each test tells one story about a WaitingRoom travelling from the watch
//! through the queue and workers into an Ingress.

mod support;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use lineq_common::crd::WaitingRoom;
use lineq_common::Error;
use lineq_operator::backend::LineqBackend;
use lineq_operator::controller::{
    CacheLookup, DesiredState, Event, IngressApi, Pipeline, PipelineState, Reconciler,
    RetryQueue, WatchSource, MAX_RETRIES,
};
use lineq_operator::runner::WatchFactory;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use support::{fast_retry, ingress_name, room, FakeBackend, FakeCluster, FakeWatches};

/// A pipeline wired to `cluster`, plus the pieces tests poke at
struct Harness {
    backend: Arc<FakeBackend>,
    queue: RetryQueue<Event>,
    state: watch::Receiver<PipelineState>,
    cancel: CancellationToken,
    run: tokio::task::JoinHandle<Result<(), Error>>,
}

fn reconciler(cluster: &Arc<FakeCluster>, backend: &Arc<FakeBackend>) -> Arc<Reconciler> {
    Arc::new(Reconciler::new(
        Arc::clone(cluster) as Arc<dyn IngressApi>,
        Arc::clone(cluster) as Arc<dyn CacheLookup>,
        cluster.shared_config(),
        Arc::clone(backend) as Arc<dyn LineqBackend>,
    ))
}

fn start_with<S: WatchSource + 'static>(cluster: Arc<FakeCluster>, source: S) -> Harness {
    let backend = Arc::new(FakeBackend::default());
    let queue = RetryQueue::with_backoff(fast_retry(), MAX_RETRIES);
    let pipeline = Pipeline::with_queue(reconciler(&cluster, &backend), 2, queue.clone());
    let state = pipeline.subscribe();
    let cancel = CancellationToken::new();
    let run = tokio::spawn(pipeline.run(source, cancel.clone()));
    Harness {
        backend,
        queue,
        state,
        cancel,
        run,
    }
}

fn start(cluster: Arc<FakeCluster>) -> Harness {
    let (source, _) = FakeWatches(Arc::clone(&cluster)).create();
    start_with(cluster, source)
}

impl Harness {
    async fn reach(&mut self, wanted: PipelineState) {
        tokio::time::timeout(Duration::from_secs(10), self.state.wait_for(|s| *s == wanted))
            .await
            .expect("state reached in time")
            .expect("pipeline alive");
    }

    /// Wait until nothing is queued, in flight, or waiting out a backoff
    async fn idle(&self) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if self.queue.is_empty()
                    && self.queue.in_flight() == 0
                    && self.queue.waiting_retry() == 0
                {
                    return;
                }
            }
        })
        .await
        .expect("queue drained in time");
    }

    async fn stop(self) -> (Result<(), Error>, PipelineState) {
        self.cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(10), self.run)
            .await
            .expect("pipeline stopped in time")
            .expect("pipeline task did not panic");
        let state = *self.state.borrow();
        (result, state)
    }
}

#[tokio::test]
async fn story_new_waiting_room_gets_exactly_one_ingress() {
    let cluster = FakeCluster::new();
    cluster.apply(room("shop-queue", "a.com", "/q"));
    let mut harness = start(Arc::clone(&cluster));

    harness.reach(PipelineState::Running).await;
    cluster.wait_for_ingresses(1).await;
    harness.idle().await;

    // The same notification again, once through the watch and once straight
    // into the queue, changes nothing downstream.
    cluster.apply(room("shop-queue", "a.com", "/q"));
    harness.queue.enqueue(Event::AddWaitingRoom(
        DesiredState::from_waiting_room(&room("shop-queue", "a.com", "/q")).unwrap(),
    ));
    harness.idle().await;

    assert_eq!(cluster.ingress_names(), vec![ingress_name("a.com", "/q")]);
    assert_eq!(cluster.create_calls(), 1);
    assert_eq!(cluster.auxiliary_config().matches("backend a_com_q\n").count(), 1);
    assert!(harness.backend.notified().iter().all(|key| key == "a_com_q"));

    let (result, state) = harness.stop().await;
    result.unwrap();
    assert_eq!(state, PipelineState::Stopped);
}

#[tokio::test]
async fn story_create_succeeds_on_third_attempt() {
    let cluster = FakeCluster::new();
    cluster.fail_next_creates(2);
    cluster.apply(room("shop-queue", "a.com", "/q"));
    let harness = start(Arc::clone(&cluster));

    cluster.wait_for_ingresses(1).await;
    harness.idle().await;

    // One item, requeued twice: the successful reconcile ran at attempt 2.
    assert_eq!(cluster.create_calls(), 3);
    assert_eq!(harness.queue.requeued(), 2);
    assert_eq!(harness.queue.dropped(), 0);
    assert_eq!(cluster.ingress_names(), vec![ingress_name("a.com", "/q")]);
    harness.stop().await.0.unwrap();
}

#[tokio::test]
async fn story_create_is_dropped_after_three_retries() {
    let cluster = FakeCluster::new();
    cluster.fail_next_creates(10);
    cluster.apply(room("shop-queue", "a.com", "/q"));
    let harness = start(Arc::clone(&cluster));

    cluster
        .wait_for_create_calls(MAX_RETRIES as usize + 1)
        .await;
    harness.idle().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(cluster.create_calls(), MAX_RETRIES as usize + 1);
    assert_eq!(harness.queue.requeued(), MAX_RETRIES as usize);
    assert_eq!(harness.queue.dropped(), 1);
    assert!(cluster.ingress_names().is_empty());
    harness.stop().await.0.unwrap();
}

#[tokio::test]
async fn story_workers_wait_for_the_initial_listing() {
    let cluster = FakeCluster::with_sync(false);
    cluster.apply(room("shop-queue", "a.com", "/q"));
    let mut harness = start(Arc::clone(&cluster));

    harness.reach(PipelineState::WaitingForSync).await;
    tokio::time::timeout(Duration::from_secs(10), async {
        while harness.queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("event translated before sync");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.create_calls(), 0);
    assert_eq!(*harness.state.borrow(), PipelineState::WaitingForSync);

    cluster.finish_sync();
    harness.reach(PipelineState::Running).await;
    cluster.wait_for_ingresses(1).await;
    harness.stop().await.0.unwrap();
}

#[tokio::test]
async fn story_cancel_before_sync_stops_cleanly() {
    let cluster = FakeCluster::with_sync(false);
    let mut harness = start(Arc::clone(&cluster));
    harness.reach(PipelineState::WaitingForSync).await;

    let (result, state) = harness.stop().await;
    result.unwrap();
    assert_eq!(state, PipelineState::Stopped);
    assert_eq!(cluster.create_calls(), 0);
}

#[tokio::test]
async fn story_invalid_rooms_are_skipped() {
    let cluster = FakeCluster::new();
    cluster.apply(room("broken", "a.com", "no-leading-slash"));
    cluster.apply(room("injected", "a.com", "/q\n  http-request allow\nbackend evil"));
    cluster.apply(room("spaced", "a.com", "/with space"));
    cluster.apply(room("shop-queue", "a.com", "/q"));
    let harness = start(Arc::clone(&cluster));

    cluster.wait_for_ingresses(1).await;
    harness.idle().await;
    assert_eq!(cluster.ingress_names(), vec![ingress_name("a.com", "/q")]);
    assert_eq!(cluster.create_calls(), 1);
    let aux = cluster.auxiliary_config();
    assert!(!aux.contains("evil"));
    assert!(!aux.contains("http-request"));
    assert_eq!(harness.backend.notified(), vec!["a_com_q".to_string()]);
    harness.stop().await.0.unwrap();
}

#[tokio::test]
async fn story_shutdown_lets_in_flight_work_finish() {
    let cluster = FakeCluster::new();
    cluster.block_creates();
    cluster.apply(room("shop-queue", "a.com", "/q"));
    let mut harness = start(Arc::clone(&cluster));
    cluster.wait_for_create_calls(1).await;

    harness.cancel.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!harness.run.is_finished());

    cluster.unblock_creates();
    harness.reach(PipelineState::Stopped).await;
    let (result, _) = harness.stop().await;
    result.unwrap();
    assert_eq!(cluster.ingress_names(), vec![ingress_name("a.com", "/q")]);
}

#[tokio::test]
async fn story_distinct_rooms_get_distinct_ingresses() {
    let cluster = FakeCluster::new();
    for (name, host, path) in [
        ("a", "a.com", "/q"),
        ("b", "b.com", "/q"),
        ("c", "a.com", "/checkout"),
    ] {
        cluster.apply(room(name, host, path));
    }
    let harness = start(Arc::clone(&cluster));

    cluster.wait_for_ingresses(3).await;
    harness.idle().await;

    let mut names = cluster.ingress_names();
    names.sort();
    let mut expected = vec![
        ingress_name("a.com", "/q"),
        ingress_name("b.com", "/q"),
        ingress_name("a.com", "/checkout"),
    ];
    expected.sort();
    assert_eq!(names, expected);
    let aux = cluster.auxiliary_config();
    for key in ["a_com_q", "b_com_q", "a_com_checkout"] {
        assert_eq!(aux.matches(&format!("backend {key}\n")).count(), 1);
    }
    harness.stop().await.0.unwrap();
}

#[tokio::test]
async fn story_rooms_differing_in_case_or_separator_stay_apart() {
    let cluster = FakeCluster::new();
    for (name, path) in [
        ("upper", "/Q"),
        ("lower", "/q"),
        ("dash", "/a-b"),
        ("nested", "/a/b"),
    ] {
        cluster.apply(room(name, "a.com", path));
    }
    let harness = start(Arc::clone(&cluster));

    cluster.wait_for_ingresses(4).await;
    harness.idle().await;

    let mut names = cluster.ingress_names();
    names.sort();
    let mut expected: Vec<_> = ["/Q", "/q", "/a-b", "/a/b"]
        .into_iter()
        .map(|path| ingress_name("a.com", path))
        .collect();
    expected.sort();
    assert_eq!(names, expected);
    assert_eq!(cluster.create_calls(), 4);

    let aux = cluster.auxiliary_config();
    for key in ["a_com_Q", "a_com_q", "a_com_a-b", "a_com_a_b"] {
        assert_eq!(aux.matches(&format!("backend {key}\n")).count(), 1);
    }
    harness.stop().await.0.unwrap();
}

/// A source whose caches never sync
struct BrokenSync;

#[async_trait]
impl WatchSource for BrokenSync {
    fn start(&mut self) -> Result<BoxStream<'static, Result<WaitingRoom, Error>>, Error> {
        Ok(stream::pending().boxed())
    }

    async fn wait_for_sync(&self) -> Result<(), Error> {
        Err(Error::sync("WaitingRoom", "writer dropped"))
    }
}

#[tokio::test]
async fn story_sync_failure_fails_the_run() {
    let harness = start_with(FakeCluster::new(), BrokenSync);
    let result = tokio::time::timeout(Duration::from_secs(10), harness.run)
        .await
        .expect("run finished")
        .unwrap();
    assert!(matches!(result, Err(Error::Sync { .. })));
    assert_eq!(*harness.state.borrow(), PipelineState::Stopped);
}

/// A source whose watch ends right after syncing
struct EndingWatch;

#[async_trait]
impl WatchSource for EndingWatch {
    fn start(&mut self) -> Result<BoxStream<'static, Result<WaitingRoom, Error>>, Error> {
        Ok(stream::empty().boxed())
    }

    async fn wait_for_sync(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[tokio::test]
async fn story_watch_ending_fails_the_run() {
    let harness = start_with(FakeCluster::new(), EndingWatch);
    let result = tokio::time::timeout(Duration::from_secs(10), harness.run)
        .await
        .expect("run finished")
        .unwrap();
    assert!(result.is_err());
}
