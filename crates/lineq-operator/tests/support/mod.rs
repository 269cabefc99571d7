//! In-memory stand-ins for the cluster and the lineq backend
//!
//! `FakeCluster` plays the API server: it holds WaitingRooms, Ingresses and
//! the HAProxy ConfigMaps, answers create calls, and hands out watch sources
//! that replay the current WaitingRooms whenever they change.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use lineq_common::crd::{WaitingRoom, WaitingRoomSpec};
use lineq_common::retry::RetryConfig;
use lineq_common::Error;
use lineq_operator::backend::{BackendConfig, LineqBackend};
use lineq_operator::config::LineqConfig;
use lineq_operator::controller::{
    CacheLookup, CreateOutcome, DesiredState, IngressApi, ResourceKey, WatchSource,
};
use lineq_operator::haproxy::{ConfigStore, SharedConfig, SharedConfigLayout};
use lineq_operator::runner::{Operator, WatchFactory};
use parking_lot::Mutex;
use tokio::sync::watch;

/// A WaitingRoom as a user would apply it
pub fn room(name: &str, host: &str, path: &str) -> WaitingRoom {
    let mut room = WaitingRoom::new(
        name,
        WaitingRoomSpec {
            path: path.to_string(),
            active_users: 5,
            scheme: "http".to_string(),
            host: host.to_string(),
            backend_svc_addr: "web".to_string(),
            backend_svc_port: 8080,
            session_duration: 10,
        },
    );
    room.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some("shop".to_string()),
        uid: Some(format!("uid-{name}")),
        ..Default::default()
    };
    room
}

/// Name of the Ingress created for a host/path pair
pub fn ingress_name(host: &str, path: &str) -> String {
    ResourceKey::derive(host, path).object_name()
}

/// Queue backoff short enough for tests
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 0,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        backoff_multiplier: 2.0,
    }
}

fn unavailable() -> Error {
    Error::from(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: "etcd leader changed".to_string(),
        reason: "ServiceUnavailable".to_string(),
        code: 503,
    }))
}

/// The API server, the watch caches and the HAProxy ConfigMaps in one place
pub struct FakeCluster {
    rooms: watch::Sender<Vec<WaitingRoom>>,
    synced: watch::Sender<bool>,
    ingresses: Mutex<BTreeMap<String, Ingress>>,
    config_maps: Mutex<BTreeMap<String, ConfigMap>>,
    create_calls: AtomicUsize,
    failing_creates: AtomicU32,
    create_gate: watch::Sender<bool>,
    sources_created: AtomicUsize,
}

impl FakeCluster {
    /// Cluster whose watch caches sync as soon as they start
    pub fn new() -> Arc<Self> {
        Self::with_sync(true)
    }

    /// Cluster whose caches only sync after [`FakeCluster::finish_sync`]
    pub fn with_sync(synced: bool) -> Arc<Self> {
        let layout = SharedConfigLayout::default();
        let config_maps = [layout.frontend.name, layout.auxiliary.name]
            .into_iter()
            .map(|name| {
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                (name, cm)
            })
            .collect();
        Arc::new(Self {
            rooms: watch::channel(Vec::new()).0,
            synced: watch::channel(synced).0,
            ingresses: Mutex::new(BTreeMap::new()),
            config_maps: Mutex::new(config_maps),
            create_calls: AtomicUsize::new(0),
            failing_creates: AtomicU32::new(0),
            create_gate: watch::channel(true).0,
            sources_created: AtomicUsize::new(0),
        })
    }

    /// Apply a WaitingRoom; every running watch sees it
    pub fn apply(&self, room: WaitingRoom) {
        self.rooms.send_modify(|rooms| {
            rooms.retain(|r| r.uid() != room.uid());
            rooms.push(room);
        });
    }

    /// Let waiting sources report their initial listing as complete
    pub fn finish_sync(&self) {
        self.synced.send_replace(true);
    }

    /// Fail the next `n` create calls with a 503
    pub fn fail_next_creates(&self, n: u32) {
        self.failing_creates.store(n, Ordering::SeqCst);
    }

    /// Hold create calls until [`FakeCluster::unblock_creates`]
    pub fn block_creates(&self) {
        self.create_gate.send_replace(false);
    }

    /// Release held create calls
    pub fn unblock_creates(&self) {
        self.create_gate.send_replace(true);
    }

    /// Number of create calls, including failed ones
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Names of the Ingresses that exist
    pub fn ingress_names(&self) -> Vec<String> {
        self.ingresses.lock().values().map(|i| i.name_any()).collect()
    }

    /// Number of watch sources handed out
    pub fn sources_created(&self) -> usize {
        self.sources_created.load(Ordering::SeqCst)
    }

    /// Current contents of the auxiliary HAProxy config
    pub fn auxiliary_config(&self) -> String {
        let layout = SharedConfigLayout::default();
        self.config_maps
            .lock()
            .get(&layout.auxiliary.name)
            .and_then(|cm| cm.data.as_ref())
            .and_then(|data| data.get(&layout.auxiliary.data_key).cloned())
            .unwrap_or_default()
    }

    /// Wait until `count` Ingresses exist
    pub async fn wait_for_ingresses(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.ingresses.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("ingresses were created in time");
    }

    /// Wait until `count` create calls were made
    pub async fn wait_for_create_calls(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.create_calls() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("create calls were made in time");
    }

    /// Shared config writer over this cluster's ConfigMaps
    pub fn shared_config(self: &Arc<Self>) -> Arc<SharedConfig> {
        let store: Arc<dyn ConfigStore> = Arc::clone(self) as Arc<dyn ConfigStore>;
        Arc::new(SharedConfig::new(store, SharedConfigLayout::default()).expect("templates load"))
    }

    /// Operator running against this cluster with `workers` workers
    pub fn operator(
        self: &Arc<Self>,
        backend: Arc<FakeBackend>,
        workers: usize,
    ) -> Operator<FakeWatches> {
        Operator::new(
            FakeWatches(Arc::clone(self)),
            Arc::clone(self) as Arc<dyn IngressApi>,
            self.shared_config(),
            backend,
            lineq_config(),
            workers,
        )
        .with_setup_retry(fast_retry())
    }
}

fn lineq_config() -> LineqConfig {
    LineqConfig {
        tcp_addr: "lineq-tcp.lineq.svc".to_string(),
        tcp_port: 11111,
        http_addr: "lineq-http.lineq.svc".to_string(),
        http_port: 8060,
        room_table: "lineq_room".to_string(),
        user_table: "lineq_user".to_string(),
        session_duration: 10,
    }
}

#[async_trait]
impl IngressApi for FakeCluster {
    async fn create(&self, ingress: &Ingress) -> Result<CreateOutcome, Error> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.create_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let failing = self
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(unavailable());
        }

        let key = format!(
            "{}/{}",
            ingress.namespace().unwrap_or_default(),
            ingress.name_any()
        );
        let mut ingresses = self.ingresses.lock();
        if ingresses.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        ingresses.insert(key, ingress.clone());
        Ok(CreateOutcome::Created)
    }
}

impl CacheLookup for FakeCluster {
    fn exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        Ok(self
            .ingresses
            .lock()
            .contains_key(&format!("{namespace}/{name}")))
    }
}

#[async_trait]
impl ConfigStore for FakeCluster {
    async fn get(&self, name: &str) -> Result<Option<ConfigMap>, Error> {
        Ok(self.config_maps.lock().get(name).cloned())
    }

    async fn replace(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let name = config_map.name_any();
        self.config_maps.lock().insert(name, config_map.clone());
        Ok(())
    }
}

/// Watch source replaying the cluster's WaitingRooms on every change
pub struct FakeSource {
    cluster: Arc<FakeCluster>,
}

#[async_trait]
impl WatchSource for FakeSource {
    fn start(&mut self) -> Result<BoxStream<'static, Result<WaitingRoom, Error>>, Error> {
        let rx = self.cluster.rooms.subscribe();
        let listings = stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let rooms = rx.borrow_and_update().clone();
            Some((stream::iter(rooms.into_iter().map(Ok)), (rx, false)))
        });
        Ok(listings.flatten().boxed())
    }

    async fn wait_for_sync(&self) -> Result<(), Error> {
        let mut synced = self.cluster.synced.subscribe();
        synced
            .wait_for(|synced| *synced)
            .await
            .map(|_| ())
            .map_err(|e| Error::sync("WaitingRoom", e.to_string()))
    }
}

/// Hands out [`FakeSource`]s backed by one cluster
pub struct FakeWatches(pub Arc<FakeCluster>);

impl WatchFactory for FakeWatches {
    type Source = FakeSource;

    fn create(&self) -> (FakeSource, Arc<dyn CacheLookup>) {
        self.0.sources_created.fetch_add(1, Ordering::SeqCst);
        let cache = Arc::clone(&self.0) as Arc<dyn CacheLookup>;
        (
            FakeSource {
                cluster: Arc::clone(&self.0),
            },
            cache,
        )
    }
}

/// Backend that records notifications and serves a fixed config
#[derive(Default)]
pub struct FakeBackend {
    notified: Mutex<Vec<String>>,
}

impl FakeBackend {
    /// Keys the backend was told about, in order
    pub fn notified(&self) -> Vec<String> {
        self.notified.lock().clone()
    }
}

#[async_trait]
impl LineqBackend for FakeBackend {
    async fn notify(&self, _state: &DesiredState, key: &ResourceKey) {
        self.notified.lock().push(key.to_string());
    }

    async fn fetch_config(&self) -> Result<BackendConfig, Error> {
        Ok(BackendConfig {
            room_table: "lineq_room".to_string(),
            user_table: "lineq_user".to_string(),
            session_duration: 10,
        })
    }
}
