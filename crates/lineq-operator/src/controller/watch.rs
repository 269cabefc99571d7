//! Watch sources feeding the pipeline

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::runtime::reflector::{self, store::Writer, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use lineq_common::crd::WaitingRoom;
use lineq_common::kube_utils::WATCH_TIMEOUT_SECS;
use lineq_common::{Error, MANAGED_BY_LABEL_KEY, OPERATOR_NAME};
use tracing::debug;

use super::cache::StoreCache;

/// Notifications about WaitingRooms plus the sync barrier of every watch
#[async_trait]
pub trait WatchSource: Send + Sync {
    /// Start watching
    ///
    /// The returned stream yields every WaitingRoom the watch applies,
    /// including repeats after re-lists, and must be polled for the caches
    /// to fill. It can only be started once.
    fn start(&mut self) -> Result<BoxStream<'static, Result<WaitingRoom, Error>>, Error>;

    /// Resolve once every watched kind has delivered its initial listing
    async fn wait_for_sync(&self) -> Result<(), Error>;
}

struct Writers {
    rooms: Writer<WaitingRoom>,
    ingresses: Writer<Ingress>,
}

/// [`WatchSource`] built on kube-rs reflectors
///
/// Watches WaitingRooms and the Ingresses this operator manages in all
/// namespaces. The Ingress store backs the reconciler's cache lookup.
pub struct KubeWatchSource {
    client: Client,
    rooms: Store<WaitingRoom>,
    ingresses: Store<Ingress>,
    writers: Option<Writers>,
}

impl KubeWatchSource {
    /// Create an unstarted source
    pub fn new(client: Client) -> Self {
        let (rooms, rooms_writer) = reflector::store::<WaitingRoom>();
        let (ingresses, ingresses_writer) = reflector::store::<Ingress>();
        Self {
            client,
            rooms,
            ingresses,
            writers: Some(Writers {
                rooms: rooms_writer,
                ingresses: ingresses_writer,
            }),
        }
    }

    /// Cache lookup over the Ingress store
    pub fn cache(&self) -> StoreCache {
        StoreCache::new(self.ingresses.clone())
    }
}

#[async_trait]
impl WatchSource for KubeWatchSource {
    fn start(&mut self) -> Result<BoxStream<'static, Result<WaitingRoom, Error>>, Error> {
        let writers = self
            .writers
            .take()
            .ok_or_else(|| Error::internal_with_context("watch", "watch already started"))?;

        let rooms = watcher(
            Api::<WaitingRoom>::all(self.client.clone()),
            watcher::Config::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .default_backoff()
        .reflect(writers.rooms)
        .applied_objects()
        .map(|result| result.map_err(|e| Error::sync("WaitingRoom", e.to_string())));

        let managed = format!("{MANAGED_BY_LABEL_KEY}={OPERATOR_NAME}");
        let ingresses = watcher(
            Api::<Ingress>::all(self.client.clone()),
            watcher::Config::default()
                .labels(&managed)
                .timeout(WATCH_TIMEOUT_SECS),
        )
        .default_backoff()
        .reflect(writers.ingresses)
        .applied_objects()
        .filter_map(|result| async move {
            match result {
                Ok(_) => None,
                Err(e) => Some(Err(Error::sync("Ingress", e.to_string()))),
            }
        });

        debug!("Started WaitingRoom and Ingress watches");
        Ok(futures::stream::select(rooms, ingresses).boxed())
    }

    async fn wait_for_sync(&self) -> Result<(), Error> {
        self.rooms
            .wait_until_ready()
            .await
            .map_err(|e| Error::sync("WaitingRoom", e.to_string()))?;
        self.ingresses
            .wait_until_ready()
            .await
            .map_err(|e| Error::sync("Ingress", e.to_string()))?;
        debug!("Watch caches synced");
        Ok(())
    }
}
