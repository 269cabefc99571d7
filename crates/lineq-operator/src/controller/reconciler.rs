//! Idempotent reconciliation of one WaitingRoom into its Ingress
//!
//! Running `reconcile` any number of times for the same desired state leaves
//! exactly one Ingress and one partition behind. Nothing here locks per key;
//! the cache check is only an optimisation and the API server's
//! already-exists answer is authoritative.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use lineq_common::metrics::{self, ReconcileResult, INGRESSES_CREATED};
use lineq_common::Error;
#[cfg(test)]
use mockall::automock;
use opentelemetry::KeyValue;
use tracing::{debug, info, instrument, warn};

use super::cache::CacheLookup;
use super::event::DesiredState;
use super::resource::{build_ingress, ResourceKey};
use crate::backend::LineqBackend;
use crate::haproxy::SharedConfig;

/// Result of a create call that did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The Ingress was created by this call
    Created,
    /// An Ingress with the same name already existed
    AlreadyExists,
}

/// Write access to Ingresses
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IngressApi: Send + Sync {
    /// Create `ingress` in its own namespace
    async fn create(&self, ingress: &Ingress) -> Result<CreateOutcome, Error>;
}

/// [`IngressApi`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeIngressApi {
    client: Client,
}

impl KubeIngressApi {
    /// Create a new Ingress API wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IngressApi for KubeIngressApi {
    async fn create(&self, ingress: &Ingress) -> Result<CreateOutcome, Error> {
        let namespace = ingress
            .namespace()
            .ok_or_else(|| Error::validation_for(ingress.name_any(), "ingress has no namespace"))?;
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);

        match api.create(&PostParams::default(), ingress).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(e) => {
                let err = Error::from(e);
                if err.is_already_exists() {
                    Ok(CreateOutcome::AlreadyExists)
                } else {
                    Err(err)
                }
            }
        }
    }
}

/// Turns a [`DesiredState`] into its downstream resources
pub struct Reconciler {
    ingresses: Arc<dyn IngressApi>,
    cache: Arc<dyn CacheLookup>,
    shared: Arc<SharedConfig>,
    backend: Arc<dyn LineqBackend>,
}

impl Reconciler {
    /// Create a reconciler over the given capabilities
    pub fn new(
        ingresses: Arc<dyn IngressApi>,
        cache: Arc<dyn CacheLookup>,
        shared: Arc<SharedConfig>,
        backend: Arc<dyn LineqBackend>,
    ) -> Self {
        Self {
            ingresses,
            cache,
            shared,
            backend,
        }
    }

    /// Make sure the Ingress and partition for `state` exist
    ///
    /// Errors are returned unchanged so the caller can decide between retry
    /// and discard.
    #[instrument(
        skip(self, state),
        fields(waiting_room = %state.name, namespace = %state.namespace)
    )]
    pub async fn reconcile(&self, state: &DesiredState) -> Result<(), Error> {
        let start = Instant::now();
        let result = self.reconcile_inner(state).await;
        let outcome = if result.is_ok() {
            ReconcileResult::Success
        } else {
            ReconcileResult::Error
        };
        metrics::record_reconcile(outcome, start.elapsed().as_secs_f64());
        result
    }

    async fn reconcile_inner(&self, state: &DesiredState) -> Result<(), Error> {
        let key = ResourceKey::derive(&state.host, &state.path);
        self.backend.notify(state, &key).await;

        let ingress = build_ingress(state, &key);
        let name = ingress.name_any();

        if self.cache.exists(&state.namespace, &name)? {
            debug!(key = %key, ingress = %name, "Ingress already present");
            return Ok(());
        }

        self.shared
            .append_partition(&key, state.session_duration)
            .await?;

        match self.ingresses.create(&ingress).await? {
            CreateOutcome::Created => {
                INGRESSES_CREATED.add(1, &[KeyValue::new("namespace", state.namespace.clone())]);
                info!(key = %key, ingress = %name, "Created ingress");
            }
            CreateOutcome::AlreadyExists => {
                warn!(key = %key, ingress = %name, "Ingress already exists");
            }
        }
        Ok(())
    }
}
