//! Operator lifecycle: one-time setup, pipeline runs, and leadership
//!
//! Standalone mode runs setup once and then a single pipeline until shutdown.
//! HA mode hands [`OperatorCallbacks`] to the leader elector so every
//! leadership term gets its own setup pass and a fresh pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use lineq_common::leader_election::{
    LeaderElector, LeadershipCallbacks, LeaseLock, LeaseTiming,
};
use lineq_common::retry::{retry_with_backoff_if, RetryConfig};
use lineq_common::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::LineqBackend;
use crate::config::LineqConfig;
use crate::controller::{
    CacheLookup, IngressApi, KubeWatchSource, Pipeline, Reconciler, WatchSource,
};
use crate::haproxy::{SharedConfig, SnippetParams};

/// Attempts made at the shared configuration setup per term
const SETUP_ATTEMPTS: u32 = 3;

/// Creates the watch source and matching cache for one pipeline run
pub trait WatchFactory: Send + Sync {
    /// Source type handed to the pipeline
    type Source: WatchSource + 'static;

    /// A fresh, unstarted source and the cache its watch fills
    fn create(&self) -> (Self::Source, Arc<dyn CacheLookup>);
}

/// [`WatchFactory`] producing kube-rs reflector sources
#[derive(Clone)]
pub struct KubeWatchFactory {
    client: Client,
}

impl KubeWatchFactory {
    /// Factory over `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl WatchFactory for KubeWatchFactory {
    type Source = KubeWatchSource;

    fn create(&self) -> (KubeWatchSource, Arc<dyn CacheLookup>) {
        let source = KubeWatchSource::new(self.client.clone());
        let cache = Arc::new(source.cache());
        (source, cache)
    }
}

/// Everything needed to set up the shared config and run pipelines
pub struct Operator<F> {
    watches: F,
    ingresses: Arc<dyn IngressApi>,
    shared: Arc<SharedConfig>,
    backend: Arc<dyn LineqBackend>,
    lineq: LineqConfig,
    workers: usize,
    setup_retry: RetryConfig,
}

impl<F: WatchFactory> Operator<F> {
    /// Assemble an operator from its capabilities
    pub fn new(
        watches: F,
        ingresses: Arc<dyn IngressApi>,
        shared: Arc<SharedConfig>,
        backend: Arc<dyn LineqBackend>,
        lineq: LineqConfig,
        workers: usize,
    ) -> Self {
        Self {
            watches,
            ingresses,
            shared,
            backend,
            lineq,
            workers,
            setup_retry: RetryConfig::with_max_attempts(SETUP_ATTEMPTS),
        }
    }

    /// Override the backoff used for the setup pass
    pub fn with_setup_retry(mut self, retry: RetryConfig) -> Self {
        self.setup_retry = retry;
        self
    }

    /// Table configuration from the backend, or the configured defaults
    pub async fn snippet_params(&self) -> SnippetParams {
        match self.backend.fetch_config().await {
            Ok(config) => self.lineq.snippet_params(
                &config.room_table,
                &config.user_table,
                config.session_duration,
            ),
            Err(e) => {
                warn!(error = %e, "Using default table configuration");
                self.lineq.default_snippet_params()
            }
        }
    }

    /// Write the shared HAProxy configuration if it is not there yet
    ///
    /// Failures are logged; reconciliation does not depend on the frontend
    /// snippet being present.
    pub async fn setup(&self) {
        let params = self.snippet_params().await;
        let result = retry_with_backoff_if(
            &self.setup_retry,
            "shared config setup",
            Error::is_retryable,
            || self.shared.initialize(&params),
        )
        .await;

        match result {
            Ok(0) => info!("Shared config already initialized"),
            Ok(written) => info!(config_maps = written, "Shared config initialized"),
            Err(e) => warn!(error = %e, "Shared config setup failed"),
        }
    }

    /// Run a fresh pipeline until `cancel` fires
    pub async fn run_pipeline(&self, cancel: CancellationToken) -> Result<(), Error> {
        let (source, cache) = self.watches.create();
        let reconciler = Reconciler::new(
            Arc::clone(&self.ingresses),
            cache,
            Arc::clone(&self.shared),
            Arc::clone(&self.backend),
        );
        Pipeline::new(Arc::new(reconciler), self.workers)
            .run(source, cancel)
            .await
    }

    /// Setup followed by a single pipeline run for the process lifetime
    pub async fn run_standalone(&self, shutdown: CancellationToken) -> Result<(), Error> {
        info!("Running without leader election");
        self.setup().await;
        self.run_pipeline(shutdown).await
    }
}

/// Leadership callbacks driving the operator
pub struct OperatorCallbacks<F> {
    operator: Arc<Operator<F>>,
    identity: String,
}

impl<F> OperatorCallbacks<F> {
    /// Callbacks for the replica competing as `identity`
    pub fn new(operator: Arc<Operator<F>>, identity: impl Into<String>) -> Self {
        Self {
            operator,
            identity: identity.into(),
        }
    }
}

#[async_trait]
impl<F: WatchFactory + 'static> LeadershipCallbacks for OperatorCallbacks<F> {
    async fn on_acquired(&self, term: CancellationToken) -> lineq_common::Result<()> {
        info!(identity = %self.identity, "Starting leader work");
        self.operator.setup().await;
        self.operator.run_pipeline(term).await
    }

    fn on_lost(&self) {
        info!(identity = %self.identity, "Leader work stopped");
    }

    fn on_observed_leader(&self, identity: &str) {
        if identity == self.identity {
            info!(identity = %identity, "obtained leadership");
        } else {
            info!(identity = %identity, "leader elected");
        }
    }
}

/// Compete for leadership and run the operator while leading
pub async fn run_ha<F, L>(
    operator: Arc<Operator<F>>,
    lock: L,
    timing: LeaseTiming,
    shutdown: CancellationToken,
) -> Result<(), Error>
where
    F: WatchFactory + 'static,
    L: LeaseLock,
{
    let identity = lock.identity();
    let elector = LeaderElector::new(lock, timing)
        .map_err(|e| Error::internal_with_context("leader-election", e.to_string()))?;
    info!(identity = %identity, "Running with leader election");

    let callbacks = Arc::new(OperatorCallbacks::new(operator, identity));
    elector
        .run(callbacks, shutdown)
        .await
        .map_err(|e| Error::internal_with_context("leader-election", e.to_string()))
}
