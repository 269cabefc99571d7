//! Leader election using Kubernetes Leases
//!
//! Only one operator replica may run the reconcile pipeline at a time. The
//! [`LeaderElector`] is an explicit state machine over a [`LeaseLock`]:
//!
//! ```text
//! Standby -> Acquiring -> Leading -> Standby (on loss) -> Acquiring ...
//! ```
//!
//! While leading, the elector renews the lease every `retry_period`. A
//! renewal that has not succeeded within `renew_deadline`, or an observation
//! that someone else holds the lease, ends the term: the term's cancellation
//! token fires, the leading work is awaited to completion, and only then does
//! the replica go back to acquiring. Because `lease_duration > renew_deadline`
//! a new leader cannot take over before the old term has been told to stop.
//!
//! # Atomicity
//!
//! [`KubeLeaseLock`] uses resourceVersion for compare-and-swap semantics. If
//! the lease changes between read and write, the update fails with 409
//! Conflict. A conflicting takeover reports "not acquired"; a conflicting
//! renewal by the holder is an error, so the elector retries it until
//! `renew_deadline` instead of ending the term.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::kube_utils::{is_conflict, is_not_found};
use crate::metrics;

/// Default lease name for the waiting-room operator
pub const DEFAULT_LEASE_NAME: &str = "waitingroomoperator";

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Lease timing parameters are inconsistent
    #[error("invalid lease timing: {0}")]
    InvalidTiming(String),

    /// The holder's renewal raced another write to the lease
    #[error("lease {0} changed during renewal")]
    RenewConflict(String),

    /// Lease object returned by the API server has no resourceVersion
    #[error("lease {0} is missing its resourceVersion")]
    MissingResourceVersion(String),
}

/// Lease timing parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseTiming {
    /// How long a lease is valid without renewal
    pub lease_duration: Duration,
    /// How long the leader keeps retrying a failing renewal before giving up
    pub renew_deadline: Duration,
    /// Interval between acquisition and renewal attempts
    pub retry_period: Duration,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

impl LeaseTiming {
    /// Check `lease_duration > renew_deadline > retry_period > 0`
    pub fn validate(&self) -> Result<(), LeaderElectionError> {
        if self.retry_period.is_zero() {
            return Err(LeaderElectionError::InvalidTiming(
                "retry period must be greater than zero".to_string(),
            ));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(LeaderElectionError::InvalidTiming(format!(
                "renew deadline ({:?}) must be greater than retry period ({:?})",
                self.renew_deadline, self.retry_period
            )));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(LeaderElectionError::InvalidTiming(format!(
                "lease duration ({:?}) must be greater than renew deadline ({:?})",
                self.lease_duration, self.renew_deadline
            )));
        }
        Ok(())
    }
}

/// Result of one acquire-or-renew attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseObservation {
    /// Identity holding the lease after the attempt (None if unheld)
    pub holder: Option<String>,
    /// Whether this replica holds the lease after the attempt
    pub acquired: bool,
}

impl LeaseObservation {
    /// This replica holds the lease
    pub fn acquired(identity: impl Into<String>) -> Self {
        Self {
            holder: Some(identity.into()),
            acquired: true,
        }
    }

    /// Someone else (or nobody) holds the lease
    pub fn held_by(holder: Option<String>) -> Self {
        Self {
            holder,
            acquired: false,
        }
    }
}

/// Distributed lease primitive the elector is driven by
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Identity this replica competes under
    fn identity(&self) -> String;

    /// Acquire the lease if free or expired, renew it if already held
    async fn try_acquire_or_renew(&self) -> Result<LeaseObservation, LeaderElectionError>;

    /// Give the lease up so another replica can acquire it immediately
    async fn release(&self) -> Result<(), LeaderElectionError>;
}

/// Leader election state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaderState {
    /// Not competing (startup, or between terms)
    Standby,
    /// Trying to acquire the lease
    Acquiring,
    /// Holding the lease and running the leading work
    Leading,
}

/// Hooks invoked by the elector on leadership changes
#[async_trait]
pub trait LeadershipCallbacks: Send + Sync {
    /// Run the leader's work until `term` is cancelled
    ///
    /// Returning early (Ok or Err) makes the replica step down.
    async fn on_acquired(&self, term: CancellationToken) -> crate::Result<()>;

    /// Called after the leading work has returned
    fn on_lost(&self);

    /// Called whenever a different lease holder is observed
    fn on_observed_leader(&self, identity: &str);
}

/// How a leadership term ended
enum TermEnd {
    Shutdown,
    Lost,
    WorkFinished(Result<crate::Result<()>, tokio::task::JoinError>),
}

/// Leader elector state machine
pub struct LeaderElector<L> {
    lock: L,
    timing: LeaseTiming,
    state: watch::Sender<LeaderState>,
}

impl<L: LeaseLock> LeaderElector<L> {
    /// Create an elector, rejecting inconsistent timing
    pub fn new(lock: L, timing: LeaseTiming) -> Result<Self, LeaderElectionError> {
        timing.validate()?;
        let (state, _) = watch::channel(LeaderState::Standby);
        Ok(Self {
            lock,
            timing,
            state,
        })
    }

    /// Current state
    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    /// Compete for leadership until `shutdown` is cancelled
    ///
    /// On shutdown while leading, the leading work is drained and the lease
    /// released before this returns.
    pub async fn run<C>(
        &self,
        callbacks: Arc<C>,
        shutdown: CancellationToken,
    ) -> Result<(), LeaderElectionError>
    where
        C: LeadershipCallbacks + 'static,
    {
        let identity = self.lock.identity();
        let mut observed: Option<String> = None;

        loop {
            self.transition(LeaderState::Acquiring);
            let acquired = tokio::select! {
                _ = shutdown.cancelled() => false,
                () = self.acquire(&mut observed, callbacks.as_ref()) => true,
            };
            if !acquired {
                self.transition(LeaderState::Standby);
                return Ok(());
            }

            self.transition(LeaderState::Leading);
            let term = shutdown.child_token();
            let mut work: JoinHandle<crate::Result<()>> = {
                let callbacks = Arc::clone(&callbacks);
                let term = term.clone();
                tokio::spawn(async move { callbacks.on_acquired(term).await })
            };

            let end = self
                .hold(&term, &mut work, &mut observed, callbacks.as_ref())
                .await;
            term.cancel();

            let (outcome, lost) = match end {
                TermEnd::WorkFinished(outcome) => (outcome, false),
                TermEnd::Shutdown => (work.await, false),
                TermEnd::Lost => (work.await, true),
            };

            self.transition(LeaderState::Standby);
            callbacks.on_lost();

            match outcome {
                Ok(Ok(())) if shutdown.is_cancelled() || lost => {}
                Ok(Ok(())) => warn!(identity = %identity, "Leader work returned, stepping down"),
                Ok(Err(e)) => {
                    error!(identity = %identity, error = %e, "Leader work failed, stepping down")
                }
                Err(e) => {
                    error!(identity = %identity, error = %e, "Leader work panicked, stepping down")
                }
            }

            if lost {
                continue;
            }

            if let Err(e) = self.lock.release().await {
                warn!(identity = %identity, error = %e, "Failed to release lease");
            }

            if shutdown.is_cancelled() {
                return Ok(());
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.timing.retry_period) => {}
            }
        }
    }

    fn transition(&self, next: LeaderState) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }
        debug!(
            identity = %self.lock.identity(),
            from = ?previous,
            to = ?next,
            "Leader state transition"
        );
        if next == LeaderState::Leading {
            metrics::record_leadership(true);
        } else if previous == LeaderState::Leading {
            metrics::record_leadership(false);
        }
    }

    /// Loop until the lease is held
    async fn acquire<C>(&self, observed: &mut Option<String>, callbacks: &C)
    where
        C: LeadershipCallbacks + ?Sized,
    {
        let identity = self.lock.identity();
        info!(identity = %identity, "Waiting for leadership...");

        loop {
            match self.lock.try_acquire_or_renew().await {
                Ok(observation) => {
                    let acquired = observation.acquired;
                    observe(observation.holder, observed, callbacks);
                    if acquired {
                        info!(identity = %identity, "Leadership acquired");
                        return;
                    }
                    debug!(
                        identity = %identity,
                        retry_ms = self.timing.retry_period.as_millis() as u64,
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %identity,
                        error = %e,
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(self.timing.retry_period).await;
        }
    }

    /// Renew until the term ends one way or another
    async fn hold<C>(
        &self,
        term: &CancellationToken,
        work: &mut JoinHandle<crate::Result<()>>,
        observed: &mut Option<String>,
        callbacks: &C,
    ) -> TermEnd
    where
        C: LeadershipCallbacks + ?Sized,
    {
        loop {
            tokio::select! {
                _ = term.cancelled() => return TermEnd::Shutdown,
                outcome = &mut *work => return TermEnd::WorkFinished(outcome),
                _ = tokio::time::sleep(self.timing.retry_period) => {
                    if !self.renew(observed, callbacks).await {
                        warn!(identity = %self.lock.identity(), "Leadership lost");
                        return TermEnd::Lost;
                    }
                }
            }
        }
    }

    /// Renew the lease, retrying transient failures until `renew_deadline`
    async fn renew<C>(&self, observed: &mut Option<String>, callbacks: &C) -> bool
    where
        C: LeadershipCallbacks + ?Sized,
    {
        let identity = self.lock.identity();
        let attempts = async {
            loop {
                match self.lock.try_acquire_or_renew().await {
                    Ok(observation) if observation.acquired => return true,
                    Ok(observation)
                        if observation.holder.as_deref() == Some(identity.as_str()) =>
                    {
                        debug!(identity = %identity, "Lease still ours, renewing again");
                        tokio::time::sleep(self.timing.retry_period).await;
                    }
                    Ok(observation) => {
                        observe(observation.holder, observed, callbacks);
                        return false;
                    }
                    Err(e) => {
                        warn!(identity = %identity, error = %e, "Lease renewal failed, retrying");
                        tokio::time::sleep(self.timing.retry_period).await;
                    }
                }
            }
        };

        match tokio::time::timeout(self.timing.renew_deadline, attempts).await {
            Ok(renewed) => renewed,
            Err(_) => {
                warn!(identity = %self.lock.identity(), "Lease renew deadline exceeded");
                false
            }
        }
    }
}

/// Fire `on_observed_leader` when the holder changes
fn observe<C>(holder: Option<String>, observed: &mut Option<String>, callbacks: &C)
where
    C: LeadershipCallbacks + ?Sized,
{
    if holder == *observed {
        return;
    }
    if let Some(identity) = holder.as_deref() {
        callbacks.on_observed_leader(identity);
    }
    *observed = holder;
}

// =============================================================================
// Kubernetes Lease implementation
// =============================================================================

/// [`LeaseLock`] backed by a coordination.k8s.io/v1 Lease
pub struct KubeLeaseLock {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
}

impl KubeLeaseLock {
    /// Create a lock on `namespace/lease_name` competing as `identity`
    pub fn new(
        client: Client,
        lease_name: &str,
        namespace: &str,
        identity: &str,
        lease_duration: Duration,
    ) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration,
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn spec_for_self(&self, now: chrono::DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    /// Create a new lease (first leader)
    async fn create_lease(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
    ) -> Result<LeaseObservation, LeaderElectionError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.spec_for_self(now, 0)),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, lease = %self.lease_name, "Created new lease");
                Ok(LeaseObservation::acquired(&self.identity))
            }
            Err(e) if is_conflict(&e) => {
                debug!(identity = %self.identity, "Lease creation conflict, will retry");
                Ok(LeaseObservation::held_by(None))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write `updated` with the resourceVersion it was read at
    async fn replace_lease(
        &self,
        api: &Api<Lease>,
        updated: &Lease,
    ) -> Result<bool, LeaderElectionError> {
        if updated.metadata.resource_version.is_none() {
            return Err(LeaderElectionError::MissingResourceVersion(
                self.lease_name.clone(),
            ));
        }
        match api
            .replace(&self.lease_name, &PostParams::default(), updated)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether a lease not held by us may be taken over at `now`
fn lease_is_free(spec: Option<&LeaseSpec>, now: chrono::DateTime<Utc>) -> bool {
    let holder = spec
        .and_then(|s| s.holder_identity.as_deref())
        .filter(|h| !h.is_empty());
    if holder.is_none() {
        return true;
    }
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(i64::from(duration)),
        _ => true,
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    async fn try_acquire_or_renew(&self) -> Result<LeaseObservation, LeaderElectionError> {
        let api = self.api();
        let now = Utc::now();

        let lease = match api.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(e) if is_not_found(&e) => return self.create_lease(&api, now).await,
            Err(e) => return Err(e.into()),
        };

        let spec = lease.spec.as_ref();
        let holder = spec
            .and_then(|s| s.holder_identity.clone())
            .filter(|h| !h.is_empty());

        if holder.as_deref() == Some(self.identity.as_str()) {
            let mut updated = lease.clone();
            if let Some(ref mut spec) = updated.spec {
                spec.renew_time = Some(MicroTime(now));
                spec.lease_duration_seconds = Some(self.lease_duration.as_secs() as i32);
            }
            return if self.replace_lease(&api, &updated).await? {
                debug!(identity = %self.identity, "Lease renewed");
                Ok(LeaseObservation::acquired(&self.identity))
            } else {
                warn!(identity = %self.identity, "Lease renewal conflict");
                Err(LeaderElectionError::RenewConflict(self.lease_name.clone()))
            };
        }

        if !lease_is_free(spec, now) {
            return Ok(LeaseObservation::held_by(holder));
        }

        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0) + 1;
        let updated = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: lease.metadata.resource_version.clone(),
                ..Default::default()
            },
            spec: Some(self.spec_for_self(now, transitions)),
        };

        if self.replace_lease(&api, &updated).await? {
            info!(
                identity = %self.identity,
                previous = ?holder,
                transitions,
                "Took over lease"
            );
            Ok(LeaseObservation::acquired(&self.identity))
        } else {
            debug!(identity = %self.identity, "Lease takeover conflict, will retry");
            Ok(LeaseObservation::held_by(holder))
        }
    }

    async fn release(&self) -> Result<(), LeaderElectionError> {
        let api = self.api();

        let lease = match api.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(e) if is_not_found(&e) => {
                debug!(identity = %self.identity, "Lease not found, nothing to release");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        // Clear the holder and shrink the duration so standbys take over at once
        let mut updated = lease.clone();
        if let Some(ref mut spec) = updated.spec {
            spec.holder_identity = None;
            spec.lease_duration_seconds = Some(1);
            spec.renew_time = Some(MicroTime(Utc::now()));
        }

        if self.replace_lease(&api, &updated).await? {
            info!(identity = %self.identity, "Lease released for fast failover");
        } else {
            debug!(identity = %self.identity, "Lease changed before release");
        }
        Ok(())
    }
}

// =============================================================================
// In-memory implementation (tests and the `test-support` feature)
// =============================================================================

#[cfg(any(test, feature = "test-support"))]
pub use in_memory::{InMemoryLease, InMemoryLeaseLock};

#[cfg(any(test, feature = "test-support"))]
mod in_memory {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::{LeaderElectionError, LeaseLock, LeaseObservation};

    /// A lease shared between [`InMemoryLeaseLock`]s of one process
    ///
    /// Used to run several electors against each other without a cluster. The
    /// lease never expires on its own; it changes hands on release or when
    /// [`InMemoryLease::force_holder`] simulates another replica taking over.
    #[derive(Clone, Default)]
    pub struct InMemoryLease {
        holder: Arc<Mutex<Option<String>>>,
    }

    impl InMemoryLease {
        /// Create an unheld lease
        pub fn new() -> Self {
            Self::default()
        }

        /// Current holder
        pub async fn holder(&self) -> Option<String> {
            self.holder.lock().await.clone()
        }

        /// Overwrite the holder, as if another replica took the lease
        pub async fn force_holder(&self, holder: Option<&str>) {
            *self.holder.lock().await = holder.map(str::to_string);
        }

        /// A lock competing on this lease under `identity`
        pub fn lock_for(&self, identity: &str) -> InMemoryLeaseLock {
            InMemoryLeaseLock {
                lease: self.clone(),
                identity: identity.to_string(),
            }
        }
    }

    /// [`LeaseLock`] over an [`InMemoryLease`]
    pub struct InMemoryLeaseLock {
        lease: InMemoryLease,
        identity: String,
    }

    #[async_trait]
    impl LeaseLock for InMemoryLeaseLock {
        fn identity(&self) -> String {
            self.identity.clone()
        }

        async fn try_acquire_or_renew(&self) -> Result<LeaseObservation, LeaderElectionError> {
            let mut holder = self.lease.holder.lock().await;
            match holder.as_deref() {
                None => {
                    *holder = Some(self.identity.clone());
                    Ok(LeaseObservation::acquired(&self.identity))
                }
                Some(current) if current == self.identity => {
                    Ok(LeaseObservation::acquired(&self.identity))
                }
                Some(_) => Ok(LeaseObservation::held_by(holder.clone())),
            }
        }

        async fn release(&self) -> Result<(), LeaderElectionError> {
            let mut holder = self.lease.holder.lock().await;
            if holder.as_deref() == Some(self.identity.as_str()) {
                *holder = None;
            }
            Ok(())
        }
    }
}
